//! OfflineMessageStore: локальный журнал сообщений
//!
//! Источник правды для UI. Каждое изменение сразу пишется в backend
//! (`msg/{conversation}/{seq}`) и рассылается подписчикам.
//! Порядок внутри беседы: `timestamp`, затем порядок вставки.

use crate::storage::backend::StorageBackend;
use crate::storage::models::{Message, MessagePatch};
use crate::utils::error::Result;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

const MESSAGE_PREFIX: &str = "msg/";
const EVENT_CAPACITY: usize = 256;

/// Изменение в хранилище
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    Appended(Message),
    Updated(Message),
    Removed {
        conversation_id: String,
        message_id: String,
    },
}

#[derive(Serialize, Deserialize)]
struct StoredRecord {
    seq: u64,
    message: Message,
}

struct Entry {
    seq: u64,
    message: Message,
}

#[derive(Default)]
struct State {
    conversations: HashMap<String, Vec<Entry>>,
    /// message id → conversation id
    index: HashMap<String, String>,
    next_seq: u64,
}

impl State {
    fn insert_sorted(&mut self, entry: Entry) {
        let entries = self
            .conversations
            .entry(entry.message.conversation_id.clone())
            .or_default();
        let key = (entry.message.timestamp, entry.seq);
        let pos = entries.partition_point(|e| (e.message.timestamp, e.seq) <= key);
        entries.insert(pos, entry);
    }

    fn take(&mut self, conversation_id: &str, message_id: &str) -> Option<Entry> {
        let entries = self.conversations.get_mut(conversation_id)?;
        let pos = entries.iter().position(|e| e.message.id == message_id)?;
        Some(entries.remove(pos))
    }
}

pub struct OfflineMessageStore {
    backend: Arc<dyn StorageBackend>,
    state: RwLock<State>,
    events: broadcast::Sender<StoreEvent>,
}

fn record_key(conversation_id: &str, seq: u64) -> String {
    format!("{}{}/{:020}", MESSAGE_PREFIX, conversation_id, seq)
}

impl OfflineMessageStore {
    /// Открыть хранилище и загрузить сохранённые сообщения
    pub fn open(backend: Arc<dyn StorageBackend>) -> Result<Self> {
        let mut state = State::default();

        for (key, value) in backend.scan_prefix(MESSAGE_PREFIX)? {
            let record: StoredRecord = match serde_json::from_slice(&value) {
                Ok(record) => record,
                Err(e) => {
                    warn!(target: "storage::messages", key = %key, error = %e, "Skipping corrupted message record");
                    continue;
                }
            };
            state.next_seq = state.next_seq.max(record.seq + 1);
            state
                .index
                .insert(record.message.id.clone(), record.message.conversation_id.clone());
            state.insert_sorted(Entry {
                seq: record.seq,
                message: record.message,
            });
        }

        debug!(
            target: "storage::messages",
            messages = state.index.len(),
            conversations = state.conversations.len(),
            "Message store opened"
        );

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            backend,
            state: RwLock::new(state),
            events,
        })
    }

    fn write_record(&self, seq: u64, message: &Message) -> Result<()> {
        let record = StoredRecord {
            seq,
            message: message.clone(),
        };
        let bytes = serde_json::to_vec(&record)?;
        self.backend
            .put(&record_key(&message.conversation_id, seq), &bytes)
    }

    fn emit(&self, event: StoreEvent) {
        // Нет подписчиков: не ошибка
        let _ = self.events.send(event);
    }

    /// Добавить сообщение. Повторный id игнорируется; возвращает `true`,
    /// если сообщение действительно добавлено.
    pub fn append(&self, message: Message) -> Result<bool> {
        let mut state = self.state.write();
        if state.index.contains_key(&message.id) {
            trace!(target: "storage::messages", message_id = %message.id, "Duplicate append ignored");
            return Ok(false);
        }

        let seq = state.next_seq;
        self.write_record(seq, &message)?;

        state.next_seq += 1;
        state
            .index
            .insert(message.id.clone(), message.conversation_id.clone());
        state.insert_sorted(Entry {
            seq,
            message: message.clone(),
        });
        drop(state);

        self.emit(StoreEvent::Appended(message));
        Ok(true)
    }

    /// Частичное обновление. Статус только растёт, `is_encrypted` может
    /// смениться только с `true` на `false`. Возвращает `None`, если
    /// сообщения нет.
    pub fn update(
        &self,
        conversation_id: &str,
        message_id: &str,
        patch: MessagePatch,
    ) -> Result<Option<Message>> {
        let mut state = self.state.write();
        let Some(mut entry) = state.take(conversation_id, message_id) else {
            return Ok(None);
        };

        let original = entry.message.clone();
        let message = &mut entry.message;

        if let Some(text) = patch.text {
            message.text = text;
        }
        if let Some(timestamp) = patch.timestamp {
            message.timestamp = timestamp;
        }
        if let Some(status) = patch.read_status {
            if !message.read_status.advance(status) && status != message.read_status {
                trace!(
                    target: "storage::messages",
                    message_id,
                    current = ?message.read_status,
                    requested = ?status,
                    "Ignoring status regression"
                );
            }
        }
        if let Some(is_encrypted) = patch.is_encrypted {
            if message.is_encrypted && !is_encrypted {
                message.is_encrypted = false;
            } else if !message.is_encrypted && is_encrypted {
                warn!(target: "storage::messages", message_id, "Refusing to mark decrypted message as encrypted");
            }
        }
        if let Some(ciphertext) = patch.ciphertext {
            message.ciphertext = ciphertext;
        }
        if let Some(failure) = patch.delivery_failure {
            message.delivery_failure = failure;
        }
        if let Some(reactions) = patch.reactions {
            message.reactions = reactions;
        }
        if let Some(edited_at) = patch.edited_at {
            message.edited_at = Some(edited_at);
        }

        let updated = entry.message.clone();
        if let Err(e) = self.write_record(entry.seq, &updated) {
            entry.message = original;
            state.insert_sorted(entry);
            return Err(e);
        }
        state.insert_sorted(entry);
        drop(state);

        self.emit(StoreEvent::Updated(updated.clone()));
        Ok(Some(updated))
    }

    pub fn remove(&self, conversation_id: &str, message_id: &str) -> Result<bool> {
        let mut state = self.state.write();
        let Some(entry) = state.take(conversation_id, message_id) else {
            return Ok(false);
        };

        if let Err(e) = self.backend.remove(&record_key(conversation_id, entry.seq)) {
            state.insert_sorted(entry);
            return Err(e);
        }
        state.index.remove(message_id);
        drop(state);

        self.emit(StoreEvent::Removed {
            conversation_id: conversation_id.to_string(),
            message_id: message_id.to_string(),
        });
        Ok(true)
    }

    /// Сообщения беседы в порядке отображения
    pub fn get_by_conversation(&self, conversation_id: &str) -> Vec<Message> {
        self.state
            .read()
            .conversations
            .get(conversation_id)
            .map(|entries| entries.iter().map(|e| e.message.clone()).collect())
            .unwrap_or_default()
    }

    pub fn find(&self, message_id: &str) -> Option<Message> {
        let state = self.state.read();
        let conversation_id = state.index.get(message_id)?;
        state
            .conversations
            .get(conversation_id)?
            .iter()
            .find(|e| e.message.id == message_id)
            .map(|e| e.message.clone())
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.state.read().index.contains_key(message_id)
    }

    pub fn conversation_ids(&self) -> Vec<String> {
        self.state.read().conversations.keys().cloned().collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}
