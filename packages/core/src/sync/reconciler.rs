//! SyncReconciler: оркестрация исходящих и входящих сообщений
//!
//! ```text
//! send:    composed → encrypting → queued_local → transport_pending → acknowledged
//!                                                                  └→ transport_failed
//! inbound: received → decrypting → stored | decrypt_failed
//! ```
//!
//! Локальный журнал (`OfflineMessageStore`) обновляется сразу, сеть
//! догоняет через durable очередь. Ошибки криптографии и транспорта здесь
//! останавливаются и становятся состоянием сообщения; наружу выходят
//! только ошибки хранилища и неверные аргументы.

use crate::config::Config;
use crate::crypto::keys::PublicKeyBundle;
use crate::crypto::messaging::RatchetHeader;
use crate::crypto::provider::CryptoProvider;
use crate::crypto::sessions::{PeerAddress, SessionManager};
use crate::crypto::suites::classic::ClassicSuiteProvider;
use crate::crypto::{KeyStore, SessionCipher};
use crate::directory::{KeyDirectory, KeyDirectoryClient};
use crate::protocol::envelope::{
    Envelope, EnvelopeError, MessageType, VERSION_RATCHET, VERSION_STATIC_ECDH,
};
use crate::protocol::messages::{DeliveryAck, InboundEvent, PublishPayload, PublishRequest, Receipt};
use crate::state::conversations::{ConversationSummary, ConversationsManager};
use crate::storage::backend::StorageBackend;
use crate::storage::message_store::{OfflineMessageStore, StoreEvent};
use crate::storage::models::{
    DeliveryFailure, Message, MessagePatch, OperationPayload, OperationStatus, QueuedOperation,
    Reaction, ReadStatus,
};
use crate::storage::queue::{EnqueueOutcome, FailureOutcome, OperationQueue};
use crate::storage::secure::SecureStorage;
use crate::sync::retry::RetryPolicy;
use crate::transport::{InboundReceiver, Transport, TransportError};
use crate::utils::error::{CoreError, Result};
use crate::utils::time::now_millis;
use crate::utils::uuid::generate_v4;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Текст входящего сообщения, которое не удалось расшифровать
pub const DECRYPTION_FAILED_TEXT: &str = "[Encrypted - Decryption failed]";

/// Своё сообщение с другого устройства, envelope которого адресован собеседнику
pub const OTHER_DEVICE_TEXT: &str = "[Encrypted - Sent from another device]";

/// Всё, что нужно reconciler'у извне
pub struct ReconcilerDeps {
    pub config: Config,
    pub user_id: String,
    /// Журнал сообщений и очередь
    pub backend: Arc<dyn StorageBackend>,
    /// Ключи устройства и ratchet-сессии
    pub secure_storage: Arc<dyn SecureStorage>,
    pub directory: Arc<dyn KeyDirectory>,
    pub transport: Arc<dyn Transport>,
}

/// Чем закончилась обработка входящего события
#[derive(Debug, Clone, PartialEq)]
pub enum InboundOutcome {
    Stored(Message),
    Duplicate,
    /// Delete / edit / reaction / receipt применены
    Applied,
    Ignored,
}

type ConversationLocks = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

pub struct SyncReconciler<P: CryptoProvider = ClassicSuiteProvider> {
    user_id: String,
    device_id: u32,
    config: Config,
    retry_policy: RetryPolicy,
    key_store: Arc<KeyStore<P>>,
    sessions: SessionManager<P>,
    cipher: SessionCipher<P>,
    directory: KeyDirectoryClient<P>,
    transport: Arc<dyn Transport>,
    store: OfflineMessageStore,
    queue: OperationQueue,
    conversations: Mutex<ConversationsManager>,
    /// encrypt + submit сериализованы внутри беседы
    outbound_locks: ConversationLocks,
    /// dedupe + decrypt + store сериализованы внутри беседы
    inbound_locks: ConversationLocks,
}

fn lock_for(locks: &ConversationLocks, conversation_id: &str) -> Arc<tokio::sync::Mutex<()>> {
    locks
        .lock()
        .entry(conversation_id.to_string())
        .or_default()
        .clone()
}

/// Непрочитанные = чужие сообщения в журнале со статусом ниже `Read`
fn count_unread(messages: &[Message], user_id: &str) -> u32 {
    messages
        .iter()
        .filter(|m| m.sender_id != user_id && m.read_status < ReadStatus::Read)
        .count() as u32
}

fn rebuild_summaries(store: &OfflineMessageStore, user_id: &str) -> ConversationsManager {
    let mut conversations = ConversationsManager::new();
    for conversation_id in store.conversation_ids() {
        let messages = store.get_by_conversation(&conversation_id);
        conversations.refresh(&conversation_id, messages.last());
        conversations.set_unread(&conversation_id, count_unread(&messages, user_id));
    }
    conversations
}

impl<P: CryptoProvider> SyncReconciler<P> {
    /// Собрать reconciler. Без ключей устройства он не создаётся:
    /// `KeyInitializationFailed` пробрасывается как есть.
    pub fn new(deps: ReconcilerDeps) -> Result<Self> {
        let ReconcilerDeps {
            config,
            user_id,
            backend,
            secure_storage,
            directory,
            transport,
        } = deps;

        if user_id.is_empty() {
            return Err(CoreError::InvalidInput("user id is empty".to_string()));
        }

        let key_store = Arc::new(KeyStore::<P>::new(secure_storage.clone()));
        let bundle = key_store.ensure_identity()?;
        let device_id = bundle.device_id;
        let cipher = SessionCipher::from_identity(&bundle.identity.dh_private);
        drop(bundle);

        let sessions = SessionManager::new(
            key_store.clone(),
            secure_storage,
            config.verify_signed_prekeys,
        );
        let directory =
            KeyDirectoryClient::new(directory, config.verify_signed_prekeys, config.directory_fetch_attempts);
        let store = OfflineMessageStore::open(backend.clone())?;
        let queue = OperationQueue::open(backend, config.queue_capacity, config.supersede_policy)?;
        let conversations = rebuild_summaries(&store, &user_id);

        info!(
            target: "sync::reconciler",
            user_id = %user_id,
            device_id,
            encryption_version = config.encryption_version,
            queued = queue.len(),
            "Reconciler ready"
        );

        Ok(Self {
            user_id,
            device_id,
            retry_policy: RetryPolicy::from_config(&config),
            config,
            key_store,
            sessions,
            cipher,
            directory,
            transport,
            store,
            queue,
            conversations: Mutex::new(conversations),
            outbound_locks: Mutex::new(HashMap::new()),
            inbound_locks: Mutex::new(HashMap::new()),
        })
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    pub fn key_store(&self) -> &Arc<KeyStore<P>> {
        &self.key_store
    }

    pub fn messages(&self, conversation_id: &str) -> Vec<Message> {
        self.store.get_by_conversation(conversation_id)
    }

    pub fn find_message(&self, message_id: &str) -> Option<Message> {
        self.store.find(message_id)
    }

    pub fn summaries(&self) -> Vec<ConversationSummary> {
        self.conversations.lock().all()
    }

    pub fn summary(&self, conversation_id: &str) -> Option<ConversationSummary> {
        self.conversations.lock().get(conversation_id).cloned()
    }

    pub fn pending_operations(&self) -> Vec<QueuedOperation> {
        self.queue.all()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.store.subscribe()
    }

    // ========================================================================
    // Identity
    // ========================================================================

    /// Дополнить one-time pre-keys и опубликовать bundle в directory
    pub async fn publish_identity(&self) -> Result<PublicKeyBundle> {
        let target = self.config.one_time_prekey_batch as usize;
        let added = self.key_store.replenish_one_time_pre_keys(target)?;
        if added > 0 {
            debug!(target: "sync::reconciler", added, "Replenished one-time pre-keys");
        }

        let bundle = self.key_store.public_bundle(&self.user_id)?;
        self.directory.publish_own(&bundle).await?;
        Ok(bundle)
    }

    // ========================================================================
    // Outbound
    // ========================================================================

    /// Отправить текст собеседнику.
    ///
    /// Сообщение сразу появляется в журнале со статусом `pending`;
    /// ошибки сети не возвращаются, а отражаются в `delivery_failure`.
    pub async fn send(
        &self,
        conversation_id: &str,
        text: &str,
        message_type: MessageType,
    ) -> Result<Message> {
        if conversation_id.is_empty() {
            return Err(CoreError::InvalidInput("conversation id is empty".to_string()));
        }

        let now = now_millis();
        let mut message = Message::outgoing(
            generate_v4(),
            conversation_id.to_string(),
            self.user_id.clone(),
            text.to_string(),
            message_type,
            now,
        );
        message.sender_device_id = Some(self.device_id);

        self.store.append(message.clone())?;
        self.conversations.lock().record_message(&message, &self.user_id);
        trace!(target: "sync::reconciler", message_id = %message.id, stage = "composed", "Outbound message");

        let op = QueuedOperation::new(
            conversation_id.to_string(),
            OperationPayload::SendMessage {
                message_id: message.id.clone(),
                recipient_id: conversation_id.to_string(),
                text: text.to_string(),
                message_type,
                envelope: None,
            },
            now,
        );
        self.enqueue(op)?;
        trace!(target: "sync::reconciler", message_id = %message.id, stage = "queued_local", "Outbound message");

        if let Err(e) = self.flush_conversation(conversation_id).await {
            warn!(target: "sync::reconciler", conversation_id, error = %e, "Flush after send failed");
        }

        Ok(self.store.find(&message.id).unwrap_or(message))
    }

    fn enqueue(&self, op: QueuedOperation) -> Result<EnqueueOutcome> {
        let outcome = self.queue.enqueue(op)?;
        if let EnqueueOutcome::Enqueued {
            evicted: Some(evicted),
        } = &outcome
        {
            if let OperationPayload::SendMessage { message_id, .. } = &evicted.payload {
                let error = CoreError::QueueCapacityExceeded(format!(
                    "capacity {}",
                    self.config.queue_capacity
                ));
                self.store.update(
                    &evicted.conversation_id,
                    message_id,
                    MessagePatch {
                        delivery_failure: Some(Some(DeliveryFailure::Permanent {
                            error: error.to_string(),
                        })),
                        ..MessagePatch::default()
                    },
                )?;
            }
        }
        Ok(outcome)
    }

    /// Пройти очередь по всем беседам. Если обработка уже идёт, сразу
    /// возвращает 0. Возвращает число подтверждённых операций.
    pub async fn process_queue(&self) -> Result<usize> {
        let Some(_guard) = self.queue.try_begin_processing() else {
            trace!(target: "sync::reconciler", "Queue drain already running");
            return Ok(0);
        };

        let mut delivered = 0;
        for conversation_id in self.queue.conversations_with_pending() {
            match self.flush_conversation(&conversation_id).await {
                Ok(count) => delivered += count,
                Err(e) => {
                    warn!(target: "sync::reconciler", conversation_id = %conversation_id, error = %e, "Conversation flush failed");
                }
            }
        }
        Ok(delivered)
    }

    /// Отправить готовые операции одной беседы по порядку.
    /// Первая неудача останавливает беседу до следующего прохода.
    pub async fn flush_conversation(&self, conversation_id: &str) -> Result<usize> {
        let lock = lock_for(&self.outbound_locks, conversation_id);
        let _guard = lock.lock().await;

        let mut delivered = 0;
        while let Some(op) = self.queue.next_due(conversation_id, now_millis()) {
            if !self.process_operation(op).await? {
                break;
            }
            delivered += 1;
        }
        Ok(delivered)
    }

    async fn process_operation(&self, op: QueuedOperation) -> Result<bool> {
        let Some(op) = self.queue.mark_processing(&op.id, now_millis())? else {
            return Ok(false);
        };

        match self.deliver(&op).await {
            Ok(ack) => {
                self.queue.complete(&op.id)?;
                self.on_acknowledged(&op, &ack)?;
                Ok(true)
            }
            Err(e) => {
                let outcome =
                    self.queue
                        .record_failure(&op.id, &e.to_string(), now_millis(), &self.retry_policy)?;
                self.on_failed(&op, outcome, &e)?;
                Ok(false)
            }
        }
    }

    /// Зашифровать (если ещё не) и опубликовать одну операцию
    async fn deliver(&self, op: &QueuedOperation) -> Result<DeliveryAck> {
        let payload = match &op.payload {
            OperationPayload::SendMessage {
                message_id,
                recipient_id,
                text,
                message_type,
                envelope,
            } => {
                let envelope = match envelope {
                    Some(envelope) => envelope.clone(),
                    None => {
                        let envelope = self.encrypt_for(recipient_id, text, *message_type).await?;
                        self.queue.update_payload(
                            &op.id,
                            OperationPayload::SendMessage {
                                message_id: message_id.clone(),
                                recipient_id: recipient_id.clone(),
                                text: text.clone(),
                                message_type: *message_type,
                                envelope: Some(envelope.clone()),
                            },
                        )?;
                        self.store.update(
                            &op.conversation_id,
                            message_id,
                            MessagePatch {
                                ciphertext: Some(Some(envelope.ciphertext.clone())),
                                ..MessagePatch::default()
                            },
                        )?;
                        envelope
                    }
                };
                PublishPayload::Message {
                    message_id: message_id.clone(),
                    message_type: *message_type,
                    envelope: Some(envelope),
                    text: None,
                }
            }
            OperationPayload::UpdateMessage {
                message_id,
                recipient_id,
                text,
                envelope,
            } => {
                let envelope = match envelope {
                    Some(envelope) => envelope.clone(),
                    None => {
                        let envelope = self.encrypt_for(recipient_id, text, MessageType::Text).await?;
                        self.queue.update_payload(
                            &op.id,
                            OperationPayload::UpdateMessage {
                                message_id: message_id.clone(),
                                recipient_id: recipient_id.clone(),
                                text: text.clone(),
                                envelope: Some(envelope.clone()),
                            },
                        )?;
                        envelope
                    }
                };
                PublishPayload::Edit {
                    message_id: message_id.clone(),
                    envelope: Some(envelope),
                    text: None,
                }
            }
            OperationPayload::DeleteMessage { message_id, .. } => PublishPayload::Delete {
                message_id: message_id.clone(),
            },
            OperationPayload::AddReaction {
                message_id, emoji, ..
            } => PublishPayload::Reaction {
                message_id: message_id.clone(),
                emoji: emoji.clone(),
                added: true,
            },
            OperationPayload::RemoveReaction {
                message_id, emoji, ..
            } => PublishPayload::Reaction {
                message_id: message_id.clone(),
                emoji: emoji.clone(),
                added: false,
            },
        };

        let request = PublishRequest::new(
            self.user_id.clone(),
            Some(self.device_id),
            op.payload.recipient_id().to_string(),
            payload,
        );
        trace!(
            target: "sync::reconciler",
            op_id = %op.id,
            op_type = op.op_type(),
            attempt = op.attempts,
            stage = "transport_pending",
            "Publishing"
        );
        self.publish(&request).await
    }

    async fn publish(&self, request: &PublishRequest) -> Result<DeliveryAck> {
        let timeout = Duration::from_millis(self.config.publish_timeout_ms);
        match tokio::time::timeout(timeout, self.transport.publish(request)).await {
            Ok(result) => result.map_err(CoreError::from),
            Err(_) => Err(TransportError::Timeout(timeout).into()),
        }
    }

    /// Envelope для собеседника в настроенной версии шифрования
    async fn encrypt_for(
        &self,
        recipient_id: &str,
        text: &str,
        message_type: MessageType,
    ) -> Result<Envelope> {
        let device_id = self.directory.resolve_device(recipient_id).await?;

        match self.config.encryption_version {
            VERSION_STATIC_ECDH => {
                let bundle = self.directory.resolve(recipient_id, device_id).await?;
                let ciphertext = self.cipher.encrypt(text, &bundle.identity_public)?;
                Ok(Envelope::encode(
                    ciphertext,
                    message_type,
                    VERSION_STATIC_ECDH,
                    self.device_id,
                ))
            }
            VERSION_RATCHET => {
                let peer = PeerAddress::new(recipient_id, device_id);
                let bundle = if self.sessions.has_session(&peer)? {
                    None
                } else {
                    Some(self.directory.fetch_fresh(recipient_id, device_id).await?)
                };
                let encrypted = self.sessions.encrypt(&peer, bundle.as_ref(), text.as_bytes())?;
                trace!(target: "sync::reconciler", peer = %peer, stage = "encrypting", "Encrypted for peer");
                Ok(Envelope::with_ratchet(
                    &encrypted.sealed,
                    message_type,
                    self.device_id,
                    &encrypted.header,
                    encrypted.handshake,
                ))
            }
            other => Err(EnvelopeError::UnsupportedVersion(other).into()),
        }
    }

    fn on_acknowledged(&self, op: &QueuedOperation, ack: &DeliveryAck) -> Result<()> {
        debug!(
            target: "sync::reconciler",
            op_id = %op.id,
            op_type = op.op_type(),
            created_at = ack.created_at,
            stage = "acknowledged",
            "Operation acknowledged"
        );

        if let OperationPayload::SendMessage { message_id, .. } = &op.payload {
            let updated = self.store.update(
                &op.conversation_id,
                message_id,
                MessagePatch {
                    read_status: Some(ReadStatus::Sent),
                    timestamp: Some(ack.created_at),
                    delivery_failure: Some(None),
                    ..MessagePatch::default()
                },
            )?;
            if updated.is_some() {
                self.refresh_summary(&op.conversation_id);
            }
        }
        Ok(())
    }

    fn on_failed(&self, op: &QueuedOperation, outcome: FailureOutcome, error: &CoreError) -> Result<()> {
        let failure = match outcome {
            FailureOutcome::Retrying {
                attempts,
                next_attempt_at,
            } => {
                debug!(
                    target: "sync::reconciler",
                    op_id = %op.id,
                    attempts,
                    next_attempt_at,
                    error = %error,
                    stage = "transport_failed",
                    "Operation will be retried"
                );
                DeliveryFailure::Retrying {
                    attempts,
                    error: error.to_string(),
                }
            }
            FailureOutcome::Exhausted { attempts } => {
                warn!(
                    target: "sync::reconciler",
                    op_id = %op.id,
                    op_type = op.op_type(),
                    attempts,
                    error = %error,
                    "Operation failed permanently"
                );
                DeliveryFailure::Permanent {
                    error: error.to_string(),
                }
            }
        };

        if let OperationPayload::SendMessage { message_id, .. } = &op.payload {
            self.store.update(
                &op.conversation_id,
                message_id,
                MessagePatch {
                    delivery_failure: Some(Some(failure)),
                    ..MessagePatch::default()
                },
            )?;
        }
        Ok(())
    }

    /// Вернуть permanently failed отправку в очередь (явное действие пользователя)
    pub async fn retry_failed(&self, message_id: &str) -> Result<bool> {
        let now = now_millis();
        let mut rearmed = false;
        let mut conversation = None;
        for op in self.queue.find_by_message(message_id) {
            if op.status == OperationStatus::Failed && self.queue.rearm(&op.id, now)? {
                rearmed = true;
                conversation = Some(op.conversation_id.clone());
            }
        }
        let Some(conversation_id) = conversation else {
            return Ok(false);
        };

        self.store.update(
            &conversation_id,
            message_id,
            MessagePatch {
                delivery_failure: Some(None),
                ..MessagePatch::default()
            },
        )?;
        info!(target: "sync::reconciler", message_id, "Failed send re-armed");

        if let Err(e) = self.flush_conversation(&conversation_id).await {
            warn!(target: "sync::reconciler", conversation_id = %conversation_id, error = %e, "Flush after retry failed");
        }
        Ok(rearmed)
    }

    fn own_message(&self, conversation_id: &str, message_id: &str) -> Result<Message> {
        let message = self
            .store
            .find(message_id)
            .filter(|m| m.conversation_id == conversation_id)
            .ok_or_else(|| CoreError::NotFound(format!("message {}", message_id)))?;
        if message.sender_id != self.user_id {
            return Err(CoreError::InvalidInput(format!(
                "message {} was not sent by the local user",
                message_id
            )));
        }
        Ok(message)
    }

    /// Удалить своё сообщение локально и у собеседника
    pub async fn delete_message(&self, conversation_id: &str, message_id: &str) -> Result<()> {
        self.own_message(conversation_id, message_id)?;

        self.store.remove(conversation_id, message_id)?;
        self.refresh_summary(conversation_id);

        let op = QueuedOperation::new(
            conversation_id.to_string(),
            OperationPayload::DeleteMessage {
                message_id: message_id.to_string(),
                recipient_id: conversation_id.to_string(),
            },
            now_millis(),
        );
        let outcome = {
            let lock = lock_for(&self.outbound_locks, conversation_id);
            let _guard = lock.lock().await;
            self.enqueue(op)?
        };
        match outcome {
            EnqueueOutcome::Superseded { cancelled } => {
                debug!(
                    target: "sync::reconciler",
                    message_id,
                    cancelled = cancelled.len(),
                    "Delete cancelled unsent operations"
                );
                Ok(())
            }
            EnqueueOutcome::Enqueued { .. } => {
                if let Err(e) = self.flush_conversation(conversation_id).await {
                    warn!(target: "sync::reconciler", conversation_id, error = %e, "Flush after delete failed");
                }
                Ok(())
            }
        }
    }

    /// Изменить текст своего сообщения
    pub async fn edit_message(
        &self,
        conversation_id: &str,
        message_id: &str,
        text: &str,
    ) -> Result<Message> {
        self.own_message(conversation_id, message_id)?;

        let now = now_millis();
        let updated = self
            .store
            .update(
                conversation_id,
                message_id,
                MessagePatch {
                    text: Some(text.to_string()),
                    edited_at: Some(now),
                    ..MessagePatch::default()
                },
            )?
            .ok_or_else(|| CoreError::NotFound(format!("message {}", message_id)))?;
        self.refresh_summary(conversation_id);

        {
            // Очередь беседы не трогаем, пока flush шифрует и отправляет
            let lock = lock_for(&self.outbound_locks, conversation_id);
            let _guard = lock.lock().await;

            // Ещё не зашифрованная отправка просто уйдёт с новым текстом
            let rewritten = match self.unsent_send(message_id) {
                Some((op_id, recipient_id, message_type)) => self.queue.update_payload(
                    &op_id,
                    OperationPayload::SendMessage {
                        message_id: message_id.to_string(),
                        recipient_id,
                        text: text.to_string(),
                        message_type,
                        envelope: None,
                    },
                )?,
                None => false,
            };

            if !rewritten {
                self.enqueue(QueuedOperation::new(
                    conversation_id.to_string(),
                    OperationPayload::UpdateMessage {
                        message_id: message_id.to_string(),
                        recipient_id: conversation_id.to_string(),
                        text: text.to_string(),
                        envelope: None,
                    },
                    now,
                ))?;
            }
        }

        if let Err(e) = self.flush_conversation(conversation_id).await {
            warn!(target: "sync::reconciler", conversation_id, error = %e, "Flush after edit failed");
        }
        Ok(self.store.find(message_id).unwrap_or(updated))
    }

    /// Pending send без envelope: id операции, получатель, тип
    fn unsent_send(&self, message_id: &str) -> Option<(String, String, MessageType)> {
        self.queue
            .find_by_message(message_id)
            .into_iter()
            .find_map(|op| match op.payload {
                OperationPayload::SendMessage {
                    recipient_id,
                    message_type,
                    envelope: None,
                    ..
                } if op.status == OperationStatus::Pending => Some((op.id, recipient_id, message_type)),
                _ => None,
            })
    }

    pub async fn add_reaction(&self, conversation_id: &str, message_id: &str, emoji: &str) -> Result<()> {
        self.react(conversation_id, message_id, emoji, true).await
    }

    pub async fn remove_reaction(&self, conversation_id: &str, message_id: &str, emoji: &str) -> Result<()> {
        self.react(conversation_id, message_id, emoji, false).await
    }

    async fn react(&self, conversation_id: &str, message_id: &str, emoji: &str, added: bool) -> Result<()> {
        if emoji.is_empty() {
            return Err(CoreError::InvalidInput("emoji is empty".to_string()));
        }
        let message = self
            .store
            .find(message_id)
            .filter(|m| m.conversation_id == conversation_id)
            .ok_or_else(|| CoreError::NotFound(format!("message {}", message_id)))?;

        let Some(reactions) = apply_reaction(&message.reactions, emoji, &self.user_id, added) else {
            return Ok(());
        };
        self.store.update(
            conversation_id,
            message_id,
            MessagePatch {
                reactions: Some(reactions),
                ..MessagePatch::default()
            },
        )?;

        let payload = if added {
            OperationPayload::AddReaction {
                message_id: message_id.to_string(),
                recipient_id: conversation_id.to_string(),
                emoji: emoji.to_string(),
            }
        } else {
            OperationPayload::RemoveReaction {
                message_id: message_id.to_string(),
                recipient_id: conversation_id.to_string(),
                emoji: emoji.to_string(),
            }
        };
        {
            let lock = lock_for(&self.outbound_locks, conversation_id);
            let _guard = lock.lock().await;
            self.enqueue(QueuedOperation::new(conversation_id.to_string(), payload, now_millis()))?;
        }

        if let Err(e) = self.flush_conversation(conversation_id).await {
            warn!(target: "sync::reconciler", conversation_id, error = %e, "Flush after reaction failed");
        }
        Ok(())
    }

    /// Отметить входящие сообщения беседы прочитанными и отправить receipt
    pub async fn mark_conversation_read(&self, conversation_id: &str) -> Result<usize> {
        let unread: Vec<String> = self
            .store
            .get_by_conversation(conversation_id)
            .into_iter()
            .filter(|m| m.sender_id != self.user_id && m.read_status < ReadStatus::Read)
            .map(|m| m.id)
            .collect();

        for message_id in &unread {
            self.store
                .update(conversation_id, message_id, MessagePatch::status(ReadStatus::Read))?;
        }
        self.conversations.lock().mark_as_read(conversation_id);

        let count = unread.len();
        if count > 0 {
            self.send_receipt(conversation_id, unread, ReadStatus::Read).await;
        }
        Ok(count)
    }

    /// Receipts не ставятся в очередь: потерянный receipt не ломает журнал
    async fn send_receipt(&self, recipient_id: &str, message_ids: Vec<String>, status: ReadStatus) {
        let request = PublishRequest::new(
            self.user_id.clone(),
            Some(self.device_id),
            recipient_id.to_string(),
            PublishPayload::Receipt(Receipt {
                message_ids,
                status,
            }),
        );
        if let Err(e) = self.publish(&request).await {
            debug!(target: "sync::reconciler", recipient_id, ?status, error = %e, "Receipt not delivered");
        }
    }

    /// Превью и непрочитанные пересчитываются из журнала, как при старте
    fn refresh_summary(&self, conversation_id: &str) {
        let messages = self.store.get_by_conversation(conversation_id);
        let mut conversations = self.conversations.lock();
        conversations.refresh(conversation_id, messages.last());
        conversations.set_unread(conversation_id, count_unread(&messages, &self.user_id));
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    /// Беседа входящего события: собеседник, а для эха своих сообщений
    /// с другого устройства получатель
    fn conversation_for<'a>(&self, event: &'a InboundEvent) -> &'a str {
        if event.sender_id == self.user_id {
            &event.recipient_id
        } else {
            &event.sender_id
        }
    }

    pub async fn handle_inbound(&self, event: InboundEvent) -> Result<InboundOutcome> {
        let conversation_id = self.conversation_for(&event).to_string();
        let lock = lock_for(&self.inbound_locks, &conversation_id);
        let _guard = lock.lock().await;

        match &event.payload {
            PublishPayload::Message {
                message_id,
                message_type,
                envelope,
                text,
            } => {
                self.receive_message(
                    &event,
                    &conversation_id,
                    message_id,
                    *message_type,
                    envelope.as_ref(),
                    text.as_deref(),
                )
                .await
            }
            PublishPayload::Delete { message_id } => {
                self.receive_delete(&event, &conversation_id, message_id)
            }
            PublishPayload::Edit {
                message_id,
                envelope,
                text,
            } => {
                self.receive_edit(&event, &conversation_id, message_id, envelope.as_ref(), text.as_deref())
                    .await
            }
            PublishPayload::Reaction {
                message_id,
                emoji,
                added,
            } => self.receive_reaction(&event, &conversation_id, message_id, emoji, *added),
            PublishPayload::Receipt(receipt) => self.handle_receipt(&event.sender_id, receipt),
        }
    }

    async fn receive_message(
        &self,
        event: &InboundEvent,
        conversation_id: &str,
        message_id: &str,
        message_type: MessageType,
        envelope: Option<&Envelope>,
        legacy_text: Option<&str>,
    ) -> Result<InboundOutcome> {
        if self.store.contains(message_id) {
            trace!(target: "sync::reconciler", message_id, "Duplicate message dropped");
            return Ok(InboundOutcome::Duplicate);
        }

        let mut message = Message::incoming(
            message_id.to_string(),
            conversation_id.to_string(),
            event.sender_id.clone(),
            event.sender_device_id,
            event.created_at,
        );
        message.message_type = message_type;

        if event.sender_id == self.user_id {
            // Своё сообщение с другого устройства: decrypt не вызывается,
            // envelope зашифрован для собеседника и хранится как есть
            message.is_sent = true;
            message.read_status = ReadStatus::Sent;
            match (legacy_text, envelope) {
                (Some(text), _) => {
                    message.text = text.to_string();
                    message.is_encrypted = false;
                }
                (None, Some(envelope)) => {
                    message.text = OTHER_DEVICE_TEXT.to_string();
                    message.ciphertext = Some(envelope.ciphertext.clone());
                    message.is_encrypted = true;
                }
                (None, None) => {
                    debug!(target: "sync::reconciler", message_id, "Empty own echo dropped");
                    return Ok(InboundOutcome::Ignored);
                }
            }
        } else {
            match envelope {
                None => {
                    message.text = legacy_text.unwrap_or_default().to_string();
                    message.is_encrypted = false;
                }
                Some(envelope) => {
                    message.ciphertext = Some(envelope.ciphertext.clone());
                    trace!(target: "sync::reconciler", message_id, stage = "decrypting", "Inbound message");
                    match self.decrypt_envelope(&event.sender_id, envelope).await {
                        Ok(plaintext) => {
                            message.text = plaintext;
                            message.is_encrypted = false;
                        }
                        Err(e) => {
                            warn!(
                                target: "sync::reconciler",
                                message_id,
                                sender_id = %event.sender_id,
                                error = %e,
                                stage = "decrypt_failed",
                                "Could not decrypt message"
                            );
                            message.text = DECRYPTION_FAILED_TEXT.to_string();
                            message.is_encrypted = true;
                        }
                    }
                }
            }
        }

        if !self.store.append(message.clone())? {
            return Ok(InboundOutcome::Duplicate);
        }
        self.conversations.lock().record_message(&message, &self.user_id);
        debug!(target: "sync::reconciler", message_id, conversation_id, stage = "stored", "Inbound message stored");

        if self.config.send_delivery_receipts && event.sender_id != self.user_id {
            self.send_receipt(&event.sender_id, vec![message.id.clone()], ReadStatus::Delivered)
                .await;
        }
        Ok(InboundOutcome::Stored(message))
    }

    async fn decrypt_envelope(&self, sender_id: &str, envelope: &Envelope) -> Result<String> {
        envelope.validate()?;
        let sender_device = envelope
            .sender_device_id
            .ok_or(EnvelopeError::MissingSenderDeviceId {
                version: envelope.encryption_version,
            })?;

        match envelope.encryption_version {
            VERSION_STATIC_ECDH => {
                let bundle = self.directory.resolve(sender_id, sender_device).await?;
                self.cipher.decrypt(&envelope.ciphertext, &bundle.identity_public)
            }
            VERSION_RATCHET => {
                let header = envelope
                    .header
                    .as_ref()
                    .ok_or(EnvelopeError::MissingRatchetHeader)?;
                let sealed = envelope.sealed_bytes()?;
                let peer = PeerAddress::new(sender_id, sender_device);

                // Identity отправителя нужна только для нового handshake
                let sender_identity = if envelope.handshake.is_some() {
                    match self.directory.resolve(sender_id, sender_device).await {
                        Ok(bundle) => Some(bundle.identity_public),
                        Err(e) if self.config.verify_signed_prekeys => return Err(e),
                        Err(e) => {
                            debug!(target: "sync::reconciler", sender_id, error = %e, "Accepting handshake without directory identity");
                            None
                        }
                    }
                } else {
                    None
                };

                let plaintext = self.sessions.decrypt(
                    &peer,
                    sender_identity.as_deref(),
                    &RatchetHeader::from(header),
                    envelope.handshake.as_ref(),
                    &sealed,
                )?;
                String::from_utf8(plaintext)
                    .map_err(|e| CoreError::DecryptionFailed(format!("invalid UTF-8: {}", e)))
            }
            other => Err(EnvelopeError::UnsupportedVersion(other).into()),
        }
    }

    /// Удалять и править можно только сообщения самого отправителя события
    fn authored_by(&self, conversation_id: &str, message_id: &str, sender_id: &str) -> Option<Message> {
        self.store
            .find(message_id)
            .filter(|m| m.conversation_id == conversation_id && m.sender_id == sender_id)
    }

    fn receive_delete(
        &self,
        event: &InboundEvent,
        conversation_id: &str,
        message_id: &str,
    ) -> Result<InboundOutcome> {
        if self.authored_by(conversation_id, message_id, &event.sender_id).is_none() {
            debug!(target: "sync::reconciler", message_id, sender_id = %event.sender_id, "Ignoring delete for unknown or foreign message");
            return Ok(InboundOutcome::Ignored);
        }
        self.store.remove(conversation_id, message_id)?;
        self.refresh_summary(conversation_id);
        Ok(InboundOutcome::Applied)
    }

    async fn receive_edit(
        &self,
        event: &InboundEvent,
        conversation_id: &str,
        message_id: &str,
        envelope: Option<&Envelope>,
        legacy_text: Option<&str>,
    ) -> Result<InboundOutcome> {
        if self.authored_by(conversation_id, message_id, &event.sender_id).is_none() {
            debug!(target: "sync::reconciler", message_id, sender_id = %event.sender_id, "Ignoring edit for unknown or foreign message");
            return Ok(InboundOutcome::Ignored);
        }

        let text = match (envelope, legacy_text) {
            (Some(envelope), _) if event.sender_id != self.user_id => {
                match self.decrypt_envelope(&event.sender_id, envelope).await {
                    Ok(text) => text,
                    Err(e) => {
                        // Нерасшифрованная правка не затирает старый текст
                        warn!(target: "sync::reconciler", message_id, error = %e, "Could not decrypt edit");
                        return Ok(InboundOutcome::Ignored);
                    }
                }
            }
            (_, Some(text)) => text.to_string(),
            _ => return Ok(InboundOutcome::Ignored),
        };

        self.store.update(
            conversation_id,
            message_id,
            MessagePatch {
                text: Some(text),
                edited_at: Some(event.created_at),
                ..MessagePatch::default()
            },
        )?;
        self.refresh_summary(conversation_id);
        Ok(InboundOutcome::Applied)
    }

    fn receive_reaction(
        &self,
        event: &InboundEvent,
        conversation_id: &str,
        message_id: &str,
        emoji: &str,
        added: bool,
    ) -> Result<InboundOutcome> {
        let Some(message) = self
            .store
            .find(message_id)
            .filter(|m| m.conversation_id == conversation_id)
        else {
            return Ok(InboundOutcome::Ignored);
        };
        let Some(reactions) = apply_reaction(&message.reactions, emoji, &event.sender_id, added) else {
            return Ok(InboundOutcome::Ignored);
        };

        self.store.update(
            conversation_id,
            message_id,
            MessagePatch {
                reactions: Some(reactions),
                ..MessagePatch::default()
            },
        )?;
        Ok(InboundOutcome::Applied)
    }

    /// Продвинуть статусы своих сообщений по квитанции собеседника
    pub fn handle_receipt(&self, sender_id: &str, receipt: &Receipt) -> Result<InboundOutcome> {
        let mut applied = false;
        for message_id in &receipt.message_ids {
            let Some(message) = self.authored_by(sender_id, message_id, &self.user_id) else {
                continue;
            };
            if message.read_status >= receipt.status {
                continue;
            }
            self.store.update(
                &message.conversation_id,
                message_id,
                MessagePatch::status(receipt.status),
            )?;
            applied = true;
        }

        Ok(if applied {
            InboundOutcome::Applied
        } else {
            InboundOutcome::Ignored
        })
    }

    // ========================================================================
    // Background tasks
    // ========================================================================

    /// Периодический проход по очереди. Останавливается вместе с reconciler.
    pub fn spawn_retry_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let period = Duration::from_millis(self.config.retry_tick_ms.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let Some(this) = weak.upgrade() else {
                    break;
                };
                if let Err(e) = this.process_queue().await {
                    warn!(target: "sync::reconciler", error = %e, "Retry pass failed");
                }
            }
        })
    }

    /// Обрабатывать входящие события, пока канал открыт
    pub fn spawn_inbound(self: &Arc<Self>, mut inbound: InboundReceiver) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = inbound.recv().await {
                if let Err(e) = this.handle_inbound(event).await {
                    warn!(target: "sync::reconciler", error = %e, "Inbound event failed");
                }
            }
            debug!(target: "sync::reconciler", "Inbound channel closed");
        })
    }
}

/// Новый список реакций или `None`, если ничего не меняется
fn apply_reaction(current: &[Reaction], emoji: &str, user_id: &str, added: bool) -> Option<Vec<Reaction>> {
    let exists = current
        .iter()
        .any(|r| r.emoji == emoji && r.user_id == user_id);
    match (added, exists) {
        (true, false) => {
            let mut reactions = current.to_vec();
            reactions.push(Reaction {
                emoji: emoji.to_string(),
                user_id: user_id.to_string(),
            });
            Some(reactions)
        }
        (false, true) => Some(
            current
                .iter()
                .filter(|r| !(r.emoji == emoji && r.user_id == user_id))
                .cloned()
                .collect(),
        ),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_reaction() {
        let added = apply_reaction(&[], "👍", "bob", true).unwrap();
        assert_eq!(added.len(), 1);
        assert!(apply_reaction(&added, "👍", "bob", true).is_none());
        assert!(apply_reaction(&added, "👍", "carol", false).is_none());

        let with_carol = apply_reaction(&added, "👍", "carol", true).unwrap();
        let removed = apply_reaction(&with_carol, "👍", "bob", false).unwrap();
        assert_eq!(
            removed,
            vec![Reaction {
                emoji: "👍".to_string(),
                user_id: "carol".to_string()
            }]
        );
    }
}
