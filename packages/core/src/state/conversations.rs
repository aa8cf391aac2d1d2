// Состояние бесед: превью последнего сообщения и счётчик непрочитанных

use crate::storage::models::Message;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Максимальная длина превью (в символах)
const PREVIEW_CHARS: usize = 100;

/// Сводка по одной беседе для списка чатов
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub conversation_id: String,
    pub last_message_preview: String,
    pub last_message_at: i64,
    pub last_sender_id: String,
    pub unread_count: u32,
}

impl ConversationSummary {
    pub fn new(conversation_id: String) -> Self {
        Self {
            conversation_id,
            last_message_preview: String::new(),
            last_message_at: 0,
            last_sender_id: String::new(),
            unread_count: 0,
        }
    }

    fn set_last(&mut self, message: &Message) {
        self.last_message_preview = preview(&message.text);
        self.last_message_at = message.timestamp;
        self.last_sender_id = message.sender_id.clone();
    }
}

fn preview(text: &str) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{}…", head)
    } else {
        head
    }
}

/// Менеджер всех бесед
#[derive(Debug, Default)]
pub struct ConversationsManager {
    conversations: HashMap<String, ConversationSummary>,
}

impl ConversationsManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Получить или создать беседу
    pub fn get_or_create(&mut self, conversation_id: &str) -> &mut ConversationSummary {
        self.conversations
            .entry(conversation_id.to_string())
            .or_insert_with(|| ConversationSummary::new(conversation_id.to_string()))
    }

    /// Учесть новое сообщение. Непрочитанные растут только для чужих сообщений.
    pub fn record_message(&mut self, message: &Message, local_user_id: &str) {
        let summary = self.get_or_create(&message.conversation_id);
        if message.timestamp >= summary.last_message_at {
            summary.set_last(message);
        }
        if message.sender_id != local_user_id {
            summary.unread_count += 1;
        }
    }

    /// Пересчитать превью после удаления или правки
    pub fn refresh(&mut self, conversation_id: &str, last: Option<&Message>) {
        let summary = self.get_or_create(conversation_id);
        match last {
            Some(message) => summary.set_last(message),
            None => {
                summary.last_message_preview.clear();
                summary.last_sender_id.clear();
            }
        }
    }

    pub fn set_unread(&mut self, conversation_id: &str, count: u32) {
        self.get_or_create(conversation_id).unread_count = count;
    }

    /// Сбросить непрочитанные. Возвращает прежнее значение.
    pub fn mark_as_read(&mut self, conversation_id: &str) -> u32 {
        match self.conversations.get_mut(conversation_id) {
            Some(summary) => std::mem::take(&mut summary.unread_count),
            None => 0,
        }
    }

    pub fn get(&self, conversation_id: &str) -> Option<&ConversationSummary> {
        self.conversations.get(conversation_id)
    }

    /// Все беседы, последние сверху
    pub fn all(&self) -> Vec<ConversationSummary> {
        let mut summaries: Vec<_> = self.conversations.values().cloned().collect();
        summaries.sort_by(|a, b| {
            b.last_message_at
                .cmp(&a.last_message_at)
                .then_with(|| a.conversation_id.cmp(&b.conversation_id))
        });
        summaries
    }

    /// Получить общее количество непрочитанных сообщений
    pub fn total_unread_count(&self) -> u32 {
        self.conversations.values().map(|c| c.unread_count).sum()
    }

    pub fn remove_conversation(&mut self, conversation_id: &str) -> Option<ConversationSummary> {
        self.conversations.remove(conversation_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::envelope::MessageType;

    fn message(id: &str, sender: &str, text: &str, timestamp: i64) -> Message {
        Message::outgoing(
            id.to_string(),
            "c".to_string(),
            sender.to_string(),
            text.to_string(),
            MessageType::Text,
            timestamp,
        )
    }

    #[test]
    fn test_unread_only_for_remote_sender() {
        let mut manager = ConversationsManager::new();
        manager.record_message(&message("1", "alice", "mine", 1), "alice");
        manager.record_message(&message("2", "bob", "theirs", 2), "alice");
        manager.record_message(&message("3", "bob", "again", 3), "alice");

        let summary = manager.get("c").unwrap();
        assert_eq!(summary.unread_count, 2);
        assert_eq!(summary.last_message_preview, "again");
        assert_eq!(summary.last_sender_id, "bob");

        assert_eq!(manager.mark_as_read("c"), 2);
        assert_eq!(manager.total_unread_count(), 0);
    }

    #[test]
    fn test_older_message_does_not_replace_preview() {
        let mut manager = ConversationsManager::new();
        manager.record_message(&message("2", "bob", "new", 20), "alice");
        manager.record_message(&message("1", "bob", "old", 10), "alice");
        assert_eq!(manager.get("c").unwrap().last_message_preview, "new");
    }

    #[test]
    fn test_preview_is_truncated() {
        let long = "ы".repeat(150);
        let mut manager = ConversationsManager::new();
        manager.record_message(&message("1", "bob", &long, 1), "alice");

        let preview = &manager.get("c").unwrap().last_message_preview;
        assert_eq!(preview.chars().count(), PREVIEW_CHARS + 1);
        assert!(preview.ends_with('…'));
    }

    #[test]
    fn test_refresh_after_delete() {
        let mut manager = ConversationsManager::new();
        manager.record_message(&message("1", "bob", "hello", 1), "alice");
        manager.refresh("c", None);
        assert_eq!(manager.get("c").unwrap().last_message_preview, "");
    }
}
