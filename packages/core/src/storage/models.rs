// Модели данных для хранилища

use crate::protocol::envelope::{Envelope, MessageType};
use serde::{Deserialize, Serialize};

/// Статус доставки сообщения. Только растёт: pending → sent → delivered → read
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadStatus {
    #[default]
    Pending, // Создано, но не подтверждено сервером
    Sent,      // Подтверждено транспортом
    Delivered, // Доставлено получателю
    Read,      // Прочитано
}

impl ReadStatus {
    /// Применить новый статус, если он не откатывает текущий
    pub fn advance(&mut self, next: ReadStatus) -> bool {
        if next > *self {
            *self = next;
            true
        } else {
            false
        }
    }
}

/// Почему сообщение ещё не ушло
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum DeliveryFailure {
    /// Будет повторено автоматически
    Retrying { attempts: u32, error: String },
    /// Попытки исчерпаны, нужен явный retry
    Permanent { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    pub emoji: String,
    pub user_id: String,
}

/// Сообщение в локальном хранилище
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    #[serde(default)]
    pub sender_device_id: Option<u32>,
    pub text: String,
    /// `created_at` транспорта, миллисекунды
    pub timestamp: i64,
    pub is_sent: bool,
    /// `true` пока текст не расшифрован
    pub is_encrypted: bool,
    pub read_status: ReadStatus,
    #[serde(default)]
    pub font_size: Option<f32>,
    #[serde(default)]
    pub ciphertext: Option<String>,
    #[serde(default)]
    pub message_type: MessageType,
    #[serde(default)]
    pub delivery_failure: Option<DeliveryFailure>,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
    #[serde(default)]
    pub edited_at: Option<i64>,
}

impl Message {
    /// Исходящее сообщение до подтверждения транспортом
    pub fn outgoing(
        id: String,
        conversation_id: String,
        sender_id: String,
        text: String,
        message_type: MessageType,
        timestamp: i64,
    ) -> Self {
        Self {
            id,
            conversation_id,
            sender_id,
            sender_device_id: None,
            text,
            timestamp,
            is_sent: true,
            is_encrypted: false,
            read_status: ReadStatus::Pending,
            font_size: None,
            ciphertext: None,
            message_type,
            delivery_failure: None,
            reactions: Vec::new(),
            edited_at: None,
        }
    }

    /// Входящее сообщение в том виде, в каком пришло
    pub fn incoming(
        id: String,
        conversation_id: String,
        sender_id: String,
        sender_device_id: Option<u32>,
        timestamp: i64,
    ) -> Self {
        Self {
            id,
            conversation_id,
            sender_id,
            sender_device_id,
            text: String::new(),
            timestamp,
            is_sent: false,
            is_encrypted: true,
            read_status: ReadStatus::Delivered,
            font_size: None,
            ciphertext: None,
            message_type: MessageType::Text,
            delivery_failure: None,
            reactions: Vec::new(),
            edited_at: None,
        }
    }
}

/// Частичное обновление сообщения. `None`: поле не трогать.
#[derive(Debug, Clone, Default)]
pub struct MessagePatch {
    pub text: Option<String>,
    pub timestamp: Option<i64>,
    pub read_status: Option<ReadStatus>,
    pub is_encrypted: Option<bool>,
    pub ciphertext: Option<Option<String>>,
    pub delivery_failure: Option<Option<DeliveryFailure>>,
    pub reactions: Option<Vec<Reaction>>,
    pub edited_at: Option<i64>,
}

impl MessagePatch {
    pub fn status(status: ReadStatus) -> Self {
        Self {
            read_status: Some(status),
            ..Self::default()
        }
    }
}

/// Что именно нужно доставить
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum OperationPayload {
    SendMessage {
        message_id: String,
        recipient_id: String,
        text: String,
        message_type: MessageType,
        /// Зашифрованный envelope; повторы отправляют тот же шифротекст
        #[serde(default)]
        envelope: Option<Envelope>,
    },
    DeleteMessage {
        message_id: String,
        recipient_id: String,
    },
    UpdateMessage {
        message_id: String,
        recipient_id: String,
        text: String,
        #[serde(default)]
        envelope: Option<Envelope>,
    },
    AddReaction {
        message_id: String,
        recipient_id: String,
        emoji: String,
    },
    RemoveReaction {
        message_id: String,
        recipient_id: String,
        emoji: String,
    },
}

impl OperationPayload {
    pub fn message_id(&self) -> &str {
        match self {
            Self::SendMessage { message_id, .. }
            | Self::DeleteMessage { message_id, .. }
            | Self::UpdateMessage { message_id, .. }
            | Self::AddReaction { message_id, .. }
            | Self::RemoveReaction { message_id, .. } => message_id,
        }
    }

    pub fn recipient_id(&self) -> &str {
        match self {
            Self::SendMessage { recipient_id, .. }
            | Self::DeleteMessage { recipient_id, .. }
            | Self::UpdateMessage { recipient_id, .. }
            | Self::AddReaction { recipient_id, .. }
            | Self::RemoveReaction { recipient_id, .. } => recipient_id,
        }
    }

    pub fn op_type(&self) -> &'static str {
        match self {
            Self::SendMessage { .. } => "send_message",
            Self::DeleteMessage { .. } => "delete_message",
            Self::UpdateMessage { .. } => "update_message",
            Self::AddReaction { .. } => "add_reaction",
            Self::RemoveReaction { .. } => "remove_reaction",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Processing,
    /// `max_send_attempts` исчерпаны; автоматически не повторяется
    Failed,
}

/// Операция в durable очереди
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedOperation {
    pub id: String,
    pub conversation_id: String,
    #[serde(flatten)]
    pub payload: OperationPayload,
    pub attempts: u32,
    /// `attempts` на момент ручного rearm; потолок считается от него
    #[serde(default)]
    pub attempts_base: u32,
    pub created_at: i64,
    #[serde(default)]
    pub last_attempt_at: Option<i64>,
    #[serde(default)]
    pub next_attempt_at: i64,
    pub status: OperationStatus,
    #[serde(default)]
    pub error: Option<String>,
}

impl QueuedOperation {
    pub fn new(conversation_id: String, payload: OperationPayload, now: i64) -> Self {
        Self {
            id: crate::utils::uuid::generate_v4(),
            conversation_id,
            payload,
            attempts: 0,
            attempts_base: 0,
            created_at: now,
            last_attempt_at: None,
            next_attempt_at: now,
            status: OperationStatus::Pending,
            error: None,
        }
    }

    pub fn op_type(&self) -> &'static str {
        self.payload.op_type()
    }

    pub fn is_due(&self, now: i64) -> bool {
        self.status == OperationStatus::Pending && self.next_attempt_at <= now
    }
}
