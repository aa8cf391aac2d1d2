// Типы сообщений протокола между клиентом и транспортом
//
// Беседа 1:1 идентифицируется user id собеседника, поэтому conversation id
// по сети не передаётся: получатель берёт его из sender_id (или из
// recipient_id для эха собственных сообщений).

use crate::protocol::envelope::{Envelope, MessageType};
use crate::storage::models::ReadStatus;
use serde::{Deserialize, Serialize};

/// Квитанция о доставке / прочтении
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub message_ids: Vec<String>,
    pub status: ReadStatus,
}

/// Полезная нагрузка публикации
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum PublishPayload {
    #[serde(rename_all = "camelCase")]
    Message {
        message_id: String,
        message_type: MessageType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        envelope: Option<Envelope>,
        /// Legacy plaintext от старых клиентов
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Delete { message_id: String },
    #[serde(rename_all = "camelCase")]
    Edit {
        message_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        envelope: Option<Envelope>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Reaction {
        message_id: String,
        emoji: String,
        added: bool,
    },
    Receipt(Receipt),
}

impl PublishPayload {
    /// Id сообщения, к которому относится payload (для receipts первый из списка)
    pub fn message_id(&self) -> Option<&str> {
        match self {
            Self::Message { message_id, .. }
            | Self::Delete { message_id }
            | Self::Edit { message_id, .. }
            | Self::Reaction { message_id, .. } => Some(message_id),
            Self::Receipt(receipt) => receipt.message_ids.first().map(String::as_str),
        }
    }
}

/// Запрос на публикацию (клиент → транспорт)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishRequest {
    /// UUID v4, по нему сопоставляется ack
    pub request_id: String,
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_device_id: Option<u32>,
    pub recipient_id: String,
    pub payload: PublishPayload,
}

impl PublishRequest {
    pub fn new(
        sender_id: String,
        sender_device_id: Option<u32>,
        recipient_id: String,
        payload: PublishPayload,
    ) -> Self {
        Self {
            request_id: crate::utils::uuid::generate_v4(),
            sender_id,
            sender_device_id,
            recipient_id,
            payload,
        }
    }
}

/// Подтверждение публикации. `created_at` назначает транспорт (мс) и он
/// же задаёт порядок сообщений.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryAck {
    pub request_id: String,
    pub created_at: i64,
}

/// Входящее событие (транспорт → клиент)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundEvent {
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_device_id: Option<u32>,
    /// Нужен для эха собственных сообщений с других устройств
    pub recipient_id: String,
    pub created_at: i64,
    pub payload: PublishPayload,
}

impl InboundEvent {
    /// Событие, которое увидит получатель публикации
    pub fn from_request(request: &PublishRequest, created_at: i64) -> Self {
        Self {
            sender_id: request.sender_id.clone(),
            sender_device_id: request.sender_device_id,
            recipient_id: request.recipient_id.clone(),
            created_at,
            payload: request.payload.clone(),
        }
    }
}
