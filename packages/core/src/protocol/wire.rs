// Wire format relay-соединения (MessagePack)
//
// Кадры пишутся как именованные map (`to_vec_named`): опциональные поля
// пропускаются при сериализации, и позиционный формат их бы сломал.

use crate::protocol::messages::{DeliveryAck, InboundEvent, PublishRequest};
use crate::utils::error::{CoreError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum RelayFrame {
    /// Клиент → relay
    Publish(PublishRequest),
    /// Relay → клиент: публикация принята
    Ack(DeliveryAck),
    /// Relay → клиент: публикация отклонена
    #[serde(rename_all = "camelCase")]
    Nack { request_id: String, error: String },
    /// Relay → клиент: входящее событие
    Deliver(InboundEvent),
    Ping,
    Pong,
}

/// Упаковать кадр в MessagePack
pub fn pack_frame(frame: &RelayFrame) -> Result<Vec<u8>> {
    rmp_serde::to_vec_named(frame)
        .map_err(|e| CoreError::SerializationError(format!("MessagePack pack error: {}", e)))
}

/// Распаковать кадр из MessagePack
pub fn unpack_frame(data: &[u8]) -> Result<RelayFrame> {
    rmp_serde::from_slice(data)
        .map_err(|e| CoreError::SerializationError(format!("MessagePack unpack error: {}", e)))
}
