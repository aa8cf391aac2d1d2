//! Транспорты доставки
//!
//! ```text
//! SyncReconciler ──publish──▶ CompositeTransport ──▶ direct (если peer достижим)
//!                                               └──▶ relay  (store-and-forward)
//!       ▲
//!       └──────── InboundEvent (mpsc) ◀──────── любой транспорт
//! ```
//!
//! Транспорт только доставляет `PublishRequest` и подтверждает приём.
//! Ни шифрованием, ни порядком операций он не занимается.

pub mod composite;
pub mod connection;
pub mod memory;
pub mod relay;

use crate::protocol::messages::{DeliveryAck, InboundEvent, PublishRequest};
use crate::utils::error::CoreError;
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

pub use composite::CompositeTransport;
pub use connection::{ConnectionManager, ConnectionState, RelayConnector, RelaySocket};
pub use memory::{MemoryDirect, MemoryHub, MemoryRelay};
pub use relay::RelayTransport;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("not connected: {0}")]
    NotConnected(String),

    #[error("peer unreachable: {0}")]
    Unreachable(String),

    #[error("publish timed out after {0:?}")]
    Timeout(Duration),

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("connection closed")]
    Closed,

    #[error("frame error: {0}")]
    Frame(String),
}

impl From<TransportError> for CoreError {
    fn from(err: TransportError) -> Self {
        CoreError::TransportUnavailable(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Relay,
    Direct,
    Composite,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Relay => write!(f, "relay"),
            TransportKind::Direct => write!(f, "direct"),
            TransportKind::Composite => write!(f, "composite"),
        }
    }
}

/// Доставка одного запроса с подтверждением.
///
/// `publish` возвращает `Ok` только когда транспорт взял на себя
/// доставку; `created_at` из ack становится каноническим временем
/// сообщения.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Можно ли прямо сейчас доставить запрос этому пользователю
    async fn is_reachable(&self, user_id: &str) -> bool;

    async fn publish(&self, request: &PublishRequest) -> Result<DeliveryAck, TransportError>;
}

pub type InboundSender = mpsc::UnboundedSender<InboundEvent>;
pub type InboundReceiver = mpsc::UnboundedReceiver<InboundEvent>;

/// Канал входящих событий: отправляющую сторону получают транспорты
pub fn inbound_channel() -> (InboundSender, InboundReceiver) {
    mpsc::unbounded_channel()
}
