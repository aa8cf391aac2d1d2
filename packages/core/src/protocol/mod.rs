// Протокол: envelope, сообщения транспорта и wire format relay

pub mod envelope;
pub mod messages;
pub mod wire;

pub use envelope::{Envelope, EnvelopeError, MessageType};
pub use messages::{DeliveryAck, InboundEvent, PublishPayload, PublishRequest, Receipt};
