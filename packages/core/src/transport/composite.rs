// Direct, если собеседник достижим напрямую, иначе relay

use super::{Transport, TransportError, TransportKind};
use crate::protocol::messages::{DeliveryAck, PublishRequest};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

pub struct CompositeTransport {
    direct: Option<Arc<dyn Transport>>,
    relay: Arc<dyn Transport>,
}

impl CompositeTransport {
    pub fn new(direct: Option<Arc<dyn Transport>>, relay: Arc<dyn Transport>) -> Self {
        Self { direct, relay }
    }

    pub fn relay_only(relay: Arc<dyn Transport>) -> Self {
        Self::new(None, relay)
    }
}

#[async_trait]
impl Transport for CompositeTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Composite
    }

    async fn is_reachable(&self, user_id: &str) -> bool {
        if let Some(direct) = &self.direct {
            if direct.is_reachable(user_id).await {
                return true;
            }
        }
        self.relay.is_reachable(user_id).await
    }

    async fn publish(&self, request: &PublishRequest) -> Result<DeliveryAck, TransportError> {
        if let Some(direct) = &self.direct {
            if direct.is_reachable(&request.recipient_id).await {
                match direct.publish(request).await {
                    Ok(ack) => return Ok(ack),
                    Err(e) => {
                        debug!(
                            target: "transport::composite",
                            request_id = %request.request_id,
                            error = %e,
                            "Direct publish failed, falling back to relay"
                        );
                    }
                }
            }
        }

        self.relay.publish(request).await
    }
}
