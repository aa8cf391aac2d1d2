//! Relay-транспорт: MessagePack-кадры поверх `RelaySocket`
//!
//! Каждый `Publish` ждёт свой `Ack`/`Nack` по `request_id`. Входящие
//! `Deliver` уходят в канал `InboundSender`. Читающий цикл сам
//! переподключается с exponential backoff.

use super::connection::{ConnectionManager, ConnectionState, RelaySocket};
use super::{InboundSender, Transport, TransportError, TransportKind};
use crate::protocol::messages::{DeliveryAck, PublishRequest};
use crate::protocol::wire::{pack_frame, unpack_frame, RelayFrame};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

type AckSender = oneshot::Sender<Result<DeliveryAck, TransportError>>;

pub struct RelayTransport {
    connection: Arc<ConnectionManager>,
    pending: Mutex<HashMap<String, AckSender>>,
    inbound: InboundSender,
    publish_timeout: Duration,
}

impl RelayTransport {
    pub fn new(
        connection: Arc<ConnectionManager>,
        inbound: InboundSender,
        publish_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            connection,
            pending: Mutex::new(HashMap::new()),
            inbound,
            publish_timeout,
        })
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Обработать один входящий кадр. Возвращает кадр-ответ, если он нужен.
    pub fn handle_frame(&self, bytes: &[u8]) -> Option<RelayFrame> {
        let frame = match unpack_frame(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(target: "transport::relay", error = %e, "Dropping malformed frame");
                return None;
            }
        };

        match frame {
            RelayFrame::Ack(ack) => {
                let request_id = ack.request_id.clone();
                self.resolve(&request_id, Ok(ack));
                None
            }
            RelayFrame::Nack { request_id, error } => {
                self.resolve(&request_id, Err(TransportError::Rejected(error)));
                None
            }
            RelayFrame::Deliver(event) => {
                trace!(target: "transport::relay", sender = %event.sender_id, "Inbound event");
                if self.inbound.send(event).is_err() {
                    debug!(target: "transport::relay", "Inbound receiver dropped");
                }
                None
            }
            RelayFrame::Ping => Some(RelayFrame::Pong),
            RelayFrame::Pong => None,
            RelayFrame::Publish(request) => {
                warn!(target: "transport::relay", request_id = %request.request_id, "Unexpected publish frame from relay");
                None
            }
        }
    }

    fn resolve(&self, request_id: &str, result: Result<DeliveryAck, TransportError>) {
        match self.pending.lock().remove(request_id) {
            // Получатель мог уже уйти по таймауту
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => debug!(target: "transport::relay", request_id = %request_id, "Ack for unknown request"),
        }
    }

    fn fail_all_pending(&self) {
        let pending: Vec<_> = self.pending.lock().drain().collect();
        for (_, tx) in pending {
            let _ = tx.send(Err(TransportError::Closed));
        }
    }

    /// Читать кадры, пока сокет не закроется
    pub async fn read_loop(&self, socket: Arc<dyn RelaySocket>) {
        while let Some(bytes) = socket.recv().await {
            let Some(reply) = self.handle_frame(&bytes) else {
                continue;
            };
            let sent = match pack_frame(&reply) {
                Ok(packed) => socket.send(packed).await,
                Err(e) => Err(TransportError::Frame(e.to_string())),
            };
            if let Err(e) = sent {
                warn!(target: "transport::relay", error = %e, "Failed to send reply frame");
                break;
            }
        }

        self.connection.mark_disconnected();
        self.fail_all_pending();
    }

    /// Фоновый цикл: подключиться, читать, при обрыве переподключиться.
    /// Завершается, когда входящий канал закрыт.
    pub fn spawn_reader(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut states = this.connection.subscribe();
            loop {
                if this.inbound.is_closed() {
                    break;
                }

                match this.connection.ensure_connected().await {
                    Ok(socket) => {
                        this.read_loop(socket).await;
                        continue;
                    }
                    Err(e) => {
                        debug!(target: "transport::relay", error = %e, "Reader could not connect");
                    }
                }

                let delay = this.connection.next_retry_delay();
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    // publish мог подключиться раньше нас
                    _ = states.wait_for(|state| *state == ConnectionState::Connected) => {}
                }
            }
        })
    }
}

#[async_trait]
impl Transport for RelayTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Relay
    }

    async fn is_reachable(&self, _user_id: &str) -> bool {
        self.connection.is_connected()
    }

    async fn publish(&self, request: &PublishRequest) -> Result<DeliveryAck, TransportError> {
        let socket = self.connection.ensure_connected().await?;
        let frame = pack_frame(&RelayFrame::Publish(request.clone()))
            .map_err(|e| TransportError::Frame(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request.request_id.clone(), tx);

        if let Err(e) = socket.send(frame).await {
            self.pending.lock().remove(&request.request_id);
            self.connection.mark_disconnected();
            return Err(e);
        }

        match tokio::time::timeout(self.publish_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                self.pending.lock().remove(&request.request_id);
                Err(TransportError::Timeout(self.publish_timeout))
            }
        }
    }
}
