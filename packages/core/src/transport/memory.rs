//! In-process relay и direct-транспорт
//!
//! `MemoryHub` ведёт себя как relay со store-and-forward: события для
//! отключённого клиента копятся в его почтовом ящике и отдаются при
//! переподключении. Используется в тестах и для локальной отладки.

use super::{InboundReceiver, InboundSender, Transport, TransportError, TransportKind};
use crate::protocol::messages::{DeliveryAck, InboundEvent, PublishRequest};
use crate::utils::time::now_millis;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

struct Client {
    inbound: InboundSender,
    /// Подключён к relay
    online: bool,
    /// Принимает прямые соединения
    direct_online: bool,
}

struct HubInner {
    relay_online: AtomicBool,
    clients: Mutex<HashMap<String, Client>>,
    mailboxes: Mutex<HashMap<String, Vec<InboundEvent>>>,
    published: Mutex<Vec<(TransportKind, PublishRequest)>>,
    last_created_at: Mutex<i64>,
}

#[derive(Clone)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                relay_online: AtomicBool::new(true),
                clients: Mutex::new(HashMap::new()),
                mailboxes: Mutex::new(HashMap::new()),
                published: Mutex::new(Vec::new()),
                last_created_at: Mutex::new(0),
            }),
        }
    }

    /// Зарегистрировать клиента и получить его входящий канал.
    /// Повторная регистрация заменяет канал.
    pub fn register(&self, user_id: &str) -> InboundReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.clients.lock().insert(
            user_id.to_string(),
            Client {
                inbound: tx,
                online: true,
                direct_online: true,
            },
        );
        self.flush_mailbox(user_id);
        rx
    }

    pub fn relay(&self, user_id: &str) -> MemoryRelay {
        MemoryRelay {
            hub: self.clone(),
            user_id: user_id.to_string(),
        }
    }

    pub fn direct(&self, user_id: &str) -> MemoryDirect {
        MemoryDirect {
            hub: self.clone(),
            user_id: user_id.to_string(),
        }
    }

    /// Доступность relay для всех клиентов сразу
    pub fn set_relay_online(&self, online: bool) {
        self.inner.relay_online.store(online, Ordering::SeqCst);
        debug!(target: "transport::memory", online, "Relay availability changed");
    }

    /// Подключение одного клиента к relay
    pub fn set_online(&self, user_id: &str, online: bool) {
        if let Some(client) = self.inner.clients.lock().get_mut(user_id) {
            client.online = online;
        }
        if online {
            self.flush_mailbox(user_id);
        }
    }

    pub fn set_direct_online(&self, user_id: &str, online: bool) {
        if let Some(client) = self.inner.clients.lock().get_mut(user_id) {
            client.direct_online = online;
        }
    }

    pub fn published(&self) -> Vec<PublishRequest> {
        self.inner
            .published
            .lock()
            .iter()
            .map(|(_, request)| request.clone())
            .collect()
    }

    pub fn relay_publish_count(&self) -> usize {
        self.count_published(TransportKind::Relay)
    }

    pub fn direct_publish_count(&self) -> usize {
        self.count_published(TransportKind::Direct)
    }

    pub fn mailbox_len(&self, user_id: &str) -> usize {
        self.inner
            .mailboxes
            .lock()
            .get(user_id)
            .map_or(0, Vec::len)
    }

    fn count_published(&self, kind: TransportKind) -> usize {
        self.inner
            .published
            .lock()
            .iter()
            .filter(|(k, _)| *k == kind)
            .count()
    }

    fn relay_available_for(&self, user_id: &str) -> bool {
        self.inner.relay_online.load(Ordering::SeqCst)
            && self
                .inner
                .clients
                .lock()
                .get(user_id)
                .map_or(true, |client| client.online)
    }

    fn direct_available(&self, from: &str, to: &str) -> bool {
        let clients = self.inner.clients.lock();
        let sender_ok = clients.get(from).map_or(true, |client| client.direct_online);
        let recipient_ok = clients
            .get(to)
            .map_or(false, |client| client.direct_online && client.online);
        sender_ok && recipient_ok
    }

    /// Монотонный `created_at`: два события никогда не получают одно время
    fn next_created_at(&self) -> i64 {
        let mut last = self.inner.last_created_at.lock();
        *last = now_millis().max(*last + 1);
        *last
    }

    fn record(&self, kind: TransportKind, request: &PublishRequest) -> DeliveryAck {
        let created_at = self.next_created_at();
        self.inner.published.lock().push((kind, request.clone()));
        DeliveryAck {
            request_id: request.request_id.clone(),
            created_at,
        }
    }

    /// Доставить событие сейчас или положить в почтовый ящик
    fn deliver_or_store(&self, recipient: &str, event: InboundEvent) {
        let event = {
            let clients = self.inner.clients.lock();
            match clients.get(recipient) {
                Some(client) if client.online => match client.inbound.send(event) {
                    Ok(()) => return,
                    Err(mpsc::error::SendError(event)) => event,
                },
                _ => event,
            }
        };

        trace!(target: "transport::memory", recipient = %recipient, "Recipient offline, storing event");
        self.inner
            .mailboxes
            .lock()
            .entry(recipient.to_string())
            .or_default()
            .push(event);
    }

    fn flush_mailbox(&self, user_id: &str) {
        let pending = self.inner.mailboxes.lock().remove(user_id).unwrap_or_default();
        if pending.is_empty() {
            return;
        }
        debug!(target: "transport::memory", user_id = %user_id, count = pending.len(), "Flushing mailbox");
        for event in pending {
            self.deliver_or_store(user_id, event);
        }
    }
}

/// Relay-транспорт одного клиента поверх `MemoryHub`
pub struct MemoryRelay {
    hub: MemoryHub,
    user_id: String,
}

#[async_trait]
impl Transport for MemoryRelay {
    fn kind(&self) -> TransportKind {
        TransportKind::Relay
    }

    async fn is_reachable(&self, _user_id: &str) -> bool {
        // Relay принимает и для offline получателей
        self.hub.relay_available_for(&self.user_id)
    }

    async fn publish(&self, request: &PublishRequest) -> Result<DeliveryAck, TransportError> {
        if !self.hub.relay_available_for(&self.user_id) {
            return Err(TransportError::NotConnected("relay offline".to_string()));
        }
        let ack = self.hub.record(TransportKind::Relay, request);
        self.hub.deliver_or_store(
            &request.recipient_id,
            InboundEvent::from_request(request, ack.created_at),
        );
        Ok(ack)
    }
}

/// Прямое соединение между двумя online клиентами
pub struct MemoryDirect {
    hub: MemoryHub,
    user_id: String,
}

#[async_trait]
impl Transport for MemoryDirect {
    fn kind(&self) -> TransportKind {
        TransportKind::Direct
    }

    async fn is_reachable(&self, user_id: &str) -> bool {
        self.hub.direct_available(&self.user_id, user_id)
    }

    async fn publish(&self, request: &PublishRequest) -> Result<DeliveryAck, TransportError> {
        if !self.hub.direct_available(&self.user_id, &request.recipient_id) {
            return Err(TransportError::Unreachable(request.recipient_id.clone()));
        }
        let ack = self.hub.record(TransportKind::Direct, request);
        let event = InboundEvent::from_request(request, ack.created_at);

        let clients = self.hub.inner.clients.lock();
        let client = clients
            .get(&request.recipient_id)
            .ok_or_else(|| TransportError::Unreachable(request.recipient_id.clone()))?;
        client
            .inbound
            .send(event)
            .map_err(|_| TransportError::Closed)?;
        Ok(ack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::envelope::MessageType;
    use crate::protocol::messages::PublishPayload;

    fn request(from: &str, to: &str, message_id: &str) -> PublishRequest {
        PublishRequest::new(
            from.to_string(),
            Some(1),
            to.to_string(),
            PublishPayload::Message {
                message_id: message_id.to_string(),
                message_type: MessageType::Text,
                envelope: None,
                text: Some("hi".to_string()),
            },
        )
    }

    #[tokio::test]
    async fn test_store_and_forward() {
        let hub = MemoryHub::new();
        let mut bob_rx = hub.register("bob");
        hub.set_online("bob", false);

        let relay = hub.relay("alice");
        relay.publish(&request("alice", "bob", "m1")).await.unwrap();
        assert_eq!(hub.mailbox_len("bob"), 1);
        assert!(bob_rx.try_recv().is_err());

        hub.set_online("bob", true);
        let event = bob_rx.recv().await.unwrap();
        assert_eq!(event.sender_id, "alice");
        assert_eq!(event.recipient_id, "bob");
        assert_eq!(hub.mailbox_len("bob"), 0);
    }

    #[tokio::test]
    async fn test_relay_offline_rejects_publish() {
        let hub = MemoryHub::new();
        hub.set_relay_online(false);

        let result = hub.relay("alice").publish(&request("alice", "bob", "m1")).await;
        assert!(matches!(result, Err(TransportError::NotConnected(_))));
        assert!(hub.published().is_empty());
    }

    #[tokio::test]
    async fn test_created_at_is_strictly_increasing() {
        let hub = MemoryHub::new();
        let relay = hub.relay("alice");

        let mut last = 0;
        for i in 0..20 {
            let ack = relay
                .publish(&request("alice", "bob", &format!("m{}", i)))
                .await
                .unwrap();
            assert!(ack.created_at > last);
            last = ack.created_at;
        }
    }

    #[tokio::test]
    async fn test_direct_requires_online_recipient() {
        let hub = MemoryHub::new();
        let direct = hub.direct("alice");
        assert!(!direct.is_reachable("bob").await);

        let _bob_rx = hub.register("bob");
        assert!(direct.is_reachable("bob").await);

        hub.set_direct_online("bob", false);
        let result = direct.publish(&request("alice", "bob", "m1")).await;
        assert!(matches!(result, Err(TransportError::Unreachable(_))));
    }
}
