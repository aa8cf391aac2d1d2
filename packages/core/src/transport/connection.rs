//! Управление соединением с relay
//!
//! Сокет абстрагирован через [`RelayConnector`]/[`RelaySocket`], так что
//! один и тот же `RelayTransport` работает поверх WebSocket, TCP или
//! in-process пары каналов.

use super::TransportError;
use crate::sync::retry::Backoff;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Состояние соединения
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Двунаправленный канал кадров
#[async_trait]
pub trait RelaySocket: Send + Sync {
    async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError>;

    /// Следующий кадр; `None`, если соединение закрыто
    async fn recv(&self) -> Option<Vec<u8>>;
}

#[async_trait]
pub trait RelayConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn RelaySocket>, TransportError>;
}

pub struct ConnectionManager {
    connector: Arc<dyn RelayConnector>,
    socket: Mutex<Option<Arc<dyn RelaySocket>>>,
    /// Сериализует попытки подключения
    connect_lock: tokio::sync::Mutex<()>,
    state: watch::Sender<ConnectionState>,
    backoff: Mutex<Backoff>,
    /// Было ли хотя бы одно успешное подключение
    ever_connected: Mutex<bool>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn RelayConnector>, backoff: Backoff) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            connector,
            socket: Mutex::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
            state,
            backoff: Mutex::new(backoff),
            ever_connected: Mutex::new(false),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn current(&self) -> Option<Arc<dyn RelaySocket>> {
        self.socket.lock().clone()
    }

    fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
    }

    /// Вернуть текущий сокет или сделать одну попытку подключения
    pub async fn ensure_connected(&self) -> Result<Arc<dyn RelaySocket>, TransportError> {
        if let Some(socket) = self.current() {
            return Ok(socket);
        }

        let _guard = self.connect_lock.lock().await;
        // Пока ждали, подключился кто-то другой
        if let Some(socket) = self.current() {
            return Ok(socket);
        }

        let reconnecting = *self.ever_connected.lock();
        self.set_state(if reconnecting {
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Connecting
        });

        match self.connector.connect().await {
            Ok(socket) => {
                *self.socket.lock() = Some(socket.clone());
                *self.ever_connected.lock() = true;
                self.backoff.lock().reset();
                self.set_state(ConnectionState::Connected);
                info!(target: "transport::connection", reconnecting, "Relay connected");
                Ok(socket)
            }
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                warn!(target: "transport::connection", error = %e, "Relay connection failed");
                Err(e)
            }
        }
    }

    /// Сокет закрылся или отправка упала
    pub fn mark_disconnected(&self) {
        if self.socket.lock().take().is_some() {
            debug!(target: "transport::connection", "Relay socket dropped");
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Задержка перед следующей попыткой переподключения
    pub fn next_retry_delay(&self) -> Duration {
        self.backoff.lock().next_delay()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.backoff.lock().attempts()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    /// Один конец in-process соединения
    pub(crate) struct ChannelSocket {
        tx: mpsc::UnboundedSender<Vec<u8>>,
        rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    }

    #[async_trait]
    impl RelaySocket for ChannelSocket {
        async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
            self.tx.send(frame).map_err(|_| TransportError::Closed)
        }

        async fn recv(&self) -> Option<Vec<u8>> {
            self.rx.lock().await.recv().await
        }
    }

    /// Пара сокетов: клиентский и "серверный"
    pub(crate) fn socket_pair() -> (Arc<ChannelSocket>, Arc<ChannelSocket>) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            Arc::new(ChannelSocket {
                tx: a_tx,
                rx: tokio::sync::Mutex::new(a_rx),
            }),
            Arc::new(ChannelSocket {
                tx: b_tx,
                rx: tokio::sync::Mutex::new(b_rx),
            }),
        )
    }

    /// Connector, отдающий заранее подготовленные сокеты
    pub(crate) struct QueueConnector {
        pub sockets: Mutex<Vec<Arc<ChannelSocket>>>,
        pub available: AtomicBool,
        pub attempts: AtomicUsize,
    }

    impl QueueConnector {
        pub(crate) fn new(sockets: Vec<Arc<ChannelSocket>>) -> Self {
            Self {
                sockets: Mutex::new(sockets),
                available: AtomicBool::new(true),
                attempts: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl RelayConnector for QueueConnector {
        async fn connect(&self) -> Result<Arc<dyn RelaySocket>, TransportError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if !self.available.load(Ordering::SeqCst) {
                return Err(TransportError::NotConnected("relay down".to_string()));
            }
            let mut sockets = self.sockets.lock();
            if sockets.is_empty() {
                return Err(TransportError::NotConnected("no sockets left".to_string()));
            }
            let socket: Arc<dyn RelaySocket> = sockets.remove(0);
            Ok(socket)
        }
    }

    fn backoff() -> Backoff {
        Backoff::new(Duration::from_millis(10), Duration::from_millis(80), 0)
    }

    #[tokio::test]
    async fn test_connect_and_reuse() {
        let (client, _server) = socket_pair();
        let connector = Arc::new(QueueConnector::new(vec![client]));
        let manager = ConnectionManager::new(connector.clone(), backoff());
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        manager.ensure_connected().await.unwrap();
        manager.ensure_connected().await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_connect_and_backoff() {
        let connector = Arc::new(QueueConnector::new(Vec::new()));
        connector.available.store(false, Ordering::SeqCst);
        let manager = ConnectionManager::new(connector, backoff());

        assert!(manager.ensure_connected().await.is_err());
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        assert_eq!(manager.next_retry_delay(), Duration::from_millis(10));
        assert_eq!(manager.next_retry_delay(), Duration::from_millis(20));
        assert_eq!(manager.reconnect_attempts(), 2);
    }

    #[tokio::test]
    async fn test_reconnect_resets_backoff() {
        let (first, _s1) = socket_pair();
        let (second, _s2) = socket_pair();
        let connector = Arc::new(QueueConnector::new(vec![first, second]));
        let manager = ConnectionManager::new(connector, backoff());
        let mut states = manager.subscribe();

        manager.ensure_connected().await.unwrap();
        manager.mark_disconnected();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        manager.next_retry_delay();

        manager.ensure_connected().await.unwrap();
        assert_eq!(manager.reconnect_attempts(), 0);
        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), ConnectionState::Connected);
    }
}
