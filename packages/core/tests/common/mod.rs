// Общая обвязка интеграционных тестов: in-process relay, directory и устройства

#![allow(dead_code)]

use parley_core::crypto::master_key::generate_master_key;
use parley_core::directory::MemoryKeyDirectory;
use parley_core::protocol::messages::InboundEvent;
use parley_core::storage::{EncryptedStorage, MemoryStorage, SecureStorage, StorageBackend};
use parley_core::sync::InboundOutcome;
use parley_core::transport::{CompositeTransport, InboundReceiver, MemoryHub};
use parley_core::{Config, ReconcilerDeps, SyncReconciler};
use std::sync::Arc;
use std::time::Duration;

/// Короткие таймауты, чтобы тесты не ждали секундами
pub fn test_config() -> Config {
    Config {
        one_time_prekey_batch: 5,
        retry_initial_ms: 10,
        retry_max_ms: 40,
        retry_tick_ms: 10,
        publish_timeout_ms: 1_000,
        directory_fetch_attempts: 1,
        ..Config::default()
    }
}

pub struct Device {
    pub reconciler: Arc<SyncReconciler>,
    pub inbound: InboundReceiver,
    pub backend: Arc<dyn StorageBackend>,
    pub secure: Arc<dyn SecureStorage>,
}

impl Device {
    /// Обработать всё, что уже лежит во входящем канале
    pub async fn pump(&mut self) -> Vec<InboundOutcome> {
        let mut outcomes = Vec::new();
        while let Ok(event) = self.inbound.try_recv() {
            outcomes.push(self.reconciler.handle_inbound(event).await.unwrap());
        }
        outcomes
    }

    pub fn next_event(&mut self) -> InboundEvent {
        self.inbound.try_recv().expect("no inbound event")
    }
}

pub struct Network {
    pub hub: MemoryHub,
    pub directory: Arc<MemoryKeyDirectory>,
}

impl Network {
    pub fn new() -> Self {
        parley_core::utils::logging::init_with_default("parley_core=error");
        Self {
            hub: MemoryHub::new(),
            directory: Arc::new(MemoryKeyDirectory::new()),
        }
    }

    pub async fn device(&self, user_id: &str, config: Config) -> Device {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryStorage::new());
        let secure: Arc<dyn SecureStorage> = Arc::new(EncryptedStorage::new(
            Arc::new(MemoryStorage::new()),
            generate_master_key(),
        ));
        self.device_with_storage(user_id, config, backend, secure).await
    }

    /// Устройство поверх существующего хранилища (перезапуск клиента)
    pub async fn device_with_storage(
        &self,
        user_id: &str,
        config: Config,
        backend: Arc<dyn StorageBackend>,
        secure: Arc<dyn SecureStorage>,
    ) -> Device {
        let inbound = self.hub.register(user_id);
        let transport = CompositeTransport::new(
            Some(Arc::new(self.hub.direct(user_id))),
            Arc::new(self.hub.relay(user_id)),
        );

        let reconciler = SyncReconciler::new(ReconcilerDeps {
            config,
            user_id: user_id.to_string(),
            backend: backend.clone(),
            secure_storage: secure.clone(),
            directory: self.directory.clone(),
            transport: Arc::new(transport),
        })
        .unwrap();
        reconciler.publish_identity().await.unwrap();

        Device {
            reconciler: Arc::new(reconciler),
            inbound,
            backend,
            secure,
        }
    }

    /// Клиент полностью без сети: ни relay, ни прямых соединений
    pub fn disconnect(&self, user_id: &str) {
        self.hub.set_online(user_id, false);
        self.hub.set_direct_online(user_id, false);
    }

    pub fn reconnect(&self, user_id: &str) {
        self.hub.set_direct_online(user_id, true);
        self.hub.set_online(user_id, true);
    }
}

/// Подождать, пока сработает backoff
pub async fn wait_for_retry(config: &Config) {
    tokio::time::sleep(Duration::from_millis(config.retry_max_ms * 2)).await;
}
