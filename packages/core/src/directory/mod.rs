//! Key directory: публикация и получение публичных ключей устройств
//!
//! [`KeyDirectory`] это сетевой сервис (или его заглушка), [`KeyDirectoryClient`]
//! добавляет поверх него кэш, повторы с backoff и проверку подписи
//! signed pre-key.

pub mod memory;

use crate::crypto::keys::PublicKeyBundle;
use crate::crypto::provider::CryptoProvider;
use crate::crypto::suites::classic::ClassicSuiteProvider;
use crate::sync::retry::Backoff;
use crate::utils::error::{CoreError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

pub use memory::MemoryKeyDirectory;

const RETRY_INITIAL: Duration = Duration::from_millis(200);
const RETRY_MAX: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectoryError {
    #[error("directory unavailable: {0}")]
    Unavailable(String),

    #[error("rejected bundle: {0}")]
    Rejected(String),
}

impl From<DirectoryError> for CoreError {
    fn from(err: DirectoryError) -> Self {
        CoreError::PeerKeyUnavailable(err.to_string())
    }
}

#[async_trait]
pub trait KeyDirectory: Send + Sync {
    async fn publish_bundle(
        &self,
        device_id: u32,
        bundle: &PublicKeyBundle,
    ) -> std::result::Result<(), DirectoryError>;

    /// Bundle устройства. Сервис отдаёт не больше одного one-time pre-key
    /// и больше его не выдаёт.
    async fn fetch_bundle(
        &self,
        user_id: &str,
        device_id: u32,
    ) -> std::result::Result<Option<PublicKeyBundle>, DirectoryError>;

    async fn list_devices(&self, user_id: &str) -> std::result::Result<Vec<u32>, DirectoryError>;
}

pub struct KeyDirectoryClient<P: CryptoProvider = ClassicSuiteProvider> {
    directory: Arc<dyn KeyDirectory>,
    /// (user, device) → bundle без one-time pre-keys
    cache: Mutex<HashMap<(String, u32), PublicKeyBundle>>,
    verify_signatures: bool,
    max_attempts: u32,
    _phantom: PhantomData<P>,
}

impl<P: CryptoProvider> KeyDirectoryClient<P> {
    pub fn new(directory: Arc<dyn KeyDirectory>, verify_signatures: bool, max_attempts: u32) -> Self {
        Self {
            directory,
            cache: Mutex::new(HashMap::new()),
            verify_signatures,
            max_attempts: max_attempts.max(1),
            _phantom: PhantomData,
        }
    }

    async fn with_retry<T, F, Fut>(&self, what: &str, mut call: F) -> std::result::Result<T, DirectoryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, DirectoryError>>,
    {
        let mut backoff = Backoff::new(RETRY_INITIAL, RETRY_MAX, self.max_attempts);
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    let delay = backoff.next_delay();
                    if !backoff.can_retry() {
                        warn!(target: "directory", what, attempts = backoff.attempts(), error = %e, "Directory call failed");
                        return Err(e);
                    }
                    debug!(target: "directory", what, error = %e, delay_ms = delay.as_millis() as u64, "Retrying directory call");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Опубликовать bundle своего устройства
    pub async fn publish_own(&self, bundle: &PublicKeyBundle) -> Result<()> {
        bundle.validate()?;
        self.with_retry("publish", || self.directory.publish_bundle(bundle.device_id, bundle))
            .await?;
        info!(
            target: "directory",
            device_id = bundle.device_id,
            one_time_pre_keys = bundle.one_time_pre_keys.len(),
            "Published key bundle"
        );
        Ok(())
    }

    /// Основное устройство пользователя (наименьший device id)
    pub async fn resolve_device(&self, user_id: &str) -> Result<u32> {
        if let Some(device_id) = self.cached_device(user_id) {
            return Ok(device_id);
        }
        let devices = self
            .with_retry("list_devices", || self.directory.list_devices(user_id))
            .await?;
        devices
            .into_iter()
            .min()
            .ok_or_else(|| CoreError::PeerKeyUnavailable(format!("no devices for {}", user_id)))
    }

    fn cached_device(&self, user_id: &str) -> Option<u32> {
        self.cache
            .lock()
            .keys()
            .filter(|(user, _)| user == user_id)
            .map(|(_, device)| *device)
            .min()
    }

    /// Bundle из кэша или из directory. One-time pre-key в нём может не быть.
    pub async fn resolve(&self, user_id: &str, device_id: u32) -> Result<PublicKeyBundle> {
        if let Some(bundle) = self.cached(user_id, device_id) {
            return Ok(bundle);
        }
        self.fetch_fresh(user_id, device_id).await
    }

    /// Всегда идти в directory: нужен для нового handshake, чтобы
    /// получить свежий one-time pre-key.
    pub async fn fetch_fresh(&self, user_id: &str, device_id: u32) -> Result<PublicKeyBundle> {
        let bundle = self
            .with_retry("fetch_bundle", || self.directory.fetch_bundle(user_id, device_id))
            .await?
            .ok_or_else(|| {
                CoreError::PeerKeyUnavailable(format!("no bundle for {}.{}", user_id, device_id))
            })?;

        if bundle.user_id != user_id || bundle.device_id != device_id {
            return Err(CoreError::PeerKeyUnavailable(format!(
                "directory returned bundle for {}.{}",
                bundle.user_id, bundle.device_id
            )));
        }
        bundle
            .validate()
            .map_err(|e| CoreError::PeerKeyUnavailable(e.to_string()))?;
        if self.verify_signatures {
            bundle.verify_signature::<P>().map_err(|e| {
                warn!(target: "directory", user_id = %user_id, device_id, "Signed pre-key signature rejected");
                CoreError::PeerKeyUnavailable(format!("invalid signed pre-key signature: {}", e))
            })?;
        }

        self.remember(&bundle);
        Ok(bundle)
    }

    fn remember(&self, bundle: &PublicKeyBundle) {
        let key = (bundle.user_id.clone(), bundle.device_id);
        let mut cache = self.cache.lock();
        if let Some(previous) = cache.get(&key) {
            if previous.identity_public != bundle.identity_public {
                warn!(
                    target: "directory",
                    user_id = %bundle.user_id,
                    device_id = bundle.device_id,
                    old = %previous.fingerprint(),
                    new = %bundle.fingerprint(),
                    "Identity key changed"
                );
            }
        }
        cache.insert(key, bundle.without_one_time_pre_keys());
    }

    pub fn cached(&self, user_id: &str, device_id: u32) -> Option<PublicKeyBundle> {
        self.cache
            .lock()
            .get(&(user_id.to_string(), device_id))
            .cloned()
    }

    /// Забыть все устройства пользователя
    pub fn invalidate(&self, user_id: &str) {
        self.cache.lock().retain(|(user, _), _| user != user_id);
    }
}
