// In-memory key directory (тесты и локальная разработка)

use super::{DirectoryError, KeyDirectory};
use crate::crypto::keys::PublicKeyBundle;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub struct MemoryKeyDirectory {
    bundles: Mutex<BTreeMap<(String, u32), PublicKeyBundle>>,
    available: AtomicBool,
    requests: AtomicUsize,
    fetches: AtomicUsize,
}

impl Default for MemoryKeyDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKeyDirectory {
    pub fn new() -> Self {
        Self {
            bundles: Mutex::new(BTreeMap::new()),
            available: AtomicBool::new(true),
            requests: AtomicUsize::new(0),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Положить bundle без проверок (например, с испорченной подписью)
    pub fn insert_unchecked(&self, bundle: PublicKeyBundle) {
        self.bundles
            .lock()
            .insert((bundle.user_id.clone(), bundle.device_id), bundle);
    }

    /// Сколько one-time pre-keys ещё можно выдать
    pub fn remaining_one_time_keys(&self, user_id: &str, device_id: u32) -> usize {
        self.bundles
            .lock()
            .get(&(user_id.to_string(), device_id))
            .map_or(0, |bundle| bundle.one_time_pre_keys.len())
    }

    /// Все вызовы, включая неудачные
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Успешные fetch_bundle
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), DirectoryError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DirectoryError::Unavailable("directory offline".to_string()))
        }
    }
}

#[async_trait]
impl KeyDirectory for MemoryKeyDirectory {
    async fn publish_bundle(
        &self,
        device_id: u32,
        bundle: &PublicKeyBundle,
    ) -> Result<(), DirectoryError> {
        self.check_available()?;
        if bundle.device_id != device_id {
            return Err(DirectoryError::Rejected(format!(
                "device id mismatch: {} != {}",
                bundle.device_id, device_id
            )));
        }
        bundle
            .validate()
            .map_err(|e| DirectoryError::Rejected(e.to_string()))?;

        self.insert_unchecked(bundle.clone());
        Ok(())
    }

    async fn fetch_bundle(
        &self,
        user_id: &str,
        device_id: u32,
    ) -> Result<Option<PublicKeyBundle>, DirectoryError> {
        self.check_available()?;
        let mut bundles = self.bundles.lock();
        let Some(stored) = bundles.get_mut(&(user_id.to_string(), device_id)) else {
            return Ok(None);
        };
        self.fetches.fetch_add(1, Ordering::SeqCst);

        let mut handed_out = stored.without_one_time_pre_keys();
        if !stored.one_time_pre_keys.is_empty() {
            handed_out
                .one_time_pre_keys
                .push(stored.one_time_pre_keys.remove(0));
        }
        Ok(Some(handed_out))
    }

    async fn list_devices(&self, user_id: &str) -> Result<Vec<u32>, DirectoryError> {
        self.check_available()?;
        Ok(self
            .bundles
            .lock()
            .keys()
            .filter(|(user, _)| user == user_id)
            .map(|(_, device)| *device)
            .collect())
    }
}
