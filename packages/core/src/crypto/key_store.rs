//! KeyStore: ключи устройства в защищённом хранилище
//!
//! `ensure_identity` создаёт identity один раз и дальше только читает его.
//! Любая ошибка хранилища или повреждённая запись превращается в
//! `KeyInitializationFailed`: отправка и приём без ключей невозможны,
//! in-memory подмены нет.

use crate::config::Config;
use crate::crypto::keys::{DeviceKeyBundle, OneTimePreKey, PublicKeyBundle, SignedPreKey};
use crate::crypto::provider::CryptoProvider;
use crate::crypto::suites::classic::ClassicSuiteProvider;
use crate::storage::secure::SecureStorage;
use crate::utils::error::{CoreError, Result};
use crate::utils::serialization;
use parking_lot::Mutex;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, info, warn};

const DEVICE_BUNDLE_KEY: &str = "keystore/device_bundle";

pub struct KeyStore<P: CryptoProvider = ClassicSuiteProvider> {
    storage: Arc<dyn SecureStorage>,
    // Mutex также сериализует расход one-time pre-keys
    bundle: Mutex<Option<DeviceKeyBundle>>,
    _phantom: PhantomData<P>,
}

impl<P: CryptoProvider> KeyStore<P> {
    pub fn new(storage: Arc<dyn SecureStorage>) -> Self {
        Self {
            storage,
            bundle: Mutex::new(None),
            _phantom: PhantomData,
        }
    }

    /// Загрузить или создать ключи устройства.
    ///
    /// Idempotent: an existing bundle is returned unchanged.
    pub fn ensure_identity(&self) -> Result<DeviceKeyBundle> {
        let mut guard = self.bundle.lock();
        if let Some(bundle) = guard.as_ref() {
            return Ok(bundle.clone());
        }

        let stored = self
            .storage
            .get(DEVICE_BUNDLE_KEY)
            .map_err(|e| CoreError::KeyInitializationFailed(format!("read failed: {}", e)))?;

        let bundle = match stored {
            Some(bytes) => {
                let bundle: DeviceKeyBundle = serialization::from_bytes(&bytes).map_err(|e| {
                    CoreError::KeyInitializationFailed(format!("corrupted device bundle: {}", e))
                })?;
                debug!(
                    target: "crypto::key_store",
                    device_id = bundle.device_id,
                    identity = %crate::crypto::keys::fingerprint(&bundle.identity.dh_public),
                    "Loaded device identity"
                );
                bundle
            }
            None => {
                let bundle =
                    DeviceKeyBundle::generate::<P>(Config::global().one_time_prekey_batch)
                        .map_err(|e| CoreError::KeyInitializationFailed(e.to_string()))?;
                self.persist(&bundle)
                    .map_err(|e| CoreError::KeyInitializationFailed(format!("write failed: {}", e)))?;
                info!(
                    target: "crypto::key_store",
                    device_id = bundle.device_id,
                    one_time_pre_keys = bundle.one_time_pre_keys.len(),
                    "Generated new device identity"
                );
                bundle
            }
        };

        *guard = Some(bundle.clone());
        Ok(bundle)
    }

    fn persist(&self, bundle: &DeviceKeyBundle) -> Result<()> {
        let bytes = zeroize::Zeroizing::new(serialization::to_bytes(bundle)?);
        self.storage.set(DEVICE_BUNDLE_KEY, &bytes)
    }

    fn with_bundle<T>(&self, f: impl FnOnce(&DeviceKeyBundle) -> T) -> Result<T> {
        let guard = self.bundle.lock();
        match guard.as_ref() {
            Some(bundle) => Ok(f(bundle)),
            None => {
                drop(guard);
                let bundle = self.ensure_identity()?;
                Ok(f(&bundle))
            }
        }
    }

    /// Публичная проекция для key directory
    pub fn public_bundle(&self, user_id: &str) -> Result<PublicKeyBundle> {
        self.with_bundle(|b| b.public_bundle::<P>(user_id))
    }

    pub fn device_id(&self) -> Result<u32> {
        self.with_bundle(|b| b.device_id)
    }

    pub fn identity_public(&self) -> Result<Vec<u8>> {
        self.with_bundle(|b| b.identity.dh_public.clone())
    }

    pub fn identity_private(&self) -> Result<zeroize::Zeroizing<Vec<u8>>> {
        self.with_bundle(|b| zeroize::Zeroizing::new(b.identity.dh_private.clone()))
    }

    pub fn signed_pre_key(&self, key_id: u32) -> Result<Option<SignedPreKey>> {
        self.with_bundle(|b| b.signed_pre_key_by_id(key_id).cloned())
    }

    pub fn one_time_pre_key(&self, key_id: u32) -> Result<Option<OneTimePreKey>> {
        self.with_bundle(|b| b.one_time_pre_key(key_id).cloned())
    }

    pub fn one_time_pre_key_count(&self) -> Result<usize> {
        self.with_bundle(|b| b.one_time_pre_keys.len())
    }

    /// Удалить использованный one-time pre-key и сохранить bundle.
    pub fn take_one_time_pre_key(&self, key_id: u32) -> Result<Option<OneTimePreKey>> {
        self.ensure_identity()?;
        let mut guard = self.bundle.lock();
        let Some(bundle) = guard.as_mut() else {
            return Err(CoreError::KeyInitializationFailed(
                "device bundle not loaded".to_string(),
            ));
        };

        let mut updated = bundle.clone();
        let taken = updated.take_one_time_pre_key(key_id);
        if taken.is_some() {
            self.persist(&updated)?;
            *bundle = updated;
            debug!(
                target: "crypto::key_store",
                key_id,
                remaining = bundle.one_time_pre_keys.len(),
                "Consumed one-time pre-key"
            );
        } else {
            warn!(target: "crypto::key_store", key_id, "One-time pre-key not found");
        }
        Ok(taken)
    }

    /// Догенерировать one-time pre-keys до `target`.
    ///
    /// Returns the number of keys added. The caller decides when to call this
    /// and republishes the bundle.
    pub fn replenish_one_time_pre_keys(&self, target: usize) -> Result<usize> {
        self.ensure_identity()?;
        let mut guard = self.bundle.lock();
        let Some(bundle) = guard.as_mut() else {
            return Err(CoreError::KeyInitializationFailed(
                "device bundle not loaded".to_string(),
            ));
        };

        let missing = target.saturating_sub(bundle.one_time_pre_keys.len());
        if missing == 0 {
            return Ok(0);
        }

        let mut updated = bundle.clone();
        updated.generate_one_time_pre_keys::<P>(missing as u32)?;
        self.persist(&updated)?;
        *bundle = updated;

        info!(
            target: "crypto::key_store",
            added = missing,
            total = bundle.one_time_pre_keys.len(),
            "Replenished one-time pre-keys"
        );
        Ok(missing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SecretBytes;
    use crate::storage::secure::EncryptedStorage;

    struct BrokenStorage;

    impl SecureStorage for BrokenStorage {
        fn get(&self, _key: &str) -> Result<Option<SecretBytes>> {
            Err(CoreError::StorageError("disk unavailable".to_string()))
        }
        fn set(&self, _key: &str, _value: &[u8]) -> Result<()> {
            Err(CoreError::StorageError("disk unavailable".to_string()))
        }
        fn remove(&self, _key: &str) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_ensure_identity_is_idempotent() {
        let storage: Arc<dyn SecureStorage> = Arc::new(EncryptedStorage::in_memory());
        let store = KeyStore::<ClassicSuiteProvider>::new(storage.clone());

        let first = store.ensure_identity().unwrap();
        let second = store.ensure_identity().unwrap();
        assert_eq!(first.device_id, second.device_id);
        assert_eq!(first.identity.dh_public, second.identity.dh_public);

        // Новый экземпляр над тем же хранилищем видит те же ключи
        let reopened = KeyStore::<ClassicSuiteProvider>::new(storage);
        let third = reopened.ensure_identity().unwrap();
        assert_eq!(first.registration_id, third.registration_id);
        assert_eq!(first.signed_pre_key.public, third.signed_pre_key.public);
    }

    #[test]
    fn test_storage_failure_is_key_initialization_failure() {
        let store = KeyStore::<ClassicSuiteProvider>::new(Arc::new(BrokenStorage));
        assert!(matches!(
            store.ensure_identity(),
            Err(CoreError::KeyInitializationFailed(_))
        ));
        assert!(store.public_bundle("alice").is_err());
    }

    #[test]
    fn test_corrupted_record_is_key_initialization_failure() {
        let storage = Arc::new(EncryptedStorage::in_memory());
        storage.set(DEVICE_BUNDLE_KEY, b"not a bundle").unwrap();

        let store = KeyStore::<ClassicSuiteProvider>::new(storage);
        assert!(matches!(
            store.ensure_identity(),
            Err(CoreError::KeyInitializationFailed(_))
        ));
    }

    #[test]
    fn test_take_and_replenish_one_time_pre_keys() {
        let storage: Arc<dyn SecureStorage> = Arc::new(EncryptedStorage::in_memory());
        let store = KeyStore::<ClassicSuiteProvider>::new(storage.clone());
        let bundle = store.ensure_identity().unwrap();
        let batch = bundle.one_time_pre_keys.len();
        let key_id = bundle.one_time_pre_keys[0].key_id;

        assert!(store.take_one_time_pre_key(key_id).unwrap().is_some());
        assert!(store.take_one_time_pre_key(key_id).unwrap().is_none());

        // Расход сохранён
        let reopened = KeyStore::<ClassicSuiteProvider>::new(storage);
        assert_eq!(reopened.one_time_pre_key_count().unwrap(), batch - 1);

        assert_eq!(reopened.replenish_one_time_pre_keys(batch).unwrap(), 1);
        assert_eq!(reopened.one_time_pre_key_count().unwrap(), batch);
        assert!(reopened.one_time_pre_key(key_id).unwrap().is_none());
    }

    #[test]
    fn test_public_bundle_has_no_private_material() {
        let store = KeyStore::<ClassicSuiteProvider>::new(Arc::new(EncryptedStorage::in_memory()));
        let bundle = store.ensure_identity().unwrap();
        let public = store.public_bundle("alice").unwrap();

        let json = serde_json::to_string(&public).unwrap();
        let private_b64 = crate::utils::b64::encode(&bundle.identity.dh_private);
        assert!(!json.contains(&private_b64));
        public.verify_signature::<ClassicSuiteProvider>().unwrap();
    }
}
