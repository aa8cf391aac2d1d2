// Защищённое хранилище для ключей и состояния сессий
// Каждая запись шифруется мастер-ключом (AES-256-GCM) до попадания в backend

use crate::config::Config;
use crate::crypto::master_key::{
    decrypt_data, derive_master_key, encrypt_data, generate_master_key, generate_salt, MasterKey,
};
use crate::crypto::SecretBytes;
use crate::storage::backend::{MemoryStorage, StorageBackend};
use crate::utils::error::{CoreError, Result};
use std::sync::Arc;
use tracing::debug;

const SECURE_PREFIX: &str = "secure/";
const SALT_KEY: &str = "meta/secure_salt";

/// Хранилище секретов (device bundle, сессии). Значения возвращаются
/// в `Zeroizing` буфере.
pub trait SecureStorage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<SecretBytes>>;
    fn set(&self, key: &str, value: &[u8]) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// [`SecureStorage`] поверх любого [`StorageBackend`]
///
/// Ключ записи используется как AAD, поэтому запись нельзя подменить
/// записью из другого слота.
pub struct EncryptedStorage {
    backend: Arc<dyn StorageBackend>,
    master_key: MasterKey,
}

impl EncryptedStorage {
    pub fn new(backend: Arc<dyn StorageBackend>, master_key: MasterKey) -> Self {
        Self {
            backend,
            master_key,
        }
    }

    /// Мастер-ключ из пароля. Соль создаётся при первом открытии и хранится
    /// в backend в открытом виде.
    pub fn from_password(backend: Arc<dyn StorageBackend>, password: &str) -> Result<Self> {
        let salt = match backend.get(SALT_KEY)? {
            Some(salt) if salt.len() == Config::global().salt_length => salt,
            Some(_) => {
                return Err(CoreError::StorageError(
                    "Stored salt has unexpected length".to_string(),
                ))
            }
            None => {
                let salt = generate_salt().to_vec();
                backend.put(SALT_KEY, &salt)?;
                backend.flush()?;
                debug!(target: "storage::secure", "Generated new storage salt");
                salt
            }
        };

        let master_key = derive_master_key(password, &salt)?;
        Ok(Self::new(backend, master_key))
    }

    /// Эфемерное хранилище со случайным ключом
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStorage::new()), generate_master_key())
    }

    fn slot(key: &str) -> String {
        format!("{}{}", SECURE_PREFIX, key)
    }
}

impl SecureStorage for EncryptedStorage {
    fn get(&self, key: &str) -> Result<Option<SecretBytes>> {
        let slot = Self::slot(key);
        match self.backend.get(&slot)? {
            Some(sealed) => {
                let plaintext = decrypt_data(&self.master_key, &sealed, slot.as_bytes())
                    .map_err(|e| CoreError::StorageError(format!("{}: {}", key, e)))?;
                Ok(Some(plaintext))
            }
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let slot = Self::slot(key);
        let sealed = encrypt_data(&self.master_key, value, slot.as_bytes())?;
        self.backend.put(&slot, &sealed)?;
        self.backend.flush()
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.backend.remove(&Self::slot(key))?;
        self.backend.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_values_are_encrypted_at_rest() {
        let backend = Arc::new(MemoryStorage::new());
        let storage = EncryptedStorage::new(backend.clone(), generate_master_key());

        storage.set("keystore/device_bundle", b"private material").unwrap();

        let raw = backend.get("secure/keystore/device_bundle").unwrap().unwrap();
        assert!(!raw
            .windows(b"private material".len())
            .any(|w| w == b"private material"));

        let loaded = storage.get("keystore/device_bundle").unwrap().unwrap();
        assert_eq!(loaded.as_slice(), b"private material");
    }

    #[test]
    fn test_password_storage_reopens() {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryStorage::new());

        let storage = EncryptedStorage::from_password(backend.clone(), "correct horse").unwrap();
        storage.set("a", b"value").unwrap();

        let reopened = EncryptedStorage::from_password(backend.clone(), "correct horse").unwrap();
        assert_eq!(reopened.get("a").unwrap().unwrap().as_slice(), b"value");

        let wrong = EncryptedStorage::from_password(backend, "battery staple").unwrap();
        assert!(wrong.get("a").is_err());
    }

    #[test]
    fn test_swapped_records_are_rejected() {
        let backend = Arc::new(MemoryStorage::new());
        let storage = EncryptedStorage::new(backend.clone(), generate_master_key());

        storage.set("a", b"first").unwrap();
        storage.set("b", b"second").unwrap();

        let sealed_a = backend.get("secure/a").unwrap().unwrap();
        backend.put("secure/b", &sealed_a).unwrap();
        assert!(storage.get("b").is_err());
    }

    #[test]
    fn test_remove() {
        let storage = EncryptedStorage::in_memory();
        storage.set("a", b"value").unwrap();
        storage.remove("a").unwrap();
        assert!(storage.get("a").unwrap().is_none());
    }
}
