// KV backend: общий интерфейс для sled и in-memory хранилища

use crate::utils::error::{CoreError, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Ключи: строки с префиксами (`msg/`, `queue/`, `secure/`), значения: байты.
/// `scan_prefix` возвращает записи в лексикографическом порядке ключей.
pub trait StorageBackend: Send + Sync {
    fn put(&self, key: &str, value: &[u8]) -> Result<()>;
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn remove(&self, key: &str) -> Result<()>;
    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;

    fn count_prefix(&self, prefix: &str) -> Result<usize> {
        Ok(self.scan_prefix(prefix)?.len())
    }

    fn flush(&self) -> Result<()>;
}

/// In-memory хранилище для тестов и эфемерных сессий
#[derive(Clone, Default)]
pub struct MemoryStorage {
    data: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

impl StorageBackend for MemoryStorage {
    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.data.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.data.read().get(key).cloned())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.data.write().remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        Ok(self
            .data
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn count_prefix(&self, prefix: &str) -> Result<usize> {
        Ok(self
            .data
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .count())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Durable backend on top of sled
#[derive(Clone)]
pub struct SledStorage {
    db: sled::Db,
}

fn sled_error(e: sled::Error) -> CoreError {
    CoreError::StorageError(e.to_string())
}

impl SledStorage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path).map_err(sled_error)?;
        Ok(Self { db })
    }

    /// Temporary database, removed when dropped.
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(sled_error)?;
        Ok(Self { db })
    }
}

impl StorageBackend for SledStorage {
    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.db.insert(key.as_bytes(), value).map_err(sled_error)?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let value = self.db.get(key.as_bytes()).map_err(sled_error)?;
        Ok(value.map(|ivec| ivec.to_vec()))
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.db.remove(key.as_bytes()).map_err(sled_error)?;
        Ok(())
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let mut results = Vec::new();
        for item in self.db.scan_prefix(prefix.as_bytes()) {
            let (k, v) = item.map_err(sled_error)?;
            let key = String::from_utf8(k.to_vec())
                .map_err(|e| CoreError::StorageError(format!("Non UTF-8 key: {}", e)))?;
            results.push((key, v.to_vec()));
        }
        Ok(results)
    }

    fn count_prefix(&self, prefix: &str) -> Result<usize> {
        Ok(self.db.scan_prefix(prefix.as_bytes()).count())
    }

    fn flush(&self) -> Result<()> {
        self.db.flush().map_err(sled_error)?;
        Ok(())
    }
}
