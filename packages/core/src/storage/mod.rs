// Модуль хранилища
//
// backend    - KV слой (sled / память)
// secure     - зашифрованные записи поверх backend (ключи, сессии)
// message_store / queue - журнал сообщений и очередь исходящих

pub mod backend;
pub mod message_store;
pub mod models;
pub mod queue;
pub mod secure;

pub use backend::{MemoryStorage, SledStorage, StorageBackend};
pub use message_store::{OfflineMessageStore, StoreEvent};
pub use queue::OperationQueue;
pub use secure::{EncryptedStorage, SecureStorage};
