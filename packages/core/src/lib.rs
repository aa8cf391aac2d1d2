// Parley Core
// Offline-first message pipeline with end-to-end encryption

#![warn(clippy::all)]
#![allow(clippy::too_many_arguments)]

// Модули
pub mod config;
pub mod crypto;
pub mod directory;
pub mod error;
pub mod protocol;
pub mod state;
pub mod storage;
pub mod sync;
pub mod transport;
pub mod utils;

// Re-exports для удобства
pub use config::Config;
pub use sync::{ReconcilerDeps, SyncReconciler};
pub use utils::error::{CoreError, Result};
