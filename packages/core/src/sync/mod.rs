//! Синхронизация: очередь исходящих, повторы, приём входящих

pub mod reconciler;
pub mod retry;

pub use reconciler::{InboundOutcome, ReconcilerDeps, SyncReconciler, DECRYPTION_FAILED_TEXT, OTHER_DEVICE_TEXT};
pub use retry::{Backoff, RetryPolicy};
