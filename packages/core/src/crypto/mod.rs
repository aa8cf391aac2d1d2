//! Криптографический модуль
//!
//! # Архитектура
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      SyncReconciler                         │
//! └─────────────────────────────────────────────────────────────┘
//!                │                              │
//!                ▼                              ▼
//! ┌───────────────────────────┐  ┌──────────────────────────────┐
//! │  SessionCipher (v1)       │  │  SessionManager (v2)         │
//! │  - static ECDH per msg    │  │  - X3DH + one-time pre-key   │
//! │  - HKDF → AEAD key        │  │  - Double Ratchet per device │
//! └───────────────────────────┘  └──────────────────────────────┘
//!                │                              │
//!                └──────────────┬───────────────┘
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  KeyStore: identity, signed pre-key, one-time pre-keys      │
//! │  (persisted only through SecureStorage)                     │
//! └─────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │              CryptoProvider (Crypto-Agility)                │
//! │  - DH (X25519)   - Signatures (Ed25519)                     │
//! │  - AEAD (ChaCha20-Poly1305)   - KDF (HKDF-SHA256)           │
//! └─────────────────────────────────────────────────────────────┘
//! ```

// ============================================================================
// Core Traits
// ============================================================================

/// CryptoProvider trait для crypto-agility
pub mod provider;

/// Key Agreement (X3DH)
pub mod handshake;

/// Secure Messaging (Double Ratchet)
pub mod messaging;

// ============================================================================
// Implementations
// ============================================================================

/// Криптографические наборы
pub mod suites;

// ============================================================================
// Keys and sessions
// ============================================================================

pub mod keys;

pub mod key_store;

pub mod master_key;

pub mod session_cipher;

pub mod sessions;

// ============================================================================
// Re-exports для удобства
// ============================================================================

pub use key_store::KeyStore;
pub use provider::{CryptoProvider, SecretBytes};
pub use session_cipher::SessionCipher;
pub use sessions::{PeerAddress, SessionManager, SessionState};

pub type SuiteID = u16;
