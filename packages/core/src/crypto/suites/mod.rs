//! Криптографические наборы (Crypto Suites)
//!
//! ### Classic Suite
//! - **DH**: X25519
//! - **Signatures**: Ed25519
//! - **AEAD**: ChaCha20-Poly1305
//! - **KDF**: HKDF-SHA256
//! - **Suite ID**: 1
//!
//! ```rust
//! use parley_core::crypto::suites::classic::ClassicSuiteProvider;
//! use parley_core::crypto::provider::CryptoProvider;
//!
//! let (private_key, public_key) = ClassicSuiteProvider::generate_dh_keypair().unwrap();
//! assert_eq!(public_key.len(), 32);
//! # drop(private_key);
//! ```

pub mod classic;
