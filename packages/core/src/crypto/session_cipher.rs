//! SessionCipher: шифрование версии 1 (static ECDH)
//!
//! ```text
//! key        = HKDF-SHA256(X25519(local_identity_private, peer_public), info = "parley/static-ecdh/v1")
//! ciphertext = base64(nonce(12) || ChaCha20-Poly1305(key, nonce, plaintext))
//! ```
//!
//! Без forward secrecy: используется для совместимости со старыми
//! клиентами. Новые сессии идут через X3DH + Double Ratchet.

use crate::crypto::provider::{CryptoProvider, SecretBytes};
use crate::crypto::suites::classic::ClassicSuiteProvider;
use crate::utils::b64;
use crate::utils::error::{CoreError, Result};
use std::marker::PhantomData;
use tracing::trace;
use zeroize::Zeroizing;

const STATIC_ECDH_INFO: &[u8] = b"parley/static-ecdh/v1";
const STATIC_ECDH_AAD: &[u8] = b"parley-v1";

pub struct SessionCipher<P: CryptoProvider = ClassicSuiteProvider> {
    local_private: SecretBytes,
    _phantom: PhantomData<P>,
}

impl<P: CryptoProvider> SessionCipher<P> {
    pub fn from_identity(identity_private: &[u8]) -> Self {
        Self {
            local_private: Zeroizing::new(identity_private.to_vec()),
            _phantom: PhantomData,
        }
    }

    fn derive_key(&self, peer_public: &[u8]) -> std::result::Result<SecretBytes, crate::error::CryptoError> {
        let shared = P::dh(&self.local_private, peer_public)?;
        P::hkdf_derive_key(&[], &shared, STATIC_ECDH_INFO, 32)
    }

    /// Зашифровать текст для собеседника. Возвращает base64.
    pub fn encrypt(&self, plaintext: &str, recipient_public: &[u8]) -> Result<String> {
        let key = self
            .derive_key(recipient_public)
            .map_err(|e| CoreError::PeerKeyUnavailable(e.to_string()))?;
        let sealed = P::seal(&key, plaintext.as_bytes(), Some(STATIC_ECDH_AAD))?;

        trace!(
            target: "crypto::session_cipher",
            sealed_len = sealed.len(),
            "Encrypted static ECDH payload"
        );
        Ok(b64::encode(&sealed))
    }

    /// Расшифровать. Любая ошибка (base64, длина, tag, ключ, UTF-8) даёт
    /// `DecryptionFailed` без частичного результата.
    pub fn decrypt(&self, ciphertext: &str, sender_public: &[u8]) -> Result<String> {
        let sealed = b64::decode(ciphertext).map_err(CoreError::DecryptionFailed)?;
        let key = self
            .derive_key(sender_public)
            .map_err(|e| CoreError::DecryptionFailed(e.to_string()))?;
        let plaintext = P::open(&key, &sealed, Some(STATIC_ECDH_AAD))
            .map_err(|e| CoreError::DecryptionFailed(e.to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|_| CoreError::DecryptionFailed("plaintext is not UTF-8".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::IdentityKeyPair;

    type Cipher = SessionCipher<ClassicSuiteProvider>;

    fn pair() -> (IdentityKeyPair, IdentityKeyPair) {
        (
            IdentityKeyPair::generate::<ClassicSuiteProvider>().unwrap(),
            IdentityKeyPair::generate::<ClassicSuiteProvider>().unwrap(),
        )
    }

    #[test]
    fn test_roundtrip() {
        let (alice, bob) = pair();
        let ciphertext = Cipher::from_identity(&alice.dh_private)
            .encrypt("привет, Bob", &bob.dh_public)
            .unwrap();
        let plaintext = Cipher::from_identity(&bob.dh_private)
            .decrypt(&ciphertext, &alice.dh_public)
            .unwrap();
        assert_eq!(plaintext, "привет, Bob");
    }

    #[test]
    fn test_same_plaintext_differs() {
        let (alice, bob) = pair();
        let cipher = Cipher::from_identity(&alice.dh_private);
        let a = cipher.encrypt("hello", &bob.dh_public).unwrap();
        let b = cipher.encrypt("hello", &bob.dh_public).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_every_byte_tamper_detected() {
        let (alice, bob) = pair();
        let ciphertext = Cipher::from_identity(&alice.dh_private)
            .encrypt("integrity", &bob.dh_public)
            .unwrap();
        let raw = b64::decode(&ciphertext).unwrap();
        let receiver = Cipher::from_identity(&bob.dh_private);

        for i in 0..raw.len() {
            let mut tampered = raw.clone();
            tampered[i] ^= 0x80;
            let result = receiver.decrypt(&b64::encode(&tampered), &alice.dh_public);
            assert!(matches!(result, Err(CoreError::DecryptionFailed(_))), "byte {}", i);
        }
    }

    #[test]
    fn test_garbage_input() {
        let (alice, bob) = pair();
        let receiver = Cipher::from_identity(&bob.dh_private);

        for input in ["", "!!!not base64!!!", "AAAA"] {
            assert!(matches!(
                receiver.decrypt(input, &alice.dh_public),
                Err(CoreError::DecryptionFailed(_))
            ));
        }
        assert!(matches!(
            receiver.decrypt("AAAA", &[0u8; 5]),
            Err(CoreError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn test_wrong_sender_key() {
        let (alice, bob) = pair();
        let mallory = IdentityKeyPair::generate::<ClassicSuiteProvider>().unwrap();
        let ciphertext = Cipher::from_identity(&alice.dh_private)
            .encrypt("hi", &bob.dh_public)
            .unwrap();
        assert!(Cipher::from_identity(&bob.dh_private)
            .decrypt(&ciphertext, &mallory.dh_public)
            .is_err());
    }
}
