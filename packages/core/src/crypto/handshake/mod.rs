//! Key Agreement Protocols
//!
//! Установка общего root key между двумя устройствами без предварительного
//! обмена секретами.
//!
//! ## Dataflow
//! ```text
//! Alice (инициатор)                          Bob (получатель)
//! ==================                         =================
//!
//! 1. Получает Bob's PublicKeyBundle из directory
//! 2. KeyAgreement::perform_as_initiator()
//!    → (root_key, InitiatorState)
//! 3. InitiatorState.ephemeral_private становится
//!    первым DH ratchet key
//!
//!                                            1. Получает первое сообщение с handshake header
//!                                            2. Находит signed pre-key и one-time pre-key по id
//!                                            3. KeyAgreement::perform_as_responder()
//!                                               → root_key (тот же!)
//! ```

use crate::crypto::provider::{CryptoProvider, SecretBytes};
use crate::crypto::keys::PublicKeyBundle;
use crate::error::CryptoError;

/// Состояние инициатора после key agreement
///
/// `ephemeral_private` is reused as the first DH ratchet key, so the responder
/// can recover it from the first message header.
pub struct InitiatorState {
    pub ephemeral_private: SecretBytes,
    pub ephemeral_public: Vec<u8>,
    pub signed_pre_key_id: u32,
    pub one_time_pre_key_id: Option<u32>,
}

/// Private keys the responder needs to answer a handshake.
pub struct ResponderKeys<'a> {
    pub identity_private: &'a [u8],
    pub signed_pre_key_private: &'a [u8],
    pub one_time_pre_key_private: Option<&'a [u8]>,
}

/// Протокол установки ключей (Key Agreement)
///
/// Отвечает только за root key. Шифрование делает SecureMessaging,
/// хранение ключей делает KeyStore.
pub trait KeyAgreement<P: CryptoProvider> {
    /// Выполнить handshake как инициатор (Alice)
    ///
    /// When `verify_signature` is set, a bad signed pre-key signature aborts
    /// the handshake before any DH is computed.
    fn perform_as_initiator(
        local_identity_private: &[u8],
        remote_bundle: &PublicKeyBundle,
        verify_signature: bool,
    ) -> Result<(SecretBytes, InitiatorState), CryptoError>;

    /// Выполнить handshake как получатель (Bob)
    fn perform_as_responder(
        local: &ResponderKeys<'_>,
        remote_identity_public: &[u8],
        remote_ephemeral_public: &[u8],
    ) -> Result<SecretBytes, CryptoError>;
}

pub mod x3dh;

pub use x3dh::X3DHProtocol;
