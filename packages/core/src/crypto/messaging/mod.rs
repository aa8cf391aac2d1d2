//! Secure Messaging Protocols
//!
//! ## Протоколы
//! - **Double Ratchet**: per-message keys, DH ratchet на каждом "turn"
//!
//! ## Dataflow
//! ```text
//! Alice (инициатор)                          Bob (получатель)
//! ==================                         =================
//!
//! new_initiator_session(root_key, initiator_state, SPK_B)
//!   → первый ratchet key = EK_A
//! encrypt(msg1) ───────────────────────────→ new_responder_session(root_key, SPK_B_priv, msg1)
//!                                              → DH ratchet step, plaintext(msg1)
//!                ←─────────────────────────── encrypt(msg2) с новым DH ключом
//! decrypt(msg2): DH ratchet step
//! ```

use crate::crypto::handshake::InitiatorState;
use crate::crypto::provider::CryptoProvider;
use crate::error::CryptoError;

/// Протокол защищённого обмена сообщениями
///
/// Не отвечает за handshake (это KeyAgreement) и за хранение сессий
/// (это SessionManager).
pub trait SecureMessaging<P: CryptoProvider>: Sized {
    type EncryptedMessage;

    /// Создать сессию как инициатор. `remote_ratchet_public` is the peer's
    /// signed pre-key.
    fn new_initiator_session(
        root_key: &[u8],
        initiator_state: InitiatorState,
        remote_ratchet_public: &[u8],
        peer_id: String,
    ) -> Result<Self, CryptoError>;

    /// Создать сессию как получатель из первого сообщения.
    ///
    /// Returns the session together with the first message's plaintext.
    fn new_responder_session(
        root_key: &[u8],
        local_ratchet_private: &[u8],
        first_message: &Self::EncryptedMessage,
        peer_id: String,
    ) -> Result<(Self, Vec<u8>), CryptoError>;

    fn encrypt(&mut self, plaintext: &[u8]) -> Result<Self::EncryptedMessage, CryptoError>;

    /// Расшифровать сообщение. On error the session state is left untouched.
    fn decrypt(&mut self, message: &Self::EncryptedMessage) -> Result<Vec<u8>, CryptoError>;

    fn session_id(&self) -> &str;

    fn peer_id(&self) -> &str;

    fn cleanup_old_skipped_keys(&mut self, max_age_seconds: i64);
}

pub mod double_ratchet;

pub use double_ratchet::{DoubleRatchetSession, RatchetHeader, RatchetMessage, SerializableSession};
