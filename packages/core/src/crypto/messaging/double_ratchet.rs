//! Double Ratchet Protocol Implementation
//!
//! ## Архитектура
//!
//! 1. **DH Ratchet**: новая DH пара при каждом "turn" в диалоге
//! 2. **Symmetric Ratchet**: `KDF_CK` выводит ключ для каждого сообщения
//!
//! Skipped message keys are indexed by `(ratchet public key, message number)`
//! so out-of-order delivery works across DH ratchet steps. Их количество
//! ограничено `Config::max_skipped_messages`.

use crate::config::Config;
use crate::crypto::handshake::InitiatorState;
use crate::crypto::messaging::SecureMessaging;
use crate::crypto::provider::{CryptoProvider, SecretBytes};
use crate::crypto::SuiteID;
use crate::error::CryptoError;
use crate::utils::time::current_timestamp;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use tracing::{debug, trace};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Заголовок сообщения, передаётся в открытом виде и аутентифицируется как AAD
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetHeader {
    pub dh_public: Vec<u8>,
    pub message_number: u32,
    pub previous_chain_length: u32,
}

impl RatchetHeader {
    /// `dh_public || previous_chain_length || message_number`, big-endian.
    pub fn associated_data(&self) -> Vec<u8> {
        let mut ad = Vec::with_capacity(self.dh_public.len() + 8);
        ad.extend_from_slice(&self.dh_public);
        ad.extend_from_slice(&self.previous_chain_length.to_be_bytes());
        ad.extend_from_slice(&self.message_number.to_be_bytes());
        ad
    }
}

/// Encrypted message: header plus `nonce || ciphertext || tag`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetMessage {
    pub header: RatchetHeader,
    pub ciphertext: Vec<u8>,
}

type SkippedKeyId = (Vec<u8>, u32);

#[derive(Clone)]
struct SkippedKey {
    key: SecretBytes,
    stored_at: i64,
}

/// Double Ratchet Session
///
/// Состояние обмена сообщениями с одним устройством собеседника.
pub struct DoubleRatchetSession<P: CryptoProvider> {
    suite_id: SuiteID,
    root_key: SecretBytes,

    sending_chain_key: Option<SecretBytes>,
    sending_chain_length: u32,

    receiving_chain_key: Option<SecretBytes>,
    receiving_chain_length: u32,

    dh_ratchet_private: SecretBytes,
    dh_ratchet_public: Vec<u8>,
    remote_dh_public: Option<Vec<u8>>,

    previous_sending_length: u32,
    skipped_message_keys: HashMap<SkippedKeyId, SkippedKey>,

    session_id: String,
    peer_id: String,

    _phantom: PhantomData<P>,
}

impl<P: CryptoProvider> Clone for DoubleRatchetSession<P> {
    fn clone(&self) -> Self {
        Self {
            suite_id: self.suite_id,
            root_key: self.root_key.clone(),
            sending_chain_key: self.sending_chain_key.clone(),
            sending_chain_length: self.sending_chain_length,
            receiving_chain_key: self.receiving_chain_key.clone(),
            receiving_chain_length: self.receiving_chain_length,
            dh_ratchet_private: self.dh_ratchet_private.clone(),
            dh_ratchet_public: self.dh_ratchet_public.clone(),
            remote_dh_public: self.remote_dh_public.clone(),
            previous_sending_length: self.previous_sending_length,
            skipped_message_keys: self.skipped_message_keys.clone(),
            session_id: self.session_id.clone(),
            peer_id: self.peer_id.clone(),
            _phantom: PhantomData,
        }
    }
}

impl<P: CryptoProvider> fmt::Debug for DoubleRatchetSession<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DoubleRatchetSession")
            .field("session_id", &self.session_id)
            .field("peer_id", &self.peer_id)
            .field("sending_chain_length", &self.sending_chain_length)
            .field("receiving_chain_length", &self.receiving_chain_length)
            .field("skipped_keys", &self.skipped_message_keys.len())
            .finish_non_exhaustive()
    }
}

impl<P: CryptoProvider> SecureMessaging<P> for DoubleRatchetSession<P> {
    type EncryptedMessage = RatchetMessage;

    fn new_initiator_session(
        root_key: &[u8],
        initiator_state: InitiatorState,
        remote_ratchet_public: &[u8],
        peer_id: String,
    ) -> Result<Self, CryptoError> {
        debug!(
            target: "crypto::double_ratchet",
            peer_id = %peer_id,
            "Creating initiator session"
        );

        // X3DH ephemeral key doubles as the first DH ratchet key
        let dh_output = P::dh(&initiator_state.ephemeral_private, remote_ratchet_public)?;
        let (root_key, sending_chain) = P::kdf_rk(root_key, &dh_output)?;

        Ok(Self {
            suite_id: P::suite_id(),
            root_key,
            sending_chain_key: Some(sending_chain),
            sending_chain_length: 0,
            receiving_chain_key: None,
            receiving_chain_length: 0,
            dh_ratchet_private: initiator_state.ephemeral_private,
            dh_ratchet_public: initiator_state.ephemeral_public,
            remote_dh_public: Some(remote_ratchet_public.to_vec()),
            previous_sending_length: 0,
            skipped_message_keys: HashMap::new(),
            session_id: crate::utils::uuid::generate_v4(),
            peer_id,
            _phantom: PhantomData,
        })
    }

    fn new_responder_session(
        root_key: &[u8],
        local_ratchet_private: &[u8],
        first_message: &RatchetMessage,
        peer_id: String,
    ) -> Result<(Self, Vec<u8>), CryptoError> {
        debug!(
            target: "crypto::double_ratchet",
            peer_id = %peer_id,
            "Creating responder session"
        );

        let mut session = Self {
            suite_id: P::suite_id(),
            root_key: Zeroizing::new(root_key.to_vec()),
            sending_chain_key: None,
            sending_chain_length: 0,
            receiving_chain_key: None,
            receiving_chain_length: 0,
            dh_ratchet_private: Zeroizing::new(local_ratchet_private.to_vec()),
            dh_ratchet_public: P::dh_public_from_private(local_ratchet_private)?,
            remote_dh_public: None,
            previous_sending_length: 0,
            skipped_message_keys: HashMap::new(),
            session_id: crate::utils::uuid::generate_v4(),
            peer_id,
            _phantom: PhantomData,
        };

        // The first message carries the initiator's ratchet key: decrypting it
        // performs the first DH ratchet step.
        let plaintext = session.decrypt(first_message)?;
        Ok((session, plaintext))
    }

    fn encrypt(&mut self, plaintext: &[u8]) -> Result<RatchetMessage, CryptoError> {
        let chain_key = self.sending_chain_key.as_ref().ok_or_else(|| {
            CryptoError::InvalidInputError("Session has no sending chain".to_string())
        })?;
        let (message_key, next_chain_key) = P::kdf_ck(chain_key)?;

        let header = RatchetHeader {
            dh_public: self.dh_ratchet_public.clone(),
            message_number: self.sending_chain_length,
            previous_chain_length: self.previous_sending_length,
        };
        let ciphertext = P::seal(&message_key, plaintext, Some(&header.associated_data()))?;

        self.sending_chain_key = Some(next_chain_key);
        self.sending_chain_length += 1;

        trace!(
            target: "crypto::double_ratchet",
            msg_num = header.message_number,
            ciphertext_len = ciphertext.len(),
            "Message encrypted"
        );

        Ok(RatchetMessage { header, ciphertext })
    }

    fn decrypt(&mut self, message: &RatchetMessage) -> Result<Vec<u8>, CryptoError> {
        debug!(
            target: "crypto::double_ratchet",
            msg_num = message.header.message_number,
            current_recv_chain_len = self.receiving_chain_length,
            skipped_keys_count = self.skipped_message_keys.len(),
            "Decrypting message"
        );

        // Work on a copy so a forged or corrupted message cannot advance the ratchet.
        let mut trial = self.clone();
        match trial.decrypt_in_place(message) {
            Ok(plaintext) => {
                *self = trial;
                Ok(plaintext)
            }
            Err(e) => {
                debug!(target: "crypto::double_ratchet", error = %e, "Decryption failed");
                Err(e)
            }
        }
    }

    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn peer_id(&self) -> &str {
        &self.peer_id
    }

    fn cleanup_old_skipped_keys(&mut self, max_age_seconds: i64) {
        let now = current_timestamp();
        let initial_count = self.skipped_message_keys.len();

        self.skipped_message_keys
            .retain(|_, skipped| now - skipped.stored_at < max_age_seconds);

        let removed_count = initial_count - self.skipped_message_keys.len();
        if removed_count > 0 {
            debug!(
                target: "crypto::double_ratchet",
                removed = removed_count,
                remaining = self.skipped_message_keys.len(),
                "Cleaned up old skipped message keys"
            );
        }
    }
}

impl<P: CryptoProvider> DoubleRatchetSession<P> {
    /// Cleanup skipped keys older than `Config::max_skipped_message_age_seconds`.
    pub fn cleanup_old_skipped_keys_default(&mut self) {
        self.cleanup_old_skipped_keys(Config::global().max_skipped_message_age_seconds);
    }

    pub fn skipped_key_count(&self) -> usize {
        self.skipped_message_keys.len()
    }

    fn decrypt_in_place(&mut self, message: &RatchetMessage) -> Result<Vec<u8>, CryptoError> {
        let header = &message.header;
        let associated_data = header.associated_data();

        let skipped_id = (header.dh_public.clone(), header.message_number);
        if let Some(skipped) = self.skipped_message_keys.remove(&skipped_id) {
            trace!(
                target: "crypto::double_ratchet",
                msg_num = header.message_number,
                "Found skipped message key"
            );
            return P::open(&skipped.key, &message.ciphertext, Some(&associated_data));
        }

        if self.remote_dh_public.as_deref() != Some(header.dh_public.as_slice()) {
            self.skip_message_keys(header.previous_chain_length)?;
            self.perform_dh_ratchet(&header.dh_public)?;
        } else if header.message_number < self.receiving_chain_length {
            return Err(CryptoError::AeadDecryptionError(
                "Message key already used or expired".to_string(),
            ));
        }

        self.skip_message_keys(header.message_number)?;

        let chain_key = self.receiving_chain_key.as_ref().ok_or_else(|| {
            CryptoError::InvalidInputError("Session has no receiving chain".to_string())
        })?;
        let (message_key, next_chain_key) = P::kdf_ck(chain_key)?;
        self.receiving_chain_key = Some(next_chain_key);
        self.receiving_chain_length += 1;

        P::open(&message_key, &message.ciphertext, Some(&associated_data))
    }

    /// Store message keys of the current receiving chain up to `until`.
    fn skip_message_keys(&mut self, until: u32) -> Result<(), CryptoError> {
        let Some(mut chain_key) = self.receiving_chain_key.clone() else {
            return Ok(());
        };
        if until <= self.receiving_chain_length {
            return Ok(());
        }

        let max_skipped = Config::global().max_skipped_messages;
        if until - self.receiving_chain_length > max_skipped {
            return Err(CryptoError::InvalidInputError(
                "Too many skipped messages".to_string(),
            ));
        }

        let remote = self.remote_dh_public.clone().unwrap_or_default();
        let now = current_timestamp();
        while self.receiving_chain_length < until {
            let (message_key, next_chain_key) = P::kdf_ck(&chain_key)?;
            self.skipped_message_keys.insert(
                (remote.clone(), self.receiving_chain_length),
                SkippedKey {
                    key: message_key,
                    stored_at: now,
                },
            );
            chain_key = next_chain_key;
            self.receiving_chain_length += 1;
        }
        self.receiving_chain_key = Some(chain_key);

        // DoS protection
        if self.skipped_message_keys.len() > max_skipped as usize {
            return Err(CryptoError::InvalidInputError(
                "Too many skipped messages".to_string(),
            ));
        }
        Ok(())
    }

    /// Выполнить DH ratchet step при получении нового DH public key собеседника
    fn perform_dh_ratchet(&mut self, remote_dh_public: &[u8]) -> Result<(), CryptoError> {
        debug!(target: "crypto::double_ratchet", "Performing DH ratchet step");

        self.previous_sending_length = self.sending_chain_length;

        let dh_receive = P::dh(&self.dh_ratchet_private, remote_dh_public)?;
        let (root_key, receiving_chain) = P::kdf_rk(&self.root_key, &dh_receive)?;

        let (new_private, new_public) = P::generate_dh_keypair()?;
        let dh_send = P::dh(&new_private, remote_dh_public)?;
        let (root_key, sending_chain) = P::kdf_rk(&root_key, &dh_send)?;

        self.root_key = root_key;
        self.receiving_chain_key = Some(receiving_chain);
        self.receiving_chain_length = 0;
        self.sending_chain_key = Some(sending_chain);
        self.sending_chain_length = 0;
        self.dh_ratchet_private = new_private;
        self.dh_ratchet_public = new_public;
        self.remote_dh_public = Some(remote_dh_public.to_vec());

        Ok(())
    }

    /// Сериализовать сессию для сохранения
    pub fn to_serializable(&self) -> SerializableSession {
        SerializableSession {
            suite_id: self.suite_id,
            root_key: self.root_key.to_vec(),
            sending_chain_key: self.sending_chain_key.as_ref().map(|k| k.to_vec()),
            sending_chain_length: self.sending_chain_length,
            receiving_chain_key: self.receiving_chain_key.as_ref().map(|k| k.to_vec()),
            receiving_chain_length: self.receiving_chain_length,
            dh_ratchet_private: self.dh_ratchet_private.to_vec(),
            dh_ratchet_public: self.dh_ratchet_public.clone(),
            remote_dh_public: self.remote_dh_public.clone(),
            previous_sending_length: self.previous_sending_length,
            skipped_message_keys: self
                .skipped_message_keys
                .iter()
                .map(|((dh_public, message_number), skipped)| SkippedKeyRecord {
                    dh_public: dh_public.clone(),
                    message_number: *message_number,
                    key: skipped.key.to_vec(),
                    stored_at: skipped.stored_at,
                })
                .collect(),
            session_id: self.session_id.clone(),
            peer_id: self.peer_id.clone(),
        }
    }

    /// Десериализовать сессию
    pub fn from_serializable(data: &SerializableSession) -> Result<Self, CryptoError> {
        if data.suite_id != P::suite_id() {
            return Err(CryptoError::DeserializationError(format!(
                "Session suite {} does not match provider suite {}",
                data.suite_id,
                P::suite_id()
            )));
        }

        Ok(Self {
            suite_id: data.suite_id,
            root_key: Zeroizing::new(data.root_key.clone()),
            sending_chain_key: data.sending_chain_key.clone().map(Zeroizing::new),
            sending_chain_length: data.sending_chain_length,
            receiving_chain_key: data.receiving_chain_key.clone().map(Zeroizing::new),
            receiving_chain_length: data.receiving_chain_length,
            dh_ratchet_private: Zeroizing::new(data.dh_ratchet_private.clone()),
            dh_ratchet_public: data.dh_ratchet_public.clone(),
            remote_dh_public: data.remote_dh_public.clone(),
            previous_sending_length: data.previous_sending_length,
            skipped_message_keys: data
                .skipped_message_keys
                .iter()
                .map(|record| {
                    (
                        (record.dh_public.clone(), record.message_number),
                        SkippedKey {
                            key: Zeroizing::new(record.key.clone()),
                            stored_at: record.stored_at,
                        },
                    )
                })
                .collect(),
            session_id: data.session_id.clone(),
            peer_id: data.peer_id.clone(),
            _phantom: PhantomData,
        })
    }
}

#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct SkippedKeyRecord {
    dh_public: Vec<u8>,
    message_number: u32,
    key: Vec<u8>,
    stored_at: i64,
}

/// Serializable session format for storage
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct SerializableSession {
    suite_id: u16,
    root_key: Vec<u8>,
    sending_chain_key: Option<Vec<u8>>,
    sending_chain_length: u32,
    receiving_chain_key: Option<Vec<u8>>,
    receiving_chain_length: u32,
    dh_ratchet_private: Vec<u8>,
    dh_ratchet_public: Vec<u8>,
    remote_dh_public: Option<Vec<u8>>,
    previous_sending_length: u32,
    skipped_message_keys: Vec<SkippedKeyRecord>,
    session_id: String,
    peer_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::handshake::{KeyAgreement, ResponderKeys, X3DHProtocol};
    use crate::crypto::keys::DeviceKeyBundle;
    use crate::crypto::suites::classic::ClassicSuiteProvider;

    type Session = DoubleRatchetSession<ClassicSuiteProvider>;
    type X3DH = X3DHProtocol<ClassicSuiteProvider>;

    /// Alice's session plus everything Bob needs to answer her first message.
    fn setup() -> (Session, DeviceKeyBundle, DeviceKeyBundle, Vec<u8>) {
        let alice = DeviceKeyBundle::generate::<ClassicSuiteProvider>(0).unwrap();
        let bob = DeviceKeyBundle::generate::<ClassicSuiteProvider>(0).unwrap();
        let bob_public = bob.public_bundle::<ClassicSuiteProvider>("bob");

        let (root_key, state) =
            X3DH::perform_as_initiator(&alice.identity.dh_private, &bob_public, true).unwrap();
        let ephemeral_public = state.ephemeral_public.clone();
        let session = Session::new_initiator_session(
            &root_key,
            state,
            &bob.signed_pre_key.public,
            "bob".to_string(),
        )
        .unwrap();

        (session, alice, bob, ephemeral_public)
    }

    fn respond(
        alice: &DeviceKeyBundle,
        bob: &DeviceKeyBundle,
        ephemeral_public: &[u8],
        first: &RatchetMessage,
    ) -> (Session, Vec<u8>) {
        let keys = ResponderKeys {
            identity_private: &bob.identity.dh_private,
            signed_pre_key_private: &bob.signed_pre_key.private,
            one_time_pre_key_private: None,
        };
        let root_key =
            X3DH::perform_as_responder(&keys, &alice.identity.dh_public, ephemeral_public).unwrap();
        Session::new_responder_session(
            &root_key,
            &bob.signed_pre_key.private,
            first,
            "alice".to_string(),
        )
        .unwrap()
    }

    #[test]
    fn test_alice_bob_full_exchange() {
        let (mut alice_session, alice, bob, ephemeral) = setup();

        let encrypted1 = alice_session.encrypt(b"Hello Bob!").unwrap();
        let (mut bob_session, decrypted1) = respond(&alice, &bob, &ephemeral, &encrypted1);
        assert_eq!(decrypted1, b"Hello Bob!");

        let encrypted2 = bob_session.encrypt(b"Hi Alice!").unwrap();
        assert_eq!(alice_session.decrypt(&encrypted2).unwrap(), b"Hi Alice!");

        let encrypted3 = alice_session.encrypt(b"How are you?").unwrap();
        assert_ne!(encrypted3.header.dh_public, encrypted1.header.dh_public);
        assert_eq!(bob_session.decrypt(&encrypted3).unwrap(), b"How are you?");
    }

    #[test]
    fn test_out_of_order_messages() {
        let (mut alice_session, alice, bob, ephemeral) = setup();

        let msg1 = alice_session.encrypt(b"Message 1").unwrap();
        let msg2 = alice_session.encrypt(b"Message 2").unwrap();
        let msg3 = alice_session.encrypt(b"Message 3").unwrap();

        let (mut bob_session, dec1) = respond(&alice, &bob, &ephemeral, &msg1);
        assert_eq!(dec1, b"Message 1");

        assert_eq!(bob_session.decrypt(&msg3).unwrap(), b"Message 3");
        assert_eq!(bob_session.skipped_key_count(), 1);
        assert_eq!(bob_session.decrypt(&msg2).unwrap(), b"Message 2");
        assert_eq!(bob_session.skipped_key_count(), 0);
    }

    #[test]
    fn test_out_of_order_across_ratchet_step() {
        let (mut alice_session, alice, bob, ephemeral) = setup();

        let first = alice_session.encrypt(b"first").unwrap();
        let (mut bob_session, _) = respond(&alice, &bob, &ephemeral, &first);
        let late = alice_session.encrypt(b"late").unwrap();

        let reply = bob_session.encrypt(b"reply").unwrap();
        alice_session.decrypt(&reply).unwrap();
        let after_ratchet = alice_session.encrypt(b"after ratchet").unwrap();

        // New ratchet key arrives before the last message of the old chain
        assert_eq!(bob_session.decrypt(&after_ratchet).unwrap(), b"after ratchet");
        assert_eq!(bob_session.decrypt(&late).unwrap(), b"late");
    }

    #[test]
    fn test_tampered_message_leaves_session_usable() {
        let (mut alice_session, alice, bob, ephemeral) = setup();

        let first = alice_session.encrypt(b"first").unwrap();
        let (mut bob_session, _) = respond(&alice, &bob, &ephemeral, &first);

        let mut tampered = alice_session.encrypt(b"second").unwrap();
        let original = tampered.clone();
        let last = tampered.ciphertext.len() - 1;
        tampered.ciphertext[last] ^= 0x01;

        assert!(bob_session.decrypt(&tampered).is_err());
        assert_eq!(bob_session.decrypt(&original).unwrap(), b"second");
    }

    #[test]
    fn test_replay_is_rejected() {
        let (mut alice_session, alice, bob, ephemeral) = setup();

        let first = alice_session.encrypt(b"first").unwrap();
        let (mut bob_session, _) = respond(&alice, &bob, &ephemeral, &first);
        let second = alice_session.encrypt(b"second").unwrap();

        bob_session.decrypt(&second).unwrap();
        assert!(bob_session.decrypt(&second).is_err());
    }

    #[test]
    fn test_serialization_preserves_state() {
        let (mut alice_session, alice, bob, ephemeral) = setup();

        let first = alice_session.encrypt(b"first").unwrap();
        let (bob_session, _) = respond(&alice, &bob, &ephemeral, &first);

        let bytes = crate::utils::serialization::to_bytes(&bob_session.to_serializable()).unwrap();
        let restored: SerializableSession = crate::utils::serialization::from_bytes(&bytes).unwrap();
        let mut bob_restored = Session::from_serializable(&restored).unwrap();

        let second = alice_session.encrypt(b"second").unwrap();
        assert_eq!(bob_restored.decrypt(&second).unwrap(), b"second");
        assert_eq!(bob_restored.peer_id(), "alice");
    }
}
