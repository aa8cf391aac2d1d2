//! Управление ratchet-сессиями (шифрование версии 2)
//!
//! Одна сессия на устройство собеседника (`PeerAddress`). Состояние
//! сохраняется в SecureStorage после каждого успешного encrypt/decrypt.
//!
//! ## Жизненный цикл
//! ```text
//! Uninitialized ──encrypt(bundle)──→ Established (awaiting_reply, handshake в каждом envelope)
//!       │                                   │ первый ответ расшифрован
//!       │                                   ↓
//!       └──decrypt(handshake)─────────→ Established
//! ```
//!
//! При встречном handshake новая сессия становится текущей, старая
//! остаётся в архиве и продолжает принимать сообщения.

use crate::crypto::handshake::{KeyAgreement, ResponderKeys, X3DHProtocol};
use crate::crypto::key_store::KeyStore;
use crate::crypto::keys::PublicKeyBundle;
use crate::crypto::messaging::{
    DoubleRatchetSession, RatchetHeader, RatchetMessage, SecureMessaging, SerializableSession,
};
use crate::crypto::provider::CryptoProvider;
use crate::crypto::suites::classic::ClassicSuiteProvider;
use crate::error::CryptoError;
use crate::protocol::envelope::HandshakeHeader;
use crate::storage::secure::SecureStorage;
use crate::utils::error::{CoreError, Result};
use crate::utils::serialization;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

const SESSION_PREFIX: &str = "session/";
const MAX_ARCHIVED_SESSIONS: usize = 2;

/// Адрес устройства собеседника
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddress {
    pub user_id: String,
    pub device_id: u32,
}

impl PeerAddress {
    pub fn new(user_id: impl Into<String>, device_id: u32) -> Self {
        Self {
            user_id: user_id.into(),
            device_id,
        }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.user_id, self.device_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Established {
        session_id: String,
        /// Собеседник ещё не ответил; исходящие несут handshake
        awaiting_reply: bool,
    },
}

/// Результат шифрования, из которого собирается envelope версии 2
#[derive(Debug, Clone)]
pub struct RatchetCiphertext {
    pub header: RatchetHeader,
    pub handshake: Option<HandshakeHeader>,
    pub sealed: Vec<u8>,
}

struct SessionEntry<P: CryptoProvider> {
    ratchet: DoubleRatchetSession<P>,
    pending_handshake: Option<HandshakeHeader>,
}

impl<P: CryptoProvider> Clone for SessionEntry<P> {
    fn clone(&self) -> Self {
        Self {
            ratchet: self.ratchet.clone(),
            pending_handshake: self.pending_handshake.clone(),
        }
    }
}

struct PeerSessions<P: CryptoProvider> {
    current: SessionEntry<P>,
    archived: Vec<SessionEntry<P>>,
}

#[derive(Serialize, Deserialize)]
struct StoredEntry {
    ratchet: SerializableSession,
    pending_handshake: Option<HandshakeHeader>,
}

#[derive(Serialize, Deserialize)]
struct StoredPeerSessions {
    current: StoredEntry,
    archived: Vec<StoredEntry>,
}

fn decryption_failed(e: CryptoError) -> CoreError {
    CoreError::DecryptionFailed(e.to_string())
}

pub struct SessionManager<P: CryptoProvider = ClassicSuiteProvider> {
    key_store: Arc<KeyStore<P>>,
    storage: Arc<dyn SecureStorage>,
    sessions: Mutex<HashMap<PeerAddress, PeerSessions<P>>>,
    verify_signatures: bool,
}

impl<P: CryptoProvider> SessionManager<P> {
    pub fn new(
        key_store: Arc<KeyStore<P>>,
        storage: Arc<dyn SecureStorage>,
        verify_signatures: bool,
    ) -> Self {
        Self {
            key_store,
            storage,
            sessions: Mutex::new(HashMap::new()),
            verify_signatures,
        }
    }

    fn storage_key(peer: &PeerAddress) -> String {
        format!("{}{}", SESSION_PREFIX, peer)
    }

    /// Подгрузить сессии собеседника в кэш. Возвращает `false`, если их нет.
    fn load_cached(
        &self,
        cache: &mut HashMap<PeerAddress, PeerSessions<P>>,
        peer: &PeerAddress,
    ) -> Result<bool> {
        if cache.contains_key(peer) {
            return Ok(true);
        }
        let Some(bytes) = self.storage.get(&Self::storage_key(peer))? else {
            return Ok(false);
        };

        let stored: StoredPeerSessions = serialization::from_bytes(&bytes)?;
        let restore = |entry: &StoredEntry| -> Result<SessionEntry<P>> {
            let mut ratchet = DoubleRatchetSession::<P>::from_serializable(&entry.ratchet)
                .map_err(|e| CoreError::SessionError(e.to_string()))?;
            ratchet.cleanup_old_skipped_keys_default();
            Ok(SessionEntry {
                ratchet,
                pending_handshake: entry.pending_handshake.clone(),
            })
        };

        let sessions = PeerSessions {
            current: restore(&stored.current)?,
            archived: stored
                .archived
                .iter()
                .map(restore)
                .collect::<Result<Vec<_>>>()?,
        };
        debug!(target: "crypto::sessions", peer = %peer, "Loaded session from storage");
        cache.insert(peer.clone(), sessions);
        Ok(true)
    }

    fn persist(&self, peer: &PeerAddress, sessions: &PeerSessions<P>) -> Result<()> {
        let store = |entry: &SessionEntry<P>| StoredEntry {
            ratchet: entry.ratchet.to_serializable(),
            pending_handshake: entry.pending_handshake.clone(),
        };
        let stored = StoredPeerSessions {
            current: store(&sessions.current),
            archived: sessions.archived.iter().map(store).collect(),
        };
        let bytes = zeroize::Zeroizing::new(serialization::to_bytes(&stored)?);
        self.storage.set(&Self::storage_key(peer), &bytes)
    }

    pub fn state(&self, peer: &PeerAddress) -> Result<SessionState> {
        let mut cache = self.sessions.lock();
        if !self.load_cached(&mut cache, peer)? {
            return Ok(SessionState::Uninitialized);
        }
        Ok(match cache.get(peer) {
            Some(sessions) => SessionState::Established {
                session_id: sessions.current.ratchet.session_id().to_string(),
                awaiting_reply: sessions.current.pending_handshake.is_some(),
            },
            None => SessionState::Uninitialized,
        })
    }

    pub fn has_session(&self, peer: &PeerAddress) -> Result<bool> {
        Ok(self.state(peer)? != SessionState::Uninitialized)
    }

    /// Зашифровать для устройства собеседника.
    ///
    /// Without an established session `bundle` is required to run X3DH;
    /// otherwise this fails with `PeerKeyUnavailable`.
    pub fn encrypt(
        &self,
        peer: &PeerAddress,
        bundle: Option<&PublicKeyBundle>,
        plaintext: &[u8],
    ) -> Result<RatchetCiphertext> {
        let mut cache = self.sessions.lock();

        if !self.load_cached(&mut cache, peer)? {
            let bundle = bundle.ok_or_else(|| {
                CoreError::PeerKeyUnavailable(format!("no session and no key bundle for {}", peer))
            })?;
            let entry = self.initiate(peer, bundle)?;
            cache.insert(
                peer.clone(),
                PeerSessions {
                    current: entry,
                    archived: Vec::new(),
                },
            );
        }

        let sessions = cache
            .get_mut(peer)
            .ok_or_else(|| CoreError::SessionError(format!("session for {} vanished", peer)))?;

        let mut next = sessions.current.ratchet.clone();
        let message = next.encrypt(plaintext)?;
        let previous = std::mem::replace(&mut sessions.current.ratchet, next);

        if let Err(e) = self.persist(peer, sessions) {
            sessions.current.ratchet = previous;
            return Err(e);
        }

        Ok(RatchetCiphertext {
            header: message.header,
            handshake: sessions.current.pending_handshake.clone(),
            sealed: message.ciphertext,
        })
    }

    fn initiate(&self, peer: &PeerAddress, bundle: &PublicKeyBundle) -> Result<SessionEntry<P>> {
        let identity_private = self.key_store.identity_private()?;
        let (root_key, state) = X3DHProtocol::<P>::perform_as_initiator(
            &identity_private,
            bundle,
            self.verify_signatures,
        )
        .map_err(|e| CoreError::PeerKeyUnavailable(format!("{}: {}", peer, e)))?;

        let handshake = HandshakeHeader {
            identity_public: self.key_store.identity_public()?,
            ephemeral_public: state.ephemeral_public.clone(),
            signed_pre_key_id: state.signed_pre_key_id,
            one_time_pre_key_id: state.one_time_pre_key_id,
        };
        let ratchet = DoubleRatchetSession::<P>::new_initiator_session(
            &root_key,
            state,
            &bundle.signed_pre_key.public,
            peer.to_string(),
        )?;

        info!(
            target: "crypto::sessions",
            peer = %peer,
            identity = %bundle.fingerprint(),
            one_time_pre_key = ?handshake.one_time_pre_key_id,
            "Initiated session"
        );
        Ok(SessionEntry {
            ratchet,
            pending_handshake: Some(handshake),
        })
    }

    /// Расшифровать сообщение версии 2.
    ///
    /// `sender_identity` is the identity key the directory reports for the
    /// sender; a handshake carrying a different identity is rejected.
    pub fn decrypt(
        &self,
        peer: &PeerAddress,
        sender_identity: Option<&[u8]>,
        header: &RatchetHeader,
        handshake: Option<&HandshakeHeader>,
        sealed: &[u8],
    ) -> Result<Vec<u8>> {
        let message = RatchetMessage {
            header: header.clone(),
            ciphertext: sealed.to_vec(),
        };
        let mut cache = self.sessions.lock();

        let mut last_error = None;
        if self.load_cached(&mut cache, peer)? {
            if let Some(sessions) = cache.get_mut(peer) {
                match self.decrypt_existing(peer, sessions, &message)? {
                    Ok(plaintext) => return Ok(plaintext),
                    Err(e) => last_error = Some(e),
                }
            }
        }

        let Some(handshake) = handshake else {
            return Err(CoreError::DecryptionFailed(match last_error {
                Some(e) => e.to_string(),
                None => format!("no session with {}", peer),
            }));
        };

        if let Some(expected) = sender_identity {
            if expected != handshake.identity_public.as_slice() {
                warn!(target: "crypto::sessions", peer = %peer, "Handshake identity mismatch");
                return Err(CoreError::DecryptionFailed(
                    "handshake identity does not match directory".to_string(),
                ));
            }
        }

        let (entry, plaintext) = self.respond(peer, handshake, &message)?;

        let mut sessions = match cache.remove(peer) {
            Some(mut existing) => {
                let old = std::mem::replace(&mut existing.current, entry);
                existing.archived.insert(0, old);
                existing.archived.truncate(MAX_ARCHIVED_SESSIONS);
                existing
            }
            None => PeerSessions {
                current: entry,
                archived: Vec::new(),
            },
        };
        let persisted = self.persist(peer, &sessions);
        if let Err(e) = persisted {
            // Сессия остаётся в памяти: сообщение уже расшифровано
            warn!(target: "crypto::sessions", peer = %peer, error = %e, "Failed to persist session");
        }
        sessions.current.pending_handshake = None;
        cache.insert(peer.clone(), sessions);

        Ok(plaintext)
    }

    /// Попробовать текущую и архивные сессии. Внешний `Result` несёт
    /// ошибки хранилища, внутренний несёт ошибку расшифровки.
    fn decrypt_existing(
        &self,
        peer: &PeerAddress,
        sessions: &mut PeerSessions<P>,
        message: &RatchetMessage,
    ) -> Result<std::result::Result<Vec<u8>, CryptoError>> {
        let mut trial = sessions.current.clone();
        let first_error = match trial.ratchet.decrypt(message) {
            Ok(plaintext) => {
                trial.pending_handshake = None;
                let previous = std::mem::replace(&mut sessions.current, trial);
                if let Err(e) = self.persist(peer, sessions) {
                    sessions.current = previous;
                    return Err(e);
                }
                return Ok(Ok(plaintext));
            }
            Err(e) => e,
        };

        for index in 0..sessions.archived.len() {
            let mut trial = sessions.archived[index].clone();
            if let Ok(plaintext) = trial.ratchet.decrypt(message) {
                // Сессия, которой пользуется собеседник, становится текущей
                trial.pending_handshake = None;
                sessions.archived.remove(index);
                let demoted = std::mem::replace(&mut sessions.current, trial);
                sessions.archived.insert(0, demoted);
                self.persist(peer, sessions)?;
                debug!(target: "crypto::sessions", peer = %peer, "Promoted archived session");
                return Ok(Ok(plaintext));
            }
        }

        Ok(Err(first_error))
    }

    fn respond(
        &self,
        peer: &PeerAddress,
        handshake: &HandshakeHeader,
        message: &RatchetMessage,
    ) -> Result<(SessionEntry<P>, Vec<u8>)> {
        let signed_pre_key = self
            .key_store
            .signed_pre_key(handshake.signed_pre_key_id)?
            .ok_or_else(|| {
                CoreError::DecryptionFailed(format!(
                    "unknown signed pre-key {}",
                    handshake.signed_pre_key_id
                ))
            })?;

        // Pre-key is only consumed after the first message decrypts
        let one_time_pre_key = match handshake.one_time_pre_key_id {
            Some(key_id) => Some(self.key_store.one_time_pre_key(key_id)?.ok_or_else(|| {
                CoreError::DecryptionFailed(format!("one-time pre-key {} already used", key_id))
            })?),
            None => None,
        };

        let identity_private = self.key_store.identity_private()?;
        let keys = ResponderKeys {
            identity_private: &identity_private,
            signed_pre_key_private: &signed_pre_key.private,
            one_time_pre_key_private: one_time_pre_key.as_ref().map(|k| k.private.as_slice()),
        };
        let root_key = X3DHProtocol::<P>::perform_as_responder(
            &keys,
            &handshake.identity_public,
            &handshake.ephemeral_public,
        )
        .map_err(decryption_failed)?;

        let (ratchet, plaintext) = DoubleRatchetSession::<P>::new_responder_session(
            &root_key,
            &signed_pre_key.private,
            message,
            peer.to_string(),
        )
        .map_err(decryption_failed)?;

        if let Some(key_id) = handshake.one_time_pre_key_id {
            self.key_store.take_one_time_pre_key(key_id)?;
        }

        info!(
            target: "crypto::sessions",
            peer = %peer,
            one_time_pre_key = ?handshake.one_time_pre_key_id,
            "Accepted session"
        );
        Ok((
            SessionEntry {
                ratchet,
                pending_handshake: None,
            },
            plaintext,
        ))
    }

    /// Забыть сессию (например, после смены ключей собеседника)
    pub fn remove_session(&self, peer: &PeerAddress) -> Result<()> {
        self.sessions.lock().remove(peer);
        self.storage.remove(&Self::storage_key(peer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::secure::EncryptedStorage;

    type Manager = SessionManager<ClassicSuiteProvider>;

    struct Device {
        user_id: &'static str,
        key_store: Arc<KeyStore<ClassicSuiteProvider>>,
        storage: Arc<dyn SecureStorage>,
        manager: Manager,
    }

    impl Device {
        fn new(user_id: &'static str) -> Self {
            let storage: Arc<dyn SecureStorage> = Arc::new(EncryptedStorage::in_memory());
            let key_store = Arc::new(KeyStore::new(storage.clone()));
            key_store.ensure_identity().unwrap();
            let manager = Manager::new(key_store.clone(), storage.clone(), true);
            Self {
                user_id,
                key_store,
                storage,
                manager,
            }
        }

        fn address(&self) -> PeerAddress {
            PeerAddress::new(self.user_id, self.key_store.device_id().unwrap())
        }

        /// Bundle as a directory would hand it out: one one-time pre-key
        fn fetched_bundle(&self) -> PublicKeyBundle {
            let mut bundle = self.key_store.public_bundle(self.user_id).unwrap();
            bundle.one_time_pre_keys.truncate(1);
            bundle
        }

        fn reopen(&self) -> Manager {
            Manager::new(self.key_store.clone(), self.storage.clone(), true)
        }
    }

    fn send(from: &Device, to: &Device, text: &str) -> RatchetCiphertext {
        from.manager
            .encrypt(&to.address(), Some(&to.fetched_bundle()), text.as_bytes())
            .unwrap()
    }

    fn receive(at: &Device, from: &Device, ct: &RatchetCiphertext) -> Result<Vec<u8>> {
        let identity = from.key_store.identity_public().unwrap();
        at.manager.decrypt(
            &from.address(),
            Some(&identity),
            &ct.header,
            ct.handshake.as_ref(),
            &ct.sealed,
        )
    }

    #[test]
    fn test_handshake_consumes_one_time_pre_key() {
        let alice = Device::new("alice");
        let bob = Device::new("bob");
        let before = bob.key_store.one_time_pre_key_count().unwrap();

        let first = send(&alice, &bob, "hello");
        assert!(first.handshake.is_some());
        assert_eq!(receive(&bob, &alice, &first).unwrap(), b"hello");
        assert_eq!(bob.key_store.one_time_pre_key_count().unwrap(), before - 1);

        // Handshake повторяется до первого ответа
        let second = send(&alice, &bob, "still there?");
        assert!(second.handshake.is_some());
        assert_eq!(receive(&bob, &alice, &second).unwrap(), b"still there?");

        let reply = send(&bob, &alice, "hi");
        assert!(reply.handshake.is_none());
        assert_eq!(receive(&alice, &bob, &reply).unwrap(), b"hi");

        let third = send(&alice, &bob, "great");
        assert!(third.handshake.is_none());
        assert_eq!(receive(&bob, &alice, &third).unwrap(), b"great");
    }

    #[test]
    fn test_encrypt_without_bundle_is_peer_key_unavailable() {
        let alice = Device::new("alice");
        let bob = Device::new("bob");

        let result = alice.manager.encrypt(&bob.address(), None, b"hi");
        assert!(matches!(result, Err(CoreError::PeerKeyUnavailable(_))));
        assert_eq!(
            alice.manager.state(&bob.address()).unwrap(),
            SessionState::Uninitialized
        );
    }

    #[test]
    fn test_bad_signature_is_peer_key_unavailable() {
        let alice = Device::new("alice");
        let bob = Device::new("bob");

        let mut bundle = bob.fetched_bundle();
        bundle.signed_pre_key.signature[0] ^= 0xFF;
        let result = alice.manager.encrypt(&bob.address(), Some(&bundle), b"hi");
        assert!(matches!(result, Err(CoreError::PeerKeyUnavailable(_))));
    }

    #[test]
    fn test_sessions_survive_restart() {
        let alice = Device::new("alice");
        let bob = Device::new("bob");

        let first = send(&alice, &bob, "one");
        receive(&bob, &alice, &first).unwrap();

        let alice_reopened = alice.reopen();
        let bob_reopened = bob.reopen();

        let second = alice_reopened
            .encrypt(&bob.address(), None, b"two")
            .unwrap();
        let identity = alice.key_store.identity_public().unwrap();
        let plaintext = bob_reopened
            .decrypt(
                &alice.address(),
                Some(&identity),
                &second.header,
                second.handshake.as_ref(),
                &second.sealed,
            )
            .unwrap();
        assert_eq!(plaintext, b"two");
    }

    #[test]
    fn test_handshake_identity_mismatch_rejected() {
        let alice = Device::new("alice");
        let bob = Device::new("bob");
        let mallory = Device::new("mallory");

        let first = send(&alice, &bob, "hello");
        let wrong_identity = mallory.key_store.identity_public().unwrap();
        let result = bob.manager.decrypt(
            &alice.address(),
            Some(&wrong_identity),
            &first.header,
            first.handshake.as_ref(),
            &first.sealed,
        );
        assert!(matches!(result, Err(CoreError::DecryptionFailed(_))));
        assert!(!bob.manager.has_session(&alice.address()).unwrap());
    }

    #[test]
    fn test_simultaneous_initiation_converges() {
        let alice = Device::new("alice");
        let bob = Device::new("bob");

        let from_alice = send(&alice, &bob, "hi bob");
        let from_bob = send(&bob, &alice, "hi alice");

        assert_eq!(receive(&bob, &alice, &from_alice).unwrap(), b"hi bob");
        assert_eq!(receive(&alice, &bob, &from_bob).unwrap(), b"hi alice");

        for round in 0..3 {
            let text = format!("round {}", round);
            let a = send(&alice, &bob, &text);
            assert_eq!(receive(&bob, &alice, &a).unwrap(), text.as_bytes());
            let b = send(&bob, &alice, &text);
            assert_eq!(receive(&alice, &bob, &b).unwrap(), text.as_bytes());
        }
    }

    #[test]
    fn test_tampered_first_message_keeps_pre_key() {
        let alice = Device::new("alice");
        let bob = Device::new("bob");
        let before = bob.key_store.one_time_pre_key_count().unwrap();

        let mut first = send(&alice, &bob, "hello");
        let last = first.sealed.len() - 1;
        first.sealed[last] ^= 0x01;

        assert!(receive(&bob, &alice, &first).is_err());
        assert_eq!(bob.key_store.one_time_pre_key_count().unwrap(), before);
    }
}
