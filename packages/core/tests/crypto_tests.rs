//! Tests for cryptographic functions
//!
//! This test suite covers:
//! - Classic Suite Provider (X25519, Ed25519, ChaCha20-Poly1305, HKDF)
//! - X3DH Key Agreement
//! - Double Ratchet Protocol
//! - SessionCipher (encryption version 1)
//! - Envelope codec

use parley_core::crypto::handshake::{KeyAgreement, ResponderKeys, X3DHProtocol};
use parley_core::crypto::keys::DeviceKeyBundle;
use parley_core::crypto::messaging::{DoubleRatchetSession, RatchetMessage, SecureMessaging};
use parley_core::crypto::suites::classic::ClassicSuiteProvider;
use parley_core::crypto::{CryptoProvider, SessionCipher};
use parley_core::protocol::envelope::{Envelope, EnvelopeError, MessageType};
use parley_core::CoreError;
use std::collections::HashSet;

type Session = DoubleRatchetSession<ClassicSuiteProvider>;
type X3DH = X3DHProtocol<ClassicSuiteProvider>;

/// Test that ClassicSuiteProvider generates 32-byte X25519 keys
#[test]
fn test_classic_suite_generate_dh_keys() {
    let (private_key, public_key) =
        ClassicSuiteProvider::generate_dh_keypair().expect("Failed to generate DH keys");

    assert_eq!(private_key.len(), 32, "Private key should be 32 bytes");
    assert_eq!(public_key.len(), 32, "Public key should be 32 bytes");
    assert_eq!(
        ClassicSuiteProvider::dh_public_from_private(&private_key).unwrap(),
        public_key,
        "Public key must be derivable from private key"
    );
}

/// Test signature creation and verification
#[test]
fn test_classic_suite_sign_verify() {
    let (signing_key, verifying_key) = ClassicSuiteProvider::generate_signing_keypair().unwrap();
    let message = b"Hello, Parley!";

    let signature = ClassicSuiteProvider::sign(&signing_key, message).expect("Failed to sign message");
    assert_eq!(signature.len(), 64, "Signature should be 64 bytes");

    let verify_result = ClassicSuiteProvider::verify(&verifying_key, message, &signature);
    assert!(verify_result.is_ok(), "Signature verification failed");

    // Verification should fail with wrong message
    let verify_result = ClassicSuiteProvider::verify(&verifying_key, b"Modified message", &signature);
    assert!(verify_result.is_err(), "Verification should fail with wrong message");
}

/// Test AEAD encryption and decryption
#[test]
fn test_classic_suite_aead_encrypt_decrypt() {
    let key = vec![0u8; 32];
    let nonce = ClassicSuiteProvider::generate_nonce(12).unwrap();
    let plaintext = b"Secret message for encryption test";
    let aad = b"associated data";

    let ciphertext = ClassicSuiteProvider::aead_encrypt(&key, &nonce, plaintext, Some(aad)).unwrap();
    // Ciphertext should be plaintext + 16-byte tag
    assert_eq!(ciphertext.len(), plaintext.len() + 16, "Ciphertext length incorrect");

    let decrypted = ClassicSuiteProvider::aead_decrypt(&key, &nonce, &ciphertext, Some(aad)).unwrap();
    assert_eq!(decrypted, plaintext, "Decrypted plaintext doesn't match");

    let wrong_key = vec![1u8; 32];
    assert!(
        ClassicSuiteProvider::aead_decrypt(&wrong_key, &nonce, &ciphertext, Some(aad)).is_err(),
        "Decryption should fail with wrong key"
    );
    assert!(
        ClassicSuiteProvider::aead_decrypt(&key, &nonce, &ciphertext, None).is_err(),
        "Decryption should fail without associated data"
    );
}

/// Test HKDF key derivation is deterministic
#[test]
fn test_classic_suite_hkdf() {
    let derived = ClassicSuiteProvider::hkdf_derive_key(b"salt", b"input key material", b"info", 32).unwrap();
    assert_eq!(derived.len(), 32, "Derived key length incorrect");

    let again = ClassicSuiteProvider::hkdf_derive_key(b"salt", b"input key material", b"info", 32).unwrap();
    assert_eq!(*derived, *again, "HKDF should be deterministic");

    let other_info = ClassicSuiteProvider::hkdf_derive_key(b"salt", b"input key material", b"other", 32).unwrap();
    assert_ne!(*derived, *other_info, "Info must separate keys");
}

/// Test KDF_RK (Root Key Derivation)
#[test]
fn test_classic_suite_kdf_rk() {
    let root_key = vec![0u8; 32];
    let dh_output = vec![1u8; 32];

    let (new_root_key, chain_key) = ClassicSuiteProvider::kdf_rk(&root_key, &dh_output).unwrap();
    assert_eq!(new_root_key.len(), 32, "New root key should be 32 bytes");
    assert_eq!(chain_key.len(), 32, "Chain key should be 32 bytes");
    assert_ne!(new_root_key.as_slice(), root_key.as_slice(), "New root key should differ");
}

/// X3DH: both sides derive the same root key, including the one-time pre-key
#[test]
fn test_x3dh_perform_handshake() {
    let alice = DeviceKeyBundle::generate::<ClassicSuiteProvider>(0).unwrap();
    let bob = DeviceKeyBundle::generate::<ClassicSuiteProvider>(1).unwrap();
    let bob_public = bob.public_bundle::<ClassicSuiteProvider>("bob");

    let (alice_root, state) =
        X3DH::perform_as_initiator(&alice.identity.dh_private, &bob_public, true).unwrap();
    assert_eq!(state.one_time_pre_key_id, Some(bob.one_time_pre_keys[0].key_id));

    let keys = ResponderKeys {
        identity_private: &bob.identity.dh_private,
        signed_pre_key_private: &bob.signed_pre_key.private,
        one_time_pre_key_private: Some(bob.one_time_pre_keys[0].private.as_slice()),
    };
    let bob_root =
        X3DH::perform_as_responder(&keys, &alice.identity.dh_public, &state.ephemeral_public).unwrap();

    assert_eq!(*alice_root, *bob_root, "Root keys must match");
}

/// X3DH fails with invalid signature
#[test]
fn test_x3dh_fails_with_invalid_signature() {
    let alice = DeviceKeyBundle::generate::<ClassicSuiteProvider>(0).unwrap();
    let bob = DeviceKeyBundle::generate::<ClassicSuiteProvider>(0).unwrap();
    let mut bob_public = bob.public_bundle::<ClassicSuiteProvider>("bob");
    bob_public.signed_pre_key.signature[10] ^= 0x01;

    let result = X3DH::perform_as_initiator(&alice.identity.dh_private, &bob_public, true);
    assert!(result.is_err(), "Handshake must abort on a forged signed pre-key");
}

fn ratchet_pair() -> (Session, Session, Vec<u8>) {
    let alice = DeviceKeyBundle::generate::<ClassicSuiteProvider>(0).unwrap();
    let bob = DeviceKeyBundle::generate::<ClassicSuiteProvider>(0).unwrap();
    let bob_public = bob.public_bundle::<ClassicSuiteProvider>("bob");

    let (root, state) = X3DH::perform_as_initiator(&alice.identity.dh_private, &bob_public, true).unwrap();
    let ephemeral = state.ephemeral_public.clone();
    let mut alice_session =
        Session::new_initiator_session(&root, state, &bob.signed_pre_key.public, "bob".to_string()).unwrap();

    let first: RatchetMessage = alice_session.encrypt(b"first").unwrap();
    let keys = ResponderKeys {
        identity_private: &bob.identity.dh_private,
        signed_pre_key_private: &bob.signed_pre_key.private,
        one_time_pre_key_private: None,
    };
    let bob_root = X3DH::perform_as_responder(&keys, &alice.identity.dh_public, &ephemeral).unwrap();
    let (bob_session, plaintext) =
        Session::new_responder_session(&bob_root, &bob.signed_pre_key.private, &first, "alice".to_string())
            .unwrap();
    (alice_session, bob_session, plaintext)
}

/// Double Ratchet: full roundtrip in both directions
#[test]
fn test_double_ratchet_full_roundtrip() {
    let (mut alice, mut bob, first) = ratchet_pair();
    assert_eq!(first, b"first");

    for round in 0..5 {
        let to_alice = bob.encrypt(format!("bob {}", round).as_bytes()).unwrap();
        assert_eq!(alice.decrypt(&to_alice).unwrap(), format!("bob {}", round).as_bytes());

        let to_bob = alice.encrypt(format!("alice {}", round).as_bytes()).unwrap();
        assert_eq!(bob.decrypt(&to_bob).unwrap(), format!("alice {}", round).as_bytes());
    }
}

/// Double Ratchet: out-of-order message handling
#[test]
fn test_double_ratchet_out_of_order_messages() {
    let (mut alice, mut bob, _) = ratchet_pair();

    let m1 = alice.encrypt(b"one").unwrap();
    let m2 = alice.encrypt(b"two").unwrap();
    let m3 = alice.encrypt(b"three").unwrap();

    assert_eq!(bob.decrypt(&m3).unwrap(), b"three");
    assert_eq!(bob.decrypt(&m1).unwrap(), b"one");
    assert_eq!(bob.decrypt(&m2).unwrap(), b"two");

    // A replay after the skipped key was used must fail
    assert!(bob.decrypt(&m2).is_err(), "Replayed message must be rejected");
}

/// SessionCipher: 10,000 encryptions never reuse a nonce
#[test]
fn test_session_cipher_nonce_uniqueness() {
    let (alice_private, _) = ClassicSuiteProvider::generate_dh_keypair().unwrap();
    let (_, bob_public) = ClassicSuiteProvider::generate_dh_keypair().unwrap();
    let cipher = SessionCipher::<ClassicSuiteProvider>::from_identity(&alice_private);

    let mut nonces = HashSet::new();
    for _ in 0..10_000 {
        let ciphertext = cipher.encrypt("same plaintext", &bob_public).unwrap();
        let sealed = parley_core::utils::b64::decode(&ciphertext).unwrap();
        assert!(
            nonces.insert(sealed[..12].to_vec()),
            "Duplicate nonce generated"
        );
    }
    assert_eq!(nonces.len(), 10_000, "Not all nonces are unique");
}

/// SessionCipher: flipping any single byte is detected
#[test]
fn test_session_cipher_detects_single_byte_tamper() {
    let (alice_private, alice_public) = ClassicSuiteProvider::generate_dh_keypair().unwrap();
    let (bob_private, bob_public) = ClassicSuiteProvider::generate_dh_keypair().unwrap();
    let alice = SessionCipher::<ClassicSuiteProvider>::from_identity(&alice_private);
    let bob = SessionCipher::<ClassicSuiteProvider>::from_identity(&bob_private);

    let ciphertext = alice.encrypt("attack at dawn", &bob_public).unwrap();
    assert_eq!(bob.decrypt(&ciphertext, &alice_public).unwrap(), "attack at dawn");

    let sealed = parley_core::utils::b64::decode(&ciphertext).unwrap();
    for index in 0..sealed.len() {
        let mut tampered = sealed.clone();
        tampered[index] ^= 0x80;
        let result = bob.decrypt(&parley_core::utils::b64::encode(&tampered), &alice_public);
        assert!(
            matches!(result, Err(CoreError::DecryptionFailed(_))),
            "Tamper at byte {} was not detected",
            index
        );
    }
}

/// Envelope: JSON round-trip is lossless and broken input is a typed error
#[test]
fn test_envelope_codec() {
    let (alice_private, _) = ClassicSuiteProvider::generate_dh_keypair().unwrap();
    let (_, bob_public) = ClassicSuiteProvider::generate_dh_keypair().unwrap();
    let ciphertext = SessionCipher::<ClassicSuiteProvider>::from_identity(&alice_private)
        .encrypt("hello", &bob_public)
        .unwrap();

    let envelope = Envelope::encode(ciphertext, MessageType::Text, 1, 42);
    let decoded = Envelope::decode(&envelope.to_bytes().unwrap()).unwrap();
    assert_eq!(decoded, envelope);

    assert!(matches!(Envelope::decode(b"{not json"), Err(EnvelopeError::Malformed(_))));
    assert!(matches!(
        Envelope::decode(br#"{"messageType":"text","encryptionVersion":1,"senderDeviceId":1}"#),
        Err(EnvelopeError::MissingCiphertext)
    ));
}

/// Test random number generation quality (entropy check)
#[test]
fn test_random_number_quality() {
    let mut bytes_set = HashSet::new();

    for _ in 0..100 {
        let nonce = ClassicSuiteProvider::generate_nonce(12).unwrap();
        let nonce_hex = hex::encode(&nonce);

        assert!(
            bytes_set.insert(nonce_hex.clone()),
            "Duplicate nonce generated: {}",
            nonce_hex
        );
    }

    assert_eq!(bytes_set.len(), 100, "Not all nonces are unique");
}
