use crate::crypto::provider::{CryptoProvider, SecretBytes};
use crate::crypto::SuiteID;
use crate::error::CryptoError;
use chacha20poly1305::{
    aead::{Aead, Payload},
    ChaCha20Poly1305, KeyInit, Nonce,
};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand_core::RngCore;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

const ROOT_KEY_INFO: &[u8] = b"Parley-Ratchet-Root-Key-Expansion";
const CHAIN_KEY_INFO: &[u8] = b"Parley-Ratchet-Chain-Key-Expansion";

/// Concrete implementation of `CryptoProvider` for the classic suite:
/// X25519, Ed25519, ChaCha20-Poly1305 and HKDF-SHA256.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClassicSuiteProvider;

fn to_array_32(bytes: &[u8], what: &str) -> Result<[u8; 32], CryptoError> {
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidInputError(format!("Invalid {} length: {}", what, bytes.len())))
}

fn split_64(output: &[u8]) -> (SecretBytes, SecretBytes) {
    (
        Zeroizing::new(output[..32].to_vec()),
        Zeroizing::new(output[32..].to_vec()),
    )
}

impl CryptoProvider for ClassicSuiteProvider {
    const NONCE_LEN: usize = 12;

    fn generate_dh_keypair() -> Result<(SecretBytes, Vec<u8>), CryptoError> {
        let private_key = StaticSecret::random_from_rng(OsRng);
        let public_key = PublicKey::from(&private_key);
        Ok((
            Zeroizing::new(private_key.to_bytes().to_vec()),
            public_key.to_bytes().to_vec(),
        ))
    }

    fn dh_public_from_private(private_key: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let bytes = Zeroizing::new(to_array_32(private_key, "DH private key")?);
        let static_secret = StaticSecret::from(*bytes);
        Ok(PublicKey::from(&static_secret).to_bytes().to_vec())
    }

    fn dh(private_key: &[u8], public_key: &[u8]) -> Result<SecretBytes, CryptoError> {
        let secret_bytes = Zeroizing::new(to_array_32(private_key, "DH private key")?);
        let public_bytes = to_array_32(public_key, "DH public key")?;

        let static_secret = StaticSecret::from(*secret_bytes);
        let shared = static_secret.diffie_hellman(&PublicKey::from(public_bytes));

        // Low-order peer points yield an all-zero secret.
        if !shared.was_contributory() {
            return Err(CryptoError::KeyAgreementError(
                "Non-contributory DH output".to_string(),
            ));
        }
        Ok(Zeroizing::new(shared.to_bytes().to_vec()))
    }

    fn generate_signing_keypair() -> Result<(SecretBytes, Vec<u8>), CryptoError> {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        Ok((
            Zeroizing::new(signing_key.to_bytes().to_vec()),
            verifying_key.to_bytes().to_vec(),
        ))
    }

    fn verifying_key_from_signing(signing_key: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let bytes = Zeroizing::new(to_array_32(signing_key, "signing key")?);
        let signing_key = SigningKey::from_bytes(&bytes);
        Ok(signing_key.verifying_key().to_bytes().to_vec())
    }

    fn sign(signing_key: &[u8], message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let bytes = Zeroizing::new(to_array_32(signing_key, "signing key")?);
        let signing_key = SigningKey::from_bytes(&bytes);
        Ok(signing_key.sign(message).to_bytes().to_vec())
    }

    fn verify(verifying_key: &[u8], message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        let vk_bytes = to_array_32(verifying_key, "verifying key")?;
        let verifying_key = VerifyingKey::from_bytes(&vk_bytes)
            .map_err(|e| CryptoError::InvalidInputError(format!("Invalid verifying key: {}", e)))?;

        let sig_bytes: [u8; 64] = signature
            .try_into()
            .map_err(|_| CryptoError::InvalidInputError("Invalid signature length".to_string()))?;
        let signature = Signature::from_bytes(&sig_bytes);

        verifying_key
            .verify(message, &signature)
            .map_err(|e| CryptoError::SignatureVerificationError(e.to_string()))
    }

    fn aead_encrypt(
        key: &[u8],
        nonce: &[u8],
        plaintext: &[u8],
        associated_data: Option<&[u8]>,
    ) -> Result<Vec<u8>, CryptoError> {
        let cipher = ChaCha20Poly1305::new_from_slice(key)
            .map_err(|_| CryptoError::InvalidInputError("Invalid AEAD key length".to_string()))?;
        if nonce.len() != Self::NONCE_LEN {
            return Err(CryptoError::InvalidInputError("Invalid nonce length".to_string()));
        }

        let payload = Payload {
            msg: plaintext,
            aad: associated_data.unwrap_or(b""),
        };

        cipher
            .encrypt(Nonce::from_slice(nonce), payload)
            .map_err(|e| CryptoError::AeadEncryptionError(e.to_string()))
    }

    fn aead_decrypt(
        key: &[u8],
        nonce: &[u8],
        ciphertext: &[u8],
        associated_data: Option<&[u8]>,
    ) -> Result<Vec<u8>, CryptoError> {
        let cipher = ChaCha20Poly1305::new_from_slice(key)
            .map_err(|_| CryptoError::InvalidInputError("Invalid AEAD key length".to_string()))?;
        if nonce.len() != Self::NONCE_LEN {
            return Err(CryptoError::InvalidInputError("Invalid nonce length".to_string()));
        }

        let payload = Payload {
            msg: ciphertext,
            aad: associated_data.unwrap_or(b""),
        };

        cipher
            .decrypt(Nonce::from_slice(nonce), payload)
            .map_err(|e| CryptoError::AeadDecryptionError(e.to_string()))
    }

    fn hkdf_derive_key(
        salt: &[u8],
        ikm: &[u8],
        info: &[u8],
        len: usize,
    ) -> Result<SecretBytes, CryptoError> {
        let hkdf = Hkdf::<Sha256>::new(Some(salt), ikm);
        let mut okm = Zeroizing::new(vec![0u8; len]);
        hkdf.expand(info, &mut okm)
            .map_err(|e| CryptoError::KeyDerivationError(e.to_string()))?;
        Ok(okm)
    }

    fn kdf_rk(root_key: &[u8], dh_output: &[u8]) -> Result<(SecretBytes, SecretBytes), CryptoError> {
        let output = Self::hkdf_derive_key(root_key, dh_output, ROOT_KEY_INFO, 64)?;
        Ok(split_64(&output))
    }

    fn kdf_ck(chain_key: &[u8]) -> Result<(SecretBytes, SecretBytes), CryptoError> {
        let output = Self::hkdf_derive_key(chain_key, b"", CHAIN_KEY_INFO, 64)?;
        Ok(split_64(&output))
    }

    fn generate_nonce(len: usize) -> Result<Vec<u8>, CryptoError> {
        let mut nonce_bytes = vec![0u8; len];
        OsRng
            .try_fill_bytes(&mut nonce_bytes)
            .map_err(|e| CryptoError::KeyGenerationError(e.to_string()))?;
        Ok(nonce_bytes)
    }

    fn suite_id() -> SuiteID {
        crate::config::Config::global().classic_suite_id
    }
}
