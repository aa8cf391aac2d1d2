//! Defines the CryptoProvider trait for crypto-agility.

use crate::crypto::SuiteID;
use crate::error::CryptoError;
use zeroize::Zeroizing;

/// Secret key material. Wiped from memory on drop.
pub type SecretBytes = Zeroizing<Vec<u8>>;

/// Trait that formalizes all cryptographic operations for a specific cipher suite.
///
/// Keys cross this boundary as raw bytes; private halves are always returned
/// as [`SecretBytes`].
pub trait CryptoProvider: Send + Sync + 'static {
    /// Length of the AEAD nonce prepended to every sealed payload.
    const NONCE_LEN: usize;

    /// Generates a new Diffie-Hellman key pair `(private, public)`.
    fn generate_dh_keypair() -> Result<(SecretBytes, Vec<u8>), CryptoError>;

    /// Derives the DH public key from a DH private key.
    fn dh_public_from_private(private_key: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Computes the shared secret `DH(private_key, public_key)`.
    fn dh(private_key: &[u8], public_key: &[u8]) -> Result<SecretBytes, CryptoError>;

    /// Generates a new signing key pair `(signing, verifying)`.
    fn generate_signing_keypair() -> Result<(SecretBytes, Vec<u8>), CryptoError>;

    /// Derives the verifying key from a signing key.
    fn verifying_key_from_signing(signing_key: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Signs a message with the given signing key.
    fn sign(signing_key: &[u8], message: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Verifies a signature with the given verifying key.
    fn verify(verifying_key: &[u8], message: &[u8], signature: &[u8]) -> Result<(), CryptoError>;

    /// Performs AEAD encryption. Returns ciphertext with the tag appended.
    fn aead_encrypt(
        key: &[u8],
        nonce: &[u8],
        plaintext: &[u8],
        associated_data: Option<&[u8]>,
    ) -> Result<Vec<u8>, CryptoError>;

    /// Performs AEAD decryption of `ciphertext || tag`.
    fn aead_decrypt(
        key: &[u8],
        nonce: &[u8],
        ciphertext: &[u8],
        associated_data: Option<&[u8]>,
    ) -> Result<Vec<u8>, CryptoError>;

    /// Derives a key from input key material using HKDF.
    fn hkdf_derive_key(
        salt: &[u8],
        ikm: &[u8],
        info: &[u8],
        len: usize,
    ) -> Result<SecretBytes, CryptoError>;

    /// Derives `(new_root_key, chain_key)` from the current root key and a DH output.
    fn kdf_rk(root_key: &[u8], dh_output: &[u8]) -> Result<(SecretBytes, SecretBytes), CryptoError>;

    /// Derives `(message_key, next_chain_key)` from the current chain key.
    fn kdf_ck(chain_key: &[u8]) -> Result<(SecretBytes, SecretBytes), CryptoError>;

    /// Generates `len` cryptographically secure random bytes.
    fn generate_nonce(len: usize) -> Result<Vec<u8>, CryptoError>;

    /// Returns the SuiteID associated with this CryptoProvider.
    fn suite_id() -> SuiteID;

    /// Encrypts under a fresh random nonce and returns `nonce || ciphertext || tag`.
    fn seal(key: &[u8], plaintext: &[u8], associated_data: Option<&[u8]>) -> Result<Vec<u8>, CryptoError> {
        let nonce = Self::generate_nonce(Self::NONCE_LEN)?;
        let ciphertext = Self::aead_encrypt(key, &nonce, plaintext, associated_data)?;

        let mut sealed = Vec::with_capacity(nonce.len() + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Inverse of [`CryptoProvider::seal`].
    fn open(key: &[u8], sealed: &[u8], associated_data: Option<&[u8]>) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() <= Self::NONCE_LEN {
            return Err(CryptoError::AeadDecryptionError(
                "Sealed payload shorter than nonce".to_string(),
            ));
        }
        let (nonce, ciphertext) = sealed.split_at(Self::NONCE_LEN);
        Self::aead_decrypt(key, nonce, ciphertext, associated_data)
    }
}
