// Ключи устройства
// Identity, signed pre-key, one-time pre-keys и их публичная проекция

use crate::crypto::provider::CryptoProvider;
use crate::crypto::SuiteID;
use crate::error::CryptoError;
use crate::utils::error::Result;
use crate::utils::time::current_timestamp;
use crate::utils::validation::{validate_device_id, validate_public_key, validate_signature};
use rand::rngs::OsRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Upper bound for device and registration ids (`2^31 - 1`).
pub const MAX_DEVICE_ID: u32 = (1 << 31) - 1;

fn random_id() -> u32 {
    OsRng.gen_range(1..=MAX_DEVICE_ID)
}

/// Short hex fingerprint of a public key, safe to log.
pub fn fingerprint(public_key: &[u8]) -> String {
    let digest = Sha256::digest(public_key);
    hex::encode(&digest[..8])
}

/// Долгосрочная пара ключей устройства: X25519 для DH и Ed25519 для подписей
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct IdentityKeyPair {
    pub dh_private: Vec<u8>,
    #[zeroize(skip)]
    pub dh_public: Vec<u8>,
    pub signing_key: Vec<u8>,
    #[zeroize(skip)]
    pub verifying_key: Vec<u8>,
}

impl IdentityKeyPair {
    pub fn generate<P: CryptoProvider>() -> std::result::Result<Self, CryptoError> {
        let (dh_private, dh_public) = P::generate_dh_keypair()?;
        let (signing_key, verifying_key) = P::generate_signing_keypair()?;
        Ok(Self {
            dh_private: dh_private.to_vec(),
            dh_public,
            signing_key: signing_key.to_vec(),
            verifying_key,
        })
    }
}

impl fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("dh_public", &fingerprint(&self.dh_public))
            .field("verifying_key", &fingerprint(&self.verifying_key))
            .finish_non_exhaustive()
    }
}

/// Signed pre-key: X25519 пара, подписанная identity signing key
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct SignedPreKey {
    #[zeroize(skip)]
    pub key_id: u32,
    #[zeroize(skip)]
    pub public: Vec<u8>,
    pub private: Vec<u8>,
    #[zeroize(skip)]
    pub signature: Vec<u8>,
    #[zeroize(skip)]
    pub created_at: i64,
}

impl SignedPreKey {
    pub fn generate<P: CryptoProvider>(
        key_id: u32,
        identity: &IdentityKeyPair,
    ) -> std::result::Result<Self, CryptoError> {
        let (private, public) = P::generate_dh_keypair()?;
        let signature = P::sign(&identity.signing_key, &public)?;
        Ok(Self {
            key_id,
            public,
            private: private.to_vec(),
            signature,
            created_at: current_timestamp(),
        })
    }

    pub fn to_public(&self) -> SignedPreKeyPublic {
        SignedPreKeyPublic {
            key_id: self.key_id,
            public: self.public.clone(),
            signature: self.signature.clone(),
        }
    }
}

impl fmt::Debug for SignedPreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignedPreKey")
            .field("key_id", &self.key_id)
            .field("public", &fingerprint(&self.public))
            .finish_non_exhaustive()
    }
}

/// One-time pre-key, consumed by the first handshake that references it
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct OneTimePreKey {
    #[zeroize(skip)]
    pub key_id: u32,
    #[zeroize(skip)]
    pub public: Vec<u8>,
    pub private: Vec<u8>,
}

impl OneTimePreKey {
    pub fn to_public(&self) -> OneTimePreKeyPublic {
        OneTimePreKeyPublic {
            key_id: self.key_id,
            public: self.public.clone(),
        }
    }
}

impl fmt::Debug for OneTimePreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OneTimePreKey")
            .field("key_id", &self.key_id)
            .field("public", &fingerprint(&self.public))
            .finish_non_exhaustive()
    }
}

/// Полный набор ключей устройства (хранится только в SecureStorage)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceKeyBundle {
    pub device_id: u32,
    pub registration_id: u32,
    pub identity: IdentityKeyPair,
    pub signed_pre_key: SignedPreKey,
    pub one_time_pre_keys: Vec<OneTimePreKey>,
    pub next_pre_key_id: u32,
    pub created_at: i64,
}

impl DeviceKeyBundle {
    /// Generate every field of a fresh device identity.
    pub fn generate<P: CryptoProvider>(
        one_time_count: u32,
    ) -> std::result::Result<Self, CryptoError> {
        let identity = IdentityKeyPair::generate::<P>()?;
        let signed_pre_key = SignedPreKey::generate::<P>(1, &identity)?;

        let mut bundle = Self {
            device_id: random_id(),
            registration_id: random_id(),
            identity,
            signed_pre_key,
            one_time_pre_keys: Vec::new(),
            next_pre_key_id: 1,
            created_at: current_timestamp(),
        };
        bundle.generate_one_time_pre_keys::<P>(one_time_count)?;
        Ok(bundle)
    }

    /// Append `count` new one-time pre-keys with fresh ids.
    pub fn generate_one_time_pre_keys<P: CryptoProvider>(
        &mut self,
        count: u32,
    ) -> std::result::Result<Vec<OneTimePreKeyPublic>, CryptoError> {
        let mut added = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let (private, public) = P::generate_dh_keypair()?;
            let key = OneTimePreKey {
                key_id: self.next_pre_key_id,
                public,
                private: private.to_vec(),
            };
            self.next_pre_key_id = self.next_pre_key_id.wrapping_add(1).max(1);
            added.push(key.to_public());
            self.one_time_pre_keys.push(key);
        }
        Ok(added)
    }

    pub fn one_time_pre_key(&self, key_id: u32) -> Option<&OneTimePreKey> {
        self.one_time_pre_keys.iter().find(|k| k.key_id == key_id)
    }

    /// Remove and return a one-time pre-key.
    pub fn take_one_time_pre_key(&mut self, key_id: u32) -> Option<OneTimePreKey> {
        let index = self
            .one_time_pre_keys
            .iter()
            .position(|k| k.key_id == key_id)?;
        Some(self.one_time_pre_keys.remove(index))
    }

    pub fn signed_pre_key_by_id(&self, key_id: u32) -> Option<&SignedPreKey> {
        (self.signed_pre_key.key_id == key_id).then_some(&self.signed_pre_key)
    }

    /// Public projection. No private field survives this call.
    pub fn public_bundle<P: CryptoProvider>(&self, user_id: &str) -> PublicKeyBundle {
        PublicKeyBundle {
            user_id: user_id.to_string(),
            device_id: self.device_id,
            registration_id: self.registration_id,
            identity_public: self.identity.dh_public.clone(),
            identity_verifying_key: self.identity.verifying_key.clone(),
            signed_pre_key: self.signed_pre_key.to_public(),
            one_time_pre_keys: self
                .one_time_pre_keys
                .iter()
                .map(OneTimePreKey::to_public)
                .collect(),
            suite_id: P::suite_id(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedPreKeyPublic {
    pub key_id: u32,
    #[serde(with = "crate::utils::b64::serde_b64")]
    pub public: Vec<u8>,
    #[serde(with = "crate::utils::b64::serde_b64")]
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OneTimePreKeyPublic {
    pub key_id: u32,
    #[serde(with = "crate::utils::b64::serde_b64")]
    pub public: Vec<u8>,
}

/// Публичные ключи устройства, которые публикуются в key directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyBundle {
    pub user_id: String,
    pub device_id: u32,
    pub registration_id: u32,
    #[serde(with = "crate::utils::b64::serde_b64")]
    pub identity_public: Vec<u8>,
    #[serde(with = "crate::utils::b64::serde_b64")]
    pub identity_verifying_key: Vec<u8>,
    pub signed_pre_key: SignedPreKeyPublic,
    #[serde(default)]
    pub one_time_pre_keys: Vec<OneTimePreKeyPublic>,
    pub suite_id: SuiteID,
}

impl PublicKeyBundle {
    /// Check the signed pre-key signature against the identity signing key.
    pub fn verify_signature<P: CryptoProvider>(&self) -> std::result::Result<(), CryptoError> {
        P::verify(
            &self.identity_verifying_key,
            &self.signed_pre_key.public,
            &self.signed_pre_key.signature,
        )
    }

    /// Structural checks: id ranges and key sizes.
    pub fn validate(&self) -> Result<()> {
        validate_device_id(self.device_id)?;
        validate_device_id(self.registration_id)?;
        validate_public_key(&self.identity_public)?;
        validate_public_key(&self.identity_verifying_key)?;
        validate_public_key(&self.signed_pre_key.public)?;
        validate_signature(&self.signed_pre_key.signature)?;
        for key in &self.one_time_pre_keys {
            validate_public_key(&key.public)?;
        }
        Ok(())
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(&self.identity_public)
    }

    /// Copy without one-time pre-keys, for caching.
    pub fn without_one_time_pre_keys(&self) -> Self {
        Self {
            one_time_pre_keys: Vec::new(),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::suites::classic::ClassicSuiteProvider;

    #[test]
    fn test_generate_bundle_ranges() {
        let bundle = DeviceKeyBundle::generate::<ClassicSuiteProvider>(5).unwrap();
        assert!(bundle.device_id >= 1 && bundle.device_id <= MAX_DEVICE_ID);
        assert!(bundle.registration_id >= 1 && bundle.registration_id <= MAX_DEVICE_ID);
        assert_eq!(bundle.one_time_pre_keys.len(), 5);
        assert_eq!(bundle.next_pre_key_id, 6);
    }

    #[test]
    fn test_public_bundle_has_no_private_material() {
        let bundle = DeviceKeyBundle::generate::<ClassicSuiteProvider>(3).unwrap();
        let public = bundle.public_bundle::<ClassicSuiteProvider>("alice");
        let json = serde_json::to_string(&public).unwrap();

        let secrets = [
            crate::utils::b64::encode(&bundle.identity.dh_private),
            crate::utils::b64::encode(&bundle.identity.signing_key),
            crate::utils::b64::encode(&bundle.signed_pre_key.private),
        ];
        for secret in secrets {
            assert!(!json.contains(&secret));
        }
        public.validate().unwrap();
    }

    #[test]
    fn test_signature_verification() {
        let bundle = DeviceKeyBundle::generate::<ClassicSuiteProvider>(0).unwrap();
        let mut public = bundle.public_bundle::<ClassicSuiteProvider>("bob");
        assert!(public.verify_signature::<ClassicSuiteProvider>().is_ok());

        public.signed_pre_key.signature[0] ^= 0xFF;
        assert!(public.verify_signature::<ClassicSuiteProvider>().is_err());
    }

    #[test]
    fn test_take_one_time_pre_key_removes_it() {
        let mut bundle = DeviceKeyBundle::generate::<ClassicSuiteProvider>(2).unwrap();
        let id = bundle.one_time_pre_keys[0].key_id;

        assert!(bundle.take_one_time_pre_key(id).is_some());
        assert!(bundle.take_one_time_pre_key(id).is_none());
        assert_eq!(bundle.one_time_pre_keys.len(), 1);
    }

    #[test]
    fn test_debug_redacts_private_keys() {
        let bundle = DeviceKeyBundle::generate::<ClassicSuiteProvider>(1).unwrap();
        let debug = format!("{:?}", bundle);
        assert!(!debug.contains("dh_private"));
        assert!(!debug.contains("signing_key:"));
    }
}
