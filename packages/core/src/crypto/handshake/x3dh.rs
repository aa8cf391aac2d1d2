//! X3DH (Extended Triple Diffie-Hellman) Protocol
//!
//! ## Ключи
//!
//! ### Alice (инициатор)
//! - **IK_A**: Identity Key (долгосрочный)
//! - **EK_A**: Ephemeral Key (одноразовый, генерируется для каждой сессии)
//!
//! ### Bob (получатель)
//! - **IK_B**: Identity Key (долгосрочный)
//! - **SPK_B**: Signed Prekey, подписан identity signing key
//! - **OPK_B**: One-time Prekey (опционально, расходуется один раз)
//!
//! ## Протокол
//!
//! ```text
//! DH1 = DH(IK_A, SPK_B)
//! DH2 = DH(EK_A, IK_B)
//! DH3 = DH(EK_A, SPK_B)
//! DH4 = DH(EK_A, OPK_B)        // только если OPK_B есть в bundle
//! SK  = HKDF(DH1 || DH2 || DH3 [|| DH4])
//! ```
//!
//! Bob вычисляет те же DH в обратном направлении и получает тот же SK.

use crate::crypto::handshake::{InitiatorState, KeyAgreement, ResponderKeys};
use crate::crypto::keys::PublicKeyBundle;
use crate::crypto::provider::{CryptoProvider, SecretBytes};
use crate::error::CryptoError;
use std::marker::PhantomData;
use tracing::{debug, trace};
use zeroize::Zeroizing;

const ROOT_KEY_INFO: &[u8] = b"Parley X3DH Root Key";

/// X3DH Protocol Implementation
///
/// Stateless: все данные передаются через параметры методов.
pub struct X3DHProtocol<P: CryptoProvider> {
    _phantom: PhantomData<P>,
}

impl<P: CryptoProvider> X3DHProtocol<P> {
    fn derive_root_key(parts: &[&SecretBytes]) -> Result<SecretBytes, CryptoError> {
        let mut combined = Zeroizing::new(Vec::with_capacity(parts.len() * 32));
        for part in parts {
            combined.extend_from_slice(part);
        }
        P::hkdf_derive_key(b"", &combined, ROOT_KEY_INFO, 32)
    }
}

impl<P: CryptoProvider> KeyAgreement<P> for X3DHProtocol<P> {
    fn perform_as_initiator(
        local_identity_private: &[u8],
        remote_bundle: &PublicKeyBundle,
        verify_signature: bool,
    ) -> Result<(SecretBytes, InitiatorState), CryptoError> {
        debug!(
            target: "crypto::x3dh",
            peer = %remote_bundle.user_id,
            device_id = remote_bundle.device_id,
            "Starting X3DH as initiator"
        );

        if verify_signature {
            remote_bundle.verify_signature::<P>().map_err(|e| {
                debug!(target: "crypto::x3dh", error = %e, "Signed pre-key signature rejected");
                e
            })?;
            trace!(target: "crypto::x3dh", "Signed pre-key signature verified");
        }

        let (ephemeral_private, ephemeral_public) = P::generate_dh_keypair()?;
        let spk = &remote_bundle.signed_pre_key.public;
        let one_time = remote_bundle.one_time_pre_keys.first();

        let dh1 = P::dh(local_identity_private, spk)?;
        let dh2 = P::dh(&ephemeral_private, &remote_bundle.identity_public)?;
        let dh3 = P::dh(&ephemeral_private, spk)?;

        let root_key = match one_time {
            Some(opk) => {
                let dh4 = P::dh(&ephemeral_private, &opk.public)?;
                Self::derive_root_key(&[&dh1, &dh2, &dh3, &dh4])?
            }
            None => Self::derive_root_key(&[&dh1, &dh2, &dh3])?,
        };

        debug!(
            target: "crypto::x3dh",
            signed_pre_key_id = remote_bundle.signed_pre_key.key_id,
            one_time_pre_key_id = ?one_time.map(|k| k.key_id),
            "X3DH completed as initiator"
        );

        Ok((
            root_key,
            InitiatorState {
                ephemeral_private,
                ephemeral_public,
                signed_pre_key_id: remote_bundle.signed_pre_key.key_id,
                one_time_pre_key_id: one_time.map(|k| k.key_id),
            },
        ))
    }

    fn perform_as_responder(
        local: &ResponderKeys<'_>,
        remote_identity_public: &[u8],
        remote_ephemeral_public: &[u8],
    ) -> Result<SecretBytes, CryptoError> {
        debug!(target: "crypto::x3dh", "Starting X3DH as responder");

        let dh1 = P::dh(local.signed_pre_key_private, remote_identity_public)?;
        let dh2 = P::dh(local.identity_private, remote_ephemeral_public)?;
        let dh3 = P::dh(local.signed_pre_key_private, remote_ephemeral_public)?;

        let root_key = match local.one_time_pre_key_private {
            Some(opk_private) => {
                let dh4 = P::dh(opk_private, remote_ephemeral_public)?;
                Self::derive_root_key(&[&dh1, &dh2, &dh3, &dh4])?
            }
            None => Self::derive_root_key(&[&dh1, &dh2, &dh3])?,
        };

        debug!(target: "crypto::x3dh", "X3DH completed as responder");
        Ok(root_key)
    }
}
