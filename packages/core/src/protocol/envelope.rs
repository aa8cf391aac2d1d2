// Envelope: представление зашифрованного сообщения на проводе и в хранилище
// JSON, camelCase. ciphertext = base64(nonce(12) || AEAD ciphertext+tag)

use crate::crypto::messaging::RatchetHeader;
use crate::utils::b64;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Версия 1: static ECDH (SessionCipher)
pub const VERSION_STATIC_ECDH: u32 = 1;
/// Версия 2: X3DH + Double Ratchet
pub const VERSION_RATCHET: u32 = 2;

const MIN_SEALED_LEN: usize = 12 + 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Text,
    Media,
    System,
}

/// Ratchet header в открытом виде
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeHeader {
    #[serde(with = "crate::utils::b64::serde_b64")]
    pub dh_public: Vec<u8>,
    pub message_number: u32,
    pub previous_chain_length: u32,
}

impl From<&RatchetHeader> for EnvelopeHeader {
    fn from(header: &RatchetHeader) -> Self {
        Self {
            dh_public: header.dh_public.clone(),
            message_number: header.message_number,
            previous_chain_length: header.previous_chain_length,
        }
    }
}

impl From<&EnvelopeHeader> for RatchetHeader {
    fn from(header: &EnvelopeHeader) -> Self {
        Self {
            dh_public: header.dh_public.clone(),
            message_number: header.message_number,
            previous_chain_length: header.previous_chain_length,
        }
    }
}

/// X3DH данные инициатора; передаются пока собеседник не ответил
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeHeader {
    #[serde(with = "crate::utils::b64::serde_b64")]
    pub identity_public: Vec<u8>,
    #[serde(with = "crate::utils::b64::serde_b64")]
    pub ephemeral_public: Vec<u8>,
    pub signed_pre_key_id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub one_time_pre_key_id: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub ciphertext: String,
    pub message_type: MessageType,
    pub encryption_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_device_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<EnvelopeHeader>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handshake: Option<HandshakeHeader>,
}

/// Ошибки разбора envelope. Обрабатываются локально (сообщение
/// помечается как нерасшифрованное), наружу не пробрасываются.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Malformed(String),

    #[error("envelope has no ciphertext")]
    MissingCiphertext,

    #[error("invalid ciphertext: {0}")]
    InvalidCiphertext(String),

    #[error("envelope version {version} requires senderDeviceId")]
    MissingSenderDeviceId { version: u32 },

    #[error("ratchet envelope has no header")]
    MissingRatchetHeader,

    #[error("unsupported encryption version {0}")]
    UnsupportedVersion(u32),

    #[error("envelope has no encryptionVersion")]
    MissingVersion,
}

/// Все поля опциональны, чтобы отличать "нет поля" от "неверный JSON"
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEnvelope {
    ciphertext: Option<String>,
    message_type: Option<MessageType>,
    encryption_version: Option<u32>,
    sender_device_id: Option<u32>,
    header: Option<EnvelopeHeader>,
    handshake: Option<HandshakeHeader>,
}

impl Envelope {
    /// Собрать envelope версии 1. Без I/O.
    pub fn encode(
        ciphertext: String,
        message_type: MessageType,
        encryption_version: u32,
        sender_device_id: u32,
    ) -> Self {
        Self {
            ciphertext,
            message_type,
            encryption_version,
            sender_device_id: Some(sender_device_id),
            header: None,
            handshake: None,
        }
    }

    /// Envelope версии 2 из зашифрованного ratchet сообщения
    pub fn with_ratchet(
        sealed: &[u8],
        message_type: MessageType,
        sender_device_id: u32,
        header: &RatchetHeader,
        handshake: Option<HandshakeHeader>,
    ) -> Self {
        Self {
            ciphertext: b64::encode(sealed),
            message_type,
            encryption_version: VERSION_RATCHET,
            sender_device_id: Some(sender_device_id),
            header: Some(EnvelopeHeader::from(header)),
            handshake,
        }
    }

    /// Разобрать envelope из JSON байтов с проверкой обязательных полей
    pub fn decode(raw: &[u8]) -> Result<Self, EnvelopeError> {
        let raw: RawEnvelope =
            serde_json::from_slice(raw).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;

        let envelope = Self {
            ciphertext: raw.ciphertext.ok_or(EnvelopeError::MissingCiphertext)?,
            message_type: raw.message_type.unwrap_or_default(),
            encryption_version: raw.encryption_version.ok_or(EnvelopeError::MissingVersion)?,
            sender_device_id: raw.sender_device_id,
            header: raw.header,
            handshake: raw.handshake,
        };
        envelope.validate()?;
        Ok(envelope)
    }

    /// Проверить инварианты уже собранного envelope
    pub fn validate(&self) -> Result<(), EnvelopeError> {
        match self.encryption_version {
            VERSION_STATIC_ECDH | VERSION_RATCHET => {}
            other => return Err(EnvelopeError::UnsupportedVersion(other)),
        }

        if self.sender_device_id.is_none() {
            return Err(EnvelopeError::MissingSenderDeviceId {
                version: self.encryption_version,
            });
        }

        if self.encryption_version == VERSION_RATCHET && self.header.is_none() {
            return Err(EnvelopeError::MissingRatchetHeader);
        }

        self.sealed_bytes().map(|_| ())
    }

    /// Раскодированный `nonce || ciphertext || tag`
    pub fn sealed_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        if self.ciphertext.is_empty() {
            return Err(EnvelopeError::MissingCiphertext);
        }
        let sealed = b64::decode(&self.ciphertext).map_err(EnvelopeError::InvalidCiphertext)?;
        if sealed.len() < MIN_SEALED_LEN {
            return Err(EnvelopeError::InvalidCiphertext(format!(
                "{} bytes is shorter than nonce and tag",
                sealed.len()
            )));
        }
        Ok(sealed)
    }

    pub fn to_json(&self) -> Result<String, EnvelopeError> {
        serde_json::to_string(self).map_err(|e| EnvelopeError::Malformed(e.to_string()))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(|e| EnvelopeError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_ciphertext() -> String {
        b64::encode(&[7u8; 40])
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let envelope = Envelope::encode(sample_ciphertext(), MessageType::Text, 1, 42);
        let bytes = envelope.to_bytes().unwrap();
        assert_eq!(Envelope::decode(&bytes).unwrap(), envelope);

        let json = envelope.to_json().unwrap();
        assert!(json.contains("\"encryptionVersion\":1"));
        assert!(json.contains("\"senderDeviceId\":42"));
        assert!(json.contains("\"messageType\":\"text\""));
        assert!(!json.contains("header"));
    }

    #[test]
    fn test_ratchet_envelope_roundtrip() {
        let header = RatchetHeader {
            dh_public: vec![1u8; 32],
            message_number: 3,
            previous_chain_length: 2,
        };
        let handshake = HandshakeHeader {
            identity_public: vec![2u8; 32],
            ephemeral_public: vec![3u8; 32],
            signed_pre_key_id: 1,
            one_time_pre_key_id: Some(17),
        };
        let envelope =
            Envelope::with_ratchet(&[9u8; 40], MessageType::Media, 5, &header, Some(handshake));

        let decoded = Envelope::decode(&envelope.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, envelope);
        assert_eq!(RatchetHeader::from(decoded.header.as_ref().unwrap()), header);
    }

    #[test]
    fn test_decode_errors_are_distinct() {
        let cases: Vec<(&str, EnvelopeError)> = vec![
            ("{not json", EnvelopeError::Malformed(String::new())),
            (
                r#"{"messageType":"text","encryptionVersion":1,"senderDeviceId":1}"#,
                EnvelopeError::MissingCiphertext,
            ),
            (
                r#"{"ciphertext":"","messageType":"text","encryptionVersion":1,"senderDeviceId":1}"#,
                EnvelopeError::MissingCiphertext,
            ),
            (
                r#"{"ciphertext":"@@@","messageType":"text","encryptionVersion":1,"senderDeviceId":1}"#,
                EnvelopeError::InvalidCiphertext(String::new()),
            ),
            (
                r#"{"ciphertext":"AAAA","messageType":"text","encryptionVersion":1}"#,
                EnvelopeError::MissingSenderDeviceId { version: 1 },
            ),
            (
                r#"{"ciphertext":"AAAA","messageType":"text","encryptionVersion":9,"senderDeviceId":1}"#,
                EnvelopeError::UnsupportedVersion(9),
            ),
            (
                r#"{"ciphertext":"AAAA","messageType":"text","senderDeviceId":1}"#,
                EnvelopeError::MissingVersion,
            ),
        ];

        for (raw, expected) in cases {
            let err = Envelope::decode(raw.as_bytes()).unwrap_err();
            assert_eq!(
                std::mem::discriminant(&err),
                std::mem::discriminant(&expected),
                "input {}: got {:?}",
                raw,
                err
            );
        }
    }

    #[test]
    fn test_ratchet_version_requires_header() {
        let raw = format!(
            r#"{{"ciphertext":"{}","messageType":"text","encryptionVersion":2,"senderDeviceId":1}}"#,
            sample_ciphertext()
        );
        assert_eq!(
            Envelope::decode(raw.as_bytes()).unwrap_err(),
            EnvelopeError::MissingRatchetHeader
        );
    }

    #[test]
    fn test_short_ciphertext_rejected() {
        let envelope = Envelope::encode(b64::encode(&[1u8; 12]), MessageType::Text, 1, 1);
        assert!(matches!(
            envelope.validate(),
            Err(EnvelopeError::InvalidCiphertext(_))
        ));
    }
}
