use crate::config::Config;
use crate::crypto::keys::MAX_DEVICE_ID;
use crate::utils::error::{CoreError, Result};

pub fn validate_public_key(key: &[u8]) -> Result<()> {
    let expected_size = Config::global().public_key_size;
    if key.len() != expected_size {
        return Err(CoreError::ValidationError(format!(
            "Public key must be {} bytes",
            expected_size
        )));
    }
    Ok(())
}

pub fn validate_signature(sig: &[u8]) -> Result<()> {
    let expected_size = Config::global().signature_size;
    if sig.len() != expected_size {
        return Err(CoreError::ValidationError(format!(
            "Signature must be {} bytes",
            expected_size
        )));
    }
    Ok(())
}

/// Device and registration ids live in `1..=2^31-1`.
pub fn validate_device_id(id: u32) -> Result<()> {
    if id == 0 || id > MAX_DEVICE_ID {
        return Err(CoreError::ValidationError(format!(
            "Device id {} out of range",
            id
        )));
    }
    Ok(())
}
