// Мастер-ключ для шифрования данных "at rest"
// PBKDF2 для деривации ключа из пароля + AES-256-GCM для шифрования

use crate::config::Config;
use crate::utils::error::{CoreError, Result};
use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

// Compile-time константы для размеров массивов (должны совпадать с Config::default())
pub const SALT_LENGTH: usize = 32;
pub const KEY_LENGTH: usize = 32;

pub type MasterKey = Zeroizing<[u8; KEY_LENGTH]>;

/// Деривировать мастер-ключ из пароля с использованием PBKDF2
///
/// # Arguments
/// * `password` - Пользовательский пароль
/// * `salt` - Соль (32 байта)
///
/// # Returns
/// 256-битный ключ для AES-256-GCM
pub fn derive_master_key(password: &str, salt: &[u8]) -> Result<MasterKey> {
    if salt.len() != Config::global().salt_length {
        return Err(CoreError::CryptoError(format!(
            "Invalid salt length: expected {}, got {}",
            Config::global().salt_length,
            salt.len()
        )));
    }

    if password.is_empty() {
        return Err(CoreError::CryptoError(
            "Password cannot be empty".to_string(),
        ));
    }

    let mut key = Zeroizing::new([0u8; KEY_LENGTH]);

    pbkdf2_hmac::<Sha256>(
        password.as_bytes(),
        salt,
        Config::global().pbkdf2_iterations,
        &mut *key,
    );

    Ok(key)
}

/// Генерировать случайную соль
pub fn generate_salt() -> [u8; SALT_LENGTH] {
    let mut salt = [0u8; SALT_LENGTH];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

/// Случайный мастер-ключ (когда пароль не используется)
pub fn generate_master_key() -> MasterKey {
    let mut key = Zeroizing::new([0u8; KEY_LENGTH]);
    rand::rngs::OsRng.fill_bytes(&mut *key);
    key
}

/// Зашифровать данные AES-256-GCM. Результат: `nonce || ciphertext || tag`.
///
/// `aad` привязывает шифротекст к месту хранения (ключу записи).
pub fn encrypt_data(master_key: &[u8; KEY_LENGTH], data: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(master_key.into());
    let nonce_length = Config::global().nonce_length;

    let mut nonce_bytes = vec![0u8; nonce_length];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, Payload { msg: data, aad })
        .map_err(|e| CoreError::CryptoError(format!("Encryption failed: {}", e)))?;

    let mut result = Vec::with_capacity(nonce_length + ciphertext.len());
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&ciphertext);

    Ok(result)
}

/// Расшифровать данные, зашифрованные [`encrypt_data`]
pub fn decrypt_data(
    master_key: &[u8; KEY_LENGTH],
    data: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    let cipher = Aes256Gcm::new(master_key.into());
    let nonce_length = Config::global().nonce_length;

    if data.len() < nonce_length + Config::global().aead_tag_length {
        return Err(CoreError::CryptoError(
            "Invalid ciphertext: too short".to_string(),
        ));
    }

    let (nonce_bytes, ciphertext) = data.split_at(nonce_length);
    let nonce = Nonce::from_slice(nonce_bytes);

    let plaintext = cipher
        .decrypt(nonce, Payload { msg: ciphertext, aad })
        .map_err(|e| CoreError::CryptoError(format!("Decryption failed: {}", e)))?;

    Ok(Zeroizing::new(plaintext))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_master_key() {
        let salt = generate_salt();
        let password = "test_password_123";

        let key1 = derive_master_key(password, &salt).unwrap();
        let key2 = derive_master_key(password, &salt).unwrap();

        // Одинаковый пароль и соль должны давать одинаковый ключ
        assert_eq!(&*key1, &*key2);
    }

    #[test]
    fn test_derive_master_key_different_salt() {
        let password = "test_password_123";

        let key1 = derive_master_key(password, &generate_salt()).unwrap();
        let key2 = derive_master_key(password, &generate_salt()).unwrap();

        assert_ne!(&*key1, &*key2);
    }

    #[test]
    fn test_derive_rejects_bad_input() {
        assert!(derive_master_key("", &generate_salt()).is_err());
        assert!(derive_master_key("password", &[0u8; 8]).is_err());
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = generate_master_key();
        let encrypted = encrypt_data(&key, b"device bundle", b"secure/keystore").unwrap();

        let expected_len = Config::global().nonce_length + 13 + Config::global().aead_tag_length;
        assert_eq!(encrypted.len(), expected_len);

        let decrypted = decrypt_data(&key, &encrypted, b"secure/keystore").unwrap();
        assert_eq!(decrypted.as_slice(), b"device bundle");
    }

    #[test]
    fn test_decrypt_with_wrong_key_or_aad() {
        let key = generate_master_key();
        let other = generate_master_key();
        let encrypted = encrypt_data(&key, b"secret", b"secure/a").unwrap();

        assert!(decrypt_data(&other, &encrypted, b"secure/a").is_err());
        // Запись, перенесённая под другой ключ хранилища, не расшифровывается
        assert!(decrypt_data(&key, &encrypted, b"secure/b").is_err());
        assert!(decrypt_data(&key, &encrypted[..10], b"secure/a").is_err());
    }
}
