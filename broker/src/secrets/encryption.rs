use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, AeadCore, KeyInit, Payload},
};
use base64::{Engine as _, engine::general_purpose};
use pbkdf2::pbkdf2_hmac;
use rand::{RngCore, rngs::OsRng};
use sha2::Sha256;
use thiserror::Error;
use zeroize::{ZeroizeOnDrop, Zeroizing};

const PBKDF2_ITERATIONS: u32 = 100_000;
pub const SALT_LENGTH: usize = 32;
const KEY_LENGTH: usize = 32;
const NONCE_LENGTH: usize = 12;

const ERROR_EMPTY_SECRET: &str = "Secret cannot be empty";
const ERROR_EMPTY_PASSWORD: &str = "Master password cannot be empty";
const ERROR_EMPTY_ENCRYPTED_DATA: &str = "Encrypted data cannot be empty";
const ERROR_ENCRYPTED_DATA_TOO_SHORT: &str = "Encrypted data too short";

#[derive(Debug, Error)]
pub enum EncryptionError {
    #[error("Invalid data: {0}")]
    InvalidData(String),
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),
}

#[derive(ZeroizeOnDrop)]
struct SecureKey([u8; KEY_LENGTH]);

/// AES-256-GCM with a PBKDF2-HMAC-SHA256 derived key.
///
/// The key is derived once per cipher; each value gets a fresh random nonce.
/// Ciphertexts are bound to a caller-provided label (used as associated
/// data) so a value cannot be moved to another label undetected.
pub struct SecretCipher {
    salt: [u8; SALT_LENGTH],
    key: SecureKey,
}

impl SecretCipher {
    /// Derives a cipher from `password` with a new random salt.
    ///
    /// # Errors
    ///
    /// Fails for an empty password.
    pub fn new(password: &str) -> Result<Self, EncryptionError> {
        let mut salt = [0u8; SALT_LENGTH];
        OsRng.fill_bytes(&mut salt);
        Self::with_salt(password, salt)
    }

    /// # Errors
    ///
    /// Fails for an empty password.
    pub fn with_salt(password: &str, salt: [u8; SALT_LENGTH]) -> Result<Self, EncryptionError> {
        if password.trim().is_empty() {
            return Err(EncryptionError::KeyDerivation(
                ERROR_EMPTY_PASSWORD.to_string(),
            ));
        }

        let mut key = [0u8; KEY_LENGTH];
        pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, PBKDF2_ITERATIONS, &mut key);
        Ok(Self {
            salt,
            key: SecureKey(key),
        })
    }

    /// # Errors
    ///
    /// Fails for an empty password or a salt that is not valid base64 of the
    /// expected length.
    pub fn from_salt_base64(password: &str, salt_b64: &str) -> Result<Self, EncryptionError> {
        let salt_bytes = general_purpose::STANDARD
            .decode(salt_b64)
            .map_err(|e| EncryptionError::InvalidData(format!("Invalid salt base64: {e}")))?;

        if salt_bytes.len() != SALT_LENGTH {
            return Err(EncryptionError::InvalidData(format!(
                "Salt length must be {} bytes, got {}",
                SALT_LENGTH,
                salt_bytes.len()
            )));
        }

        let mut salt = [0u8; SALT_LENGTH];
        salt.copy_from_slice(&salt_bytes);
        Self::with_salt(password, salt)
    }

    pub fn salt_base64(&self) -> String {
        general_purpose::STANDARD.encode(self.salt)
    }

    fn cipher(&self) -> Result<Aes256Gcm, EncryptionError> {
        Aes256Gcm::new_from_slice(&self.key.0)
            .map_err(|e| EncryptionError::KeyDerivation(format!("Invalid key: {e}")))
    }

    /// Encrypts `plaintext` under `label`; output is base64(nonce || ciphertext).
    ///
    /// # Errors
    ///
    /// Fails for empty plaintext or if AES-GCM rejects the input.
    pub fn encrypt(&self, label: &str, plaintext: &str) -> Result<String, EncryptionError> {
        if plaintext.is_empty() {
            return Err(EncryptionError::InvalidData(ERROR_EMPTY_SECRET.to_string()));
        }

        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher()?
            .encrypt(
                &nonce,
                Payload {
                    msg: plaintext.as_bytes(),
                    aad: label.as_bytes(),
                },
            )
            .map_err(|e| {
                EncryptionError::EncryptionFailed(format!("AES-GCM encryption failed: {e}"))
            })?;

        let mut combined = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
        combined.extend_from_slice(&nonce);
        combined.extend_from_slice(&ciphertext);

        Ok(general_purpose::STANDARD.encode(combined))
    }

    /// # Errors
    ///
    /// Fails on malformed input, a wrong password, or a label mismatch.
    pub fn decrypt(&self, label: &str, encrypted: &str) -> Result<Zeroizing<String>, EncryptionError> {
        if encrypted.trim().is_empty() {
            return Err(EncryptionError::InvalidData(
                ERROR_EMPTY_ENCRYPTED_DATA.to_string(),
            ));
        }

        let combined = general_purpose::STANDARD
            .decode(encrypted)
            .map_err(|e| EncryptionError::InvalidData(format!("Invalid base64: {e}")))?;

        if combined.len() < NONCE_LENGTH {
            return Err(EncryptionError::InvalidData(
                ERROR_ENCRYPTED_DATA_TOO_SHORT.to_string(),
            ));
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LENGTH);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = Zeroizing::new(
            self.cipher()?
                .decrypt(
                    nonce,
                    Payload {
                        msg: ciphertext,
                        aad: label.as_bytes(),
                    },
                )
                .map_err(|e| {
                    EncryptionError::DecryptionFailed(format!("AES-GCM decryption failed: {e}"))
                })?,
        );

        String::from_utf8(plaintext.to_vec())
            .map(Zeroizing::new)
            .map_err(|e| EncryptionError::DecryptionFailed(format!("Invalid UTF-8: {e}")))
    }
}
