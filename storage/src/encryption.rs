//! Encryption of org-scoped secrets using AES-256-GCM.
//!
//! Secrets are stored as a base64 nonce (`iv`) plus base64 ciphertext. The
//! key comes from `SYNC_ENCRYPTION_KEY` and must be exactly 32 bytes.

use crate::models::Secret;
use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng}
};
use base64::{Engine as _, engine::general_purpose};
use errors::CredentialError;

const NONCE_LEN: usize = 12;

#[derive(Clone)]
pub struct SecretCipher {
    cipher: Aes256Gcm
}

impl std::fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretCipher").finish_non_exhaustive()
    }
}

impl SecretCipher {
    pub fn new(key_bytes: &[u8]) -> Result<Self, CredentialError> {
        if key_bytes.len() != 32 {
            return Err(CredentialError::InvalidTokenConfig {
                reason: "encryption key must be 32 bytes (256 bits)".to_string()
            });
        }
        let key = Key::<Aes256Gcm>::from_slice(key_bytes);
        Ok(Self {
            cipher: Aes256Gcm::new(key)
        })
    }

    /// Build from the raw `SYNC_ENCRYPTION_KEY` value.
    pub fn from_key_str(key: &str) -> Result<Self, CredentialError> {
        Self::new(key.as_bytes())
    }

    /// Encrypts `plaintext` into a storable secret row.
    pub fn encrypt(&self, org_id: i32, key: &str, plaintext: &str) -> Result<Secret, CredentialError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| CredentialError::DecryptionFailed {
                key: key.to_string(),
                reason: e.to_string()
            })?;

        Ok(Secret {
            org_id,
            key: key.to_string(),
            iv: general_purpose::STANDARD.encode(nonce.as_slice()),
            encrypted_value: general_purpose::STANDARD.encode(&ciphertext)
        })
    }

    pub fn decrypt(&self, secret: &Secret) -> Result<String, CredentialError> {
        let fail = |reason: String| CredentialError::DecryptionFailed {
            key: secret.key.clone(),
            reason
        };

        let nonce_bytes = general_purpose::STANDARD
            .decode(&secret.iv)
            .map_err(|e| fail(e.to_string()))?;
        if nonce_bytes.len() != NONCE_LEN {
            return Err(fail(format!("iv must be {NONCE_LEN} bytes")));
        }
        let ciphertext = general_purpose::STANDARD
            .decode(&secret.encrypted_value)
            .map_err(|e| fail(e.to_string()))?;

        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|e| fail(e.to_string()))?;

        String::from_utf8(plaintext).map_err(|e| fail(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "0123456789abcdef0123456789abcdef";

    #[test]
    fn test_encryption_roundtrip() {
        let cipher = SecretCipher::from_key_str(KEY).unwrap();
        let secret = cipher.encrypt(1, "GITHUB_PAT", "ghp_abc").unwrap();
        assert_ne!(secret.encrypted_value, "ghp_abc");
        assert_eq!(cipher.decrypt(&secret).unwrap(), "ghp_abc");
    }

    #[test]
    fn test_rejects_short_key() {
        assert!(matches!(
            SecretCipher::from_key_str("short"),
            Err(CredentialError::InvalidTokenConfig { .. })
        ));
    }

    #[test]
    fn test_wrong_key_fails_decryption() {
        let secret = SecretCipher::from_key_str(KEY)
            .unwrap()
            .encrypt(1, "k", "value")
            .unwrap();
        let other = SecretCipher::from_key_str("fedcba9876543210fedcba9876543210").unwrap();
        assert!(matches!(
            other.decrypt(&secret),
            Err(CredentialError::DecryptionFailed { .. })
        ));
    }

    #[test]
    fn test_tampered_iv_is_rejected() {
        let cipher = SecretCipher::from_key_str(KEY).unwrap();
        let mut secret = cipher.encrypt(1, "k", "value").unwrap();
        secret.iv = general_purpose::STANDARD.encode([0u8; 4]);
        assert!(cipher.decrypt(&secret).is_err());
    }
}
