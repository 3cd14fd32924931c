//! AES-256-GCM encryption for provider tokens at rest.
//!
//! Stored form is `base64(nonce):base64(tag):base64(body)` with the standard
//! alphabet. Nonce and tag segments are fixed width, so anything that does
//! not match that shape is treated as legacy plaintext.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use thiserror::Error;
use tracing::warn;

/// Key length in bytes.
pub const KEY_LEN: usize = 32;

const TAG_LEN: usize = 16;
/// `base64(12 bytes)`.
const NONCE_B64_LEN: usize = 16;
/// `base64(16 bytes)`.
const TAG_B64_LEN: usize = 24;

/// Errors that can occur while setting up or using the vault.
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("vault key must be {KEY_LEN} bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("vault key is not valid base64")]
    InvalidKeyEncoding,

    #[error("encryption failed")]
    Encrypt,

    #[error("random nonce generation failed")]
    Rng,
}

/// Result type for vault operations.
pub type Result<T> = std::result::Result<T, VaultError>;

/// Encrypts and decrypts credential strings with a process-wide key.
#[derive(Clone)]
pub struct CredentialVault {
    key: [u8; KEY_LEN],
    rng: SystemRandom,
}

impl CredentialVault {
    /// Creates a vault from raw key bytes.
    pub fn new(key: &[u8]) -> Result<Self> {
        let key: [u8; KEY_LEN] = key
            .try_into()
            .map_err(|_| VaultError::InvalidKeyLength(key.len()))?;
        Ok(Self {
            key,
            rng: SystemRandom::new(),
        })
    }

    /// Creates a vault from a base64-encoded key.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|_| VaultError::InvalidKeyEncoding)?;
        Self::new(&bytes)
    }

    /// Generates a fresh random key, base64-encoded.
    pub fn generate_key() -> Result<String> {
        let mut key = [0u8; KEY_LEN];
        SystemRandom::new().fill(&mut key).map_err(|_| VaultError::Rng)?;
        Ok(STANDARD.encode(key))
    }

    fn sealing_key(&self) -> Result<LessSafeKey> {
        let unbound = UnboundKey::new(&AES_256_GCM, &self.key)
            .map_err(|_| VaultError::InvalidKeyLength(KEY_LEN))?;
        Ok(LessSafeKey::new(unbound))
    }

    /// Encrypts a string.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        self.encrypt_bytes(plaintext.as_bytes())
    }

    /// Encrypts arbitrary bytes with a fresh random nonce.
    pub fn encrypt_bytes(&self, plaintext: &[u8]) -> Result<String> {
        let key = self.sealing_key()?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng.fill(&mut nonce_bytes).map_err(|_| VaultError::Rng)?;

        let mut in_out = plaintext.to_vec();
        let tag = key
            .seal_in_place_separate_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::empty(),
                &mut in_out,
            )
            .map_err(|_| VaultError::Encrypt)?;

        Ok(format!(
            "{}:{}:{}",
            STANDARD.encode(nonce_bytes),
            STANDARD.encode(tag.as_ref()),
            STANDARD.encode(&in_out)
        ))
    }

    /// Decrypts a value produced by [`encrypt`](Self::encrypt).
    ///
    /// Returns `None` on any failure: wrong shape, bad base64, tag mismatch
    /// or non-UTF-8 plaintext.
    pub fn decrypt(&self, stored: &str) -> Option<String> {
        self.decrypt_bytes(stored)
            .and_then(|bytes| String::from_utf8(bytes).ok())
    }

    /// Byte-level counterpart of [`decrypt`](Self::decrypt).
    pub fn decrypt_bytes(&self, stored: &str) -> Option<Vec<u8>> {
        let (nonce, tag, body) = split_envelope(stored)?;

        let nonce: [u8; NONCE_LEN] = STANDARD.decode(nonce).ok()?.try_into().ok()?;
        let tag = STANDARD.decode(tag).ok()?;
        if tag.len() != TAG_LEN {
            return None;
        }

        let mut in_out = STANDARD.decode(body).ok()?;
        in_out.extend_from_slice(&tag);

        let key = self.sealing_key().ok()?;
        let plaintext = key
            .open_in_place(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut in_out)
            .ok()?;
        Some(plaintext.to_vec())
    }

    /// Decrypts, returning the input unchanged if it is legacy plaintext or
    /// cannot be decrypted. Never fails.
    pub fn decrypt_with_fallback(&self, stored: &str) -> String {
        if !is_encrypted(stored) {
            return stored.to_string();
        }
        match self.decrypt(stored) {
            Some(plaintext) => plaintext,
            None => {
                warn!("Stored credential has encrypted shape but failed to decrypt");
                stored.to_string()
            }
        }
    }
}

impl fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialVault")
            .field("key", &"<redacted>")
            .finish()
    }
}

fn split_envelope(stored: &str) -> Option<(&str, &str, &str)> {
    let mut parts = stored.split(':');
    let nonce = parts.next()?;
    let tag = parts.next()?;
    let body = parts.next()?;
    if parts.next().is_some() || nonce.len() != NONCE_B64_LEN || tag.len() != TAG_B64_LEN {
        return None;
    }
    Some((nonce, tag, body))
}

/// Returns whether `stored` has the encrypted envelope shape.
///
/// Distinguishes "already plaintext" from "failed to decrypt".
pub fn is_encrypted(stored: &str) -> bool {
    match split_envelope(stored) {
        Some((nonce, tag, body)) => {
            STANDARD.decode(nonce).map(|n| n.len() == NONCE_LEN).unwrap_or(false)
                && STANDARD.decode(tag).map(|t| t.len() == TAG_LEN).unwrap_or(false)
                && STANDARD.decode(body).is_ok()
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn vault() -> CredentialVault {
        CredentialVault::new(&[7u8; KEY_LEN]).unwrap()
    }

    #[test]
    fn rejects_wrong_key_length() {
        assert!(matches!(
            CredentialVault::new(&[0u8; 16]),
            Err(VaultError::InvalidKeyLength(16))
        ));
        assert!(matches!(
            CredentialVault::from_base64("not base64!"),
            Err(VaultError::InvalidKeyEncoding)
        ));
    }

    #[test]
    fn generated_key_is_usable() {
        let key = CredentialVault::generate_key().unwrap();
        let vault = CredentialVault::from_base64(&key).unwrap();
        let sealed = vault.encrypt("ya29.token").unwrap();
        assert_eq!(vault.decrypt(&sealed).as_deref(), Some("ya29.token"));
    }

    #[test]
    fn ciphertext_has_fixed_width_segments() {
        let sealed = vault().encrypt("hello").unwrap();
        let parts: Vec<&str> = sealed.split(':').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), NONCE_B64_LEN);
        assert_eq!(parts[1].len(), TAG_B64_LEN);
        assert!(is_encrypted(&sealed));
    }

    #[test]
    fn nonces_are_unique_per_call() {
        let v = vault();
        assert_ne!(v.encrypt("same").unwrap(), v.encrypt("same").unwrap());
    }

    #[test]
    fn empty_plaintext_round_trips() {
        let v = vault();
        let sealed = v.encrypt("").unwrap();
        assert!(sealed.ends_with(':'));
        assert_eq!(v.decrypt(&sealed).as_deref(), Some(""));
    }

    #[test]
    fn tampering_is_detected() {
        let v = vault();
        let sealed = v.encrypt("refresh-token-value").unwrap();
        let (prefix, body) = sealed.rsplit_once(':').unwrap();
        let mut body_bytes = STANDARD.decode(body).unwrap();
        body_bytes[0] ^= 0x01;
        let tampered = format!("{}:{}", prefix, STANDARD.encode(body_bytes));

        assert!(is_encrypted(&tampered));
        assert_eq!(v.decrypt(&tampered), None);
        // Fallback hands back the stored value rather than failing.
        assert_eq!(v.decrypt_with_fallback(&tampered), tampered);
    }

    #[test]
    fn wrong_key_fails_to_decrypt() {
        let sealed = vault().encrypt("secret").unwrap();
        let other = CredentialVault::new(&[9u8; KEY_LEN]).unwrap();
        assert_eq!(other.decrypt(&sealed), None);
    }

    #[test]
    fn legacy_plaintext_passes_through() {
        let v = vault();
        assert!(!is_encrypted("ya29.a0AfH6SMBplain"));
        assert_eq!(v.decrypt("ya29.a0AfH6SMBplain"), None);
        assert_eq!(v.decrypt_with_fallback("ya29.a0AfH6SMBplain"), "ya29.a0AfH6SMBplain");
        assert_eq!(v.decrypt_with_fallback("a:b:c"), "a:b:c");
        assert_eq!(v.decrypt_with_fallback(""), "");
    }

    #[test]
    fn debug_redacts_key() {
        let rendered = format!("{:?}", vault());
        assert!(rendered.contains("redacted"));
        assert!(!rendered.contains("7, 7"));
    }

    proptest! {
        #[test]
        fn bytes_round_trip(data in proptest::collection::vec(any::<u8>(), 0..8192)) {
            let v = vault();
            let sealed = v.encrypt_bytes(&data).unwrap();
            prop_assert_eq!(v.decrypt_bytes(&sealed), Some(data));
        }

        #[test]
        fn strings_round_trip(s in ".{0,512}") {
            let v = vault();
            let sealed = v.encrypt(&s).unwrap();
            prop_assert_eq!(v.decrypt(&sealed), Some(s));
        }

        #[test]
        fn fallback_returns_foreign_values_unchanged(s in ".{0,256}") {
            let v = vault();
            prop_assert_eq!(v.decrypt_with_fallback(&s), s);
        }
    }
}
