//! AES-256-GCM encryption of long-lived platform credentials.
//!
//! Stored form is `base64(nonce || ciphertext || tag)` with a fresh random
//! 96-bit nonce per call.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use ring::{
    aead::{AES_256_GCM, Aad, LessSafeKey, NONCE_LEN, Nonce, UnboundKey},
    rand::{SecureRandom, SystemRandom},
};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption key must be base64 of 32 bytes")]
    InvalidKey,
    #[error("refusing to encrypt or decrypt an empty value")]
    Empty,
    #[error("random nonce generation failed")]
    Random,
    #[error("encryption failed")]
    Seal,
    #[error("decryption failed: wrong key or corrupted value")]
    Open,
}

#[derive(Clone)]
pub struct CredentialCipher {
    key: [u8; 32],
    rng: SystemRandom,
}

impl fmt::Debug for CredentialCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialCipher").finish_non_exhaustive()
    }
}

impl CredentialCipher {
    pub fn new(key: [u8; 32]) -> Self {
        Self {
            key,
            rng: SystemRandom::new(),
        }
    }

    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let raw = BASE64
            .decode(encoded.trim())
            .map_err(|_| CryptoError::InvalidKey)?;
        let key: [u8; 32] = raw.try_into().map_err(|_| CryptoError::InvalidKey)?;
        Ok(Self::new(key))
    }

    pub fn ephemeral() -> Result<Self, CryptoError> {
        let rng = SystemRandom::new();
        let mut key = [0u8; 32];
        rng.fill(&mut key).map_err(|_| CryptoError::Random)?;
        Ok(Self { key, rng })
    }

    fn sealing_key(&self) -> Result<LessSafeKey, CryptoError> {
        let unbound = UnboundKey::new(&AES_256_GCM, &self.key).map_err(|_| CryptoError::InvalidKey)?;
        Ok(LessSafeKey::new(unbound))
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        if plaintext.is_empty() {
            return Err(CryptoError::Empty);
        }
        let key = self.sealing_key()?;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng.fill(&mut nonce_bytes).map_err(|_| CryptoError::Random)?;

        let mut in_out = plaintext.as_bytes().to_vec();
        key.seal_in_place_append_tag(
            Nonce::assume_unique_for_key(nonce_bytes),
            Aad::empty(),
            &mut in_out,
        )
        .map_err(|_| CryptoError::Seal)?;

        let mut stored = Vec::with_capacity(NONCE_LEN + in_out.len());
        stored.extend_from_slice(&nonce_bytes);
        stored.extend_from_slice(&in_out);
        Ok(BASE64.encode(stored))
    }

    pub fn decrypt(&self, stored: &str) -> Result<String, CryptoError> {
        if stored.is_empty() {
            return Err(CryptoError::Empty);
        }
        let raw = BASE64.decode(stored).map_err(|_| CryptoError::Open)?;
        if raw.len() <= NONCE_LEN {
            return Err(CryptoError::Open);
        }
        let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes).map_err(|_| CryptoError::Open)?;

        let key = self.sealing_key()?;
        let mut in_out = ciphertext.to_vec();
        let plaintext = key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| CryptoError::Open)?;
        String::from_utf8(plaintext.to_vec()).map_err(|_| CryptoError::Open)
    }
}
