//! AES-256-GCM encryption and decryption of individual string fields.
//!
//! Every call draws a fresh 16-byte salt and 12-byte nonce from the OS CSPRNG
//! and derives a one-off message key from the master key and the salt, so the
//! same plaintext never produces the same envelope twice.

use std::sync::Arc;

use aes_gcm::{
    aead::{rand_core::RngCore, Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use thiserror::Error;

use crate::keys::{KeyError, KeyManager, SALT_LEN};

/// Prefix that appears at the start of every encrypted field value.
pub const ENVELOPE_PREFIX: &str = "ENC:v1:";

/// Byte length of an AES-GCM nonce (12 bytes = 96 bits).
pub const NONCE_LEN: usize = 12;

/// Byte length of the GCM authentication tag appended to the ciphertext.
pub const TAG_LEN: usize = 16;

/// Smallest decoded payload that can hold an envelope (empty plaintext).
pub const MIN_PAYLOAD_LEN: usize = SALT_LEN + NONCE_LEN + TAG_LEN;

const SELF_TEST_PROBE: &str = "Test Patient Name - SSN: 123-45-6789";

/// Cheap prefix check used everywhere to decide whether a value is already sealed.
pub fn is_encrypted(value: &str) -> bool {
    value.starts_with(ENVELOPE_PREFIX)
}

/// A parsed encryption envelope.
///
/// The string representation is
/// `ENC:v1:<base64(salt[16] || nonce[12] || ciphertext+tag)>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Random salt the message key was derived with.
    pub salt: [u8; SALT_LEN],
    /// Raw nonce bytes.
    pub nonce: [u8; NONCE_LEN],
    /// Raw ciphertext + authentication tag bytes.
    pub ciphertext: Vec<u8>,
}

impl Envelope {
    /// Concatenate `salt || nonce || ciphertext`.
    pub fn to_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SALT_LEN + NONCE_LEN + self.ciphertext.len());
        out.extend_from_slice(&self.salt);
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    /// Split a decoded payload into its fixed-position parts.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::Truncated`] if the payload is shorter than
    /// [`MIN_PAYLOAD_LEN`].
    pub fn from_payload(payload: &[u8]) -> Result<Self, CipherError> {
        if payload.len() < MIN_PAYLOAD_LEN {
            return Err(CipherError::Truncated(payload.len()));
        }
        let (salt_bytes, rest) = payload.split_at(SALT_LEN);
        let (nonce_bytes, ciphertext) = rest.split_at(NONCE_LEN);

        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(salt_bytes);
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(nonce_bytes);

        Ok(Self {
            salt,
            nonce,
            ciphertext: ciphertext.to_vec(),
        })
    }

    /// Encode this value to its canonical string representation.
    pub fn to_string_repr(&self) -> String {
        format!("{}{}", ENVELOPE_PREFIX, STANDARD.encode(self.to_payload()))
    }

    /// Parse an envelope string.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::MissingPrefix`] if the prefix is absent,
    /// [`CipherError::InvalidBase64`] for a malformed body, and
    /// [`CipherError::Truncated`] for a payload too short to be an envelope.
    pub fn parse(s: &str) -> Result<Self, CipherError> {
        let body = s
            .strip_prefix(ENVELOPE_PREFIX)
            .ok_or(CipherError::MissingPrefix)?;
        let payload = STANDARD.decode(body).map_err(CipherError::InvalidBase64)?;
        Self::from_payload(&payload)
    }
}

/// Errors produced by the cipher layer.
#[derive(Debug, Error)]
pub enum CipherError {
    /// The authentication tag did not verify (tampering, corruption, wrong key).
    #[error("authentication failed: ciphertext was tampered with, corrupted, or encrypted under a different key")]
    Authentication,

    /// The value does not start with [`ENVELOPE_PREFIX`].
    #[error("value is not an encryption envelope")]
    MissingPrefix,

    /// The envelope body is not valid base64.
    #[error("envelope is not valid base64: {0}")]
    InvalidBase64(base64::DecodeError),

    /// The decoded payload is too short to contain salt, nonce, and tag.
    #[error("envelope truncated: {0} bytes, need at least {MIN_PAYLOAD_LEN}")]
    Truncated(usize),

    /// Authentication passed but the plaintext is not UTF-8.
    #[error("decrypted plaintext is not valid UTF-8")]
    InvalidUtf8,

    /// AES-GCM encryption failed.
    #[error("aead operation failed")]
    AeadFailure,

    /// Message key derivation failed.
    #[error(transparent)]
    Key(#[from] KeyError),
}

impl CipherError {
    /// `true` for malformed stored data, as opposed to a failed tag check.
    pub fn is_encoding(&self) -> bool {
        matches!(
            self,
            CipherError::MissingPrefix
                | CipherError::InvalidBase64(_)
                | CipherError::Truncated(_)
                | CipherError::InvalidUtf8
        )
    }
}

impl From<CipherError> for common::FieldError {
    fn from(e: CipherError) -> Self {
        match e {
            CipherError::Authentication => common::FieldError::Authentication,
            CipherError::Key(k) => k.into(),
            other => common::FieldError::Encoding(other.to_string()),
        }
    }
}

/// AEAD engine for single field values.
///
/// Cheap to clone: the key manager is shared behind an `Arc`.
#[derive(Clone, Debug)]
pub struct FieldCipher {
    keys: Arc<KeyManager>,
}

impl FieldCipher {
    pub fn new(keys: Arc<KeyManager>) -> Self {
        Self { keys }
    }

    /// The key manager this cipher seals with.
    pub fn keys(&self) -> &Arc<KeyManager> {
        &self.keys
    }

    /// See [`is_encrypted`].
    pub fn is_encrypted(&self, value: &str) -> bool {
        is_encrypted(value)
    }

    /// Encrypt a string field into its envelope string.
    ///
    /// Empty input and input that already carries the envelope prefix are
    /// returned unchanged, so a value is never sealed twice.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::AeadFailure`] on an internal AEAD error (should be
    /// unreachable with a freshly derived key).
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CipherError> {
        if plaintext.is_empty() || is_encrypted(plaintext) {
            return Ok(plaintext.to_owned());
        }
        Ok(self.seal(plaintext.as_bytes())?.to_string_repr())
    }

    /// Seal raw bytes under a fresh salt and nonce.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Envelope, CipherError> {
        let mut salt = [0u8; SALT_LEN];
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut salt);
        OsRng.fill_bytes(&mut nonce_bytes);

        let cipher = self.build_cipher(&salt)?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| CipherError::AeadFailure)?;

        Ok(Envelope {
            salt,
            nonce: nonce_bytes,
            ciphertext,
        })
    }

    /// Decrypt an envelope string back to plaintext.
    ///
    /// Empty input and input without the envelope prefix are returned
    /// unchanged (legacy plaintext rows).
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::Authentication`] if the tag does not verify, and
    /// an encoding variant ([`CipherError::is_encoding`]) for malformed data.
    pub fn decrypt(&self, value: &str) -> Result<String, CipherError> {
        if value.is_empty() || !is_encrypted(value) {
            return Ok(value.to_owned());
        }
        let envelope = Envelope::parse(value)?;
        let plaintext = self.open(&envelope)?;
        String::from_utf8(plaintext).map_err(|_| CipherError::InvalidUtf8)
    }

    /// Open a parsed envelope to raw bytes.
    pub fn open(&self, envelope: &Envelope) -> Result<Vec<u8>, CipherError> {
        let cipher = self.build_cipher(&envelope.salt)?;
        cipher
            .decrypt(
                Nonce::from_slice(&envelope.nonce),
                envelope.ciphertext.as_ref(),
            )
            .map_err(|_| CipherError::Authentication)
    }

    /// Round-trip a probe string to confirm the key and cipher work.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::Authentication`] if the probe does not come back intact.
    pub fn self_test(&self) -> Result<(), CipherError> {
        let sealed = self.encrypt(SELF_TEST_PROBE)?;
        if self.decrypt(&sealed)? != SELF_TEST_PROBE {
            return Err(CipherError::Authentication);
        }
        Ok(())
    }

    fn build_cipher(&self, salt: &[u8; SALT_LEN]) -> Result<Aes256Gcm, CipherError> {
        let key = self.keys.message_key(salt)?;
        Aes256Gcm::new_from_slice(key.as_slice()).map_err(|_| CipherError::AeadFailure)
    }
}
