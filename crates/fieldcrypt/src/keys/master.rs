//! HKDF-SHA256 derivation of the master key and per-message keys.

use hkdf::Hkdf;
use sha2::Sha256;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Byte length of an AES-256 key (32 bytes = 256 bits).
pub const KEY_LEN: usize = 32;

/// Byte length of the random per-message salt.
pub const SALT_LEN: usize = 16;

/// HKDF `info` used to derive the master key from the external secret.
pub const MASTER_KEY_INFO: &[u8] = b"hipaa-ehr-master-key";

/// HKDF `info` used to derive a per-message key from the master key.
pub const MESSAGE_KEY_INFO: &[u8] = b"message-encryption-key";

/// Errors produced by the key layer.
#[derive(Debug, Error)]
pub enum KeyError {
    /// No external secret was configured and the development key file is disabled.
    #[error("HIPAA_ENCRYPTION_KEY is not set and ALLOW_DEV_KEY is disabled")]
    MissingSecret,

    /// The external secret was present but empty.
    #[error("external secret must not be empty")]
    EmptySecret,

    /// The development key file could not be read or created.
    #[error("development key file {path}: {source}")]
    DevKeyFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// HKDF rejected the requested output length.
    #[error("HKDF expand failed")]
    Derivation,
}

impl From<KeyError> for common::FieldError {
    fn from(e: KeyError) -> Self {
        common::FieldError::Configuration(e.to_string())
    }
}

/// The 256-bit master key.
///
/// Lives only in process memory. Zeroed on drop and never printed, not even
/// in debug builds.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey([u8; KEY_LEN]);

impl MasterKey {
    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey([REDACTED])")
    }
}

/// Derive the master key from the external secret.
///
/// HKDF-SHA256 with no salt and `info = "hipaa-ehr-master-key"`. Deterministic
/// for a given secret so that data sealed before a restart stays readable.
///
/// # Errors
///
/// Returns [`KeyError::EmptySecret`] for an empty secret.
pub fn derive_master_key(secret: &[u8]) -> Result<MasterKey, KeyError> {
    if secret.is_empty() {
        return Err(KeyError::EmptySecret);
    }
    let hk = Hkdf::<Sha256>::new(None, secret);
    let mut okm = [0u8; KEY_LEN];
    hk.expand(MASTER_KEY_INFO, &mut okm)
        .map_err(|_| KeyError::Derivation)?;
    let key = MasterKey(okm);
    okm.zeroize();
    Ok(key)
}

/// Derive the key for a single envelope from the master key and its salt.
pub fn derive_message_key(
    master: &MasterKey,
    salt: &[u8; SALT_LEN],
) -> Result<Zeroizing<[u8; KEY_LEN]>, KeyError> {
    let hk = Hkdf::<Sha256>::new(Some(&salt[..]), master.as_bytes());
    let mut okm = Zeroizing::new([0u8; KEY_LEN]);
    hk.expand(MESSAGE_KEY_INFO, okm.as_mut_slice())
        .map_err(|_| KeyError::Derivation)?;
    Ok(okm)
}
