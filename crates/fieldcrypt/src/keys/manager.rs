//! [`KeyManager`]: owner of the master key for the lifetime of the process.

use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::Path;

use aes_gcm::aead::{rand_core::RngCore, OsRng};
use tracing::{debug, warn};
use zeroize::Zeroizing;

use super::master::{derive_master_key, derive_message_key, KeyError, MasterKey, KEY_LEN, SALT_LEN};
use crate::config::KeyConfig;

/// Holds the master key and derives per-message keys from it.
///
/// Immutable after construction; share it behind an `Arc` across threads.
/// No locking is needed because nothing in it ever changes.
#[derive(Debug)]
pub struct KeyManager {
    master: MasterKey,
}

impl KeyManager {
    /// Derive the master key from an explicit secret.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::EmptySecret`] if `secret` is empty.
    pub fn from_secret(secret: impl AsRef<[u8]>) -> Result<Self, KeyError> {
        let master = derive_master_key(secret.as_ref())?;
        debug!("master key derived");
        Ok(Self { master })
    }

    /// Build a key manager from configuration.
    ///
    /// Uses `HIPAA_ENCRYPTION_KEY` when set. Without it the development key
    /// file is used only if `ALLOW_DEV_KEY` is enabled; otherwise this is a
    /// hard error.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::MissingSecret`] when no key source is available and
    /// [`KeyError::DevKeyFile`] if the development key file cannot be used.
    pub fn from_config(cfg: &KeyConfig) -> Result<Self, KeyError> {
        if let Some(secret) = cfg.secret() {
            return Self::from_secret(secret.as_bytes());
        }
        if !cfg.allow_dev_key {
            return Err(KeyError::MissingSecret);
        }

        warn!(
            path = %cfg.dev_key_path.display(),
            "HIPAA_ENCRYPTION_KEY not set; using development key file. NEVER use this in production"
        );
        let secret = load_or_create_dev_key(&cfg.dev_key_path)?;
        Self::from_secret(secret.as_bytes())
    }

    /// Derive the key for one envelope from its salt.
    pub fn message_key(&self, salt: &[u8; SALT_LEN]) -> Result<Zeroizing<[u8; KEY_LEN]>, KeyError> {
        derive_message_key(&self.master, salt)
    }

    pub(crate) fn master_key(&self) -> &MasterKey {
        &self.master
    }
}

/// Read the development secret from `path`, creating it on first use.
///
/// Creation uses `create_new`, so two processes racing on a fresh checkout
/// both end up reading the same file.
fn load_or_create_dev_key(path: &Path) -> Result<Zeroizing<String>, KeyError> {
    let io_err = |source: std::io::Error| KeyError::DevKeyFile {
        path: path.display().to_string(),
        source,
    };

    if path.exists() {
        return read_dev_key(path).map_err(io_err);
    }

    let mut raw = Zeroizing::new([0u8; KEY_LEN]);
    OsRng.fill_bytes(raw.as_mut_slice());
    let secret = Zeroizing::new(hex::encode(raw.as_slice()));

    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    match options.open(path) {
        Ok(mut file) => {
            file.write_all(secret.as_bytes()).map_err(io_err)?;
            warn!(path = %path.display(), "generated new development key file");
            Ok(secret)
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => read_dev_key(path).map_err(io_err),
        Err(e) => Err(io_err(e)),
    }
}

fn read_dev_key(path: &Path) -> std::io::Result<Zeroizing<String>> {
    let contents = Zeroizing::new(std::fs::read_to_string(path)?);
    let trimmed = contents.trim();
    if trimmed.is_empty() {
        return Err(std::io::Error::new(
            ErrorKind::InvalidData,
            "development key file is empty",
        ));
    }
    Ok(Zeroizing::new(trimmed.to_owned()))
}
