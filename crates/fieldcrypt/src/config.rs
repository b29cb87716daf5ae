//! Key-material configuration.
//!
//! Values are read from environment variables. The external secret is never
//! printed: [`KeyConfig`]'s `Debug` implementation redacts it.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Where the master key comes from.
#[derive(Clone, Deserialize)]
pub struct KeyConfig {
    /// External secret the master key is derived from. **Required** unless
    /// `allow_dev_key` is set.
    #[serde(default)]
    pub hipaa_encryption_key: Option<String>,

    /// Permit the insecure development key file when no secret is configured.
    #[serde(default)]
    pub allow_dev_key: bool,

    /// Location of the development key file.
    #[serde(default = "default_dev_key_path")]
    pub dev_key_path: PathBuf,
}

fn default_dev_key_path() -> PathBuf {
    PathBuf::from(".encryption_key")
}

impl KeyConfig {
    /// Configuration that derives the master key from `secret`.
    pub fn with_secret(secret: impl Into<String>) -> Self {
        Self {
            hipaa_encryption_key: Some(secret.into()),
            allow_dev_key: false,
            dev_key_path: default_dev_key_path(),
        }
    }

    /// Load and validate key configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if the environment cannot be deserialised or if
    /// neither a secret nor the development key file is available.
    pub fn from_env() -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::Environment::default())
            .build()
            .context("failed to build key configuration from environment")?;

        let c: KeyConfig = cfg
            .try_deserialize()
            .context("failed to deserialise key configuration")?;

        c.validate()?;
        Ok(c)
    }

    /// The configured secret, if present and non-blank.
    pub fn secret(&self) -> Option<&str> {
        self.hipaa_encryption_key
            .as_deref()
            .filter(|s| !s.trim().is_empty())
    }

    fn validate(&self) -> Result<()> {
        if self.secret().is_none() && !self.allow_dev_key {
            anyhow::bail!(
                "HIPAA_ENCRYPTION_KEY is required (set ALLOW_DEV_KEY=true only for local development)"
            );
        }
        if self.allow_dev_key && self.dev_key_path.as_os_str().is_empty() {
            anyhow::bail!("DEV_KEY_PATH must not be empty when ALLOW_DEV_KEY is set");
        }
        Ok(())
    }
}

impl std::fmt::Debug for KeyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyConfig")
            .field(
                "hipaa_encryption_key",
                &self.hipaa_encryption_key.as_ref().map(|_| "[REDACTED]"),
            )
            .field("allow_dev_key", &self.allow_dev_key)
            .field("dev_key_path", &self.dev_key_path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_correct() {
        assert_eq!(default_dev_key_path(), PathBuf::from(".encryption_key"));
        let cfg = KeyConfig::with_secret("s3cret");
        assert!(!cfg.allow_dev_key);
    }

    #[test]
    fn validate_rejects_missing_secret_without_dev_mode() {
        let cfg = KeyConfig {
            hipaa_encryption_key: None,
            allow_dev_key: false,
            dev_key_path: default_dev_key_path(),
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_blank_secret() {
        let cfg = KeyConfig::with_secret("   ");
        assert!(cfg.secret().is_none());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_accepts_dev_mode() {
        let cfg = KeyConfig {
            hipaa_encryption_key: None,
            allow_dev_key: true,
            dev_key_path: default_dev_key_path(),
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn secret_redacted_in_debug() {
        let cfg = KeyConfig::with_secret("do-not-print-me");
        let s = format!("{cfg:?}");
        assert!(!s.contains("do-not-print-me"));
        assert!(s.contains("REDACTED"));
    }
}
