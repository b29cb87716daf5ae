//! Configuration loading and validation for the migration tool.
//!
//! Values are read from environment variables at startup; command-line flags
//! override the database URL and schema path after loading.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Validated migration tool configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Database to migrate (`sqlite:///path.db`, or a bare path).
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// YAML file replacing the built-in table schema.
    #[serde(default)]
    pub encryption_schema_path: Option<PathBuf>,

    /// Rows sampled per table by `--analyze`.
    #[serde(default = "default_sample_size")]
    pub analyze_sample_size: usize,

    /// Rows sampled per table by `--verify`.
    #[serde(default = "default_sample_size")]
    pub verify_sample_size: usize,

    /// Row errors tolerated in one table before the whole table rolls back.
    #[serde(default = "default_max_row_errors")]
    pub max_row_errors: usize,

    /// Tracing log level, used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_database_url() -> String {
    "sqlite:///epic_ehr.db".into()
}
fn default_sample_size() -> usize {
    10
}
fn default_max_row_errors() -> usize {
    100
}
fn default_log_level() -> String {
    "info".into()
}

impl Config {
    /// Load and validate configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable cannot be parsed or fails validation.
    pub fn from_env() -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::Environment::default())
            .build()
            .context("failed to build migration configuration from environment")?;

        let c: Config = cfg
            .try_deserialize()
            .context("failed to deserialise migration configuration")?;

        c.validate()?;
        Ok(c)
    }

    /// Apply command-line overrides and re-validate.
    pub fn with_overrides(mut self, database: Option<String>, schema: Option<PathBuf>) -> Result<Self> {
        if let Some(url) = database {
            self.database_url = url;
        }
        if schema.is_some() {
            self.encryption_schema_path = schema;
        }
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<()> {
        ensure_non_empty(&self.database_url, "DATABASE_URL")?;
        ensure_non_empty(&self.log_level, "LOG_LEVEL")?;
        if self.analyze_sample_size == 0 {
            anyhow::bail!("ANALYZE_SAMPLE_SIZE must be > 0");
        }
        if self.verify_sample_size == 0 {
            anyhow::bail!("VERIFY_SAMPLE_SIZE must be > 0");
        }
        if let Some(path) = &self.encryption_schema_path {
            if path.as_os_str().is_empty() {
                anyhow::bail!("ENCRYPTION_SCHEMA_PATH must not be empty when set");
            }
        }
        Ok(())
    }
}

fn ensure_non_empty(value: &str, name: &str) -> Result<()> {
    if value.trim().is_empty() {
        anyhow::bail!("{name} is required and must not be empty");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Config {
        Config {
            database_url: default_database_url(),
            encryption_schema_path: None,
            analyze_sample_size: default_sample_size(),
            verify_sample_size: default_sample_size(),
            max_row_errors: default_max_row_errors(),
            log_level: default_log_level(),
        }
    }

    #[test]
    fn defaults_are_correct() {
        assert_eq!(default_database_url(), "sqlite:///epic_ehr.db");
        assert_eq!(default_sample_size(), 10);
        assert_eq!(default_max_row_errors(), 100);
        assert_eq!(default_log_level(), "info");
    }

    #[test]
    fn validate_accepts_defaults() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn validate_rejects_empty_database_url() {
        let cfg = Config {
            database_url: "  ".into(),
            ..valid()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_sample_size() {
        let cfg = Config {
            verify_sample_size: 0,
            ..valid()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn overrides_replace_env_values() {
        let cfg = valid()
            .with_overrides(Some("sqlite:///other.db".into()), Some("schema.yaml".into()))
            .unwrap();
        assert_eq!(cfg.database_url, "sqlite:///other.db");
        assert_eq!(cfg.encryption_schema_path, Some(PathBuf::from("schema.yaml")));

        assert!(valid().with_overrides(Some(String::new()), None).is_err());
    }
}
