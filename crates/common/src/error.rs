//! Common error taxonomy shared across crates.

use thiserror::Error;

/// Top-level field-encryption error type.
///
/// Variants map to process exit codes used by the migration tool:
/// - [`FieldError::Configuration`] → 2
/// - every other variant → 1
#[derive(Debug, Error)]
pub enum FieldError {
    /// The authentication tag did not verify: the ciphertext was tampered with,
    /// corrupted, or sealed under a different master key.
    ///
    /// Never treated as "the value happens to be plaintext".
    #[error("authentication failed: ciphertext was tampered with, corrupted, or encrypted under a different key")]
    Authentication,

    /// No external secret (or otherwise invalid configuration) where one is required.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Malformed base64, a truncated envelope, or a typed payload that does not parse.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// A single row could not be migrated; recovered locally by the migration engine.
    #[error("row {row_id} in {table}: {message}")]
    RowMigration {
        table: String,
        row_id: i64,
        message: String,
    },
}

impl FieldError {
    /// Stable snake_case code for reports and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            FieldError::Authentication => "authentication",
            FieldError::Configuration(_) => "configuration",
            FieldError::Encoding(_) => "encoding",
            FieldError::RowMigration { .. } => "row_migration",
        }
    }

    /// Returns the process exit code that should be used when this error is fatal.
    pub fn exit_code(&self) -> u8 {
        match self {
            FieldError::Configuration(_) => 2,
            FieldError::Authentication
            | FieldError::Encoding(_)
            | FieldError::RowMigration { .. } => 1,
        }
    }
}
