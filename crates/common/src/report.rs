//! Migration records and per-table report types.
//!
//! These types are produced by the migration engine and serialised as JSON
//! when the tool runs with `--format json`. They never carry plaintext or
//! ciphertext values, only table/field names, row ids, counts, and error text.

use serde::{Deserialize, Serialize};

/// Maximum number of error excerpts printed per table in text reports.
pub const ERROR_EXCERPT_LIMIT: usize = 3;

// ---------------------------------------------------------------------------
// Per-field classification
// ---------------------------------------------------------------------------

/// Classification of one stored field value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldStatus {
    /// The value carries the envelope prefix.
    Encrypted,
    /// A non-empty value without the envelope prefix.
    Plaintext,
    /// NULL or the empty string.
    Empty,
}

/// What the engine did (or would do) with a classified field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FieldAction {
    None,
    Encrypted,
    WouldEncrypt,
    HashUpdated,
    WouldUpdateHash,
    Verified,
    Failed(String),
}

/// Transient per-row, per-field record produced during a scan pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub table: String,
    pub row_id: i64,
    pub field: String,
    pub status: FieldStatus,
    pub action: FieldAction,
}

impl MigrationRecord {
    pub fn new(
        table: impl Into<String>,
        row_id: i64,
        field: impl Into<String>,
        status: FieldStatus,
        action: FieldAction,
    ) -> Self {
        Self {
            table: table.into(),
            row_id,
            field: field.into(),
            status,
            action,
        }
    }

    /// `true` when this record stages a column write.
    pub fn changes_row(&self) -> bool {
        matches!(
            self.action,
            FieldAction::Encrypted
                | FieldAction::WouldEncrypt
                | FieldAction::HashUpdated
                | FieldAction::WouldUpdateHash
        )
    }
}

// ---------------------------------------------------------------------------
// Analyze
// ---------------------------------------------------------------------------

/// Aggregate encryption status of one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableStatus {
    Encrypted,
    Partial,
    Unencrypted,
    Error,
}

impl TableStatus {
    /// Derive the status from field counts over a sample.
    pub fn from_counts(encrypted: usize, unencrypted: usize) -> Self {
        match (encrypted, unencrypted) {
            (0, _) => TableStatus::Unencrypted,
            (_, 0) => TableStatus::Encrypted,
            _ => TableStatus::Partial,
        }
    }

    pub fn icon(&self) -> &'static str {
        match self {
            TableStatus::Encrypted => "✓",
            TableStatus::Partial => "◐",
            TableStatus::Unencrypted => "○",
            TableStatus::Error => "✗",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TableStatus::Encrypted => "encrypted",
            TableStatus::Partial => "partial",
            TableStatus::Unencrypted => "unencrypted",
            TableStatus::Error => "error",
        }
    }
}

/// Result of analyzing one table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableAnalysis {
    pub table: String,
    pub status: TableStatus,
    pub total_records: Option<u64>,
    pub fields_to_encrypt: usize,
    pub encrypted_fields_found: usize,
    pub unencrypted_fields_found: usize,
    pub absent_fields_found: usize,
    pub message: Option<String>,
}

impl TableAnalysis {
    /// An analysis that failed before any row was classified.
    pub fn error(table: impl Into<String>, fields_to_encrypt: usize, message: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            status: TableStatus::Error,
            total_records: None,
            fields_to_encrypt,
            encrypted_fields_found: 0,
            unencrypted_fields_found: 0,
            absent_fields_found: 0,
            message: Some(message.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Encrypt
// ---------------------------------------------------------------------------

/// How a table's batch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchOutcome {
    /// All staged updates were committed.
    Committed,
    /// Nothing was written; counts are a preview.
    DryRun,
    /// A systemic failure rolled back the whole table.
    RolledBack,
    /// The run was cancelled before this table started.
    Skipped,
}

/// Result of the encrypt pass over one table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableEncryptReport {
    pub table: String,
    pub outcome: BatchOutcome,
    pub records_processed: usize,
    pub rows_updated: usize,
    pub fields_encrypted: usize,
    pub hashes_updated: usize,
    pub errors: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub records: Vec<MigrationRecord>,
}

impl TableEncryptReport {
    pub fn new(table: impl Into<String>, outcome: BatchOutcome) -> Self {
        Self {
            table: table.into(),
            outcome,
            records_processed: 0,
            rows_updated: 0,
            fields_encrypted: 0,
            hashes_updated: 0,
            errors: Vec::new(),
            records: Vec::new(),
        }
    }

    /// `true` when the table ended in a state an operator has to look at.
    pub fn is_failure(&self) -> bool {
        self.outcome == BatchOutcome::RolledBack || !self.errors.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Verify
// ---------------------------------------------------------------------------

/// Result of verifying one table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableVerification {
    pub table: String,
    pub verified: bool,
    pub records_checked: usize,
    pub fields_checked: usize,
    pub errors: Vec<String>,
}

impl TableVerification {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            verified: true,
            records_checked: 0,
            fields_checked: 0,
            errors: Vec::new(),
        }
    }

    /// Record a failure and flag the table as not verified.
    pub fn fail(&mut self, message: impl Into<String>) {
        self.verified = false;
        self.errors.push(message.into());
    }
}

// ---------------------------------------------------------------------------
// Whole run
// ---------------------------------------------------------------------------

/// Everything a single invocation of the tool produced.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunReport {
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub analysis: Vec<TableAnalysis>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub encryption: Vec<TableEncryptReport>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub verification: Vec<TableVerification>,
    pub cancelled: bool,
}

impl RunReport {
    /// `true` if any table errored, rolled back, or failed verification.
    pub fn has_failures(&self) -> bool {
        self.analysis.iter().any(|a| a.status == TableStatus::Error)
            || self.encryption.iter().any(TableEncryptReport::is_failure)
            || self.verification.iter().any(|v| !v.verified)
    }
}
