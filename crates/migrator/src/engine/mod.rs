//! Migration engine: analyze, encrypt, and verify configured tables in place.
//!
//! # Batching
//!
//! Each table is one transaction. A row-scoped failure is recorded and the
//! table carries on; a systemic failure (fetch or commit failure, a broken
//! connection, or too many row errors) rolls the whole table back. Tables are
//! independent: a rolled-back table never affects the next one.
//!
//! # Cancellation
//!
//! The [`CancellationToken`] is checked before each table. A table that has
//! started always commits or rolls back; tables never started are reported
//! as skipped.
//!
//! # Module invariants
//!
//! - Only NULL and `""` are empty. Zero is a value and gets encrypted.
//! - Values carrying the envelope prefix are never re-encrypted, so a second
//!   encrypt pass issues no UPDATEs.
//! - Reports and logs carry table names, row ids, field names, and counts,
//!   never field values.

mod analyze;
mod encrypt;
mod verify;

use std::collections::BTreeSet;

use common::report::{FieldStatus, RunReport};
use fieldcrypt::{is_sealed, split_searchable, CodecError, FieldCrypto, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::Config;
use crate::schema::{EncryptionSchema, TableSchema, ID_COLUMN};
use crate::store::{RowStore, StoreError, StoredValue};

/// Token an operator must supply before encryption writes anything.
pub const CONFIRMATION_TOKEN: &str = "ENCRYPT";

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("encryption requires confirmation: type or pass --confirm {CONFIRMATION_TOKEN}, or use --dry-run")]
    ConfirmationRequired,
}

impl MigrationError {
    pub fn exit_code(&self) -> u8 {
        match self {
            MigrationError::ConfirmationRequired => 3,
        }
    }
}

/// Options for the encrypt pass.
#[derive(Debug, Clone, Default)]
pub struct EncryptOptions {
    pub dry_run: bool,
    pub confirmation: Option<String>,
}

impl EncryptOptions {
    /// Refuse unless this is a dry run or the confirmation token matches.
    pub fn authorize(&self) -> Result<(), MigrationError> {
        if self.dry_run || self.confirmation.as_deref() == Some(CONFIRMATION_TOKEN) {
            Ok(())
        } else {
            Err(MigrationError::ConfirmationRequired)
        }
    }
}

/// Which passes to run. Passes always run in the order analyze, encrypt, verify.
#[derive(Debug, Clone, Default)]
pub struct RunPlan {
    pub analyze: bool,
    pub encrypt: Option<EncryptOptions>,
    pub verify: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    pub analyze_sample_size: usize,
    pub verify_sample_size: usize,
    pub max_row_errors: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            analyze_sample_size: 10,
            verify_sample_size: 10,
            max_row_errors: 100,
        }
    }
}

impl From<&Config> for EngineSettings {
    fn from(cfg: &Config) -> Self {
        Self {
            analyze_sample_size: cfg.analyze_sample_size,
            verify_sample_size: cfg.verify_sample_size,
            max_row_errors: cfg.max_row_errors,
        }
    }
}

/// Drives the three passes over a [`RowStore`].
pub struct MigrationEngine<S> {
    store: S,
    schema: EncryptionSchema,
    crypto: FieldCrypto,
    settings: EngineSettings,
    cancel: CancellationToken,
    interrupted: bool,
}

impl<S: RowStore> MigrationEngine<S> {
    pub fn new(store: S, schema: EncryptionSchema, crypto: FieldCrypto, settings: EngineSettings) -> Self {
        Self {
            store,
            schema,
            crypto,
            settings,
            cancel: CancellationToken::new(),
            interrupted: false,
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[cfg(test)]
    pub(crate) fn store(&self) -> &S {
        &self.store
    }

    /// Run the requested passes.
    ///
    /// # Errors
    ///
    /// Returns [`MigrationError::ConfirmationRequired`] before any pass runs
    /// if encryption was requested without authorization.
    pub fn run(&mut self, plan: &RunPlan) -> Result<RunReport, MigrationError> {
        if let Some(opts) = &plan.encrypt {
            opts.authorize()?;
        }
        let mut report = RunReport::default();
        if plan.analyze {
            report.analysis = self.analyze();
        }
        if let Some(opts) = &plan.encrypt {
            report.encryption = self.encrypt(opts)?;
        }
        if plan.verify {
            report.verification = self.verify();
        }
        report.cancelled = self.interrupted;
        Ok(report)
    }

    /// `true` (and remembered) once cancellation has been requested.
    fn should_stop(&mut self, table: &str) -> bool {
        if self.cancel.is_cancelled() {
            if !self.interrupted {
                warn!(table = %table, "cancellation requested; remaining tables skipped");
            }
            self.interrupted = true;
        }
        self.interrupted
    }

    /// Decrypt a sealed stored value: a typed envelope, or the untyped
    /// envelope inside a `<hash>|<envelope>` searchable value.
    fn open_sealed(&self, stored: &str) -> Result<Value, CodecError> {
        match split_searchable(stored) {
            Some((_, envelope)) => Ok(Value::String(self.crypto.cipher.decrypt(envelope)?)),
            None => self.crypto.codec.decode_value(stored),
        }
    }

    /// Resolve which configured columns the live table actually has.
    fn table_columns<'a>(&self, table: &'a TableSchema) -> Result<TableColumns<'a>, StoreError> {
        if !self.store.table_exists(&table.name)? {
            return Err(StoreError::MissingTable(table.name.clone()));
        }
        let present: BTreeSet<String> = self.store.columns(&table.name)?.into_iter().collect();

        let mut fields = Vec::new();
        for field in &table.fields {
            if present.contains(field) {
                fields.push(field.as_str());
            } else {
                debug!(table = %table.name, field = %field, "configured field not in table; skipped");
            }
        }

        let mut searchable = Vec::new();
        for field in &table.searchable_fields {
            if !present.contains(field) {
                debug!(table = %table.name, field = %field, "searchable field not in table; skipped");
                continue;
            }
            let hash_column = TableSchema::hash_column(field);
            if !present.contains(&hash_column) {
                warn!(
                    table = %table.name,
                    field = %field,
                    hash_column = %hash_column,
                    "search hash column missing; searchable field skipped"
                );
                continue;
            }
            searchable.push((field.as_str(), hash_column));
        }

        Ok(TableColumns {
            has_id: present.contains(ID_COLUMN),
            absent: table.fields.len() - fields.len(),
            fields,
            searchable,
        })
    }
}

/// The configured columns of one table that exist in the database.
#[derive(Debug)]
struct TableColumns<'a> {
    has_id: bool,
    fields: Vec<&'a str>,
    searchable: Vec<(&'a str, String)>,
    absent: usize,
}

impl TableColumns<'_> {
    /// `id` (when present) plus the encrypted fields.
    fn field_select(&self) -> Vec<String> {
        let mut select = Vec::new();
        if self.has_id {
            select.push(ID_COLUMN.to_owned());
        }
        select.extend(self.fields.iter().map(|f| f.to_string()));
        select
    }

    /// [`Self::field_select`] plus searchable fields and their hash columns.
    fn full_select(&self) -> Vec<String> {
        let mut select = self.field_select();
        for (field, hash_column) in &self.searchable {
            for column in [field.to_string(), hash_column.clone()] {
                if !select.contains(&column) {
                    select.push(column);
                }
            }
        }
        select
    }
}

/// Classify one stored value.
fn classify(value: &StoredValue) -> FieldStatus {
    if value.is_empty() {
        FieldStatus::Empty
    } else if value.as_text().is_some_and(is_sealed) {
        FieldStatus::Encrypted
    } else {
        FieldStatus::Plaintext
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use fieldcrypt::KeyManager;

    use super::*;
    use crate::store::SqliteStore;

    pub const SECRET: &str = "engine-test-secret";

    pub fn crypto() -> FieldCrypto {
        FieldCrypto::new(KeyManager::from_secret(SECRET).unwrap())
    }

    pub fn schema(yaml: &str) -> EncryptionSchema {
        EncryptionSchema::from_yaml(yaml).unwrap()
    }

    pub fn sqlite(sql: &str) -> SqliteStore {
        let store = SqliteStore::open_in_memory().unwrap();
        store.connection().execute_batch(sql).unwrap();
        store
    }

    pub fn engine(sql: &str, yaml: &str) -> MigrationEngine<SqliteStore> {
        MigrationEngine::new(sqlite(sql), schema(yaml), crypto(), EngineSettings::default())
    }

    pub fn confirmed() -> EncryptOptions {
        EncryptOptions {
            dry_run: false,
            confirmation: Some(CONFIRMATION_TOKEN.to_owned()),
        }
    }

    /// Every column of every row, as text, ordered by id.
    pub fn dump(store: &SqliteStore, table: &str) -> Vec<Vec<Option<String>>> {
        use rusqlite::types::Value as SqlValue;

        let sql = format!("SELECT * FROM {table} ORDER BY id");
        let mut stmt = store.connection().prepare(&sql).unwrap();
        let n = stmt.column_count();
        let rows = stmt
            .query_map([], |r| {
                (0..n)
                    .map(|i| {
                        let v: SqlValue = r.get(i)?;
                        Ok::<_, rusqlite::Error>(match v {
                            SqlValue::Null => None,
                            SqlValue::Integer(i) => Some(i.to_string()),
                            SqlValue::Real(f) => Some(f.to_string()),
                            SqlValue::Text(s) => Some(s),
                            SqlValue::Blob(_) => Some("<blob>".into()),
                        })
                    })
                    .collect()
            })
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        rows
    }

    pub const PATIENTS_SQL: &str = "
        CREATE TABLE patients (
            id INTEGER PRIMARY KEY,
            mrn TEXT,
            mrn_hash TEXT,
            first_name TEXT,
            last_name TEXT,
            last_name_hash TEXT,
            height_inches INTEGER,
            bmi REAL,
            created_at TEXT
        );
        INSERT INTO patients VALUES
            (1, 'MRN-001', NULL, 'Jane', 'Doe', NULL, 65, 22.5, '2024-01-01'),
            (2, 'MRN-002', NULL, '', NULL, NULL, 0, NULL, '2024-01-02');
    ";

    pub const PATIENTS_YAML: &str = "
tables:
  - name: patients
    fields: [first_name, last_name, height_inches, bmi, middle_name]
    searchable_fields: [mrn, last_name]
    exclude: [id, created_at]
";
}
