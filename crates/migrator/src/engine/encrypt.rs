//! The encrypt pass.

use common::report::{BatchOutcome, FieldAction, FieldStatus, MigrationRecord, TableEncryptReport};
use common::FieldError;
use fieldcrypt::{is_sealed, Value};
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn};

use super::{classify, EncryptOptions, MigrationEngine, MigrationError, TableColumns};
use crate::schema::TableSchema;
use crate::store::{Row, RowStore, StoreError, StoredValue};

/// Why a table batch was abandoned.
#[derive(Debug, Error)]
enum BatchError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("aborted after {0} row errors")]
    TooManyRowErrors(usize),
}

/// Column writes planned for one row.
#[derive(Debug, Default)]
struct StagedRow {
    updates: Vec<(String, StoredValue)>,
    records: Vec<MigrationRecord>,
    errors: Vec<String>,
    fields_encrypted: usize,
    hashes_updated: usize,
}

impl<S: RowStore> MigrationEngine<S> {
    /// Encrypt every configured plaintext field, one batch per table.
    ///
    /// # Errors
    ///
    /// Returns [`MigrationError::ConfirmationRequired`] unless `opts` is a dry
    /// run or carries the confirmation token. Table failures are reported,
    /// not returned.
    pub fn encrypt(&mut self, opts: &EncryptOptions) -> Result<Vec<TableEncryptReport>, MigrationError> {
        opts.authorize()?;
        let tables = self.schema.tables().to_vec();
        let mut reports = Vec::with_capacity(tables.len());
        for table in &tables {
            if self.should_stop(&table.name) {
                reports.push(TableEncryptReport::new(&table.name, BatchOutcome::Skipped));
                continue;
            }
            reports.push(self.encrypt_table(table, opts.dry_run));
        }
        Ok(reports)
    }

    fn encrypt_table(&mut self, table: &TableSchema, dry_run: bool) -> TableEncryptReport {
        let span = info_span!("encrypt_table", table = %table.name, dry_run);
        let _guard = span.enter();

        let outcome = if dry_run {
            BatchOutcome::DryRun
        } else {
            BatchOutcome::Committed
        };
        let mut report = TableEncryptReport::new(&table.name, outcome);

        match self.encrypt_batch(table, dry_run, &mut report) {
            Ok(()) => info!(
                records = report.records_processed,
                rows_updated = report.rows_updated,
                fields_encrypted = report.fields_encrypted,
                hashes_updated = report.hashes_updated,
                errors = report.errors.len(),
                "table processed"
            ),
            Err(e) => {
                error!(error = %e, "table rolled back");
                report.outcome = BatchOutcome::RolledBack;
                report.errors.push(e.to_string());
            }
        }
        report
    }

    /// Run one table inside its own transaction.
    fn encrypt_batch(
        &mut self,
        table: &TableSchema,
        dry_run: bool,
        report: &mut TableEncryptReport,
    ) -> Result<(), BatchError> {
        let columns = self.table_columns(table)?;
        if dry_run {
            return self.encrypt_rows(&table.name, &columns, true, report);
        }

        self.store.begin()?;
        let result = self
            .encrypt_rows(&table.name, &columns, false, report)
            .and_then(|()| self.store.commit().map_err(BatchError::from));
        if result.is_err() {
            if let Err(e) = self.store.rollback() {
                error!(error = %e, "rollback failed");
            }
        }
        result
    }

    fn encrypt_rows(
        &mut self,
        table: &str,
        columns: &TableColumns<'_>,
        dry_run: bool,
        report: &mut TableEncryptReport,
    ) -> Result<(), BatchError> {
        let rows = self.store.fetch_rows(table, &columns.full_select(), None)?;
        let mut failed_rows = 0;
        let mut without_id = 0;

        for row in rows {
            let Some(id) = row.id() else {
                without_id += 1;
                continue;
            };
            let mut staged = self.stage_row(table, id, &row, columns, dry_run);
            let mut row_failed = !staged.errors.is_empty();
            report.errors.append(&mut staged.errors);

            if !staged.updates.is_empty() {
                let written = if dry_run {
                    Ok(())
                } else {
                    self.store.update_row(table, id, &staged.updates)
                };
                match written {
                    Ok(()) => {
                        report.rows_updated += 1;
                        report.fields_encrypted += staged.fields_encrypted;
                        report.hashes_updated += staged.hashes_updated;
                    }
                    Err(e) if e.is_systemic() => return Err(e.into()),
                    Err(e) => {
                        debug!(row_id = id, error = %e, "row update failed");
                        row_failed = true;
                        let message = match &e {
                            StoreError::Row { message, .. } => message.clone(),
                            other => other.to_string(),
                        };
                        report.errors.push(row_error(table, id, message));
                        for record in staged.records.iter_mut().filter(|r| r.changes_row()) {
                            record.action = FieldAction::Failed(e.to_string());
                        }
                    }
                }
            }

            report
                .records
                .extend(staged.records.into_iter().filter(|r| r.action != FieldAction::None));
            report.records_processed += 1;

            if row_failed {
                failed_rows += 1;
                if failed_rows > self.settings.max_row_errors {
                    return Err(BatchError::TooManyRowErrors(failed_rows));
                }
            }
        }

        if without_id > 0 {
            warn!(rows = without_id, "rows without an integer id left unencrypted");
            report
                .errors
                .push(format!("{without_id} rows without an integer id skipped"));
        }
        Ok(())
    }

    /// Decide which columns of one row to rewrite.
    fn stage_row(&self, table: &str, id: i64, row: &Row, columns: &TableColumns<'_>, dry_run: bool) -> StagedRow {
        let mut staged = StagedRow::default();

        for &field in &columns.fields {
            let value = row.get(field).unwrap_or(&StoredValue::Null);
            let status = classify(value);
            let action = if status != FieldStatus::Plaintext {
                FieldAction::None
            } else {
                match self.encrypt_value(value) {
                    Ok(sealed) => {
                        staged.updates.push((field.to_owned(), StoredValue::Text(sealed)));
                        staged.fields_encrypted += 1;
                        if dry_run {
                            FieldAction::WouldEncrypt
                        } else {
                            FieldAction::Encrypted
                        }
                    }
                    Err(message) => {
                        staged.errors.push(row_error(table, id, format!("field {field}: {message}")));
                        FieldAction::Failed(message)
                    }
                }
            };
            staged.records.push(MigrationRecord::new(table, id, field, status, action));
        }

        for (field, hash_column) in &columns.searchable {
            let value = row.get(field).unwrap_or(&StoredValue::Null);
            let status = classify(value);
            if status == FieldStatus::Empty {
                continue;
            }
            let action = match self.search_plaintext(value) {
                Ok(plain) => {
                    let hash = self.crypto.search.hash_for_search(&plain, "");
                    let current = row.get(hash_column).and_then(StoredValue::as_text);
                    if current == Some(hash.as_str()) {
                        FieldAction::None
                    } else {
                        staged.updates.push((hash_column.clone(), StoredValue::Text(hash)));
                        staged.hashes_updated += 1;
                        if dry_run {
                            FieldAction::WouldUpdateHash
                        } else {
                            FieldAction::HashUpdated
                        }
                    }
                }
                Err(message) => {
                    staged
                        .errors
                        .push(row_error(table, id, format!("field {hash_column}: {message}")));
                    FieldAction::Failed(message)
                }
            };
            staged
                .records
                .push(MigrationRecord::new(table, id, hash_column.as_str(), status, action));
        }

        staged
    }

    /// Seal a plaintext stored value, tagging it with its storage class.
    fn encrypt_value(&self, value: &StoredValue) -> Result<String, String> {
        let typed = match value {
            StoredValue::Text(s) => Value::String(s.clone()),
            StoredValue::Integer(i) => Value::Int(*i),
            StoredValue::Real(f) => Value::Float(*f),
            StoredValue::Null => return Err("unexpected NULL".into()),
            StoredValue::Blob(_) => return Err("binary values are not supported".into()),
        };
        self.crypto.codec.encode_value(&typed).map_err(|e| e.to_string())
    }

    /// The plaintext a search hash is computed from, decrypting if needed.
    fn search_plaintext(&self, value: &StoredValue) -> Result<String, String> {
        match value {
            StoredValue::Text(s) if is_sealed(s) => self
                .open_sealed(s)
                .map(|v| v.to_plain_string())
                .map_err(|e| e.to_string()),
            StoredValue::Text(s) => Ok(s.clone()),
            StoredValue::Integer(i) => Ok(Value::Int(*i).to_plain_string()),
            StoredValue::Real(f) => Ok(Value::Float(*f).to_plain_string()),
            StoredValue::Null => Ok(String::new()),
            StoredValue::Blob(_) => Err("binary values are not supported".into()),
        }
    }
}

fn row_error(table: &str, row_id: i64, message: String) -> String {
    FieldError::RowMigration {
        table: table.to_owned(),
        row_id,
        message,
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use fieldcrypt::storage::ColumnCodec;
    use fieldcrypt::{is_encrypted, ColumnKind};
    use mockall::predicate::eq;

    use super::super::testing::*;
    use super::super::EngineSettings;
    use super::*;
    use crate::store::MockRowStore;

    fn encrypt(engine: &mut MigrationEngine<impl RowStore>, opts: &EncryptOptions) -> TableEncryptReport {
        engine.encrypt(opts).unwrap().remove(0)
    }

    #[test]
    fn encrypts_plaintext_and_preserves_types() {
        let mut engine = engine(PATIENTS_SQL, PATIENTS_YAML);
        let report = encrypt(&mut engine, &confirmed());

        assert_eq!(report.outcome, BatchOutcome::Committed);
        assert_eq!(report.records_processed, 2);
        // Row 1: first_name, last_name, height_inches, bmi. Row 2: height_inches = 0.
        assert_eq!(report.fields_encrypted, 5);
        // mrn for both rows, last_name for row 1.
        assert_eq!(report.hashes_updated, 3);
        assert_eq!(report.rows_updated, 2);
        assert!(report.errors.is_empty());

        let crypto = crypto();
        let rows = dump(engine.store(), "patients");
        let row1 = &rows[0];
        // id, mrn, mrn_hash, first_name, last_name, last_name_hash, height_inches, bmi, created_at
        assert_eq!(row1[1].as_deref(), Some("MRN-001"));
        assert_eq!(
            row1[2].as_deref(),
            Some(crypto.search.hash_for_search("MRN-001", "").as_str())
        );
        assert_eq!(
            crypto.codec.decode_value(row1[3].as_deref().unwrap()).unwrap(),
            Value::from("Jane")
        );
        assert_eq!(
            row1[5].as_deref(),
            Some(crypto.search.hash_for_search("Doe", "").as_str())
        );
        assert_eq!(
            crypto.codec.decode_value(row1[6].as_deref().unwrap()).unwrap(),
            Value::Int(65)
        );
        assert_eq!(
            crypto.codec.decode_value(row1[7].as_deref().unwrap()).unwrap(),
            Value::Float(22.5)
        );
        assert_eq!(row1[8].as_deref(), Some("2024-01-01"));

        let row2 = &rows[1];
        assert_eq!(row2[3].as_deref(), Some(""));
        assert_eq!(row2[4], None);
        assert_eq!(row2[5], None);
        assert_eq!(
            crypto.codec.decode_value(row2[6].as_deref().unwrap()).unwrap(),
            Value::Int(0)
        );
    }

    #[test]
    fn second_run_is_a_no_op() {
        let mut engine = engine(PATIENTS_SQL, PATIENTS_YAML);
        encrypt(&mut engine, &confirmed());
        let after_first = dump(engine.store(), "patients");

        let second = encrypt(&mut engine, &confirmed());
        assert_eq!(second.rows_updated, 0);
        assert_eq!(second.fields_encrypted, 0);
        assert_eq!(second.hashes_updated, 0);
        assert!(second.records.is_empty());
        assert_eq!(dump(engine.store(), "patients"), after_first);
    }

    #[test]
    fn dry_run_reports_same_counts_and_changes_nothing() {
        let mut preview = engine(PATIENTS_SQL, PATIENTS_YAML);
        let before = dump(preview.store(), "patients");
        let dry = encrypt(
            &mut preview,
            &EncryptOptions {
                dry_run: true,
                confirmation: None,
            },
        );
        assert_eq!(dry.outcome, BatchOutcome::DryRun);
        assert_eq!(dump(preview.store(), "patients"), before);
        assert!(dry.records.iter().all(|r| matches!(
            r.action,
            FieldAction::WouldEncrypt | FieldAction::WouldUpdateHash
        )));

        let mut real = engine(PATIENTS_SQL, PATIENTS_YAML);
        let done = encrypt(&mut real, &confirmed());
        assert_eq!(dry.records_processed, done.records_processed);
        assert_eq!(dry.rows_updated, done.rows_updated);
        assert_eq!(dry.fields_encrypted, done.fields_encrypted);
        assert_eq!(dry.hashes_updated, done.hashes_updated);
    }

    #[test]
    fn already_encrypted_row_is_left_alone() {
        let crypto = crypto();
        let first = crypto.codec.encode_value(&Value::from("Jane")).unwrap();
        let sql = format!(
            "CREATE TABLE allergies (id INTEGER PRIMARY KEY, allergen TEXT);
             INSERT INTO allergies VALUES (1, '{first}');"
        );
        let mut engine = engine(&sql, "tables:\n  - name: allergies\n    fields: [allergen]\n");
        let report = encrypt(&mut engine, &confirmed());
        assert_eq!(report.fields_encrypted, 0);
        assert_eq!(report.rows_updated, 0);
        assert_eq!(report.records_processed, 1);
        assert_eq!(dump(engine.store(), "allergies")[0][1].as_deref(), Some(first.as_str()));
    }

    #[test]
    fn hash_of_encrypted_searchable_field_uses_plaintext() {
        let crypto = crypto();
        let sealed = crypto.codec.encode_value(&Value::from("jdoe")).unwrap();
        let sql = format!(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, username TEXT, username_hash TEXT);
             INSERT INTO users VALUES (1, '{sealed}', NULL);"
        );
        let yaml = "tables:\n  - name: users\n    searchable_fields: [username]\n";
        let mut engine = engine(&sql, yaml);
        let report = encrypt(&mut engine, &confirmed());
        assert_eq!(report.hashes_updated, 1);
        assert_eq!(
            dump(engine.store(), "users")[0][2].as_deref(),
            Some(crypto.search.hash_for_search("jdoe", "").as_str())
        );
    }

    #[test]
    fn missing_hash_column_and_fields_are_skipped() {
        let sql = "CREATE TABLE users (id INTEGER PRIMARY KEY, username TEXT, email TEXT);
                   INSERT INTO users VALUES (1, 'jdoe', 'j@example.org');";
        let yaml = "tables:\n  - name: users\n    fields: [email, npi]\n    searchable_fields: [username]\n";
        let mut engine = engine(sql, yaml);
        let report = encrypt(&mut engine, &confirmed());
        assert_eq!(report.fields_encrypted, 1);
        assert_eq!(report.hashes_updated, 0);
        assert!(report.errors.is_empty());
        assert_eq!(dump(engine.store(), "users")[0][1].as_deref(), Some("jdoe"));
    }

    #[test]
    fn rows_without_id_are_skipped_and_reported() {
        let sql = "CREATE TABLE messages (id, body TEXT);
                   INSERT INTO messages VALUES (NULL, 'hello'), ('m-7', 'hi'), (5, 'world');";
        let mut engine = engine(sql, "tables:\n  - name: messages\n    fields: [body]\n");
        let report = encrypt(&mut engine, &confirmed());
        assert_eq!(report.outcome, BatchOutcome::Committed);
        assert_eq!(report.records_processed, 1);
        assert_eq!(report.fields_encrypted, 1);
        assert_eq!(report.errors, ["2 rows without an integer id skipped"]);
        assert!(report.is_failure());
    }

    #[test]
    fn searchable_column_value_is_not_wrapped_again() {
        let crypto = crypto();
        let column = ColumnKind::SearchableString.codec(&crypto.codec, &crypto.search);
        let stored = column.write(Some(&Value::from("Doe"))).unwrap().unwrap();
        let sql = format!(
            "CREATE TABLE patients (id INTEGER PRIMARY KEY, last_name TEXT, last_name_hash TEXT);
             INSERT INTO patients VALUES (1, '{stored}', NULL);"
        );
        let yaml = "tables:\n  - name: patients\n    fields: [last_name]\n    searchable_fields: [last_name]\n";
        let mut engine = engine(&sql, yaml);
        let report = encrypt(&mut engine, &confirmed());
        assert_eq!(report.fields_encrypted, 0);
        assert_eq!(report.hashes_updated, 1);

        let rows = dump(engine.store(), "patients");
        let row = &rows[0];
        assert_eq!(row[1].as_deref(), Some(stored.as_str()));
        assert_eq!(
            row[2].as_deref(),
            Some(crypto.search.hash_for_search("Doe", "").as_str())
        );
        assert_eq!(column.read(row[1].as_deref()).unwrap(), Some(Value::from("Doe")));

        let verified = engine.verify().remove(0);
        assert!(verified.verified, "{:?}", verified.errors);
        assert_eq!(verified.fields_checked, 1);
    }

    #[test]
    fn integral_real_hash_keeps_decimal_point() {
        let sql = "CREATE TABLE vitals (id INTEGER PRIMARY KEY, weight REAL, weight_hash TEXT);
                   INSERT INTO vitals VALUES (1, 65.0, NULL);";
        let mut engine = engine(sql, "tables:\n  - name: vitals\n    searchable_fields: [weight]\n");
        encrypt(&mut engine, &confirmed());
        assert_eq!(
            dump(engine.store(), "vitals")[0][2].as_deref(),
            Some(crypto().search.hash_for_search("65.0", "").as_str())
        );
    }

    #[test]
    fn missing_table_is_reported_and_later_tables_still_run() {
        let sql = "CREATE TABLE messages (id INTEGER PRIMARY KEY, body TEXT);
                   INSERT INTO messages VALUES (1, 'hello');";
        let yaml = "tables:\n  - name: vitals\n    fields: [pulse]\n  - name: messages\n    fields: [body]\n";
        let mut engine = engine(sql, yaml);
        let reports = engine.encrypt(&confirmed()).unwrap();
        assert_eq!(reports[0].outcome, BatchOutcome::RolledBack);
        assert_eq!(reports[0].errors, ["table vitals does not exist"]);
        assert_eq!(reports[1].outcome, BatchOutcome::Committed);
        assert_eq!(reports[1].fields_encrypted, 1);
    }

    #[test]
    fn constraint_failure_does_not_stop_the_table() {
        let sql = "CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT CHECK (length(body) < 120));
                   INSERT INTO notes VALUES
                       (1, 'short'),
                       (2, 'this note is long enough that its envelope breaks the check constraint on the column'),
                       (3, 'also short');";
        let mut engine = engine(sql, "tables:\n  - name: notes\n    fields: [body]\n");
        let report = encrypt(&mut engine, &confirmed());

        assert_eq!(report.outcome, BatchOutcome::Committed);
        assert_eq!(report.records_processed, 3);
        assert_eq!(report.rows_updated, 2);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].starts_with("row 2 in notes: "));
        assert!(report.errors[0].contains("constraint failed"));
        assert!(report.is_failure());

        let failed = report.records.iter().find(|r| r.row_id == 2).unwrap();
        assert!(matches!(failed.action, FieldAction::Failed(_)));

        let rows = dump(engine.store(), "notes");
        assert!(is_encrypted(rows[0][1].as_deref().unwrap()));
        assert!(!is_encrypted(rows[1][1].as_deref().unwrap()));
        assert!(is_encrypted(rows[2][1].as_deref().unwrap()));
    }

    fn mock_table(store: &mut MockRowStore, rows: usize) {
        store.expect_table_exists().returning(|_| Ok(true));
        store
            .expect_columns()
            .returning(|_| Ok(vec!["id".to_owned(), "body".to_owned()]));
        store.expect_fetch_rows().returning(move |_, _, _| {
            Ok((1..=rows as i64)
                .map(|id| {
                    Row::new(BTreeMap::from([
                        ("id".to_owned(), StoredValue::Integer(id)),
                        ("body".to_owned(), StoredValue::Text(format!("note {id}"))),
                    ]))
                })
                .collect())
        });
        store.expect_begin().times(1).returning(|| Ok(()));
    }

    fn mock_engine(store: MockRowStore, settings: EngineSettings) -> MigrationEngine<MockRowStore> {
        MigrationEngine::new(
            store,
            schema("tables:\n  - name: messages\n    fields: [body]\n"),
            crypto(),
            settings,
        )
    }

    #[test]
    fn commit_failure_rolls_the_table_back() {
        let mut store = MockRowStore::new();
        mock_table(&mut store, 2);
        store.expect_update_row().times(2).returning(|_, _, _| Ok(()));
        store
            .expect_commit()
            .times(1)
            .returning(|| Err(StoreError::Connection("disk I/O error".into())));
        store.expect_rollback().times(1).returning(|| Ok(()));

        let mut engine = mock_engine(store, EngineSettings::default());
        let report = encrypt(&mut engine, &confirmed());
        assert_eq!(report.outcome, BatchOutcome::RolledBack);
        assert!(report.errors[0].contains("disk I/O error"));
        assert!(report.is_failure());
    }

    #[test]
    fn connection_failure_mid_table_rolls_back() {
        let mut store = MockRowStore::new();
        mock_table(&mut store, 3);
        store
            .expect_update_row()
            .with(eq("messages"), eq(1i64), mockall::predicate::always())
            .returning(|_, _, _| Ok(()));
        store
            .expect_update_row()
            .with(eq("messages"), eq(2i64), mockall::predicate::always())
            .returning(|_, _, _| Err(StoreError::Connection("database is locked".into())));
        store.expect_commit().never();
        store.expect_rollback().times(1).returning(|| Ok(()));

        let mut engine = mock_engine(store, EngineSettings::default());
        let report = encrypt(&mut engine, &confirmed());
        assert_eq!(report.outcome, BatchOutcome::RolledBack);
        assert_eq!(report.records_processed, 1);
    }

    #[test]
    fn too_many_row_errors_rolls_back() {
        let mut store = MockRowStore::new();
        mock_table(&mut store, 5);
        store.expect_update_row().returning(|_, id, _| {
            Err(StoreError::Row {
                row_id: id,
                message: "constraint failed".into(),
            })
        });
        store.expect_commit().never();
        store.expect_rollback().times(1).returning(|| Ok(()));

        let settings = EngineSettings {
            max_row_errors: 2,
            ..EngineSettings::default()
        };
        let mut engine = mock_engine(store, settings);
        let report = encrypt(&mut engine, &confirmed());
        assert_eq!(report.outcome, BatchOutcome::RolledBack);
        assert_eq!(report.records_processed, 3);
        assert_eq!(report.errors.last().unwrap(), "aborted after 3 row errors");
    }

    #[test]
    fn refuses_without_confirmation() {
        let mut store = MockRowStore::new();
        store.expect_begin().never();
        let mut engine = mock_engine(store, EngineSettings::default());
        assert!(matches!(
            engine.encrypt(&EncryptOptions::default()),
            Err(MigrationError::ConfirmationRequired)
        ));
    }
}
