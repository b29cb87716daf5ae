//! The analyze pass. Read-only.

use common::report::{FieldStatus, TableAnalysis, TableStatus};
use tracing::{info, warn};

use super::{classify, MigrationEngine};
use crate::schema::TableSchema;
use crate::store::{RowStore, StoreError, StoredValue};

impl<S: RowStore> MigrationEngine<S> {
    /// Classify a sample of every configured table.
    pub fn analyze(&mut self) -> Vec<TableAnalysis> {
        let tables = self.schema.tables().to_vec();
        let mut results = Vec::with_capacity(tables.len());
        for table in &tables {
            if self.should_stop(&table.name) {
                break;
            }
            let analysis = self.analyze_table(table).unwrap_or_else(|e| {
                warn!(table = %table.name, error = %e, "analysis failed");
                TableAnalysis::error(&table.name, table.fields.len(), e.to_string())
            });
            results.push(analysis);
        }
        results
    }

    fn analyze_table(&self, table: &TableSchema) -> Result<TableAnalysis, StoreError> {
        let columns = self.table_columns(table)?;
        let total = self.store.count_rows(&table.name)?;
        let rows = self.store.fetch_rows(
            &table.name,
            &columns.field_select(),
            Some(self.settings.analyze_sample_size),
        )?;

        let (mut encrypted, mut unencrypted) = (0, 0);
        for row in &rows {
            for &field in &columns.fields {
                match classify(row.get(field).unwrap_or(&StoredValue::Null)) {
                    FieldStatus::Encrypted => encrypted += 1,
                    FieldStatus::Plaintext => unencrypted += 1,
                    FieldStatus::Empty => {}
                }
            }
        }

        let status = TableStatus::from_counts(encrypted, unencrypted);
        info!(
            table = %table.name,
            status = status.as_str(),
            total,
            sampled = rows.len(),
            encrypted,
            unencrypted,
            "table analyzed"
        );
        Ok(TableAnalysis {
            table: table.name.clone(),
            status,
            total_records: Some(total),
            fields_to_encrypt: table.fields.len(),
            encrypted_fields_found: encrypted,
            unencrypted_fields_found: unencrypted,
            absent_fields_found: columns.absent,
            message: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use fieldcrypt::Value;

    use super::super::testing::*;
    use super::super::EngineSettings;
    use super::*;
    use crate::store::MockRowStore;

    #[test]
    fn plaintext_table_is_unencrypted() {
        let mut engine = engine(PATIENTS_SQL, PATIENTS_YAML);
        let analysis = engine.analyze().remove(0);
        assert_eq!(analysis.status, TableStatus::Unencrypted);
        assert_eq!(analysis.total_records, Some(2));
        assert_eq!(analysis.fields_to_encrypt, 5);
        // first_name, last_name, height_inches, bmi on row 1; height_inches = 0 on row 2.
        assert_eq!(analysis.unencrypted_fields_found, 5);
        assert_eq!(analysis.encrypted_fields_found, 0);
        assert_eq!(analysis.absent_fields_found, 1);
    }

    #[test]
    fn enveloped_row_is_encrypted() {
        let sealed = crypto().codec.encode_value(&Value::from("penicillin")).unwrap();
        let sql = format!(
            "CREATE TABLE allergies (id INTEGER PRIMARY KEY, allergen TEXT, reaction TEXT);
             INSERT INTO allergies VALUES (1, '{sealed}', NULL);"
        );
        let mut engine = engine(&sql, "tables:\n  - name: allergies\n    fields: [allergen, reaction]\n");
        let analysis = engine.analyze().remove(0);
        assert_eq!(analysis.status, TableStatus::Encrypted);
        assert_eq!(analysis.encrypted_fields_found, 1);
        assert_eq!(analysis.unencrypted_fields_found, 0);
    }

    #[test]
    fn mixed_rows_are_partial() {
        let mut engine = engine(PATIENTS_SQL, PATIENTS_YAML);
        engine.encrypt(&confirmed()).unwrap();
        engine
            .store()
            .connection()
            .execute_batch("INSERT INTO patients (id, first_name) VALUES (3, 'New')")
            .unwrap();
        assert_eq!(engine.analyze()[0].status, TableStatus::Partial);
    }

    #[test]
    fn missing_table_is_an_error() {
        let mut engine = engine(PATIENTS_SQL, "tables:\n  - name: vitals\n    fields: [pulse]\n");
        let analysis = engine.analyze().remove(0);
        assert_eq!(analysis.status, TableStatus::Error);
        assert_eq!(analysis.message.as_deref(), Some("table vitals does not exist"));
        assert_eq!(analysis.total_records, None);
    }

    #[test]
    fn sample_size_limits_rows_read() {
        let mut store = MockRowStore::new();
        store.expect_table_exists().returning(|_| Ok(true));
        store
            .expect_columns()
            .returning(|_| Ok(vec!["id".to_owned(), "body".to_owned()]));
        store.expect_count_rows().returning(|_| Ok(1_000));
        store
            .expect_fetch_rows()
            .withf(|_, _, limit| *limit == Some(3))
            .times(1)
            .returning(|_, _, _| Ok(Vec::new()));
        store.expect_begin().never();

        let settings = EngineSettings {
            analyze_sample_size: 3,
            ..EngineSettings::default()
        };
        let mut engine = MigrationEngine::new(
            store,
            schema("tables:\n  - name: messages\n    fields: [body]\n"),
            crypto(),
            settings,
        );
        let analysis = engine.analyze().remove(0);
        assert_eq!(analysis.total_records, Some(1_000));
        assert_eq!(analysis.status, TableStatus::Unencrypted);
    }

    #[test]
    fn query_failure_is_an_error() {
        let mut store = MockRowStore::new();
        store.expect_table_exists().returning(|_| Ok(true));
        store
            .expect_columns()
            .returning(|_| Err(StoreError::Connection("database disk image is malformed".into())));
        let mut engine = MigrationEngine::new(
            store,
            schema("tables:\n  - name: messages\n    fields: [body]\n"),
            crypto(),
            EngineSettings::default(),
        );
        let analysis = engine.analyze().remove(0);
        assert_eq!(analysis.status, TableStatus::Error);
        assert!(analysis.message.unwrap().contains("malformed"));
    }
}
