//! The verify pass. Read-only.

use common::report::TableVerification;
use fieldcrypt::is_sealed;
use tracing::{info, warn};

use super::MigrationEngine;
use crate::schema::TableSchema;
use crate::store::{RowStore, StoreError};

impl<S: RowStore> MigrationEngine<S> {
    /// Decrypt every enveloped field in a sample of each table.
    pub fn verify(&mut self) -> Vec<TableVerification> {
        let tables = self.schema.tables().to_vec();
        let mut results = Vec::with_capacity(tables.len());
        for table in &tables {
            if self.should_stop(&table.name) {
                break;
            }
            let mut verification = TableVerification::new(&table.name);
            if let Err(e) = self.verify_table(table, &mut verification) {
                verification.fail(e.to_string());
            }
            if verification.verified {
                info!(
                    table = %table.name,
                    records = verification.records_checked,
                    fields = verification.fields_checked,
                    "table verified"
                );
            } else {
                warn!(table = %table.name, errors = verification.errors.len(), "verification failed");
            }
            results.push(verification);
        }
        results
    }

    fn verify_table(&self, table: &TableSchema, out: &mut TableVerification) -> Result<(), StoreError> {
        let columns = self.table_columns(table)?;
        let rows = self.store.fetch_rows(
            &table.name,
            &columns.field_select(),
            Some(self.settings.verify_sample_size),
        )?;

        for row in &rows {
            let id = row
                .id()
                .map_or_else(|| "?".to_owned(), |id| id.to_string());
            for &field in &columns.fields {
                let Some(stored) = row
                    .get(field)
                    .and_then(|v| v.as_text())
                    .filter(|s| is_sealed(s))
                else {
                    continue;
                };
                match self.open_sealed(stored) {
                    Ok(value) if value.is_empty() => {
                        out.fail(format!("row {id}, field {field}: decryption returned empty"));
                    }
                    Ok(_) => out.fields_checked += 1,
                    Err(e) => out.fail(format!("row {id}, field {field}: {e}")),
                }
            }
            out.records_checked += 1;
        }
        Ok(())
    }
}
