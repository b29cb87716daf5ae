//! Row storage seen by the migration engine.
//!
//! The engine reads and writes raw stored values through [`RowStore`]; it
//! never sees a connection type. Table and column names reaching a store
//! have already been validated as identifiers by [`crate::schema`].

pub mod sqlite;

use std::collections::BTreeMap;

use thiserror::Error;

pub use sqlite::SqliteStore;

use crate::schema::ID_COLUMN;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The database URL names an unsupported backend or is malformed.
    #[error("unsupported database url {0:?}: expected sqlite:///<path>")]
    UnsupportedUrl(String),

    #[error("table {0} does not exist")]
    MissingTable(String),

    /// A failure confined to one row, such as a constraint violation.
    #[error("row {row_id}: {message}")]
    Row { row_id: i64, message: String },

    /// Anything that makes the connection or the transaction unusable.
    #[error("database error: {0}")]
    Connection(String),
}

impl StoreError {
    /// `true` if the current table batch cannot continue.
    pub fn is_systemic(&self) -> bool {
        !matches!(self, StoreError::Row { .. })
    }
}

/// One stored cell, in the storage classes SQLite distinguishes.
#[derive(Debug, Clone, PartialEq)]
pub enum StoredValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl StoredValue {
    /// NULL and the empty string. Zero is a value.
    pub fn is_empty(&self) -> bool {
        match self {
            StoredValue::Null => true,
            StoredValue::Text(s) => s.is_empty(),
            StoredValue::Blob(b) => b.is_empty(),
            StoredValue::Integer(_) | StoredValue::Real(_) => false,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            StoredValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// A fetched row: the requested columns by name.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    pub values: BTreeMap<String, StoredValue>,
}

impl Row {
    pub fn new(values: BTreeMap<String, StoredValue>) -> Self {
        Self { values }
    }

    /// The integer `id` column, if fetched and set.
    pub fn id(&self) -> Option<i64> {
        match self.values.get(ID_COLUMN) {
            Some(StoredValue::Integer(id)) => Some(*id),
            _ => None,
        }
    }

    pub fn get(&self, column: &str) -> Option<&StoredValue> {
        self.values.get(column)
    }
}

/// Transactional row access for one table at a time.
#[cfg_attr(test, mockall::automock)]
pub trait RowStore {
    fn table_exists(&self, table: &str) -> Result<bool, StoreError>;

    /// Column names of `table`, in declaration order.
    fn columns(&self, table: &str) -> Result<Vec<String>, StoreError>;

    fn count_rows(&self, table: &str) -> Result<u64, StoreError>;

    /// Fetch `columns` of up to `limit` rows, ordered by `id` when present.
    fn fetch_rows(
        &self,
        table: &str,
        columns: &[String],
        limit: Option<usize>,
    ) -> Result<Vec<Row>, StoreError>;

    fn begin(&mut self) -> Result<(), StoreError>;

    /// Set `values` on the row with `id`. Must affect exactly one row.
    fn update_row(
        &mut self,
        table: &str,
        id: i64,
        values: &[(String, StoredValue)],
    ) -> Result<(), StoreError>;

    fn commit(&mut self) -> Result<(), StoreError>;

    fn rollback(&mut self) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_means_null_or_blank() {
        assert!(StoredValue::Null.is_empty());
        assert!(StoredValue::Text(String::new()).is_empty());
        assert!(!StoredValue::Integer(0).is_empty());
        assert!(!StoredValue::Real(0.0).is_empty());
        assert!(!StoredValue::Text("0".into()).is_empty());
    }

    #[test]
    fn row_id_requires_integer() {
        let row = Row::new(BTreeMap::from([("id".to_owned(), StoredValue::Integer(7))]));
        assert_eq!(row.id(), Some(7));
        let row = Row::new(BTreeMap::from([("id".to_owned(), StoredValue::Null)]));
        assert_eq!(row.id(), None);
        assert_eq!(Row::default().id(), None);
    }

    #[test]
    fn only_row_errors_are_recoverable() {
        assert!(!StoreError::Row { row_id: 1, message: "x".into() }.is_systemic());
        assert!(StoreError::Connection("x".into()).is_systemic());
    }
}
