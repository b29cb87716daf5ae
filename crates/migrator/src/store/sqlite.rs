//! [`RowStore`] over a SQLite database file.

use std::collections::BTreeMap;
use std::time::Duration;

use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OpenFlags};
use tracing::debug;

use super::{Row, RowStore, StoreError, StoredValue};
use crate::schema::ID_COLUMN;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-backed row store.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open the database named by a `DATABASE_URL`.
    ///
    /// The file must already exist; a typo in the path must not silently
    /// migrate a fresh empty database.
    pub fn open(url: &str) -> Result<Self, StoreError> {
        let path = database_path(url)?;
        if path == ":memory:" {
            return Self::open_in_memory();
        }
        let conn = Connection::open_with_flags(&path, OpenFlags::SQLITE_OPEN_READ_WRITE)
            .map_err(|e| StoreError::Connection(format!("failed to open {path}: {e}")))?;
        debug!(path = %path, "opened sqlite database");
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(connection_error)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(BUSY_TIMEOUT).map_err(connection_error)?;
        Ok(Self { conn })
    }

    #[cfg(test)]
    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl RowStore for SqliteStore {
    fn table_exists(&self, table: &str) -> Result<bool, StoreError> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![table],
                |r| r.get(0),
            )
            .map_err(connection_error)?;
        Ok(count > 0)
    }

    fn columns(&self, table: &str) -> Result<Vec<String>, StoreError> {
        let sql = format!("PRAGMA table_info({})", quote(table));
        let mut stmt = self.conn.prepare(&sql).map_err(connection_error)?;
        let names = stmt
            .query_map([], |r| r.get::<_, String>(1))
            .map_err(connection_error)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(connection_error)?;
        Ok(names)
    }

    fn count_rows(&self, table: &str) -> Result<u64, StoreError> {
        let sql = format!("SELECT COUNT(*) FROM {}", quote(table));
        let count: i64 = self
            .conn
            .query_row(&sql, [], |r| r.get(0))
            .map_err(connection_error)?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    fn fetch_rows(
        &self,
        table: &str,
        columns: &[String],
        limit: Option<usize>,
    ) -> Result<Vec<Row>, StoreError> {
        if columns.is_empty() {
            return Ok(Vec::new());
        }
        let select = columns.iter().map(|c| quote(c)).collect::<Vec<_>>().join(", ");
        let order = if columns.iter().any(|c| c == ID_COLUMN) {
            quote(ID_COLUMN)
        } else {
            "rowid".to_owned()
        };
        let mut sql = format!("SELECT {select} FROM {} ORDER BY {order}", quote(table));
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let mut stmt = self.conn.prepare(&sql).map_err(connection_error)?;
        let rows = stmt
            .query_map([], |r| {
                let mut values = BTreeMap::new();
                for (i, name) in columns.iter().enumerate() {
                    values.insert(name.clone(), stored_value(r.get_ref(i)?));
                }
                Ok(Row::new(values))
            })
            .map_err(connection_error)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(connection_error)?;
        Ok(rows)
    }

    fn begin(&mut self) -> Result<(), StoreError> {
        self.conn
            .execute_batch("BEGIN IMMEDIATE")
            .map_err(connection_error)
    }

    fn update_row(
        &mut self,
        table: &str,
        id: i64,
        values: &[(String, StoredValue)],
    ) -> Result<(), StoreError> {
        if values.is_empty() {
            return Ok(());
        }
        let assignments = values
            .iter()
            .enumerate()
            .map(|(i, (column, _))| format!("{} = ?{}", quote(column), i + 1))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE {} SET {assignments} WHERE {} = ?{}",
            quote(table),
            quote(ID_COLUMN),
            values.len() + 1
        );
        let params = values
            .iter()
            .map(|(_, v)| sql_value(v))
            .chain(std::iter::once(SqlValue::Integer(id)));

        let changed = self
            .conn
            .execute(&sql, params_from_iter(params))
            .map_err(|e| row_error(id, e))?;
        if changed != 1 {
            return Err(StoreError::Row {
                row_id: id,
                message: format!("update matched {changed} rows"),
            });
        }
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        self.conn.execute_batch("COMMIT").map_err(connection_error)
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        self.conn.execute_batch("ROLLBACK").map_err(connection_error)
    }
}

/// Resolve a `DATABASE_URL` to a SQLite path.
///
/// Accepts `sqlite:///relative.db`, `sqlite:////absolute.db`, `sqlite://`
/// (in-memory), and bare paths.
pub fn database_path(url: &str) -> Result<String, StoreError> {
    let url = url.trim();
    if url == "sqlite://" {
        return Ok(":memory:".to_owned());
    }
    if let Some(path) = url.strip_prefix("sqlite:///") {
        if path.is_empty() {
            return Err(StoreError::UnsupportedUrl(url.to_owned()));
        }
        return Ok(path.to_owned());
    }
    if url.is_empty() || url.contains("://") {
        return Err(StoreError::UnsupportedUrl(url.to_owned()));
    }
    Ok(url.to_owned())
}

/// Double-quote an identifier. Names are validated upstream; embedded quotes
/// are doubled regardless.
fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn stored_value(v: ValueRef<'_>) -> StoredValue {
    match v {
        ValueRef::Null => StoredValue::Null,
        ValueRef::Integer(i) => StoredValue::Integer(i),
        ValueRef::Real(f) => StoredValue::Real(f),
        // Invalid UTF-8 stays binary so it is never rewritten lossily.
        ValueRef::Text(t) => match std::str::from_utf8(t) {
            Ok(s) => StoredValue::Text(s.to_owned()),
            Err(_) => StoredValue::Blob(t.to_vec()),
        },
        ValueRef::Blob(b) => StoredValue::Blob(b.to_vec()),
    }
}

fn sql_value(v: &StoredValue) -> SqlValue {
    match v {
        StoredValue::Null => SqlValue::Null,
        StoredValue::Integer(i) => SqlValue::Integer(*i),
        StoredValue::Real(f) => SqlValue::Real(*f),
        StoredValue::Text(s) => SqlValue::Text(s.clone()),
        StoredValue::Blob(b) => SqlValue::Blob(b.clone()),
    }
}

fn connection_error(e: rusqlite::Error) -> StoreError {
    StoreError::Connection(e.to_string())
}

/// Constraint and type failures belong to the row; everything else poisons
/// the batch.
fn row_error(row_id: i64, e: rusqlite::Error) -> StoreError {
    match &e {
        rusqlite::Error::SqliteFailure(f, _)
            if matches!(
                f.code,
                ErrorCode::ConstraintViolation | ErrorCode::TypeMismatch | ErrorCode::TooBig
            ) =>
        {
            StoreError::Row {
                row_id,
                message: e.to_string(),
            }
        }
        _ => connection_error(e),
    }
}
