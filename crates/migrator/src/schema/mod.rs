//! Table schema: which columns of which tables hold PHI.
//!
//! # Module invariants
//!
//! - **No crypto dependencies.** This module decides *what* is migrated,
//!   never *how*; it must not import anything from `fieldcrypt`.
//! - Every table and column name is a plain SQL identifier once loaded, so
//!   the store can quote it without further checks.

use std::collections::BTreeSet;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;
use tracing::info;

const DEFAULT_SCHEMA: &str = include_str!("default.yaml");

/// Suffix of the column that stores a searchable field's hash.
pub const HASH_COLUMN_SUFFIX: &str = "_hash";

/// Column holding each row's identity.
pub const ID_COLUMN: &str = "id";

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("failed to read schema file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse schema: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid {what} name {name:?}: must match [A-Za-z_][A-Za-z0-9_]*")]
    InvalidIdentifier { what: &'static str, name: String },

    #[error("table {0} is configured more than once")]
    DuplicateTable(String),

    #[error("table {table}: column {column} is both encrypted and excluded")]
    ExcludedField { table: String, column: String },

    #[error("unknown table {name}; configured tables: {available}")]
    UnknownTable { name: String, available: String },

    #[error("schema configures no tables")]
    Empty,
}

impl From<SchemaError> for common::FieldError {
    fn from(e: SchemaError) -> Self {
        common::FieldError::Configuration(e.to_string())
    }
}

/// Encryption settings for one table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TableSchema {
    pub name: String,
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default)]
    pub searchable_fields: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl TableSchema {
    /// The column a searchable field's hash is written to.
    pub fn hash_column(field: &str) -> String {
        format!("{field}{HASH_COLUMN_SUFFIX}")
    }

    fn validate(&self) -> Result<(), SchemaError> {
        ensure_identifier("table", &self.name)?;
        for column in self.fields.iter().chain(&self.searchable_fields).chain(&self.exclude) {
            ensure_identifier("column", column)?;
        }
        let excluded: BTreeSet<&str> = self
            .exclude
            .iter()
            .map(String::as_str)
            .chain([ID_COLUMN])
            .collect();
        if let Some(column) = self.fields.iter().find(|f| excluded.contains(f.as_str())) {
            return Err(SchemaError::ExcludedField {
                table: self.name.clone(),
                column: column.clone(),
            });
        }
        Ok(())
    }
}

/// Ordered table map. Tables are processed in file order.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EncryptionSchema {
    tables: Vec<TableSchema>,
}

impl EncryptionSchema {
    /// The built-in schema covering the standard EHR tables.
    pub fn builtin() -> Result<Self, SchemaError> {
        Self::from_yaml(DEFAULT_SCHEMA)
    }

    pub fn from_yaml(text: &str) -> Result<Self, SchemaError> {
        let schema: EncryptionSchema = serde_yaml::from_str(text)?;
        schema.validate()?;
        Ok(schema)
    }

    pub fn from_file(path: &Path) -> Result<Self, SchemaError> {
        let text = std::fs::read_to_string(path).map_err(|source| SchemaError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let schema = Self::from_yaml(&text)?;
        info!(path = %path.display(), tables = schema.tables.len(), "loaded table schema");
        Ok(schema)
    }

    /// Load from `path`, or fall back to the built-in schema.
    pub fn load(path: Option<&Path>) -> Result<Self, SchemaError> {
        match path {
            Some(p) => Self::from_file(p),
            None => Self::builtin(),
        }
    }

    pub fn tables(&self) -> &[TableSchema] {
        &self.tables
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Restrict the schema to one table, or keep it whole when `name` is `None`.
    pub fn select(self, name: Option<&str>) -> Result<Self, SchemaError> {
        let Some(name) = name else {
            return Ok(self);
        };
        match self.table(name) {
            Some(t) => Ok(Self {
                tables: vec![t.clone()],
            }),
            None => Err(SchemaError::UnknownTable {
                name: name.to_owned(),
                available: self
                    .tables
                    .iter()
                    .map(|t| t.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
            }),
        }
    }

    fn validate(&self) -> Result<(), SchemaError> {
        if self.tables.is_empty() {
            return Err(SchemaError::Empty);
        }
        let mut seen = BTreeSet::new();
        for t in &self.tables {
            t.validate()?;
            if !seen.insert(t.name.as_str()) {
                return Err(SchemaError::DuplicateTable(t.name.clone()));
            }
        }
        Ok(())
    }
}

/// `true` for `[A-Za-z_][A-Za-z0-9_]*`.
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn ensure_identifier(what: &'static str, name: &str) -> Result<(), SchemaError> {
    if is_identifier(name) {
        Ok(())
    } else {
        Err(SchemaError::InvalidIdentifier {
            what,
            name: name.to_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_schema_loads() {
        let schema = EncryptionSchema::builtin().unwrap();
        assert_eq!(schema.tables().len(), 12);
        assert_eq!(schema.tables()[0].name, "patients");

        let patients = schema.table("patients").unwrap();
        assert_eq!(patients.fields.len(), 20);
        assert_eq!(patients.searchable_fields, ["mrn", "last_name"]);
        assert_eq!(schema.table("users").unwrap().searchable_fields, ["username"]);
    }

    #[test]
    fn identifiers() {
        assert!(is_identifier("patients"));
        assert!(is_identifier("_x9"));
        assert!(!is_identifier("9lives"));
        assert!(!is_identifier(""));
        assert!(!is_identifier("name; DROP TABLE users"));
        assert!(!is_identifier("a\"b"));
    }

    #[test]
    fn rejects_bad_identifiers() {
        let err = EncryptionSchema::from_yaml("tables:\n  - name: \"bad name\"\n").unwrap_err();
        assert!(matches!(err, SchemaError::InvalidIdentifier { what: "table", .. }));

        let err = EncryptionSchema::from_yaml("tables:\n  - name: t\n    fields: [\"x-y\"]\n")
            .unwrap_err();
        assert!(matches!(err, SchemaError::InvalidIdentifier { what: "column", .. }));
    }

    #[test]
    fn rejects_excluded_or_id_fields() {
        let yaml = "tables:\n  - name: t\n    fields: [a]\n    exclude: [a]\n";
        assert!(matches!(
            EncryptionSchema::from_yaml(yaml),
            Err(SchemaError::ExcludedField { .. })
        ));
        let yaml = "tables:\n  - name: t\n    fields: [id]\n";
        assert!(matches!(
            EncryptionSchema::from_yaml(yaml),
            Err(SchemaError::ExcludedField { .. })
        ));
    }

    #[test]
    fn rejects_duplicates_and_empty() {
        let yaml = "tables:\n  - name: t\n  - name: t\n";
        assert!(matches!(
            EncryptionSchema::from_yaml(yaml),
            Err(SchemaError::DuplicateTable(_))
        ));
        assert!(matches!(
            EncryptionSchema::from_yaml("tables: []\n"),
            Err(SchemaError::Empty)
        ));
    }

    #[test]
    fn select_filters_or_lists_tables() {
        let schema = EncryptionSchema::builtin().unwrap();
        let one = schema.clone().select(Some("vitals")).unwrap();
        assert_eq!(one.tables().len(), 1);
        assert_eq!(schema.clone().select(None).unwrap(), schema);

        let err = schema.select(Some("nope")).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("nope"));
        assert!(msg.contains("patients"));
        assert!(msg.contains("audit_logs"));
    }

    #[test]
    fn hash_column_name() {
        assert_eq!(TableSchema::hash_column("mrn"), "mrn_hash");
    }
}
