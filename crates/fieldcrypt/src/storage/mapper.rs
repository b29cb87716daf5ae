//! Record-level mapping between plaintext models and stored rows.

use std::collections::BTreeMap;

use thiserror::Error;

use super::column::{ColumnCodec, ColumnKind, SearchableString};
use crate::codec::{CodecError, TypedCodec, Value};
use crate::search::SearchHasher;

/// A record as the application sees it.
pub type PlainRecord = BTreeMap<String, Option<Value>>;

/// A record as the store holds it.
pub type StoredRecord = BTreeMap<String, Option<String>>;

#[derive(Debug, Error)]
#[error("column {column}: {source}")]
pub struct MapperError {
    pub column: String,
    #[source]
    pub source: CodecError,
}

impl From<MapperError> for common::FieldError {
    fn from(e: MapperError) -> Self {
        e.source.into()
    }
}

/// Maps records through per-column codecs.
///
/// Columns without a codec pass through: a plaintext value is written with
/// [`Value::to_plain_string`] and a stored value reads back as a string.
pub struct RecordMapper {
    codec: TypedCodec,
    hasher: SearchHasher,
    columns: BTreeMap<String, Box<dyn ColumnCodec>>,
}

impl RecordMapper {
    pub fn new(codec: TypedCodec, hasher: SearchHasher) -> Self {
        Self {
            codec,
            hasher,
            columns: BTreeMap::new(),
        }
    }

    /// Register a column with the standard codec for `kind`.
    pub fn column(mut self, name: impl Into<String>, kind: ColumnKind) -> Self {
        let codec = kind.codec(&self.codec, &self.hasher);
        self.columns.insert(name.into(), codec);
        self
    }

    /// Register a searchable column whose hash uses a per-field salt.
    pub fn searchable_column(mut self, name: impl Into<String>, field_salt: &str) -> Self {
        let codec = SearchableString::new(self.codec.cipher().clone(), self.hasher.clone())
            .with_field_salt(field_salt);
        self.columns.insert(name.into(), Box::new(codec));
        self
    }

    pub fn kind_of(&self, column: &str) -> Option<ColumnKind> {
        self.columns.get(column).map(|c| c.kind())
    }

    pub fn write_record(&self, record: &PlainRecord) -> Result<StoredRecord, MapperError> {
        record
            .iter()
            .map(|(name, value)| {
                let stored = match self.columns.get(name) {
                    Some(codec) => codec.write(value.as_ref()).map_err(|source| MapperError {
                        column: name.clone(),
                        source,
                    })?,
                    None => value.as_ref().map(Value::to_plain_string),
                };
                Ok((name.clone(), stored))
            })
            .collect()
    }

    pub fn read_record(&self, stored: &StoredRecord) -> Result<PlainRecord, MapperError> {
        stored
            .iter()
            .map(|(name, raw)| {
                let value = match self.columns.get(name) {
                    Some(codec) => codec.read(raw.as_deref()).map_err(|source| MapperError {
                        column: name.clone(),
                        source,
                    })?,
                    None => raw.clone().map(Value::String),
                };
                Ok((name.clone(), value))
            })
            .collect()
    }

    /// Hash prefix to query a searchable column with. `None` if the column is
    /// not registered as searchable.
    pub fn lookup_hash(&self, column: &str, value: &str) -> Option<String> {
        self.columns
            .get(column)?
            .search_hash(value)
            .filter(|hash| !hash.is_empty())
    }
}
