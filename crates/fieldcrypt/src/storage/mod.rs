//! Persistence adapters: column codecs and a record mapper built on them.
//!
//! Everything above this layer handles plaintext [`crate::Value`]s; everything
//! below sees only envelopes, search hashes, or legacy plaintext.

pub mod column;
pub mod mapper;

pub use column::{
    is_sealed, split_searchable, ColumnCodec, ColumnKind, EncryptedJson, EncryptedString,
    SearchableString, SEARCH_SEPARATOR,
};
pub use mapper::{MapperError, PlainRecord, RecordMapper, StoredRecord};
