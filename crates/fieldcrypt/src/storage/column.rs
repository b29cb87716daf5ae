//! Column codecs: the only place plaintext crosses into persisted form.

use serde::Deserialize;

use crate::codec::{CodecError, TypeTag, TypedCodec, Value};
use crate::crypto::{is_encrypted, FieldCipher};
use crate::search::{is_search_hash, SearchHasher, SEARCH_HASH_LEN};

/// Separator between the search hash and the envelope in a searchable column.
pub const SEARCH_SEPARATOR: char = '|';

/// How older writers stored an empty searchable value: empty hash, empty envelope.
const EMPTY_SEARCHABLE: &str = "|";

/// Split a stored `<hash>|<envelope>` value into its hash and envelope.
///
/// `None` unless the hash is a well-formed search hash and the tail is an
/// envelope, so plaintext that merely contains a `|` is never split.
pub fn split_searchable(stored: &str) -> Option<(&str, &str)> {
    let (hash, envelope) = stored.split_once(SEARCH_SEPARATOR)?;
    (is_search_hash(hash) && is_encrypted(envelope)).then_some((hash, envelope))
}

/// `true` for a bare envelope or a `<hash>|<envelope>` searchable value.
pub fn is_sealed(stored: &str) -> bool {
    is_encrypted(stored) || split_searchable(stored).is_some()
}

/// Which codec a column uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    /// Short string column (names, phone numbers).
    EncryptedString,
    /// Unbounded text column (notes, message bodies).
    EncryptedText,
    /// Structured JSON column (allergy lists, vitals panels).
    EncryptedJson,
    /// String column stored as `<hash>|<envelope>` for equality search.
    SearchableString,
}

impl ColumnKind {
    /// Build the codec for this column kind.
    pub fn codec(self, codec: &TypedCodec, hasher: &SearchHasher) -> Box<dyn ColumnCodec> {
        match self {
            ColumnKind::EncryptedString => Box::new(EncryptedString::new(codec.clone())),
            ColumnKind::EncryptedText => Box::new(EncryptedString::text(codec.clone())),
            ColumnKind::EncryptedJson => Box::new(EncryptedJson::new(codec.clone())),
            ColumnKind::SearchableString => Box::new(SearchableString::new(
                codec.cipher().clone(),
                hasher.clone(),
            )),
        }
    }
}

/// Shared contract for every encrypted column type.
pub trait ColumnCodec: Send + Sync {
    fn kind(&self) -> ColumnKind;

    /// Turn an in-memory value into its stored form.
    fn write(&self, value: Option<&Value>) -> Result<Option<String>, CodecError>;

    /// Turn a stored form back into an in-memory value.
    fn read(&self, stored: Option<&str>) -> Result<Option<Value>, CodecError>;

    /// Column width needed to hold `plaintext_len` characters once encoded,
    /// or `None` for unbounded text storage.
    fn stored_width(&self, plaintext_len: usize) -> Option<usize>;

    /// Search hash for `value`, for columns that support equality lookup.
    fn search_hash(&self, _value: &str) -> Option<String> {
        None
    }
}

// ---------------------------------------------------------------------------
// Opaque string
// ---------------------------------------------------------------------------

/// Opaque string column: typed encode on write, typed decode on read.
#[derive(Clone, Debug)]
pub struct EncryptedString {
    codec: TypedCodec,
    bounded: bool,
}

impl EncryptedString {
    pub fn new(codec: TypedCodec) -> Self {
        Self { codec, bounded: true }
    }

    /// Same codec over an unbounded text column.
    pub fn text(codec: TypedCodec) -> Self {
        Self {
            codec,
            bounded: false,
        }
    }
}

impl ColumnCodec for EncryptedString {
    fn kind(&self) -> ColumnKind {
        if self.bounded {
            ColumnKind::EncryptedString
        } else {
            ColumnKind::EncryptedText
        }
    }

    fn write(&self, value: Option<&Value>) -> Result<Option<String>, CodecError> {
        self.codec.encode(value)
    }

    fn read(&self, stored: Option<&str>) -> Result<Option<Value>, CodecError> {
        self.codec.decode(stored)
    }

    fn stored_width(&self, plaintext_len: usize) -> Option<usize> {
        self.bounded.then(|| plaintext_len * 4)
    }
}

// ---------------------------------------------------------------------------
// Opaque JSON
// ---------------------------------------------------------------------------

/// Opaque JSON column: always tagged `json`, always reads back a document.
#[derive(Clone, Debug)]
pub struct EncryptedJson {
    codec: TypedCodec,
}

impl EncryptedJson {
    pub fn new(codec: TypedCodec) -> Self {
        Self { codec }
    }
}

impl ColumnCodec for EncryptedJson {
    fn kind(&self) -> ColumnKind {
        ColumnKind::EncryptedJson
    }

    fn write(&self, value: Option<&Value>) -> Result<Option<String>, CodecError> {
        let Some(value) = value else {
            return Ok(None);
        };
        if let Value::String(s) = value {
            if s.is_empty() || is_encrypted(s) {
                return Ok(Some(s.clone()));
            }
        }
        let text = value.clone().into_json().to_string();
        self.codec.encode_text(&text, TypeTag::Json).map(Some)
    }

    fn read(&self, stored: Option<&str>) -> Result<Option<Value>, CodecError> {
        let Some(stored) = stored else {
            return Ok(None);
        };
        if stored.is_empty() {
            return Ok(Some(Value::String(String::new())));
        }
        let value = match self.codec.decode_value(stored)? {
            Value::String(text) => {
                serde_json::from_str(&text).map_err(|e| CodecError::InvalidPayload {
                    tag: TypeTag::Json,
                    reason: e.to_string(),
                })?
            }
            other => other.into_json(),
        };
        Ok(Some(Value::Json(value)))
    }

    fn stored_width(&self, _plaintext_len: usize) -> Option<usize> {
        None
    }
}

// ---------------------------------------------------------------------------
// Search-augmented string
// ---------------------------------------------------------------------------

/// String column stored as `<64-hex search hash>|<envelope>`.
///
/// The envelope holds the untyped text; reads return [`Value::String`].
#[derive(Clone, Debug)]
pub struct SearchableString {
    cipher: FieldCipher,
    hasher: SearchHasher,
    field_salt: String,
}

impl SearchableString {
    pub fn new(cipher: FieldCipher, hasher: SearchHasher) -> Self {
        Self {
            cipher,
            hasher,
            field_salt: String::new(),
        }
    }

    /// Use a per-field salt for the search hash.
    ///
    /// Changing the salt of a populated column makes every stored hash stale.
    pub fn with_field_salt(mut self, salt: impl Into<String>) -> Self {
        self.field_salt = salt.into();
        self
    }

    /// The hash to compare against when looking a plaintext value up.
    pub fn lookup_hash(&self, value: &str) -> String {
        self.hasher.hash_for_search(value, &self.field_salt)
    }

    /// `LIKE` pattern matching every stored row whose plaintext equals `value`.
    pub fn lookup_pattern(&self, value: &str) -> String {
        format!("{}{SEARCH_SEPARATOR}%", self.lookup_hash(value))
    }

}

impl ColumnCodec for SearchableString {
    fn kind(&self) -> ColumnKind {
        ColumnKind::SearchableString
    }

    fn write(&self, value: Option<&Value>) -> Result<Option<String>, CodecError> {
        let Some(value) = value else {
            return Ok(None);
        };
        let text = value.to_plain_string();
        if text.is_empty() || split_searchable(&text).is_some() {
            return Ok(Some(text));
        }
        // A bare envelope: hash the plaintext behind it, keep the envelope.
        let (plain, envelope) = if is_encrypted(&text) {
            (self.cipher.decrypt(&text)?, text)
        } else {
            let envelope = self.cipher.encrypt(&text)?;
            (text, envelope)
        };
        let hash = self.lookup_hash(&plain);
        Ok(Some(format!("{hash}{SEARCH_SEPARATOR}{envelope}")))
    }

    fn read(&self, stored: Option<&str>) -> Result<Option<Value>, CodecError> {
        let Some(stored) = stored else {
            return Ok(None);
        };
        if stored == EMPTY_SEARCHABLE {
            return Ok(Some(Value::String(String::new())));
        }
        let envelope = match split_searchable(stored) {
            Some((_, envelope)) => envelope,
            None => stored,
        };
        Ok(Some(Value::String(self.cipher.decrypt(envelope)?)))
    }

    fn stored_width(&self, plaintext_len: usize) -> Option<usize> {
        Some(plaintext_len * 4 + SEARCH_HASH_LEN + 1)
    }

    fn search_hash(&self, value: &str) -> Option<String> {
        Some(self.lookup_hash(value))
    }
}
