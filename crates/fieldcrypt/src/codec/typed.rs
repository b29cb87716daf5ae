//! [`TypedCodec`]: type-preserving encryption on top of [`FieldCipher`].

use thiserror::Error;

use super::value::{TypeTag, Value};
use crate::crypto::{is_encrypted, CipherError, FieldCipher};

/// Separator between the type tag and the value inside the plaintext.
const TAG_SEPARATOR: char = ':';

/// Errors produced by the codec layer.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error(transparent)]
    Cipher(#[from] CipherError),

    /// A known type tag whose payload does not parse as that type.
    #[error("invalid {tag} payload: {reason}")]
    InvalidPayload { tag: TypeTag, reason: String },
}

impl From<CodecError> for common::FieldError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Cipher(c) => c.into(),
            other => common::FieldError::Encoding(other.to_string()),
        }
    }
}

/// Wraps a [`FieldCipher`] so that a decrypted value comes back with the
/// logical type it was encrypted with.
#[derive(Clone, Debug)]
pub struct TypedCodec {
    cipher: FieldCipher,
}

impl TypedCodec {
    pub fn new(cipher: FieldCipher) -> Self {
        Self { cipher }
    }

    pub fn cipher(&self) -> &FieldCipher {
        &self.cipher
    }

    /// Encode an optional value for storage. `None` stays `None`.
    pub fn encode(&self, value: Option<&Value>) -> Result<Option<String>, CodecError> {
        value.map(|v| self.encode_value(v)).transpose()
    }

    /// Encode a value, tagging it with its own type.
    ///
    /// The empty string passes through unchanged, and a string that already
    /// carries the envelope prefix is returned as-is so repeated saves never
    /// wrap a value twice.
    pub fn encode_value(&self, value: &Value) -> Result<String, CodecError> {
        match value {
            Value::String(s) => self.encode_text(s, TypeTag::String),
            other => self.encode_text(&other.to_plain_string(), other.tag()),
        }
    }

    /// Encode raw text under a caller-chosen tag.
    pub fn encode_text(&self, text: &str, tag: TypeTag) -> Result<String, CodecError> {
        if text.is_empty() || is_encrypted(text) {
            return Ok(text.to_owned());
        }
        let tagged = format!("{}{TAG_SEPARATOR}{text}", tag.as_str());
        Ok(self.cipher.encrypt(&tagged)?)
    }

    /// Decode an optional stored value. `None` stays `None`.
    pub fn decode(&self, stored: Option<&str>) -> Result<Option<Value>, CodecError> {
        stored.map(|s| self.decode_value(s)).transpose()
    }

    /// Decode a stored value.
    ///
    /// Values without the envelope prefix are legacy plaintext and come back
    /// as [`Value::String`] unchanged.
    ///
    /// # Errors
    ///
    /// Propagates [`CipherError::Authentication`] and encoding failures from the
    /// cipher, and returns [`CodecError::InvalidPayload`] when a known tag's
    /// payload does not parse.
    pub fn decode_value(&self, stored: &str) -> Result<Value, CodecError> {
        if !is_encrypted(stored) {
            return Ok(Value::String(stored.to_owned()));
        }
        let plaintext = self.cipher.decrypt(stored)?;
        parse_typed(plaintext)
    }
}

/// Split decrypted plaintext on the first `:` and coerce by tag.
///
/// A missing or unknown tag returns the whole plaintext as a string, so data
/// written with a future tag still reads.
pub fn parse_typed(plaintext: String) -> Result<Value, CodecError> {
    let Some((raw_tag, body)) = plaintext.split_once(TAG_SEPARATOR) else {
        return Ok(Value::String(plaintext));
    };
    let Some(tag) = TypeTag::parse(raw_tag) else {
        return Ok(Value::String(plaintext));
    };

    let invalid = |reason: String| CodecError::InvalidPayload { tag, reason };
    match tag {
        TypeTag::String => Ok(Value::String(body.to_owned())),
        TypeTag::Int => body
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|e| invalid(e.to_string())),
        TypeTag::Float => body
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|e| invalid(e.to_string())),
        TypeTag::Json => serde_json::from_str(body)
            .map(Value::Json)
            .map_err(|e| invalid(e.to_string())),
    }
}
