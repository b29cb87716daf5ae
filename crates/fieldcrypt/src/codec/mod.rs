//! Type-preserving encoding of field values.
//!
//! A value is tagged with its logical type before encryption
//! (`"<tag>:<value>"`, tag one of `string`, `int`, `float`, `json`) so that
//! decrypting hands back the same kind of value that went in.

pub mod typed;
pub mod value;

pub use typed::{parse_typed, CodecError, TypedCodec};
pub use value::{TypeTag, Value};
