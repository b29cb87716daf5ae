//! AES-256-GCM field encryption primitives.
//!
//! This module is intentionally free of storage and schema dependencies.
//! It provides the low-level encrypt/decrypt operations used by the codec layer.
//!
//! # Envelope format
//!
//! ```text
//! ENC:v1:<base64-standard(salt[16] || nonce[12] || ciphertext || tag[16])>
//! ```
//!
//! Lengths are fixed by position; there are no embedded length fields. The
//! `ENC:v1:` prefix enables future algorithm or key-version migration without
//! breaking existing ciphertext.

pub mod cipher;

pub use cipher::{is_encrypted, CipherError, Envelope, FieldCipher, ENVELOPE_PREFIX};
