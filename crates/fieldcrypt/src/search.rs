//! Deterministic search hashes for equality lookups on encrypted columns.
//!
//! **Weaker than the envelope.** Equal inputs always hash equal, which is
//! what makes `WHERE username_hash = ?` work and also what leaks equality and
//! frequency. Only fields named in a reviewed schema (`searchable_fields`, or a
//! [`crate::storage::SearchableString`] column) get a hash; nothing in this
//! crate hashes a value on its own initiative.

use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::keys::KeyManager;

/// Length of a hex-encoded SHA-256 search hash.
pub const SEARCH_HASH_LEN: usize = 64;

/// Keyed SHA-256 over `master_key || value || field_salt`.
#[derive(Clone, Debug)]
pub struct SearchHasher {
    keys: Arc<KeyManager>,
}

impl SearchHasher {
    pub fn new(keys: Arc<KeyManager>) -> Self {
        Self { keys }
    }

    /// Hex SHA-256 of the master key, the value, and the optional field salt.
    ///
    /// The empty value hashes to the empty string so that two different empty
    /// fields never match each other.
    pub fn hash_for_search(&self, value: &str, field_salt: &str) -> String {
        if value.is_empty() {
            return String::new();
        }
        let mut hasher = Sha256::new();
        hasher.update(self.keys.master_key().as_bytes());
        hasher.update(value.as_bytes());
        hasher.update(field_salt.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// `true` if `s` has the shape of a search hash (64 lowercase hex digits).
pub fn is_search_hash(s: &str) -> bool {
    s.len() == SEARCH_HASH_LEN && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
