//! Field-level encryption for protected health information.
//!
//! Layers, leaf first:
//!
//! - [`keys`]: master key derivation and per-message keys.
//! - [`crypto`]: the AES-256-GCM envelope (`ENC:v1:...`).
//! - [`codec`]: type-preserving encoding through [`Value`].
//! - [`search`]: keyed equality hashes for searchable columns.
//! - [`storage`]: column codecs and the record mapper used at the persistence
//!   boundary.
//!
//! [`FieldCrypto`] bundles the three services most callers need, all sharing
//! one [`KeyManager`].

use std::sync::Arc;

pub mod codec;
pub mod config;
pub mod crypto;
pub mod keys;
pub mod search;
pub mod storage;

pub use codec::{CodecError, TypeTag, TypedCodec, Value};
pub use config::KeyConfig;
pub use crypto::{is_encrypted, CipherError, FieldCipher, ENVELOPE_PREFIX};
pub use keys::{KeyError, KeyManager};
pub use search::SearchHasher;
pub use storage::{is_sealed, split_searchable, ColumnKind, RecordMapper};

/// The cipher, typed codec, and search hasher over a single key manager.
#[derive(Clone, Debug)]
pub struct FieldCrypto {
    pub cipher: FieldCipher,
    pub codec: TypedCodec,
    pub search: SearchHasher,
}

impl FieldCrypto {
    pub fn new(keys: KeyManager) -> Self {
        let keys = Arc::new(keys);
        let cipher = FieldCipher::new(keys.clone());
        Self {
            codec: TypedCodec::new(cipher.clone()),
            cipher,
            search: SearchHasher::new(keys),
        }
    }

    /// Build from key configuration and run the cipher self-test.
    pub fn from_config(cfg: &KeyConfig) -> Result<Self, common::FieldError> {
        let crypto = Self::new(KeyManager::from_config(cfg)?);
        crypto.cipher.self_test()?;
        Ok(crypto)
    }

    /// An empty record mapper bound to these keys.
    pub fn mapper(&self) -> RecordMapper {
        RecordMapper::new(self.codec.clone(), self.search.clone())
    }
}
