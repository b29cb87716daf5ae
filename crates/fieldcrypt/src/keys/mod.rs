//! Master-key derivation and per-message key derivation.
//!
//! # Lifecycle
//!
//! 1. At startup a [`KeyManager`] is built from [`crate::KeyConfig`]. The
//!    external secret is run through HKDF-SHA256 once to produce the master key.
//! 2. The master key lives only in memory inside the `KeyManager`, which is
//!    shared read-only behind an `Arc`.
//! 3. Every encrypt/decrypt call derives a fresh message key from the master
//!    key and the envelope's random salt.
//!
//! # Security invariants
//!
//! - The master key is **never** written to disk, logged, or included in traces.
//! - A missing secret is a constructor-time error unless the development key
//!   file was explicitly enabled.

pub mod manager;
pub mod master;

pub use manager::KeyManager;
pub use master::{derive_master_key, derive_message_key, KeyError, MasterKey, KEY_LEN, SALT_LEN};
