//! Common types, report definitions, and errors shared across `phi-vault` crates.

pub mod error;
pub mod report;

pub use error::FieldError;
