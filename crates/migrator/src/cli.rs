use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// HIPAA-compliant database encryption migration tool.
///
/// Back up the database first: encryption replaces plaintext in place.
#[derive(Debug, Parser)]
#[command(name = "encrypt-db", version, about)]
pub struct Args {
    /// Report the encryption status of every configured table.
    #[arg(long)]
    pub analyze: bool,

    /// Encrypt every configured PHI field that is still plaintext.
    #[arg(long)]
    pub encrypt: bool,

    /// Decrypt a sample of every table to check integrity.
    #[arg(long)]
    pub verify: bool,

    /// Show what --encrypt would change without writing anything.
    #[arg(long)]
    pub dry_run: bool,

    /// Process only this table.
    #[arg(long, value_name = "NAME")]
    pub table: Option<String>,

    /// Confirmation token for --encrypt; skips the interactive prompt.
    #[arg(long, value_name = "TOKEN")]
    pub confirm: Option<String>,

    /// Database URL, overriding DATABASE_URL.
    #[arg(long, value_name = "URL")]
    pub database: Option<String>,

    /// Table schema file, overriding ENCRYPTION_SCHEMA_PATH.
    #[arg(long, value_name = "PATH")]
    pub schema: Option<PathBuf>,

    /// Report format.
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

impl Args {
    pub fn has_mode(&self) -> bool {
        self.analyze || self.encrypt || self.verify
    }

    /// `true` when encryption will write and no token was supplied.
    pub fn needs_prompt(&self) -> bool {
        self.encrypt && !self.dry_run && self.confirm.is_none()
    }
}
