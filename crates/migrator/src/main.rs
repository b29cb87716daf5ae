//! `encrypt-db`: bulk migration tool for PHI columns.
//!
//! Startup sequence:
//! 1. Parse arguments; print help when no mode is selected.
//! 2. Load and validate [`config::Config`] and the key configuration.
//! 3. Initialise structured JSON logging (stderr).
//! 4. Build the key manager and self-test the cipher.
//! 5. Load the table schema and open the database.
//! 6. Confirm, then run analyze → encrypt → verify on a blocking thread.
//!
//! Exit codes: 0 success, 1 table errors or verification failures, 2
//! configuration error, 3 aborted or cancelled.

mod cli;
mod config;
mod engine;
mod report;
mod schema;
mod store;
mod telemetry;

use std::io::{BufRead, Write};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use common::FieldError;
use fieldcrypt::{FieldCrypto, KeyConfig};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cli::{Args, OutputFormat};
use crate::engine::{EncryptOptions, EngineSettings, MigrationEngine, RunPlan, CONFIRMATION_TOKEN};
use crate::schema::EncryptionSchema;
use crate::store::SqliteStore;

const EXIT_FAILURES: u8 = 1;
const EXIT_CONFIGURATION: u8 = 2;
const EXIT_ABORTED: u8 = 3;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    if !args.has_mode() {
        let _ = Args::command().print_help();
        return ExitCode::SUCCESS;
    }
    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{e:#}"), "migration failed");
            eprintln!("ERROR: {e:#}");
            ExitCode::from(EXIT_FAILURES)
        }
    }
}

async fn run(args: Args) -> Result<ExitCode> {
    let text = args.format == OutputFormat::Text;

    // -----------------------------------------------------------------------
    // 1. Configuration
    // -----------------------------------------------------------------------
    let cfg = match config::Config::from_env()
        .and_then(|c| c.with_overrides(args.database.clone(), args.schema.clone()))
    {
        Ok(c) => c,
        Err(e) => return Ok(configuration_error(&e)),
    };
    let key_cfg = match KeyConfig::from_env() {
        Ok(c) => c,
        Err(e) => return Ok(configuration_error(&e)),
    };

    // -----------------------------------------------------------------------
    // 2. Telemetry
    // -----------------------------------------------------------------------
    telemetry::init(&cfg.log_level)?;
    info!(database = %cfg.database_url, "encrypt-db starting");

    // -----------------------------------------------------------------------
    // 3. Keys and self-test
    // -----------------------------------------------------------------------
    if text {
        println!("{}", report::banner());
        println!("Testing encryption system...");
    }
    let crypto = match FieldCrypto::from_config(&key_cfg) {
        Ok(c) => c,
        Err(e) => {
            if text {
                println!("✗ Encryption test FAILED: {e}");
            }
            return Ok(fatal(&e));
        }
    };
    if text {
        println!("✓ Encryption system working correctly\n");
    }

    // -----------------------------------------------------------------------
    // 4. Schema and store
    // -----------------------------------------------------------------------
    let schema = match EncryptionSchema::load(cfg.encryption_schema_path.as_deref())
        .and_then(|s| s.select(args.table.as_deref()))
    {
        Ok(s) => s,
        Err(e) => return Ok(fatal(&FieldError::from(e))),
    };
    let store = match SqliteStore::open(&cfg.database_url) {
        Ok(s) => s,
        Err(e @ store::StoreError::UnsupportedUrl(_)) => {
            return Ok(fatal(&FieldError::Configuration(e.to_string())))
        }
        Err(e) => return Err(e).context("failed to open database"),
    };

    // -----------------------------------------------------------------------
    // 5. Confirmation
    // -----------------------------------------------------------------------
    let plan = RunPlan {
        analyze: args.analyze,
        encrypt: args.encrypt.then(|| EncryptOptions {
            dry_run: args.dry_run,
            confirmation: args.confirm.clone(),
        }),
        verify: args.verify,
    };
    let plan = if args.needs_prompt() {
        let token = tokio::task::spawn_blocking(prompt_for_confirmation)
            .await
            .context("confirmation prompt panicked")??;
        RunPlan {
            encrypt: plan.encrypt.map(|o| EncryptOptions {
                confirmation: Some(token),
                ..o
            }),
            ..plan
        }
    } else {
        plan
    };
    if let Some(Err(e)) = plan.encrypt.as_ref().map(EncryptOptions::authorize) {
        warn!(error = %e, "encryption not confirmed");
        eprintln!("Aborted.");
        return Ok(ExitCode::from(e.exit_code()));
    }

    // -----------------------------------------------------------------------
    // 6. Migration
    // -----------------------------------------------------------------------
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping after the current table");
            on_signal.cancel();
        }
    });

    let mut engine = MigrationEngine::new(store, schema, crypto, EngineSettings::from(&cfg))
        .with_cancellation(cancel);
    let run_plan = plan.clone();
    let outcome = tokio::task::spawn_blocking(move || engine.run(&run_plan))
        .await
        .context("migration task panicked")?;
    let run_report = match outcome {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Aborted.");
            return Ok(ExitCode::from(e.exit_code()));
        }
    };

    match args.format {
        OutputFormat::Text => print!("{}", report::render_text(&plan, &run_report)),
        OutputFormat::Json => println!("{}", report::render_json(&run_report)?),
    }

    let code = if run_report.cancelled {
        EXIT_ABORTED
    } else if run_report.has_failures() {
        EXIT_FAILURES
    } else {
        0
    };
    info!(exit_code = code, "encrypt-db finished");
    Ok(ExitCode::from(code))
}

/// Ask the operator to type the confirmation token on the terminal.
fn prompt_for_confirmation() -> Result<String> {
    let mut stderr = std::io::stderr().lock();
    writeln!(stderr, "⚠️  WARNING: This will encrypt data in place!")?;
    writeln!(stderr, "Make sure you have a backup before proceeding.")?;
    write!(stderr, "Type '{CONFIRMATION_TOKEN}' to continue: ")?;
    stderr.flush()?;

    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("failed to read confirmation")?;
    Ok(line.trim_end_matches(['\r', '\n']).to_owned())
}

fn configuration_error(e: &anyhow::Error) -> ExitCode {
    eprintln!("ERROR: encrypt-db configuration invalid: {e:#}");
    ExitCode::from(EXIT_CONFIGURATION)
}

fn fatal(e: &FieldError) -> ExitCode {
    error!(kind = e.kind(), error = %e, "fatal error");
    eprintln!("ERROR: {e}");
    ExitCode::from(e.exit_code())
}
