//! Human-readable and JSON rendering of a [`RunReport`].

use std::fmt::Write;

use common::report::{BatchOutcome, RunReport, ERROR_EXCERPT_LIMIT};

use crate::engine::RunPlan;

const RULE: &str = "----------------------------------------";
const BANNER_RULE: &str = "============================================================";

pub fn banner() -> String {
    format!(
        "{BANNER_RULE}\nHIPAA-Compliant Database Encryption Tool\n\
         AES-256-GCM with Per-Record Salt and Nonce\n{BANNER_RULE}\n"
    )
}

pub fn render_json(report: &RunReport) -> serde_json::Result<String> {
    serde_json::to_string_pretty(report)
}

// `write!` into a String cannot fail; results are discarded below.
pub fn render_text(plan: &RunPlan, report: &RunReport) -> String {
    let mut out = String::new();

    if plan.analyze {
        let _ = writeln!(out, "Analyzing encryption status...\n{RULE}");
        for a in &report.analysis {
            let _ = writeln!(out, "{} {}: {}", a.status.icon(), a.table, a.status.as_str());
            if let Some(total) = a.total_records {
                let _ = writeln!(out, "    Records: {total}");
                let _ = writeln!(out, "    Fields to encrypt: {}", a.fields_to_encrypt);
                let _ = writeln!(
                    out,
                    "    Sampled fields: {} encrypted, {} plaintext",
                    a.encrypted_fields_found, a.unencrypted_fields_found
                );
                if a.absent_fields_found > 0 {
                    let _ = writeln!(out, "    Fields not in table: {}", a.absent_fields_found);
                }
            }
            if let Some(message) = &a.message {
                let _ = writeln!(out, "    Message: {message}");
            }
        }
        out.push('\n');
    }

    if let Some(opts) = &plan.encrypt {
        if opts.dry_run {
            out.push_str("DRY RUN - No changes will be made\n");
        }
        let _ = writeln!(out, "Encrypting tables...\n{RULE}");
        for t in &report.encryption {
            if t.outcome == BatchOutcome::Skipped {
                let _ = writeln!(out, "Skipped {} (cancelled)", t.table);
                continue;
            }
            let _ = writeln!(out, "Processing {}...", t.table);
            let _ = writeln!(out, "    Records: {}", t.records_processed);
            let _ = writeln!(out, "    Fields encrypted: {}", t.fields_encrypted);
            let _ = writeln!(out, "    Search hashes updated: {}", t.hashes_updated);
            let _ = writeln!(out, "    Rows updated: {}", t.rows_updated);
            if t.outcome == BatchOutcome::RolledBack {
                out.push_str("    ✗ Rolled back; no changes kept for this table\n");
            }
            write_errors(&mut out, &t.errors, "      ");
        }
        out.push('\n');
        out.push_str(if opts.dry_run {
            "Dry run complete!\n"
        } else {
            "Encryption complete!\n"
        });
        out.push('\n');
    }

    if plan.verify {
        let _ = writeln!(out, "Verifying encryption...\n{RULE}");
        for v in &report.verification {
            let icon = if v.verified { "✓" } else { "✗" };
            let _ = writeln!(out, "{icon} {}", v.table);
            if !v.verified {
                write_errors(&mut out, &v.errors, "    ");
            }
        }
        out.push('\n');
        if report.verification.iter().all(|v| v.verified) {
            out.push_str("✓ All encryption verified successfully!\n");
        } else {
            out.push_str("✗ Some verification errors found - check above\n");
        }
    }

    if report.cancelled {
        out.push_str("\nRun cancelled; remaining tables were not processed.\n");
    }
    out
}

fn write_errors(out: &mut String, errors: &[String], indent: &str) {
    if errors.is_empty() {
        return;
    }
    let _ = writeln!(out, "{indent}Errors: {}", errors.len());
    for e in errors.iter().take(ERROR_EXCERPT_LIMIT) {
        let _ = writeln!(out, "{indent}  - {e}");
    }
}
