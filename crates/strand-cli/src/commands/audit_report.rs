//! `strand audit-report`: the full audit bundle.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, ValueEnum};
use strand_engine::audit::{audit_report, AuditOptions};

use super::{open_store, operator_reducer, CommandError};
use crate::cli::Cli;

#[derive(ValueEnum, Clone, Copy, Debug, Default)]
pub enum ReportFormat {
    #[default]
    Json,
    Md,
}

#[derive(Args, Debug)]
pub struct AuditReportArgs {
    #[arg(long, value_enum, default_value_t = ReportFormat::Json)]
    pub format: ReportFormat,

    /// Print only the overall verdict line.
    #[arg(long, default_value_t = false)]
    pub summary: bool,

    /// Include the decision-proof section.
    #[arg(long, default_value_t = false)]
    pub proof: bool,

    /// Restrict the proof to the decision triggered at this seq.
    #[arg(long, value_name = "N")]
    pub at_seq: Option<u64>,

    /// Checkpoint directory to fold into the proof.
    #[arg(long, value_name = "DIR")]
    pub checkpoints: Option<PathBuf>,

    /// Public key for checkpoint signature verification.
    #[arg(long, value_name = "PATH")]
    pub pubkey: Option<PathBuf>,
}

pub fn run(cli: &Cli, args: &AuditReportArgs) -> Result<ExitCode, CommandError> {
    let (store, _config) = open_store(cli)?;
    let reducer = operator_reducer();
    let report = audit_report(
        &store,
        &reducer,
        &AuditOptions {
            at_seq: args.at_seq,
            include_proof: args.proof,
            checkpoints_dir: args.checkpoints.clone(),
            pubkey_path: args.pubkey.clone(),
        },
    )?;

    if args.summary {
        println!(
            "{}: {} records, {} decisions",
            if report.verified() { "VERIFIED" } else { "FAILED" },
            report.chain.checked,
            report.decisions_count
        );
    } else {
        match args.format {
            ReportFormat::Json => println!("{}", report.to_json()),
            ReportFormat::Md => print!("{}", report.to_markdown()),
        }
    }

    if !report.verified() {
        let diagnostic = report
            .chain
            .error
            .clone()
            .or_else(|| report.pointers.error.clone())
            .or_else(|| {
                report
                    .proof
                    .as_ref()
                    .and_then(|p| p.errors.first().cloned())
            })
            .unwrap_or_else(|| "audit verification failed".to_string());
        return Err(CommandError::VerificationFailed { diagnostic });
    }
    Ok(ExitCode::SUCCESS)
}
