use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};

use crate::commands;

#[derive(Parser, Debug)]
#[command(
    name = "strand",
    version,
    about = "Deterministic event-log inspection and audit",
    arg_required_else_help = true
)]
pub struct Cli {
    /// Event log directory (JSONL segment store).
    #[arg(long, global = true, value_name = "DIR")]
    pub log: Option<PathBuf>,

    /// Config file (default: strand.toml next to the log, if present).
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Machine-readable JSON output.
    #[arg(long, global = true, default_value_t = false)]
    pub json: bool,

    /// Debug output (repeat for more).
    #[arg(short = 'v', long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Replay the log and dump state (or one aggregate's view).
    Inspect(commands::inspect::InspectArgs),

    /// Produce the audit bundle: chain, pointers, decisions, drift.
    AuditReport(commands::audit_report::AuditReportArgs),

    /// Verify every ActionsDecided trigger pointer against the chain.
    VerifyPointers,

    /// Checkpoint operations.
    Checkpoint {
        #[command(subcommand)]
        cmd: commands::checkpoint::CheckpointCmd,
    },

    /// Raw log operations.
    Log {
        #[command(subcommand)]
        cmd: commands::log::LogCmd,
    },
}
