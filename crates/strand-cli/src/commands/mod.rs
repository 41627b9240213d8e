//! Command implementations and the shared error surface.

pub mod audit_report;
pub mod checkpoint;
pub mod inspect;
pub mod log;
pub mod verify_pointers;

use std::path::PathBuf;
use std::process::ExitCode;

use thiserror::Error;

use crate::cli::{Cli, Command};
use crate::config::Config;
use strand_core::Reducer;
use strand_store::FileStore;

#[derive(Debug, Error)]
pub enum CommandError {
    /// Any chain, pointer, proof, or signature failure. Exit code 2.
    #[error("{diagnostic}")]
    VerificationFailed { diagnostic: String },
    #[error("--log <DIR> is required for this command")]
    MissingLog,
    #[error(transparent)]
    Store(#[from] strand_store::StoreError),
    #[error(transparent)]
    Checkpoint(#[from] strand_engine::CheckpointError),
    #[error("{0}")]
    Other(String),
}

pub fn dispatch(cli: &Cli) -> Result<ExitCode, CommandError> {
    match &cli.command {
        Command::Inspect(args) => inspect::run(cli, args),
        Command::AuditReport(args) => audit_report::run(cli, args),
        Command::VerifyPointers => verify_pointers::run(cli),
        Command::Checkpoint { cmd } => checkpoint::run(cli, cmd),
        Command::Log { cmd } => log::run(cli, cmd),
    }
}

pub(crate) fn open_store(cli: &Cli) -> Result<(FileStore, Config), CommandError> {
    let log_dir: &PathBuf = cli.log.as_ref().ok_or(CommandError::MissingLog)?;
    let config = Config::load_or_default(cli.config.as_deref(), Some(log_dir));
    let store = FileStore::open(log_dir, config.file_store_config())?;
    Ok((store, config))
}

pub(crate) fn operator_reducer() -> Reducer {
    let mut reducer = Reducer::new();
    strand_engine::register_handlers(&mut reducer);
    reducer
}

/// Canonical single line under `--json`, pretty JSON otherwise.
pub(crate) fn print_value(cli: &Cli, value: &strand_core::Value) {
    if cli.json {
        println!("{}", strand_core::to_canonical_string(value));
    } else {
        match serde_json::to_string_pretty(&value.to_json()) {
            Ok(pretty) => println!("{pretty}"),
            Err(_) => println!("{}", strand_core::to_canonical_string(value)),
        }
    }
}
