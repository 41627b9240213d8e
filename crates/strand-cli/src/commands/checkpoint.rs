//! `strand checkpoint`: create, verify, and keygen.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Subcommand};
use strand_core::Value;
use strand_engine::checkpoint::{
    create_checkpoint, verify_checkpoint, CheckpointStore, SigningKey, VerifyingKey,
};

use super::{open_store, operator_reducer, print_value, CommandError};
use crate::cli::Cli;

#[derive(Subcommand, Debug)]
pub enum CheckpointCmd {
    /// Replay to a sequence and write a signed checkpoint.
    Create(CreateArgs),
    /// Verify a checkpoint file against the log (signature + replay).
    Verify(VerifyArgs),
    /// Generate a signing keypair (`<out>` and `<out>.pub`).
    Keygen(KeygenArgs),
}

#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Sequence the checkpoint covers (inclusive).
    #[arg(long, value_name = "N")]
    pub at_seq: u64,

    /// Signing key file (32 hex-encoded bytes).
    #[arg(long, value_name = "PATH")]
    pub key: PathBuf,

    /// Checkpoint directory.
    #[arg(long, value_name = "DIR")]
    pub checkpoints: PathBuf,

    /// Writer identity recorded in the checkpoint.
    #[arg(long, default_value = "strand-cli")]
    pub created_by: String,
}

#[derive(Args, Debug)]
pub struct VerifyArgs {
    /// Checkpoint file to verify.
    #[arg(long, value_name = "PATH")]
    pub path: PathBuf,

    /// Public key file (32 hex-encoded bytes).
    #[arg(long, value_name = "PATH")]
    pub pubkey: PathBuf,
}

#[derive(Args, Debug)]
pub struct KeygenArgs {
    /// Private key output path.
    #[arg(long, value_name = "PATH")]
    pub out: PathBuf,
}

pub fn run(cli: &Cli, cmd: &CheckpointCmd) -> Result<ExitCode, CommandError> {
    match cmd {
        CheckpointCmd::Create(args) => create(cli, args),
        CheckpointCmd::Verify(args) => verify(cli, args),
        CheckpointCmd::Keygen(args) => keygen(args),
    }
}

fn create(cli: &Cli, args: &CreateArgs) -> Result<ExitCode, CommandError> {
    let (store, _config) = open_store(cli)?;
    let reducer = operator_reducer();
    let key = SigningKey::load(&args.key)?;
    // The checkpoint timestamp is the logical position it covers.
    let checkpoint = create_checkpoint(
        &store,
        &reducer,
        &key,
        args.at_seq,
        &args.created_by,
        args.at_seq,
    )?;
    let cp_store = CheckpointStore::open(&args.checkpoints)?;
    let path = cp_store.save(&checkpoint)?;

    let mut out = BTreeMap::new();
    out.insert("path".to_string(), Value::Str(path.display().to_string()));
    out.insert("at_seq".to_string(), Value::Uint(checkpoint.at_seq));
    out.insert(
        "state_hash".to_string(),
        Value::Str(checkpoint.state_hash.clone()),
    );
    out.insert(
        "checkpoint_id".to_string(),
        Value::Str(checkpoint.checkpoint_id.clone()),
    );
    print_value(cli, &Value::Map(out));
    Ok(ExitCode::SUCCESS)
}

fn verify(cli: &Cli, args: &VerifyArgs) -> Result<ExitCode, CommandError> {
    let (store, _config) = open_store(cli)?;
    let reducer = operator_reducer();
    let pubkey = VerifyingKey::load(&args.pubkey)?;
    let checkpoint = CheckpointStore::open(
        args.path
            .parent()
            .ok_or_else(|| CommandError::Other("checkpoint path has no parent".to_string()))?,
    )?
    .load(&args.path)?;

    match verify_checkpoint(&checkpoint, &pubkey, &store, &reducer) {
        Ok(verified) => {
            println!(
                "ok: checkpoint at seq {} verified (state version {})",
                verified.checkpoint.at_seq,
                verified.state.version()
            );
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => Err(CommandError::VerificationFailed {
            diagnostic: format!("checkpoint at seq {}: {err}", checkpoint.at_seq),
        }),
    }
}

fn keygen(args: &KeygenArgs) -> Result<ExitCode, CommandError> {
    let key = SigningKey::generate();
    key.save(&args.out)?;
    println!(
        "wrote {} and {} (pubkey id {})",
        args.out.display(),
        args.out.with_extension("pub").display(),
        key.pubkey_id()
    );
    Ok(ExitCode::SUCCESS)
}
