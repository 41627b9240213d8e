//! `strand log`: raw log operations.

use std::collections::BTreeMap;
use std::process::ExitCode;

use clap::{Args, Subcommand};
use strand_core::Value;
use strand_engine::verify::verify_chain;
use strand_store::EventStore;

use super::{open_store, print_value, CommandError};
use crate::cli::Cli;

#[derive(Subcommand, Debug)]
pub enum LogCmd {
    /// Verify the whole hash chain.
    Verify,
    /// Show the current tail (last seq and hash).
    Head,
    /// Append a test event (type, aggregate, payload JSON).
    Append(AppendArgs),
}

#[derive(Args, Debug)]
pub struct AppendArgs {
    #[arg(long, value_name = "TYPE")]
    pub event_type: String,

    #[arg(long, value_name = "ID")]
    pub aggregate: String,

    /// Payload as a JSON object (no floats).
    #[arg(long, default_value = "{}")]
    pub payload: String,
}

pub fn run(cli: &Cli, cmd: &LogCmd) -> Result<ExitCode, CommandError> {
    match cmd {
        LogCmd::Verify => verify(cli),
        LogCmd::Head => head(cli),
        LogCmd::Append(args) => append(cli, args),
    }
}

fn verify(cli: &Cli) -> Result<ExitCode, CommandError> {
    let (store, _config) = open_store(cli)?;
    let report = verify_chain(&store)?;
    if !report.valid {
        return Err(CommandError::VerificationFailed {
            diagnostic: format!(
                "chain broken at seq {}: {}",
                report
                    .failed_seq
                    .map_or("?".to_string(), |s| s.to_string()),
                report.error.unwrap_or_default()
            ),
        });
    }
    println!("ok: {} records verified", report.checked);
    Ok(ExitCode::SUCCESS)
}

fn head(cli: &Cli) -> Result<ExitCode, CommandError> {
    let (store, _config) = open_store(cli)?;
    let head = store.tail()?;
    let mut out = BTreeMap::new();
    match head.last_seq {
        Some(seq) => {
            out.insert("last_seq".to_string(), Value::Uint(seq));
        }
        None => {
            out.insert("last_seq".to_string(), Value::Null);
        }
    }
    out.insert("last_hash".to_string(), Value::Str(head.last_hash));
    print_value(cli, &Value::Map(out));
    Ok(ExitCode::SUCCESS)
}

fn append(cli: &Cli, args: &AppendArgs) -> Result<ExitCode, CommandError> {
    let (mut store, config) = open_store(cli)?;
    let payload = Value::from_json_str(&args.payload)
        .map_err(|e| CommandError::Other(format!("invalid payload: {e}")))?;

    let head = store.tail()?;
    let ts = head.last_seq.map_or(0, |seq| seq + 1);
    let event = strand_core::Event::new(args.event_type.as_str(), args.aggregate.as_str(), ts)
        .with_payload(payload);

    let retry = strand_store::RetryPolicy {
        max_attempts: config.retry.max_attempts,
        base_backoff: std::time::Duration::from_millis(config.retry.base_backoff_ms),
        jitter_cap: std::time::Duration::from_millis(config.retry.jitter_cap_ms),
        deadline: None,
    };
    let record = store.append_with_retry(event, &retry)?;

    let mut out = BTreeMap::new();
    out.insert(
        "seq".to_string(),
        Value::Uint(record.event.seq.unwrap_or(0)),
    );
    out.insert(
        "event_hash".to_string(),
        Value::Str(record.event_hash.clone()),
    );
    out.insert(
        "prev_hash".to_string(),
        Value::Str(record.prev_hash.clone()),
    );
    print_value(cli, &Value::Map(out));
    Ok(ExitCode::SUCCESS)
}
