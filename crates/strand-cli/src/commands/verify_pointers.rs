//! `strand verify-pointers`: chain + trigger-pointer verification.

use std::process::ExitCode;

use strand_engine::verify::{verify_chain, verify_pointers};

use super::{open_store, CommandError};
use crate::cli::Cli;

pub fn run(cli: &Cli) -> Result<ExitCode, CommandError> {
    let (store, _config) = open_store(cli)?;

    let chain = verify_chain(&store)?;
    if !chain.valid {
        return Err(CommandError::VerificationFailed {
            diagnostic: format!(
                "chain broken at seq {}: {}",
                chain
                    .failed_seq
                    .map_or("?".to_string(), |s| s.to_string()),
                chain.error.unwrap_or_default()
            ),
        });
    }

    let report = verify_pointers(&store)?;
    if !report.valid {
        return Err(CommandError::VerificationFailed {
            diagnostic: format!(
                "pointer invalid at seq {}: {}",
                report
                    .failed_seq
                    .map_or("?".to_string(), |s| s.to_string()),
                report.error.unwrap_or_default()
            ),
        });
    }

    println!(
        "ok: {} records, {} decision pointers verified",
        chain.checked, report.checked
    );
    Ok(ExitCode::SUCCESS)
}
