use std::process::ExitCode;

use clap::Parser;

use strand_cli::cli::Cli;
use strand_cli::commands::{self, CommandError};

fn main() -> ExitCode {
    let cli = Cli::parse();
    strand_cli::telemetry::init(cli.verbose);

    match commands::dispatch(&cli) {
        Ok(code) => code,
        Err(CommandError::VerificationFailed { diagnostic }) => {
            eprintln!("verification failed: {diagnostic}");
            ExitCode::from(2)
        }
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}
