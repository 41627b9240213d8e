//! Tracing subscriber setup for the CLI binary.

use tracing_subscriber::EnvFilter;

/// Initialize tracing. `-v` raises the default level; `STRAND_LOG`
/// overrides everything.
pub fn init(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_env("STRAND_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
