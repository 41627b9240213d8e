//! `strand` binary internals: argument surface, config file, commands.

pub mod cli;
pub mod commands;
pub mod config;
pub mod telemetry;
