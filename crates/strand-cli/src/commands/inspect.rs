//! `strand inspect`: replayed state dump, whole or per aggregate.

use std::collections::BTreeMap;
use std::process::ExitCode;

use clap::Args;
use strand_core::Value;
use strand_engine::query;
use strand_engine::replay::replay;

use super::{open_store, operator_reducer, print_value, CommandError};
use crate::cli::Cli;

#[derive(Args, Debug)]
pub struct InspectArgs {
    /// Aggregate to show: full id or bare agent name.
    #[arg(long)]
    pub aggregate: Option<String>,

    /// Replay only up to this sequence (inclusive).
    #[arg(long, value_name = "N")]
    pub at_seq: Option<u64>,
}

pub fn run(cli: &Cli, args: &InspectArgs) -> Result<ExitCode, CommandError> {
    let (store, _config) = open_store(cli)?;
    let reducer = operator_reducer();
    let outcome = replay(&store, &reducer, args.at_seq)
        .map_err(|e| CommandError::Other(e.to_string()))?;
    let state = &outcome.state;

    let output = match &args.aggregate {
        None => {
            let mut top = BTreeMap::new();
            top.insert(
                "agents".to_string(),
                Value::Array(
                    query::list_agents(state)
                        .into_iter()
                        .map(Value::Str)
                        .collect(),
                ),
            );
            top.insert("applied_events".to_string(), Value::Uint(outcome.applied));
            top.insert("state_hash".to_string(), Value::Str(state.state_hash()));
            top.insert("version".to_string(), Value::Uint(state.version()));
            Value::Map(top)
        }
        Some(agent_ref) => {
            let Some(agent_id) = query::resolve_agent_id(state, agent_ref) else {
                return Err(CommandError::Other(format!("agent not found: {agent_ref}")));
            };
            let drift = query::drift(state, &agent_id);
            let mut top = BTreeMap::new();
            top.insert("agent_id".to_string(), Value::Str(agent_id.clone()));
            if let Some(agent) = query::agent_view(state, &agent_id) {
                top.insert("agent".to_string(), agent);
            }
            let mut drift_map = BTreeMap::new();
            drift_map.insert(
                "missing_action_ids".to_string(),
                Value::Array(drift.missing_action_ids.into_iter().map(Value::Str).collect()),
            );
            drift_map.insert(
                "extra_action_ids".to_string(),
                Value::Array(drift.extra_action_ids.into_iter().map(Value::Str).collect()),
            );
            top.insert("drift".to_string(), Value::Map(drift_map));
            top.insert(
                "failures".to_string(),
                Value::Array(query::failures(state, &agent_id, 20)),
            );
            top.insert("applied_events".to_string(), Value::Uint(outcome.applied));
            Value::Map(top)
        }
    };

    print_value(cli, &output);
    Ok(ExitCode::SUCCESS)
}
