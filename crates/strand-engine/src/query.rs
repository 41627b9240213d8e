//! Deterministic queries over replayed state.

use std::collections::BTreeSet;

use strand_core::{State, Value};

use crate::handlers::{NS_AGENTS, NS_APPLIED, NS_DESIRED, NS_FAILURES};

/// Sorted agent aggregate ids.
pub fn list_agents(state: &State) -> Vec<String> {
    state
        .namespace(NS_AGENTS)
        .map(|agents| agents.keys().cloned().collect())
        .unwrap_or_default()
}

/// Resolve a reference that is either a full aggregate id or a bare agent
/// name.
pub fn resolve_agent_id(state: &State, agent_ref: &str) -> Option<String> {
    let agents = state.namespace(NS_AGENTS)?;
    if agents.contains_key(agent_ref) {
        return Some(agent_ref.to_string());
    }
    agents
        .iter()
        .find(|(_, model)| model.get("name").and_then(Value::as_str) == Some(agent_ref))
        .map(|(id, _)| id.clone())
}

pub fn agent_view(state: &State, agent_id: &str) -> Option<Value> {
    state.get_aggregate(NS_AGENTS, agent_id).cloned()
}

/// Desired-versus-applied comparison for one agent.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Drift {
    pub desired_action_ids: Vec<String>,
    pub applied_action_ids: Vec<String>,
    pub missing_action_ids: Vec<String>,
    pub extra_action_ids: Vec<String>,
    pub actions_hash: Option<String>,
    pub trigger_seq: Option<u64>,
}

pub fn drift(state: &State, agent_id: &str) -> Drift {
    let desired_entry = state.get_aggregate(NS_DESIRED, agent_id);
    let desired: BTreeSet<String> = desired_entry
        .and_then(|entry| entry.get("actions"))
        .and_then(Value::as_map)
        .map(|actions| actions.keys().cloned().collect())
        .unwrap_or_default();
    let applied: BTreeSet<String> = state
        .namespace(NS_APPLIED)
        .map(|applied| applied.keys().cloned().collect())
        .unwrap_or_default();

    Drift {
        desired_action_ids: desired.iter().cloned().collect(),
        applied_action_ids: desired.intersection(&applied).cloned().collect(),
        missing_action_ids: desired.difference(&applied).cloned().collect(),
        extra_action_ids: applied.difference(&desired).cloned().collect(),
        actions_hash: desired_entry
            .and_then(|entry| entry.get("actions_hash"))
            .and_then(Value::as_str)
            .map(String::from),
        trigger_seq: desired_entry
            .and_then(|entry| entry.get("trigger_seq"))
            .and_then(Value::as_u64),
    }
}

/// Last `last_n` failure entries attributed to the agent's desired
/// actions.
pub fn failures(state: &State, agent_id: &str, last_n: usize) -> Vec<Value> {
    let desired: BTreeSet<String> = state
        .get_aggregate(NS_DESIRED, agent_id)
        .and_then(|entry| entry.get("actions"))
        .and_then(Value::as_map)
        .map(|actions| actions.keys().cloned().collect())
        .unwrap_or_default();

    let mut out = Vec::new();
    if let Some(failure_map) = state.namespace(NS_FAILURES) {
        for (action_id, history) in failure_map {
            if !desired.contains(action_id) {
                continue;
            }
            if let Some(entries) = history.as_array() {
                out.extend(entries.iter().cloned());
            }
        }
    }
    let keep = out.len().saturating_sub(last_n);
    out.split_off(keep)
}
