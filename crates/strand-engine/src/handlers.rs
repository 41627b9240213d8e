//! Reducer handler set for the operator's event types.
//!
//! All handlers are pure folds over the namespaced aggregate map:
//! `agents` holds the last observed model per agent, `desired` the action
//! set decided for it, `applied` and `failures` the executor feedback
//! keyed by action id.

use std::collections::BTreeMap;

use strand_core::{Event, Reducer, ReducerError, State, Value};

pub const NS_AGENTS: &str = "agents";
pub const NS_OBSERVED: &str = "observed";
pub const NS_DESIRED: &str = "desired";
pub const NS_APPLIED: &str = "applied";
pub const NS_FAILURES: &str = "failures";

/// Cap on the per-action failure history an aggregate retains.
const MAX_FAILURES_PER_ACTION: usize = 50;

pub fn register_handlers(reducer: &mut Reducer) {
    reducer.register("AgentObserved", on_agent_observed);
    reducer.register("ActionsDecided", on_actions_decided);
    reducer.register("ActionApplied", on_action_applied);
    reducer.register("ActionFailed", on_action_failed);
}

fn payload_str(event: &Event, field: &str) -> Option<String> {
    event.payload.get(field).and_then(Value::as_str).map(String::from)
}

fn on_agent_observed(state: &State, event: &Event) -> Result<State, ReducerError> {
    let payload = &event.payload;
    let mut model = BTreeMap::new();
    for field in ["name", "namespace", "spec_hash"] {
        if let Some(value) = payload.get(field) {
            model.insert(field.to_string(), value.clone());
        }
    }
    model.insert(
        "labels".to_string(),
        payload.get("labels").cloned().unwrap_or_else(Value::map),
    );
    model.insert(
        "spec".to_string(),
        payload.get("spec").cloned().unwrap_or_else(Value::map),
    );

    let mut observed = BTreeMap::new();
    if let Some(spec_hash) = payload.get("spec_hash") {
        observed.insert("last_seen_spec_hash".to_string(), spec_hash.clone());
    }
    if let Some(seq) = event.seq {
        observed.insert("observed_seq".to_string(), Value::Uint(seq));
    }

    Ok(state
        .set_aggregate(NS_AGENTS, &event.aggregate_id, Value::Map(model))
        .set_aggregate(NS_OBSERVED, &event.aggregate_id, Value::Map(observed)))
}

fn on_actions_decided(state: &State, event: &Event) -> Result<State, ReducerError> {
    let payload = &event.payload;
    let agent_id = payload_str(event, "agent_id").unwrap_or_else(|| event.aggregate_id.clone());

    let mut action_map = BTreeMap::new();
    if let Some(actions) = payload.get("actions").and_then(Value::as_array) {
        for action in actions {
            let Some(id) = action.get("action_id").and_then(Value::as_str) else {
                continue;
            };
            let mut entry = BTreeMap::new();
            for field in ["action_type", "target"] {
                if let Some(value) = action.get(field) {
                    entry.insert(field.to_string(), value.clone());
                }
            }
            action_map.insert(id.to_string(), Value::Map(entry));
        }
    }

    let mut desired = BTreeMap::new();
    desired.insert("actions".to_string(), Value::Map(action_map));
    for field in [
        "actions_hash",
        "trigger_seq",
        "trigger_hash",
        "trigger_type",
        "trigger_spec_hash",
    ] {
        if let Some(value) = payload.get(field) {
            desired.insert(field.to_string(), value.clone());
        }
    }

    Ok(state.set_aggregate(NS_DESIRED, &agent_id, Value::Map(desired)))
}

fn on_action_applied(state: &State, event: &Event) -> Result<State, ReducerError> {
    let Some(action_id) = payload_str(event, "action_id") else {
        // Feedback without an id cannot be attributed; keep state as-is.
        return Ok(state.clone());
    };
    let mut entry = BTreeMap::new();
    for field in ["action_type", "target", "result_code"] {
        if let Some(value) = event.payload.get(field) {
            entry.insert(field.to_string(), value.clone());
        }
    }
    if let Some(seq) = event.seq {
        entry.insert("applied_seq".to_string(), Value::Uint(seq));
    }
    Ok(state.set_aggregate(NS_APPLIED, &action_id, Value::Map(entry)))
}

fn on_action_failed(state: &State, event: &Event) -> Result<State, ReducerError> {
    let Some(action_id) = payload_str(event, "action_id") else {
        return Ok(state.clone());
    };
    let mut entry = BTreeMap::new();
    if let Some(result_code) = event.payload.get("result_code") {
        entry.insert("result_code".to_string(), result_code.clone());
    }
    if let Some(error) = event.payload.get("error").and_then(Value::as_map) {
        for field in ["code", "type"] {
            if let Some(value) = error.get(field) {
                entry.insert(format!("error_{field}"), value.clone());
            }
        }
    }
    if let Some(seq) = event.seq {
        entry.insert("failed_seq".to_string(), Value::Uint(seq));
    }

    let mut history: Vec<Value> = state
        .get_aggregate(NS_FAILURES, &action_id)
        .and_then(Value::as_array)
        .map(<[Value]>::to_vec)
        .unwrap_or_default();
    history.push(Value::Map(entry));
    if history.len() > MAX_FAILURES_PER_ACTION {
        history.remove(0);
    }

    Ok(state.set_aggregate(NS_FAILURES, &action_id, Value::Array(history)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::WorkloadAdapter;
    use strand_core::LogicalClock;

    fn reducer() -> Reducer {
        let mut r = Reducer::new();
        register_handlers(&mut r);
        r
    }

    fn observed_event() -> Event {
        let mut adapter = WorkloadAdapter::new(LogicalClock::default());
        adapter
            .observe_workload("alpha", "universe", &serde_json::json!({}), None)
            .unwrap()
            .with_seq(0)
    }

    #[test]
    fn agent_observed_populates_agents_and_observed() {
        let r = reducer();
        let event = observed_event();
        let state = r.apply(&State::new(), &event).unwrap();

        let agent = state
            .get_aggregate(NS_AGENTS, &event.aggregate_id)
            .expect("agent aggregate");
        assert_eq!(agent.get("name").and_then(Value::as_str), Some("alpha"));
        let observed = state
            .get_aggregate(NS_OBSERVED, &event.aggregate_id)
            .expect("observed aggregate");
        assert!(observed.get("last_seen_spec_hash").is_some());
        assert_eq!(state.version(), 1);
    }

    #[test]
    fn action_failed_appends_bounded_history() {
        let r = reducer();
        let mut state = State::new();
        for seq in 0..60u64 {
            let event = Event::new("ActionFailed", "universe/alpha-spec", seq)
                .with_seq(seq)
                .with_payload(
                    Value::from_json_str(
                        r#"{"action_id":"aid-1","result_code":"CONFLICT","error":{"code":"409","type":"ApiError"}}"#,
                    )
                    .unwrap(),
                );
            state = r.apply(&state, &event).unwrap();
        }
        let history = state
            .get_aggregate(NS_FAILURES, "aid-1")
            .and_then(Value::as_array)
            .unwrap();
        assert_eq!(history.len(), MAX_FAILURES_PER_ACTION);
        assert_eq!(state.version(), 60);
    }

    #[test]
    fn feedback_without_action_id_is_ignored() {
        let r = reducer();
        let event = Event::new("ActionApplied", "t", 0).with_seq(0);
        let state = r.apply(&State::new(), &event).unwrap();
        assert!(state.namespace(NS_APPLIED).is_none());
        assert_eq!(state.version(), 1);
    }
}
