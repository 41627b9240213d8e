//! Decision layer: pure policy from `(state, trigger)` to an ordered,
//! deduplicated action set with trigger provenance.
//!
//! No I/O, no environment, no randomness, no wall clock. The output
//! ordering is by `action_id` ascending; the id is a hash of the canonical
//! action content, so ties cannot occur.

use std::collections::BTreeMap;

use strand_core::{
    sha256_hex, to_canonical_bytes, to_canonical_string, ChainRecord, Event, State, Value,
};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecisionError {
    #[error("trigger payload is missing `{field}`")]
    MissingField { field: &'static str },
    #[error("trigger record has no assigned seq")]
    SeqUnassigned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ActionType {
    EnsureConfigMap,
    EnsurePvc,
    EnsureDeployment,
    EnsureNetworkPolicy,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::EnsureConfigMap => "EnsureConfigMap",
            ActionType::EnsurePvc => "EnsurePvc",
            ActionType::EnsureDeployment => "EnsureDeployment",
            ActionType::EnsureNetworkPolicy => "EnsureNetworkPolicy",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "EnsureConfigMap" => Some(ActionType::EnsureConfigMap),
            "EnsurePvc" => Some(ActionType::EnsurePvc),
            "EnsureDeployment" => Some(ActionType::EnsureDeployment),
            "EnsureNetworkPolicy" => Some(ActionType::EnsureNetworkPolicy),
            _ => None,
        }
    }
}

/// One intended side effect: what to ensure, on which external object,
/// with which canonical parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    pub action_type: ActionType,
    pub target: String,
    pub params: Value,
}

impl Action {
    pub fn to_value(&self) -> Value {
        let mut m = BTreeMap::new();
        m.insert(
            "action_id".to_string(),
            Value::Str(action_id(self)),
        );
        m.insert(
            "action_type".to_string(),
            Value::Str(self.action_type.as_str().to_string()),
        );
        m.insert("target".to_string(), Value::Str(self.target.clone()));
        m.insert("params".to_string(), self.params.clone());
        Value::Map(m)
    }
}

/// Stable content-derived action identifier: SHA-256 of the canonical
/// `{action_type, params, target}` tuple. Used for ordering and dedup.
pub fn action_id(action: &Action) -> String {
    let mut m = BTreeMap::new();
    m.insert(
        "action_type".to_string(),
        Value::Str(action.action_type.as_str().to_string()),
    );
    m.insert("params".to_string(), action.params.clone());
    m.insert("target".to_string(), Value::Str(action.target.clone()));
    sha256_hex(&to_canonical_bytes(&Value::Map(m)))
}

/// Decision provenance bound to the trigger record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionMeta {
    pub trigger_seq: u64,
    pub trigger_hash: String,
    pub trigger_type: String,
    pub trigger_spec_hash: Option<String>,
    pub action_ids: Vec<String>,
    pub actions_hash: String,
    pub sample_action: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub agent_id: String,
    pub actions: Vec<Action>,
    pub meta: DecisionMeta,
}

impl Decision {
    /// The `ActionsDecided` event carrying this decision, committed by the
    /// same writer that appended the trigger.
    pub fn to_event(&self, ts: u64) -> Event {
        let mut payload = BTreeMap::new();
        payload.insert("agent_id".to_string(), Value::Str(self.agent_id.clone()));
        payload.insert(
            "trigger_seq".to_string(),
            Value::Uint(self.meta.trigger_seq),
        );
        payload.insert(
            "trigger_hash".to_string(),
            Value::Str(self.meta.trigger_hash.clone()),
        );
        payload.insert(
            "trigger_type".to_string(),
            Value::Str(self.meta.trigger_type.clone()),
        );
        if let Some(spec_hash) = &self.meta.trigger_spec_hash {
            payload.insert(
                "trigger_spec_hash".to_string(),
                Value::Str(spec_hash.clone()),
            );
        }
        payload.insert(
            "action_ids".to_string(),
            Value::Array(
                self.meta
                    .action_ids
                    .iter()
                    .map(|id| Value::Str(id.clone()))
                    .collect(),
            ),
        );
        payload.insert(
            "actions_hash".to_string(),
            Value::Str(self.meta.actions_hash.clone()),
        );
        payload.insert(
            "actions".to_string(),
            Value::Array(self.actions.iter().map(Action::to_value).collect()),
        );
        Event::new("ActionsDecided", self.agent_id.clone(), ts).with_payload(Value::Map(payload))
    }
}

/// Hash of the ordered action-id list, the audit anchor for the decision.
pub fn actions_hash(action_ids: &[String]) -> String {
    let ids = Value::Array(action_ids.iter().map(|id| Value::Str(id.clone())).collect());
    sha256_hex(&to_canonical_bytes(&ids))
}

/// Pure decision function. The trigger is the stored chain record so the
/// provenance pointer can bind to its committed hash.
pub fn decide(state: &State, trigger: &ChainRecord) -> Result<Decision, DecisionError> {
    let trigger_seq = trigger
        .event
        .seq
        .ok_or(DecisionError::SeqUnassigned)?;
    let event = &trigger.event;

    let actions = match event.event_type.as_str() {
        "AgentObserved" => decide_agent_observed(state, event)?,
        // Feedback events and unknown types produce no further actions.
        _ => Vec::new(),
    };

    let actions = stable_actions(actions);
    let action_ids: Vec<String> = actions.iter().map(action_id).collect();
    let meta = DecisionMeta {
        trigger_seq,
        trigger_hash: trigger.event_hash.clone(),
        trigger_type: event.event_type.clone(),
        trigger_spec_hash: event
            .payload
            .get("spec_hash")
            .and_then(Value::as_str)
            .map(String::from),
        actions_hash: actions_hash(&action_ids),
        action_ids,
        sample_action: actions.first().map(Action::to_value),
    };

    Ok(Decision {
        agent_id: event.aggregate_id.clone(),
        actions,
        meta,
    })
}

/// Deduplicate by id and order ascending by id.
fn stable_actions(actions: Vec<Action>) -> Vec<Action> {
    let mut by_id: BTreeMap<String, Action> = BTreeMap::new();
    for action in actions {
        by_id.insert(action_id(&action), action);
    }
    by_id.into_values().collect()
}

fn decide_agent_observed(_state: &State, event: &Event) -> Result<Vec<Action>, DecisionError> {
    let payload = &event.payload;
    let name = payload
        .get("name")
        .and_then(Value::as_str)
        .ok_or(DecisionError::MissingField { field: "name" })?;
    let namespace = payload
        .get("namespace")
        .and_then(Value::as_str)
        .ok_or(DecisionError::MissingField { field: "namespace" })?;
    let spec = payload
        .get("spec")
        .cloned()
        .ok_or(DecisionError::MissingField { field: "spec" })?;

    let mut actions = Vec::new();

    // ConfigMap carrying the canonical agent spec for the runtime to read.
    let mut cm_data = BTreeMap::new();
    cm_data.insert(
        "agent.json".to_string(),
        Value::Str(to_canonical_string(&spec)),
    );
    let mut cm_params = BTreeMap::new();
    cm_params.insert("name".to_string(), Value::Str(format!("{name}-spec")));
    cm_params.insert("namespace".to_string(), Value::Str(namespace.to_string()));
    cm_params.insert("data".to_string(), Value::Map(cm_data));
    actions.push(Action {
        action_type: ActionType::EnsureConfigMap,
        target: format!("{namespace}/{name}-spec"),
        params: Value::Map(cm_params),
    });

    // Workspace volume claim.
    let workspace = spec.get("workspace");
    let size = workspace
        .and_then(|w| w.get("size"))
        .and_then(Value::as_str)
        .unwrap_or("1Gi");
    let mut pvc_params = BTreeMap::new();
    pvc_params.insert("name".to_string(), Value::Str(format!("{name}-workspace")));
    pvc_params.insert("namespace".to_string(), Value::Str(namespace.to_string()));
    pvc_params.insert("size".to_string(), Value::Str(size.to_string()));
    if let Some(storage_class) = workspace
        .and_then(|w| w.get("storageClassName"))
        .and_then(Value::as_str)
    {
        pvc_params.insert(
            "storage_class".to_string(),
            Value::Str(storage_class.to_string()),
        );
    }
    actions.push(Action {
        action_type: ActionType::EnsurePvc,
        target: format!("{namespace}/{name}-workspace"),
        params: Value::Map(pvc_params),
    });

    // Runtime deployment.
    let image_spec = spec.get("image");
    let repository = image_spec
        .and_then(|i| i.get("repository"))
        .and_then(Value::as_str)
        .unwrap_or("strand/universal-agent-runtime");
    let tag = image_spec
        .and_then(|i| i.get("tag"))
        .and_then(Value::as_str)
        .unwrap_or("latest");
    let verify_image = image_spec
        .and_then(|i| i.get("verify"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let deployment_spec = deployment_spec(name, namespace, repository, tag, verify_image);
    let mut dep_params = BTreeMap::new();
    dep_params.insert("name".to_string(), Value::Str(format!("{name}-runtime")));
    dep_params.insert("namespace".to_string(), Value::Str(namespace.to_string()));
    dep_params.insert("spec".to_string(), deployment_spec);
    actions.push(Action {
        action_type: ActionType::EnsureDeployment,
        target: format!("{namespace}/{name}-runtime"),
        params: Value::Map(dep_params),
    });

    // Role-gated network policy: directors and managers (and anything
    // allowed to assign tasks) get egress; workers are confined.
    let role = spec
        .get("role")
        .and_then(Value::as_str)
        .unwrap_or("worker")
        .to_lowercase();
    let can_assign = spec
        .get("permissions")
        .and_then(|p| p.get("canAssignTasks"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let (policy_name, policy_type) = if role == "director" || role == "manager" || can_assign {
        (format!("{name}-allow-egress"), "allow-egress")
    } else {
        (format!("{name}-deny-egress"), "deny-egress")
    };
    let mut selector = BTreeMap::new();
    selector.insert(
        "app".to_string(),
        Value::Str("universe-agent".to_string()),
    );
    selector.insert("agent".to_string(), Value::Str(name.to_string()));
    let mut np_params = BTreeMap::new();
    np_params.insert("name".to_string(), Value::Str(policy_name.clone()));
    np_params.insert("namespace".to_string(), Value::Str(namespace.to_string()));
    np_params.insert("pod_selector".to_string(), Value::Map(selector));
    np_params.insert(
        "policy_type".to_string(),
        Value::Str(policy_type.to_string()),
    );
    actions.push(Action {
        action_type: ActionType::EnsureNetworkPolicy,
        target: format!("{namespace}/{policy_name}"),
        params: Value::Map(np_params),
    });

    Ok(actions)
}

fn deployment_spec(
    name: &str,
    namespace: &str,
    repository: &str,
    tag: &str,
    verify_image: bool,
) -> Value {
    let mut spec = BTreeMap::new();
    spec.insert("replicas".to_string(), Value::Uint(1));
    spec.insert(
        "image".to_string(),
        Value::Str(format!("{repository}:{tag}")),
    );
    spec.insert("image_verify".to_string(), Value::Bool(verify_image));
    spec.insert(
        "runtime_class".to_string(),
        Value::Str("gvisor".to_string()),
    );

    let env = vec![
        env_var("AGENT_NAME", name),
        env_var("AGENT_NAMESPACE", namespace),
    ];
    spec.insert("env".to_string(), Value::Array(env));

    let volumes = vec![
        named_ref("workspace", "pvc", &format!("{name}-workspace")),
        named_ref("agent-spec", "configmap", &format!("{name}-spec")),
    ];
    spec.insert("volumes".to_string(), Value::Array(volumes));

    let mut workspace_mount = BTreeMap::new();
    workspace_mount.insert("name".to_string(), Value::Str("workspace".to_string()));
    workspace_mount.insert(
        "mount_path".to_string(),
        Value::Str("/workspace".to_string()),
    );
    let mut spec_mount = BTreeMap::new();
    spec_mount.insert("name".to_string(), Value::Str("agent-spec".to_string()));
    spec_mount.insert("mount_path".to_string(), Value::Str("/config".to_string()));
    spec_mount.insert("read_only".to_string(), Value::Bool(true));
    spec.insert(
        "volume_mounts".to_string(),
        Value::Array(vec![Value::Map(workspace_mount), Value::Map(spec_mount)]),
    );

    Value::Map(spec)
}

fn env_var(name: &str, value: &str) -> Value {
    let mut m = BTreeMap::new();
    m.insert("name".to_string(), Value::Str(name.to_string()));
    m.insert("value".to_string(), Value::Str(value.to_string()));
    Value::Map(m)
}

fn named_ref(name: &str, kind: &str, target: &str) -> Value {
    let mut m = BTreeMap::new();
    m.insert("name".to_string(), Value::Str(name.to_string()));
    m.insert(kind.to_string(), Value::Str(target.to_string()));
    Value::Map(m)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::WorkloadAdapter;
    use strand_core::{chain_record, LogicalClock, ZERO_HASH};

    fn observed_record(spec: serde_json::Value) -> ChainRecord {
        let mut adapter = WorkloadAdapter::new(LogicalClock::default());
        let event = adapter
            .observe_workload("alpha", "universe", &spec, None)
            .unwrap()
            .with_seq(0);
        chain_record(ZERO_HASH, event)
    }

    #[test]
    fn worker_gets_deny_egress() {
        let trigger = observed_record(serde_json::json!({"role": "worker"}));
        let decision = decide(&State::new(), &trigger).unwrap();
        assert_eq!(decision.actions.len(), 4);
        let policy = decision
            .actions
            .iter()
            .find(|a| a.action_type == ActionType::EnsureNetworkPolicy)
            .unwrap();
        assert_eq!(
            policy.params.get("policy_type").and_then(Value::as_str),
            Some("deny-egress")
        );
    }

    #[test]
    fn director_gets_allow_egress() {
        let trigger = observed_record(serde_json::json!({"role": "Director"}));
        let decision = decide(&State::new(), &trigger).unwrap();
        let policy = decision
            .actions
            .iter()
            .find(|a| a.action_type == ActionType::EnsureNetworkPolicy)
            .unwrap();
        assert_eq!(
            policy.params.get("policy_type").and_then(Value::as_str),
            Some("allow-egress")
        );
    }

    #[test]
    fn actions_are_sorted_by_action_id() {
        let trigger = observed_record(serde_json::json!({}));
        let decision = decide(&State::new(), &trigger).unwrap();
        let ids: Vec<String> = decision.actions.iter().map(action_id).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
        assert_eq!(decision.meta.action_ids, ids);
    }

    #[test]
    fn decide_is_deterministic_over_100_calls() {
        let trigger = observed_record(serde_json::json!({"role": "worker"}));
        let state = State::new();
        let first = decide(&state, &trigger).unwrap();
        for _ in 0..100 {
            let next = decide(&state, &trigger).unwrap();
            assert_eq!(next.meta.action_ids, first.meta.action_ids);
            assert_eq!(next.meta.actions_hash, first.meta.actions_hash);
            assert_eq!(next.actions, first.actions);
        }
    }

    #[test]
    fn feedback_events_produce_no_actions() {
        let event = Event::new("ActionApplied", "t", 5).with_seq(3);
        let trigger = chain_record(ZERO_HASH, event);
        let decision = decide(&State::new(), &trigger).unwrap();
        assert!(decision.actions.is_empty());
        assert_eq!(decision.meta.actions_hash, actions_hash(&[]));
    }

    #[test]
    fn decision_event_carries_provenance() {
        let trigger = observed_record(serde_json::json!({}));
        let decision = decide(&State::new(), &trigger).unwrap();
        let event = decision.to_event(9);
        assert_eq!(event.event_type, "ActionsDecided");
        assert_eq!(
            event.payload.get("trigger_seq").and_then(Value::as_u64),
            Some(0)
        );
        assert_eq!(
            event.payload.get("trigger_hash").and_then(Value::as_str),
            Some(trigger.event_hash.as_str())
        );
        assert!(event.payload.get("trigger_spec_hash").is_some());
    }
}
