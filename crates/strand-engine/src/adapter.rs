//! Adapter: observed workload objects → canonical events.
//!
//! Two observations of the same workload must collapse to the same event
//! payload, so everything the platform assigns or mutates on its own is
//! stripped, platform defaulting is materialized from a frozen rule set,
//! and enumerated fields are normalized before the payload is built.

use std::collections::BTreeMap;

use strand_core::{
    sha256_hex, stable_id, to_canonical_bytes, CanonicalError, Event, EventMeta, LogicalClock,
    Value,
};
use thiserror::Error;

/// Labels that survive translation; everything else varies per cluster.
const STABLE_LABEL_KEYS: [&str; 5] = ["app", "team", "policy", "role", "network-policy"];

/// Platform-assigned metadata fields stripped before translation.
const PLATFORM_METADATA_FIELDS: [&str; 6] = [
    "resourceVersion",
    "uid",
    "generation",
    "creationTimestamp",
    "managedFields",
    "ownerReferences",
];

const LAST_APPLIED_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Canonical(#[from] CanonicalError),
    #[error("observed object is missing `{field}`")]
    MissingField { field: &'static str },
}

/// Translates observed workload objects into `AgentObserved` events.
///
/// Holds the logical clock and advances it exactly once per emitted event.
#[derive(Debug, Clone)]
pub struct WorkloadAdapter {
    clock: LogicalClock,
}

impl WorkloadAdapter {
    pub fn new(clock: LogicalClock) -> Self {
        Self { clock }
    }

    pub fn clock(&self) -> LogicalClock {
        self.clock
    }

    /// Translate one observed workload into a canonical event.
    ///
    /// `spec` is the observed spec subtree; floats anywhere in it are
    /// rejected here, never deeper in the pipeline.
    pub fn observe_workload(
        &mut self,
        name: &str,
        namespace: &str,
        spec: &serde_json::Value,
        labels: Option<&BTreeMap<String, String>>,
    ) -> Result<Event, AdapterError> {
        let spec = normalize_agent_spec(&Value::from_json(spec)?);
        let spec_hash = short_spec_hash(&spec);

        let mut normalized_labels = BTreeMap::new();
        if let Some(labels) = labels {
            for key in STABLE_LABEL_KEYS {
                if let Some(value) = labels.get(key) {
                    normalized_labels.insert(key.to_string(), Value::Str(value.clone()));
                }
            }
        }

        self.clock = self.clock.tick();
        let ts = self.clock.now();

        let mut payload = BTreeMap::new();
        payload.insert("name".to_string(), Value::Str(name.to_string()));
        payload.insert("namespace".to_string(), Value::Str(namespace.to_string()));
        payload.insert("labels".to_string(), Value::Map(normalized_labels));
        payload.insert("spec".to_string(), spec);
        payload.insert("spec_hash".to_string(), Value::Str(spec_hash));
        payload.insert("observed_logical_time".to_string(), Value::Uint(ts));

        let aggregate_id = stable_id(&["agent", namespace, name]);
        let meta = EventMeta {
            source: Some("kubernetes".to_string()),
            resource: Some("agents".to_string()),
            ..EventMeta::default()
        };

        Ok(Event::new("AgentObserved", aggregate_id, ts)
            .with_payload(Value::Map(payload))
            .with_meta(meta))
    }

    /// Translate a full observed object (metadata + spec), stripping the
    /// platform-assigned fields first.
    pub fn observe_object(&mut self, object: &serde_json::Value) -> Result<Event, AdapterError> {
        let cleaned = strip_platform_fields(object);
        let metadata = cleaned
            .get("metadata")
            .ok_or(AdapterError::MissingField { field: "metadata" })?;
        let name = metadata
            .get("name")
            .and_then(serde_json::Value::as_str)
            .ok_or(AdapterError::MissingField {
                field: "metadata.name",
            })?
            .to_string();
        let namespace = metadata
            .get("namespace")
            .and_then(serde_json::Value::as_str)
            .ok_or(AdapterError::MissingField {
                field: "metadata.namespace",
            })?
            .to_string();
        let labels = metadata
            .get("labels")
            .and_then(serde_json::Value::as_object)
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect::<BTreeMap<_, _>>()
            });
        let spec = cleaned
            .get("spec")
            .cloned()
            .unwrap_or_else(|| serde_json::json!({}));
        self.observe_workload(&name, &namespace, &spec, labels.as_ref())
    }
}

/// Drop every field the platform assigns or varies across observations:
/// server-side identifiers, generation counters, managed fields, server
/// timestamps, the last-applied annotation, and the whole status subtree.
pub fn strip_platform_fields(object: &serde_json::Value) -> serde_json::Value {
    let mut cleaned = object.clone();
    if let Some(map) = cleaned.as_object_mut() {
        map.remove("status");
        if let Some(metadata) = map.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            for field in PLATFORM_METADATA_FIELDS {
                metadata.remove(field);
            }
            if let Some(annotations) = metadata
                .get_mut("annotations")
                .and_then(|a| a.as_object_mut())
            {
                annotations.remove(LAST_APPLIED_ANNOTATION);
            }
        }
    }
    cleaned
}

/// Materialize platform defaults so that semantically identical specs that
/// differ only by defaulting collapse to the same payload, and normalize
/// enumerated fields to canonical case.
///
/// The default set is the frozen authoritative list for every hash
/// version; extending it is a format change.
pub fn normalize_agent_spec(spec: &Value) -> Value {
    let mut norm = spec.as_map().cloned().unwrap_or_default();

    let role = norm
        .get("role")
        .and_then(Value::as_str)
        .unwrap_or("worker")
        .to_lowercase();
    norm.insert("role".to_string(), Value::Str(role));

    let mut permissions = norm
        .get("permissions")
        .and_then(Value::as_map)
        .cloned()
        .unwrap_or_default();
    for key in ["canAssignTasks", "canAccessAuditLogs", "canManageTeam"] {
        permissions
            .entry(key.to_string())
            .or_insert(Value::Bool(false));
    }
    norm.insert("permissions".to_string(), Value::Map(permissions));

    let mut image = norm
        .get("image")
        .and_then(Value::as_map)
        .cloned()
        .unwrap_or_default();
    image
        .entry("tag".to_string())
        .or_insert_with(|| Value::Str("latest".to_string()));
    image.entry("verify".to_string()).or_insert(Value::Bool(false));
    norm.insert("image".to_string(), Value::Map(image));

    let mut workspace = norm
        .get("workspace")
        .and_then(Value::as_map)
        .cloned()
        .unwrap_or_default();
    workspace
        .entry("size".to_string())
        .or_insert_with(|| Value::Str("1Gi".to_string()));
    norm.insert("workspace".to_string(), Value::Map(workspace));

    Value::Map(norm)
}

/// Change-detection hash: first 16 hex chars of the canonical spec digest.
pub fn short_spec_hash(spec: &Value) -> String {
    let full = sha256_hex(&to_canonical_bytes(spec));
    full[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> WorkloadAdapter {
        WorkloadAdapter::new(LogicalClock::default())
    }

    #[test]
    fn defaulted_and_explicit_specs_collapse() {
        let mut a = adapter();
        let implicit = a
            .observe_workload("alpha", "universe", &serde_json::json!({}), None)
            .unwrap();
        let mut b = adapter();
        let explicit = b
            .observe_workload(
                "alpha",
                "universe",
                &serde_json::json!({
                    "role": "worker",
                    "permissions": {
                        "canAssignTasks": false,
                        "canAccessAuditLogs": false,
                        "canManageTeam": false
                    },
                    "image": {"tag": "latest", "verify": false},
                    "workspace": {"size": "1Gi"}
                }),
                None,
            )
            .unwrap();
        assert_eq!(implicit.payload, explicit.payload);
        assert_eq!(implicit.aggregate_id, explicit.aggregate_id);
    }

    #[test]
    fn role_is_normalized_to_lowercase() {
        let mut a = adapter();
        let ev = a
            .observe_workload(
                "alpha",
                "universe",
                &serde_json::json!({"role": "Director"}),
                None,
            )
            .unwrap();
        let role = ev
            .payload
            .get("spec")
            .and_then(|s| s.get("role"))
            .and_then(Value::as_str)
            .unwrap();
        assert_eq!(role, "director");
    }

    #[test]
    fn floats_are_rejected_at_the_boundary() {
        let mut a = adapter();
        let err = a
            .observe_workload(
                "alpha",
                "universe",
                &serde_json::json!({"cpu": 1.5}),
                None,
            )
            .unwrap_err();
        assert!(matches!(err, AdapterError::Canonical(_)));
    }

    #[test]
    fn clock_advances_once_per_event() {
        let mut a = adapter();
        let e1 = a
            .observe_workload("alpha", "universe", &serde_json::json!({}), None)
            .unwrap();
        let e2 = a
            .observe_workload("beta", "universe", &serde_json::json!({}), None)
            .unwrap();
        assert_eq!(e1.ts, 1);
        assert_eq!(e2.ts, 2);
    }

    #[test]
    fn platform_fields_are_stripped() {
        let object = serde_json::json!({
            "metadata": {
                "name": "alpha",
                "namespace": "universe",
                "uid": "f2c1...",
                "resourceVersion": "12345",
                "generation": 7,
                "creationTimestamp": "2024-01-01T00:00:00Z",
                "managedFields": [{"manager": "kubectl"}],
                "annotations": {
                    "kubectl.kubernetes.io/last-applied-configuration": "{...}",
                    "keep-me": "yes"
                },
                "labels": {"app": "universe-agent", "pod-template-hash": "abc"}
            },
            "spec": {"role": "worker"},
            "status": {"phase": "Running"}
        });
        let mut a = adapter();
        let ev = a.observe_object(&object).unwrap();

        let labels = ev.payload.get("labels").and_then(Value::as_map).unwrap();
        assert!(labels.contains_key("app"));
        assert!(!labels.contains_key("pod-template-hash"));
        let rendered = strand_core::to_canonical_string(&ev.payload);
        assert!(!rendered.contains("resourceVersion"));
        assert!(!rendered.contains("Running"));

        // Stripping is what makes re-observation stable: same object with
        // different server-assigned fields yields the same payload.
        let mut object2 = object.clone();
        object2["metadata"]["resourceVersion"] = serde_json::json!("99999");
        object2["status"] = serde_json::json!({"phase": "Pending"});
        let mut b = adapter();
        let ev2 = b.observe_object(&object2).unwrap();
        assert_eq!(ev.payload, ev2.payload);
    }

    #[test]
    fn aggregate_id_is_content_derived() {
        let mut a = adapter();
        let ev = a
            .observe_workload("alpha", "universe", &serde_json::json!({}), None)
            .unwrap();
        assert_eq!(ev.aggregate_id, stable_id(&["agent", "universe", "alpha"]));
    }
}
