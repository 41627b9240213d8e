//! Audit report: the bundle a compliance reader consumes.
//!
//! Sections: chain verification, pointer verification, decision summary,
//! per-agent drift, and a failure-code tally. Renderable as canonical JSON
//! or Markdown.

use std::collections::BTreeMap;

use strand_core::{Reducer, Value};
use strand_store::{EventStore, StoreError};

use crate::checkpoint::{CheckpointStore, VerifyingKey};
use crate::handlers::NS_FAILURES;
use crate::query::{drift, list_agents};
use crate::replay::replay;
use crate::verify::{
    build_decision_proof, verify_chain, verify_pointers, ActionOutcome, ChainReport,
    DecisionProof, PointerReport,
};

#[derive(Debug, Clone, Default)]
pub struct AuditOptions {
    /// Restrict the report to the decision triggered at this seq.
    pub at_seq: Option<u64>,
    /// Include the full decision proof section.
    pub include_proof: bool,
    pub checkpoints_dir: Option<std::path::PathBuf>,
    pub pubkey_path: Option<std::path::PathBuf>,
}

#[derive(Debug, Clone)]
pub struct AgentDrift {
    pub agent_id: String,
    pub missing_action_ids: Vec<String>,
    pub extra_action_ids: Vec<String>,
}

#[derive(Debug)]
pub struct AuditReport {
    pub chain: ChainReport,
    pub pointers: PointerReport,
    pub decisions_count: u64,
    pub action_type_counts: BTreeMap<String, u64>,
    pub drift: Vec<AgentDrift>,
    pub failure_codes: BTreeMap<String, u64>,
    pub proof: Option<DecisionProof>,
}

impl AuditReport {
    /// Every verification section passed.
    pub fn verified(&self) -> bool {
        self.chain.valid
            && self.pointers.valid
            && self.proof.as_ref().is_none_or(|p| p.valid)
    }

    pub fn to_value(&self) -> Value {
        let mut top = BTreeMap::new();

        let mut chain = BTreeMap::new();
        chain.insert("valid".to_string(), Value::Bool(self.chain.valid));
        chain.insert("checked".to_string(), Value::Uint(self.chain.checked));
        if let Some(seq) = self.chain.failed_seq {
            chain.insert("failed_seq".to_string(), Value::Uint(seq));
        }
        if let Some(error) = &self.chain.error {
            chain.insert("error".to_string(), Value::Str(error.clone()));
        }
        top.insert("chain".to_string(), Value::Map(chain));

        let mut pointers = BTreeMap::new();
        pointers.insert("valid".to_string(), Value::Bool(self.pointers.valid));
        pointers.insert("checked".to_string(), Value::Uint(self.pointers.checked));
        if let Some(seq) = self.pointers.failed_seq {
            pointers.insert("failed_seq".to_string(), Value::Uint(seq));
        }
        if let Some(error) = &self.pointers.error {
            pointers.insert("error".to_string(), Value::Str(error.clone()));
        }
        top.insert("pointers".to_string(), Value::Map(pointers));

        let mut decisions = BTreeMap::new();
        decisions.insert(
            "actions_decided_count".to_string(),
            Value::Uint(self.decisions_count),
        );
        decisions.insert(
            "action_type_counts".to_string(),
            Value::Map(
                self.action_type_counts
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::Uint(*v)))
                    .collect(),
            ),
        );
        top.insert("decisions".to_string(), Value::Map(decisions));

        let mut drift_map = BTreeMap::new();
        for entry in &self.drift {
            let mut m = BTreeMap::new();
            m.insert(
                "missing_action_ids".to_string(),
                Value::Array(
                    entry
                        .missing_action_ids
                        .iter()
                        .map(|id| Value::Str(id.clone()))
                        .collect(),
                ),
            );
            m.insert(
                "extra_action_ids".to_string(),
                Value::Array(
                    entry
                        .extra_action_ids
                        .iter()
                        .map(|id| Value::Str(id.clone()))
                        .collect(),
                ),
            );
            drift_map.insert(entry.agent_id.clone(), Value::Map(m));
        }
        top.insert("drift".to_string(), Value::Map(drift_map));

        top.insert(
            "failure_codes".to_string(),
            Value::Map(
                self.failure_codes
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::Uint(*v)))
                    .collect(),
            ),
        );

        if let Some(proof) = &self.proof {
            let mut p = BTreeMap::new();
            p.insert("valid".to_string(), Value::Bool(proof.valid));
            p.insert("trigger_seq".to_string(), Value::Uint(proof.trigger_seq));
            p.insert("decided_seq".to_string(), Value::Uint(proof.decided_seq));
            if let Some(hash) = &proof.trigger_hash {
                p.insert("trigger_hash".to_string(), Value::Str(hash.clone()));
            }
            if let Some(hash) = &proof.actions_hash {
                p.insert("actions_hash".to_string(), Value::Str(hash.clone()));
            }
            let mut outcomes = BTreeMap::new();
            for (id, outcome) in &proof.action_outcomes {
                let label = match outcome {
                    ActionOutcome::Applied { result_code } => format!("applied:{result_code}"),
                    ActionOutcome::Failed { result_code } => format!("failed:{result_code}"),
                    ActionOutcome::Missing => "missing".to_string(),
                };
                outcomes.insert(id.clone(), Value::Str(label));
            }
            p.insert("action_outcomes".to_string(), Value::Map(outcomes));
            p.insert(
                "errors".to_string(),
                Value::Array(proof.errors.iter().map(|e| Value::Str(e.clone())).collect()),
            );
            top.insert("proof".to_string(), Value::Map(p));
        }

        top.insert("verified".to_string(), Value::Bool(self.verified()));
        Value::Map(top)
    }

    pub fn to_json(&self) -> String {
        strand_core::to_canonical_string(&self.to_value())
    }

    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        out.push_str("# Audit report\n\n");
        out.push_str(&format!(
            "Overall: {}\n\n",
            if self.verified() { "VERIFIED" } else { "FAILED" }
        ));

        out.push_str("## Hash chain\n\n");
        out.push_str(&format!(
            "- valid: {}\n- records checked: {}\n",
            self.chain.valid, self.chain.checked
        ));
        if let Some(error) = &self.chain.error {
            out.push_str(&format!("- error: {error}\n"));
        }

        out.push_str("\n## Decision pointers\n\n");
        out.push_str(&format!(
            "- valid: {}\n- decisions checked: {}\n",
            self.pointers.valid, self.pointers.checked
        ));
        if let Some(error) = &self.pointers.error {
            out.push_str(&format!("- error: {error}\n"));
        }

        out.push_str("\n## Decisions\n\n");
        out.push_str(&format!("- total: {}\n", self.decisions_count));
        for (action_type, count) in &self.action_type_counts {
            out.push_str(&format!("- {action_type}: {count}\n"));
        }

        out.push_str("\n## Drift\n\n");
        if self.drift.iter().all(|d| {
            d.missing_action_ids.is_empty() && d.extra_action_ids.is_empty()
        }) {
            out.push_str("No drift detected.\n");
        } else {
            for entry in &self.drift {
                if entry.missing_action_ids.is_empty() && entry.extra_action_ids.is_empty() {
                    continue;
                }
                out.push_str(&format!(
                    "- `{}`: {} missing, {} extra\n",
                    entry.agent_id,
                    entry.missing_action_ids.len(),
                    entry.extra_action_ids.len()
                ));
            }
        }

        if !self.failure_codes.is_empty() {
            out.push_str("\n## Failures\n\n");
            for (code, count) in &self.failure_codes {
                out.push_str(&format!("- {code}: {count}\n"));
            }
        }

        if let Some(proof) = &self.proof {
            out.push_str("\n## Decision proof\n\n");
            out.push_str(&format!(
                "- valid: {}\n- trigger seq: {}\n- decided seq: {}\n",
                proof.valid, proof.trigger_seq, proof.decided_seq
            ));
            for error in &proof.errors {
                out.push_str(&format!("- error: {error}\n"));
            }
        }
        out
    }
}

/// Assemble the audit bundle for a log.
pub fn audit_report(
    store: &dyn EventStore,
    reducer: &Reducer,
    options: &AuditOptions,
) -> Result<AuditReport, StoreError> {
    let chain = verify_chain(store)?;
    let pointers = verify_pointers(store)?;

    // Decision tallies straight off the records.
    let mut decisions_count = 0u64;
    let mut action_type_counts: BTreeMap<String, u64> = BTreeMap::new();
    if chain.valid {
        for record in store.read(0, None)? {
            let record = record?;
            if record.event.event_type != "ActionsDecided" {
                continue;
            }
            decisions_count += 1;
            if let Some(actions) = record.event.payload.get("actions").and_then(Value::as_array) {
                for action in actions {
                    if let Some(action_type) =
                        action.get("action_type").and_then(Value::as_str)
                    {
                        *action_type_counts
                            .entry(action_type.to_string())
                            .or_insert(0) += 1;
                    }
                }
            }
        }
    }

    // Drift and failure tallies need replayed state; skip on a corrupt
    // chain rather than fold bad records.
    let mut drift_entries = Vec::new();
    let mut failure_codes: BTreeMap<String, u64> = BTreeMap::new();
    if chain.valid {
        let state = replay(store, reducer, options.at_seq)
            .map_err(|e| StoreError::MalformedEvent(e.to_string()))?
            .state;
        for agent_id in list_agents(&state) {
            let d = drift(&state, &agent_id);
            drift_entries.push(AgentDrift {
                agent_id,
                missing_action_ids: d.missing_action_ids,
                extra_action_ids: d.extra_action_ids,
            });
        }
        if let Some(failure_map) = state.namespace(NS_FAILURES) {
            for history in failure_map.values() {
                let Some(entries) = history.as_array() else {
                    continue;
                };
                for entry in entries {
                    let code = entry
                        .get("error_code")
                        .or_else(|| entry.get("result_code"))
                        .and_then(Value::as_str)
                        .unwrap_or("UNKNOWN");
                    *failure_codes.entry(code.to_string()).or_insert(0) += 1;
                }
            }
        }
    }

    let proof = if options.include_proof {
        let cp_store = match &options.checkpoints_dir {
            Some(dir) => CheckpointStore::open(dir).ok(),
            None => None,
        };
        let pubkey = options
            .pubkey_path
            .as_deref()
            .and_then(|path| VerifyingKey::load(path).ok());
        build_decision_proof(store, options.at_seq, cp_store.as_ref(), pubkey.as_ref())?
    } else {
        None
    };

    Ok(AuditReport {
        chain,
        pointers,
        decisions_count,
        action_type_counts,
        drift: drift_entries,
        failure_codes,
        proof,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::WorkloadAdapter;
    use crate::executor::{ActionApplier, AppliedOutcome, ApplyError, Executor};
    use crate::handlers::register_handlers;
    use crate::leader::{LeaderConfig, LeaderGate, MemoryLeaseBackend};
    use strand_core::LogicalClock;
    use strand_store::{MemoryObjectStore, ObjectLogConfig, ObjectLogStore};

    struct OkApplier;
    impl ActionApplier for OkApplier {
        fn apply(&mut self, _: &crate::decision::Action) -> Result<AppliedOutcome, ApplyError> {
            Ok(AppliedOutcome::ok())
        }
    }

    #[test]
    fn report_on_clean_log_is_verified() {
        let mut store = ObjectLogStore::new(MemoryObjectStore::new(), ObjectLogConfig::default());
        let mut reducer = Reducer::new();
        register_handlers(&mut reducer);
        let mut adapter = WorkloadAdapter::new(LogicalClock::default());
        let trigger = adapter
            .observe_workload("alpha", "universe", &serde_json::json!({}), None)
            .unwrap();
        let gate = LeaderGate::new(MemoryLeaseBackend::new(), LeaderConfig::new("writer-0"));
        let mut executor = Executor::new(gate, OkApplier, adapter.clock());
        executor
            .process_observation(&mut store, &reducer, trigger, 0)
            .unwrap();

        let report = audit_report(
            &store,
            &reducer,
            &AuditOptions {
                include_proof: true,
                ..AuditOptions::default()
            },
        )
        .unwrap();
        assert!(report.verified());
        assert_eq!(report.decisions_count, 1);
        assert_eq!(report.action_type_counts.len(), 4);
        assert!(report.drift.iter().all(|d| d.missing_action_ids.is_empty()));

        let md = report.to_markdown();
        assert!(md.contains("VERIFIED"));
        let json = report.to_json();
        assert!(json.contains("\"verified\":true"));
    }
}
