//! Verification consumers: chain soundness, decision-pointer soundness,
//! and the audit-grade decision proof.

use std::collections::BTreeMap;

use strand_core::{ChainRecord, Value};
use strand_store::{EventStore, StoreError};

use crate::checkpoint::{self, CheckpointStore, VerifyingKey};
use crate::decision::actions_hash;

/// Outcome of a full-log chain verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainReport {
    pub valid: bool,
    pub checked: u64,
    pub failed_seq: Option<u64>,
    pub error: Option<String>,
}

impl ChainReport {
    fn ok(checked: u64) -> Self {
        Self {
            valid: true,
            checked,
            failed_seq: None,
            error: None,
        }
    }

    fn failed(checked: u64, err: &StoreError) -> Self {
        let failed_seq = match err {
            StoreError::Integrity { seq, .. } => *seq,
            _ => None,
        };
        Self {
            valid: false,
            checked,
            failed_seq,
            error: Some(err.to_string()),
        }
    }
}

/// Walk the whole log, letting the store's validating read enforce link,
/// hash, and contiguity invariants.
pub fn verify_chain(store: &dyn EventStore) -> Result<ChainReport, StoreError> {
    let mut checked = 0u64;
    let iter = match store.read(0, None) {
        Ok(iter) => iter,
        Err(err) => return Ok(ChainReport::failed(0, &err)),
    };
    for record in iter {
        match record {
            Ok(_) => checked += 1,
            Err(err @ StoreError::Integrity { .. }) => {
                return Ok(ChainReport::failed(checked, &err));
            }
            Err(err) => return Err(err),
        }
    }
    Ok(ChainReport::ok(checked))
}

/// Outcome of verifying every `ActionsDecided` trigger pointer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointerReport {
    pub valid: bool,
    pub checked: u64,
    pub failed_seq: Option<u64>,
    pub error: Option<String>,
}

impl PointerReport {
    fn failure(checked: u64, seq: u64, error: impl Into<String>) -> Self {
        Self {
            valid: false,
            checked,
            failed_seq: Some(seq),
            error: Some(error.into()),
        }
    }
}

/// For every `ActionsDecided` event: the trigger pointer must name an
/// earlier record, its hash and type must match that record, the optional
/// spec-hash pin must match the trigger payload, and `actions_hash` must
/// recompute from `action_ids`.
pub fn verify_pointers(store: &dyn EventStore) -> Result<PointerReport, StoreError> {
    let mut seq_to_hash: BTreeMap<u64, String> = BTreeMap::new();
    let mut seq_to_type: BTreeMap<u64, String> = BTreeMap::new();
    let mut seq_to_spec_hash: BTreeMap<u64, Option<String>> = BTreeMap::new();
    let mut checked = 0u64;

    let iter = match store.read(0, None) {
        Ok(iter) => iter,
        Err(err @ StoreError::Integrity { .. }) => {
            return Ok(PointerReport {
                valid: false,
                checked: 0,
                failed_seq: None,
                error: Some(err.to_string()),
            });
        }
        Err(err) => return Err(err),
    };

    for record in iter {
        let record = match record {
            Ok(record) => record,
            Err(err @ StoreError::Integrity { .. }) => {
                return Ok(PointerReport {
                    valid: false,
                    checked,
                    failed_seq: match &err {
                        StoreError::Integrity { seq, .. } => *seq,
                        _ => None,
                    },
                    error: Some(err.to_string()),
                });
            }
            Err(err) => return Err(err),
        };
        let seq = record.seq()?;
        seq_to_hash.insert(seq, record.event_hash.clone());
        seq_to_type.insert(seq, record.event.event_type.clone());
        seq_to_spec_hash.insert(
            seq,
            record
                .event
                .payload
                .get("spec_hash")
                .and_then(Value::as_str)
                .map(String::from),
        );

        if record.event.event_type != "ActionsDecided" {
            continue;
        }
        let payload = &record.event.payload;

        let Some(trigger_seq) = payload.get("trigger_seq").and_then(Value::as_u64) else {
            return Ok(PointerReport::failure(checked, seq, "missing trigger_seq"));
        };
        let Some(expected_hash) = seq_to_hash.get(&trigger_seq) else {
            return Ok(PointerReport::failure(
                checked,
                seq,
                format!("trigger_seq {trigger_seq} not found"),
            ));
        };
        if payload.get("trigger_hash").and_then(Value::as_str) != Some(expected_hash.as_str()) {
            return Ok(PointerReport::failure(checked, seq, "trigger_hash mismatch"));
        }
        let expected_type = seq_to_type.get(&trigger_seq).map(String::as_str);
        if payload.get("trigger_type").and_then(Value::as_str) != expected_type {
            return Ok(PointerReport::failure(checked, seq, "trigger_type mismatch"));
        }
        if let Some(pinned) = payload.get("trigger_spec_hash").and_then(Value::as_str) {
            let actual = seq_to_spec_hash
                .get(&trigger_seq)
                .and_then(|h| h.as_deref());
            if actual != Some(pinned) {
                return Ok(PointerReport::failure(
                    checked,
                    seq,
                    "trigger_spec_hash mismatch",
                ));
            }
        }

        let ids: Vec<String> = payload
            .get("action_ids")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        if payload.get("actions_hash").and_then(Value::as_str)
            != Some(actions_hash(&ids).as_str())
        {
            return Ok(PointerReport::failure(checked, seq, "actions_hash mismatch"));
        }

        checked += 1;
    }

    Ok(PointerReport {
        valid: true,
        checked,
        failed_seq: None,
        error: None,
    })
}

/// Per-action outcome recorded in the log after a decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    Applied { result_code: String },
    Failed { result_code: String },
    Missing,
}

/// Audit bundle for one decision: the trigger, the committed decision,
/// each action's recorded outcome, and (optionally) the covering
/// checkpoint's signature validity.
#[derive(Debug, Clone)]
pub struct DecisionProof {
    pub valid: bool,
    pub errors: Vec<String>,
    pub trigger_seq: u64,
    pub trigger_hash: Option<String>,
    pub trigger_type: Option<String>,
    pub decided_seq: u64,
    pub actions_hash: Option<String>,
    pub action_outcomes: BTreeMap<String, ActionOutcome>,
    pub checkpoint: Option<CheckpointSummary>,
}

#[derive(Debug, Clone)]
pub struct CheckpointSummary {
    pub at_seq: u64,
    pub state_hash: String,
    pub pubkey_id: String,
    pub signature_valid: Option<bool>,
    pub error: Option<String>,
}

/// Build and verify the decision proof for the `ActionsDecided` event
/// whose trigger is `at_seq` (or the first one, when `None`).
pub fn build_decision_proof(
    store: &dyn EventStore,
    at_seq: Option<u64>,
    checkpoints: Option<&CheckpointStore>,
    pubkey: Option<&VerifyingKey>,
) -> Result<Option<DecisionProof>, StoreError> {
    let records: Vec<ChainRecord> = store.read(0, None)?.collect::<Result<_, _>>()?;

    let decided = records.iter().find(|record| {
        record.event.event_type == "ActionsDecided"
            && at_seq.is_none_or(|seq| {
                record.event.payload.get("trigger_seq").and_then(Value::as_u64) == Some(seq)
            })
    });
    let Some(decided) = decided else {
        return Ok(None);
    };

    let payload = &decided.event.payload;
    let trigger_seq = payload
        .get("trigger_seq")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let trigger = records
        .iter()
        .find(|r| r.event.seq == Some(trigger_seq));

    let mut errors = Vec::new();

    let pointers = verify_pointers(store)?;
    if !pointers.valid {
        errors.push(
            pointers
                .error
                .unwrap_or_else(|| "pointer verification failed".to_string()),
        );
    }

    // Recorded outcomes for every decided action id.
    let mut recorded: BTreeMap<String, ActionOutcome> = BTreeMap::new();
    for record in &records {
        let event = &record.event;
        let outcome = match event.event_type.as_str() {
            "ActionApplied" => ActionOutcome::Applied {
                result_code: event
                    .payload
                    .get("result_code")
                    .and_then(Value::as_str)
                    .unwrap_or("OK")
                    .to_string(),
            },
            "ActionFailed" => ActionOutcome::Failed {
                result_code: event
                    .payload
                    .get("result_code")
                    .and_then(Value::as_str)
                    .unwrap_or("UNKNOWN")
                    .to_string(),
            },
            _ => continue,
        };
        if let Some(id) = event.payload.get("action_id").and_then(Value::as_str) {
            recorded.insert(id.to_string(), outcome);
        }
    }

    let mut action_outcomes = BTreeMap::new();
    if let Some(ids) = payload.get("action_ids").and_then(Value::as_array) {
        for id in ids.iter().filter_map(Value::as_str) {
            let outcome = recorded
                .get(id)
                .cloned()
                .unwrap_or(ActionOutcome::Missing);
            if outcome == ActionOutcome::Missing {
                errors.push(format!("missing action result for {id}"));
            }
            action_outcomes.insert(id.to_string(), outcome);
        }
    }

    let checkpoint = match checkpoints {
        Some(cp_store) => summarize_checkpoint(cp_store, trigger_seq, pubkey, store),
        None => None,
    };
    if let Some(summary) = &checkpoint {
        if summary.signature_valid == Some(false) {
            errors.push("checkpoint signature invalid".to_string());
        }
    }

    Ok(Some(DecisionProof {
        valid: errors.is_empty(),
        errors,
        trigger_seq,
        trigger_hash: trigger.map(|r| r.event_hash.clone()),
        trigger_type: trigger.map(|r| r.event.event_type.clone()),
        decided_seq: decided.event.seq.unwrap_or(0),
        actions_hash: payload
            .get("actions_hash")
            .and_then(Value::as_str)
            .map(String::from),
        action_outcomes,
        checkpoint,
    }))
}

fn summarize_checkpoint(
    cp_store: &CheckpointStore,
    trigger_seq: u64,
    pubkey: Option<&VerifyingKey>,
    store: &dyn EventStore,
) -> Option<CheckpointSummary> {
    let path = cp_store.find_at_or_before(trigger_seq).ok()??;
    let cp = match cp_store.load(&path) {
        Ok(cp) => cp,
        Err(err) => {
            return Some(CheckpointSummary {
                at_seq: 0,
                state_hash: String::new(),
                pubkey_id: String::new(),
                signature_valid: Some(false),
                error: Some(err.to_string()),
            });
        }
    };
    let mut summary = CheckpointSummary {
        at_seq: cp.at_seq,
        state_hash: cp.state_hash.clone(),
        pubkey_id: cp.pubkey_id.clone(),
        signature_valid: None,
        error: None,
    };
    if let Some(key) = pubkey {
        match checkpoint::verify_signature(&cp, key) {
            Ok(()) => summary.signature_valid = Some(true),
            Err(err) => {
                summary.signature_valid = Some(false);
                summary.error = Some(err.to_string());
            }
        }
        // Signature aside, the checkpoint must still bind to this log.
        if summary.signature_valid == Some(true) {
            match store.event_hash_at(cp.at_seq) {
                Ok(Some(hash)) if hash == cp.log_hash => {}
                _ => {
                    summary.signature_valid = Some(false);
                    summary.error = Some("checkpoint log hash does not match log".to_string());
                }
            }
        }
    }
    Some(summary)
}
