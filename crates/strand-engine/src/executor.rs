//! Leader-gated executor: commits the trigger, the decision, and the
//! action feedback to the log, and applies side effects through the
//! [`ActionApplier`] boundary.
//!
//! Ordering contract: the trigger is appended first, `ActionsDecided`
//! immediately after it by the same writer under the same epoch, then one
//! feedback event per applied action. Loss of leadership mid-flight aborts
//! the remaining actions without retry.

use std::collections::BTreeMap;

use strand_core::{Event, LogicalClock, Reducer, Value};
use strand_store::{EventStore, RetryPolicy, StoreError};
use thiserror::Error;

use crate::decision::{action_id, decide, Action, DecisionError};
use crate::leader::{LeaderGate, LeaseBackend};
use crate::replay::{replay, ReplayError};

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("replica is not the leader; append refused")]
    NotLeader,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Decision(#[from] DecisionError),
    #[error("replay failed: {0}")]
    Replay(#[from] ReplayError),
}

/// Outcome of applying one action to the outside world.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedOutcome {
    pub result_code: String,
}

impl AppliedOutcome {
    pub fn ok() -> Self {
        Self {
            result_code: "OK".to_string(),
        }
    }
}

/// Stable, deterministic failure surface for feedback events. Raw error
/// strings and stack traces never reach the log.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("action failed with {code}")]
pub struct ApplyError {
    /// Stable result code, e.g. "CONFLICT", "FORBIDDEN", "UNKNOWN".
    pub code: String,
    /// Stable error class, e.g. "ApiError".
    pub kind: String,
}

/// The side-effect boundary. The cluster client implements this in
/// production; tests use recording or failing stubs.
pub trait ActionApplier {
    fn apply(&mut self, action: &Action) -> Result<AppliedOutcome, ApplyError>;
}

/// What one trigger produced.
#[derive(Debug, Clone)]
pub struct TriggerOutcome {
    pub trigger_seq: u64,
    pub decided_seq: u64,
    /// `(action_id, succeeded)` per attempted action.
    pub applied: Vec<(String, bool)>,
    /// True when leadership was lost before every action ran.
    pub aborted: bool,
}

pub struct Executor<B: LeaseBackend, A: ActionApplier> {
    gate: LeaderGate<B>,
    applier: A,
    clock: LogicalClock,
    retry: RetryPolicy,
}

impl<B: LeaseBackend, A: ActionApplier> Executor<B, A> {
    pub fn new(gate: LeaderGate<B>, applier: A, clock: LogicalClock) -> Self {
        Self {
            gate,
            applier,
            clock,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn gate(&mut self) -> &mut LeaderGate<B> {
        &mut self.gate
    }

    pub fn clock(&self) -> LogicalClock {
        self.clock
    }

    fn stamp_fencing(&self, mut event: Event) -> Event {
        event.meta.fencing_token = self.gate.fencing_token().or(event.meta.fencing_token);
        event
    }

    /// Full trigger pipeline: gate, append trigger, decide, append
    /// decision, apply actions with feedback.
    pub fn process_observation(
        &mut self,
        store: &mut dyn EventStore,
        reducer: &Reducer,
        trigger: Event,
        now_ms: u64,
    ) -> Result<TriggerOutcome, ExecutorError> {
        if !self.gate.pre_action_check(now_ms) {
            return Err(ExecutorError::NotLeader);
        }

        let trigger = self.stamp_fencing(trigger);
        let trigger_record = store.append_with_retry(trigger, &self.retry)?;
        let trigger_seq = trigger_record.event.seq.unwrap_or(0);

        let state = replay(store, reducer, Some(trigger_seq))?.state;
        let decision = decide(&state, &trigger_record)?;

        self.clock = self.clock.tick();
        let decided_event = self.stamp_fencing(decision.to_event(self.clock.now()));
        let decided_record = store.append_with_retry(decided_event, &self.retry)?;
        let decided_seq = decided_record.event.seq.unwrap_or(0);

        let mut applied = Vec::new();
        let mut aborted = false;
        for action in &decision.actions {
            if !self.gate.pre_action_check(now_ms) {
                aborted = true;
                break;
            }
            let outcome = self.applier.apply(action);
            let feedback = self.feedback_event(action, &outcome);
            let succeeded = outcome.is_ok();
            store.append_with_retry(feedback, &self.retry)?;
            applied.push((action_id(action), succeeded));
            if !self.gate.post_action_check(now_ms) {
                tracing::warn!(
                    target_action = %action.target,
                    "leadership lost after side effect, aborting remaining actions"
                );
                aborted = true;
                break;
            }
        }

        Ok(TriggerOutcome {
            trigger_seq,
            decided_seq,
            applied,
            aborted,
        })
    }

    fn feedback_event(
        &mut self,
        action: &Action,
        outcome: &Result<AppliedOutcome, ApplyError>,
    ) -> Event {
        self.clock = self.clock.tick();
        let ts = self.clock.now();
        let id = action_id(action);

        let mut payload = BTreeMap::new();
        payload.insert("action_id".to_string(), Value::Str(id));
        payload.insert(
            "action_type".to_string(),
            Value::Str(action.action_type.as_str().to_string()),
        );
        payload.insert("target".to_string(), Value::Str(action.target.clone()));

        let (event_type, result_code) = match outcome {
            Ok(ok) => {
                payload.insert("status".to_string(), Value::Str("success".to_string()));
                ("ActionApplied", ok.result_code.clone())
            }
            Err(err) => {
                let mut error = BTreeMap::new();
                error.insert("code".to_string(), Value::Str(err.code.clone()));
                error.insert("type".to_string(), Value::Str(err.kind.clone()));
                payload.insert("error".to_string(), Value::Map(error));
                ("ActionFailed", err.code.clone())
            }
        };
        payload.insert("result_code".to_string(), Value::Str(result_code));

        let mut event = Event::new(event_type, action.target.clone(), ts)
            .with_payload(Value::Map(payload));
        event.meta.source = Some("executor".to_string());
        self.stamp_fencing(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::WorkloadAdapter;
    use crate::handlers::register_handlers;
    use crate::leader::{GateState, LeaderConfig, MemoryLeaseBackend};
    use strand_core::Value;
    use strand_store::{MemoryObjectStore, ObjectLogConfig, ObjectLogStore};

    struct RecordingApplier {
        applied: Vec<String>,
        fail_targets: Vec<String>,
    }

    impl RecordingApplier {
        fn new() -> Self {
            Self {
                applied: Vec::new(),
                fail_targets: Vec::new(),
            }
        }
    }

    impl ActionApplier for RecordingApplier {
        fn apply(&mut self, action: &Action) -> Result<AppliedOutcome, ApplyError> {
            if self.fail_targets.contains(&action.target) {
                return Err(ApplyError {
                    code: "FORBIDDEN".to_string(),
                    kind: "ApiError".to_string(),
                });
            }
            self.applied.push(action.target.clone());
            Ok(AppliedOutcome::ok())
        }
    }

    fn fixture() -> (
        ObjectLogStore<MemoryObjectStore>,
        Reducer,
        Event,
        LogicalClock,
    ) {
        let store = ObjectLogStore::new(MemoryObjectStore::new(), ObjectLogConfig::default());
        let mut reducer = Reducer::new();
        register_handlers(&mut reducer);
        let mut adapter = WorkloadAdapter::new(LogicalClock::default());
        let trigger = adapter
            .observe_workload(
                "alpha",
                "universe",
                &serde_json::json!({"role": "worker", "workspace": {"size": "1Gi"}}),
                None,
            )
            .unwrap();
        (store, reducer, trigger, adapter.clock())
    }

    fn leader_gate(identity: &str, backend: MemoryLeaseBackend) -> LeaderGate<MemoryLeaseBackend> {
        LeaderGate::new(
            backend,
            LeaderConfig {
                identity: identity.to_string(),
                lease_duration_ms: 1000,
                renew_deadline_ms: 600,
                retry_period_ms: 100,
            },
        )
    }

    #[test]
    fn pipeline_appends_trigger_decision_and_feedback() {
        let (mut store, reducer, trigger, clock) = fixture();
        let gate = leader_gate("a", MemoryLeaseBackend::new());
        let mut executor = Executor::new(gate, RecordingApplier::new(), clock);

        let outcome = executor
            .process_observation(&mut store, &reducer, trigger, 0)
            .unwrap();
        assert_eq!(outcome.trigger_seq, 0);
        assert_eq!(outcome.decided_seq, 1);
        assert_eq!(outcome.applied.len(), 4);
        assert!(outcome.applied.iter().all(|(_, ok)| *ok));
        assert!(!outcome.aborted);

        // Log layout: trigger, ActionsDecided, then 4 feedback events.
        let records: Vec<_> = store
            .read(0, None)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(records.len(), 6);
        assert_eq!(records[0].event.event_type, "AgentObserved");
        assert_eq!(records[1].event.event_type, "ActionsDecided");
        assert!(records[2..]
            .iter()
            .all(|r| r.event.event_type == "ActionApplied"));

        // Decision points back at the trigger with its committed hash.
        let decided = &records[1].event.payload;
        assert_eq!(decided.get("trigger_seq").and_then(Value::as_u64), Some(0));
        assert_eq!(
            decided.get("trigger_hash").and_then(Value::as_str),
            Some(records[0].event_hash.as_str())
        );

        // Every append carries the epoch-1 fencing token.
        for record in &records {
            let token = record.event.meta.fencing_token.as_ref().unwrap();
            assert_eq!(token.holder, "a");
            assert_eq!(token.epoch, 1);
        }
    }

    #[test]
    fn non_leader_refuses_to_append() {
        let (mut store, reducer, trigger, clock) = fixture();
        let backend = MemoryLeaseBackend::new();
        let mut other = leader_gate("other", backend.clone());
        assert!(other.ensure_leader(0));

        let gate = leader_gate("b", backend);
        let mut executor = Executor::new(gate, RecordingApplier::new(), clock);
        let err = executor
            .process_observation(&mut store, &reducer, trigger, 10)
            .unwrap_err();
        assert!(matches!(err, ExecutorError::NotLeader));
        assert_eq!(store.tail().unwrap().last_seq, None);
    }

    #[test]
    fn failed_action_logs_action_failed_with_stable_code() {
        let (mut store, reducer, trigger, clock) = fixture();
        let gate = leader_gate("a", MemoryLeaseBackend::new());
        let mut applier = RecordingApplier::new();
        applier.fail_targets.push("universe/alpha-workspace".to_string());
        let mut executor = Executor::new(gate, applier, clock);

        let outcome = executor
            .process_observation(&mut store, &reducer, trigger, 0)
            .unwrap();
        assert!(outcome.applied.iter().any(|(_, ok)| !ok));

        let records: Vec<_> = store
            .read(0, None)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        let failed: Vec<_> = records
            .iter()
            .filter(|r| r.event.event_type == "ActionFailed")
            .collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(
            failed[0].event.payload.get("result_code").and_then(Value::as_str),
            Some("FORBIDDEN")
        );
    }

    #[test]
    fn leadership_loss_mid_flight_aborts_remaining_actions() {
        let (mut store, reducer, trigger, clock) = fixture();
        let backend = MemoryLeaseBackend::new();
        let gate = leader_gate("a", backend.clone());

        struct UsurpingApplier {
            backend: MemoryLeaseBackend,
            count: usize,
        }
        impl ActionApplier for UsurpingApplier {
            fn apply(&mut self, _action: &Action) -> Result<AppliedOutcome, ApplyError> {
                self.count += 1;
                if self.count == 2 {
                    // Another replica takes the lease mid-pipeline.
                    use crate::leader::LeaseBackend;
                    self.backend.clear();
                    let mut usurper = self.backend.clone();
                    usurper.try_acquire("usurper", 0, 1000).unwrap();
                }
                Ok(AppliedOutcome::ok())
            }
        }

        let applier = UsurpingApplier {
            backend: backend.clone(),
            count: 0,
        };
        let mut executor = Executor::new(gate, applier, clock);
        let outcome = executor
            .process_observation(&mut store, &reducer, trigger, 0)
            .unwrap();
        assert!(outcome.aborted);
        assert!(outcome.applied.len() < 4);
        assert!(matches!(
            executor.gate().state(),
            GateState::CoolingDown { .. }
        ));
    }
}
