//! Replay runner: fold the reducer over the log to reconstruct state.

use strand_core::{Event, Reducer, ReducerError, State};
use strand_store::{EventStore, StoreError};
use thiserror::Error;

use crate::checkpoint::VerifiedCheckpoint;

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Reducer(#[from] ReducerError),
}

#[derive(Debug, Clone)]
pub struct ReplayOutcome {
    pub state: State,
    pub applied: u64,
}

/// Fold events `[0, to_seq]` (inclusive; `None` = whole log) through the
/// reducer. Integrity failures from the store propagate unchanged.
pub fn replay(
    store: &dyn EventStore,
    reducer: &Reducer,
    to_seq: Option<u64>,
) -> Result<ReplayOutcome, ReplayError> {
    let mut state = State::new();
    let mut applied = 0u64;
    for record in store.read(0, to_seq)? {
        let record = record?;
        state = reducer.apply(&state, &record.event)?;
        applied += 1;
    }
    Ok(ReplayOutcome { state, applied })
}

/// Resume from a verified checkpoint: start at its embedded state and fold
/// only the events strictly after `at_seq`.
pub fn replay_from_checkpoint(
    store: &dyn EventStore,
    reducer: &Reducer,
    checkpoint: &VerifiedCheckpoint,
    to_seq: Option<u64>,
) -> Result<ReplayOutcome, ReplayError> {
    let mut state = checkpoint.state.clone();
    let mut applied = 0u64;
    for record in store.read(checkpoint.checkpoint.at_seq + 1, to_seq)? {
        let record = record?;
        state = reducer.apply(&state, &record.event)?;
        applied += 1;
    }
    Ok(ReplayOutcome { state, applied })
}

/// One aggregate-level difference between two states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateDiff {
    Added {
        namespace: String,
        id: String,
        post_hash: String,
    },
    Removed {
        namespace: String,
        id: String,
        pre_hash: String,
    },
    Changed {
        namespace: String,
        id: String,
        pre_hash: String,
        post_hash: String,
    },
}

fn aggregate_hash(value: &strand_core::Value) -> String {
    strand_core::sha256_hex(&strand_core::to_canonical_bytes(value))
}

/// Field-by-field comparison of two states' aggregate maps.
pub fn diff_states(pre: &State, post: &State) -> Vec<StateDiff> {
    let mut diffs = Vec::new();
    let mut namespaces: Vec<&String> = pre.namespaces().map(|(ns, _)| ns).collect();
    for (ns, _) in post.namespaces() {
        if !namespaces.contains(&ns) {
            namespaces.push(ns);
        }
    }
    namespaces.sort();

    for ns in namespaces {
        let empty = std::collections::BTreeMap::new();
        let before = pre.namespace(ns).unwrap_or(&empty);
        let after = post.namespace(ns).unwrap_or(&empty);
        for (id, value) in before {
            match after.get(id) {
                None => diffs.push(StateDiff::Removed {
                    namespace: ns.clone(),
                    id: id.clone(),
                    pre_hash: aggregate_hash(value),
                }),
                Some(next) if next != value => diffs.push(StateDiff::Changed {
                    namespace: ns.clone(),
                    id: id.clone(),
                    pre_hash: aggregate_hash(value),
                    post_hash: aggregate_hash(next),
                }),
                Some(_) => {}
            }
        }
        for (id, value) in after {
            if !before.contains_key(id) {
                diffs.push(StateDiff::Added {
                    namespace: ns.clone(),
                    id: id.clone(),
                    post_hash: aggregate_hash(value),
                });
            }
        }
    }
    diffs
}

/// One row of a replay trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceRow {
    pub seq: u64,
    pub event_type: String,
    pub aggregate_id: String,
    pub pre_hash: String,
    pub post_hash: String,
}

/// Per-event state-hash trace of a replay, for audit tooling.
pub fn trace(
    store: &dyn EventStore,
    reducer: &Reducer,
    to_seq: Option<u64>,
) -> Result<Vec<TraceRow>, ReplayError> {
    let mut rows = Vec::new();
    let mut state = State::new();
    for record in store.read(0, to_seq)? {
        let record = record?;
        let event: &Event = &record.event;
        let pre_hash = state.state_hash();
        state = reducer.apply(&state, event)?;
        rows.push(TraceRow {
            seq: event.seq.unwrap_or(0),
            event_type: event.event_type.clone(),
            aggregate_id: event.aggregate_id.clone(),
            pre_hash,
            post_hash: state.state_hash(),
        });
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::register_handlers;
    use strand_core::{Value, ZERO_HASH};
    use strand_store::{MemoryObjectStore, ObjectLogConfig, ObjectLogStore};

    fn reducer() -> Reducer {
        let mut r = Reducer::new();
        register_handlers(&mut r);
        r
    }

    fn seeded_store(n: u64) -> ObjectLogStore<MemoryObjectStore> {
        let mut store = ObjectLogStore::new(MemoryObjectStore::new(), ObjectLogConfig::default());
        let types = ["AgentObserved", "ActionsDecided", "ActionApplied", "Custom"];
        let mut prev = ZERO_HASH.to_string();
        for seq in 0..n {
            let event_type = types[(seq % 4) as usize];
            let event = strand_core::Event::new(event_type, format!("agg-{}", seq % 7), seq)
                .with_payload(
                    Value::from_json_str(&format!(r#"{{"n":{seq},"name":"a","namespace":"u"}}"#))
                        .unwrap(),
                );
            prev = store.append(event, &prev).unwrap().event_hash;
        }
        store
    }

    #[test]
    fn replay_applies_every_event() {
        let store = seeded_store(40);
        let outcome = replay(&store, &reducer(), None).unwrap();
        assert_eq!(outcome.applied, 40);
        assert_eq!(outcome.state.version(), 40);
    }

    #[test]
    fn replay_is_deterministic_over_repeats() {
        let store = seeded_store(100);
        let r = reducer();
        let reference = replay(&store, &r, None).unwrap().state.state_hash();
        for _ in 0..100 {
            assert_eq!(replay(&store, &r, None).unwrap().state.state_hash(), reference);
        }
    }

    #[test]
    fn partial_replay_equals_prefix_replay() {
        let store = seeded_store(30);
        let r = reducer();
        for k in [0u64, 1, 7, 15, 29] {
            let partial = replay(&store, &r, Some(k)).unwrap();
            assert_eq!(partial.applied, k + 1);
            assert_eq!(partial.state.version(), k + 1);
        }
        let full = replay(&store, &r, Some(29)).unwrap();
        let unbounded = replay(&store, &r, None).unwrap();
        assert_eq!(full.state.state_hash(), unbounded.state.state_hash());
    }

    #[test]
    fn trace_rows_link_pre_and_post_hashes() {
        let store = seeded_store(10);
        let rows = trace(&store, &reducer(), None).unwrap();
        assert_eq!(rows.len(), 10);
        for pair in rows.windows(2) {
            assert_eq!(pair[0].post_hash, pair[1].pre_hash);
        }
    }

    #[test]
    fn diff_reports_added_and_changed() {
        let pre = State::new().set_aggregate("agents", "a", Value::from("one"));
        let post = pre
            .set_aggregate("agents", "a", Value::from("two"))
            .set_aggregate("agents", "b", Value::from("new"));
        let diffs = diff_states(&pre, &post);
        assert_eq!(diffs.len(), 2);
        assert!(diffs.iter().any(|d| matches!(d, StateDiff::Changed { id, .. } if id == "a")));
        assert!(diffs.iter().any(|d| matches!(d, StateDiff::Added { id, .. } if id == "b")));
    }
}
