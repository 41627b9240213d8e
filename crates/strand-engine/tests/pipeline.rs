//! End-to-end scenarios: full observe→decide→apply pipelines, replay
//! determinism at scale, and leader failover continuity.

use strand_core::{Event, LogicalClock, Reducer, Value, ZERO_HASH};
use strand_engine::adapter::WorkloadAdapter;
use strand_engine::decision::{actions_hash, decide, Action};
use strand_engine::executor::{ActionApplier, AppliedOutcome, ApplyError, Executor};
use strand_engine::leader::{GateState, LeaderConfig, LeaderGate, MemoryLeaseBackend};
use strand_engine::replay::replay;
use strand_engine::verify::{build_decision_proof, verify_chain, verify_pointers};
use strand_engine::register_handlers;
use strand_store::{EventStore, MemoryObjectStore, ObjectLogConfig, ObjectLogStore};

struct OkApplier;

impl ActionApplier for OkApplier {
    fn apply(&mut self, _action: &Action) -> Result<AppliedOutcome, ApplyError> {
        Ok(AppliedOutcome::ok())
    }
}

fn operator_reducer() -> Reducer {
    let mut reducer = Reducer::new();
    register_handlers(&mut reducer);
    reducer
}

fn gate(identity: &str, backend: MemoryLeaseBackend) -> LeaderGate<MemoryLeaseBackend> {
    LeaderGate::new(
        backend,
        LeaderConfig {
            identity: identity.to_string(),
            lease_duration_ms: 1_000,
            renew_deadline_ms: 600,
            retry_period_ms: 100,
        },
    )
}

/// The canonical small fixture: one observed workload of role "worker"
/// with workspace size 1Gi. The adapter emits seq 0, the decision lands at
/// seq 1 with a pointer back to the trigger, and the proof extracts
/// cleanly.
#[test]
fn small_fixture_decision_proof() {
    let mut store = ObjectLogStore::new(MemoryObjectStore::new(), ObjectLogConfig::default());
    let reducer = operator_reducer();
    let mut adapter = WorkloadAdapter::new(LogicalClock::default());
    let trigger = adapter
        .observe_workload(
            "alpha",
            "universe",
            &serde_json::json!({"role": "worker", "workspace": {"size": "1Gi"}}),
            None,
        )
        .unwrap();

    let mut executor = Executor::new(
        gate("writer-0", MemoryLeaseBackend::new()),
        OkApplier,
        adapter.clock(),
    );
    let outcome = executor
        .process_observation(&mut store, &reducer, trigger, 0)
        .unwrap();
    assert_eq!(outcome.trigger_seq, 0);
    assert_eq!(outcome.decided_seq, 1);

    let records: Vec<_> = store
        .read(0, None)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(records[0].event.event_type, "AgentObserved");
    let decided = &records[1].event;
    assert_eq!(decided.event_type, "ActionsDecided");
    assert_eq!(
        decided.payload.get("trigger_hash").and_then(Value::as_str),
        Some(records[0].event_hash.as_str())
    );

    // The committed actions hash recomputes from the committed id list,
    // and matches an independent re-decision against the same state.
    let ids: Vec<String> = decided
        .payload
        .get("action_ids")
        .and_then(Value::as_array)
        .unwrap()
        .iter()
        .filter_map(Value::as_str)
        .map(String::from)
        .collect();
    assert_eq!(ids.len(), 4);
    assert_eq!(
        decided.payload.get("actions_hash").and_then(Value::as_str),
        Some(actions_hash(&ids).as_str())
    );
    let state = replay(&store, &reducer, Some(0)).unwrap().state;
    let redecided = decide(&state, &records[0]).unwrap();
    assert_eq!(redecided.meta.action_ids, ids);

    let proof = build_decision_proof(&store, Some(0), None, None)
        .unwrap()
        .expect("proof present");
    assert!(proof.valid, "{:?}", proof.errors);
    assert_eq!(proof.trigger_seq, 0);
}

/// 1000 mixed events (250 of each of four types), replayed 100 times:
/// one distinct state hash.
#[test]
fn replay_determinism_over_1000_events() {
    let mut store = ObjectLogStore::new(MemoryObjectStore::new(), ObjectLogConfig::default());
    let types = ["AgentObserved", "ActionsDecided", "ActionApplied", "ActionFailed"];
    let mut prev = ZERO_HASH.to_string();
    for seq in 0..1000u64 {
        let event_type = types[(seq % 4) as usize];
        let payload = format!(
            r#"{{"name":"agent-{m}","namespace":"universe","spec_hash":"h{m}","action_id":"aid-{m}","agent_id":"agent-{m}"}}"#,
            m = seq % 5
        );
        let event = Event::new(event_type, format!("agent-{}", seq % 5), seq)
            .with_payload(Value::from_json_str(&payload).unwrap());
        prev = store.append(event, &prev).unwrap().event_hash;
    }

    let reducer = operator_reducer();
    let reference = replay(&store, &reducer, None).unwrap();
    assert_eq!(reference.applied, 1000);
    assert_eq!(reference.state.version(), 1000);

    let reference_hash = reference.state.state_hash();
    for _ in 0..100 {
        assert_eq!(
            replay(&store, &reducer, None).unwrap().state.state_hash(),
            reference_hash
        );
    }
}

/// Leader failover: after the active leader stops renewing, a successor
/// takes over within one lease duration and the combined log still
/// chain-verifies with no gaps and no duplicates, with fencing tokens
/// attributing each event to its epoch.
#[test]
fn leader_failover_continuity() {
    let bucket = MemoryObjectStore::new();
    let lease = MemoryLeaseBackend::new();
    let reducer = operator_reducer();

    let mut adapter = WorkloadAdapter::new(LogicalClock::default());
    let first_trigger = adapter
        .observe_workload("alpha", "universe", &serde_json::json!({}), None)
        .unwrap();

    // Replica A leads and processes the first observation.
    let mut store_a = ObjectLogStore::new(bucket.clone(), ObjectLogConfig::default());
    let mut exec_a = Executor::new(gate("replica-a", lease.clone()), OkApplier, adapter.clock());
    exec_a
        .process_observation(&mut store_a, &reducer, first_trigger, 0)
        .unwrap();

    // A stops renewing; replicas B and C compete after expiry. Exactly
    // one of them wins, within one lease duration of the expiry point.
    let mut gate_b = gate("replica-b", lease.clone());
    let mut gate_c = gate("replica-c", lease.clone());
    assert!(!gate_b.ensure_leader(500));
    assert!(!gate_c.ensure_leader(501));
    let b_leads = gate_b.ensure_leader(2_100);
    let c_leads = gate_c.ensure_leader(2_101);
    assert!(b_leads ^ c_leads, "exactly one successor must lead");

    let (winner_gate, winner_id) = if b_leads {
        (gate_b, "replica-b")
    } else {
        (gate_c, "replica-c")
    };
    assert_eq!(winner_gate.fencing_token().unwrap().epoch, 2);

    // The successor continues the log from the committed tail.
    let second_trigger = adapter
        .observe_workload("beta", "universe", &serde_json::json!({}), None)
        .unwrap();
    let mut store_w = ObjectLogStore::new(bucket, ObjectLogConfig::default());
    let mut exec_w = Executor::new(winner_gate, OkApplier, adapter.clock());
    let outcome = exec_w
        .process_observation(&mut store_w, &reducer, second_trigger, 2_200)
        .unwrap();
    assert!(outcome.trigger_seq > 0);

    // Full-chain verification over the combined log.
    let chain = verify_chain(&store_w).unwrap();
    assert!(chain.valid, "{chain:?}");
    let pointers = verify_pointers(&store_w).unwrap();
    assert!(pointers.valid, "{pointers:?}");

    // Forensics: epoch 1 events belong to A, epoch 2 to the successor.
    let records: Vec<_> = store_w
        .read(0, None)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    for record in &records {
        let token = record.event.meta.fencing_token.as_ref().unwrap();
        match token.epoch {
            1 => assert_eq!(token.holder, "replica-a"),
            2 => assert_eq!(token.holder, winner_id),
            other => panic!("unexpected epoch {other}"),
        }
    }

    // Old leader is fenced out: its gate refuses further work.
    assert!(!exec_a.gate().pre_action_check(2_300));
    assert!(matches!(
        exec_a.gate().state(),
        GateState::CoolingDown { .. } | GateState::Follower
    ));
}

/// Same spec observed twice yields the same spec_hash and the same
/// decided action ids, regardless of which replica decides.
#[test]
fn decisions_are_replica_independent() {
    let reducer = operator_reducer();
    let spec = serde_json::json!({"role": "Manager", "image": {"repository": "r"}});

    let run = |writer: &str| {
        let mut store =
            ObjectLogStore::new(MemoryObjectStore::new(), ObjectLogConfig::default());
        let mut adapter = WorkloadAdapter::new(LogicalClock::default());
        let trigger = adapter
            .observe_workload("gamma", "universe", &spec, None)
            .unwrap();
        let mut executor = Executor::new(
            gate(writer, MemoryLeaseBackend::new()),
            OkApplier,
            adapter.clock(),
        );
        executor
            .process_observation(&mut store, &reducer, trigger, 0)
            .unwrap();
        let records: Vec<_> = store
            .read(0, None)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        records[1]
            .event
            .payload
            .get("actions_hash")
            .and_then(Value::as_str)
            .unwrap()
            .to_string()
    };

    // Writer identity lives in meta/fencing, not in the decision content.
    assert_eq!(run("replica-a"), run("replica-b"));
}
