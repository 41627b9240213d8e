//! Operator core over the strand event log.
//!
//! Observations enter through the adapter, the decision layer turns state
//! plus trigger into an ordered action set, the executor applies actions
//! under the leader gate, and everything is committed to the hash-chained
//! log so that verification consumers can re-run replay and decisions and
//! compare hashes to the stored commitments.

pub mod adapter;
pub mod audit;
pub mod checkpoint;
pub mod decision;
pub mod executor;
pub mod handlers;
pub mod leader;
pub mod query;
pub mod replay;
pub mod verify;

pub use adapter::{AdapterError, WorkloadAdapter};
pub use checkpoint::{
    Checkpoint, CheckpointError, CheckpointStore, SigningKey, VerifiedCheckpoint, VerifyingKey,
};
pub use decision::{action_id, decide, Action, ActionType, Decision, DecisionError, DecisionMeta};
pub use executor::{ActionApplier, AppliedOutcome, ApplyError, Executor, ExecutorError};
pub use handlers::register_handlers;
pub use leader::{
    FileLeaseBackend, GateState, LeaderConfig, LeaderError, LeaderGate, Lease, LeaseBackend,
    MemoryLeaseBackend,
};
pub use replay::{diff_states, replay, replay_from_checkpoint, trace, ReplayError, ReplayOutcome};
pub use verify::{build_decision_proof, verify_chain, verify_pointers, ChainReport, PointerReport};
