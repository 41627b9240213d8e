//! Deterministic kernel for the strand execution engine.
//!
//! Everything in this crate is pure: canonical serialization, the logical
//! clock, stable identifiers, the event/state containers, the reducer
//! registry, and the hash chain. No I/O, no wall clock, no randomness.

pub mod canonical;
pub mod chain;
pub mod clock;
pub mod event;
pub mod ids;
pub mod reducer;
pub mod state;

pub use canonical::{sha256_hex, to_canonical_bytes, to_canonical_string, CanonicalError, Value};
pub use chain::{chain_record, hash_event, verify_link, ChainError, ChainRecord, ZERO_HASH};
pub use clock::LogicalClock;
pub use event::{Event, EventMeta, FencingToken, HashVersion};
pub use ids::stable_id;
pub use reducer::{Reducer, ReducerError};
pub use state::State;
