//! Pure reducer registry: `(state, event) -> state`, keyed by event type.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;

use crate::event::Event;
use crate::state::State;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReducerError {
    #[error("malformed event at seq {seq:?}: {reason}")]
    MalformedEvent { seq: Option<u64>, reason: String },
    #[error("handler for `{event_type}` failed at seq {seq}: {reason}")]
    HandlerFailed {
        event_type: String,
        seq: u64,
        reason: String,
    },
}

/// Pure transition: may call `State::set_aggregate` any number of times,
/// must not touch I/O, clocks, randomness, or process state.
pub type Handler = Arc<dyn Fn(&State, &Event) -> Result<State, ReducerError> + Send + Sync>;

/// Registry mapping event type strings to pure handlers.
///
/// An unknown event type is a no-op that still advances `version`, so a
/// reader built against an older handler set replays a newer log to a
/// consistent version count. Malformed events are fatal; the reducer never
/// attempts recovery.
#[derive(Clone, Default)]
pub struct Reducer {
    handlers: BTreeMap<String, Handler>,
}

impl Reducer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, event_type: impl Into<String>, handler: F)
    where
        F: Fn(&State, &Event) -> Result<State, ReducerError> + Send + Sync + 'static,
    {
        self.handlers.insert(event_type.into(), Arc::new(handler));
    }

    pub fn handles(&self, event_type: &str) -> bool {
        self.handlers.contains_key(event_type)
    }

    /// Fold one event. The returned state's version is always exactly
    /// `state.version() + 1`.
    pub fn apply(&self, state: &State, event: &Event) -> Result<State, ReducerError> {
        if event.event_type.is_empty() {
            return Err(ReducerError::MalformedEvent {
                seq: event.seq,
                reason: "empty event type".to_string(),
            });
        }
        let seq = event.seq.ok_or_else(|| ReducerError::MalformedEvent {
            seq: None,
            reason: "seq unassigned".to_string(),
        })?;

        let next = match self.handlers.get(&event.event_type) {
            Some(handler) => {
                let out = handler(state, event)?;
                if out.version() != state.version() {
                    return Err(ReducerError::HandlerFailed {
                        event_type: event.event_type.clone(),
                        seq,
                        reason: "handler must not change state version".to_string(),
                    });
                }
                out
            }
            None => state.clone(),
        };
        Ok(next.bump_version())
    }
}

impl std::fmt::Debug for Reducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reducer")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
