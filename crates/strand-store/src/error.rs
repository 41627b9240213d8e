//! Store error taxonomy.
//!
//! The kinds are the stable contract: `Integrity` is fatal for the
//! affected read and never auto-repaired, `Conflict` is the normal
//! lost-race outcome, `Backend` carries a transport discriminator so
//! callers and alerts can tell credentials drift from a missing bucket
//! from transient network trouble.

use std::io;
use std::path::PathBuf;

use strand_core::{ChainError, event::EventError};
use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

/// Transport-layer failure against the backing store, classified on
/// surface and propagated unchanged through every layer above.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("access denied: {detail}")]
    AccessDenied { detail: String },
    #[error("precondition failed: {detail}")]
    PreconditionFailed { detail: String },
    #[error("bucket `{bucket}` does not exist")]
    NoSuchBucket { bucket: String },
    #[error("network failure: {detail}")]
    Network { detail: String },
    #[error("i/o failure{}", path.as_ref().map(|p| format!(" at {}", p.display())).unwrap_or_default())]
    Io {
        path: Option<PathBuf>,
        #[source]
        source: io::Error,
    },
}

impl BackendError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        BackendError::Io {
            path: Some(path.into()),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// Chain link mismatch, gap, duplicate seq, or malformed record. The
    /// log is considered corrupt; operator intervention required.
    #[error("log integrity violation{}: {reason}", seq.map(|s| format!(" at seq {s}")).unwrap_or_default())]
    Integrity { seq: Option<u64>, reason: String },

    /// Conditional append lost: another writer advanced the log.
    #[error("append conflict: log advanced past expected tail (observed {observed_prev_hash})")]
    Conflict { observed_prev_hash: String },

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("malformed event: {0}")]
    MalformedEvent(String),

    #[error("append retries exhausted after {attempts} conflicts")]
    RetryExhausted { attempts: u32 },

    #[error("append deadline expired before the log could be appended")]
    RetryTimeout,
}

impl StoreError {
    pub fn integrity(seq: Option<u64>, reason: impl Into<String>) -> Self {
        StoreError::Integrity {
            seq,
            reason: reason.into(),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

impl From<ChainError> for StoreError {
    fn from(err: ChainError) -> Self {
        let seq = match &err {
            ChainError::PrevHashMismatch { seq, .. } => Some(*seq),
            ChainError::EventHashMismatch { seq, .. } => Some(*seq),
            ChainError::MalformedRecord(_) => None,
        };
        StoreError::Integrity {
            seq,
            reason: err.to_string(),
        }
    }
}

impl From<EventError> for StoreError {
    fn from(err: EventError) -> Self {
        StoreError::MalformedEvent(err.to_string())
    }
}
