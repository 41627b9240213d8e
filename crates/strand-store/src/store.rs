//! Abstract event-store contract: CAS append, validating reads, tail.

use std::time::{Duration, Instant};

use rand::Rng;
use strand_core::{ChainRecord, Event, HashVersion, ZERO_HASH};

use crate::error::{StoreError, StoreResult};

/// Current end of the log: `(last_seq, last_event_hash)`. An empty log
/// reports `(None, ZERO_HASH)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogHead {
    pub last_seq: Option<u64>,
    pub last_hash: String,
}

impl LogHead {
    pub fn empty() -> Self {
        Self {
            last_seq: None,
            last_hash: ZERO_HASH.to_string(),
        }
    }

    pub fn next_seq(&self) -> u64 {
        self.last_seq.map_or(0, |seq| seq + 1)
    }
}

impl Default for LogHead {
    fn default() -> Self {
        Self::empty()
    }
}

/// Per-store append options: the hash version stamped on new events and
/// the writer identity embedded in their meta.
#[derive(Debug, Clone, Default)]
pub struct StoreOptions {
    pub hash_version: HashVersion,
    pub writer_id: Option<String>,
}

impl StoreOptions {
    /// Stamp store-owned fields onto an outgoing event. The configured
    /// hash version always wins; writer identity fills in only when the
    /// producer left it empty.
    pub fn stamp(&self, mut event: Event) -> Event {
        event.hash_version = self.hash_version;
        if event.meta.writer_id.is_none() {
            event.meta.writer_id = self.writer_id.clone();
        }
        event
    }
}

/// Bounded retry with exponential backoff and jitter for `append_with_retry`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub jitter_cap: Duration,
    pub deadline: Option<Instant>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_millis(50),
            jitter_cap: Duration::from_millis(100),
            deadline: None,
        }
    }
}

impl RetryPolicy {
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        let base = self.base_backoff.saturating_mul(1u32 << attempt.min(16));
        let jitter_ms = if self.jitter_cap.is_zero() {
            0
        } else {
            rand::rng().random_range(0..=self.jitter_cap.as_millis() as u64)
        };
        base.saturating_add(Duration::from_millis(jitter_ms))
    }
}

pub type RecordIter<'a> = Box<dyn Iterator<Item = StoreResult<ChainRecord>> + 'a>;

/// Append-only, hash-chained event log.
///
/// Implementations guarantee conditional-create semantics on `append`,
/// chain validation on `read`, and an O(1)-amortized `tail` backed by a
/// cached head indicator that may be rebuilt from the backing store.
pub trait EventStore {
    /// Atomic CAS append. Assigns the next seq, computes the chain record,
    /// and persists it only if the log tail still matches
    /// `expected_prev_hash`. `Conflict` when another writer advanced the
    /// log, `Integrity` when the store-side state is inconsistent.
    fn append(&mut self, event: Event, expected_prev_hash: &str) -> StoreResult<ChainRecord>;

    /// Ordered, chain-validating scan of `[from_seq, to_seq]` (inclusive;
    /// `None` = to end). Cancellable between records.
    fn read(&self, from_seq: u64, to_seq: Option<u64>) -> StoreResult<RecordIter<'_>>;

    /// Current `(last_seq, last_event_hash)`.
    fn tail(&self) -> StoreResult<LogHead>;

    /// `event_hash` of the record at `seq`, if present.
    fn event_hash_at(&self, seq: u64) -> StoreResult<Option<String>>;

    /// Composite append: read the tail, use it as the CAS precondition, and
    /// on `Conflict` refresh and retry with backoff and jitter up to the
    /// policy cap or deadline. Never mutates the log on failure.
    fn append_with_retry(
        &mut self,
        event: Event,
        policy: &RetryPolicy,
    ) -> StoreResult<ChainRecord> {
        let mut attempt = 0u32;
        loop {
            if let Some(deadline) = policy.deadline {
                if Instant::now() >= deadline {
                    return Err(StoreError::RetryTimeout);
                }
            }
            let head = self.tail()?;
            match self.append(event.clone(), &head.last_hash) {
                Ok(record) => return Ok(record),
                Err(err) if err.is_conflict() => {
                    attempt += 1;
                    if attempt >= policy.max_attempts {
                        return Err(StoreError::RetryExhausted { attempts: attempt });
                    }
                    let delay = policy.backoff_for(attempt - 1);
                    if let Some(deadline) = policy.deadline {
                        if Instant::now() + delay >= deadline {
                            return Err(StoreError::RetryTimeout);
                        }
                    }
                    tracing::debug!(attempt, ?delay, "append conflict, backing off");
                    std::thread::sleep(delay);
                }
                Err(other) => return Err(other),
            }
        }
    }
}

/// Chain/contiguity validation shared by backends while streaming records.
#[derive(Debug)]
pub(crate) struct ChainCursor {
    prev_hash: String,
    next_seq: u64,
}

impl ChainCursor {
    pub(crate) fn new() -> Self {
        Self {
            prev_hash: ZERO_HASH.to_string(),
            next_seq: 0,
        }
    }

    /// Validate the next record in order and advance.
    pub(crate) fn admit(&mut self, record: &ChainRecord) -> StoreResult<()> {
        let seq = record.seq()?;
        if seq < self.next_seq {
            return Err(StoreError::integrity(
                Some(seq),
                format!("duplicate seq {seq} (expected {})", self.next_seq),
            ));
        }
        if seq > self.next_seq {
            return Err(StoreError::integrity(
                Some(seq),
                format!("gap in seq: expected {}, found {seq}", self.next_seq),
            ));
        }
        strand_core::verify_link(&self.prev_hash, record)?;
        self.prev_hash = record.event_hash.clone();
        self.next_seq = seq + 1;
        Ok(())
    }
}
