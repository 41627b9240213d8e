//! Leader gate: single-writer discipline over a coordination lease.
//!
//! The gate reduces the probability of two writers racing; it does not
//! claim to prevent it. The store's conditional append is the authoritative
//! protection, and the fencing token embedded in event meta lets a
//! post-mortem attribute every event to a leadership epoch.
//!
//! Time enters through explicit millisecond arguments so the state machine
//! is deterministic under test; production callers pass a monotonic
//! milliseconds reading.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use strand_core::{FencingToken, Value};
use strand_store::BackendError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LeaderError {
    #[error("lease held by `{holder}`")]
    NotHolder { holder: String },
    #[error("lease record is corrupt: {reason}")]
    Corrupt { reason: String },
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Lease record in the coordination store. `epoch` increments on every
/// holder change and is the resource-version half of the fencing token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub holder: String,
    pub epoch: u64,
    pub acquired_at_ms: u64,
    pub renewed_at_ms: u64,
    pub duration_ms: u64,
}

impl Lease {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.renewed_at_ms) > self.duration_ms
    }

    fn to_value(&self) -> Value {
        let mut m = BTreeMap::new();
        m.insert("holder".to_string(), Value::Str(self.holder.clone()));
        m.insert("epoch".to_string(), Value::Uint(self.epoch));
        m.insert("acquired_at_ms".to_string(), Value::Uint(self.acquired_at_ms));
        m.insert("renewed_at_ms".to_string(), Value::Uint(self.renewed_at_ms));
        m.insert("duration_ms".to_string(), Value::Uint(self.duration_ms));
        Value::Map(m)
    }

    fn from_value(value: &Value) -> Result<Self, LeaderError> {
        let get_str = |field: &str| {
            value
                .get(field)
                .and_then(Value::as_str)
                .map(String::from)
                .ok_or_else(|| LeaderError::Corrupt {
                    reason: format!("missing field {field}"),
                })
        };
        let get_u64 = |field: &str| {
            value
                .get(field)
                .and_then(Value::as_u64)
                .ok_or_else(|| LeaderError::Corrupt {
                    reason: format!("missing field {field}"),
                })
        };
        Ok(Lease {
            holder: get_str("holder")?,
            epoch: get_u64("epoch")?,
            acquired_at_ms: get_u64("acquired_at_ms")?,
            renewed_at_ms: get_u64("renewed_at_ms")?,
            duration_ms: get_u64("duration_ms")?,
        })
    }
}

/// Coordination-store lease operations. The platform's Lease API plugs in
/// behind this in production; the crate ships file and in-memory backends.
pub trait LeaseBackend {
    fn read(&self) -> Result<Option<Lease>, LeaderError>;

    /// Acquire a free or expired lease, or renew one already held by
    /// `identity`. Fails with `NotHolder` while another holder's lease is
    /// live.
    fn try_acquire(
        &mut self,
        identity: &str,
        now_ms: u64,
        duration_ms: u64,
    ) -> Result<Lease, LeaderError>;

    /// Renew a lease currently held by `identity`.
    fn renew(&mut self, identity: &str, now_ms: u64, duration_ms: u64)
        -> Result<Lease, LeaderError>;
}

/// In-memory lease store; clones share state, which is how multi-replica
/// failover tests wire three gates to one lease.
#[derive(Debug, Clone, Default)]
pub struct MemoryLeaseBackend {
    lease: Arc<Mutex<Option<Lease>>>,
}

impl MemoryLeaseBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the current lease, as a cluster operator would delete the
    /// lease object to force failover.
    pub fn clear(&self) {
        *self.lease.lock().expect("lease lock poisoned") = None;
    }
}

impl LeaseBackend for MemoryLeaseBackend {
    fn read(&self) -> Result<Option<Lease>, LeaderError> {
        Ok(self.lease.lock().expect("lease lock poisoned").clone())
    }

    fn try_acquire(
        &mut self,
        identity: &str,
        now_ms: u64,
        duration_ms: u64,
    ) -> Result<Lease, LeaderError> {
        let mut slot = self.lease.lock().expect("lease lock poisoned");
        let lease = match slot.take() {
            None => Lease {
                holder: identity.to_string(),
                epoch: 1,
                acquired_at_ms: now_ms,
                renewed_at_ms: now_ms,
                duration_ms,
            },
            Some(current) if current.holder == identity => Lease {
                renewed_at_ms: now_ms,
                duration_ms,
                ..current
            },
            Some(current) if current.is_expired(now_ms) => Lease {
                holder: identity.to_string(),
                epoch: current.epoch + 1,
                acquired_at_ms: now_ms,
                renewed_at_ms: now_ms,
                duration_ms,
            },
            Some(current) => {
                let holder = current.holder.clone();
                *slot = Some(current);
                return Err(LeaderError::NotHolder { holder });
            }
        };
        *slot = Some(lease.clone());
        Ok(lease)
    }

    fn renew(
        &mut self,
        identity: &str,
        now_ms: u64,
        duration_ms: u64,
    ) -> Result<Lease, LeaderError> {
        let mut slot = self.lease.lock().expect("lease lock poisoned");
        match slot.take() {
            Some(current) if current.holder == identity => {
                let lease = Lease {
                    renewed_at_ms: now_ms,
                    duration_ms,
                    ..current
                };
                *slot = Some(lease.clone());
                Ok(lease)
            }
            Some(current) => {
                let holder = current.holder.clone();
                *slot = Some(current);
                Err(LeaderError::NotHolder { holder })
            }
            None => Err(LeaderError::NotHolder {
                holder: String::new(),
            }),
        }
    }
}

/// File-backed lease: one canonical JSON record, replaced atomically.
#[derive(Debug, Clone)]
pub struct FileLeaseBackend {
    path: PathBuf,
}

impl FileLeaseBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn write(&self, lease: &Lease) -> Result<(), LeaderError> {
        let dir = self
            .path
            .parent()
            .ok_or_else(|| LeaderError::Corrupt {
                reason: "lease path has no parent directory".to_string(),
            })?;
        fs::create_dir_all(dir).map_err(|source| BackendError::io(dir, source))?;
        let temp = tempfile::NamedTempFile::new_in(dir)
            .map_err(|source| BackendError::io(dir, source))?;
        fs::write(
            temp.path(),
            strand_core::to_canonical_bytes(&lease.to_value()),
        )
        .map_err(|source| BackendError::io(temp.path(), source))?;
        temp.persist(&self.path)
            .map_err(|e| BackendError::io(&self.path, e.error))?;
        Ok(())
    }
}

impl LeaseBackend for FileLeaseBackend {
    fn read(&self) -> Result<Option<Lease>, LeaderError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(BackendError::io(&self.path, source).into()),
        };
        let value = Value::from_json_str(&raw).map_err(|e| LeaderError::Corrupt {
            reason: e.to_string(),
        })?;
        Lease::from_value(&value).map(Some)
    }

    fn try_acquire(
        &mut self,
        identity: &str,
        now_ms: u64,
        duration_ms: u64,
    ) -> Result<Lease, LeaderError> {
        let lease = match self.read()? {
            None => Lease {
                holder: identity.to_string(),
                epoch: 1,
                acquired_at_ms: now_ms,
                renewed_at_ms: now_ms,
                duration_ms,
            },
            Some(current) if current.holder == identity => Lease {
                renewed_at_ms: now_ms,
                duration_ms,
                ..current
            },
            Some(current) if current.is_expired(now_ms) => Lease {
                holder: identity.to_string(),
                epoch: current.epoch + 1,
                acquired_at_ms: now_ms,
                renewed_at_ms: now_ms,
                duration_ms,
            },
            Some(current) => {
                return Err(LeaderError::NotHolder {
                    holder: current.holder,
                });
            }
        };
        self.write(&lease)?;
        Ok(lease)
    }

    fn renew(
        &mut self,
        identity: &str,
        now_ms: u64,
        duration_ms: u64,
    ) -> Result<Lease, LeaderError> {
        match self.read()? {
            Some(current) if current.holder == identity => {
                let lease = Lease {
                    renewed_at_ms: now_ms,
                    duration_ms,
                    ..current
                };
                self.write(&lease)?;
                Ok(lease)
            }
            Some(current) => Err(LeaderError::NotHolder {
                holder: current.holder,
            }),
            None => Err(LeaderError::NotHolder {
                holder: String::new(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Follower,
    Leader,
    /// Side effects and appends suppressed until the embedded deadline, one
    /// full lease duration after loss, to shrink the overlap window with
    /// the successor.
    CoolingDown { until_ms: u64 },
}

#[derive(Debug, Clone)]
pub struct LeaderConfig {
    pub identity: String,
    pub lease_duration_ms: u64,
    pub renew_deadline_ms: u64,
    pub retry_period_ms: u64,
}

impl LeaderConfig {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            lease_duration_ms: 30_000,
            renew_deadline_ms: 20_000,
            retry_period_ms: 5_000,
        }
    }
}

/// Per-replica gate state machine:
/// `Follower → Leader → (renew failure | takeover) → CoolingDown → Follower`.
pub struct LeaderGate<B: LeaseBackend> {
    backend: B,
    config: LeaderConfig,
    state: GateState,
    lease: Option<Lease>,
    last_check_ms: Option<u64>,
}

impl<B: LeaseBackend> LeaderGate<B> {
    pub fn new(backend: B, config: LeaderConfig) -> Self {
        Self {
            backend,
            config,
            state: GateState::Follower,
            lease: None,
            last_check_ms: None,
        }
    }

    pub fn state(&self) -> GateState {
        self.state
    }

    pub fn identity(&self) -> &str {
        &self.config.identity
    }

    /// Forensic token for the current epoch; `None` while not leading.
    pub fn fencing_token(&self) -> Option<FencingToken> {
        match self.state {
            GateState::Leader => self
                .lease
                .as_ref()
                .map(|lease| FencingToken::new(self.config.identity.clone(), lease.epoch)),
            _ => None,
        }
    }

    fn enter_cooldown(&mut self, now_ms: u64, reason: &str) {
        tracing::warn!(
            identity = %self.config.identity,
            reason,
            "leadership lost, cooling down"
        );
        self.state = GateState::CoolingDown {
            until_ms: now_ms + self.config.lease_duration_ms,
        };
        self.lease = None;
    }

    /// Drive the state machine and report whether this replica may act.
    pub fn ensure_leader(&mut self, now_ms: u64) -> bool {
        match self.state {
            GateState::CoolingDown { until_ms } => {
                if now_ms < until_ms {
                    return false;
                }
                self.state = GateState::Follower;
                self.attempt_acquire(now_ms)
            }
            GateState::Follower => self.attempt_acquire(now_ms),
            GateState::Leader => {
                // Rate-limit backend reads while comfortably inside the
                // renew deadline.
                let since_renew = self
                    .lease
                    .as_ref()
                    .map(|l| now_ms.saturating_sub(l.renewed_at_ms))
                    .unwrap_or(u64::MAX);
                if since_renew < self.config.retry_period_ms {
                    return true;
                }
                if since_renew >= self.config.renew_deadline_ms {
                    return self.attempt_renew(now_ms);
                }
                if self
                    .last_check_ms
                    .is_some_and(|last| now_ms.saturating_sub(last) < self.config.retry_period_ms)
                {
                    return true;
                }
                self.attempt_renew(now_ms)
            }
        }
    }

    fn attempt_acquire(&mut self, now_ms: u64) -> bool {
        self.last_check_ms = Some(now_ms);
        match self.backend.try_acquire(
            &self.config.identity,
            now_ms,
            self.config.lease_duration_ms,
        ) {
            Ok(lease) => {
                tracing::debug!(identity = %self.config.identity, epoch = lease.epoch, "lease held");
                self.lease = Some(lease);
                self.state = GateState::Leader;
                true
            }
            Err(LeaderError::NotHolder { .. }) => false,
            Err(err) => {
                tracing::warn!(%err, "lease acquisition failed");
                false
            }
        }
    }

    fn attempt_renew(&mut self, now_ms: u64) -> bool {
        self.last_check_ms = Some(now_ms);
        match self
            .backend
            .renew(&self.config.identity, now_ms, self.config.lease_duration_ms)
        {
            Ok(lease) => {
                self.lease = Some(lease);
                true
            }
            Err(LeaderError::NotHolder { .. }) => {
                self.enter_cooldown(now_ms, "takeover detected during renew");
                false
            }
            Err(err) => {
                tracing::warn!(%err, "lease renew failed");
                self.enter_cooldown(now_ms, "renew error");
                false
            }
        }
    }

    /// Gate check before an append or side effect.
    pub fn pre_action_check(&mut self, now_ms: u64) -> bool {
        self.ensure_leader(now_ms)
    }

    /// Re-confirm holdership after an externally observable side effect;
    /// on loss, enter cooldown.
    pub fn post_action_check(&mut self, now_ms: u64) -> bool {
        if self.state != GateState::Leader {
            return false;
        }
        match self.backend.read() {
            Ok(Some(lease)) if lease.holder == self.config.identity => true,
            Ok(_) => {
                self.enter_cooldown(now_ms, "takeover detected after side effect");
                false
            }
            Err(err) => {
                tracing::warn!(%err, "post-action lease read failed");
                self.enter_cooldown(now_ms, "lease read error");
                false
            }
        }
    }
}
