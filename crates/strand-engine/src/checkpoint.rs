//! Signed state checkpoints.
//!
//! A checkpoint commits to `(state_hash, log_hash, at_seq)` under an
//! Ed25519 signature. Readers verify the signature, then re-replay the log
//! to `at_seq` and confirm both hashes, so a checkpoint can never vouch
//! for state the log does not reproduce. Checkpoint files are write-once.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, Verifier};
use rand::RngCore;
use strand_core::{
    sha256_hex, stable_id, to_canonical_bytes, to_canonical_string, Reducer, State, Value,
};
use strand_store::EventStore;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint i/o failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed checkpoint: {reason}")]
    Malformed { reason: String },
    #[error("invalid key material: {reason}")]
    BadKey { reason: String },
    #[error("signature verification failed")]
    BadSignature,
    #[error("public key id mismatch: checkpoint was signed by {got}, verifier is {expected}")]
    PubkeyMismatch { expected: String, got: String },
    #[error("{what} mismatch: computed {computed}, checkpoint claims {claimed}")]
    HashMismatch {
        what: &'static str,
        computed: String,
        claimed: String,
    },
    #[error("log has no event at seq {seq}")]
    MissingEvent { seq: u64 },
    #[error("checkpoint already exists at {path}")]
    AlreadyExists { path: PathBuf },
    #[error(transparent)]
    Store(#[from] strand_store::StoreError),
    #[error("replay failed: {0}")]
    Replay(String),
}

/// Ed25519 signing key, stored as 32 hex-encoded bytes on disk.
pub struct SigningKey {
    inner: ed25519_dalek::SigningKey,
}

impl SigningKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut bytes);
        Self {
            inner: ed25519_dalek::SigningKey::from_bytes(&bytes),
        }
    }

    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            inner: ed25519_dalek::SigningKey::from_bytes(bytes),
        }
    }

    pub fn load(path: &Path) -> Result<Self, CheckpointError> {
        let raw = fs::read_to_string(path).map_err(|source| CheckpointError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let bytes = decode_key_hex(raw.trim())?;
        Ok(Self::from_bytes(&bytes))
    }

    /// Save the private key, and the public key next to it as
    /// `<path>.pub`.
    pub fn save(&self, path: &Path) -> Result<(), CheckpointError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| CheckpointError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        fs::write(path, hex::encode(self.inner.to_bytes())).map_err(|source| {
            CheckpointError::Io {
                path: path.to_path_buf(),
                source,
            }
        })?;
        let pub_path = path.with_extension("pub");
        fs::write(
            &pub_path,
            hex::encode(self.inner.verifying_key().to_bytes()),
        )
        .map_err(|source| CheckpointError::Io {
            path: pub_path,
            source,
        })?;
        Ok(())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        VerifyingKey {
            inner: self.inner.verifying_key(),
        }
    }

    pub fn pubkey_id(&self) -> String {
        self.verifying_key().pubkey_id()
    }

    fn sign_payload(&self, payload: &[u8]) -> String {
        BASE64.encode(self.inner.sign(payload).to_bytes())
    }
}

/// Ed25519 verifying key (public half only).
#[derive(Clone)]
pub struct VerifyingKey {
    inner: ed25519_dalek::VerifyingKey,
}

impl VerifyingKey {
    pub fn load(path: &Path) -> Result<Self, CheckpointError> {
        let raw = fs::read_to_string(path).map_err(|source| CheckpointError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let bytes = decode_key_hex(raw.trim())?;
        let inner =
            ed25519_dalek::VerifyingKey::from_bytes(&bytes).map_err(|e| CheckpointError::BadKey {
                reason: e.to_string(),
            })?;
        Ok(Self { inner })
    }

    /// Key identifier: first 16 hex chars of SHA-256 of the raw key bytes.
    pub fn pubkey_id(&self) -> String {
        sha256_hex(self.inner.as_bytes())[..16].to_string()
    }

    fn verify_payload(&self, payload: &[u8], signature_b64: &str) -> Result<(), CheckpointError> {
        let raw = BASE64
            .decode(signature_b64)
            .map_err(|_| CheckpointError::BadSignature)?;
        let signature =
            Signature::from_slice(&raw).map_err(|_| CheckpointError::BadSignature)?;
        self.inner
            .verify(payload, &signature)
            .map_err(|_| CheckpointError::BadSignature)
    }
}

fn decode_key_hex(raw: &str) -> Result<[u8; 32], CheckpointError> {
    let bytes = hex::decode(raw).map_err(|e| CheckpointError::BadKey {
        reason: e.to_string(),
    })?;
    bytes.try_into().map_err(|_| CheckpointError::BadKey {
        reason: "key must be exactly 32 bytes".to_string(),
    })
}

/// Signed snapshot of `(state_hash, log_hash, at_seq)` plus the canonical
/// state bytes needed to resume replay from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub checkpoint_id: String,
    pub at_seq: u64,
    pub state_hash: String,
    pub log_hash: String,
    pub state_b64: String,
    pub timestamp: u64,
    pub created_by: String,
    pub pubkey_id: String,
    pub signature: String,
}

impl Checkpoint {
    /// The bytes the signature covers.
    fn signing_payload(
        checkpoint_id: &str,
        at_seq: u64,
        state_hash: &str,
        log_hash: &str,
    ) -> Vec<u8> {
        let mut m = BTreeMap::new();
        m.insert(
            "at_seq".to_string(),
            Value::Uint(at_seq),
        );
        m.insert(
            "checkpoint_id".to_string(),
            Value::Str(checkpoint_id.to_string()),
        );
        m.insert("log_hash".to_string(), Value::Str(log_hash.to_string()));
        m.insert("state_hash".to_string(), Value::Str(state_hash.to_string()));
        to_canonical_bytes(&Value::Map(m))
    }

    pub fn to_value(&self) -> Value {
        let mut m = BTreeMap::new();
        m.insert(
            "checkpoint_id".to_string(),
            Value::Str(self.checkpoint_id.clone()),
        );
        m.insert("at_seq".to_string(), Value::Uint(self.at_seq));
        m.insert("state_hash".to_string(), Value::Str(self.state_hash.clone()));
        m.insert("log_hash".to_string(), Value::Str(self.log_hash.clone()));
        m.insert("state_b64".to_string(), Value::Str(self.state_b64.clone()));
        m.insert("timestamp".to_string(), Value::Uint(self.timestamp));
        m.insert("created_by".to_string(), Value::Str(self.created_by.clone()));
        m.insert("pubkey_id".to_string(), Value::Str(self.pubkey_id.clone()));
        m.insert("signature".to_string(), Value::Str(self.signature.clone()));
        Value::Map(m)
    }

    pub fn from_value(value: &Value) -> Result<Self, CheckpointError> {
        let field_str = |field: &'static str| -> Result<String, CheckpointError> {
            value
                .get(field)
                .and_then(Value::as_str)
                .map(String::from)
                .ok_or_else(|| CheckpointError::Malformed {
                    reason: format!("missing field {field}"),
                })
        };
        let field_u64 = |field: &'static str| -> Result<u64, CheckpointError> {
            value
                .get(field)
                .and_then(Value::as_u64)
                .ok_or_else(|| CheckpointError::Malformed {
                    reason: format!("missing field {field}"),
                })
        };
        Ok(Self {
            checkpoint_id: field_str("checkpoint_id")?,
            at_seq: field_u64("at_seq")?,
            state_hash: field_str("state_hash")?,
            log_hash: field_str("log_hash")?,
            state_b64: field_str("state_b64")?,
            timestamp: field_u64("timestamp")?,
            created_by: field_str("created_by")?,
            pubkey_id: field_str("pubkey_id")?,
            signature: field_str("signature")?,
        })
    }

    pub fn to_json(&self) -> String {
        to_canonical_string(&self.to_value())
    }

    pub fn from_json(raw: &str) -> Result<Self, CheckpointError> {
        let value = Value::from_json_str(raw).map_err(|e| CheckpointError::Malformed {
            reason: e.to_string(),
        })?;
        Self::from_value(&value)
    }
}

/// A checkpoint whose signature, state bytes, and log binding all checked
/// out; carries the decoded state so replay can resume from it.
#[derive(Debug, Clone)]
pub struct VerifiedCheckpoint {
    pub checkpoint: Checkpoint,
    pub state: State,
}

/// Replay to `at_seq` and sign the resulting commitments.
pub fn create_checkpoint(
    store: &dyn EventStore,
    reducer: &Reducer,
    key: &SigningKey,
    at_seq: u64,
    created_by: &str,
    timestamp: u64,
) -> Result<Checkpoint, CheckpointError> {
    let log_hash = store
        .event_hash_at(at_seq)?
        .ok_or(CheckpointError::MissingEvent { seq: at_seq })?;
    let outcome = crate::replay::replay(store, reducer, Some(at_seq))
        .map_err(|e| CheckpointError::Replay(e.to_string()))?;
    let state_bytes = outcome.state.canonical_bytes();
    let state_hash = sha256_hex(&state_bytes);
    let checkpoint_id = stable_id(&[
        "checkpoint",
        &at_seq.to_string(),
        &state_hash,
        &log_hash,
    ]);
    let payload = Checkpoint::signing_payload(&checkpoint_id, at_seq, &state_hash, &log_hash);

    Ok(Checkpoint {
        checkpoint_id,
        at_seq,
        state_hash,
        log_hash,
        state_b64: BASE64.encode(&state_bytes),
        timestamp,
        created_by: created_by.to_string(),
        pubkey_id: key.pubkey_id(),
        signature: key.sign_payload(&payload),
    })
}

/// Signature-only check (fast path).
pub fn verify_signature(
    checkpoint: &Checkpoint,
    key: &VerifyingKey,
) -> Result<(), CheckpointError> {
    let expected = key.pubkey_id();
    if checkpoint.pubkey_id != expected {
        return Err(CheckpointError::PubkeyMismatch {
            expected,
            got: checkpoint.pubkey_id.clone(),
        });
    }
    let payload = Checkpoint::signing_payload(
        &checkpoint.checkpoint_id,
        checkpoint.at_seq,
        &checkpoint.state_hash,
        &checkpoint.log_hash,
    );
    key.verify_payload(&payload, &checkpoint.signature)
}

/// Full verification: signature, state-bytes hash, then re-replay to
/// confirm both the state hash and the log hash at `at_seq`. Any single
/// flipped bit fails one of these checks.
pub fn verify_checkpoint(
    checkpoint: &Checkpoint,
    key: &VerifyingKey,
    store: &dyn EventStore,
    reducer: &Reducer,
) -> Result<VerifiedCheckpoint, CheckpointError> {
    verify_signature(checkpoint, key)?;

    let state_bytes = BASE64
        .decode(&checkpoint.state_b64)
        .map_err(|_| CheckpointError::Malformed {
            reason: "state_b64 is not valid base64".to_string(),
        })?;
    let computed_state_hash = sha256_hex(&state_bytes);
    if computed_state_hash != checkpoint.state_hash {
        return Err(CheckpointError::HashMismatch {
            what: "state hash",
            computed: computed_state_hash,
            claimed: checkpoint.state_hash.clone(),
        });
    }

    let log_hash = store
        .event_hash_at(checkpoint.at_seq)?
        .ok_or(CheckpointError::MissingEvent {
            seq: checkpoint.at_seq,
        })?;
    if log_hash != checkpoint.log_hash {
        return Err(CheckpointError::HashMismatch {
            what: "log hash",
            computed: log_hash,
            claimed: checkpoint.log_hash.clone(),
        });
    }

    let outcome = crate::replay::replay(store, reducer, Some(checkpoint.at_seq))
        .map_err(|e| CheckpointError::Replay(e.to_string()))?;
    let replayed_hash = outcome.state.state_hash();
    if replayed_hash != checkpoint.state_hash {
        return Err(CheckpointError::HashMismatch {
            what: "replayed state hash",
            computed: replayed_hash,
            claimed: checkpoint.state_hash.clone(),
        });
    }

    let raw = String::from_utf8(state_bytes).map_err(|_| CheckpointError::Malformed {
        reason: "state bytes are not UTF-8".to_string(),
    })?;
    let state_value = Value::from_json_str(&raw).map_err(|e| CheckpointError::Malformed {
        reason: format!("state bytes are not canonical JSON: {e}"),
    })?;
    let state = State::from_value(&state_value).ok_or_else(|| CheckpointError::Malformed {
        reason: "state bytes do not decode to a state".to_string(),
    })?;

    Ok(VerifiedCheckpoint {
        checkpoint: checkpoint.clone(),
        state,
    })
}

/// Write-once checkpoint files: `checkpoint-{at_seq:010}.json` in a
/// directory.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| CheckpointError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    fn path_for(&self, at_seq: u64) -> PathBuf {
        self.dir.join(format!("checkpoint-{at_seq:010}.json"))
    }

    /// Persist a checkpoint; refuses to overwrite an existing one.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<PathBuf, CheckpointError> {
        let path = self.path_for(checkpoint.at_seq);
        if path.exists() {
            return Err(CheckpointError::AlreadyExists { path });
        }
        let temp = tempfile::NamedTempFile::new_in(&self.dir).map_err(|source| {
            CheckpointError::Io {
                path: self.dir.clone(),
                source,
            }
        })?;
        fs::write(temp.path(), checkpoint.to_json()).map_err(|source| CheckpointError::Io {
            path: temp.path().to_path_buf(),
            source,
        })?;
        temp.persist_noclobber(&path)
            .map_err(|e| CheckpointError::Io {
                path: path.clone(),
                source: e.error,
            })?;
        Ok(path)
    }

    pub fn load(&self, path: &Path) -> Result<Checkpoint, CheckpointError> {
        let raw = fs::read_to_string(path).map_err(|source| CheckpointError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Checkpoint::from_json(&raw)
    }

    pub fn list(&self) -> Result<Vec<(u64, PathBuf)>, CheckpointError> {
        let mut out = Vec::new();
        let entries = fs::read_dir(&self.dir).map_err(|source| CheckpointError::Io {
            path: self.dir.clone(),
            source,
        })?;
        for entry in entries {
            let entry = entry.map_err(|source| CheckpointError::Io {
                path: self.dir.clone(),
                source,
            })?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some(at_seq) = name
                .strip_prefix("checkpoint-")
                .and_then(|rest| rest.strip_suffix(".json"))
                .and_then(|digits| digits.parse::<u64>().ok())
            else {
                continue;
            };
            out.push((at_seq, entry.path()));
        }
        out.sort();
        Ok(out)
    }

    pub fn latest(&self) -> Result<Option<PathBuf>, CheckpointError> {
        Ok(self.list()?.pop().map(|(_, path)| path))
    }

    pub fn find_at_or_before(&self, seq: u64) -> Result<Option<PathBuf>, CheckpointError> {
        Ok(self
            .list()?
            .into_iter()
            .take_while(|(at_seq, _)| *at_seq <= seq)
            .last()
            .map(|(_, path)| path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::register_handlers;
    use strand_core::{Event, ZERO_HASH};
    use strand_store::{MemoryObjectStore, ObjectLogConfig, ObjectLogStore};
    use tempfile::TempDir;

    fn reducer() -> Reducer {
        let mut r = Reducer::new();
        register_handlers(&mut r);
        r
    }

    fn seeded_store(n: u64) -> ObjectLogStore<MemoryObjectStore> {
        let mut store = ObjectLogStore::new(MemoryObjectStore::new(), ObjectLogConfig::default());
        let mut prev = ZERO_HASH.to_string();
        for seq in 0..n {
            let event = Event::new("AgentObserved", format!("agent-{}", seq % 3), seq)
                .with_payload(
                    Value::from_json_str(&format!(
                        r#"{{"name":"a{seq}","namespace":"u","spec_hash":"h{seq}"}}"#
                    ))
                    .unwrap(),
                );
            prev = store.append(event, &prev).unwrap().event_hash;
        }
        store
    }

    #[test]
    fn sign_verify_round_trip() {
        let store = seeded_store(10);
        let r = reducer();
        let key = SigningKey::generate();
        let cp = create_checkpoint(&store, &r, &key, 6, "test-writer", 42).unwrap();
        let verified = verify_checkpoint(&cp, &key.verifying_key(), &store, &r).unwrap();
        assert_eq!(verified.state.version(), 7);
        assert_eq!(verified.state.state_hash(), cp.state_hash);
    }

    #[test]
    fn flipped_state_hash_fails() {
        let store = seeded_store(5);
        let r = reducer();
        let key = SigningKey::generate();
        let mut cp = create_checkpoint(&store, &r, &key, 3, "w", 1).unwrap();
        let mut chars: Vec<char> = cp.state_hash.chars().collect();
        chars[0] = if chars[0] == '0' { '1' } else { '0' };
        cp.state_hash = chars.into_iter().collect();
        // The signature covers state_hash, so tampering trips it first.
        assert!(verify_checkpoint(&cp, &key.verifying_key(), &store, &r).is_err());
    }

    #[test]
    fn flipped_state_bytes_fail() {
        let store = seeded_store(5);
        let r = reducer();
        let key = SigningKey::generate();
        let mut cp = create_checkpoint(&store, &r, &key, 3, "w", 1).unwrap();
        cp.state_b64 = BASE64.encode(b"{\"aggregates\":{},\"version\":0}");
        let err = verify_checkpoint(&cp, &key.verifying_key(), &store, &r).unwrap_err();
        assert!(matches!(err, CheckpointError::HashMismatch { what: "state hash", .. }));
    }

    #[test]
    fn wrong_key_fails() {
        let store = seeded_store(5);
        let r = reducer();
        let key = SigningKey::generate();
        let cp = create_checkpoint(&store, &r, &key, 3, "w", 1).unwrap();
        let other = SigningKey::generate();
        let err = verify_checkpoint(&cp, &other.verifying_key(), &store, &r).unwrap_err();
        assert!(matches!(err, CheckpointError::PubkeyMismatch { .. }));
    }

    #[test]
    fn tampered_signature_fails() {
        let store = seeded_store(5);
        let r = reducer();
        let key = SigningKey::generate();
        let mut cp = create_checkpoint(&store, &r, &key, 3, "w", 1).unwrap();
        let mut raw = BASE64.decode(&cp.signature).unwrap();
        raw[0] ^= 0x01;
        cp.signature = BASE64.encode(raw);
        let err = verify_signature(&cp, &key.verifying_key()).unwrap_err();
        assert!(matches!(err, CheckpointError::BadSignature));
    }

    #[test]
    fn store_is_write_once() {
        let dir = TempDir::new().unwrap();
        let cp_store = CheckpointStore::open(dir.path()).unwrap();
        let store = seeded_store(5);
        let r = reducer();
        let key = SigningKey::generate();
        let cp = create_checkpoint(&store, &r, &key, 3, "w", 1).unwrap();
        let path = cp_store.save(&cp).unwrap();
        assert!(matches!(
            cp_store.save(&cp),
            Err(CheckpointError::AlreadyExists { .. })
        ));
        let loaded = cp_store.load(&path).unwrap();
        assert_eq!(loaded, cp);
    }

    #[test]
    fn find_at_or_before_picks_closest() {
        let dir = TempDir::new().unwrap();
        let cp_store = CheckpointStore::open(dir.path()).unwrap();
        let store = seeded_store(10);
        let r = reducer();
        let key = SigningKey::generate();
        for at_seq in [2u64, 5, 8] {
            cp_store
                .save(&create_checkpoint(&store, &r, &key, at_seq, "w", 1).unwrap())
                .unwrap();
        }
        let path = cp_store.find_at_or_before(6).unwrap().unwrap();
        assert!(path.to_string_lossy().contains("0000000005"));
        assert!(cp_store.find_at_or_before(1).unwrap().is_none());
    }

    #[test]
    fn replay_from_checkpoint_matches_full_replay() {
        let store = seeded_store(10);
        let r = reducer();
        let key = SigningKey::generate();
        let cp = create_checkpoint(&store, &r, &key, 4, "w", 1).unwrap();
        let verified = verify_checkpoint(&cp, &key.verifying_key(), &store, &r).unwrap();
        let resumed = crate::replay::replay_from_checkpoint(&store, &r, &verified, None).unwrap();
        let full = crate::replay::replay(&store, &r, None).unwrap();
        assert_eq!(resumed.state.state_hash(), full.state.state_hash());
        assert_eq!(resumed.applied, 5);
    }

    #[test]
    fn key_files_round_trip() {
        let dir = TempDir::new().unwrap();
        let key_path = dir.path().join("keys").join("checkpoint.key");
        let key = SigningKey::generate();
        key.save(&key_path).unwrap();
        let loaded = SigningKey::load(&key_path).unwrap();
        assert_eq!(loaded.pubkey_id(), key.pubkey_id());
        let pubkey = VerifyingKey::load(&key_path.with_extension("pub")).unwrap();
        assert_eq!(pubkey.pubkey_id(), key.pubkey_id());
    }
}
