//! Immutable event record and its metadata envelope.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::canonical::Value;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    #[error("event seq is required but unassigned")]
    SeqUnassigned,
    #[error("event field `{field}` is invalid: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// Selector between the two canonical hash payload layouts.
///
/// `V1` always folds `meta` into the hash input, even when empty. `V2`
/// stamps `hash_version: "v2"` into the hashed object and omits `meta`
/// when it carries nothing. Reads auto-detect per event; logs may mix.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HashVersion {
    #[default]
    V1,
    V2,
}

impl HashVersion {
    pub fn as_str(&self) -> Option<&'static str> {
        match self {
            HashVersion::V1 => None,
            HashVersion::V2 => Some("v2"),
        }
    }

    pub fn parse(raw: &str) -> Result<Self, EventError> {
        match raw {
            "v1" => Ok(HashVersion::V1),
            "v2" => Ok(HashVersion::V2),
            other => Err(EventError::InvalidField {
                field: "hash_version",
                reason: format!("unsupported version {other}"),
            }),
        }
    }
}

/// Forensic attribution of an event to a leadership epoch.
///
/// The token records which lease holder, in which epoch, produced the
/// event. It does not enforce anything; the store's conditional append is
/// the authoritative protection against colliding writers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FencingToken {
    pub holder: String,
    pub epoch: u64,
}

impl FencingToken {
    pub fn new(holder: impl Into<String>, epoch: u64) -> Self {
        Self {
            holder: holder.into(),
            epoch,
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let (holder, epoch) = raw.rsplit_once(':')?;
        if holder.is_empty() {
            return None;
        }
        Some(Self {
            holder: holder.to_string(),
            epoch: epoch.parse().ok()?,
        })
    }
}

impl fmt::Display for FencingToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.holder, self.epoch)
    }
}

/// Auxiliary event metadata: writer identity, fencing token, provenance.
///
/// Known fields are typed; unknown optional fields survive a read/write
/// round trip through `extra` and are otherwise ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventMeta {
    pub writer_id: Option<String>,
    pub fencing_token: Option<FencingToken>,
    pub source: Option<String>,
    pub resource: Option<String>,
    pub extra: BTreeMap<String, Value>,
}

impl EventMeta {
    pub fn is_empty(&self) -> bool {
        self.writer_id.is_none()
            && self.fencing_token.is_none()
            && self.source.is_none()
            && self.resource.is_none()
            && self.extra.is_empty()
    }

    pub fn to_value(&self) -> Value {
        let mut m = BTreeMap::new();
        if let Some(writer_id) = &self.writer_id {
            m.insert("writer_id".to_string(), Value::Str(writer_id.clone()));
        }
        if let Some(token) = &self.fencing_token {
            m.insert("fencing_token".to_string(), Value::Str(token.to_string()));
        }
        if let Some(source) = &self.source {
            m.insert("source".to_string(), Value::Str(source.clone()));
        }
        if let Some(resource) = &self.resource {
            m.insert("resource".to_string(), Value::Str(resource.clone()));
        }
        for (k, v) in &self.extra {
            m.insert(k.clone(), v.clone());
        }
        Value::Map(m)
    }

    pub fn from_value(value: &Value) -> Result<Self, EventError> {
        let map = value.as_map().ok_or_else(|| EventError::InvalidField {
            field: "meta",
            reason: "must be a map".to_string(),
        })?;
        let mut meta = EventMeta::default();
        for (k, v) in map {
            match (k.as_str(), v) {
                ("writer_id", Value::Str(s)) => meta.writer_id = Some(s.clone()),
                ("fencing_token", Value::Str(s)) => {
                    meta.fencing_token =
                        Some(FencingToken::parse(s).ok_or_else(|| EventError::InvalidField {
                            field: "meta.fencing_token",
                            reason: format!("unparseable token {s}"),
                        })?);
                }
                ("source", Value::Str(s)) => meta.source = Some(s.clone()),
                ("resource", Value::Str(s)) => meta.resource = Some(s.clone()),
                _ => {
                    meta.extra.insert(k.clone(), v.clone());
                }
            }
        }
        Ok(meta)
    }
}

/// Immutable event record.
///
/// `seq` stays unassigned until the store commits the event; everything
/// else is fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub event_type: String,
    pub aggregate_id: String,
    pub seq: Option<u64>,
    pub ts: u64,
    pub payload: Value,
    pub meta: EventMeta,
    pub hash_version: HashVersion,
}

impl Event {
    pub fn new(event_type: impl Into<String>, aggregate_id: impl Into<String>, ts: u64) -> Self {
        Self {
            event_type: event_type.into(),
            aggregate_id: aggregate_id.into(),
            seq: None,
            ts,
            payload: Value::map(),
            meta: EventMeta::default(),
            hash_version: HashVersion::V1,
        }
    }

    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    #[must_use]
    pub fn with_meta(mut self, meta: EventMeta) -> Self {
        self.meta = meta;
        self
    }

    #[must_use]
    pub fn with_hash_version(mut self, version: HashVersion) -> Self {
        self.hash_version = version;
        self
    }

    #[must_use]
    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = Some(seq);
        self
    }

    pub fn require_seq(&self) -> Result<u64, EventError> {
        self.seq.ok_or(EventError::SeqUnassigned)
    }

    /// The stored (and hashed) object form of this event.
    ///
    /// V1: `meta` is always present, canonicalized as `{}` when empty.
    /// V2: `hash_version: "v2"` is added and `meta` is dropped when empty.
    pub fn to_value(&self) -> Value {
        let mut m = BTreeMap::new();
        m.insert("type".to_string(), Value::Str(self.event_type.clone()));
        m.insert(
            "aggregate_id".to_string(),
            Value::Str(self.aggregate_id.clone()),
        );
        if let Some(seq) = self.seq {
            m.insert("seq".to_string(), Value::Uint(seq));
        } else {
            m.insert("seq".to_string(), Value::Null);
        }
        m.insert("ts".to_string(), Value::Uint(self.ts));
        m.insert("payload".to_string(), self.payload.clone());
        match self.hash_version {
            HashVersion::V1 => {
                m.insert("meta".to_string(), self.meta.to_value());
            }
            HashVersion::V2 => {
                m.insert("hash_version".to_string(), Value::Str("v2".to_string()));
                if !self.meta.is_empty() {
                    m.insert("meta".to_string(), self.meta.to_value());
                }
            }
        }
        Value::Map(m)
    }

    pub fn from_value(value: &Value) -> Result<Self, EventError> {
        let map = value.as_map().ok_or_else(|| EventError::InvalidField {
            field: "event",
            reason: "must be a map".to_string(),
        })?;

        let event_type = map
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| EventError::InvalidField {
                field: "type",
                reason: "missing or not a string".to_string(),
            })?
            .to_string();
        let aggregate_id = map
            .get("aggregate_id")
            .and_then(Value::as_str)
            .ok_or_else(|| EventError::InvalidField {
                field: "aggregate_id",
                reason: "missing or not a string".to_string(),
            })?
            .to_string();
        let seq = match map.get("seq") {
            None | Some(Value::Null) => None,
            Some(v) => Some(v.as_u64().ok_or_else(|| EventError::InvalidField {
                field: "seq",
                reason: "must be a non-negative integer".to_string(),
            })?),
        };
        let ts = map
            .get("ts")
            .and_then(Value::as_u64)
            .ok_or_else(|| EventError::InvalidField {
                field: "ts",
                reason: "missing or not a non-negative integer".to_string(),
            })?;
        let payload = map.get("payload").cloned().unwrap_or_else(Value::map);
        let meta = match map.get("meta") {
            Some(v) => EventMeta::from_value(v)?,
            None => EventMeta::default(),
        };
        let hash_version = match map.get("hash_version").and_then(Value::as_str) {
            Some(raw) => HashVersion::parse(raw)?,
            None => HashVersion::V1,
        };

        Ok(Self {
            event_type,
            aggregate_id,
            seq,
            ts,
            payload,
            meta,
            hash_version,
        })
    }
}

impl Serialize for Event {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Event {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Event, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Event::from_value(&value).map_err(D::Error::custom)
    }
}
