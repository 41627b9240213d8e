//! Per-event hash commitments linking each record to its predecessor.

use thiserror::Error;

use crate::canonical::{sha256_hex, to_canonical_bytes, Value};
use crate::event::{Event, EventError};

/// `prev_hash` of the genesis record.
pub const ZERO_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("prev_hash mismatch at seq {seq}: expected {expected}, got {got}")]
    PrevHashMismatch {
        seq: u64,
        expected: String,
        got: String,
    },
    #[error("event_hash mismatch at seq {seq}: expected {expected}, got {got}")]
    EventHashMismatch {
        seq: u64,
        expected: String,
        got: String,
    },
    #[error("malformed chain record: {0}")]
    MalformedRecord(String),
}

impl From<EventError> for ChainError {
    fn from(err: EventError) -> Self {
        ChainError::MalformedRecord(err.to_string())
    }
}

/// Stored wrapper around one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainRecord {
    pub prev_hash: String,
    pub event_hash: String,
    pub event: Event,
}

impl ChainRecord {
    pub fn seq(&self) -> Result<u64, EventError> {
        self.event.require_seq()
    }

    /// Wire form: canonical map of exactly `prev_hash`, `event_hash`,
    /// `event`.
    pub fn to_value(&self) -> Value {
        let mut m = std::collections::BTreeMap::new();
        m.insert("prev_hash".to_string(), Value::Str(self.prev_hash.clone()));
        m.insert(
            "event_hash".to_string(),
            Value::Str(self.event_hash.clone()),
        );
        m.insert("event".to_string(), self.event.to_value());
        Value::Map(m)
    }

    pub fn to_canonical_line(&self) -> String {
        crate::canonical::to_canonical_string(&self.to_value())
    }

    pub fn from_value(value: &Value) -> Result<Self, ChainError> {
        let map = value
            .as_map()
            .ok_or_else(|| ChainError::MalformedRecord("record must be a map".to_string()))?;
        let prev_hash = map
            .get("prev_hash")
            .and_then(Value::as_str)
            .ok_or_else(|| ChainError::MalformedRecord("missing prev_hash".to_string()))?
            .to_string();
        let event_hash = map
            .get("event_hash")
            .and_then(Value::as_str)
            .ok_or_else(|| ChainError::MalformedRecord("missing event_hash".to_string()))?
            .to_string();
        let event_value = map
            .get("event")
            .ok_or_else(|| ChainError::MalformedRecord("missing event".to_string()))?;
        let event = Event::from_value(event_value)?;
        Ok(Self {
            prev_hash,
            event_hash,
            event,
        })
    }
}

/// Hash commitment for one event: SHA-256 over the predecessor's hash
/// followed by the canonical bytes of the event's stored form. The layout
/// of that stored form is selected by the event's hash version.
pub fn hash_event(prev_hash: &str, event: &Event) -> String {
    let mut input = Vec::with_capacity(prev_hash.len() + 256);
    input.extend_from_slice(prev_hash.as_bytes());
    input.extend_from_slice(&to_canonical_bytes(&event.to_value()));
    sha256_hex(&input)
}

/// Build the stored record for an event whose seq is already assigned.
pub fn chain_record(prev_hash: &str, event: Event) -> ChainRecord {
    let event_hash = hash_event(prev_hash, &event);
    ChainRecord {
        prev_hash: prev_hash.to_string(),
        event_hash,
        event,
    }
}

/// Validate one link: the record's `prev_hash` must equal the running
/// predecessor hash and its `event_hash` must recompute, under the hash
/// version the stored event declares.
pub fn verify_link(prev_hash: &str, record: &ChainRecord) -> Result<(), ChainError> {
    let seq = record.seq()?;
    if record.prev_hash != prev_hash {
        return Err(ChainError::PrevHashMismatch {
            seq,
            expected: prev_hash.to_string(),
            got: record.prev_hash.clone(),
        });
    }
    let computed = hash_event(prev_hash, &record.event);
    if computed != record.event_hash {
        return Err(ChainError::EventHashMismatch {
            seq,
            expected: computed,
            got: record.event_hash.clone(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventMeta, HashVersion};

    fn ev(seq: u64) -> Event {
        Event::new("INC", "A", seq)
            .with_seq(seq)
            .with_payload(Value::from_json_str(r#"{"inc":1}"#).unwrap())
    }

    #[test]
    fn genesis_links_to_zero_hash() {
        let rec = chain_record(ZERO_HASH, ev(0));
        assert_eq!(rec.prev_hash, ZERO_HASH);
        verify_link(ZERO_HASH, &rec).unwrap();
    }

    #[test]
    fn chain_links_forward() {
        let r0 = chain_record(ZERO_HASH, ev(0));
        let r1 = chain_record(&r0.event_hash, ev(1));
        verify_link(&r0.event_hash, &r1).unwrap();
        let err = verify_link(ZERO_HASH, &r1).unwrap_err();
        assert!(matches!(err, ChainError::PrevHashMismatch { seq: 1, .. }));
    }

    #[test]
    fn tampered_payload_fails_verification() {
        let r0 = chain_record(ZERO_HASH, ev(0));
        let mut tampered = r0.clone();
        tampered.event.payload = Value::from_json_str(r#"{"inc":2}"#).unwrap();
        let err = verify_link(ZERO_HASH, &tampered).unwrap_err();
        assert!(matches!(err, ChainError::EventHashMismatch { seq: 0, .. }));
    }

    #[test]
    fn v1_and_v2_hash_differently_for_same_event() {
        let v1 = ev(0);
        let v2 = ev(0).with_hash_version(HashVersion::V2);
        assert_ne!(hash_event(ZERO_HASH, &v1), hash_event(ZERO_HASH, &v2));
    }

    #[test]
    fn v2_with_meta_round_trips() {
        let meta = EventMeta {
            writer_id: Some("writer-0".to_string()),
            ..EventMeta::default()
        };
        let event = ev(0).with_meta(meta).with_hash_version(HashVersion::V2);
        let rec = chain_record(ZERO_HASH, event);
        let parsed = ChainRecord::from_value(&rec.to_value()).unwrap();
        assert_eq!(parsed, rec);
        verify_link(ZERO_HASH, &parsed).unwrap();
    }

    #[test]
    fn record_wire_form_has_exactly_three_fields() {
        let rec = chain_record(ZERO_HASH, ev(0));
        let value = rec.to_value();
        let map = value.as_map().unwrap();
        let keys: Vec<&str> = map.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["event", "event_hash", "prev_hash"]);
    }
}
