//! Event log over an object store: one object per event.
//!
//! Key scheme `{prefix}/{seq:010}.json` — zero padding makes lexicographic
//! order equal numeric order, so a paginated listing walks the log in seq
//! order. Append is a conditional create at the next seq key; the head
//! object `{prefix}/_head.json` is a best-effort hint that is cross-checked
//! by rescanning whenever anything looks off.

use std::collections::BTreeMap;

use strand_core::{chain_record, ChainRecord, Event, Value};

use crate::error::{StoreError, StoreResult};
use crate::object::ObjectStore;
use crate::store::{ChainCursor, EventStore, LogHead, RecordIter, StoreOptions};

const LIST_PAGE_SIZE: usize = 1000;
const HEAD_OBJECT: &str = "_head.json";

#[derive(Debug, Clone)]
pub struct ObjectLogConfig {
    pub prefix: String,
    /// Maintain and consult the `_head.json` hint object.
    pub use_head_cache: bool,
    pub options: StoreOptions,
}

impl Default for ObjectLogConfig {
    fn default() -> Self {
        Self {
            prefix: "events".to_string(),
            use_head_cache: true,
            options: StoreOptions::default(),
        }
    }
}

pub struct ObjectLogStore<B: ObjectStore> {
    backend: B,
    config: ObjectLogConfig,
}

impl<B: ObjectStore> ObjectLogStore<B> {
    pub fn new(backend: B, config: ObjectLogConfig) -> Self {
        Self { backend, config }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn key_for_seq(&self, seq: u64) -> String {
        format!("{}/{seq:010}.json", self.config.prefix)
    }

    fn head_key(&self) -> String {
        format!("{}/{HEAD_OBJECT}", self.config.prefix)
    }

    fn seq_from_key(&self, key: &str) -> Option<u64> {
        let rest = key.strip_prefix(&self.config.prefix)?.strip_prefix('/')?;
        let digits = rest.strip_suffix(".json")?;
        if digits.len() != 10 || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }

    fn list_all_seqs(&self) -> StoreResult<Vec<u64>> {
        let mut seqs = Vec::new();
        let mut start_after: Option<String> = None;
        loop {
            let page = self.backend.list_page(
                &self.config.prefix,
                start_after.as_deref(),
                LIST_PAGE_SIZE,
            )?;
            for key in &page.keys {
                if let Some(seq) = self.seq_from_key(key) {
                    seqs.push(seq);
                }
            }
            match page.next_start_after {
                Some(token) => start_after = Some(token),
                None => break,
            }
        }
        seqs.sort_unstable();
        Ok(seqs)
    }

    fn fetch_record(&self, seq: u64) -> StoreResult<Option<ChainRecord>> {
        let key = self.key_for_seq(seq);
        let Some(bytes) = self.backend.get(&key)? else {
            return Ok(None);
        };
        Ok(Some(parse_record_bytes(seq, &bytes)?))
    }

    /// Authoritative tail by full paginated scan.
    fn scan_tail(&self) -> StoreResult<LogHead> {
        let seqs = self.list_all_seqs()?;
        let Some(&last_seq) = seqs.last() else {
            return Ok(LogHead::empty());
        };
        let record = self.fetch_record(last_seq)?.ok_or_else(|| {
            StoreError::integrity(
                Some(last_seq),
                "listed object disappeared before it could be read".to_string(),
            )
        })?;
        Ok(LogHead {
            last_seq: Some(last_seq),
            last_hash: record.event_hash,
        })
    }

    fn read_head_hint(&self) -> Option<LogHead> {
        if !self.config.use_head_cache {
            return None;
        }
        let bytes = self.backend.get(&self.head_key()).ok()??;
        let raw = std::str::from_utf8(&bytes).ok()?;
        let value = Value::from_json_str(raw).ok()?;
        let last_seq = value.get("last_seq")?.as_u64()?;
        let last_hash = value.get("last_hash")?.as_str()?.to_string();
        Some(LogHead {
            last_seq: Some(last_seq),
            last_hash,
        })
    }

    /// Best-effort head update after a winning append; a failure here
    /// never fails the append.
    fn write_head_hint(&self, head: &LogHead) {
        if !self.config.use_head_cache {
            return;
        }
        let Some(last_seq) = head.last_seq else {
            return;
        };
        if let Some(current) = self.read_head_hint() {
            if current.last_seq.is_some_and(|seq| seq >= last_seq) {
                return;
            }
        }
        let mut m = BTreeMap::new();
        m.insert("last_hash".to_string(), Value::Str(head.last_hash.clone()));
        m.insert("last_seq".to_string(), Value::Uint(last_seq));
        let body = strand_core::to_canonical_bytes(&Value::Map(m));
        if let Err(err) = self.backend.put(&self.head_key(), &body) {
            tracing::debug!(%err, "head hint update failed, will rebuild by listing");
        }
    }

    fn resolve_tail(&self) -> StoreResult<LogHead> {
        if let Some(hint) = self.read_head_hint() {
            // The hint is only a hint: trust it when the object it points
            // at exists with the hinted hash and no successor has landed.
            if let Some(seq) = hint.last_seq {
                let hinted_exists = self
                    .fetch_record(seq)
                    .ok()
                    .flatten()
                    .is_some_and(|record| record.event_hash == hint.last_hash);
                let successor_absent = self.backend.get(&self.key_for_seq(seq + 1))?.is_none();
                if hinted_exists && successor_absent {
                    return Ok(hint);
                }
            }
        }
        self.scan_tail()
    }
}

fn parse_record_bytes(seq: u64, bytes: &[u8]) -> StoreResult<ChainRecord> {
    let raw = std::str::from_utf8(bytes)
        .map_err(|_| StoreError::integrity(Some(seq), "record is not UTF-8".to_string()))?;
    let value = Value::from_json_str(raw)
        .map_err(|e| StoreError::integrity(Some(seq), format!("unparseable record: {e}")))?;
    Ok(ChainRecord::from_value(&value)?)
}

impl<B: ObjectStore> EventStore for ObjectLogStore<B> {
    fn append(&mut self, event: Event, expected_prev_hash: &str) -> StoreResult<ChainRecord> {
        if event.event_type.is_empty() {
            return Err(StoreError::MalformedEvent("empty event type".to_string()));
        }

        let head = self.resolve_tail()?;
        if expected_prev_hash != head.last_hash {
            return Err(StoreError::Conflict {
                observed_prev_hash: head.last_hash,
            });
        }

        let seq = head.next_seq();
        let event = self.config.options.stamp(event).with_seq(seq);
        let record = chain_record(&head.last_hash, event);
        let body = record.to_canonical_line();

        if !self.backend.put_if_absent(&self.key_for_seq(seq), body.as_bytes())? {
            // Lost the conditional create; report the tail the winner left.
            let observed = self.scan_tail()?;
            return Err(StoreError::Conflict {
                observed_prev_hash: observed.last_hash,
            });
        }

        let new_head = LogHead {
            last_seq: Some(seq),
            last_hash: record.event_hash.clone(),
        };
        self.write_head_hint(&new_head);
        Ok(record)
    }

    fn read(&self, from_seq: u64, to_seq: Option<u64>) -> StoreResult<RecordIter<'_>> {
        let seqs = self.list_all_seqs()?;
        Ok(Box::new(ObjectReadIter {
            store: self,
            seqs: seqs.into_iter().collect(),
            cursor: ChainCursor::new(),
            from_seq,
            to_seq,
            done: false,
        }))
    }

    fn tail(&self) -> StoreResult<LogHead> {
        self.resolve_tail()
    }

    fn event_hash_at(&self, seq: u64) -> StoreResult<Option<String>> {
        Ok(self.fetch_record(seq)?.map(|record| record.event_hash))
    }
}

struct ObjectReadIter<'a, B: ObjectStore> {
    store: &'a ObjectLogStore<B>,
    seqs: std::collections::VecDeque<u64>,
    cursor: ChainCursor,
    from_seq: u64,
    to_seq: Option<u64>,
    done: bool,
}

impl<B: ObjectStore> Iterator for ObjectReadIter<'_, B> {
    type Item = StoreResult<ChainRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            let Some(seq) = self.seqs.pop_front() else {
                self.done = true;
                return None;
            };
            let record = match self.store.fetch_record(seq) {
                Ok(Some(record)) => record,
                Ok(None) => {
                    self.done = true;
                    return Some(Err(StoreError::integrity(
                        Some(seq),
                        "listed object disappeared before it could be read".to_string(),
                    )));
                }
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            };
            if let Err(err) = self.cursor.admit(&record) {
                self.done = true;
                return Some(Err(err));
            }
            if let Some(to) = self.to_seq {
                if seq > to {
                    self.done = true;
                    return None;
                }
            }
            if seq < self.from_seq {
                continue;
            }
            return Some(Ok(record));
        }
    }
}
