//! File backend: a directory of append-only JSONL segments.
//!
//! One canonical chain-record line per event, fsync after every record.
//! Segments rotate at configured byte/record thresholds; the first record
//! of a new segment links to the last `event_hash` of the previous one, so
//! the chain is continuous across rotation. An exclusive advisory lock on
//! a lock file in the store directory serializes local writers; cross-host
//! single-writer discipline belongs to the leader gate, and the CAS check
//! in `append` is the authoritative protection either way.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Lines, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use fs2::FileExt;
use strand_core::{chain_record, ChainRecord, Event, Value};

use crate::error::{BackendError, StoreError, StoreResult};
use crate::store::{ChainCursor, EventStore, LogHead, RecordIter, StoreOptions};

const SEGMENT_PREFIX: &str = "segment-";
const SEGMENT_SUFFIX: &str = ".jsonl";
const LOCK_FILE: &str = "writer.lock";

#[derive(Debug, Clone, Default)]
pub struct FileStoreConfig {
    /// Rotate when the active segment would exceed this many bytes.
    /// Zero disables byte-based rotation.
    pub segment_max_bytes: u64,
    /// Rotate when the active segment holds this many records. Zero
    /// disables record-count rotation.
    pub segment_max_records: u64,
    pub options: StoreOptions,
}

/// JSONL segment store rooted at a directory.
pub struct FileStore {
    dir: PathBuf,
    config: FileStoreConfig,
    head: Mutex<Option<LogHead>>,
}

impl FileStore {
    pub fn open(dir: impl Into<PathBuf>, config: FileStoreConfig) -> StoreResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| BackendError::io(&dir, source))?;
        Ok(Self {
            dir,
            config,
            head: Mutex::new(None),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn segment_path(&self, index: u64) -> PathBuf {
        self.dir
            .join(format!("{SEGMENT_PREFIX}{index:06}{SEGMENT_SUFFIX}"))
    }

    fn list_segments(&self) -> StoreResult<Vec<(u64, PathBuf)>> {
        let mut segments = Vec::new();
        let entries =
            fs::read_dir(&self.dir).map_err(|source| BackendError::io(&self.dir, source))?;
        for entry in entries {
            let entry = entry.map_err(|source| BackendError::io(&self.dir, source))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some(index) = name
                .strip_prefix(SEGMENT_PREFIX)
                .and_then(|rest| rest.strip_suffix(SEGMENT_SUFFIX))
                .and_then(|digits| digits.parse::<u64>().ok())
            else {
                continue;
            };
            segments.push((index, entry.path()));
        }
        segments.sort();
        Ok(segments)
    }

    /// Authoritative tail plus active-segment stats, by scanning segment
    /// files from the end. Only called with the writer lock held (append)
    /// or where a benign race is acceptable (tail rebuild).
    fn scan_view(&self) -> StoreResult<SegmentView> {
        let segments = self.list_segments()?;
        let (active_index, active_records, active_bytes) = match segments.last() {
            Some((index, path)) => {
                let (records, bytes) = segment_stats(path)?;
                (*index, records, bytes)
            }
            None => (0, 0, 0),
        };

        for (_, path) in segments.iter().rev() {
            if let Some((seq, hash)) = last_record_in_segment(path)? {
                return Ok(SegmentView {
                    head: LogHead {
                        last_seq: Some(seq),
                        last_hash: hash,
                    },
                    active_index,
                    active_records,
                    active_bytes,
                });
            }
        }

        Ok(SegmentView {
            head: LogHead::empty(),
            active_index,
            active_records,
            active_bytes,
        })
    }

    fn should_rotate(&self, view: &SegmentView, next_line_len: u64) -> bool {
        if view.active_records == 0 {
            return false;
        }
        if self.config.segment_max_bytes > 0
            && view.active_bytes.saturating_add(next_line_len) > self.config.segment_max_bytes
        {
            return true;
        }
        if self.config.segment_max_records > 0
            && view.active_records >= self.config.segment_max_records
        {
            return true;
        }
        false
    }
}

#[derive(Debug)]
struct SegmentView {
    head: LogHead,
    active_index: u64,
    active_records: u64,
    active_bytes: u64,
}

/// Advisory exclusive lock scoped to one append.
struct WriterLock {
    file: File,
}

impl WriterLock {
    fn acquire(dir: &Path) -> StoreResult<Self> {
        let path = dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|source| BackendError::io(&path, source))?;
        file.lock_exclusive()
            .map_err(|source| BackendError::io(&path, source))?;
        Ok(Self { file })
    }
}

impl Drop for WriterLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

fn segment_stats(path: &Path) -> StoreResult<(u64, u64)> {
    let file = File::open(path).map_err(|source| BackendError::io(path, source))?;
    let bytes = file
        .metadata()
        .map_err(|source| BackendError::io(path, source))?
        .len();
    let mut records = 0u64;
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|source| BackendError::io(path, source))?;
        if !line.trim().is_empty() {
            records += 1;
        }
    }
    Ok((records, bytes))
}

fn last_record_in_segment(path: &Path) -> StoreResult<Option<(u64, String)>> {
    let file = File::open(path).map_err(|source| BackendError::io(path, source))?;
    let mut last = None;
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|source| BackendError::io(path, source))?;
        if line.trim().is_empty() {
            continue;
        }
        let record = parse_record_line(&line)?;
        last = Some((record.seq()?, record.event_hash));
    }
    Ok(last)
}

fn parse_record_line(line: &str) -> StoreResult<ChainRecord> {
    let value = Value::from_json_str(line)
        .map_err(|e| StoreError::integrity(None, format!("unparseable record line: {e}")))?;
    Ok(ChainRecord::from_value(&value)?)
}

impl EventStore for FileStore {
    fn append(&mut self, event: Event, expected_prev_hash: &str) -> StoreResult<ChainRecord> {
        if event.event_type.is_empty() {
            return Err(StoreError::MalformedEvent("empty event type".to_string()));
        }

        let _lock = WriterLock::acquire(&self.dir)?;
        let view = self.scan_view()?;

        if expected_prev_hash != view.head.last_hash {
            return Err(StoreError::Conflict {
                observed_prev_hash: view.head.last_hash,
            });
        }

        let event = self.config.options.stamp(event).with_seq(view.head.next_seq());
        let record = chain_record(&view.head.last_hash, event);
        let line = record.to_canonical_line();

        let index = if self.should_rotate(&view, line.len() as u64 + 1) {
            view.active_index + 1
        } else {
            view.active_index
        };
        let path = self.segment_path(index);
        let created = !path.exists();

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| BackendError::io(&path, source))?;
        file.write_all(line.as_bytes())
            .and_then(|()| file.write_all(b"\n"))
            .and_then(|()| file.flush())
            .map_err(|source| BackendError::io(&path, source))?;
        file.sync_data()
            .map_err(|source| BackendError::io(&path, source))?;
        if created {
            fsync_dir(&self.dir)?;
            tracing::debug!(segment = index, "started new log segment");
        }

        let head = LogHead {
            last_seq: record.event.seq,
            last_hash: record.event_hash.clone(),
        };
        *self.head.lock().expect("head cache lock poisoned") = Some(head);
        Ok(record)
    }

    fn read(&self, from_seq: u64, to_seq: Option<u64>) -> StoreResult<RecordIter<'_>> {
        let segments = self.list_segments()?;
        Ok(Box::new(FileReadIter {
            segments: segments.into_iter().map(|(_, path)| path).collect(),
            lines: None,
            cursor: ChainCursor::new(),
            from_seq,
            to_seq,
            done: false,
        }))
    }

    fn tail(&self) -> StoreResult<LogHead> {
        if let Some(head) = self.head.lock().expect("head cache lock poisoned").clone() {
            return Ok(head);
        }
        let head = self.scan_view()?.head;
        *self.head.lock().expect("head cache lock poisoned") = Some(head.clone());
        Ok(head)
    }

    fn event_hash_at(&self, seq: u64) -> StoreResult<Option<String>> {
        for record in self.read(seq, Some(seq))? {
            let record = record?;
            if record.seq()? == seq {
                return Ok(Some(record.event_hash));
            }
        }
        Ok(None)
    }
}

struct FileReadIter {
    segments: std::collections::VecDeque<PathBuf>,
    lines: Option<(PathBuf, Lines<BufReader<File>>)>,
    cursor: ChainCursor,
    from_seq: u64,
    to_seq: Option<u64>,
    done: bool,
}

impl FileReadIter {
    fn next_line(&mut self) -> StoreResult<Option<String>> {
        loop {
            if let Some((path, lines)) = self.lines.as_mut() {
                match lines.next() {
                    Some(Ok(line)) if line.trim().is_empty() => continue,
                    Some(Ok(line)) => return Ok(Some(line)),
                    Some(Err(source)) => {
                        return Err(BackendError::io(path.clone(), source).into());
                    }
                    None => {
                        self.lines = None;
                    }
                }
            }
            let Some(path) = self.segments.pop_front() else {
                return Ok(None);
            };
            let file = File::open(&path).map_err(|source| BackendError::io(&path, source))?;
            self.lines = Some((path, BufReader::new(file).lines()));
        }
    }
}

impl Iterator for FileReadIter {
    type Item = StoreResult<ChainRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            let line = match self.next_line() {
                Ok(Some(line)) => line,
                Ok(None) => {
                    self.done = true;
                    return None;
                }
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            };
            let record = match parse_record_line(&line) {
                Ok(record) => record,
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            };
            if let Err(err) = self.cursor.admit(&record) {
                self.done = true;
                return Some(Err(err));
            }
            let seq = record.event.seq.unwrap_or(0);
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

fn fsync_dir(dir: &Path) -> StoreResult<()> {
    let file = File::open(dir).map_err(|source| BackendError::io(dir, source))?;
    file.sync_all()
        .map_err(|source| BackendError::io(dir, source))?;
    Ok(())
}
