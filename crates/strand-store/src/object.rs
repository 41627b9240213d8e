//! Object-store abstraction: a strongly consistent key-value bucket with
//! conditional create.
//!
//! The production S3/GCS client plugs in behind [`ObjectStore`]; the crate
//! ships a filesystem-backed implementation (conditional create via
//! `create_new`) and an in-memory one for tests and race harnesses. The
//! contract every implementation must honor: read-after-write consistency
//! and `put_if_absent` keyed on object identity.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::BackendError;

/// One page of a lexicographic key listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectPage {
    pub keys: Vec<String>,
    /// Continuation token: pass back as `start_after` to fetch the next
    /// page. `None` means the listing is exhausted.
    pub next_start_after: Option<String>,
}

pub trait ObjectStore {
    /// Conditional create: write only if `key` does not exist. Returns
    /// `false` when the key already exists (the caller lost the race).
    fn put_if_absent(&self, key: &str, bytes: &[u8]) -> Result<bool, BackendError>;

    /// Unconditional write; only used for best-effort hint objects.
    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), BackendError>;

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError>;

    /// Keys under `prefix` in lexicographic order, strictly after
    /// `start_after`, at most `max_keys` per page.
    fn list_page(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        max_keys: usize,
    ) -> Result<ObjectPage, BackendError>;
}

/// Filesystem bucket: one file per key under a root directory.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, BackendError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| BackendError::io(&root, source))?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, BackendError> {
        // Keys are flat strings with '/' separators; refuse traversal.
        if key.split('/').any(|part| part == ".." || part.is_empty()) {
            return Err(BackendError::AccessDenied {
                detail: format!("invalid object key `{key}`"),
            });
        }
        Ok(self.root.join(key))
    }

    fn classify(path: &Path, source: io::Error) -> BackendError {
        match source.kind() {
            io::ErrorKind::PermissionDenied => BackendError::AccessDenied {
                detail: format!("{}: {source}", path.display()),
            },
            _ => BackendError::io(path, source),
        }
    }
}

impl ObjectStore for FsObjectStore {
    fn put_if_absent(&self, key: &str, bytes: &[u8]) -> Result<bool, BackendError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| Self::classify(parent, source))?;
        }
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(source) if source.kind() == io::ErrorKind::AlreadyExists => return Ok(false),
            Err(source) => return Err(Self::classify(&path, source)),
        };
        file.write_all(bytes)
            .and_then(|()| file.sync_all())
            .map_err(|source| Self::classify(&path, source))?;
        Ok(true)
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), BackendError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| Self::classify(parent, source))?;
        }
        fs::write(&path, bytes).map_err(|source| Self::classify(&path, source))
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(source) if source.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(Self::classify(&path, source)),
        }
    }

    fn list_page(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        max_keys: usize,
    ) -> Result<ObjectPage, BackendError> {
        let dir = self.path_for(prefix)?;
        let mut keys = Vec::new();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(source) if source.kind() == io::ErrorKind::NotFound => {
                return Ok(ObjectPage {
                    keys: Vec::new(),
                    next_start_after: None,
                });
            }
            Err(source) => return Err(Self::classify(&dir, source)),
        };
        for entry in entries {
            let entry = entry.map_err(|source| Self::classify(&dir, source))?;
            if !entry
                .file_type()
                .map_err(|source| Self::classify(&dir, source))?
                .is_file()
            {
                continue;
            }
            let key = format!("{prefix}/{}", entry.file_name().to_string_lossy());
            if let Some(after) = start_after {
                if key.as_str() <= after {
                    continue;
                }
            }
            keys.push(key);
        }
        keys.sort();
        let truncated = keys.len() > max_keys;
        keys.truncate(max_keys);
        let next_start_after = if truncated {
            keys.last().cloned()
        } else {
            None
        };
        Ok(ObjectPage {
            keys,
            next_start_after,
        })
    }
}

/// In-memory bucket; cloning shares the underlying map, which is what the
/// concurrent-append race tests rely on.
#[derive(Debug, Clone, Default)]
pub struct MemoryObjectStore {
    objects: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().expect("object map lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ObjectStore for MemoryObjectStore {
    fn put_if_absent(&self, key: &str, bytes: &[u8]) -> Result<bool, BackendError> {
        let mut objects = self.objects.lock().expect("object map lock poisoned");
        if objects.contains_key(key) {
            return Ok(false);
        }
        objects.insert(key.to_string(), bytes.to_vec());
        Ok(true)
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), BackendError> {
        self.objects
            .lock()
            .expect("object map lock poisoned")
            .insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        Ok(self
            .objects
            .lock()
            .expect("object map lock poisoned")
            .get(key)
            .cloned())
    }

    fn list_page(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        max_keys: usize,
    ) -> Result<ObjectPage, BackendError> {
        let objects = self.objects.lock().expect("object map lock poisoned");
        let full_prefix = format!("{prefix}/");
        let mut keys: Vec<String> = objects
            .keys()
            .filter(|k| k.starts_with(&full_prefix))
            .filter(|k| start_after.is_none_or(|after| k.as_str() > after))
            .cloned()
            .collect();
        let truncated = keys.len() > max_keys;
        keys.truncate(max_keys);
        let next_start_after = if truncated {
            keys.last().cloned()
        } else {
            None
        };
        Ok(ObjectPage {
            keys,
            next_start_after,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn fs_conditional_create_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let store = FsObjectStore::open(dir.path()).unwrap();
        assert!(store.put_if_absent("events/a.json", b"one").unwrap());
        assert!(!store.put_if_absent("events/a.json", b"two").unwrap());
        assert_eq!(store.get("events/a.json").unwrap().unwrap(), b"one");
    }

    #[test]
    fn fs_rejects_traversal_keys() {
        let dir = TempDir::new().unwrap();
        let store = FsObjectStore::open(dir.path()).unwrap();
        let err = store.put_if_absent("events/../escape", b"x").unwrap_err();
        assert!(matches!(err, BackendError::AccessDenied { .. }));
    }

    #[test]
    fn memory_pages_in_lexicographic_order() {
        let store = MemoryObjectStore::new();
        for n in [3u64, 1, 2, 0] {
            store
                .put_if_absent(&format!("events/{n:010}.json"), b"{}")
                .unwrap();
        }
        let first = store.list_page("events", None, 3).unwrap();
        assert_eq!(first.keys.len(), 3);
        assert!(first.next_start_after.is_some());
        let second = store
            .list_page("events", first.next_start_after.as_deref(), 3)
            .unwrap();
        assert_eq!(second.keys.len(), 1);
        assert_eq!(second.next_start_after, None);
        assert_eq!(second.keys[0], "events/0000000003.json");
    }

    #[test]
    fn fs_pagination_matches_memory_semantics() {
        let dir = TempDir::new().unwrap();
        let store = FsObjectStore::open(dir.path()).unwrap();
        for n in 0..5u64 {
            store
                .put_if_absent(&format!("events/{n:010}.json"), b"{}")
                .unwrap();
        }
        let page = store.list_page("events", None, 2).unwrap();
        assert_eq!(page.keys, vec![
            "events/0000000000.json".to_string(),
            "events/0000000001.json".to_string(),
        ]);
        let page = store
            .list_page("events", page.next_start_after.as_deref(), 10)
            .unwrap();
        assert_eq!(page.keys.len(), 3);
    }
}
