//! Optional `strand.toml` config file.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use strand_core::HashVersion;
use strand_store::{FileStoreConfig, StoreOptions};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub store: StoreSection,
    pub retry: RetrySection,
    pub leader: LeaderSection,
    pub object_store: ObjectStoreSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    /// Hash payload version stamped on newly appended events ("v1"/"v2").
    pub hash_version: String,
    /// Writer identity embedded in event meta; stable per replica.
    pub writer_id: Option<String>,
    /// Segment rotation thresholds; zero disables.
    pub segment_max_bytes: u64,
    pub segment_max_count: u64,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            hash_version: "v1".to_string(),
            writer_id: None,
            segment_max_bytes: 0,
            segment_max_count: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub jitter_cap_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff_ms: 50,
            jitter_cap_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaderSection {
    pub lease_duration_ms: u64,
    pub renew_deadline_ms: u64,
    pub retry_period_ms: u64,
}

impl Default for LeaderSection {
    fn default() -> Self {
        Self {
            lease_duration_ms: 30_000,
            renew_deadline_ms: 20_000,
            retry_period_ms: 5_000,
        }
    }
}

/// Backend locator for object-store deployments. The CLI itself reads
/// file logs; this section is carried for the operator runtime.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ObjectStoreSection {
    pub endpoint: Option<String>,
    pub bucket: Option<String>,
    pub prefix: Option<String>,
    pub region: Option<String>,
    pub credentials_ref: Option<String>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, String> {
        let contents = fs::read_to_string(path)
            .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
        toml::from_str(&contents).map_err(|e| format!("failed to parse {}: {e}", path.display()))
    }

    /// Explicit path, else `strand.toml` beside the log dir, else
    /// defaults.
    pub fn load_or_default(explicit: Option<&Path>, log_dir: Option<&Path>) -> Self {
        if let Some(path) = explicit {
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    tracing::warn!("config load failed, using defaults: {e}");
                    return Self::default();
                }
            }
        }
        if let Some(dir) = log_dir {
            let implicit = dir.join("strand.toml");
            if implicit.exists() {
                match Self::load(&implicit) {
                    Ok(cfg) => return cfg,
                    Err(e) => tracing::warn!("config load failed, using defaults: {e}"),
                }
            }
        }
        Self::default()
    }

    pub fn file_store_config(&self) -> FileStoreConfig {
        let hash_version = match self.store.hash_version.as_str() {
            "v2" => HashVersion::V2,
            _ => HashVersion::V1,
        };
        FileStoreConfig {
            segment_max_bytes: self.store.segment_max_bytes,
            segment_max_records: self.store.segment_max_count,
            options: StoreOptions {
                hash_version,
                writer_id: self.store.writer_id.clone(),
            },
        }
    }
}
