//! Opaque key/blob state store backing the feed pipeline: seen-job ids,
//! analysis cache entries, feed snapshots, and the refresh config.
//!
//! Blobs are wrapped in a checksum envelope so corrupt or tampered files are
//! discarded wholesale on load rather than partially trusted. File writes go
//! through a temp file and an atomic rename.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use jobfeed_core::Job;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

pub const CRATE_NAME: &str = "jobfeed-store";

/// Well-known blob keys.
pub mod keys {
    pub const SEEN_JOBS: &str = "seen-jobs";
    pub const ANALYSIS_CACHE: &str = "analysis-cache";
    pub const FEED_SNAPSHOT: &str = "feed-snapshot";
    pub const REFRESH_CONFIG: &str = "refresh-config";
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serializing blob {key}: {source}")]
    Serialize {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("write rejected for blob {key}")]
    WriteRejected { key: String },
}

/// Async key/blob store. Implementations must treat a missing key as
/// `Ok(None)` and a corrupt blob as `Ok(None)` after logging; only genuine
/// I/O failures surface as errors.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn read_blob(&self, key: &str) -> Result<Option<JsonValue>, StoreError>;
    async fn write_blob(&self, key: &str, payload: JsonValue) -> Result<(), StoreError>;
    async fn remove_blob(&self, key: &str) -> Result<(), StoreError>;
}

/// Read a typed blob, treating missing, unreadable, or malformed data as
/// absent. Never fails.
pub async fn load_optional<T: DeserializeOwned>(store: &dyn StateStore, key: &str) -> Option<T> {
    match store.read_blob(key).await {
        Ok(Some(value)) => match serde_json::from_value(value) {
            Ok(parsed) => Some(parsed),
            Err(err) => {
                warn!(key, error = %err, "discarding malformed persisted blob");
                None
            }
        },
        Ok(None) => None,
        Err(err) => {
            warn!(key, error = %err, "failed reading persisted blob, using default");
            None
        }
    }
}

/// Read a typed blob, falling back to `T::default()`.
pub async fn load_or_default<T: DeserializeOwned + Default>(
    store: &dyn StateStore,
    key: &str,
) -> T {
    load_optional(store, key).await.unwrap_or_default()
}

/// Best-effort typed write. Failures are logged; in-memory state remains
/// authoritative for the session and the next successful write self-heals.
pub async fn persist<T: Serialize>(store: &dyn StateStore, key: &str, value: &T) {
    let payload = match serde_json::to_value(value) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(key, error = %err, "failed serializing blob, skipping persist");
            return;
        }
    };
    if let Err(err) = store.write_blob(key, payload).await {
        warn!(key, error = %err, "failed persisting blob, keeping in-memory state");
    }
}

// ---------------------------------------------------------------------------
// Feed snapshot
// ---------------------------------------------------------------------------

/// Persisted feed snapshot. Snapshots older than 24 hours are stale and are
/// discarded on load rather than restored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedSnapshot {
    pub saved_at: DateTime<Utc>,
    pub last_refresh_time: Option<DateTime<Utc>>,
    pub jobs: Vec<Job>,
}

pub const SNAPSHOT_MAX_AGE_HOURS: i64 = 24;

impl PersistedSnapshot {
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        now - self.saved_at > Duration::hours(SNAPSHOT_MAX_AGE_HOURS)
    }
}

/// Load the persisted feed snapshot, applying the staleness gate.
pub async fn load_snapshot(
    store: &dyn StateStore,
    now: DateTime<Utc>,
) -> Option<PersistedSnapshot> {
    let snapshot: PersistedSnapshot = load_optional(store, keys::FEED_SNAPSHOT).await?;
    if snapshot.is_stale(now) {
        warn!(saved_at = %snapshot.saved_at, "discarding stale feed snapshot");
        return None;
    }
    Some(snapshot)
}

// ---------------------------------------------------------------------------
// File-backed store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    checksum: String,
    payload: JsonValue,
}

/// One JSON file per key under a root directory, each wrapped in a sha256
/// integrity envelope.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.json"))
    }

    fn payload_checksum(payload: &JsonValue) -> Result<String, serde_json::Error> {
        let bytes = serde_json::to_vec(payload)?;
        Ok(Self::sha256_hex(&bytes))
    }
}

#[async_trait]
impl StateStore for FileStore {
    async fn read_blob(&self, key: &str) -> Result<Option<JsonValue>, StoreError> {
        let path = self.path_for(key);
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StoreError::Io { path, source: err }),
        };

        let envelope: Envelope = match serde_json::from_str(&text) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(key, error = %err, "discarding unparseable blob file");
                return Ok(None);
            }
        };

        match Self::payload_checksum(&envelope.payload) {
            Ok(checksum) if checksum == envelope.checksum => Ok(Some(envelope.payload)),
            Ok(_) => {
                warn!(key, "discarding blob with checksum mismatch");
                Ok(None)
            }
            Err(err) => {
                warn!(key, error = %err, "discarding blob with unhashable payload");
                Ok(None)
            }
        }
    }

    async fn write_blob(&self, key: &str, payload: JsonValue) -> Result<(), StoreError> {
        let checksum = Self::payload_checksum(&payload).map_err(|err| StoreError::Serialize {
            key: key.to_string(),
            source: err,
        })?;
        let envelope = Envelope { checksum, payload };
        let bytes = serde_json::to_vec_pretty(&envelope).map_err(|err| StoreError::Serialize {
            key: key.to_string(),
            source: err,
        })?;

        fs::create_dir_all(&self.root)
            .await
            .map_err(|err| StoreError::Io {
                path: self.root.clone(),
                source: err,
            })?;

        let path = self.path_for(key);
        let temp_path = self.root.join(format!(".{key}.tmp"));

        let mut file = fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|err| StoreError::Io {
                path: temp_path.clone(),
                source: err,
            })?;
        file.write_all(&bytes).await.map_err(|err| StoreError::Io {
            path: temp_path.clone(),
            source: err,
        })?;
        file.flush().await.map_err(|err| StoreError::Io {
            path: temp_path.clone(),
            source: err,
        })?;
        drop(file);

        match fs::rename(&temp_path, &path).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(StoreError::Io { path, source: err })
            }
        }
    }

    async fn remove_blob(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path_for(key);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StoreError::Io { path, source: err }),
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory store (tests and ephemeral sessions)
// ---------------------------------------------------------------------------

/// HashMap-backed store. `fail_writes` makes every write error, for
/// exercising persistence-failure tolerance.
#[derive(Debug, Default)]
pub struct MemoryStore {
    blobs: Mutex<HashMap<String, JsonValue>>,
    pub fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn read_blob(&self, key: &str) -> Result<Option<JsonValue>, StoreError> {
        Ok(self.blobs.lock().await.get(key).cloned())
    }

    async fn write_blob(&self, key: &str, payload: JsonValue) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::WriteRejected {
                key: key.to_string(),
            });
        }
        self.blobs.lock().await.insert(key.to_string(), payload);
        Ok(())
    }

    async fn remove_blob(&self, key: &str) -> Result<(), StoreError> {
        self.blobs.lock().await.remove(key);
        Ok(())
    }
}
