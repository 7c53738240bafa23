use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use session_store_core::{
    AdditionalFields, RecordUpdate, SessionKey, SessionRecord, SessionStorage, StorageError,
};
use tokio::fs;
use tracing::{debug, instrument, warn};

use crate::lock::FileLock;

/// On-disk shape of a record. The key is the file name.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RecordFile {
    timestamp: i64,
    /// Base64 of the stored payload
    payload: String,
    #[serde(default)]
    additional_fields: AdditionalFields,
}

impl RecordFile {
    fn from_record(record: &SessionRecord) -> Self {
        Self {
            timestamp: record.timestamp,
            payload: BASE64.encode(&record.payload),
            additional_fields: record.additional_fields.clone(),
        }
    }

    fn into_record(self, key: SessionKey) -> Result<SessionRecord, StorageError> {
        let payload = BASE64.decode(self.payload.as_bytes()).map_err(|e| {
            StorageError::from_source(e, Some(format!("Corrupt payload in record {}", key).as_str()))
        })?;
        Ok(SessionRecord {
            key,
            timestamp: self.timestamp,
            payload,
            additional_fields: self.additional_fields,
        })
    }
}

/// Local filesystem session store, shareable between processes on one host.
///
/// Layout:
/// ```text
/// {base_dir}/
///   records/
///     {hex session key}.json
///   locks/
///     {lock_id}.lock
/// ```
#[derive(Debug)]
pub struct LocalStorage {
    base_dir: PathBuf,
    locks: FileLock,
    node_identity: i64,
}

impl LocalStorage {
    /// Create a new LocalStorage rooted at `base_dir`, reporting `node_identity` to gc.
    pub fn new(base_dir: impl AsRef<Path>, node_identity: i64) -> Self {
        let base_dir = base_dir.as_ref().to_path_buf();
        Self {
            locks: FileLock::new(&base_dir),
            base_dir,
            node_identity,
        }
    }

    /// Get the records directory.
    fn records_dir(&self) -> PathBuf {
        self.base_dir.join("records")
    }

    /// Get the path to a record file.
    fn record_path(&self, key: &SessionKey) -> PathBuf {
        self.records_dir().join(format!("{}.json", key.to_hex()))
    }

    /// Ensure the records directory exists.
    async fn ensure_records_dir(&self) -> Result<(), StorageError> {
        let dir = self.records_dir();
        fs::create_dir_all(&dir).await.map_err(|e| {
            StorageError::io(format!("Failed to create records dir {}", dir.display()), e)
        })
    }

    async fn load(&self, path: &Path) -> Result<Option<RecordFile>, StorageError> {
        let content = match fs::read(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StorageError::io(
                    format!("Failed to read {}", path.display()),
                    e,
                ))
            }
        };

        let file = serde_json::from_slice(&content).map_err(|e| {
            StorageError::serialization(format!("Failed to parse {}", path.display()), e)
        })?;
        Ok(Some(file))
    }

    /// Delete an expired record under its session lock.
    ///
    /// A record whose lock is busy belongs to a live request and is left for the next gc.
    async fn expire_locked(
        &self,
        path: &Path,
        lock_id: &str,
        cutoff: i64,
    ) -> Result<bool, StorageError> {
        if !self.locks.try_acquire_now(lock_id)? {
            debug!("Record {} is locked, skipping", lock_id);
            return Ok(false);
        }
        let result = self.remove_if_stale(path, cutoff).await;
        self.locks.release(lock_id)?;
        result
    }

    /// Re-check a record's timestamp and delete it only if it is still older than `cutoff`.
    ///
    /// The file is first renamed to a tombstone, so a write racing with gc lands in a new
    /// file instead of the one being deleted.
    async fn remove_if_stale(&self, path: &Path, cutoff: i64) -> Result<bool, StorageError> {
        let tombstone = path.with_extension(format!("json.{}.gc", std::process::id()));
        match fs::rename(path, &tombstone).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => {
                return Err(StorageError::io(
                    format!("Failed to move aside {}", path.display()),
                    e,
                ))
            }
        }

        let stale = match self.load(&tombstone).await {
            Ok(Some(file)) => file.timestamp < cutoff,
            Ok(None) => return Ok(false),
            Err(e) => {
                warn!("Keeping unreadable record {}: {}", path.display(), e);
                false
            }
        };

        if !stale {
            // Restore, unless a newer write already took the path
            match fs::hard_link(&tombstone, path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    debug!("{} rewritten during gc", path.display());
                }
                Err(e) => {
                    return Err(StorageError::io(
                        format!("Failed to restore {}", path.display()),
                        e,
                    ))
                }
            }
        }

        fs::remove_file(&tombstone).await.map_err(|e| {
            StorageError::io(format!("Failed to delete {}", tombstone.display()), e)
        })?;
        Ok(stale)
    }
}

#[async_trait]
impl SessionStorage for LocalStorage {
    fn backend_name(&self) -> &'static str {
        "local"
    }

    // =========================================================================
    // Lock Operations
    // =========================================================================

    async fn lock(&self, lock_id: &str, timeout: Duration) -> Result<(), StorageError> {
        self.locks.acquire(lock_id, timeout).await
    }

    async fn unlock(&self, lock_id: &str) -> Result<(), StorageError> {
        self.locks.release(lock_id)
    }

    // =========================================================================
    // Record Operations
    // =========================================================================

    #[instrument(skip(self), level = "debug")]
    async fn read_record(&self, key: &SessionKey) -> Result<Option<SessionRecord>, StorageError> {
        let path = self.record_path(key);
        match self.load(&path).await? {
            Some(file) => {
                let record = file.into_record(*key)?;
                debug!("Loaded {:?} ({} bytes)", key, record.payload.len());
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    #[instrument(skip(self, update), level = "debug", fields(touch = update.is_touch()))]
    async fn write_record(
        &self,
        key: &SessionKey,
        update: RecordUpdate,
    ) -> Result<(), StorageError> {
        self.ensure_records_dir().await?;
        let path = self.record_path(key);

        let existing = if update.is_touch() {
            match self.load(&path).await? {
                Some(file) => Some(file.into_record(*key)?),
                None => None,
            }
        } else {
            None
        };
        let record = update.apply(*key, existing);

        let content = serde_json::to_vec(&RecordFile::from_record(&record)).map_err(|e| {
            StorageError::serialization(format!("Failed to serialize record {}", key), e)
        })?;

        // Write atomically via temp file
        let temp_path = path.with_extension(format!("json.{}.tmp", std::process::id()));
        fs::write(&temp_path, &content).await.map_err(|e| {
            StorageError::io(format!("Failed to write {}", temp_path.display()), e)
        })?;
        fs::rename(&temp_path, &path).await.map_err(|e| {
            StorageError::io(format!("Failed to rename to {}", path.display()), e)
        })?;

        debug!("Saved {:?} ({} bytes)", key, record.payload.len());
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete_record(&self, key: &SessionKey) -> Result<bool, StorageError> {
        let path = self.record_path(key);
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!("Deleted {:?}", key);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::io(
                format!("Failed to delete {}", path.display()),
                e,
            )),
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn expire_older_than(&self, cutoff: i64) -> Result<u64, StorageError> {
        let dir = self.records_dir();
        if !dir.exists() {
            return Ok(0);
        }

        let mut entries = fs::read_dir(&dir).await.map_err(|e| {
            StorageError::io(format!("Failed to read dir {}", dir.display()), e)
        })?;

        let mut removed = 0u64;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::io("Failed to read dir entry", e))?
        {
            let path = entry.path();
            if !path.extension().is_some_and(|ext| ext == "json") {
                continue;
            }

            let file = match self.load(&path).await {
                Ok(Some(file)) => file,
                // Removed concurrently
                Ok(None) => continue,
                Err(e) => {
                    warn!("Skipping unreadable record {}: {}", path.display(), e);
                    continue;
                }
            };
            if file.timestamp >= cutoff {
                continue;
            }

            let Some(lock_id) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            if self.expire_locked(&path, lock_id, cutoff).await? {
                removed += 1;
            }
        }

        debug!("Expired {} records older than {}", removed, cutoff);
        Ok(removed)
    }

    // =========================================================================
    // Topology
    // =========================================================================

    async fn node_identity(&self) -> Result<i64, StorageError> {
        Ok(self.node_identity)
    }
}
