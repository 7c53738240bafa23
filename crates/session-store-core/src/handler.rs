use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::cipher::PayloadCipher;
use crate::clock::{Clock, SystemClock};
use crate::config::HandlerConfig;
use crate::error::StorageError;
use crate::gc::gc_cutoff;
use crate::key::KeyHasher;
use crate::storage::{RecordUpdate, SessionStorage};

/// Callback run right before a content write, with the session identifier.
pub type BeforeWriteHook = Box<dyn Fn(&str) + Send + Sync>;

/// An advisory lock held by a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    pub lock_id: String,
    pub timeout: Duration,
}

/// What a call to [`SessionHandler::write`] did to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Payload and additional fields were persisted.
    Content,
    /// Payload was unchanged; only the timestamp was refreshed.
    Touched,
    /// Payload was unchanged and the record is still fresh; nothing was written.
    Skipped,
}

/// Snapshot of the last read of a session, used to elide redundant writes.
#[derive(Debug, Clone)]
struct CachedRead {
    plaintext: Vec<u8>,
    timestamp: i64,
}

/// Drives one session cycle (`open → (read | write)* → close`, or `destroy`) against a
/// shared [`SessionStorage`].
///
/// A handler serves a single request: it holds at most one lock, named after the
/// current session identifier, from the first operation until `close` or `destroy`.
/// Other handlers for the same identifier block in `open` until then. Calls are
/// sequential; each backend call is awaited before the next one is issued.
pub struct SessionHandler {
    storage: Arc<dyn SessionStorage>,
    config: HandlerConfig,
    cipher: Option<Arc<dyn PayloadCipher>>,
    clock: Arc<dyn Clock>,
    session_id: String,
    hasher: KeyHasher,
    lock: Option<LockHandle>,
    last_read: HashMap<String, CachedRead>,
    before_write: Vec<BeforeWriteHook>,
}

impl fmt::Debug for SessionHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandler")
            .field("backend", &self.storage.backend_name())
            .field("config", &self.config)
            .field("cipher", &self.cipher.is_some())
            .field("lock", &self.lock)
            .field("cached_reads", &self.last_read.len())
            .field("before_write_hooks", &self.before_write.len())
            .finish()
    }
}

impl SessionHandler {
    /// Create a handler for the request whose current session is `session_id`.
    pub fn new(storage: Arc<dyn SessionStorage>, session_id: impl Into<String>) -> Self {
        Self {
            storage,
            config: HandlerConfig::default(),
            cipher: None,
            clock: Arc::new(SystemClock),
            session_id: session_id.into(),
            hasher: KeyHasher::new(),
            lock: None,
            last_read: HashMap::new(),
            before_write: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: HandlerConfig) -> Self {
        self.config = config;
        self
    }

    /// Encrypt payloads on the way in and decrypt them on the way out.
    pub fn with_cipher(mut self, cipher: Arc<dyn PayloadCipher>) -> Self {
        self.cipher = Some(cipher);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Register a hook fired before every content write, in registration order.
    pub fn on_before_data_write<F>(&mut self, hook: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.before_write.push(Box::new(hook));
    }

    /// Add a field merged into every content write.
    pub fn set_additional_data(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.config.additional_data.insert(key.into(), value.into());
    }

    pub fn config(&self) -> &HandlerConfig {
        &self.config
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The lock currently held, if any.
    pub fn lock_handle(&self) -> Option<&LockHandle> {
        self.lock.as_ref()
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }

    /// Start a new cycle for `session_id`: release any held lock and drop per-cycle state.
    pub async fn reset(&mut self, session_id: impl Into<String>) -> Result<(), StorageError> {
        self.unlock().await?;
        self.session_id = session_id.into();
        self.hasher.clear();
        self.last_read.clear();
        Ok(())
    }

    // =========================================================================
    // Locking
    // =========================================================================

    async fn lock(&mut self) -> Result<(), StorageError> {
        if self.lock.is_some() {
            return Ok(());
        }

        let lock_id = self.hasher.lock_id(&self.session_id);
        let timeout = self.config.lock_timeout;
        self.storage.lock(&lock_id, timeout).await?;
        debug!("Holding session lock {}", lock_id);
        self.lock = Some(LockHandle { lock_id, timeout });
        Ok(())
    }

    async fn unlock(&mut self) -> Result<(), StorageError> {
        let Some(handle) = self.lock.as_ref() else {
            return Ok(());
        };

        self.storage.unlock(&handle.lock_id).await?;
        debug!("Released session lock {}", handle.lock_id);
        self.lock = None;
        Ok(())
    }

    // =========================================================================
    // Session Operations
    // =========================================================================

    /// Acquire the lock for the current session.
    #[instrument(skip(self), level = "debug")]
    pub async fn open(&mut self, save_path: &str, name: &str) -> Result<(), StorageError> {
        self.lock().await
    }

    /// Release the lock if held.
    #[instrument(skip(self), level = "debug")]
    pub async fn close(&mut self) -> Result<(), StorageError> {
        self.unlock().await
    }

    /// Load a session's plaintext payload; empty when there is no record.
    #[instrument(skip_all, level = "debug")]
    pub async fn read(&mut self, session_id: &str) -> Result<Vec<u8>, StorageError> {
        self.lock().await?;
        let key = self.hasher.key(session_id);

        let Some(record) = self.storage.read_record(&key).await? else {
            debug!("No record for {:?}", key);
            self.last_read.remove(session_id);
            return Ok(Vec::new());
        };

        let plaintext = match &self.cipher {
            Some(cipher) => cipher.decrypt(&record.payload)?,
            None => record.payload,
        };

        debug!(
            "Read {:?} ({} bytes, timestamp {})",
            key,
            plaintext.len(),
            record.timestamp
        );
        self.last_read.insert(
            session_id.to_string(),
            CachedRead {
                plaintext: plaintext.clone(),
                timestamp: record.timestamp,
            },
        );
        Ok(plaintext)
    }

    /// Persist a session's payload, eliding the write when nothing changed.
    ///
    /// A payload that differs from the last read (or was never read) is always written
    /// in full. An unchanged payload only refreshes the timestamp, and only once the
    /// record is older than the unchanged-update delay.
    #[instrument(skip_all, level = "debug", fields(payload_len = payload.len()))]
    pub async fn write(
        &mut self,
        session_id: &str,
        payload: &[u8],
    ) -> Result<WriteOutcome, StorageError> {
        self.lock().await?;
        let key = self.hasher.key(session_id);
        let now = self.clock.now();

        let cached = self
            .last_read
            .get(session_id)
            .filter(|cached| cached.plaintext == payload)
            .map(|cached| cached.timestamp);

        let Some(read_at) = cached else {
            let stored = match &self.cipher {
                Some(cipher) => cipher.encrypt(payload)?,
                None => payload.to_vec(),
            };

            for hook in &self.before_write {
                hook(session_id);
            }

            let update = RecordUpdate::Content {
                timestamp: now,
                payload: stored,
                additional_fields: self.config.additional_data.clone(),
            };
            self.storage.write_record(&key, update).await?;
            debug!("Wrote {:?} ({} bytes)", key, payload.len());

            self.last_read.insert(
                session_id.to_string(),
                CachedRead {
                    plaintext: payload.to_vec(),
                    timestamp: now,
                },
            );
            return Ok(WriteOutcome::Content);
        };

        let delay = self.config.unchanged_update_delay;
        let delay_secs = i64::try_from(delay.as_secs()).unwrap_or(i64::MAX);
        if !delay.is_zero() && now.saturating_sub(read_at) <= delay_secs {
            debug!("Unchanged {:?} is fresh, skipping write", key);
            return Ok(WriteOutcome::Skipped);
        }

        self.storage
            .write_record(&key, RecordUpdate::Touch { timestamp: now })
            .await?;
        debug!("Touched {:?} (last modified {})", key, read_at);
        if let Some(cached) = self.last_read.get_mut(session_id) {
            cached.timestamp = now;
        }
        Ok(WriteOutcome::Touched)
    }

    /// Delete a session's record and end the cycle.
    #[instrument(skip_all, level = "debug")]
    pub async fn destroy(&mut self, session_id: &str) -> Result<(), StorageError> {
        self.lock().await?;
        let key = self.hasher.key(session_id);
        let existed = self.storage.delete_record(&key).await?;
        self.last_read.remove(session_id);
        debug!("Destroyed {:?} (existed: {})", key, existed);
        self.unlock().await
    }

    /// Expire records untouched for longer than `max_lifetime`, skewed by node identity.
    ///
    /// Returns the number of records removed.
    #[instrument(skip(self), level = "debug")]
    pub async fn gc(&mut self, max_lifetime: Duration) -> Result<u64, StorageError> {
        let max_lifetime = i64::try_from(max_lifetime.as_secs()).unwrap_or(i64::MAX);
        let node = self.storage.node_identity().await?;
        let cutoff = gc_cutoff(self.clock.now(), max_lifetime, node);

        let removed = self.storage.expire_older_than(cutoff).await?;
        info!(
            "Session gc on node {} removed {} records older than {}",
            node, removed, cutoff
        );
        Ok(removed)
    }
}

impl Drop for SessionHandler {
    fn drop(&mut self) {
        if let Some(handle) = &self.lock {
            warn!(
                "Session handler dropped while holding lock {}; it stays held until the backend expires it",
                handle.lock_id
            );
        }
    }
}
