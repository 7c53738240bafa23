use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

use dashmap::DashMap;
use fs2::FileExt;
use session_store_core::StorageError;
use tokio::time::Instant;
use tracing::{debug, instrument};

/// How often a blocked `acquire` retries the OS lock.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Named advisory locks backed by OS-level exclusive file locks.
///
/// - Opens `{base_dir}/locks/{lock_id}.lock` and takes an exclusive lock on it (flock on Unix,
///   LockFileEx on Windows)
/// - Holds the file handle while the lock is held; dropping it releases the lock
/// - A crashed holder releases automatically when the OS closes its descriptors
///
/// Each handle owns its own open file description, so two holders in the same process
/// contend exactly like two processes would.
///
/// Lock files are never deleted. Unlinking one while another handle still has it open
/// would let a third handle lock a fresh file at the same path, giving two holders.
/// Expect one empty file per session identifier ever locked.
#[derive(Debug)]
pub struct FileLock {
    locks_dir: PathBuf,
    poll_interval: Duration,
    /// Active lock handles: lock_id -> File
    handles: DashMap<String, File>,
}

impl FileLock {
    /// Create a new FileLock storing lock files under `{base_dir}/locks`.
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            locks_dir: base_dir.as_ref().join("locks"),
            poll_interval: DEFAULT_POLL_INTERVAL,
            handles: DashMap::new(),
        }
    }

    /// Override the retry interval used while waiting for a contended lock.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Get the path to a lock file.
    fn lock_path(&self, lock_id: &str) -> PathBuf {
        self.locks_dir.join(format!("{}.lock", lock_id))
    }

    /// Ensure the locks directory exists.
    fn ensure_locks_dir(&self) -> Result<(), StorageError> {
        std::fs::create_dir_all(&self.locks_dir).map_err(|e| {
            StorageError::io(
                format!("Failed to create locks dir {}", self.locks_dir.display()),
                e,
            )
        })
    }

    /// Single non-blocking attempt. `None` means another handle holds the lock.
    fn try_acquire(&self, lock_id: &str) -> Result<Option<File>, StorageError> {
        let path = self.lock_path(lock_id);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| {
                StorageError::io(format!("Failed to open lock file {}", path.display()), e)
            })?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(file)),
            Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => Ok(None),
            Err(e) => Err(StorageError::io(
                format!("Failed to lock {}", path.display()),
                e,
            )),
        }
    }

    /// Block until `lock_id` is acquired, or fail once `timeout` has elapsed.
    #[instrument(skip(self), level = "debug")]
    pub async fn acquire(&self, lock_id: &str, timeout: Duration) -> Result<(), StorageError> {
        self.ensure_locks_dir()?;
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(file) = self.try_acquire(lock_id)? {
                self.handles.insert(lock_id.to_string(), file);
                debug!("Acquired lock {}", lock_id);
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                debug!("Lock {} still contended after {:?}", lock_id, timeout);
                return Err(StorageError::LockTimeout {
                    lock_id: lock_id.to_string(),
                    timeout,
                });
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// Take `lock_id` only if it is free right now. Returns whether it was acquired.
    #[instrument(skip(self), level = "debug")]
    pub fn try_acquire_now(&self, lock_id: &str) -> Result<bool, StorageError> {
        self.ensure_locks_dir()?;
        match self.try_acquire(lock_id)? {
            Some(file) => {
                self.handles.insert(lock_id.to_string(), file);
                debug!("Acquired lock {}", lock_id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Release `lock_id` if this instance holds it; otherwise a no-op.
    #[instrument(skip(self), level = "debug")]
    pub fn release(&self, lock_id: &str) -> Result<(), StorageError> {
        let Some((_, file)) = self.handles.remove(lock_id) else {
            debug!("Lock {} not held (no-op)", lock_id);
            return Ok(());
        };

        FileExt::unlock(&file)
            .map_err(|e| StorageError::io(format!("Failed to unlock {}", lock_id), e))?;
        debug!("Released lock {}", lock_id);
        Ok(())
    }

    /// Whether this instance currently holds `lock_id`.
    pub fn is_held(&self, lock_id: &str) -> bool {
        self.handles.contains_key(lock_id)
    }
}
