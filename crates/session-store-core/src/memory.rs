use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, instrument};

use crate::error::StorageError;
use crate::key::SessionKey;
use crate::storage::{RecordUpdate, SessionRecord, SessionStorage};

/// In-process storage backend.
///
/// Records live in a concurrent map. Locks are per-name async mutexes whose guards are
/// parked in `held` until released, so a second holder waits on the mutex until the
/// first one unlocks or its timeout elapses.
#[derive(Debug)]
pub struct MemoryStorage {
    records: DashMap<SessionKey, SessionRecord>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    held: DashMap<String, OwnedMutexGuard<()>>,
    node_identity: i64,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::with_node_identity(1)
    }

    /// Create a store reporting the given node identity to gc.
    pub fn with_node_identity(node_identity: i64) -> Self {
        Self {
            records: DashMap::new(),
            locks: DashMap::new(),
            held: DashMap::new(),
            node_identity,
        }
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Whether the named lock is currently held.
    pub fn is_locked(&self, lock_id: &str) -> bool {
        self.held.contains_key(lock_id)
    }

    fn lock_slot(&self, lock_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(lock_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[async_trait]
impl SessionStorage for MemoryStorage {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    #[instrument(skip(self), level = "debug")]
    async fn lock(&self, lock_id: &str, timeout: Duration) -> Result<(), StorageError> {
        let slot = self.lock_slot(lock_id);
        match tokio::time::timeout(timeout, slot.lock_owned()).await {
            Ok(guard) => {
                self.held.insert(lock_id.to_string(), guard);
                debug!("Acquired lock {}", lock_id);
                Ok(())
            }
            Err(_) => {
                debug!("Gave up on lock {} after {:?}", lock_id, timeout);
                Err(StorageError::LockTimeout {
                    lock_id: lock_id.to_string(),
                    timeout,
                })
            }
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn unlock(&self, lock_id: &str) -> Result<(), StorageError> {
        // Guard is dropped here, before the slot's reference count is checked
        let released = self.held.remove(lock_id).is_some();
        // Free the slot unless a waiter still holds a reference to it
        self.locks.remove_if(lock_id, |_, slot| Arc::strong_count(slot) == 1);

        if released {
            debug!("Released lock {}", lock_id);
        } else {
            debug!("Lock {} not held (no-op)", lock_id);
        }
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn read_record(&self, key: &SessionKey) -> Result<Option<SessionRecord>, StorageError> {
        Ok(self.records.get(key).map(|r| r.value().clone()))
    }

    #[instrument(skip(self, update), level = "debug", fields(touch = update.is_touch()))]
    async fn write_record(
        &self,
        key: &SessionKey,
        update: RecordUpdate,
    ) -> Result<(), StorageError> {
        match self.records.entry(*key) {
            Entry::Occupied(mut entry) => {
                let current = entry.get().clone();
                entry.insert(update.apply(*key, Some(current)));
            }
            Entry::Vacant(entry) => {
                entry.insert(update.apply(*key, None));
            }
        }
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete_record(&self, key: &SessionKey) -> Result<bool, StorageError> {
        Ok(self.records.remove(key).is_some())
    }

    #[instrument(skip(self), level = "debug")]
    async fn expire_older_than(&self, cutoff: i64) -> Result<u64, StorageError> {
        let mut removed = 0u64;
        self.records.retain(|_, record| {
            let keep = record.timestamp >= cutoff;
            if !keep {
                removed += 1;
            }
            keep
        });
        debug!("Expired {} records older than {}", removed, cutoff);
        Ok(removed)
    }

    async fn node_identity(&self) -> Result<i64, StorageError> {
        Ok(self.node_identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::AdditionalFields;

    fn content(timestamp: i64, payload: &[u8]) -> RecordUpdate {
        RecordUpdate::Content {
            timestamp,
            payload: payload.to_vec(),
            additional_fields: AdditionalFields::new(),
        }
    }

    #[tokio::test]
    async fn test_write_read_delete() {
        let storage = MemoryStorage::new();
        let key = SessionKey::derive("abc");

        assert!(storage.read_record(&key).await.unwrap().is_none());

        storage.write_record(&key, content(10, b"hello")).await.unwrap();
        let record = storage.read_record(&key).await.unwrap().unwrap();
        assert_eq!(record.payload, b"hello");
        assert_eq!(record.timestamp, 10);

        storage
            .write_record(&key, RecordUpdate::Touch { timestamp: 20 })
            .await
            .unwrap();
        let record = storage.read_record(&key).await.unwrap().unwrap();
        assert_eq!(record.payload, b"hello");
        assert_eq!(record.timestamp, 20);

        assert!(storage.delete_record(&key).await.unwrap());
        assert!(!storage.delete_record(&key).await.unwrap());
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn test_expire_strictly_older() {
        let storage = MemoryStorage::new();
        for (id, ts) in [("a", 100), ("b", 200), ("c", 300)] {
            storage
                .write_record(&SessionKey::derive(id), content(ts, b"x"))
                .await
                .unwrap();
        }

        let removed = storage.expire_older_than(200).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(storage.len(), 2);
        assert!(storage
            .read_record(&SessionKey::derive("b"))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_lock_times_out_while_held() {
        let storage = MemoryStorage::new();
        storage.lock("l", Duration::from_secs(1)).await.unwrap();
        assert!(storage.is_locked("l"));

        let err = storage
            .lock("l", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.is_lock_timeout());

        storage.unlock("l").await.unwrap();
        assert!(!storage.is_locked("l"));
        storage.lock("l", Duration::from_millis(50)).await.unwrap();
    }

    #[tokio::test]
    async fn test_unlock_unknown_is_noop() {
        let storage = MemoryStorage::new();
        storage.unlock("never-locked").await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_waiter_acquires_after_release() {
        let storage = Arc::new(MemoryStorage::new());
        storage.lock("l", Duration::from_secs(1)).await.unwrap();

        let waiter = {
            let storage = Arc::clone(&storage);
            tokio::spawn(async move { storage.lock("l", Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        storage.unlock("l").await.unwrap();
        waiter.await.unwrap().unwrap();
        assert!(storage.is_locked("l"));
    }

    #[tokio::test]
    async fn test_unlock_frees_lock_slots() {
        let storage = MemoryStorage::new();
        for i in 0..1000 {
            let lock_id = format!("session-{}", i);
            storage.lock(&lock_id, Duration::from_secs(1)).await.unwrap();
            storage.unlock(&lock_id).await.unwrap();
        }
        assert!(storage.held.is_empty());
        assert!(storage.locks.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unlock_keeps_slot_with_waiter() {
        let storage = Arc::new(MemoryStorage::new());
        storage.lock("l", Duration::from_secs(1)).await.unwrap();

        let waiter = {
            let storage = Arc::clone(&storage);
            tokio::spawn(async move { storage.lock("l", Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Waiter references the slot, so it survives and the waiter gets it
        storage.unlock("l").await.unwrap();
        waiter.await.unwrap().unwrap();
        assert!(storage.is_locked("l"));
        assert_eq!(storage.locks.len(), 1);

        // A fresh locker must still contend with the waiter's hold
        let err = storage
            .lock("l", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.is_lock_timeout());

        storage.unlock("l").await.unwrap();
        assert!(storage.locks.is_empty());
    }

    #[tokio::test]
    async fn test_node_identity() {
        let storage = MemoryStorage::with_node_identity(3);
        assert_eq!(storage.node_identity().await.unwrap(), 3);
        assert_eq!(storage.backend_name(), "memory");
    }
}
