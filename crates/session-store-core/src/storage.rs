use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::key::SessionKey;

/// Caller-supplied extension columns stored alongside the payload.
pub type AdditionalFields = BTreeMap<String, serde_json::Value>;

/// A session row as held by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub key: SessionKey,
    /// Last-modified instant, unix seconds
    pub timestamp: i64,
    /// Stored payload (ciphertext when a cipher is configured)
    pub payload: Vec<u8>,
    #[serde(default)]
    pub additional_fields: AdditionalFields,
}

/// A change to apply to a record through [`SessionStorage::write_record`].
#[derive(Debug, Clone, PartialEq)]
pub enum RecordUpdate {
    /// Replace every field other than the key.
    Content {
        timestamp: i64,
        payload: Vec<u8>,
        additional_fields: AdditionalFields,
    },
    /// Bump the timestamp only; payload and additional fields are left alone.
    Touch { timestamp: i64 },
}

impl RecordUpdate {
    pub fn timestamp(&self) -> i64 {
        match self {
            RecordUpdate::Content { timestamp, .. } | RecordUpdate::Touch { timestamp } => {
                *timestamp
            }
        }
    }

    pub fn is_touch(&self) -> bool {
        matches!(self, RecordUpdate::Touch { .. })
    }

    /// Apply this update to an existing record, or build a new one.
    ///
    /// A touch on a missing row creates an empty record carrying the timestamp.
    pub fn apply(self, key: SessionKey, existing: Option<SessionRecord>) -> SessionRecord {
        match self {
            RecordUpdate::Content {
                timestamp,
                payload,
                additional_fields,
            } => SessionRecord {
                key,
                timestamp,
                payload,
                additional_fields,
            },
            RecordUpdate::Touch { timestamp } => match existing {
                Some(mut record) => {
                    record.timestamp = timestamp;
                    record
                }
                None => SessionRecord {
                    key,
                    timestamp,
                    payload: Vec::new(),
                    additional_fields: AdditionalFields::new(),
                },
            },
        }
    }
}

/// Storage backend abstraction for session rows and advisory locks.
///
/// Implementations are shared between coordinator instances, so every method takes `&self`.
/// Each call must be atomic on its own; callers never rely on multi-call transactions.
#[async_trait]
pub trait SessionStorage: Send + Sync {
    /// Returns the backend identifier (e.g., "memory", "local").
    fn backend_name(&self) -> &'static str;

    // =========================================================================
    // Lock Operations
    // =========================================================================

    /// Block until the named lock is acquired, failing once `timeout` elapses.
    async fn lock(&self, lock_id: &str, timeout: Duration) -> Result<(), StorageError>;

    /// Release a named lock. Releasing a lock that is not held is a no-op.
    async fn unlock(&self, lock_id: &str) -> Result<(), StorageError>;

    // =========================================================================
    // Record Operations
    // =========================================================================

    /// Load a record, `None` when absent.
    async fn read_record(&self, key: &SessionKey) -> Result<Option<SessionRecord>, StorageError>;

    /// Upsert a record: create it if absent, otherwise apply the update.
    async fn write_record(&self, key: &SessionKey, update: RecordUpdate)
        -> Result<(), StorageError>;

    /// Delete a record. Returns whether it existed.
    async fn delete_record(&self, key: &SessionKey) -> Result<bool, StorageError>;

    /// Delete every record whose timestamp is strictly older than `cutoff`.
    /// Returns the number of records removed.
    async fn expire_older_than(&self, cutoff: i64) -> Result<u64, StorageError>;

    // =========================================================================
    // Topology
    // =========================================================================

    /// Identity of the storage node this backend talks to, used to skew gc.
    async fn node_identity(&self) -> Result<i64, StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(key: SessionKey) -> SessionRecord {
        let mut fields = AdditionalFields::new();
        fields.insert("user_id".to_string(), serde_json::json!(42));
        SessionRecord {
            key,
            timestamp: 100,
            payload: b"payload".to_vec(),
            additional_fields: fields,
        }
    }

    #[test]
    fn test_touch_keeps_payload_and_fields() {
        let key = SessionKey::derive("s");
        let updated = RecordUpdate::Touch { timestamp: 200 }.apply(key, Some(record(key)));
        assert_eq!(updated.timestamp, 200);
        assert_eq!(updated.payload, b"payload");
        assert_eq!(updated.additional_fields["user_id"], serde_json::json!(42));
    }

    #[test]
    fn test_touch_on_missing_creates_empty() {
        let key = SessionKey::derive("s");
        let created = RecordUpdate::Touch { timestamp: 7 }.apply(key, None);
        assert_eq!(created.timestamp, 7);
        assert!(created.payload.is_empty());
        assert!(created.additional_fields.is_empty());
    }

    #[test]
    fn test_content_replaces_fields() {
        let key = SessionKey::derive("s");
        let update = RecordUpdate::Content {
            timestamp: 300,
            payload: b"new".to_vec(),
            additional_fields: AdditionalFields::new(),
        };
        assert!(!update.is_touch());
        assert_eq!(update.timestamp(), 300);
        let updated = update.apply(key, Some(record(key)));
        assert_eq!(updated.payload, b"new");
        assert!(updated.additional_fields.is_empty());
    }
}
