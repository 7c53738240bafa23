//! Configuration for the session handler.

use std::time::Duration;

use crate::storage::AdditionalFields;

/// Default time to wait for a session lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Default minimum age of a record before an unchanged write refreshes its timestamp.
pub const DEFAULT_UNCHANGED_UPDATE_DELAY: Duration = Duration::from_secs(300);

/// Configuration for a [`SessionHandler`](crate::SessionHandler).
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    /// How long to wait for the session lock before failing.
    pub lock_timeout: Duration,

    /// Unchanged writes only bump the timestamp once the record is older than this.
    /// Zero refreshes the timestamp on every unchanged write.
    pub unchanged_update_delay: Duration,

    /// Extra fields written with every content write.
    pub additional_data: AdditionalFields,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            unchanged_update_delay: DEFAULT_UNCHANGED_UPDATE_DELAY,
            additional_data: AdditionalFields::new(),
        }
    }
}

impl HandlerConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the lock acquisition timeout.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Set the unchanged-update delay.
    pub fn with_unchanged_update_delay(mut self, delay: Duration) -> Self {
        self.unchanged_update_delay = delay;
        self
    }

    /// Add a field merged into every content write.
    pub fn with_additional_data(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.additional_data.insert(key.into(), value.into());
        self
    }
}
