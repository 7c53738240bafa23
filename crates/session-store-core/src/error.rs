use std::error::Error as StdError;
use std::time::Duration;

use thiserror::Error;

type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Errors that can occur in the session storage layer.
///
/// Every backend fault surfaces through this type. Variants that wrap a lower-level
/// failure keep it as [`std::error::Error::source`].
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {message}")]
    Serialization {
        message: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Timed out after {}s waiting for lock {lock_id}", .timeout.as_secs())]
    LockTimeout { lock_id: String, timeout: Duration },

    #[error("Cipher error: {0}")]
    Cipher(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{message}")]
    Backend {
        message: String,
        #[source]
        source: BoxError,
    },
}

impl StorageError {
    /// Wrap an arbitrary backend error, keeping it as the source.
    ///
    /// The display message defaults to the wrapped error's own message.
    pub fn from_source<E>(source: E, message: Option<&str>) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        let message = message
            .map(str::to_string)
            .unwrap_or_else(|| source.to_string());
        StorageError::Backend {
            message,
            source: Box::new(source),
        }
    }

    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        StorageError::Io {
            message: message.into(),
            source,
        }
    }

    pub fn serialization(message: impl Into<String>, source: serde_json::Error) -> Self {
        StorageError::Serialization {
            message: message.into(),
            source,
        }
    }

    /// Whether this error is a lock acquisition timeout.
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, StorageError::LockTimeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_source_keeps_cause() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "peer went away");
        let err = StorageError::from_source(io, None);
        assert_eq!(err.to_string(), "peer went away");
        let source = err.source().expect("source should be preserved");
        assert_eq!(source.to_string(), "peer went away");
    }

    #[test]
    fn test_from_source_with_message() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err = StorageError::from_source(io, Some("query failed"));
        assert_eq!(err.to_string(), "query failed");
        assert_eq!(err.source().unwrap().to_string(), "boom");
    }

    #[test]
    fn test_lock_timeout_display() {
        let err = StorageError::LockTimeout {
            lock_id: "abc".to_string(),
            timeout: Duration::from_secs(5),
        };
        assert!(err.is_lock_timeout());
        assert_eq!(err.to_string(), "Timed out after 5s waiting for lock abc");
    }
}
