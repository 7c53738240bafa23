use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Storage row key: the SHA-256 digest of a session identifier.
///
/// The raw identifier never reaches the backend for record operations.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionKey([u8; 32]);

impl SessionKey {
    /// Hash a session identifier into a key.
    pub fn derive(session_id: &str) -> Self {
        let digest = Sha256::digest(session_id.as_bytes());
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex form, used for lock names and file names.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a key back from its hex form.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(arr))
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionKey({})", &self.to_hex()[..12])
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Per-instance memo of identifier digests.
///
/// Each identifier is hashed at most once for the lifetime of the hasher.
#[derive(Debug, Default)]
pub struct KeyHasher {
    cache: HashMap<String, SessionKey>,
    computed: usize,
}

impl KeyHasher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the key for `session_id`, hashing only on first sight.
    pub fn key(&mut self, session_id: &str) -> SessionKey {
        if let Some(key) = self.cache.get(session_id) {
            return *key;
        }
        let key = SessionKey::derive(session_id);
        self.computed += 1;
        self.cache.insert(session_id.to_string(), key);
        key
    }

    /// Hex-encoded digest, used as the advisory lock name.
    pub fn lock_id(&mut self, session_id: &str) -> String {
        self.key(session_id).to_hex()
    }

    /// Number of digests actually computed so far.
    pub fn computed(&self) -> usize {
        self.computed
    }

    pub fn clear(&mut self) {
        self.cache.clear();
        self.computed = 0;
    }
}
