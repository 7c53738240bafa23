//! Local filesystem backend for the session store.
//!
//! - `LocalStorage`: records as JSON files, one per session key
//! - `FileLock`: named advisory locks on OS exclusive file locks
//! - `Config`: command-line configuration for the `session-store-local` binary

pub mod config;
pub mod lock;
pub mod storage;

pub use lock::FileLock;
pub use storage::LocalStorage;
