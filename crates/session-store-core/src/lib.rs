//! Core types and coordination logic for shared session storage.
//!
//! This crate defines the abstractions shared between storage backends and the handler that
//! drives them:
//! - `SessionStorage`: advisory locks, record read/write/delete, bulk expiry
//! - `PayloadCipher`: optional reversible transform around stored payloads
//! - `SessionHandler`: per-request lock, read, write-elision, destroy and gc coordination
//! - `MemoryStorage`: in-process backend

mod cipher;
mod clock;
mod config;
mod error;
mod gc;
mod handler;
mod key;
mod memory;
mod storage;

pub use cipher::PayloadCipher;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{HandlerConfig, DEFAULT_LOCK_TIMEOUT, DEFAULT_UNCHANGED_UPDATE_DELAY};
pub use error::StorageError;
pub use gc::{gc_cutoff, gc_skew, MAX_SKEWED_NODE, ONE_DAY_SECS};
pub use handler::{BeforeWriteHook, LockHandle, SessionHandler, WriteOutcome};
pub use key::{KeyHasher, SessionKey};
pub use memory::MemoryStorage;
pub use storage::{AdditionalFields, RecordUpdate, SessionRecord, SessionStorage};
