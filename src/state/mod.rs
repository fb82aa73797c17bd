//! Persisted infrastructure graphs.
//!
//! The graph produced by the last apply is stored per datacenter and per
//! environment, together with a short apply history. Stores guard each
//! record with a lock while an apply runs.

mod local;
mod lock;
mod s3;
mod store;
mod types;

pub use local::{LocalStateStore, STATE_DIR};
pub use lock::{holder_id, LockInfo, LOCK_EXPIRY_SECS};
pub use s3::S3StateStore;
pub use store::StateStore;
pub use types::{ApplyHistoryEntry, ApplyOperation, StateKey, StateRecord, MAX_HISTORY, STATE_VERSION};
