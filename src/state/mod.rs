//! Persisted run state.
//!
//! One JSON document per feature holds every task, level and worker record.
//! [`StateStore`] is the only writer; all mutation happens inside its
//! locked read-modify-write transactions.

mod document;
mod levels;
mod store;
mod tasks;

pub use document::{ExecutionEvent, StateDocument, STATE_VERSION};
pub use store::{BackendLock, FileBackend, MemoryBackend, StateBackend, StateStore};
pub use tasks::{ownership_violations, StaleTask, StatusUpdate};
