//! Kalman estimation state storage.
//!
//! This crate provides:
//! - The [`StateStore`] adapter trait the engine persists through
//! - [`MemoryStore`], a process-local backend for tests and embedding
//! - [`JsonFileStore`], a directory-of-JSON-files backend for the CLI
//!
//! Every committed [`MetricState`](ke_common::MetricState) is also kept as a
//! versioned snapshot; states are superseded, never deleted.

pub mod error;
pub mod file;
pub mod memory;
pub mod store;

#[cfg(test)]
mod test_support;

pub use error::{StoreError, StoreResult};
pub use file::{default_store_dir, JsonFileStore};
pub use memory::MemoryStore;
pub use store::{CycleCommit, RetentionPolicy, StateStore};
