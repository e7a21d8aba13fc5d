//! Cross-process concurrency module
//!
//! Serializes mutations to each task across cooperating processes that
//! share a project root: per-task lock files with TTL and stale reclaim,
//! optimistic state version counters, wait-for-graph deadlock analysis,
//! and task snapshots.

pub mod deadlock;
pub mod lock;
pub mod models;
pub mod snapshot;
pub mod version;

pub use deadlock::{detect_deadlocks, would_deadlock};
pub use lock::LockManager;
pub use models::*;
pub use snapshot::SnapshotStore;
pub use version::StateVersionStore;
