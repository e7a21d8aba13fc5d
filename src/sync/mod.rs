//! Lazy synchronizer module
//!
//! Reconcile-before-mutate: immediately before each operation the panel is
//! diffed against the task state, panel edits are merged in under the
//! `etag_first_then_ts` policy, conflicts become structured records, and
//! every applied change is audited.

pub mod engine;
pub mod models;

pub use engine::LazySynchronizer;
pub use models::*;
