//! Project Registry module
//!
//! Maps filesystem paths to stable project identities and records them in a
//! process-shared global registry so identity survives between processes.

pub mod manager;
pub mod models;

pub use manager::ProjectRegistry;
pub use models::*;
