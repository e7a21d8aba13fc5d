//! Task module
//!
//! The structured task entity, its plans/steps/logs, the tool-surface
//! DTOs, and the manager that orchestrates locking, lazy sync, gates,
//! and persistence.

pub mod manager;
pub mod models;

pub use manager::TaskManager;
pub use models::*;
