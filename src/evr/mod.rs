//! Expected Visible Results module
//!
//! An EVR declares a verification of observable task outcome: inputs
//! (`verify`), predicted outputs (`expect`), and a status advanced by
//! recorded runs. The validator gates plan and task completion.

pub mod models;
pub mod validator;

pub use models::*;
pub use validator::EvrValidator;
