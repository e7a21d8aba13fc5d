//! Engine error taxonomy and wire codes
//!
//! Every public operation returns `Result<T, WaveError>`. Each error variant
//! maps onto exactly one fixed wire code via [`WaveError::code`]; hosts
//! surface the code plus the human-readable message to the agent.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, WaveError>;

/// Fixed wire codes surfaced to the host protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NoProjectBound,
    InvalidRoot,
    NotFound,
    MultipleCandidates,
    NoActiveTask,
    EvrNotReady,
    SyncConflict,
    CorruptedLock,
    ForeignLock,
    StateVersionConflict,
    ValidationError,
    FileSystemError,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NoProjectBound => "NO_PROJECT_BOUND",
            Self::InvalidRoot => "INVALID_ROOT",
            Self::NotFound => "NOT_FOUND",
            Self::MultipleCandidates => "MULTIPLE_CANDIDATES",
            Self::NoActiveTask => "NO_ACTIVE_TASK",
            Self::EvrNotReady => "EVR_NOT_READY",
            Self::SyncConflict => "SYNC_CONFLICT",
            Self::CorruptedLock => "CORRUPTED_LOCK",
            Self::ForeignLock => "FOREIGN_LOCK",
            Self::StateVersionConflict => "STATE_VERSION_CONFLICT",
            Self::ValidationError => "VALIDATION_ERROR",
            Self::FileSystemError => "FILE_SYSTEM_ERROR",
        };
        write!(f, "{}", s)
    }
}

/// Engine error type.
///
/// Variants follow the taxonomy: validation, filesystem, concurrency,
/// not-found, illegal state transition, EVR gate, sync, parse/render,
/// project identity, system.
#[derive(Debug, thiserror::Error)]
pub enum WaveError {
    /// Bad input shape (length bounds, count bounds, malformed ids)
    #[error("validation failed: {0}")]
    Validation(String),

    /// I/O and permission failures, with the path that failed
    #[error("filesystem error at {path}: {source}")]
    FileSystem {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Lock wait exceeded its deadline
    #[error("timed out acquiring lock for task {task_id} after {waited_ms}ms")]
    LockTimeout { task_id: String, waited_ms: u64 },

    /// Lock file exists but does not parse
    #[error("corrupted lock file for task {0}")]
    CorruptedLock(String),

    /// Attempted to release or force a lock held by another process
    #[error("lock for task {task_id} is held by process {holder}")]
    ForeignLock { task_id: String, holder: String },

    /// Optimistic write lost the race; caller re-reads and retries
    #[error("state version conflict for task {task_id}: expected {expected}, found {found}")]
    VersionConflict {
        task_id: String,
        expected: u64,
        found: u64,
    },

    /// Operation cancelled via its abort signal
    #[error("operation cancelled")]
    Cancelled,

    /// Missing task / plan / step / EVR / project
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// A lookup matched more than one project
    #[error("multiple projects match: {0}")]
    MultipleCandidates(String),

    /// No task is currently active in the bound project
    #[error("no active task")]
    NoActiveTask,

    /// No project is bound for the requested operation
    #[error("no project bound")]
    NoProjectBound,

    /// Project root is missing or not a directory
    #[error("invalid project root: {0}")]
    InvalidRoot(String),

    /// Illegal status transition
    #[error("illegal transition for {entity} {id}: {from} -> {to}")]
    IllegalTransition {
        entity: &'static str,
        id: String,
        from: String,
        to: String,
    },

    /// A completion gate is not satisfied; carries the blocking EVRs
    #[error("expected results not ready: {} pending", required_final.len())]
    EvrNotReady {
        required_final: Vec<crate::evr::RequiredFinal>,
    },

    /// Panel/state reconcile produced an unresolvable conflict
    #[error("sync conflict in {region}: {reason}")]
    SyncConflict { region: String, reason: String },

    /// Panel text did not parse (fatal on write paths only)
    #[error("panel parse failed: {0}")]
    Parse(String),

    /// Panel render failed (template failure)
    #[error("panel render failed: {0}")]
    Render(String),

    /// On-disk project identity disagrees with the registry
    #[error("project identity mismatch for {0}")]
    Project(String),

    /// Registry file exists but is not valid JSON
    #[error("corrupted registry at {0}")]
    CorruptedRegistry(String),

    /// Clock or environment problem
    #[error("system error: {0}")]
    System(String),
}

impl WaveError {
    /// The fixed wire code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Validation(_) => ErrorCode::ValidationError,
            Self::FileSystem { .. } => ErrorCode::FileSystemError,
            Self::LockTimeout { .. } => ErrorCode::StateVersionConflict,
            Self::CorruptedLock(_) => ErrorCode::CorruptedLock,
            Self::ForeignLock { .. } => ErrorCode::ForeignLock,
            Self::VersionConflict { .. } => ErrorCode::StateVersionConflict,
            Self::Cancelled => ErrorCode::FileSystemError,
            Self::NotFound { .. } => ErrorCode::NotFound,
            Self::MultipleCandidates(_) => ErrorCode::MultipleCandidates,
            Self::NoActiveTask => ErrorCode::NoActiveTask,
            Self::NoProjectBound => ErrorCode::NoProjectBound,
            Self::InvalidRoot(_) => ErrorCode::InvalidRoot,
            Self::IllegalTransition { .. } => ErrorCode::ValidationError,
            Self::EvrNotReady { .. } => ErrorCode::EvrNotReady,
            Self::SyncConflict { .. } => ErrorCode::SyncConflict,
            Self::Parse(_) => ErrorCode::ValidationError,
            Self::Render(_) => ErrorCode::FileSystemError,
            Self::Project(_) => ErrorCode::InvalidRoot,
            Self::CorruptedRegistry(_) => ErrorCode::FileSystemError,
            Self::System(_) => ErrorCode::FileSystemError,
        }
    }

    /// Whether the caller may retry after re-reading state.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::VersionConflict { .. } | Self::LockTimeout { .. }
        )
    }

    /// Wrap an I/O error with the path it occurred on.
    pub fn fs(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::FileSystem {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_wire_names() {
        assert_eq!(ErrorCode::EvrNotReady.to_string(), "EVR_NOT_READY");
        assert_eq!(ErrorCode::NoProjectBound.to_string(), "NO_PROJECT_BOUND");
        assert_eq!(
            ErrorCode::StateVersionConflict.to_string(),
            "STATE_VERSION_CONFLICT"
        );
    }

    #[test]
    fn test_error_to_code_mapping() {
        let err = WaveError::Validation("title too long".into());
        assert_eq!(err.code(), ErrorCode::ValidationError);

        let err = WaveError::VersionConflict {
            task_id: "t".into(),
            expected: 1,
            found: 2,
        };
        assert_eq!(err.code(), ErrorCode::StateVersionConflict);
        assert!(err.is_recoverable());

        let err = WaveError::ForeignLock {
            task_id: "t".into(),
            holder: "p2".into(),
        };
        assert_eq!(err.code(), ErrorCode::ForeignLock);
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_error_code_serde_round_trip() {
        let json = serde_json::to_string(&ErrorCode::SyncConflict).unwrap();
        assert_eq!(json, "\"SYNC_CONFLICT\"");
        let back: ErrorCode = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ErrorCode::SyncConflict);
    }
}
