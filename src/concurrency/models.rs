//! Concurrency models: locks, versions, snapshots, deadlock reports

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Kind of lock requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockType {
    Read,
    Write,
}

/// On-disk lock file contents at `<docs>/.locks/<taskId>.lock`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lock {
    pub task_id: String,
    pub process_id: String,
    /// Acquisition time
    pub timestamp: DateTime<Utc>,
    /// TTL in milliseconds; past `timestamp + timeout` the lock is stale
    pub timeout: u64,
    #[serde(rename = "type")]
    pub lock_type: LockType,
}

impl Lock {
    /// A lock whose deadline has passed may be reclaimed by any contender.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        let deadline = self.timestamp + chrono::Duration::milliseconds(self.timeout as i64);
        now > deadline
    }
}

/// Acquisition parameters.
///
/// `timeout_ms` bounds the total wait: `-1` waits indefinitely, `0` fails
/// immediately when contended. `max_retries` caps attempts independently.
#[derive(Debug, Clone)]
pub struct AcquireOptions {
    pub timeout_ms: i64,
    pub retry_interval: Duration,
    pub max_retries: Option<u32>,
    /// TTL stamped into the lock file
    pub ttl_ms: u64,
    /// Observed at every retry boundary
    pub cancel: Option<CancellationToken>,
}

impl Default for AcquireOptions {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            retry_interval: Duration::from_millis(50),
            max_retries: None,
            ttl_ms: 30_000,
            cancel: None,
        }
    }
}

impl AcquireOptions {
    /// Fail immediately when the lock is contended.
    pub fn immediate() -> Self {
        Self {
            timeout_ms: 0,
            ..Self::default()
        }
    }
}

/// A consistent read of versioned data
#[derive(Debug, Clone)]
pub struct VersionedRead<T> {
    pub data: T,
    pub version: u64,
}

/// Outcome of a compare-and-swap write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteOutcome {
    pub success: bool,
    pub conflict: bool,
    /// Version on disk after the call (new version on success, the
    /// conflicting current version on failure)
    pub version: u64,
}

impl WriteOutcome {
    pub fn committed(version: u64) -> Self {
        Self {
            success: true,
            conflict: false,
            version,
        }
    }

    pub fn conflicted(current: u64) -> Self {
        Self {
            success: false,
            conflict: true,
            version: current,
        }
    }
}

/// On-disk version counter at `<docs>/.state/<taskId>.state`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateVersion {
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

/// Point-in-time copy of a task's JSON with integrity metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub task_id: String,
    pub version: u64,
    pub timestamp: DateTime<Utc>,
    /// Hex SHA-256 of `payload`
    pub checksum: String,
    /// The task JSON at snapshot time
    pub payload: String,
}

/// One process's view for deadlock analysis
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaiterInfo {
    pub process_id: String,
    pub held_locks: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_lock: Option<String>,
}

/// Shape of a detected deadlock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeadlockType {
    Cycle,
    SelfDeadlock,
}

/// Result of wait-for-graph analysis
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeadlockReport {
    pub has_deadlock: bool,
    /// Processes forming the first detected cycle, in wait order starting
    /// from the lexicographically smallest member
    pub deadlock_chain: Vec<String>,
    pub cycle_length: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadlock_type: Option<DeadlockType>,
    /// Waiter with the fewest held locks (ties: smallest process id)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_victim: Option<String>,
    pub multiple_deadlocks: bool,
    pub deadlock_groups: Vec<Vec<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_staleness() {
        let lock = Lock {
            task_id: "t1".into(),
            process_id: "p1".into(),
            timestamp: Utc::now() - chrono::Duration::seconds(60),
            timeout: 30_000,
            lock_type: LockType::Write,
        };
        assert!(lock.is_stale(Utc::now()));

        let fresh = Lock {
            timestamp: Utc::now(),
            ..lock
        };
        assert!(!fresh.is_stale(Utc::now()));
    }

    #[test]
    fn test_lock_serializes_type_field() {
        let lock = Lock {
            task_id: "t1".into(),
            process_id: "p1".into(),
            timestamp: Utc::now(),
            timeout: 1000,
            lock_type: LockType::Read,
        };
        let json = serde_json::to_string(&lock).unwrap();
        assert!(json.contains("\"type\":\"read\""));
    }

    #[test]
    fn test_write_outcome_constructors() {
        assert_eq!(
            WriteOutcome::committed(4),
            WriteOutcome {
                success: true,
                conflict: false,
                version: 4
            }
        );
        assert_eq!(
            WriteOutcome::conflicted(7),
            WriteOutcome {
                success: false,
                conflict: true,
                version: 7
            }
        );
    }

    #[test]
    fn test_deadlock_type_wire_names() {
        assert_eq!(
            serde_json::to_string(&DeadlockType::SelfDeadlock).unwrap(),
            "\"self-deadlock\""
        );
        assert_eq!(
            serde_json::to_string(&DeadlockType::Cycle).unwrap(),
            "\"cycle\""
        );
    }
}
