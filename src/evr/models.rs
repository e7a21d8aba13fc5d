//! EVR models and gate result shapes

use crate::error::ErrorCode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Verification status of an EVR
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvrStatus {
    Pass,
    Fail,
    Skip,
    #[default]
    Unknown,
}

impl fmt::Display for EvrStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pass => write!(f, "pass"),
            Self::Fail => write!(f, "fail"),
            Self::Skip => write!(f, "skip"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

impl FromStr for EvrStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pass" => Ok(Self::Pass),
            "fail" => Ok(Self::Fail),
            "skip" => Ok(Self::Skip),
            "unknown" => Ok(Self::Unknown),
            _ => Err(format!("Unknown EVR status: {}", s)),
        }
    }
}

/// Verification class: static results pass once with proof, runtime
/// results need a fresh run during the completion window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvrClass {
    Static,
    #[default]
    Runtime,
}

/// Who performed a verification run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunBy {
    Ai,
    User,
    Ci,
    Tool,
}

/// A single recorded verification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationRun {
    pub at: DateTime<Utc>,
    pub by: RunBy,
    pub status: EvrStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proof: Option<String>,
}

/// An Expected Visible Result.
///
/// `runs` is reverse-chronological; `status`, `last_run`, `notes`, `proof`
/// always mirror `runs[0]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evr {
    /// Anchor id, `evr-<slug>`
    pub id: String,
    pub title: String,
    /// Inputs to verify; scalar on the wire when single-element
    #[serde(with = "one_or_many")]
    pub verify: Vec<String>,
    /// Predicted outputs; scalar on the wire when single-element
    #[serde(with = "one_or_many")]
    pub expect: Vec<String>,
    #[serde(default)]
    pub status: EvrStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<EvrClass>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proof: Option<String>,
    /// Plan ids that bind this EVR
    #[serde(default)]
    pub referenced_by: Vec<String>,
    /// Reverse-chronological run history
    #[serde(default)]
    pub runs: Vec<VerificationRun>,
}

impl Evr {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            verify: Vec::new(),
            expect: Vec::new(),
            status: EvrStatus::Unknown,
            class: None,
            last_run: None,
            notes: None,
            proof: None,
            referenced_by: Vec::new(),
            runs: Vec::new(),
        }
    }

    /// Effective class (`runtime` when unset).
    pub fn class(&self) -> EvrClass {
        self.class.unwrap_or_default()
    }
}

/// Serialize a `Vec<String>` as a scalar when it has exactly one element;
/// accept both shapes on input.
pub mod one_or_many {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum Repr {
        One(String),
        Many(Vec<String>),
    }

    pub fn serialize<S: Serializer>(value: &[String], serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            [single] => Repr::One(single.clone()).serialize(serializer),
            many => Repr::Many(many.to_vec()).serialize(serializer),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
        Ok(match Repr::deserialize(deserializer)? {
            Repr::One(s) => vec![s],
            Repr::Many(v) => v,
        })
    }
}

/// Why an EVR blocks task completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    StatusUnknown,
    Failed,
    NeedReasonForSkip,
    /// Runtime-class result whose newest run predates the completion window
    NeedsFinalRun,
}

/// One blocking EVR with its reason
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequiredFinal {
    pub evr_id: String,
    pub reason: BlockReason,
}

/// Status breakdown over a set of EVRs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvrSummary {
    pub passed: Vec<String>,
    pub failed: Vec<String>,
    pub skipped: Vec<String>,
    pub unknown: Vec<String>,
    /// Ids no plan references
    pub unreferenced: Vec<String>,
    pub total: usize,
}

/// Readiness check for one plan's bindings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanGate {
    pub bound_evrs: Vec<String>,
    /// Bound ids failing the readiness predicate
    pub pending_evrs: Vec<String>,
    pub can_complete: bool,
}

/// Readiness check for the whole task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskGate {
    pub can_complete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    pub required_final: Vec<RequiredFinal>,
    pub summary: EvrSummary,
    pub unreferenced: Vec<String>,
}
