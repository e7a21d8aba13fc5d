//! Log hygiene and tracing setup
//!
//! Structured detail bags are walked before they enter any sink: keys that
//! look like credentials are replaced with `[REDACTED]`, and bags larger
//! than the configured byte budget collapse to a truncation marker.

use regex::Regex;
use serde_json::{json, Value};
use std::sync::LazyLock;

/// Keys whose values are never logged
static SENSITIVE_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(password|token|api[_-]?key|secret)").unwrap());

const REDACTED: &str = "[REDACTED]";

/// Initialize a tracing subscriber for hosts and tests. Respects
/// `RUST_LOG`; repeated calls are no-ops.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .try_init();
}

/// Redact sensitive keys, then enforce the byte budget.
pub fn sanitize_details(details: Value, byte_budget: usize) -> Value {
    let redacted = redact(details);
    truncate(redacted, byte_budget)
}

/// Recursively replace values under sensitive keys.
pub fn redact(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| {
                    if SENSITIVE_KEY.is_match(&k) {
                        (k, Value::String(REDACTED.into()))
                    } else {
                        (k, redact(v))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(redact).collect()),
        other => other,
    }
}

/// Replace oversized bags with `{_truncated, _originalSize}`.
pub fn truncate(value: Value, byte_budget: usize) -> Value {
    let size = serde_json::to_vec(&value).map(|v| v.len()).unwrap_or(0);
    if size <= byte_budget {
        value
    } else {
        json!({ "_truncated": true, "_originalSize": size })
    }
}
