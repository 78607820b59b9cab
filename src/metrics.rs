//! Counters emitted through the `metrics` facade.
//!
//! Naming follows Prometheus conventions (`mesh_auth_` prefix, `_total`
//! suffix). Label values are bounded: auth types (plus `unknown` when the
//! policy lookup itself failed), fixed outcome strings, GC trigger names,
//! and table operation names. No recorder is installed
//! here; the embedding process decides where metrics go.

use telemetry_metrics::counter;

use crate::types::AuthType;

/// Result of one authentication attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Handler succeeded and the decision was stored.
    Success,
    /// Handler, policy, or storage failed.
    Failure,
    /// Policy requires no authentication.
    Skipped,
}

impl Outcome {
    fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Skipped => "skipped",
        }
    }
}

/// Count one authentication attempt.
pub fn record_authentication(auth_type: AuthType, outcome: Outcome) {
    counter!(
        "mesh_auth_authentications_total",
        "auth_type" => auth_type.as_str(),
        "outcome" => outcome.as_str()
    )
    .increment(1);
}

/// Count an attempt that failed before an auth type was known.
pub fn record_policy_failure() {
    counter!(
        "mesh_auth_authentications_total",
        "auth_type" => "unknown",
        "outcome" => Outcome::Failure.as_str()
    )
    .increment(1);
}

/// Count entries removed by one garbage collection trigger.
pub fn record_gc_deleted(trigger: &'static str, count: usize) {
    if count > 0 {
        counter!("mesh_auth_gc_deleted_total", "trigger" => trigger).increment(count as u64);
    }
}

/// Count a failed shared table operation.
pub fn record_map_error(operation: &'static str) {
    counter!("mesh_auth_map_errors_total", "operation" => operation).increment(1);
}
