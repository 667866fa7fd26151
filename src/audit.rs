//! Audit records for resilient calls.

use crate::circuit_breaker::CircuitState;
use crate::classify::ErrorClassification;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

/// How an attempt, or a rejected call, ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditOutcome {
    /// The attempt produced a result.
    Success,
    /// The attempt failed with the given classification.
    Failed(ErrorClassification),
    /// The call was rejected before any attempt (rate limited or circuit open).
    Rejected(ErrorClassification),
}

impl AuditOutcome {
    /// A short, stable label for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOutcome::Success => "success",
            AuditOutcome::Failed(_) => "failed",
            AuditOutcome::Rejected(_) => "rejected",
        }
    }
}

/// One audit entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRecord {
    /// Zero-based attempt index; zero for rejected calls.
    pub attempt: usize,
    /// How long the attempt ran.
    pub duration: Duration,
    /// How it ended.
    pub outcome: AuditOutcome,
    /// The circuit state at the time of recording.
    pub circuit_state: CircuitState,
}

/// Receives audit records. Fire-and-forget: implementations cannot influence the call.
pub trait AuditSink: Send + Sync {
    /// Records one entry for `operation`.
    fn record(&self, operation: &str, record: &AuditRecord);
}

/// Writes each record as a structured `tracing` event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, operation: &str, record: &AuditRecord) {
        let classification = match record.outcome {
            AuditOutcome::Success => None,
            AuditOutcome::Failed(c) | AuditOutcome::Rejected(c) => Some(c.as_str()),
        };
        tracing::info!(
            target: "callward::audit",
            operation,
            attempt = record.attempt,
            duration_ms = record.duration.as_millis() as u64,
            outcome = record.outcome.as_str(),
            classification,
            circuit_state = %record.circuit_state,
            "Call audited"
        );
    }
}

/// Discards every record.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAuditSink;

impl AuditSink for NoopAuditSink {
    fn record(&self, _operation: &str, _record: &AuditRecord) {}
}

/// Hands a record to `sink`, containing any panic inside it.
pub(crate) fn emit(sink: &dyn AuditSink, operation: &str, record: AuditRecord) {
    if catch_unwind(AssertUnwindSafe(|| sink.record(operation, &record))).is_err() {
        tracing::warn!(operation, "Audit sink panicked; record dropped");
    }
}
