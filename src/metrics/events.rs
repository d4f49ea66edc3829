//! Internal events for metrics emission.
//!
//! Each event struct represents a measurable occurrence in the pipeline.
//! Events implement the `InternalEvent` trait which emits the corresponding
//! Prometheus metric.

use metrics::{counter, gauge, histogram};
use std::time::Duration;
use tracing::trace;

/// Trait for internal events that can be emitted as metrics.
pub trait InternalEvent {
    /// Emit this event as a metric.
    fn emit(self);
}

/// Event emitted after a file has been parsed into records.
pub struct LinesParsed {
    pub count: u64,
}

impl InternalEvent for LinesParsed {
    fn emit(self) {
        trace!(count = self.count, "Lines parsed");
        counter!("auditpart_lines_parsed_total").increment(self.count);
    }
}

/// Event emitted for every line that is rejected or recovered abnormally.
pub struct LineFlagged {
    pub reason: &'static str,
}

impl InternalEvent for LineFlagged {
    fn emit(self) {
        trace!(reason = self.reason, "Line flagged");
        counter!("auditpart_lines_rejected_total", "reason" => self.reason).increment(1);
    }
}

/// Event emitted when sessions are closed by the correlator.
pub struct SessionsClosed {
    pub manual: u64,
    pub automatic: u64,
}

impl InternalEvent for SessionsClosed {
    fn emit(self) {
        trace!(
            manual = self.manual,
            automatic = self.automatic,
            "Sessions closed"
        );
        counter!("auditpart_sessions_closed_total", "kind" => "manual").increment(self.manual);
        counter!("auditpart_sessions_closed_total", "kind" => "auto").increment(self.automatic);
    }
}

/// How a part was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartStatus {
    Written,
    Skipped,
}

impl PartStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartStatus::Written => "written",
            PartStatus::Skipped => "skipped",
        }
    }
}

/// Event emitted when a part has been exported or skipped.
pub struct PartCompleted {
    pub status: PartStatus,
    pub rows: u64,
    pub duration: Duration,
}

impl InternalEvent for PartCompleted {
    fn emit(self) {
        trace!(
            status = self.status.as_str(),
            rows = self.rows,
            duration_ms = self.duration.as_millis(),
            "Part completed"
        );
        counter!("auditpart_parts_written_total", "status" => self.status.as_str()).increment(1);
        counter!("auditpart_rows_emitted_total").increment(self.rows);
        histogram!("auditpart_part_duration_seconds").record(self.duration.as_secs_f64());
    }
}

/// Event emitted when the job cursor moves.
pub struct JobCursor {
    pub cursor: usize,
    pub total: usize,
}

impl InternalEvent for JobCursor {
    fn emit(self) {
        trace!(cursor = self.cursor, total = self.total, "Job cursor");
        gauge!("auditpart_job_cursor_rows").set(self.cursor as f64);
        gauge!("auditpart_job_total_rows").set(self.total as f64);
    }
}

/// Event emitted when the queue position changes.
pub struct QueuePosition {
    pub current: usize,
    pub len: usize,
}

impl InternalEvent for QueuePosition {
    fn emit(self) {
        trace!(current = self.current, len = self.len, "Queue position");
        gauge!("auditpart_queue_remaining_files").set(self.len.saturating_sub(self.current) as f64);
    }
}

/// Outcome label for an invocation.
#[derive(Debug, Clone, Copy)]
pub enum InvocationOutcomeType {
    Paused,
    Advanced,
    Finished,
    Idle,
    Busy,
    Failed,
}

impl InvocationOutcomeType {
    fn as_str(&self) -> &'static str {
        match self {
            InvocationOutcomeType::Paused => "paused",
            InvocationOutcomeType::Advanced => "advanced",
            InvocationOutcomeType::Finished => "finished",
            InvocationOutcomeType::Idle => "idle",
            InvocationOutcomeType::Busy => "busy",
            InvocationOutcomeType::Failed => "failed",
        }
    }
}

/// Event emitted at the end of every resume invocation.
pub struct InvocationCompleted {
    pub outcome: InvocationOutcomeType,
    pub duration: Duration,
}

impl InternalEvent for InvocationCompleted {
    fn emit(self) {
        trace!(
            outcome = self.outcome.as_str(),
            duration_ms = self.duration.as_millis(),
            "Invocation completed"
        );
        counter!("auditpart_invocations_total", "outcome" => self.outcome.as_str()).increment(1);
        histogram!("auditpart_invocation_duration_seconds").record(self.duration.as_secs_f64());
    }
}

/// Event emitted by each watchdog check.
pub struct WatchdogChecked {
    pub result: &'static str,
}

impl InternalEvent for WatchdogChecked {
    fn emit(self) {
        trace!(result = self.result, "Watchdog checked");
        counter!("auditpart_watchdog_checks_total", "result" => self.result).increment(1);
    }
}

/// Event emitted when a transient failure is retried.
pub struct RetryAttempted {
    pub operation: &'static str,
}

impl InternalEvent for RetryAttempted {
    fn emit(self) {
        trace!(operation = self.operation, "Retry attempted");
        counter!("auditpart_retry_attempts_total", "operation" => self.operation).increment(1);
    }
}

// ============================================================================
// Storage operation events
// ============================================================================

/// Type of storage operation.
#[derive(Debug, Clone, Copy)]
pub enum StorageOperation {
    Get,
    GetRange,
    Head,
    Put,
    Delete,
    List,
}

impl StorageOperation {
    fn as_str(&self) -> &'static str {
        match self {
            StorageOperation::Get => "get",
            StorageOperation::GetRange => "get_range",
            StorageOperation::Head => "head",
            StorageOperation::Put => "put",
            StorageOperation::Delete => "delete",
            StorageOperation::List => "list",
        }
    }
}

/// Status of a storage request.
#[derive(Debug, Clone, Copy)]
pub enum RequestStatus {
    Success,
    Error,
}

impl RequestStatus {
    fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Success => "success",
            RequestStatus::Error => "error",
        }
    }
}

/// Event emitted for each storage request.
pub struct StorageRequest {
    pub operation: StorageOperation,
    pub status: RequestStatus,
    pub duration: Duration,
}

impl InternalEvent for StorageRequest {
    fn emit(self) {
        trace!(
            operation = self.operation.as_str(),
            status = self.status.as_str(),
            duration_ms = self.duration.as_millis(),
            "Storage request"
        );
        counter!(
            "auditpart_storage_requests_total",
            "operation" => self.operation.as_str(),
            "status" => self.status.as_str()
        )
        .increment(1);
        histogram!(
            "auditpart_storage_request_duration_seconds",
            "operation" => self.operation.as_str()
        )
        .record(self.duration.as_secs_f64());
    }
}
