//! Execution log.
//!
//! Every event is mirrored to `tracing`. When a log location is configured,
//! each invocation also keeps its events in one NDJSON object under
//! `events/` and overwrites `status.json` with the latest event. Log writes
//! are best effort: a failing log location never fails an invocation.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::storage::StorageProviderRef;

/// Object overwritten with the most recent event.
pub const STATUS_KEY: &str = "status.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    pub timestamp: DateTime<Utc>,
    pub phase: String,
    pub file: Option<String>,
    pub part: Option<String>,
    pub rows_written: Option<usize>,
    pub rows_total: Option<usize>,
    pub status: String,
    pub next_scheduled: Option<DateTime<Utc>>,
}

impl LogEvent {
    pub fn new(phase: &str, status: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            phase: phase.to_string(),
            file: None,
            part: None,
            rows_written: None,
            rows_total: None,
            status: status.into(),
            next_scheduled: None,
        }
    }

    pub fn file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }

    pub fn part(mut self, part: impl Into<String>) -> Self {
        self.part = Some(part.into());
        self
    }

    pub fn rows(mut self, written: usize, total: Option<usize>) -> Self {
        self.rows_written = Some(written);
        self.rows_total = total;
        self
    }

    pub fn next_scheduled(mut self, at: DateTime<Utc>) -> Self {
        self.next_scheduled = Some(at);
        self
    }
}

/// Shared execution log. Hand out one [`InvocationLog`] per invocation.
#[derive(Clone)]
pub struct ExecutionLog {
    storage: Option<StorageProviderRef>,
}

impl ExecutionLog {
    pub fn new(storage: Option<StorageProviderRef>) -> Self {
        Self { storage }
    }

    /// Log that only mirrors to `tracing`.
    pub fn disabled() -> Self {
        Self { storage: None }
    }

    pub fn invocation(&self, phase: &str) -> InvocationLog {
        let events_key = format!(
            "events/{}-{phase}-{}.ndjson",
            Utc::now().format("%Y%m%dT%H%M%S"),
            Uuid::now_v7()
        );
        InvocationLog {
            storage: self.storage.clone(),
            events_key,
            events: Mutex::new(Vec::new()),
        }
    }
}

/// Events of a single invocation.
pub struct InvocationLog {
    storage: Option<StorageProviderRef>,
    events_key: String,
    events: Mutex<Vec<LogEvent>>,
}

impl InvocationLog {
    pub fn events_key(&self) -> &str {
        &self.events_key
    }

    /// Append an event and refresh the status snapshot.
    pub async fn record(&self, event: LogEvent) {
        info!(
            phase = %event.phase,
            status = %event.status,
            file = event.file.as_deref(),
            part = event.part.as_deref(),
            rows_written = event.rows_written,
            rows_total = event.rows_total,
            next_scheduled = event.next_scheduled.map(|t| t.to_rfc3339()),
            "Execution event"
        );

        let Some(storage) = &self.storage else {
            return;
        };

        let ndjson = {
            let mut events = self.events.lock().await;
            events.push(event.clone());
            let mut buf = Vec::new();
            for e in events.iter() {
                if serde_json::to_writer(&mut buf, e).is_ok() {
                    buf.push(b'\n');
                }
            }
            buf
        };

        if let Err(e) = storage
            .put(self.events_key.as_str(), Bytes::from(ndjson))
            .await
        {
            warn!(error = %e, key = %self.events_key, "Failed to write execution events");
        }

        match serde_json::to_vec_pretty(&event) {
            Ok(snapshot) => {
                if let Err(e) = storage.put(STATUS_KEY, Bytes::from(snapshot)).await {
                    warn!(error = %e, "Failed to write status snapshot");
                }
            }
            Err(e) => warn!(error = %e, "Failed to encode status snapshot"),
        }
    }
}

/// Read the last status snapshot from a log location.
pub async fn read_status(storage: &StorageProviderRef) -> Option<LogEvent> {
    let bytes = storage.get(STATUS_KEY).await.ok()?;
    serde_json::from_slice(&bytes).ok()
}
