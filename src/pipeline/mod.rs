//! The resumable export pipeline.
//!
//! Each invocation takes the lease, picks up the current job (creating it
//! from the file queue when needed), re-derives the file's rows and emits
//! parts until the file is done or the row budget runs out. Progress is
//! persisted after every part, so an aborted invocation resumes from the
//! last completed part.
//!
//! # Invocations
//!
//! - [`Pipeline::start`] lists the source, builds the file queue and arms a resume
//! - [`Pipeline::resume`] does the work for one budget
//! - [`Pipeline::watchdog`] re-arms a resume if the chain stalled
//! - [`Pipeline::status`] reports persisted state without taking the lease
//! - [`Pipeline::reset`] drops job, queue and pending triggers

mod rows;

pub use rows::{FlaggedLine, PreparedFile, prepare, sheet_header, sheet_row};

use chrono::{DateTime, Utc};
use serde::Serialize;
use snafu::prelude::*;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::badlines::{self, BadLineSink};
use crate::config::Config;
use crate::emit;
use crate::enrich::{COLUMNS, EnrichedRecord};
use crate::error::{
    BadLinesSnafu, LeaseSnafu, OutputBaseCollisionSnafu, PipelineError, PipelineStorageSnafu,
    ScheduleSnafu, SheetSnafu, SourceChangedSnafu, StateSnafu, TaskJoinSnafu,
};
use crate::job::{self, Job, JobPhase};
use crate::lease::{Lease, LeaseGuard, LeaseInfo};
use crate::metrics::events::{
    InvocationCompleted, InvocationOutcomeType, JobCursor, PartCompleted, PartStatus,
    QueuePosition,
};
use crate::partition::{PartitionCaps, next_part_rows};
use crate::queue::{self, FileQueue};
use crate::retry::Backoff;
use crate::runlog::{ExecutionLog, InvocationLog, LogEvent};
use crate::schedule::{RESUME_HANDLER, Scheduler, StoredScheduler, Trigger};
use crate::session::PhraseMatchers;
use crate::sink::{ArtifactState, PartWriter, WorkingSheet};
use crate::state::{StateStoreRef, StorageStateStore};
use crate::storage::{ReadPolicy, StorageProvider, StorageProviderRef, read_object};
use crate::watchdog::{self, WatchdogOutcome};

/// Result of one resume invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvocationOutcome {
    /// The budget ran out with rows remaining; a resume is armed.
    Paused {
        source: String,
        cursor: usize,
        total: usize,
        rows_emitted: usize,
        next_due: DateTime<Utc>,
    },
    /// The file completed and the queue moved to the next one.
    Advanced {
        completed: String,
        next: String,
        rows_emitted: usize,
        next_due: DateTime<Utc>,
    },
    /// The file completed and the queue is exhausted.
    Finished { completed: String, rows_emitted: usize },
    /// Nothing to do.
    Idle,
    /// Another invocation holds the lease.
    Busy,
}

impl InvocationOutcome {
    /// Rows exported by this invocation (skipped parts excluded).
    pub fn rows_emitted(&self) -> usize {
        match self {
            InvocationOutcome::Paused { rows_emitted, .. }
            | InvocationOutcome::Advanced { rows_emitted, .. }
            | InvocationOutcome::Finished { rows_emitted, .. } => *rows_emitted,
            InvocationOutcome::Idle | InvocationOutcome::Busy => 0,
        }
    }

    fn outcome_type(&self) -> InvocationOutcomeType {
        match self {
            InvocationOutcome::Paused { .. } => InvocationOutcomeType::Paused,
            InvocationOutcome::Advanced { .. } => InvocationOutcomeType::Advanced,
            InvocationOutcome::Finished { .. } => InvocationOutcomeType::Finished,
            InvocationOutcome::Idle => InvocationOutcomeType::Idle,
            InvocationOutcome::Busy => InvocationOutcomeType::Busy,
        }
    }
}

impl fmt::Display for InvocationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvocationOutcome::Paused {
                source,
                cursor,
                total,
                next_due,
                ..
            } => write!(f, "PAUSED {source} at {cursor}/{total}, resume at {next_due}"),
            InvocationOutcome::Advanced {
                completed,
                next,
                next_due,
                ..
            } => write!(f, "COMPLETED {completed}, next {next} at {next_due}"),
            InvocationOutcome::Finished { completed, .. } => {
                write!(f, "FINISHED after {completed}")
            }
            InvocationOutcome::Idle => f.write_str("IDLE"),
            InvocationOutcome::Busy => f.write_str("BUSY"),
        }
    }
}

/// Result of [`Pipeline::start`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartReport {
    pub files: usize,
    pub first: Option<String>,
}

/// Persisted state as reported by [`Pipeline::status`].
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub phase: JobPhase,
    pub job: Option<Job>,
    pub queue_current: Option<usize>,
    pub queue_len: Option<usize>,
    pub pending_resume: Option<Trigger>,
    pub lease: Option<LeaseInfo>,
}

enum PartProgress {
    Written(usize),
    Skipped(usize),
}

/// Fail if two queued sources would write the same part names.
fn ensure_distinct_outputs(queue: &FileQueue) -> Result<(), PipelineError> {
    let mut seen: HashMap<String, &str> = HashMap::new();
    for entry in &queue.entries {
        let base = job::output_base_for(&entry.path);
        if let Some(first) = seen.get(base.as_str()) {
            return OutputBaseCollisionSnafu {
                base,
                first: *first,
                second: entry.path.as_str(),
            }
            .fail();
        }
        seen.insert(base, &entry.path);
    }
    Ok(())
}

/// Pipeline over configured source, sink and state locations.
pub struct Pipeline {
    config: Config,
    source: StorageProviderRef,
    state: StateStoreRef,
    scheduler: Arc<dyn Scheduler>,
    lease: Lease,
    writer: PartWriter,
    bad_lines: Option<BadLineSink>,
    log: ExecutionLog,
    matchers: PhraseMatchers,
    read_policy: ReadPolicy,
}

impl Pipeline {
    /// Create a pipeline from configuration.
    pub async fn new(config: Config) -> Result<Self, PipelineError> {
        let source = Arc::new(
            StorageProvider::for_url_with_options(
                &config.source.path,
                config.source.storage_options.clone(),
            )
            .await
            .context(PipelineStorageSnafu)?,
        );
        let sink = Arc::new(
            StorageProvider::for_url_with_options(
                &config.sink.path,
                config.sink.storage_options.clone(),
            )
            .await
            .context(PipelineStorageSnafu)?,
        );
        let state_storage = Arc::new(
            StorageProvider::for_url_with_options(
                &config.state.path,
                config.state.storage_options.clone(),
            )
            .await
            .context(PipelineStorageSnafu)?,
        );
        let log_storage = match &config.log.path {
            Some(path) => Some(Arc::new(
                StorageProvider::for_url_with_options(path, config.log.storage_options.clone())
                    .await
                    .context(PipelineStorageSnafu)?,
            )),
            None => None,
        };

        let state: StateStoreRef = Arc::new(StorageStateStore::new(state_storage.clone()));
        let scheduler: Arc<dyn Scheduler> = Arc::new(StoredScheduler::new(state.clone()));
        let backoff = Backoff::from_config(&config.error_handling);
        let lease = Lease::new(state_storage, config.job.lease_ttl(), backoff);
        let bad_lines = BadLineSink::from_config(&config.error_handling, state.clone())
            .await
            .context(BadLinesSnafu)?;

        let read_policy = ReadPolicy {
            max_direct_read_bytes: config.source.max_direct_read_bytes as u64,
            chunk_bytes: config.source.read_chunk_bytes as u64,
            backoff,
        };

        info!(
            source = %source.canonical_url(),
            sink = %sink.canonical_url(),
            lease_holder = %lease.holder_id(),
            "Pipeline initialized"
        );

        Ok(Self {
            writer: PartWriter::new(sink, config.sink.compression),
            matchers: PhraseMatchers::from_config(&config.sessions),
            log: ExecutionLog::new(log_storage),
            source,
            state,
            scheduler,
            lease,
            bad_lines,
            read_policy,
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn scheduler(&self) -> &dyn Scheduler {
        self.scheduler.as_ref()
    }

    /// Take the lease, or `None` if another invocation holds it.
    async fn try_lease(&self) -> Result<Option<LeaseGuard>, PipelineError> {
        match self.lease.acquire().await {
            Ok(guard) => Ok(Some(guard)),
            Err(e) if e.is_held() => {
                info!(error = %e, "Lease held, skipping invocation");
                Ok(None)
            }
            Err(e) => Err(e).context(LeaseSnafu),
        }
    }

    async fn release(&self, guard: LeaseGuard) {
        if let Err(e) = guard.release().await {
            warn!(error = %e, "Failed to release lease, it will expire");
        }
    }

    /// Arm the next resume. A failing arm is retried once with the retry delay.
    async fn arm_resume(&self, delay: Duration) -> Result<Trigger, PipelineError> {
        match self.scheduler.arm_after(RESUME_HANDLER, delay).await {
            Ok(trigger) => Ok(trigger),
            Err(e) => {
                warn!(error = %e, "Failed to arm resume, retrying with retry delay");
                self.scheduler
                    .arm_after(
                        RESUME_HANDLER,
                        Duration::from_secs(self.config.schedule.retry_delay_secs),
                    )
                    .await
                    .context(ScheduleSnafu)
            }
        }
    }

    fn resume_delay(&self) -> Duration {
        Duration::from_secs(self.config.schedule.resume_delay_secs)
    }

    // ============ start ============

    /// List candidate files, persist a fresh queue and arm an immediate resume.
    ///
    /// Any previous job is dropped; parts it already exported are skipped
    /// when the file is processed again.
    ///
    /// Returns `None` if another invocation holds the lease.
    pub async fn start(&self) -> Result<Option<StartReport>, PipelineError> {
        let log = self.log.invocation("start");
        let Some(guard) = self.try_lease().await? else {
            log.record(LogEvent::new("start", "BUSY")).await;
            return Ok(None);
        };

        let result = self.start_locked(&log).await;
        self.release(guard).await;
        if let Err(e) = &result {
            log.record(LogEvent::new("start", format!("FAILED: {e}"))).await;
        }
        result.map(Some)
    }

    async fn start_locked(&self, log: &InvocationLog) -> Result<StartReport, PipelineError> {
        let objects = self
            .source
            .list_objects()
            .await
            .context(PipelineStorageSnafu)?;
        let paths: Vec<String> = objects
            .into_iter()
            .map(|meta| meta.location.to_string())
            .filter(|path| self.config.source.accepts(path))
            .collect();

        let queue = FileQueue::build(paths);
        ensure_distinct_outputs(&queue)?;
        let report = StartReport {
            files: queue.entries.len(),
            first: queue.current_entry().map(|e| e.path.clone()),
        };

        job::clear(self.state.as_ref()).await.context(StateSnafu)?;
        queue::save(self.state.as_ref(), &queue)
            .await
            .context(StateSnafu)?;
        emit!(QueuePosition {
            current: queue.current,
            len: queue.entries.len(),
        });

        let mut event = LogEvent::new("start", "QUEUED").rows(0, Some(report.files));
        if let Some(first) = &report.first {
            event = event.file(first.clone());
            let trigger = self.arm_resume(Duration::ZERO).await?;
            event = event.next_scheduled(trigger.due_at);
        } else {
            self.scheduler
                .cancel(RESUME_HANDLER)
                .await
                .context(ScheduleSnafu)?;
        }
        log.record(event).await;

        info!(files = report.files, first = ?report.first, "File queue built");
        Ok(report)
    }

    // ============ resume ============

    /// Run one budget-limited invocation.
    pub async fn resume(&self) -> Result<InvocationOutcome, PipelineError> {
        let started = Instant::now();
        let log = self.log.invocation("resume");

        let Some(guard) = self.try_lease().await? else {
            log.record(LogEvent::new("resume", "BUSY")).await;
            emit!(InvocationCompleted {
                outcome: InvocationOutcomeType::Busy,
                duration: started.elapsed(),
            });
            return Ok(InvocationOutcome::Busy);
        };

        let result = self.resume_locked(&guard, &log).await;

        if let Err(e) = &result
            && e.is_lease_lost()
        {
            // The new holder owns the job and arms its own successor
            error!(error = %e, "Invocation lost its lease, stopping");
            log.record(LogEvent::new("resume", format!("FAILED: {e}"))).await;
        } else if let Err(e) = &result {
            error!(error = %e, "Invocation aborted");
            let mut event = LogEvent::new("resume", format!("FAILED: {e}"));
            let retry = Duration::from_secs(self.config.schedule.retry_delay_secs);
            match self.scheduler.arm_after(RESUME_HANDLER, retry).await {
                Ok(trigger) => event = event.next_scheduled(trigger.due_at),
                Err(arm_error) => {
                    error!(error = %arm_error, "Failed to arm retry, watchdog will repair")
                }
            }
            log.record(event).await;
        }
        self.release(guard).await;

        let outcome_type = match &result {
            Ok(outcome) => outcome.outcome_type(),
            Err(_) => InvocationOutcomeType::Failed,
        };
        emit!(InvocationCompleted {
            outcome: outcome_type,
            duration: started.elapsed(),
        });
        result
    }

    async fn resume_locked(
        &self,
        guard: &LeaseGuard,
        log: &InvocationLog,
    ) -> Result<InvocationOutcome, PipelineError> {
        // This invocation is the pending resume; a new one is armed at the end
        self.scheduler
            .cancel(RESUME_HANDLER)
            .await
            .context(ScheduleSnafu)?;

        let mut queue = queue::load(self.state.as_ref())
            .await
            .context(StateSnafu)?;
        let mut job = match job::load(self.state.as_ref()).await.context(StateSnafu)? {
            Some(job) => job,
            None => match queue.as_ref().and_then(FileQueue::current_entry) {
                Some(entry) => {
                    let job = Job::new(entry.path.clone());
                    job::save(self.state.as_ref(), &job)
                        .await
                        .context(StateSnafu)?;
                    info!(source = %job.source, output_base = %job.output_base, "Job created");
                    job
                }
                None => {
                    log.record(LogEvent::new("resume", "IDLE")).await;
                    return Ok(InvocationOutcome::Idle);
                }
            },
        };

        log.record(
            LogEvent::new("resume", "RESUMED")
                .file(job.source.clone())
                .rows(job.cursor, job.total_rows),
        )
        .await;

        let rows_emitted = if job.is_complete() {
            0
        } else {
            self.emit_parts(&mut job, guard, log).await?
        };

        if !job.is_complete() {
            let trigger = self.arm_resume(self.resume_delay()).await?;
            let total = job.total_rows.unwrap_or_default();
            log.record(
                LogEvent::new("resume", "PAUSED")
                    .file(job.source.clone())
                    .rows(job.cursor, job.total_rows)
                    .next_scheduled(trigger.due_at),
            )
            .await;
            return Ok(InvocationOutcome::Paused {
                source: job.source,
                cursor: job.cursor,
                total,
                rows_emitted,
                next_due: trigger.due_at,
            });
        }

        guard.renew().await.context(LeaseSnafu)?;
        self.complete_job(job, queue.as_mut(), rows_emitted, log)
            .await
    }

    /// Delete a finished job and move the queue on.
    async fn complete_job(
        &self,
        job: Job,
        queue: Option<&mut FileQueue>,
        rows_emitted: usize,
        log: &InvocationLog,
    ) -> Result<InvocationOutcome, PipelineError> {
        job::clear(self.state.as_ref()).await.context(StateSnafu)?;
        log.record(
            LogEvent::new("resume", "FILE_COMPLETE")
                .file(job.source.clone())
                .rows(job.cursor, job.total_rows),
        )
        .await;
        info!(source = %job.source, rows = job.cursor, parts = job.part_index - 1, "File complete");

        let next = match queue {
            Some(queue) => {
                if queue
                    .current_entry()
                    .is_some_and(|entry| entry.path == job.source)
                {
                    queue.advance();
                }
                queue::save(self.state.as_ref(), queue)
                    .await
                    .context(StateSnafu)?;
                queue.current_entry().map(|entry| entry.path.clone())
            }
            None => None,
        };

        match next {
            Some(next) => {
                let trigger = self.arm_resume(self.resume_delay()).await?;
                log.record(
                    LogEvent::new("resume", "NEXT_FILE")
                        .file(next.clone())
                        .next_scheduled(trigger.due_at),
                )
                .await;
                Ok(InvocationOutcome::Advanced {
                    completed: job.source,
                    next,
                    rows_emitted,
                    next_due: trigger.due_at,
                })
            }
            None => {
                log.record(LogEvent::new("resume", "FINISHED").file(job.source.clone()))
                    .await;
                Ok(InvocationOutcome::Finished {
                    completed: job.source,
                    rows_emitted,
                })
            }
        }
    }

    /// Re-derive the source rows, establishing totals on first sight.
    async fn load_rows(
        &self,
        job: &mut Job,
        guard: &LeaseGuard,
    ) -> Result<Vec<EnrichedRecord>, PipelineError> {
        let bytes = read_object(&self.source, &job.source, &self.read_policy)
            .await
            .context(PipelineStorageSnafu)?;
        let delimiter = self.config.source.delimiter_char();
        let matchers = self.matchers.clone();
        let source = job.source.clone();

        let (prepared, marker) = tokio::task::spawn_blocking(move || {
            let marker = badlines::content_marker(&source, &bytes);
            let text = String::from_utf8_lossy(&bytes);
            (prepare(&text, delimiter, &matchers), marker)
        })
        .await
        .context(TaskJoinSnafu)?;

        debug!(
            source = %job.source,
            lines = prepared.logical_lines,
            rows = prepared.records.len(),
            flagged = prepared.flagged.len(),
            sessions = prepared.sessions.manual + prepared.sessions.automatic,
            "Source prepared"
        );

        // Reading and parsing may take a large share of the TTL
        guard.renew().await.context(LeaseSnafu)?;

        match job.total_rows {
            None => {
                // Only the invocation that sets totals records bad lines, and
                // only once per source content across resets
                if let Some(sink) = &self.bad_lines {
                    if sink.is_recorded(&marker).await.context(BadLinesSnafu)? {
                        info!(source = %job.source, "Bad lines already recorded, skipping");
                    } else {
                        for line in &prepared.flagged {
                            sink.record(&job.source, line.line_number, &line.raw, line.reason)
                                .await
                                .context(BadLinesSnafu)?;
                        }
                        sink.flush().await.context(BadLinesSnafu)?;
                        sink.mark_recorded(&marker).await.context(BadLinesSnafu)?;
                    }
                }
                job.establish_totals(prepared.records.len(), COLUMNS.len());
                job::save(self.state.as_ref(), job)
                    .await
                    .context(StateSnafu)?;
                info!(
                    source = %job.source,
                    total_rows = prepared.records.len(),
                    flagged = prepared.flagged.len(),
                    "Job totals established"
                );
            }
            Some(total) => {
                ensure!(
                    prepared.records.len() >= total,
                    SourceChangedSnafu {
                        path: job.source.clone(),
                        available: prepared.records.len(),
                        required: total,
                    }
                );
            }
        }

        Ok(prepared.records)
    }

    /// Emit parts until the file completes or the budget is spent.
    async fn emit_parts(
        &self,
        job: &mut Job,
        guard: &LeaseGuard,
        log: &InvocationLog,
    ) -> Result<usize, PipelineError> {
        let records = self.load_rows(job, guard).await?;
        let mut budget = self.config.job.row_budget;
        let mut emitted = 0;

        while !job.is_complete() && budget > 0 {
            let caps = PartitionCaps {
                max_cells: self.config.sink.max_cells,
                chunk_rows: self.config.sink.chunk_rows,
                budget_remaining: budget,
            };
            let remaining = job.remaining().unwrap_or_default();
            let rows = next_part_rows(remaining, COLUMNS.len(), &caps).context(SheetSnafu)?;
            let name = job.next_part_name();
            let started = Instant::now();

            match self.write_part(&name, &records, job.cursor, rows).await? {
                PartProgress::Skipped(existing) => {
                    job.advance(existing);
                    emit!(PartCompleted {
                        status: PartStatus::Skipped,
                        rows: 0,
                        duration: started.elapsed(),
                    });
                    log.record(
                        LogEvent::new("resume", "PART_SKIPPED")
                            .file(job.source.clone())
                            .part(name)
                            .rows(job.cursor, job.total_rows),
                    )
                    .await;
                }
                PartProgress::Written(written) => {
                    job.advance(written);
                    budget -= written;
                    emitted += written;
                    emit!(PartCompleted {
                        status: PartStatus::Written,
                        rows: written as u64,
                        duration: started.elapsed(),
                    });
                    log.record(
                        LogEvent::new("resume", "PART_WRITTEN")
                            .file(job.source.clone())
                            .part(name)
                            .rows(job.cursor, job.total_rows),
                    )
                    .await;
                }
            }

            guard.renew().await.context(LeaseSnafu)?;
            job::save(self.state.as_ref(), job)
                .await
                .context(StateSnafu)?;
            emit!(JobCursor {
                cursor: job.cursor,
                total: job.total_rows.unwrap_or_default(),
            });
        }

        Ok(emitted)
    }

    /// Write one part, or report the rows of an artifact that already exists.
    async fn write_part(
        &self,
        name: &str,
        records: &[EnrichedRecord],
        cursor: usize,
        rows: usize,
    ) -> Result<PartProgress, PipelineError> {
        if let ArtifactState::Present { rows: existing } = self.writer.inspect(name).await?
            && existing > 0
        {
            debug!(part = name, rows = existing, "Part already exported, skipping");
            return Ok(PartProgress::Skipped(existing));
        }

        let slice = &records[cursor..cursor + rows];
        let mut sheet = WorkingSheet::create(name, sheet_header(), self.config.sink.max_cells)
            .context(SheetSnafu)?;
        let mut offset = 0;
        for block in slice.chunks(self.config.sink.write_block_rows) {
            let cells: Vec<Vec<String>> = block.iter().map(sheet_row).collect();
            sheet.write_block(offset, cells).context(SheetSnafu)?;
            offset += block.len();
        }

        self.writer.export(&sheet, name).await?;
        debug!(part = name, rows, cursor, "Part written");
        Ok(PartProgress::Written(rows))
    }

    // ============ watchdog ============

    /// Check that pending work has a scheduled resume, repairing it if not.
    pub async fn watchdog(&self) -> Result<WatchdogOutcome, PipelineError> {
        let log = self.log.invocation("watchdog");
        let Some(guard) = self.try_lease().await? else {
            // An invocation is running and will arm its own successor
            log.record(LogEvent::new("watchdog", WatchdogOutcome::Ok.as_str()))
                .await;
            return Ok(WatchdogOutcome::Ok);
        };

        let result = watchdog::check(
            self.state.as_ref(),
            self.scheduler.as_ref(),
            Duration::from_secs(self.config.schedule.watchdog_repair_delay_secs),
        )
        .await;
        self.release(guard).await;

        let status = match &result {
            Ok(outcome) => outcome.as_str().to_string(),
            Err(e) => format!("FAILED: {e}"),
        };
        log.record(LogEvent::new("watchdog", status)).await;
        result
    }

    // ============ status / reset ============

    /// Persisted job, queue, trigger and lease state.
    pub async fn status(&self) -> Result<StatusReport, PipelineError> {
        let job = job::load(self.state.as_ref()).await.context(StateSnafu)?;
        let queue = queue::load(self.state.as_ref())
            .await
            .context(StateSnafu)?;
        let pending_resume = self
            .scheduler
            .pending(RESUME_HANDLER)
            .await
            .context(ScheduleSnafu)?;
        let lease = self.lease.read_info().await.context(LeaseSnafu)?;

        Ok(StatusReport {
            phase: JobPhase::of(job.as_ref()),
            queue_current: queue.as_ref().map(|q| q.current),
            queue_len: queue.as_ref().map(|q| q.entries.len()),
            job,
            pending_resume,
            lease,
        })
    }

    /// Drop job and queue state and cancel pending resumes. Exported parts are kept.
    pub async fn reset(&self) -> Result<bool, PipelineError> {
        let log = self.log.invocation("reset");
        let Some(guard) = self.try_lease().await? else {
            log.record(LogEvent::new("reset", "BUSY")).await;
            return Ok(false);
        };

        let result: Result<(), PipelineError> = async {
            self.scheduler
                .cancel(RESUME_HANDLER)
                .await
                .context(ScheduleSnafu)?;
            job::clear(self.state.as_ref()).await.context(StateSnafu)?;
            queue::clear(self.state.as_ref())
                .await
                .context(StateSnafu)
        }
        .await;
        self.release(guard).await;

        match &result {
            Ok(()) => {
                info!("Job and queue state reset");
                log.record(LogEvent::new("reset", "RESET")).await;
            }
            Err(e) => log.record(LogEvent::new("reset", format!("FAILED: {e}"))).await,
        }
        result.map(|()| true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_rows_and_display() {
        let due = Utc::now();
        let paused = InvocationOutcome::Paused {
            source: "a.txt".to_string(),
            cursor: 80_000,
            total: 120_000,
            rows_emitted: 30_000,
            next_due: due,
        };
        assert_eq!(paused.rows_emitted(), 30_000);
        assert!(paused.to_string().starts_with("PAUSED a.txt at 80000/120000"));
        assert_eq!(InvocationOutcome::Busy.rows_emitted(), 0);
        assert_eq!(InvocationOutcome::Idle.to_string(), "IDLE");
    }

    #[test]
    fn test_colliding_output_bases_are_rejected() {
        let distinct = FileQueue::build(["audit_2024-01.txt", "audit_2024-01.csv"]);
        ensure_distinct_outputs(&distinct).unwrap();

        let duplicated = FileQueue::build(["in/a.txt", "in/a.txt"]);
        let err = ensure_distinct_outputs(&duplicated).unwrap_err();
        assert!(matches!(err, PipelineError::OutputBaseCollision { .. }));
    }

    #[tokio::test]
    async fn test_failed_read_keeps_cursor_and_arms_retry() {
        use crate::error::StorageError;
        use crate::parse::HEADER;

        let name = "pipeline-read-failure";
        let inbox =
            StorageProvider::for_url_with_options(&format!("memory://{name}/inbox"), HashMap::new())
                .await
                .unwrap();
        let mut text = format!("{HEADER}\n");
        for i in 0..5 {
            text.push_str(&format!(
                "u{i}|{i}|0|edited|2024-01-01T00:00:0{i}Z|Edit|Recipe|Mix|1\n"
            ));
        }
        inbox
            .put("audit_2024-01.txt", bytes::Bytes::from(text))
            .await
            .unwrap();

        let mut config = Config::with_paths(
            &format!("memory://{name}/inbox"),
            &format!("memory://{name}/parts"),
            &format!("memory://{name}/state"),
        );
        config.job.row_budget = 2;
        config.schedule.retry_delay_secs = 600;
        config.error_handling.max_attempts = 2;
        config.error_handling.backoff_base_ms = 1;
        config.error_handling.backoff_max_ms = 2;
        let mut pipeline = Pipeline::new(config).await.unwrap();
        pipeline.start().await.unwrap();
        assert!(matches!(
            pipeline.resume().await.unwrap(),
            InvocationOutcome::Paused { cursor: 2, .. }
        ));

        pipeline.source = Arc::new(pipeline.source.with_failing_reads(true));
        let err = pipeline.resume().await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::PipelineStorage {
                source: StorageError::ReadExhausted { .. }
            }
        ));

        let job = job::load(pipeline.state.as_ref()).await.unwrap().unwrap();
        assert_eq!(job.cursor, 2);
        assert_eq!(job.total_rows, Some(5));
        assert!(matches!(
            pipeline.writer.inspect(&job.next_part_name()).await.unwrap(),
            ArtifactState::Missing
        ));

        let retry = pipeline
            .scheduler
            .pending(RESUME_HANDLER)
            .await
            .unwrap()
            .unwrap();
        assert!(retry.due_at - retry.armed_at >= chrono::Duration::seconds(600));
    }

    #[tokio::test]
    async fn test_lost_lease_stops_invocation_before_persisting() {
        use crate::parse::HEADER;

        let name = "pipeline-lost-lease";
        let inbox =
            StorageProvider::for_url_with_options(&format!("memory://{name}/inbox"), HashMap::new())
                .await
                .unwrap();
        let text = format!("{HEADER}\nu1|1|0|edited|2024-01-01T00:00:00Z|Edit|Recipe|Mix|1\n");
        inbox
            .put("audit_2024-01.txt", bytes::Bytes::from(text))
            .await
            .unwrap();

        let mut config = Config::with_paths(
            &format!("memory://{name}/inbox"),
            &format!("memory://{name}/parts"),
            &format!("memory://{name}/state"),
        );
        config.error_handling.max_attempts = 1;
        let pipeline = Pipeline::new(config).await.unwrap();
        pipeline.start().await.unwrap();

        // Another worker breaks the lease and takes over mid-invocation
        let guard = pipeline.try_lease().await.unwrap().unwrap();
        pipeline.lease.force_break().await.unwrap();
        let state = StorageProvider::for_url_with_options(
            &format!("memory://{name}/state"),
            HashMap::new(),
        )
        .await
        .unwrap();
        let other = Lease::new(
            Arc::new(state),
            Duration::from_secs(60),
            Backoff::from_config(&pipeline.config.error_handling),
        );
        let other_guard = other.acquire().await.unwrap();

        let log = ExecutionLog::disabled().invocation("resume");
        let err = pipeline.resume_locked(&guard, &log).await.unwrap_err();
        assert!(err.is_lease_lost());

        let job = job::load(pipeline.state.as_ref()).await.unwrap().unwrap();
        assert_eq!(job.total_rows, None);
        assert_eq!(job.cursor, 0);
        assert!(
            !pipeline
                .writer
                .inspect(&job.next_part_name())
                .await
                .map(|state| matches!(state, ArtifactState::Present { .. }))
                .unwrap()
        );

        other_guard.release().await.unwrap();
    }
}
