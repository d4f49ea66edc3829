//! Liveness check for the resume chain.
//!
//! If work is pending but nothing will resume it, the chain has stalled
//! (a lost trigger, a crash between parts). The watchdog re-arms a resume
//! after a short delay.

use snafu::prelude::*;
use std::fmt;
use std::time::Duration;
use tracing::{info, warn};

use crate::emit;
use crate::error::{PipelineError, ScheduleSnafu, StateSnafu};
use crate::job::{self, Job};
use crate::metrics::events::WatchdogChecked;
use crate::queue::{self, FileQueue};
use crate::schedule::{RESUME_HANDLER, Scheduler};
use crate::state::StateStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogOutcome {
    /// Work is pending and a resume is scheduled.
    Ok,
    /// Work was pending without a resume; one was armed.
    Repaired,
    /// Nothing left to do.
    Idle,
}

impl WatchdogOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatchdogOutcome::Ok => "OK",
            WatchdogOutcome::Repaired => "REPAIRED",
            WatchdogOutcome::Idle => "IDLE",
        }
    }
}

impl fmt::Display for WatchdogOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the persisted state describes unfinished work.
pub fn work_pending(queue: Option<&FileQueue>, job: Option<&Job>) -> bool {
    job.is_some_and(|job| !job.is_complete()) || queue.is_some_and(|queue| !queue.is_finished())
}

/// Inspect persisted state and re-arm a resume if the chain stalled.
pub async fn check(
    store: &dyn StateStore,
    scheduler: &dyn Scheduler,
    repair_delay: Duration,
) -> Result<WatchdogOutcome, PipelineError> {
    let queue = queue::load(store).await.context(StateSnafu)?;
    let job = job::load(store).await.context(StateSnafu)?;

    let outcome = if !work_pending(queue.as_ref(), job.as_ref()) {
        WatchdogOutcome::Idle
    } else if scheduler
        .pending(RESUME_HANDLER)
        .await
        .context(ScheduleSnafu)?
        .is_some()
    {
        WatchdogOutcome::Ok
    } else {
        let trigger = scheduler
            .arm_after(RESUME_HANDLER, repair_delay)
            .await
            .context(ScheduleSnafu)?;
        warn!(
            source = job.as_ref().map(|j| j.source.as_str()),
            due_at = %trigger.due_at,
            "Work pending without a scheduled resume, re-armed"
        );
        WatchdogOutcome::Repaired
    };

    info!(result = outcome.as_str(), "Watchdog check");
    emit!(WatchdogChecked {
        result: outcome.as_str(),
    });
    Ok(outcome)
}
