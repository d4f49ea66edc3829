//! Single worker loop delivering triggers and watchdog checks.

use chrono::Utc;
use snafu::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::RESUME_HANDLER;
use crate::error::{PipelineError, ScheduleSnafu};
use crate::pipeline::Pipeline;

/// Polls for due resume triggers and runs the watchdog on its period.
///
/// Invocations run one at a time on the driver's task, so the loop itself
/// never overlaps two invocations; the lease covers other processes.
pub struct ScheduleDriver {
    pipeline: Arc<Pipeline>,
    tick: Duration,
    watchdog_period: Duration,
}

impl ScheduleDriver {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        let schedule = &pipeline.config().schedule;
        let tick = Duration::from_secs(schedule.tick_secs);
        let watchdog_period = Duration::from_secs(schedule.watchdog_interval_secs.max(1));
        Self {
            pipeline,
            tick,
            watchdog_period,
        }
    }

    /// Run until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), PipelineError> {
        info!(
            tick_secs = self.tick.as_secs(),
            watchdog_secs = self.watchdog_period.as_secs(),
            "Schedule driver started"
        );

        let mut tick = interval(self.tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut watchdog = interval(self.watchdog_period);
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, stopping schedule driver");
                    break;
                }

                _ = watchdog.tick() => {
                    match self.pipeline.watchdog().await {
                        Ok(outcome) => debug!(outcome = outcome.as_str(), "Watchdog tick"),
                        Err(e) => error!(error = %e, "Watchdog check failed"),
                    }
                }

                _ = tick.tick() => {
                    if !self.resume_is_due().await {
                        continue;
                    }
                    // Race the invocation against shutdown; persisted state
                    // only ever reflects completed parts
                    tokio::select! {
                        biased;

                        _ = shutdown.cancelled() => {
                            info!("Shutdown requested during invocation");
                            break;
                        }

                        result = self.pipeline.resume() => match result {
                            Ok(outcome) => info!(outcome = %outcome, "Invocation finished"),
                            Err(e) => error!(error = %e, "Invocation failed"),
                        },
                    }
                }
            }
        }

        Ok(())
    }

    async fn resume_is_due(&self) -> bool {
        match self.pending_resume_due().await {
            Ok(due) => due,
            Err(e) => {
                error!(error = %e, "Failed to inspect pending trigger");
                false
            }
        }
    }

    async fn pending_resume_due(&self) -> Result<bool, PipelineError> {
        let pending = self
            .pipeline
            .scheduler()
            .pending(RESUME_HANDLER)
            .await
            .context(ScheduleSnafu)?;
        Ok(pending.is_some_and(|trigger| trigger.is_due(Utc::now())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::storage::StorageProvider;
    use bytes::Bytes;
    use std::collections::HashMap;

    async fn pipeline(name: &str) -> Arc<Pipeline> {
        let mut config = Config::with_paths(
            &format!("memory://{name}/inbox"),
            &format!("memory://{name}/parts"),
            &format!("memory://{name}/state"),
        );
        config.schedule.tick_secs = 1;
        Arc::new(Pipeline::new(config).await.unwrap())
    }

    #[tokio::test]
    async fn test_stops_when_already_cancelled() {
        let driver = ScheduleDriver::new(pipeline("driver-cancelled").await);
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        driver.run(shutdown).await.unwrap();
    }

    #[tokio::test]
    async fn test_delivers_due_resume() {
        let name = "driver-due";
        let inbox = StorageProvider::for_url_with_options(
            &format!("memory://{name}/inbox"),
            HashMap::new(),
        )
        .await
        .unwrap();
        inbox
            .put(
                "audit_2024-01.txt",
                Bytes::from_static(b"u1|1|0|edited|2024-01-01T00:00:00Z|Edit|Recipe|Mix|1\n"),
            )
            .await
            .unwrap();

        let pipeline = pipeline(name).await;
        pipeline.start().await.unwrap();
        assert!(ScheduleDriver::new(pipeline.clone()).resume_is_due().await);

        let driver = ScheduleDriver::new(pipeline.clone());
        let shutdown = CancellationToken::new();
        let watch = async {
            let mut finished = false;
            for _ in 0..50 {
                let status = pipeline.status().await.unwrap();
                if status.queue_current == Some(1) {
                    finished = true;
                    break;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            shutdown.cancel();
            finished
        };
        let (result, finished) = tokio::join!(driver.run(shutdown.clone()), watch);
        result.unwrap();

        assert!(finished, "driver never completed the queued file");
        assert!(pipeline.scheduler().pending(RESUME_HANDLER).await.unwrap().is_none());
    }
}
