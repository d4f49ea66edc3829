//! Deferred re-invocation.
//!
//! A [`Scheduler`] keeps at most one pending trigger per handler. Arming a
//! handler replaces any trigger it already has. Triggers are delivered by
//! [`ScheduleDriver`], which polls for due triggers; a trigger may fire more
//! than once if an invocation crashes before cancelling it, which the
//! pipeline tolerates.

mod driver;

pub use driver::ScheduleDriver;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::time::Duration;
use tracing::debug;

use crate::error::{ScheduleError, TriggerStoreSnafu};
use crate::state::{StateStoreRef, load_json, save_json, trigger_key};

/// Handler that resumes the current job.
pub const RESUME_HANDLER: &str = "resume";

/// A pending callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    pub handler: String,
    pub due_at: DateTime<Utc>,
    pub armed_at: DateTime<Utc>,
}

impl Trigger {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        now >= self.due_at
    }
}

#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Drop the pending trigger for `handler`, if any.
    async fn cancel(&self, handler: &str) -> Result<(), ScheduleError>;

    /// Arm `handler` to fire at `due_at`, replacing any pending trigger.
    async fn arm_at(&self, handler: &str, due_at: DateTime<Utc>) -> Result<Trigger, ScheduleError>;

    async fn pending(&self, handler: &str) -> Result<Option<Trigger>, ScheduleError>;

    /// Arm `handler` to fire after `delay`.
    async fn arm_after(&self, handler: &str, delay: Duration) -> Result<Trigger, ScheduleError> {
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
        self.arm_at(handler, Utc::now() + delay).await
    }
}

/// Scheduler persisting one trigger object per handler in the state store.
pub struct StoredScheduler {
    store: StateStoreRef,
}

impl StoredScheduler {
    pub fn new(store: StateStoreRef) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Scheduler for StoredScheduler {
    async fn cancel(&self, handler: &str) -> Result<(), ScheduleError> {
        self.store
            .delete(&trigger_key(handler))
            .await
            .context(TriggerStoreSnafu { handler })
    }

    async fn arm_at(&self, handler: &str, due_at: DateTime<Utc>) -> Result<Trigger, ScheduleError> {
        let trigger = Trigger {
            handler: handler.to_string(),
            due_at,
            armed_at: Utc::now(),
        };
        save_json(self.store.as_ref(), &trigger_key(handler), &trigger)
            .await
            .context(TriggerStoreSnafu { handler })?;
        debug!(handler, due_at = %due_at, "Trigger armed");
        Ok(trigger)
    }

    async fn pending(&self, handler: &str) -> Result<Option<Trigger>, ScheduleError> {
        load_json(self.store.as_ref(), &trigger_key(handler))
            .await
            .context(TriggerStoreSnafu { handler })
    }
}
