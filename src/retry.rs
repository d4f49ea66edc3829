//! Exponential backoff for transient collaborator failures.
//!
//! The delay for attempt `n` (1-based) is `base * 2^(n-1)`, capped at `max`,
//! plus up to 50ms of random jitter.

use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::config::ErrorHandlingConfig;
use crate::emit;
use crate::metrics::events::RetryAttempted;

const JITTER_MAX_MS: u64 = 50;

/// Retry policy shared by storage reads and lease acquisition.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    max_attempts: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn from_config(config: &ErrorHandlingConfig) -> Self {
        Self::new(
            Duration::from_millis(config.backoff_base_ms),
            Duration::from_millis(config.backoff_max_ms),
            config.max_attempts,
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before the attempt following failed attempt `attempt`, without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        self.base.saturating_mul(1u32 << shift).min(self.max)
    }

    /// Delay including jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter = rand::rng().random_range(0..=JITTER_MAX_MS);
        self.base_delay(attempt) + Duration::from_millis(jitter)
    }

    /// Run `f` until it succeeds, `should_retry` rejects the error, or the
    /// attempts are used up. Returns the last error together with the number
    /// of attempts made.
    pub async fn retry_when<T, E, F, Fut, P>(
        &self,
        operation: &'static str,
        should_retry: P,
        mut f: F,
    ) -> Result<T, (E, u32)>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: Display,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.max_attempts && should_retry(&e) => {
                    let delay = self.delay(attempt);
                    warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient failure, retrying"
                    );
                    emit!(RetryAttempted { operation });
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err((e, attempt)),
            }
        }
    }
}
