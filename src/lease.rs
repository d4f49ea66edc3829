//! Invocation lease backed by object storage.
//!
//! Only one invocation may touch the job at a time. The lease is a JSON
//! object written with create-if-absent semantics. An expired lease is
//! deleted and the create is retried, so a crashed holder blocks others for
//! at most one TTL.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{LeaseError, LeaseHeldSnafu, LeaseJsonSnafu, LeaseLostSnafu, LeaseStorageSnafu};
use crate::retry::Backoff;
use crate::storage::StorageProviderRef;

/// Object name of the lease in the state location.
pub const LEASE_KEY: &str = "lease.json";

/// Lease file contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseInfo {
    pub holder_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LeaseInfo {
    fn new(holder_id: &str, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            holder_id: holder_id.to_string(),
            acquired_at: now,
            expires_at: now
                + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(900)),
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

enum Attempt {
    Acquired,
    Held(String),
}

/// Lease handle for one process.
pub struct Lease {
    storage: StorageProviderRef,
    holder_id: String,
    ttl: Duration,
    backoff: Backoff,
}

impl Lease {
    pub fn new(storage: StorageProviderRef, ttl: Duration, backoff: Backoff) -> Self {
        Self {
            storage,
            holder_id: Uuid::now_v7().to_string(),
            ttl,
            backoff,
        }
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Acquire the lease, backing off while another holder owns it.
    pub async fn acquire(&self) -> Result<LeaseGuard, LeaseError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.try_acquire().await? {
                Attempt::Acquired => {
                    debug!(holder = %self.holder_id, "Lease acquired");
                    return Ok(LeaseGuard {
                        storage: self.storage.clone(),
                        holder_id: self.holder_id.clone(),
                        ttl: self.ttl,
                        released: false,
                    });
                }
                Attempt::Held(holder) if attempts >= self.backoff.max_attempts() => {
                    return LeaseHeldSnafu { holder, attempts }.fail();
                }
                Attempt::Held(holder) => {
                    let delay = self.backoff.delay(attempts);
                    debug!(%holder, attempts, delay_ms = delay.as_millis() as u64, "Lease held, backing off");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn try_acquire(&self) -> Result<Attempt, LeaseError> {
        let info = LeaseInfo::new(&self.holder_id, self.ttl);
        let bytes = Bytes::from(serde_json::to_vec(&info).context(LeaseJsonSnafu)?);

        if self
            .storage
            .put_if_absent(LEASE_KEY, bytes)
            .await
            .context(LeaseStorageSnafu)?
        {
            return Ok(Attempt::Acquired);
        }

        match self.read_info().await? {
            Some(existing) if existing.is_expired() => {
                info!(
                    previous = %existing.holder_id,
                    expired_at = %existing.expires_at,
                    "Breaking expired lease"
                );
                self.force_break().await?;
                Ok(Attempt::Held(existing.holder_id))
            }
            Some(existing) => Ok(Attempt::Held(existing.holder_id)),
            // Vanished between create and read
            None => Ok(Attempt::Held("unknown".to_string())),
        }
    }

    /// Current lease contents, if any.
    pub async fn read_info(&self) -> Result<Option<LeaseInfo>, LeaseError> {
        match self.storage.get(LEASE_KEY).await {
            Ok(bytes) => Ok(Some(
                serde_json::from_slice(&bytes).context(LeaseJsonSnafu)?,
            )),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e).context(LeaseStorageSnafu),
        }
    }

    /// Delete the lease regardless of holder.
    pub async fn force_break(&self) -> Result<(), LeaseError> {
        self.storage
            .delete(LEASE_KEY)
            .await
            .context(LeaseStorageSnafu)
    }
}

/// Proof of lease ownership. Release explicitly; dropping releases in the background.
pub struct LeaseGuard {
    storage: StorageProviderRef,
    holder_id: String,
    ttl: Duration,
    released: bool,
}

impl LeaseGuard {
    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Push the expiry one TTL into the future.
    ///
    /// Fails with [`LeaseError::LeaseLost`] if the lease was broken or taken
    /// over since it was acquired; the caller must stop touching shared state.
    pub async fn renew(&self) -> Result<(), LeaseError> {
        let current = match self.storage.get(LEASE_KEY).await {
            Ok(bytes) => Some(
                serde_json::from_slice::<LeaseInfo>(&bytes).context(LeaseJsonSnafu)?,
            ),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e).context(LeaseStorageSnafu),
        };

        let holder = current.map(|info| info.holder_id);
        ensure!(
            holder.as_deref() == Some(self.holder_id.as_str()),
            LeaseLostSnafu {
                holder: holder.unwrap_or_else(|| "none".to_string()),
            }
        );

        let info = LeaseInfo::new(&self.holder_id, self.ttl);
        let bytes = Bytes::from(serde_json::to_vec(&info).context(LeaseJsonSnafu)?);
        self.storage
            .put(LEASE_KEY, bytes)
            .await
            .context(LeaseStorageSnafu)?;
        debug!(holder = %self.holder_id, expires_at = %info.expires_at, "Lease renewed");
        Ok(())
    }

    /// Release the lease if this guard still owns it.
    pub async fn release(mut self) -> Result<(), LeaseError> {
        self.released = true;
        release(&self.storage, &self.holder_id).await
    }
}

async fn release(storage: &StorageProviderRef, holder_id: &str) -> Result<(), LeaseError> {
    let current = match storage.get(LEASE_KEY).await {
        Ok(bytes) => serde_json::from_slice::<LeaseInfo>(&bytes).context(LeaseJsonSnafu)?,
        Err(e) if e.is_not_found() => return Ok(()),
        Err(e) => return Err(e).context(LeaseStorageSnafu),
    };

    if current.holder_id == holder_id {
        storage.delete(LEASE_KEY).await.context(LeaseStorageSnafu)?;
        debug!(holder = holder_id, "Lease released");
    } else {
        warn!(
            holder = holder_id,
            current = %current.holder_id,
            "Lease taken over before release"
        );
    }
    Ok(())
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // Without a runtime the TTL handles cleanup
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let storage = self.storage.clone();
        let holder_id = self.holder_id.clone();
        handle.spawn(async move {
            if let Err(e) = release(&storage, &holder_id).await {
                warn!(error = %e, "Background lease release failed");
            }
        });
    }
}
