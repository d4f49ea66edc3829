//! Resilient whole-object reads.
//!
//! A direct GET is retried with backoff. If it keeps failing, or the object
//! is larger than `max_direct_read_bytes`, the object is fetched as a
//! sequence of byte ranges instead, each range retried on its own.

use bytes::{Bytes, BytesMut};
use snafu::prelude::*;
use tracing::{debug, warn};

use crate::error::{ReadExhaustedSnafu, StorageError};
use crate::retry::Backoff;

use super::StorageProvider;

/// Knobs for [`read_object`].
#[derive(Debug, Clone, Copy)]
pub struct ReadPolicy {
    pub max_direct_read_bytes: u64,
    pub chunk_bytes: u64,
    pub backoff: Backoff,
}

fn transient(e: &StorageError) -> bool {
    !e.is_not_found()
}

/// Read an entire object, falling back to chunked ranged reads.
pub async fn read_object(
    storage: &StorageProvider,
    path: &str,
    policy: &ReadPolicy,
) -> Result<Bytes, StorageError> {
    let head = policy
        .backoff
        .retry_when("head", transient, || storage.head(path))
        .await
        .map_err(|(e, _)| e)?;

    let size = match head {
        Some(meta) => meta.size,
        None => {
            // Surface the backend's own not-found error
            return storage.get(path).await;
        }
    };

    if size <= policy.max_direct_read_bytes {
        match policy
            .backoff
            .retry_when("get", transient, || storage.get(path))
            .await
        {
            Ok(bytes) => return Ok(bytes),
            Err((e, attempts)) if e.is_not_found() => {
                return Err(e).context(ReadExhaustedSnafu { path, attempts });
            }
            Err((e, attempts)) => {
                warn!(
                    path,
                    attempts,
                    error = %e,
                    "Direct read failed, falling back to chunked reads"
                );
            }
        }
    } else {
        debug!(
            path,
            size,
            limit = policy.max_direct_read_bytes,
            "Object exceeds direct read limit, using chunked reads"
        );
    }

    read_chunked(storage, path, size, policy).await
}

async fn read_chunked(
    storage: &StorageProvider,
    path: &str,
    size: u64,
    policy: &ReadPolicy,
) -> Result<Bytes, StorageError> {
    let chunk = policy.chunk_bytes.max(1);
    let mut buffer = BytesMut::with_capacity(usize::try_from(size).unwrap_or_default());
    let mut offset = 0u64;

    while offset < size {
        let end = (offset + chunk).min(size);
        let bytes = match policy
            .backoff
            .retry_when("get_range", transient, || {
                storage.get_range(path, offset..end)
            })
            .await
        {
            Ok(bytes) => bytes,
            Err((e, attempts)) => {
                warn!(path, offset, attempts, error = %e, "Chunked read failed");
                return Err(e).context(ReadExhaustedSnafu { path, attempts });
            }
        };
        buffer.extend_from_slice(&bytes);
        offset = end;
    }

    debug!(path, size, chunks = size.div_ceil(chunk), "Chunked read complete");
    Ok(buffer.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    fn policy(max_direct: u64, chunk: u64) -> ReadPolicy {
        ReadPolicy {
            max_direct_read_bytes: max_direct,
            chunk_bytes: chunk,
            backoff: Backoff::new(Duration::from_millis(1), Duration::from_millis(2), 2),
        }
    }

    #[tokio::test]
    async fn test_small_object_is_read_directly() {
        let storage = StorageProvider::for_url_with_options("memory://read-direct", HashMap::new())
            .await
            .unwrap();
        storage
            .put("a.txt", Bytes::from_static(b"hello|world"))
            .await
            .unwrap();

        let bytes = read_object(&storage, "a.txt", &policy(1024, 4))
            .await
            .unwrap();
        assert_eq!(bytes.as_ref(), b"hello|world");
    }

    #[tokio::test]
    async fn test_large_object_is_reassembled_from_ranges() {
        let storage = StorageProvider::for_url_with_options("memory://read-chunked", HashMap::new())
            .await
            .unwrap();
        let content: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        storage
            .put("big.txt", Bytes::from(content.clone()))
            .await
            .unwrap();

        let bytes = read_object(&storage, "big.txt", &policy(100, 64))
            .await
            .unwrap();
        assert_eq!(bytes.as_ref(), content.as_slice());
    }

    #[tokio::test]
    async fn test_failed_direct_read_falls_back_to_ranges() {
        let storage = StorageProvider::for_url_with_options("memory://read-fallback", HashMap::new())
            .await
            .unwrap();
        storage
            .put("a.txt", Bytes::from_static(b"u1|1|0|edited"))
            .await
            .unwrap();
        let flaky = storage.with_failing_reads(false);

        assert!(flaky.get("a.txt").await.is_err());
        let bytes = read_object(&flaky, "a.txt", &policy(1024, 5))
            .await
            .unwrap();
        assert_eq!(bytes.as_ref(), b"u1|1|0|edited");
    }

    #[tokio::test]
    async fn test_exhausted_reads_report_attempts() {
        let storage = StorageProvider::for_url_with_options("memory://read-exhausted", HashMap::new())
            .await
            .unwrap();
        storage
            .put("a.txt", Bytes::from_static(b"u1|1|0|edited"))
            .await
            .unwrap();
        let broken = storage.with_failing_reads(true);

        let err = read_object(&broken, "a.txt", &policy(1024, 5))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StorageError::ReadExhausted { ref path, attempts: 2, .. } if path == "a.txt"
        ));
        assert!(!err.is_not_found());
    }

    #[tokio::test]
    async fn test_missing_object_is_not_found() {
        let storage = StorageProvider::for_url_with_options("memory://read-missing", HashMap::new())
            .await
            .unwrap();

        let err = read_object(&storage, "nope.txt", &policy(1024, 64))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
