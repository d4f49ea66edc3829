//! Process-state store.
//!
//! Named string values that survive between invocations: the job, the file
//! queue, scheduler triggers and the bad-line generation cursor. Two
//! implementations are provided:
//! - `StorageStateStore`: one object per key under a storage location
//! - `MemoryStateStore`: a process-local map, for tests and dry runs

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use snafu::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::{StateDecodeSnafu, StateEncodeSnafu, StateError, StateStorageSnafu};
use crate::storage::StorageProviderRef;

/// Persisted job record.
pub const JOB_KEY: &str = "job.json";
/// Persisted file queue.
pub const QUEUE_KEY: &str = "queue.json";
/// Bad-line generation cursor.
pub const BAD_LINES_KEY: &str = "badlines.json";
/// Source contents whose bad lines were already recorded. Survives reset.
pub const BAD_LINES_RECORDED_KEY: &str = "badlines-recorded.json";

/// Key of the pending trigger for a handler.
pub fn trigger_key(handler: &str) -> String {
    format!("trigger-{handler}.json")
}

/// Get/set/delete of named string values.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StateError>;

    async fn set(&self, key: &str, value: String) -> Result<(), StateError>;

    /// Remove a value. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StateError>;
}

/// A shared state store handle.
pub type StateStoreRef = Arc<dyn StateStore>;

/// Load and decode a JSON value.
pub async fn load_json<T: DeserializeOwned>(
    store: &dyn StateStore,
    key: &str,
) -> Result<Option<T>, StateError> {
    match store.get(key).await? {
        Some(text) => serde_json::from_str(&text)
            .map(Some)
            .context(StateDecodeSnafu { key }),
        None => Ok(None),
    }
}

/// Encode and store a JSON value.
pub async fn save_json<T: Serialize>(
    store: &dyn StateStore,
    key: &str,
    value: &T,
) -> Result<(), StateError> {
    let text = serde_json::to_string_pretty(value).context(StateEncodeSnafu { key })?;
    store.set(key, text).await
}

/// State store keeping one object per key in a storage location.
pub struct StorageStateStore {
    storage: StorageProviderRef,
}

impl StorageStateStore {
    pub fn new(storage: StorageProviderRef) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl StateStore for StorageStateStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StateError> {
        match self.storage.get(key).await {
            Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e).context(StateStorageSnafu { key }),
        }
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StateError> {
        self.storage
            .put(key, Bytes::from(value))
            .await
            .context(StateStorageSnafu { key })
    }

    async fn delete(&self, key: &str) -> Result<(), StateError> {
        self.storage
            .delete(key)
            .await
            .context(StateStorageSnafu { key })
    }
}

/// Process-local state store.
#[derive(Default)]
pub struct MemoryStateStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StateError> {
        Ok(self.values.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StateError> {
        self.values.lock().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StateError> {
        self.values.lock().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageProvider;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        cursor: usize,
        source: String,
    }

    async fn exercise(store: &dyn StateStore) {
        assert!(store.get("missing").await.unwrap().is_none());

        let sample = Sample {
            cursor: 42,
            source: "2024-01.txt".to_string(),
        };
        save_json(store, JOB_KEY, &sample).await.unwrap();
        let loaded: Option<Sample> = load_json(store, JOB_KEY).await.unwrap();
        assert_eq!(loaded, Some(sample));

        store.delete(JOB_KEY).await.unwrap();
        store.delete(JOB_KEY).await.unwrap();
        assert!(store.get(JOB_KEY).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_store() {
        exercise(&MemoryStateStore::new()).await;
    }

    #[tokio::test]
    async fn test_storage_store() {
        let temp_dir = TempDir::new().unwrap();
        let storage = StorageProvider::for_url_with_options(
            temp_dir.path().to_str().unwrap(),
            HashMap::new(),
        )
        .await
        .unwrap();
        exercise(&StorageStateStore::new(Arc::new(storage))).await;
    }

    #[tokio::test]
    async fn test_corrupt_value_is_a_decode_error() {
        let store = MemoryStateStore::new();
        store.set(QUEUE_KEY, "{not json".to_string()).await.unwrap();
        let err = load_json::<Sample>(&store, QUEUE_KEY).await.unwrap_err();
        assert!(matches!(err, StateError::StateDecode { .. }));
    }

    #[test]
    fn test_trigger_key() {
        assert_eq!(trigger_key("resume"), "trigger-resume.json");
    }
}
