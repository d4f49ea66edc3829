//! Object storage abstraction.
//!
//! Provides a unified interface over S3, the local filesystem and an
//! in-process memory store. Every location is addressed by URL; paths
//! passed to the provider are relative to the URL's key prefix.

mod local;
mod memory;
mod read;
mod s3;
#[cfg(test)]
pub(crate) mod testing;

pub use local::LocalConfig;
pub use memory::MemoryConfig;
pub use read::{ReadPolicy, read_object};
pub use s3::S3Config;

use bytes::Bytes;
use futures::{Stream, StreamExt, future::ready};
use object_store::path::Path;
use object_store::{ObjectMeta, ObjectStore, PutMode, PutOptions, PutPayload};
use regex::Regex;
use snafu::prelude::*;
use std::borrow::Cow;
use std::collections::HashMap;
use std::ops::Range;
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tracing::debug;

use crate::emit;
use crate::error::{InvalidUrlSnafu, ObjectStoreSnafu, StorageError};
use crate::metrics::events::{RequestStatus, StorageOperation, StorageRequest};

/// A reference-counted storage provider.
pub type StorageProviderRef = Arc<StorageProvider>;

/// Storage provider that abstracts over different storage backends.
#[derive(Clone)]
pub struct StorageProvider {
    pub(crate) config: BackendConfig,
    pub(crate) object_store: Arc<dyn ObjectStore>,
    pub(crate) canonical_url: String,
}

impl std::fmt::Debug for StorageProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StorageProvider<{}>", self.canonical_url)
    }
}

// URL patterns for different storage backends
const S3_PATH: &str =
    r"^https://s3\.(?P<region>[\w\-]+)\.amazonaws\.com/(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$";
const S3_VIRTUAL: &str =
    r"^https://(?P<bucket>[a-z0-9\-\.]+)\.s3\.(?P<region>[\w\-]+)\.amazonaws\.com(/(?P<key>.+))?$";
const S3_URL: &str = r"^[sS]3[aA]?://(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$";
const S3_ENDPOINT_URL: &str = r"^[sS]3[aA]?::(?<protocol>https?)://(?P<endpoint>[^:/]+):(?<port>\d+)/(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$";

const FILE_URI: &str = r"^file://(?P<path>.*)$";
const FILE_URL: &str = r"^file:(?P<path>.*)$";
const FILE_PATH: &str = r"^/(?P<path>.*)$";

const MEMORY_URL: &str = r"^memory://(?P<name>[^/]*)(/(?P<key>.+))?$";

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
enum Backend {
    S3,
    Local,
    Memory,
}

fn matchers() -> &'static [(Backend, Vec<Regex>)] {
    static MATCHERS: OnceLock<Vec<(Backend, Vec<Regex>)>> = OnceLock::new();
    MATCHERS.get_or_init(|| {
        let compile = |patterns: &[&str]| -> Vec<Regex> {
            patterns
                .iter()
                .filter_map(|p| Regex::new(p).ok())
                .collect()
        };
        vec![
            (
                Backend::S3,
                compile(&[S3_PATH, S3_VIRTUAL, S3_ENDPOINT_URL, S3_URL]),
            ),
            (Backend::Memory, compile(&[MEMORY_URL])),
            (Backend::Local, compile(&[FILE_URI, FILE_URL, FILE_PATH])),
        ]
    })
}

/// Backend configuration enum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendConfig {
    S3(S3Config),
    Local(LocalConfig),
    Memory(MemoryConfig),
}

impl BackendConfig {
    /// Parse a URL into a backend configuration.
    pub fn parse_url(url: &str) -> Result<Self, StorageError> {
        for (backend, patterns) in matchers() {
            if let Some(matches) = patterns.iter().find_map(|r| r.captures(url)) {
                return match backend {
                    Backend::S3 => Self::parse_s3(matches, url),
                    Backend::Local => Self::parse_local(matches),
                    Backend::Memory => Self::parse_memory(matches),
                };
            }
        }

        InvalidUrlSnafu {
            url: url.to_string(),
        }
        .fail()
    }

    fn parse_s3(matches: regex::Captures, url: &str) -> Result<Self, StorageError> {
        let bucket = matches
            .name("bucket")
            .map(|m| m.as_str().to_string())
            .context(InvalidUrlSnafu { url })?;

        let region = std::env::var("AWS_DEFAULT_REGION")
            .ok()
            .or_else(|| matches.name("region").map(|m| m.as_str().to_string()));

        let endpoint = std::env::var("AWS_ENDPOINT").ok().or_else(|| {
            matches.name("endpoint").map(|endpoint| {
                let port = matches
                    .name("port")
                    .and_then(|p| p.as_str().parse::<u16>().ok())
                    .unwrap_or(443);
                let protocol = matches
                    .name("protocol")
                    .map(|p| p.as_str())
                    .unwrap_or("https");
                format!("{}://{}:{}", protocol, endpoint.as_str(), port)
            })
        });

        let key = matches.name("key").map(|m| m.as_str().into());

        Ok(BackendConfig::S3(S3Config {
            endpoint,
            region,
            bucket,
            key,
        }))
    }

    fn parse_local(matches: regex::Captures) -> Result<Self, StorageError> {
        let path = matches.name("path").map(|m| m.as_str()).unwrap_or_default();

        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };

        Ok(BackendConfig::Local(LocalConfig { path }))
    }

    fn parse_memory(matches: regex::Captures) -> Result<Self, StorageError> {
        let name = matches
            .name("name")
            .map(|m| m.as_str().to_string())
            .unwrap_or_default();
        let key = matches.name("key").map(|m| m.as_str().into());
        Ok(BackendConfig::Memory(MemoryConfig { name, key }))
    }

    pub(crate) fn key(&self) -> Option<&Path> {
        match self {
            BackendConfig::S3(s3) => s3.key.as_ref(),
            BackendConfig::Local(_) => None,
            BackendConfig::Memory(memory) => memory.key.as_ref(),
        }
    }
}

/// Record a storage request metric for a finished operation.
fn record(operation: StorageOperation, start: Instant, ok: bool) {
    let status = if ok {
        RequestStatus::Success
    } else {
        RequestStatus::Error
    };
    emit!(StorageRequest {
        operation,
        status,
        duration: start.elapsed(),
    });
}

impl StorageProvider {
    /// Create a storage provider for the given URL with storage options.
    pub async fn for_url_with_options(
        url: &str,
        options: HashMap<String, String>,
    ) -> Result<Self, StorageError> {
        let config = BackendConfig::parse_url(url)?;

        match config {
            BackendConfig::S3(config) => Self::construct_s3(config, options).await,
            BackendConfig::Local(config) => Self::construct_local(config).await,
            BackendConfig::Memory(config) => Ok(Self::construct_memory(config)),
        }
    }

    /// URL identifying this location.
    pub fn canonical_url(&self) -> &str {
        &self.canonical_url
    }

    /// Qualify a path with the configured key prefix.
    pub fn qualify_path<'a>(&self, path: &'a Path) -> Cow<'a, Path> {
        match self.config.key() {
            Some(prefix) => Cow::Owned(prefix.parts().chain(path.parts()).collect()),
            None => Cow::Borrowed(path),
        }
    }

    /// List objects in the storage location.
    /// Returns metadata with locations relative to the configured key prefix.
    pub fn list(
        &self,
        include_subdirectories: bool,
    ) -> impl Stream<Item = Result<ObjectMeta, object_store::Error>> + '_ {
        let key_path = self.config.key().cloned();
        let key_part_count = key_path
            .as_ref()
            .map(|key| key.parts().count())
            .unwrap_or_default();

        self.object_store
            .list(key_path.as_ref())
            .filter_map(move |meta| {
                let result = match meta {
                    Ok(mut metadata) => {
                        let path = &metadata.location;
                        if !include_subdirectories && path.parts().count() != key_part_count + 1 {
                            None
                        } else {
                            // Callers get relative paths, matching the contract of get/put
                            metadata.location = path.parts().skip(key_part_count).collect();
                            Some(Ok(metadata))
                        }
                    }
                    Err(err) => Some(Err(err)),
                };
                ready(result)
            })
    }

    /// Collect every object directly under the location.
    pub async fn list_objects(&self) -> Result<Vec<ObjectMeta>, StorageError> {
        let start = Instant::now();
        let mut objects = Vec::new();
        let mut stream = Box::pin(self.list(false));
        let mut outcome = Ok(());
        while let Some(item) = stream.next().await {
            match item {
                Ok(meta) => objects.push(meta),
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }
        record(StorageOperation::List, start, outcome.is_ok());
        outcome.context(ObjectStoreSnafu)?;

        debug!(url = %self.canonical_url, count = objects.len(), "Listed objects");
        Ok(objects)
    }

    /// Get the contents of a file.
    pub async fn get(&self, path: impl Into<Path>) -> Result<Bytes, StorageError> {
        let path = path.into();
        let start = Instant::now();
        let result = match self.object_store.get(&self.qualify_path(&path)).await {
            Ok(response) => response.bytes().await,
            Err(e) => Err(e),
        };
        record(StorageOperation::Get, start, result.is_ok());
        result.context(ObjectStoreSnafu)
    }

    /// Get a byte range of a file.
    pub async fn get_range(
        &self,
        path: impl Into<Path>,
        range: Range<u64>,
    ) -> Result<Bytes, StorageError> {
        let path = path.into();
        let start = Instant::now();
        let result = self
            .object_store
            .get_range(&self.qualify_path(&path), range)
            .await;
        record(StorageOperation::GetRange, start, result.is_ok());
        result.context(ObjectStoreSnafu)
    }

    /// Get object metadata, or `None` if the object does not exist.
    pub async fn head(&self, path: impl Into<Path>) -> Result<Option<ObjectMeta>, StorageError> {
        let path = path.into();
        let start = Instant::now();
        let result = self.object_store.head(&self.qualify_path(&path)).await;
        match result {
            Ok(meta) => {
                record(StorageOperation::Head, start, true);
                Ok(Some(meta))
            }
            Err(object_store::Error::NotFound { .. }) => {
                record(StorageOperation::Head, start, true);
                Ok(None)
            }
            Err(e) => {
                record(StorageOperation::Head, start, false);
                Err(e).context(ObjectStoreSnafu)
            }
        }
    }

    /// Whether an object exists at the path.
    pub async fn exists(&self, path: impl Into<Path>) -> Result<bool, StorageError> {
        Ok(self.head(path).await?.is_some())
    }

    /// Put bytes to a path, overwriting any existing object.
    pub async fn put(&self, path: impl Into<Path>, bytes: Bytes) -> Result<(), StorageError> {
        let path = path.into();
        let start = Instant::now();
        let result = self
            .object_store
            .put(&self.qualify_path(&path), PutPayload::from(bytes))
            .await;
        record(StorageOperation::Put, start, result.is_ok());
        result.context(ObjectStoreSnafu)?;
        Ok(())
    }

    /// Put bytes only if no object exists at the path.
    ///
    /// Returns `false` when the object already exists.
    pub async fn put_if_absent(
        &self,
        path: impl Into<Path>,
        bytes: Bytes,
    ) -> Result<bool, StorageError> {
        let path = path.into();
        let start = Instant::now();
        let result = self
            .object_store
            .put_opts(
                &self.qualify_path(&path),
                PutPayload::from(bytes),
                PutOptions::from(PutMode::Create),
            )
            .await;
        match result {
            Ok(_) => {
                record(StorageOperation::Put, start, true);
                Ok(true)
            }
            Err(object_store::Error::AlreadyExists { .. }) => {
                record(StorageOperation::Put, start, true);
                Ok(false)
            }
            Err(e) => {
                record(StorageOperation::Put, start, false);
                Err(e).context(ObjectStoreSnafu)
            }
        }
    }

    /// Delete an object. Deleting a missing object is not an error.
    pub async fn delete(&self, path: impl Into<Path>) -> Result<(), StorageError> {
        let path = path.into();
        let start = Instant::now();
        let result = match self.object_store.delete(&self.qualify_path(&path)).await {
            Err(object_store::Error::NotFound { .. }) => Ok(()),
            other => other,
        };
        record(StorageOperation::Delete, start, result.is_ok());
        result.context(ObjectStoreSnafu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_s3_url_parsing() {
        let config = BackendConfig::parse_url("s3://mybucket/audit/inbox").unwrap();
        match config {
            BackendConfig::S3(s3) => {
                assert_eq!(s3.bucket, "mybucket");
                assert_eq!(s3.key, Some(Path::from("audit/inbox")));
            }
            _ => panic!("Expected S3 config"),
        }
    }

    #[test]
    fn test_local_url_parsing() {
        let config = BackendConfig::parse_url("/local/path/to/data").unwrap();
        assert_eq!(
            config,
            BackendConfig::Local(LocalConfig {
                path: "/local/path/to/data".to_string()
            })
        );

        let config = BackendConfig::parse_url("file:///srv/audit").unwrap();
        assert_eq!(
            config,
            BackendConfig::Local(LocalConfig {
                path: "/srv/audit".to_string()
            })
        );
    }

    #[test]
    fn test_memory_url_parsing() {
        let config = BackendConfig::parse_url("memory://scratch/state").unwrap();
        match config {
            BackendConfig::Memory(memory) => {
                assert_eq!(memory.name, "scratch");
                assert_eq!(memory.key, Some(Path::from("state")));
            }
            _ => panic!("Expected Memory config"),
        }
    }

    #[test]
    fn test_relative_path_is_rejected() {
        let err = BackendConfig::parse_url("relative/dir").unwrap_err();
        assert!(matches!(err, StorageError::InvalidUrl { .. }));
    }

    #[tokio::test]
    async fn test_list_returns_relative_paths() {
        let temp_dir = TempDir::new().unwrap();
        let inbox = temp_dir.path().join("inbox");
        std::fs::create_dir_all(inbox.join("archive")).unwrap();
        std::fs::write(inbox.join("2024-01 audit.txt"), b"a").unwrap();
        std::fs::write(inbox.join("archive/old.txt"), b"b").unwrap();

        let storage =
            StorageProvider::for_url_with_options(inbox.to_str().unwrap(), HashMap::new())
                .await
                .unwrap();

        let objects = storage.list_objects().await.unwrap();
        let names: Vec<String> = objects.iter().map(|m| m.location.to_string()).collect();
        assert_eq!(names, vec!["2024-01 audit.txt".to_string()]);

        let content = storage.get(names[0].as_str()).await.unwrap();
        assert_eq!(content.as_ref(), b"a");
    }

    #[tokio::test]
    async fn test_put_if_absent_does_not_overwrite() {
        let storage = StorageProvider::for_url_with_options("memory://put-if-absent", HashMap::new())
            .await
            .unwrap();

        assert!(
            storage
                .put_if_absent("lease.json", Bytes::from_static(b"first"))
                .await
                .unwrap()
        );
        assert!(
            !storage
                .put_if_absent("lease.json", Bytes::from_static(b"second"))
                .await
                .unwrap()
        );
        assert_eq!(storage.get("lease.json").await.unwrap().as_ref(), b"first");
    }

    #[tokio::test]
    async fn test_head_delete_and_ranges() {
        let temp_dir = TempDir::new().unwrap();
        let storage =
            StorageProvider::for_url_with_options(temp_dir.path().to_str().unwrap(), HashMap::new())
                .await
                .unwrap();

        assert!(storage.head("missing.txt").await.unwrap().is_none());
        storage
            .put("data.txt", Bytes::from_static(b"0123456789"))
            .await
            .unwrap();

        let meta = storage.head("data.txt").await.unwrap().unwrap();
        assert_eq!(meta.size, 10);
        assert_eq!(
            storage.get_range("data.txt", 2..5).await.unwrap().as_ref(),
            b"234"
        );

        storage.delete("data.txt").await.unwrap();
        storage.delete("data.txt").await.unwrap();
        assert!(!storage.exists("data.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_locations_with_same_name_share_objects() {
        let a = StorageProvider::for_url_with_options("memory://shared-name/x", HashMap::new())
            .await
            .unwrap();
        let b = StorageProvider::for_url_with_options("memory://shared-name/x", HashMap::new())
            .await
            .unwrap();

        a.put("job.json", Bytes::from_static(b"{}")).await.unwrap();
        assert!(b.exists("job.json").await.unwrap());
    }
}
