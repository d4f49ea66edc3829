//! Store wrapper that refuses reads, for exercising read fallbacks.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use object_store::path::Path;
use object_store::{
    GetOptions, GetResult, ListResult, MultipartUpload, ObjectMeta, ObjectStore, PutMultipartOpts,
    PutOptions, PutPayload, PutResult,
};
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use super::StorageProvider;

/// Whole-object GETs always fail; ranged GETs fail when `fail_ranges` is set.
/// Everything else passes through.
#[derive(Debug)]
struct FailingReads {
    inner: Arc<dyn ObjectStore>,
    fail_ranges: bool,
}

impl fmt::Display for FailingReads {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FailingReads({})", self.inner)
    }
}

fn refused(location: &Path) -> object_store::Error {
    object_store::Error::Generic {
        store: "FailingReads",
        source: format!("read of {location} refused").into(),
    }
}

#[async_trait]
impl ObjectStore for FailingReads {
    async fn put_opts(
        &self,
        location: &Path,
        payload: PutPayload,
        opts: PutOptions,
    ) -> object_store::Result<PutResult> {
        self.inner.put_opts(location, payload, opts).await
    }

    async fn put_multipart_opts(
        &self,
        location: &Path,
        opts: PutMultipartOpts,
    ) -> object_store::Result<Box<dyn MultipartUpload>> {
        self.inner.put_multipart_opts(location, opts).await
    }

    async fn get(&self, location: &Path) -> object_store::Result<GetResult> {
        Err(refused(location))
    }

    async fn get_opts(
        &self,
        location: &Path,
        options: GetOptions,
    ) -> object_store::Result<GetResult> {
        self.inner.get_opts(location, options).await
    }

    async fn get_range(&self, location: &Path, range: Range<u64>) -> object_store::Result<Bytes> {
        if self.fail_ranges {
            return Err(refused(location));
        }
        self.inner.get_range(location, range).await
    }

    async fn head(&self, location: &Path) -> object_store::Result<ObjectMeta> {
        self.inner.head(location).await
    }

    async fn delete(&self, location: &Path) -> object_store::Result<()> {
        self.inner.delete(location).await
    }

    fn list(&self, prefix: Option<&Path>) -> BoxStream<'static, object_store::Result<ObjectMeta>> {
        self.inner.list(prefix)
    }

    async fn list_with_delimiter(&self, prefix: Option<&Path>) -> object_store::Result<ListResult> {
        self.inner.list_with_delimiter(prefix).await
    }

    async fn copy(&self, from: &Path, to: &Path) -> object_store::Result<()> {
        self.inner.copy(from, to).await
    }

    async fn copy_if_not_exists(&self, from: &Path, to: &Path) -> object_store::Result<()> {
        self.inner.copy_if_not_exists(from, to).await
    }
}

impl StorageProvider {
    /// The same location, with whole-object reads (and optionally ranged
    /// reads) failing.
    pub(crate) fn with_failing_reads(&self, fail_ranges: bool) -> Self {
        Self {
            config: self.config.clone(),
            object_store: Arc::new(FailingReads {
                inner: self.object_store.clone(),
                fail_ranges,
            }),
            canonical_url: self.canonical_url.clone(),
        }
    }
}
