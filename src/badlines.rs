//! Bad-line sink for rejected and recovered input lines.
//!
//! Entries are buffered and flushed as NDJSON into rolling generation
//! objects (`bad_lines/gen-NNNNNN.ndjson`). A generation holds at most
//! `bad_lines_capacity` entries; when it is full the next one is started.
//! The `{ generation, count }` cursor lives in the state store so appends
//! continue where the previous invocation stopped.
//!
//! Each source content is recorded once. A marker derived from the source
//! path and a digest of its bytes is kept in the state store, outside the
//! job and queue records, so re-processing the same file after a reset does
//! not append its lines again.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use snafu::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::ErrorHandlingConfig;
use crate::error::{
    BadLineCursorSnafu, BadLineError, BadLineMarkersSnafu, BadLineSerializeSnafu,
    BadLineStorageSnafu, BadLineWriteSnafu,
};
use crate::state::{
    BAD_LINES_KEY, BAD_LINES_RECORDED_KEY, StateStoreRef, load_json, save_json,
};
use crate::storage::{StorageProvider, StorageProviderRef};

const FLUSH_THRESHOLD: usize = 1_000;
const MARKER_DIGEST_LEN: usize = 16;

/// One recorded line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BadLineEntry {
    pub source: String,
    pub line_number: usize,
    pub raw: String,
    pub reason: String,
    pub recorded_at: DateTime<Utc>,
}

/// Position of the next append.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationCursor {
    pub generation: u64,
    pub count: usize,
}

impl Default for GenerationCursor {
    fn default() -> Self {
        Self {
            generation: 1,
            count: 0,
        }
    }
}

/// Identifies one content of one source.
pub fn content_marker(source: &str, content: &[u8]) -> String {
    let digest = hex::encode(Sha256::digest(content));
    format!("{source}@{}", &digest[..MARKER_DIGEST_LEN])
}

/// Object name of a generation.
pub fn generation_path(generation: u64) -> String {
    format!("bad_lines/gen-{generation:06}.ndjson")
}

pub struct BadLineSink {
    storage: StorageProviderRef,
    state: StateStoreRef,
    capacity: usize,
    buffer: Mutex<Vec<BadLineEntry>>,
}

impl BadLineSink {
    pub fn new(storage: StorageProviderRef, state: StateStoreRef, capacity: usize) -> Self {
        Self {
            storage,
            state,
            capacity: capacity.max(1),
            buffer: Mutex::new(Vec::new()),
        }
    }

    /// Create a sink from configuration. Returns `None` if no path is configured.
    pub async fn from_config(
        config: &ErrorHandlingConfig,
        state: StateStoreRef,
    ) -> Result<Option<Self>, BadLineError> {
        let Some(path) = &config.bad_lines_path else {
            return Ok(None);
        };

        let storage =
            StorageProvider::for_url_with_options(path, config.bad_lines_storage_options.clone())
                .await
                .context(BadLineStorageSnafu)?;

        info!(path = %path, "Bad-line sink enabled");
        Ok(Some(Self::new(
            Arc::new(storage),
            state,
            config.bad_lines_capacity,
        )))
    }

    async fn markers(&self) -> Result<BTreeSet<String>, BadLineError> {
        Ok(load_json(self.state.as_ref(), BAD_LINES_RECORDED_KEY)
            .await
            .context(BadLineMarkersSnafu)?
            .unwrap_or_default())
    }

    /// Whether lines for this content marker were already recorded.
    pub async fn is_recorded(&self, marker: &str) -> Result<bool, BadLineError> {
        Ok(self.markers().await?.contains(marker))
    }

    /// Remember that lines for this content marker have been flushed.
    pub async fn mark_recorded(&self, marker: &str) -> Result<(), BadLineError> {
        let mut markers = self.markers().await?;
        if markers.insert(marker.to_string()) {
            save_json(self.state.as_ref(), BAD_LINES_RECORDED_KEY, &markers)
                .await
                .context(BadLineMarkersSnafu)?;
        }
        Ok(())
    }

    /// Buffer an entry, flushing when the buffer is large.
    pub async fn record(
        &self,
        source: &str,
        line_number: usize,
        raw: &str,
        reason: &str,
    ) -> Result<(), BadLineError> {
        let should_flush = {
            let mut buffer = self.buffer.lock().await;
            buffer.push(BadLineEntry {
                source: source.to_string(),
                line_number,
                raw: raw.to_string(),
                reason: reason.to_string(),
                recorded_at: Utc::now(),
            });
            buffer.len() >= FLUSH_THRESHOLD
        };

        if should_flush {
            self.flush().await?;
        }
        Ok(())
    }

    /// Append buffered entries to the current generation, rolling as needed.
    pub async fn flush(&self) -> Result<(), BadLineError> {
        let entries = {
            let mut buffer = self.buffer.lock().await;
            if buffer.is_empty() {
                return Ok(());
            }
            std::mem::take(&mut *buffer)
        };

        let mut cursor: GenerationCursor = load_json(self.state.as_ref(), BAD_LINES_KEY)
            .await
            .context(BadLineCursorSnafu)?
            .unwrap_or_default();

        let total = entries.len();
        let mut pending = entries.as_slice();
        while !pending.is_empty() {
            if cursor.count >= self.capacity {
                cursor = GenerationCursor {
                    generation: cursor.generation + 1,
                    count: 0,
                };
            }
            let room = self.capacity - cursor.count;
            let (batch, rest) = pending.split_at(room.min(pending.len()));
            self.append(cursor.generation, batch).await?;
            cursor.count += batch.len();
            pending = rest;
        }

        save_json(self.state.as_ref(), BAD_LINES_KEY, &cursor)
            .await
            .context(BadLineCursorSnafu)?;
        debug!(
            entries = total,
            generation = cursor.generation,
            count = cursor.count,
            "Flushed bad lines"
        );
        Ok(())
    }

    async fn append(&self, generation: u64, batch: &[BadLineEntry]) -> Result<(), BadLineError> {
        let path = generation_path(generation);
        let mut content = match self.storage.get(path.as_str()).await {
            Ok(bytes) => bytes.to_vec(),
            Err(e) if e.is_not_found() => Vec::new(),
            Err(e) => return Err(e).context(BadLineWriteSnafu { generation }),
        };

        for entry in batch {
            serde_json::to_writer(&mut content, entry).context(BadLineSerializeSnafu)?;
            content.push(b'\n');
        }

        self.storage
            .put(path.as_str(), Bytes::from(content))
            .await
            .context(BadLineWriteSnafu { generation })
    }
}
