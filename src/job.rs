//! Persisted per-file job state.
//!
//! A job tracks how far one input file has been exported: the cursor counts
//! data rows already emitted, `part_index` is the next part to write. The job
//! lives in the state store between invocations and is deleted once the file
//! is complete.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::LazyLock;

use crate::error::StateError;
use crate::partition::part_name;
use crate::state::{JOB_KEY, StateStore, load_json, save_json};

static UNSAFE_NAME_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9._-]+").expect("valid regex"));

/// Lifecycle of the current job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobPhase {
    /// No job is persisted.
    Absent,
    /// An invocation is emitting parts.
    Active,
    /// Rows remain but the invocation budget is spent.
    Paused,
    /// Every row of the source has been emitted.
    Complete,
}

impl JobPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobPhase::Absent => "ABSENT",
            JobPhase::Active => "ACTIVE",
            JobPhase::Paused => "PAUSED",
            JobPhase::Complete => "COMPLETE",
        }
    }

    /// Phase of a job as seen between invocations.
    pub fn of(job: Option<&Job>) -> Self {
        match job {
            None => JobPhase::Absent,
            Some(job) if job.is_complete() => JobPhase::Complete,
            Some(_) => JobPhase::Paused,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub source: String,
    pub output_base: String,
    pub total_rows: Option<usize>,
    pub total_cols: Option<usize>,
    pub cursor: usize,
    pub part_index: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// A fresh job for `source`, positioned before its first part.
    pub fn new(source: impl Into<String>) -> Self {
        let source = source.into();
        let now = Utc::now();
        Self {
            output_base: output_base_for(&source),
            source,
            total_rows: None,
            total_cols: None,
            cursor: 0,
            part_index: 1,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether totals were established by an earlier invocation.
    pub fn has_totals(&self) -> bool {
        self.total_rows.is_some() && self.total_cols.is_some()
    }

    /// Record the file's totals. Totals already set are never changed.
    pub fn establish_totals(&mut self, rows: usize, cols: usize) {
        if self.total_rows.is_none() {
            self.total_rows = Some(rows);
        }
        if self.total_cols.is_none() {
            self.total_cols = Some(cols);
        }
    }

    /// Rows left to emit, if totals are known.
    pub fn remaining(&self) -> Option<usize> {
        self.total_rows.map(|total| total.saturating_sub(self.cursor))
    }

    pub fn is_complete(&self) -> bool {
        self.total_rows.is_some_and(|total| self.cursor >= total)
    }

    /// Object name of the next part.
    pub fn next_part_name(&self) -> String {
        part_name(&self.output_base, self.part_index)
    }

    /// Move past a part of `rows` rows, whether written or skipped.
    pub fn advance(&mut self, rows: usize) {
        self.cursor += rows;
        self.part_index += 1;
        self.updated_at = Utc::now();
    }
}

/// Hex digits of the source path hash appended to every output base.
const SOURCE_HASH_LEN: usize = 8;

/// Output base name derived from a source path: the file stem with unsafe
/// characters collapsed to `_`, followed by a short hash of the full path.
///
/// Files that share a stem (`a.txt`, `a.csv`) or only differ in characters
/// that sanitize alike still get distinct part names.
pub fn output_base_for(source: &str) -> String {
    let file_name = source.rsplit('/').next().unwrap_or(source);
    let stem = match file_name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => file_name,
    };
    let base = UNSAFE_NAME_CHARS.replace_all(stem.trim(), "_");
    let base = base.trim_matches(|c| c == '_' || c == '.');
    let base = if base.is_empty() { "audit" } else { base };

    let digest = hex::encode(Sha256::digest(source.as_bytes()));
    format!("{base}_{}", &digest[..SOURCE_HASH_LEN])
}

pub async fn load(store: &dyn StateStore) -> Result<Option<Job>, StateError> {
    load_json(store, JOB_KEY).await
}

pub async fn save(store: &dyn StateStore, job: &Job) -> Result<(), StateError> {
    save_json(store, JOB_KEY, job).await
}

pub async fn clear(store: &dyn StateStore) -> Result<(), StateError> {
    store.delete(JOB_KEY).await
}
