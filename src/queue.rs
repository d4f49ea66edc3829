//! Ordered queue of input files.
//!
//! The queue is built once per `start` and persisted next to the job. Files
//! are ordered newest-first by the year and month inferred from their names;
//! files without a recognizable date go last. The queue only advances when
//! the current file's job completes.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::LazyLock;

use crate::emit;
use crate::error::StateError;
use crate::metrics::events::QueuePosition;
use crate::state::{QUEUE_KEY, StateStore, load_json, save_json};

const MONTHS: &str = r"jan(?:uary)?|feb(?:ruary)?|mar(?:ch)?|apr(?:il)?|may|june?|july?|aug(?:ust)?|sep(?:t(?:ember)?)?|oct(?:ober)?|nov(?:ember)?|dec(?:ember)?";
const YEAR: &str = r"(?:19|20)\d{2}";

static MONTH_THEN_YEAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)(?:^|[^a-z])(?P<month>{MONTHS})[^a-z0-9]*(?P<year>{YEAR})(?:$|\D)"
    ))
    .expect("valid regex")
});
static YEAR_THEN_MONTH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)(?:^|\D)(?P<year>{YEAR})[^a-z0-9]*(?P<month>{MONTHS})(?:$|[^a-z])"
    ))
    .expect("valid regex")
});
// YYYY-MM, YYYY_MM, YYYYMM, optionally followed by a day
static NUMERIC_YEAR_MONTH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?:^|\D)(?P<year>{YEAR})[-_]?(?P<month>0[1-9]|1[0-2])(?:[-_]?\d{{2}})?(?:$|\D)"
    ))
    .expect("valid regex")
});
static NUMERIC_MONTH_YEAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?:^|\D)(?P<month>0?[1-9]|1[0-2])-(?P<year>{YEAR})(?:$|\D)"
    ))
    .expect("valid regex")
});

fn month_number(name: &str) -> Option<u32> {
    let prefix: String = name.chars().take(3).collect::<String>().to_ascii_lowercase();
    let month = match prefix.as_str() {
        "jan" => 1,
        "feb" => 2,
        "mar" => 3,
        "apr" => 4,
        "may" => 5,
        "jun" => 6,
        "jul" => 7,
        "aug" => 8,
        "sep" => 9,
        "oct" => 10,
        "nov" => 11,
        "dec" => 12,
        _ => return None,
    };
    Some(month)
}

/// Infer `(year, month)` from a file name.
pub fn infer_year_month(file_name: &str) -> Option<(i32, u32)> {
    for re in [&*MONTH_THEN_YEAR, &*YEAR_THEN_MONTH] {
        if let Some(caps) = re.captures(file_name) {
            let year = caps["year"].parse().ok()?;
            let month = month_number(&caps["month"])?;
            return Some((year, month));
        }
    }
    for re in [&*NUMERIC_YEAR_MONTH, &*NUMERIC_MONTH_YEAR] {
        if let Some(caps) = re.captures(file_name) {
            let year = caps["year"].parse().ok()?;
            let month = caps["month"].parse().ok()?;
            return Some((year, month));
        }
    }
    None
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub path: String,
    pub year: Option<i32>,
    pub month: Option<u32>,
}

impl QueueEntry {
    pub fn new(path: impl Into<String>) -> Self {
        let path = path.into();
        let file_name = path.rsplit('/').next().unwrap_or(&path);
        let (year, month) = match infer_year_month(file_name) {
            Some((year, month)) => (Some(year), Some(month)),
            None => (None, None),
        };
        Self { path, year, month }
    }

    fn tag(&self) -> Option<(i32, u32)> {
        self.year.zip(self.month)
    }
}

/// Newest first, untagged last, ties by descending path.
fn newest_first(a: &QueueEntry, b: &QueueEntry) -> Ordering {
    match (a.tag(), b.tag()) {
        (Some(a_tag), Some(b_tag)) => b_tag.cmp(&a_tag).then_with(|| b.path.cmp(&a.path)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => b.path.cmp(&a.path),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileQueue {
    pub entries: Vec<QueueEntry>,
    pub current: usize,
    pub built_at: DateTime<Utc>,
}

impl FileQueue {
    /// Build a queue from candidate paths.
    pub fn build<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut entries: Vec<QueueEntry> = paths.into_iter().map(QueueEntry::new).collect();
        entries.sort_by(newest_first);
        Self {
            entries,
            current: 0,
            built_at: Utc::now(),
        }
    }

    pub fn current_entry(&self) -> Option<&QueueEntry> {
        self.entries.get(self.current)
    }

    pub fn is_finished(&self) -> bool {
        self.current >= self.entries.len()
    }

    /// Files not yet completed, the current one included.
    pub fn remaining(&self) -> usize {
        self.entries.len().saturating_sub(self.current)
    }

    /// Move to the next file. Returns the new current entry.
    pub fn advance(&mut self) -> Option<&QueueEntry> {
        if !self.is_finished() {
            self.current += 1;
        }
        emit!(QueuePosition {
            current: self.current,
            len: self.entries.len(),
        });
        self.current_entry()
    }
}

pub async fn load(store: &dyn StateStore) -> Result<Option<FileQueue>, StateError> {
    load_json(store, QUEUE_KEY).await
}

pub async fn save(store: &dyn StateStore, queue: &FileQueue) -> Result<(), StateError> {
    save_json(store, QUEUE_KEY, queue).await
}

pub async fn clear(store: &dyn StateStore) -> Result<(), StateError> {
    store.delete(QUEUE_KEY).await
}
