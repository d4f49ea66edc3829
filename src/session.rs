//! Session correlation of checkout/checkin events.
//!
//! Rows are classified by phrase, then walked in input order. A start opens
//! a window on its key's stack; an end closes the most recent open window
//! for the same key. Durations are capped so abandoned sessions do not
//! produce multi-day outliers.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use std::collections::HashMap;
use tracing::debug;

use crate::config::SessionConfig;
use crate::emit;
use crate::enrich::EnrichedRecord;
use crate::metrics::events::SessionsClosed;

/// Hard cap for automatically closed sessions (8 hours).
pub const AUTO_END_CAP_SECS: i64 = 28_800;
/// Manual sessions longer than this are normalized per elapsed day.
pub const MANUAL_CAP_SECS: i64 = 28_000;
const SECS_PER_DAY: i64 = 86_400;

const NAIVE_FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%m/%d/%Y %H:%M:%S"];

/// Session role of a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Start,
    End,
    AutoEnd,
    Neither,
}

/// Case-insensitive phrase classifier.
#[derive(Debug, Clone)]
pub struct PhraseMatchers {
    start: Vec<String>,
    end: Vec<String>,
    auto_end: Vec<String>,
}

fn lowered(phrases: &[String]) -> Vec<String> {
    phrases
        .iter()
        .map(|p| p.to_lowercase())
        .filter(|p| !p.is_empty())
        .collect()
}

impl PhraseMatchers {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            start: lowered(&config.start_phrases),
            end: lowered(&config.end_phrases),
            auto_end: lowered(&config.auto_end_phrases),
        }
    }

    pub fn classify(&self, message: &str) -> EventKind {
        let message = message.to_lowercase();
        let hit = |phrases: &[String]| phrases.iter().any(|p| message.contains(p.as_str()));
        if hit(&self.auto_end) {
            EventKind::AutoEnd
        } else if hit(&self.end) {
            EventKind::End
        } else if hit(&self.start) {
            EventKind::Start
        } else {
            EventKind::Neither
        }
    }
}

impl Default for PhraseMatchers {
    fn default() -> Self {
        Self::from_config(&SessionConfig::default())
    }
}

/// Parse an audit timestamp; naive forms are taken as UTC.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .map(|naive| naive.and_utc())
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Apply the duration cap for a closed session.
pub fn cap_duration(raw_secs: i64, auto_end: bool) -> i64 {
    if auto_end {
        raw_secs.min(AUTO_END_CAP_SECS)
    } else if raw_secs > MANUAL_CAP_SECS {
        let days = raw_secs / SECS_PER_DAY;
        if days <= 1 {
            MANUAL_CAP_SECS
        } else {
            days * MANUAL_CAP_SECS
        }
    } else {
        raw_secs
    }
}

/// Counts of sessions closed by one correlation run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub manual: u64,
    pub automatic: u64,
    pub unmatched_ends: u64,
}

struct OpenWindow {
    row: usize,
    start: Option<DateTime<Utc>>,
}

/// Pair start and end rows and write session columns onto start rows.
pub fn correlate(records: &mut [EnrichedRecord], matchers: &PhraseMatchers) -> SessionStats {
    // Pass 1: classify, stamp start rows
    let kinds: Vec<EventKind> = records
        .iter_mut()
        .map(|record| {
            let kind = matchers.classify(&record.base.message);
            if kind == EventKind::Start {
                record.session_start = parse_timestamp(&record.base.audit_time)
                    .map(format_timestamp)
                    .unwrap_or_default();
            }
            kind
        })
        .collect();

    // Pass 2: pair in input order
    let mut open: HashMap<(String, String), Vec<OpenWindow>> = HashMap::new();
    let mut stats = SessionStats::default();

    for (row, kind) in kinds.into_iter().enumerate() {
        match kind {
            EventKind::Start => {
                let start = parse_timestamp(&records[row].base.audit_time);
                open.entry(records[row].session_key())
                    .or_default()
                    .push(OpenWindow { row, start });
            }
            EventKind::End | EventKind::AutoEnd => {
                let Some(end) = parse_timestamp(&records[row].base.audit_time) else {
                    continue;
                };
                let Some(window) = open
                    .get_mut(&records[row].session_key())
                    .and_then(|stack| stack.pop())
                else {
                    stats.unmatched_ends += 1;
                    continue;
                };

                let start = window.start.unwrap_or(end);
                let raw = (end - start).num_seconds().max(0);
                let auto_end = kind == EventKind::AutoEnd;

                let start_row = &mut records[window.row];
                start_row.session_end = format_timestamp(end);
                start_row.session_duration = Some(cap_duration(raw, auto_end));

                if auto_end {
                    stats.automatic += 1;
                } else {
                    stats.manual += 1;
                }
            }
            EventKind::Neither => {}
        }
    }

    debug!(
        manual = stats.manual,
        automatic = stats.automatic,
        unmatched_ends = stats.unmatched_ends,
        still_open = open.values().map(Vec::len).sum::<usize>(),
        "Sessions correlated"
    );
    emit!(SessionsClosed {
        manual: stats.manual,
        automatic: stats.automatic,
    });
    stats
}
