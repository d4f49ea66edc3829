//! Turning a decoded source file into output rows.
//!
//! Runs on the blocking pool: parsing, enrichment and session correlation
//! are CPU bound and need the whole file, since a session may close many
//! lines after it opened.

use crate::emit;
use crate::enrich::{COLUMNS, EnrichedRecord, enrich};
use crate::metrics::events::{LineFlagged, LinesParsed};
use crate::parse::{LineOutcome, RecordReader, Rejection, parse_record};
use crate::session::{PhraseMatchers, SessionStats, correlate};

/// A line that was rejected, or recovered with a tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlaggedLine {
    pub line_number: usize,
    pub raw: String,
    pub reason: &'static str,
}

/// Output rows of one source file, in input order.
#[derive(Debug, Default)]
pub struct PreparedFile {
    pub records: Vec<EnrichedRecord>,
    pub flagged: Vec<FlaggedLine>,
    pub logical_lines: usize,
    pub sessions: SessionStats,
}

/// Parse, enrich and correlate a whole file.
pub fn prepare(text: &str, delimiter: char, matchers: &PhraseMatchers) -> PreparedFile {
    let mut prepared = PreparedFile::default();

    for raw in RecordReader::new(text) {
        prepared.logical_lines += 1;
        let outcome = if raw.unterminated {
            LineOutcome::Rejected(Rejection::UnterminatedQuote)
        } else {
            parse_record(&raw.text, delimiter)
        };
        match outcome {
            LineOutcome::Accepted { record, tag } => {
                if let Some(reason) = tag.reason() {
                    emit!(LineFlagged { reason });
                    prepared.flagged.push(FlaggedLine {
                        line_number: raw.line_number,
                        raw: raw.text,
                        reason,
                    });
                }
                prepared.records.push(enrich(record));
            }
            LineOutcome::Rejected(rejection) => {
                let reason = rejection.reason();
                emit!(LineFlagged { reason });
                prepared.flagged.push(FlaggedLine {
                    line_number: raw.line_number,
                    raw: raw.text,
                    reason,
                });
            }
        }
    }

    emit!(LinesParsed {
        count: prepared.logical_lines as u64,
    });
    prepared.sessions = correlate(&mut prepared.records, matchers);
    prepared
}

pub fn sheet_header() -> Vec<String> {
    COLUMNS.iter().map(|c| c.to_string()).collect()
}

/// Sheet cells of a record; the duration is blank when no session closed.
pub fn sheet_row(record: &EnrichedRecord) -> Vec<String> {
    let mut row: Vec<String> = record
        .text_cells()
        .iter()
        .map(|cell| cell.to_string())
        .collect();
    row.push(
        record
            .session_duration
            .map(|d| d.to_string())
            .unwrap_or_default(),
    );
    row
}
