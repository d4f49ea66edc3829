//! Audit-log line parsing.
//!
//! - `reader`: groups physical lines into logical records
//! - `line`: splits and coerces one record into the fixed 9-field shape

pub mod line;
pub mod reader;

pub use line::{LineOutcome, parse_record, split_fields};
pub use reader::RecordReader;

/// Number of base fields in every normalized record.
pub const BASE_FIELDS: usize = 9;

/// Header row of exported audit logs.
pub const HEADER: &str = "User ID|ID|Subsequence ID|Message|Audit Time (UTC)|Action|Type|Label|Version";

/// One logical record and the 1-based number of its first physical line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLine {
    pub text: String,
    pub line_number: usize,
    /// The input ended inside a quoted field.
    pub unterminated: bool,
}

/// How a record reached the fixed arity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineTag {
    Clean,
    Coerced,
    Padded,
}

impl LineTag {
    /// Reason recorded to the bad-line sink, `None` for clean rows.
    pub fn reason(&self) -> Option<&'static str> {
        match self {
            LineTag::Clean => None,
            LineTag::Coerced => Some("COERCED"),
            LineTag::Padded => Some("PADDED"),
        }
    }
}

/// Why a record was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    TooManyFields,
    UnterminatedQuote,
}

impl Rejection {
    pub fn reason(&self) -> &'static str {
        match self {
            Rejection::TooManyFields => "TOO_MANY_FIELDS",
            Rejection::UnterminatedQuote => "UNTERMINATED_QUOTE",
        }
    }
}

/// The nine base fields of an audit record, in file order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedRecord {
    pub user_id: String,
    pub id: String,
    pub subseq_id: String,
    pub message: String,
    pub audit_time: String,
    pub action_raw: String,
    pub record_type: String,
    pub label: String,
    pub version: String,
}

impl NormalizedRecord {
    pub fn from_fields(fields: [String; BASE_FIELDS]) -> Self {
        let [
            user_id,
            id,
            subseq_id,
            message,
            audit_time,
            action_raw,
            record_type,
            label,
            version,
        ] = fields;
        Self {
            user_id,
            id,
            subseq_id,
            message,
            audit_time,
            action_raw,
            record_type,
            label,
            version,
        }
    }

    pub fn into_fields(self) -> [String; BASE_FIELDS] {
        [
            self.user_id,
            self.id,
            self.subseq_id,
            self.message,
            self.audit_time,
            self.action_raw,
            self.record_type,
            self.label,
            self.version,
        ]
    }
}
