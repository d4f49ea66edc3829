//! Quote-aware splitting and arity coercion.

use super::{BASE_FIELDS, LineTag, NormalizedRecord, Rejection};

/// Index of the free-text message field.
const MESSAGE_INDEX: usize = 3;
/// Fields after the message that are assumed delimiter-free.
const TRAILING_FIELDS: usize = 5;

/// Result of parsing one logical record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineOutcome {
    Accepted {
        record: NormalizedRecord,
        tag: LineTag,
    },
    Rejected(Rejection),
}

/// Split on `delimiter` outside double quotes.
///
/// Quote characters are consumed; `""` inside a quoted run yields a literal `"`.
pub fn split_fields(text: &str, delimiter: char) -> Vec<String> {
    let mut fields = Vec::with_capacity(BASE_FIELDS);
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                chars.next();
                current.push('"');
            }
            '"' => in_quotes = !in_quotes,
            c if c == delimiter && !in_quotes => fields.push(std::mem::take(&mut current)),
            c => current.push(c),
        }
    }
    fields.push(current);
    fields
}

/// Strip one pair of quotes wrapping the whole record and undouble inner quotes.
fn unwrap_record(text: &str) -> Option<String> {
    let inner = text.strip_prefix('"')?.strip_suffix('"')?;
    Some(inner.replace("\"\"", "\""))
}

/// Bring split fields to exactly nine.
fn coerce(
    mut fields: Vec<String>,
    delimiter: char,
) -> Result<([String; BASE_FIELDS], LineTag), Rejection> {
    let tag = match fields.len() {
        BASE_FIELDS => LineTag::Clean,
        n if n < BASE_FIELDS => {
            fields.resize(BASE_FIELDS, String::new());
            LineTag::Padded
        }
        n => {
            let merge_end = n
                .checked_sub(TRAILING_FIELDS)
                .filter(|end| *end > MESSAGE_INDEX)
                .ok_or(Rejection::TooManyFields)?;
            let tail = fields.split_off(merge_end);
            let merged = fields
                .drain(MESSAGE_INDEX..)
                .collect::<Vec<_>>()
                .join(&delimiter.to_string());
            fields.push(merged);
            fields.extend(tail);
            LineTag::Coerced
        }
    };

    let fields: [String; BASE_FIELDS] = fields.try_into().map_err(|_| Rejection::TooManyFields)?;
    Ok((fields, tag))
}

/// Parse one logical record into a normalized record or a rejection.
pub fn parse_record(text: &str, delimiter: char) -> LineOutcome {
    let mut fields = split_fields(text, delimiter);

    if fields.len() == 1
        && fields[0].contains(delimiter)
        && let Some(unwrapped) = unwrap_record(text)
    {
        fields = split_fields(&unwrapped, delimiter);
    }

    match coerce(fields, delimiter) {
        Ok((fields, tag)) => LineOutcome::Accepted {
            record: NormalizedRecord::from_fields(fields),
            tag,
        },
        Err(rejection) => LineOutcome::Rejected(rejection),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accepted(text: &str) -> (NormalizedRecord, LineTag) {
        match parse_record(text, '|') {
            LineOutcome::Accepted { record, tag } => (record, tag),
            LineOutcome::Rejected(r) => panic!("unexpected rejection {r:?} for {text}"),
        }
    }

    #[test]
    fn test_nine_fields_pass_through_untagged() {
        let (record, tag) = accepted("u1|10|0|started x|2024-01-05 10:00:00|Edit|Recipe|Mix A|3");
        assert_eq!(tag, LineTag::Clean);
        assert_eq!(record.user_id, "u1");
        assert_eq!(record.message, "started x");
        assert_eq!(record.record_type, "Recipe");
        assert_eq!(record.version, "3");
    }

    #[test]
    fn test_overflow_is_merged_into_message() {
        let (record, tag) = accepted("u|1|2|a|b|c|t|act|type|label|v");
        assert_eq!(tag, LineTag::Coerced);
        assert_eq!(record.message, "a|b|c");
        assert_eq!(record.audit_time, "t");
        assert_eq!(record.version, "v");
        assert_eq!(record.into_fields().len(), BASE_FIELDS);
    }

    #[test]
    fn test_short_rows_are_padded() {
        let (record, tag) = accepted("u|1|2|msg");
        assert_eq!(tag, LineTag::Padded);
        assert_eq!(record.message, "msg");
        assert_eq!(record.audit_time, "");
        assert_eq!(record.version, "");
    }

    #[test]
    fn test_quoted_delimiters_do_not_split() {
        let fields = split_fields(r#"u|1|2|"note: a|b ""quoted"""|t|a|ty|l|v"#, '|');
        assert_eq!(fields.len(), 9);
        assert_eq!(fields[3], r#"note: a|b "quoted""#);
    }

    #[test]
    fn test_whole_record_quoted_is_unwrapped() {
        let (record, tag) = accepted(r#""u|1|2|said ""hi""|t|a|ty|l|v""#);
        assert_eq!(tag, LineTag::Clean);
        assert_eq!(record.user_id, "u");
        assert_eq!(record.message, "said hi");
        assert_eq!(record.version, "v");
    }

    #[test]
    fn test_custom_delimiter() {
        let fields = split_fields("a;b;\"c;d\"", ';');
        assert_eq!(fields, vec!["a", "b", "c;d"]);
    }

    #[test]
    fn test_ten_fields_merge_two_into_message() {
        let too_many = vec![String::new(); 10];
        let (fields, tag) = coerce(too_many, '|').unwrap();
        assert_eq!(tag, LineTag::Coerced);
        assert_eq!(fields[MESSAGE_INDEX], "|");
    }
}
