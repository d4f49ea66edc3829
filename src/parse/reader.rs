//! Logical record grouping.
//!
//! A quoted field may span physical lines, so lines are accumulated until
//! the quotes balance. Blank lines between records and header rows (quoted
//! or bare, with or without a byte-order mark) are skipped. A record still
//! inside quotes at end of input is yielded last, marked unterminated.

use tracing::warn;

use super::{HEADER, RawLine};

/// Iterator over the logical records of a decoded file.
pub struct RecordReader<'a> {
    lines: std::iter::Enumerate<std::str::Lines<'a>>,
    finished: bool,
}

impl<'a> RecordReader<'a> {
    pub fn new(text: &'a str) -> Self {
        Self {
            lines: text.lines().enumerate(),
            finished: false,
        }
    }
}

fn is_header(buffer: &str) -> bool {
    let candidate = buffer.trim().trim_start_matches('\u{feff}').trim_matches('"');
    candidate == HEADER
}

/// Flip `in_quotes` for every unescaped quote in `line`.
fn track_quotes(line: &str, mut in_quotes: bool) -> bool {
    let mut chars = line.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '"' {
            if in_quotes && chars.peek() == Some(&'"') {
                chars.next();
                continue;
            }
            in_quotes = !in_quotes;
        }
    }
    in_quotes
}

impl Iterator for RecordReader<'_> {
    type Item = RawLine;

    fn next(&mut self) -> Option<RawLine> {
        if self.finished {
            return None;
        }

        let mut buffer = String::new();
        let mut first_line = 0;
        let mut in_quotes = false;

        for (index, line) in self.lines.by_ref() {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if buffer.is_empty() {
                if line.is_empty() {
                    continue;
                }
                first_line = index + 1;
                buffer.push_str(line);
            } else {
                buffer.push('\n');
                buffer.push_str(line);
            }

            if is_header(&buffer) {
                buffer.clear();
                in_quotes = false;
                continue;
            }

            in_quotes = track_quotes(line, in_quotes);
            if !in_quotes {
                return Some(RawLine {
                    text: buffer,
                    line_number: first_line,
                    unterminated: false,
                });
            }
        }

        self.finished = true;
        if buffer.is_empty() {
            return None;
        }
        warn!(
            line_number = first_line,
            "Trailing record has an unterminated quote"
        );
        Some(RawLine {
            text: buffer,
            line_number: first_line,
            unterminated: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(text: &str) -> Vec<(usize, String)> {
        RecordReader::new(text)
            .map(|r| (r.line_number, r.text))
            .collect()
    }

    #[test]
    fn test_skips_header_and_blank_lines() {
        let text = format!("{HEADER}\n\nu|1|2|m|t|a|ty|l|v\r\nu|2|3|m|t|a|ty|l|v\n");
        assert_eq!(
            collect(&text),
            vec![
                (3, "u|1|2|m|t|a|ty|l|v".to_string()),
                (4, "u|2|3|m|t|a|ty|l|v".to_string()),
            ]
        );
    }

    #[test]
    fn test_quoted_header_with_bom_is_skipped() {
        let text = format!("\u{feff}\"{HEADER}\"\nu|1|2|m|t|a|ty|l|v");
        let records = collect(&text);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].0, 2);
    }

    #[test]
    fn test_quoted_field_spans_lines() {
        let text = "u|1|2|\"first\nsecond\"|t|a|ty|l|v\nu|2|3|m|t|a|ty|l|v";
        let records = collect(text);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], (1, "u|1|2|\"first\nsecond\"|t|a|ty|l|v".to_string()));
        assert_eq!(records[1].0, 3);
    }

    #[test]
    fn test_unterminated_quote_at_end_is_marked() {
        let text = "u|1|2|m|t|a|ty|l|v\nu|2|3|\"open|t\nmore|text";
        let records: Vec<RawLine> = RecordReader::new(text).collect();
        assert_eq!(records.len(), 2);
        assert!(!records[0].unterminated);
        assert_eq!(
            records[1],
            RawLine {
                text: "u|2|3|\"open|t\nmore|text".to_string(),
                line_number: 2,
                unterminated: true,
            }
        );
    }
}
