//! Reader for the CSV files written by H2's `CSVWRITE`.
//!
//! H2 quotes every non-null value and writes nulls as the configured null
//! marker without quotes, so quoting is significant: an unquoted field equal
//! to the marker (or empty) is SQL NULL.

/// Null marker passed to `CSVWRITE`
pub const NULL_MARKER: &str = "\\N";

/// Parses CSV text into rows of nullable fields. Handles quoted fields with
/// doubled quotes, embedded separators and line breaks, and both `\n` and
/// `\r\n` line endings.
pub fn parse(text: &str) -> Vec<Vec<Option<String>>> {
    let mut rows = Vec::new();
    let mut row: Vec<Option<String>> = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            if c == '"' {
                if chars.peek() == Some(&'"') {
                    field.push('"');
                    chars.next();
                } else {
                    in_quotes = false;
                }
            } else {
                field.push(c);
            }
            continue;
        }

        match c {
            '"' => {
                in_quotes = true;
                quoted = true;
            }
            ',' => {
                row.push(finish_field(&mut field, &mut quoted));
            }
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' => {
                row.push(finish_field(&mut field, &mut quoted));
                rows.push(std::mem::take(&mut row));
            }
            _ => field.push(c),
        }
    }

    // Last line without a trailing line break
    if !field.is_empty() || quoted || !row.is_empty() {
        row.push(finish_field(&mut field, &mut quoted));
        rows.push(row);
    }

    rows
}

fn finish_field(field: &mut String, quoted: &mut bool) -> Option<String> {
    let text = std::mem::take(field);
    let was_quoted = std::mem::replace(quoted, false);
    if !was_quoted && (text.is_empty() || text == NULL_MARKER) {
        None
    } else {
        Some(text)
    }
}
