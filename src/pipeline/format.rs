//! Segment formatting: render a page's text and tables as one text block.
//!
//! Text-mode requests send the model a flat string, so every structural
//! boundary has to survive as plain text:
//!
//! ```text
//! --- Page 4 ---
//! BILL OF LADING ...
//!
//! [Table 1]
//! | Vessel | Poids |
//! | --- | --- |
//! | KOUROS QUEEN | 9000000 |
//! [/Table 1]
//! ```
//!
//! Table cells are escaped (`\` → `\\`, `|` → `\|`, newline → `\n`,
//! carriage return → `\r`) so a table row always splits back into exactly
//! its cells. [`parse_table`] reverses [`format_table`] losslessly.

use crate::model::{ExtractionSegment, Table};

/// Separator placed between consecutive page segments.
pub const SEGMENT_SEPARATOR: &str = "\n\n";

/// The marker line that opens every page segment.
pub fn page_header(page: usize) -> String {
    format!("--- Page {page} ---")
}

/// Render one page: header marker, raw text, then each non-empty table.
pub fn format_segment(segment: &ExtractionSegment) -> String {
    let mut out = page_header(segment.page);
    let text = segment.text.trim_end();
    if !text.is_empty() {
        out.push('\n');
        out.push_str(text);
    }

    let mut n = 0;
    for table in &segment.tables {
        let rendered = format_table(table);
        if rendered.is_empty() {
            continue;
        }
        n += 1;
        out.push_str(&format!("\n\n[Table {n}]\n{rendered}[/Table {n}]"));
    }
    out
}

/// Concatenate formatted segments in the order given.
pub fn join_segments(segments: &[ExtractionSegment]) -> String {
    segments
        .iter()
        .map(format_segment)
        .collect::<Vec<_>>()
        .join(SEGMENT_SEPARATOR)
}

/// Render a table as header row, separator row and data rows, each line
/// terminated by `\n`. Empty tables render as an empty string.
pub fn format_table(table: &Table) -> String {
    let Some(header) = table.header() else {
        return String::new();
    };
    if header.is_empty() {
        return String::new();
    }

    let mut out = String::new();
    out.push_str(&format_row(header));
    out.push_str(&format_row(&vec!["---".to_string(); header.len()]));
    for row in table.body() {
        out.push_str(&format_row(row));
    }
    out
}

fn format_row(cells: &[String]) -> String {
    let mut line = String::from("|");
    for cell in cells {
        line.push(' ');
        line.push_str(&escape_cell(cell));
        line.push_str(" |");
    }
    line.push('\n');
    line
}

fn escape_cell(cell: &str) -> String {
    let mut out = String::with_capacity(cell.len());
    for ch in cell.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '|' => out.push_str("\\|"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out
}

/// Parse text produced by [`format_table`] back into a table.
///
/// Returns `None` when the input is not a header + separator + rows block.
pub fn parse_table(rendered: &str) -> Option<Table> {
    let mut lines = rendered.lines().filter(|l| !l.is_empty());
    let header = parse_row(lines.next()?)?;
    let separator = parse_row(lines.next()?)?;
    if separator.len() != header.len() || separator.iter().any(|c| c != "---") {
        return None;
    }

    let mut rows = vec![header];
    for line in lines {
        let row = parse_row(line)?;
        if row.len() != rows[0].len() {
            return None;
        }
        rows.push(row);
    }
    Some(Table { rows })
}

fn parse_row(line: &str) -> Option<Vec<String>> {
    let mut chars = line.strip_prefix('|')?.chars();
    let mut cells = Vec::new();
    let mut raw = String::new();

    while let Some(ch) = chars.next() {
        match ch {
            '\\' => match chars.next()? {
                'n' => raw.push('\n'),
                'r' => raw.push('\r'),
                other => raw.push(other),
            },
            '|' => {
                let cell = raw.strip_prefix(' ')?.strip_suffix(' ')?;
                cells.push(cell.to_string());
                raw.clear();
            }
            c => raw.push(c),
        }
    }

    // Anything after the closing pipe means this wasn't one of our rows.
    if !raw.is_empty() {
        return None;
    }
    Some(cells)
}
