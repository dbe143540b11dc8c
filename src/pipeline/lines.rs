//! Line-oriented view of pages for the deterministic extractors.
//!
//! Text segments are split on newlines and each line into cells on runs of
//! two or more spaces, tabs or pipes. Table segments contribute their header
//! and rows directly as cells, so both shapes look the same downstream.

use crate::model::{Page, Segment};
use once_cell::sync::Lazy;
use regex::Regex;

static RE_CELL_SPLIT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s{2,}|\t|\|").unwrap());

/// One physical line with its cells.
#[derive(Debug, Clone, PartialEq)]
pub struct Line {
    pub page: usize,
    pub segment_id: String,
    /// Original text (table rows are rendered with wide spacing).
    pub text: String,
    pub cells: Vec<String>,
    /// The line is the header row of a table segment.
    pub table_header: bool,
}

impl Line {
    pub fn has_digit(&self) -> bool {
        self.text.chars().any(|c| c.is_ascii_digit())
    }
}

/// Split a line into trimmed, non-empty cells.
pub fn split_cells(text: &str) -> Vec<String> {
    RE_CELL_SPLIT
        .split(text)
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect()
}

fn table_line(page: usize, id: &str, cells: &[String], header: bool) -> Option<Line> {
    let cells: Vec<String> = cells.iter().map(|c| c.trim().to_string()).collect();
    if cells.iter().all(|c| c.is_empty()) {
        return None;
    }
    Some(Line {
        page,
        segment_id: id.to_string(),
        text: cells.join("    "),
        cells,
        table_header: header,
    })
}

/// Flatten pages into lines, in reading order.
pub fn page_lines(pages: &[Page]) -> Vec<Line> {
    let mut out = Vec::new();
    for page in pages {
        for seg in &page.segments {
            match seg {
                Segment::Text { id, text, .. } => {
                    for raw in text.lines() {
                        let trimmed = raw.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        out.push(Line {
                            page: page.number,
                            segment_id: id.clone(),
                            text: trimmed.to_string(),
                            cells: split_cells(trimmed),
                            table_header: false,
                        });
                    }
                }
                Segment::Table {
                    id, header, rows, ..
                } => {
                    if !header.is_empty() {
                        out.extend(table_line(page.number, id, header, true));
                    }
                    for row in rows {
                        out.extend(table_line(page.number, id, row, false));
                    }
                }
                Segment::Image { id, caption } => {
                    if let Some(caption) = caption.as_deref().map(str::trim) {
                        if !caption.is_empty() {
                            out.push(Line {
                                page: page.number,
                                segment_id: id.clone(),
                                text: caption.to_string(),
                                cells: vec![caption.to_string()],
                                table_header: false,
                            });
                        }
                    }
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_wide_gaps_tabs_and_pipes() {
        assert_eq!(
            split_cells("A-1   Buffer pH 7\t2/PK | 250"),
            vec!["A-1", "Buffer pH 7", "2/PK", "250"]
        );
        assert_eq!(split_cells("single spaced words"), vec!["single spaced words"]);
    }

    #[test]
    fn tables_and_text_flatten_in_order() {
        let page = Page::new(
            3,
            vec![
                Segment::Text {
                    id: "t".into(),
                    text: "Buffers\n\n".into(),
                    bbox: None,
                },
                Segment::Table {
                    id: "tab".into(),
                    header: vec!["Code".into(), "Price".into()],
                    rows: vec![vec!["A-1".into(), "100".into()], vec!["".into(), "".into()]],
                    source_rows: vec![],
                },
            ],
        );
        let lines = page_lines(&[page]);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0].text, "Buffers");
        assert!(lines[1].table_header);
        assert_eq!(lines[2].cells, vec!["A-1", "100"]);
        assert_eq!(lines[2].page, 3);
    }
}
