//! Repair directives: free-form critique text → typed [`Adjustment`]s.
//!
//! The critic speaks prose ("rows on page 4 are wrapped, stitch them",
//! "column 3 is the price"). Everything it says is parsed here, once, into a
//! closed set of adjustments; the rest of the pipeline only ever sees the
//! enum. Directives that match nothing are kept for the audit trail.
//!
//! Page adjustments always apply to a fresh copy of the window's pages, never
//! to the output of a previous repair.

use crate::model::{Page, Segment};
use crate::pipeline::fallback::ExtractorOptions;
use crate::pipeline::patterns::{ColumnHint, Role, MAX_HINT_COLUMNS};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// One recognised repair intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Adjustment {
    /// Re-split table segments from their raw source text.
    Resegment,
    /// Join rows that were wrapped across lines.
    StitchRows,
    /// Column `index` (1-based) holds `role`.
    ColumnHint { index: usize, role: Role },
    /// Try the named pattern first.
    PreferPattern { name: String },
    /// Skip the LLM and the pattern matcher; use price-anchored recovery.
    ForceRecovery,
}

impl Adjustment {
    /// True for adjustments that only change how the rule-based extractor
    /// reads a page, as opposed to rewriting the page itself.
    pub fn steers_extractor(&self) -> bool {
        matches!(
            self,
            Adjustment::ColumnHint { .. } | Adjustment::PreferPattern { .. } | Adjustment::ForceRecovery
        )
    }
}

/// Parsed directives of one critique round.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedRepairs {
    pub adjustments: Vec<Adjustment>,
    pub unrecognized: Vec<String>,
}

static RE_RESEGMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bre-?segment|\bre-?split\b|\bfrom (?:the )?raw text|\bsplit .*\braw\b").unwrap()
});
static RE_STITCH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bstitch|\bwrapped\b|\b(?:merge|join) (?:the )?(?:wrapped |broken |split )?(?:rows|lines)\b")
        .unwrap()
});
static RE_COLUMN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\bcolumn\s*#?\s*(\d+)\s*(?:is|=|as|->|→|to|should be|contains|holds|maps to)\s+(?:the\s+|a\s+)?([a-z][a-z /%_.]*)",
    )
    .unwrap()
});
static RE_PREFER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\b(?:prefer(?:red)?|use|try)\s+(?:the\s+)?pattern\s+[`'"]?([A-Za-z0-9_\-]+)"#).unwrap()
});
static RE_FORCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bforce[d]?\s+(?:the\s+)?(?:price[- ]anchored\s+)?(?:recovery|fallback)\b|\buse\s+(?:the\s+)?price[- ]anchored\b|\bprice[- ]anchored recovery\b")
        .unwrap()
});

/// Parse one directive. A single sentence may carry several intents.
pub fn parse_directive(directive: &str) -> Vec<Adjustment> {
    scan(directive).0
}

/// Adjustments found in `directive`, and whether a column reference fell
/// outside `1..=MAX_HINT_COLUMNS`.
fn scan(directive: &str) -> (Vec<Adjustment>, bool) {
    let mut out = Vec::new();
    let mut rejected = false;
    if RE_RESEGMENT.is_match(directive) {
        out.push(Adjustment::Resegment);
    }
    if RE_STITCH.is_match(directive) {
        out.push(Adjustment::StitchRows);
    }
    for caps in RE_COLUMN.captures_iter(directive) {
        let index = caps[1]
            .parse::<usize>()
            .ok()
            .filter(|i| (1..=MAX_HINT_COLUMNS).contains(i));
        rejected |= index.is_none();
        let role = caps[2]
            .split_whitespace()
            .take(3)
            .collect::<Vec<_>>()
            .join(" ");
        let role = Role::from_label(&role).or_else(|| {
            caps[2]
                .split_whitespace()
                .next()
                .and_then(Role::from_label)
        });
        if let (Some(index), Some(role)) = (index, role) {
            out.push(Adjustment::ColumnHint { index, role });
        }
    }
    if let Some(caps) = RE_PREFER.captures(directive) {
        out.push(Adjustment::PreferPattern {
            name: caps[1].to_string(),
        });
    }
    if RE_FORCE.is_match(directive) {
        out.push(Adjustment::ForceRecovery);
    }
    (out, rejected)
}

/// Parse a critique round's directives, de-duplicating adjustments.
pub fn parse_directives(directives: &[String]) -> ParsedRepairs {
    let mut parsed = ParsedRepairs::default();
    for d in directives {
        let (found, rejected) = scan(d);
        if found.is_empty() || rejected {
            parsed.unrecognized.push(d.clone());
        }
        for adj in found {
            if !parsed.adjustments.contains(&adj) {
                parsed.adjustments.push(adj);
            }
        }
    }
    parsed
}

/// Fold adjustments into extractor options. Later hints for the same column win.
pub fn apply_to_options(options: &mut ExtractorOptions, adjustments: &[Adjustment]) {
    for adj in adjustments {
        match adj {
            Adjustment::ColumnHint { index, role } => {
                options.column_hints.retain(|h| h.index != *index);
                options.column_hints.push(ColumnHint {
                    index: *index,
                    role: *role,
                });
            }
            Adjustment::PreferPattern { name } => {
                options.preferred_patterns.retain(|p| p != name);
                options.preferred_patterns.insert(0, name.clone());
            }
            Adjustment::ForceRecovery => options.force_recovery = true,
            Adjustment::Resegment | Adjustment::StitchRows => {}
        }
    }
}

/// Fresh copy of `pages` with the page-level adjustments applied.
pub fn apply_to_pages(pages: &[Page], adjustments: &[Adjustment]) -> Vec<Page> {
    let mut out = pages.to_vec();
    if adjustments.contains(&Adjustment::Resegment) {
        for page in &mut out {
            resegment(page);
        }
    }
    if adjustments.contains(&Adjustment::StitchRows) {
        for page in &mut out {
            stitch(page);
        }
    }
    out
}

/// Replace tables with their raw row text so the line view re-splits them.
fn resegment(page: &mut Page) {
    for seg in &mut page.segments {
        if let Segment::Table {
            id,
            header,
            rows,
            source_rows,
        } = seg
        {
            let text = if !source_rows.is_empty() {
                source_rows.join("\n")
            } else {
                std::iter::once(header.clone())
                    .filter(|h| !h.is_empty())
                    .chain(rows.iter().cloned())
                    .map(|cells| cells.join("    "))
                    .collect::<Vec<_>>()
                    .join("\n")
            };
            *seg = Segment::Text {
                id: format!("{id}-raw"),
                text,
                bbox: None,
            };
        }
    }
}

fn ends_with_digit(s: &str) -> bool {
    s.trim_end().ends_with(|c: char| c.is_ascii_digit())
}

/// Join wrapped rows: table rows with an empty first cell fold into the row
/// above; text lines that hold a digit but no trailing number fold into the
/// next line when that one does end in a number.
fn stitch(page: &mut Page) {
    for seg in &mut page.segments {
        match seg {
            Segment::Table { rows, .. } => {
                let mut merged: Vec<Vec<String>> = Vec::with_capacity(rows.len());
                for row in rows.drain(..) {
                    let continuation = row.first().is_some_and(|c| c.trim().is_empty());
                    match merged.last_mut() {
                        Some(prev) if continuation => {
                            for (i, cell) in row.into_iter().enumerate() {
                                let cell = cell.trim().to_string();
                                if cell.is_empty() {
                                    continue;
                                }
                                match prev.get_mut(i) {
                                    Some(p) if p.trim().is_empty() => *p = cell,
                                    Some(p) => {
                                        p.push(' ');
                                        p.push_str(&cell);
                                    }
                                    None => prev.push(cell),
                                }
                            }
                        }
                        _ => merged.push(row),
                    }
                }
                *rows = merged;
            }
            Segment::Text { text, .. } => {
                let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
                let mut out: Vec<String> = Vec::with_capacity(lines.len());
                let mut i = 0;
                while i < lines.len() {
                    let line = lines[i].trim_end();
                    let wrapped = line.chars().any(|c| c.is_ascii_digit())
                        && !ends_with_digit(line)
                        && lines.get(i + 1).is_some_and(|next| ends_with_digit(next));
                    if wrapped {
                        out.push(format!("{}    {}", line, lines[i + 1].trim()));
                        i += 2;
                    } else {
                        out.push(line.to_string());
                        i += 1;
                    }
                }
                *text = out.join("\n");
            }
            Segment::Image { .. } => {}
        }
    }
}
