//! Price-anchored recovery: the deterministic path of last resort.
//!
//! When no column pattern matches, every line is scanned for a trailing
//! price. Text to the left of the price is mined, in this order, for a GST
//! percentage, an HSN code, a pack size and a product code; each match claims
//! its span so later fields cannot reuse it (an HSN is never read as a code).
//! Whatever text is left over becomes the name.
//!
//! Confidence is a weighted sum of the recovered fields, scaled down when the
//! line carries more than one price-like number and reduced when the chunk
//! never showed a header row.

use crate::output::{Group, RecoveryReport, RejectedRow, Variant};
use crate::pipeline::lines::Line;
use crate::pipeline::patterns::{looks_like_header, normalize_pack};
use crate::pipeline::postprocess::{collapse_whitespace, normalize_currency};
use once_cell::sync::Lazy;
use regex::Regex;
use std::ops::Range;

const W_PRICE: f64 = 0.35;
const W_CODE: f64 = 0.25;
const W_NAME: f64 = 0.15;
const W_PACK: f64 = 0.10;
const W_HSN: f64 = 0.075;
const W_GST: f64 = 0.075;

const AMBIGUOUS_FACTOR: f64 = 0.7;
const NO_HEADER_PENALTY: f64 = 0.1;

const DEFAULT_GROUP_TITLE: &str = "Recovered items";

static RE_TRAILING_PRICE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(?:(₹|rs\.?|inr|\$|usd|€|eur|£|gbp)\s*)?(\d[\d,]*(?:\.\d{1,2})?)\s*(?:/-)?\s*(₹|rs\.?|inr|\$|usd|€|eur|£|gbp)?\s*$",
    )
    .unwrap()
});
static RE_GST: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(\d{1,2}(?:\.\d+)?)\s*%").unwrap());
static RE_HSN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(?:\d{8}|\d{6})\b").unwrap());
static RE_PACK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b\d+(?:\.\d+)?\s*(?:/\s*(?:pk|pack|pkt|box|bx|cs|case|set|ea|each|btl|vial|kit|nos)\b|x\s*\d+(?:\.\d+)?\s*(?:ml|l|g|kg|mg|ul|µl|pcs)?\b|(?:ml|ltr|l|gm|g|kg|mg|ul|µl|pcs|nos|units?|tabs?|vials?)\b)",
    )
    .unwrap()
});
static RE_CODE_HYPHEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[A-Za-z0-9]*\d[A-Za-z0-9]*(?:-[A-Za-z0-9]+)+\b|\b[A-Za-z0-9]+(?:-[A-Za-z0-9]*\d[A-Za-z0-9]*)+\b").unwrap());
static RE_CODE_ALNUM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[A-Z]{1,5}\d{2,}[A-Z0-9]*\b").unwrap());
static RE_CODE_NUMERIC: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d{5,}\b").unwrap());
static RE_PRICE_LIKE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|\s)(\d{1,3}(?:,\d{2,3})+(?:\.\d+)?|\d+\.\d{2}|\d{2,})(?:\s|$)").unwrap());

struct Spans(Vec<Range<usize>>);

impl Spans {
    fn overlaps(&self, r: &Range<usize>) -> bool {
        self.0.iter().any(|s| s.start < r.end && r.start < s.end)
    }

    fn claim(&mut self, r: Range<usize>) {
        self.0.push(r);
    }

    /// Text with every claimed span blanked out.
    fn remainder(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        for (i, c) in text.char_indices() {
            if self.0.iter().any(|s| s.contains(&i)) {
                out.push(' ');
            } else {
                out.push(c);
            }
        }
        out
    }
}

fn bounded(text: &str, r: &Range<usize>) -> bool {
    let before = text[..r.start].chars().next_back();
    let after = text[r.end..].chars().next();
    !matches!(before, Some('-' | '/' | '.')) && !matches!(after, Some('-' | '/' | '%'))
}

/// Locate the trailing price: `(value, currency, byte offset where it starts)`.
fn trailing_price(text: &str) -> Option<(f64, Option<String>, usize)> {
    let caps = RE_TRAILING_PRICE.captures(text)?;
    let whole = caps.get(0)?;
    let number = caps.get(2)?;
    if whole.start() > 0 {
        let prev = text[..whole.start()].chars().next_back()?;
        if !prev.is_whitespace() {
            return None;
        }
    }
    let digits = number.as_str().chars().filter(char::is_ascii_digit).count();
    if digits < 2 {
        return None;
    }
    let value: f64 = number.as_str().replace(',', "").parse().ok()?;
    let currency = caps
        .get(1)
        .or_else(|| caps.get(3))
        .and_then(|m| normalize_currency(m.as_str()));
    Some((value, currency, whole.start()))
}

/// Recover a variant from one line. `None` when there is no usable price.
pub fn recover_line(text: &str, header_seen: bool) -> Option<Variant> {
    let text = text.trim();
    let (price, currency, price_at) = trailing_price(text)?;
    let left = &text[..price_at];
    if left.trim().is_empty() {
        return None;
    }

    let mut v = Variant {
        price_value: Some(price),
        currency,
        ..Variant::default()
    };
    let mut spans = Spans(Vec::new());

    if let Some(caps) = RE_GST.captures(left) {
        if let (Some(whole), Some(num)) = (caps.get(0), caps.get(1)) {
            v.gst_percent = num.as_str().parse().ok();
            spans.claim(whole.range());
        }
    }

    let hsn_candidates: Vec<Range<usize>> = RE_HSN
        .find_iter(left)
        .map(|m| m.range())
        .filter(|r| !spans.overlaps(r) && bounded(left, r))
        .collect();
    let has_hyphen_code = RE_CODE_HYPHEN.is_match(left);
    if let Some(r) = hsn_candidates.last().cloned() {
        // A lone number opening the line is the catalogue code, not an HSN.
        let leads = left[..r.start].trim().is_empty();
        if !(hsn_candidates.len() == 1 && leads && !has_hyphen_code) {
            v.hsn = Some(left[r.clone()].to_string());
            spans.claim(r);
        }
    }

    if let Some(m) = RE_PACK
        .find_iter(left)
        .find(|m| !spans.overlaps(&m.range()))
    {
        v.pack = Some(normalize_pack(m.as_str()));
        spans.claim(m.range());
    }

    let code = [&*RE_CODE_HYPHEN, &*RE_CODE_ALNUM, &*RE_CODE_NUMERIC]
        .iter()
        .find_map(|re| {
            re.find_iter(left)
                .find(|m| !spans.overlaps(&m.range()) && bounded(left, &m.range()))
        });
    if let Some(m) = code {
        v.code = Some(m.as_str().to_string());
        spans.claim(m.range());
    }

    let remainder = spans.remainder(left);
    let name = collapse_whitespace(&remainder);
    let name = name.trim_matches(|c: char| c.is_whitespace() || "-|:,;".contains(c));
    if !name.is_empty() && name.chars().any(char::is_alphabetic) {
        v.name = Some(name.to_string());
    }

    let ambiguous = RE_PRICE_LIKE.is_match(&remainder);
    let mut confidence = W_PRICE;
    if v.code.is_some() {
        confidence += W_CODE;
    }
    if v.name.is_some() {
        confidence += W_NAME;
    }
    if v.pack.is_some() {
        confidence += W_PACK;
    }
    if v.hsn.is_some() {
        confidence += W_HSN;
    }
    if v.gst_percent.is_some() {
        confidence += W_GST;
    }
    if ambiguous {
        confidence *= AMBIGUOUS_FACTOR;
    }
    if !header_seen {
        confidence -= NO_HEADER_PENALTY;
    }
    v.confidence = confidence;
    Some(v.refreshed())
}

fn is_title_line(line: &Line) -> bool {
    line.cells.len() == 1
        && line.text.chars().count() <= 80
        && line.text.chars().any(char::is_alphabetic)
        && !line.has_digit()
}

/// Run recovery over every line. Rows under `min_confidence` are reported,
/// not returned.
pub fn recover(lines: &[Line], min_confidence: f64) -> (Vec<Group>, RecoveryReport) {
    let header_seen = lines
        .iter()
        .any(|l| l.table_header || looks_like_header(&l.cells));
    let mut report = RecoveryReport {
        lines_scanned: lines.len(),
        header_seen,
        ..RecoveryReport::default()
    };
    let mut groups: Vec<Group> = Vec::new();
    let mut title: Option<String> = None;

    for line in lines {
        if line.table_header || looks_like_header(&line.cells) {
            continue;
        }
        let Some(variant) = recover_line(&line.text, header_seen) else {
            if is_title_line(line) {
                title = Some(collapse_whitespace(&line.text));
            }
            continue;
        };
        if variant.confidence < min_confidence {
            report.rejected.push(RejectedRow {
                page: line.page,
                line: line.text.clone(),
                confidence: variant.confidence,
            });
            continue;
        }
        report.accepted += 1;
        match title.take() {
            Some(t) => groups.push(Group::new(t)),
            None if groups.is_empty() => groups.push(Group::new(DEFAULT_GROUP_TITLE)),
            None => {}
        }
        if let Some(group) = groups.last_mut() {
            group.variants.push(variant);
        }
    }

    for group in &mut groups {
        let mut headers = Vec::new();
        for (field, label) in [
            ("code", "Code"),
            ("name", "Description"),
            ("pack", "Pack"),
            ("hsn", "HSN"),
            ("gst_percent", "GST %"),
            ("price_value", "Price"),
        ] {
            if group.variants.iter().any(|v| v.has_field(field)) {
                headers.push(label.to_string());
            }
        }
        group.specs_headers = headers;
    }
    (groups, report)
}
