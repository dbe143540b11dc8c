//! Pattern matcher: rule-based extraction of price-list tables.
//!
//! A [`ColumnPattern`] names an ordered set of column [`Role`]s plus the
//! roles a row must populate. The [`PatternRegistry`] tries its patterns, in
//! order, against the line view of the pages until one finds a header line and
//! at least one valid row beneath it. The first such pattern wins; the others
//! are reported as failed attempts.
//!
//! Rows that fail validation are not thrown away: their text is appended to
//! the previous accepted row's name (wrapped descriptions are the common case)
//! or, before any row exists, kept as leftovers for diagnostics.
//!
//! Extra patterns can be dropped into a directory as JSON files, either one
//! pattern object or an array of them. A file pattern whose name matches a
//! built-in replaces it.

use crate::error::ExtractError;
use crate::output::{Group, PatternAttempt, Variant};
use crate::pipeline::lines::Line;
use crate::pipeline::postprocess::{collapse_whitespace, normalize_currency, parse_price};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

// ── Roles ────────────────────────────────────────────────────────────────

/// Semantic role of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Code,
    Name,
    Cas,
    Pack,
    Size,
    Hsn,
    Gst,
    Price,
    Currency,
    Notes,
    Ignore,
}

/// Lookup order for header labels: more specific roles first so that
/// "HSN Code" is not read as a code column and "Unit Price" not as a pack.
const LABEL_ORDER: &[Role] = &[
    Role::Hsn,
    Role::Cas,
    Role::Gst,
    Role::Currency,
    Role::Code,
    Role::Price,
    Role::Pack,
    Role::Size,
    Role::Name,
    Role::Notes,
];

impl Role {
    pub fn synonyms(self) -> &'static [&'static str] {
        match self {
            Role::Code => &[
                "code", "cat no", "catalog no", "catalogue no", "cat", "item code",
                "product code", "sku", "part no", "ref", "article no", "item no",
            ],
            Role::Name => &["description", "product", "name", "item", "particulars", "product name"],
            Role::Cas => &["cas", "cas no", "cas number"],
            Role::Pack => &["pack", "packing", "pack size", "qty", "quantity", "unit", "uom"],
            Role::Size => &["size", "volume", "capacity", "dimension"],
            Role::Hsn => &["hsn", "hsn code", "hsn sac", "sac"],
            Role::Gst => &["gst", "gst %", "tax", "igst", "vat"],
            Role::Price => &["price", "rate", "mrp", "list price", "unit price", "amount", "cost"],
            Role::Currency => &["currency", "curr"],
            Role::Notes => &["notes", "remarks", "note"],
            Role::Ignore => &[],
        }
    }

    /// Canonical header text for the role.
    pub fn display(self) -> &'static str {
        match self {
            Role::Code => "Code",
            Role::Name => "Description",
            Role::Cas => "CAS",
            Role::Pack => "Pack",
            Role::Size => "Size",
            Role::Hsn => "HSN",
            Role::Gst => "GST %",
            Role::Price => "Price",
            Role::Currency => "Currency",
            Role::Notes => "Notes",
            Role::Ignore => "",
        }
    }

    /// Map a header cell or free-form label to a role.
    pub fn from_label(label: &str) -> Option<Role> {
        let norm = normalize_label(label);
        if norm.is_empty() {
            return None;
        }
        for role in LABEL_ORDER {
            if role.synonyms().iter().any(|s| normalize_label(s) == norm) {
                return Some(*role);
            }
        }
        let padded = format!(" {norm} ");
        LABEL_ORDER.iter().copied().find(|role| {
            role.synonyms()
                .iter()
                .any(|s| padded.contains(&format!(" {} ", normalize_label(s))))
        })
    }

    fn validate(self, cell: &str) -> bool {
        let cell = cell.trim();
        if cell.is_empty() {
            return false;
        }
        match self {
            Role::Code => RE_CODE_CELL.is_match(cell) && cell.chars().any(|c| c.is_ascii_digit()),
            Role::Name => cell.chars().any(char::is_alphabetic),
            Role::Cas => RE_CAS.is_match(cell),
            Role::Pack | Role::Size => cell.chars().count() <= 40,
            Role::Hsn => RE_HSN_CELL.is_match(cell),
            Role::Gst => RE_GST_CELL.is_match(cell),
            Role::Price => !cell.contains('%') && parse_price(cell).is_some_and(|(v, _)| v >= 0.0),
            Role::Currency => normalize_currency(cell).is_some(),
            Role::Notes | Role::Ignore => true,
        }
    }
}

fn normalize_label(label: &str) -> String {
    let cleaned: String = label
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '%' { c } else { ' ' })
        .collect();
    collapse_whitespace(&cleaned)
}

static RE_CODE_CELL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9\-./ ]{0,29}$").unwrap());
static RE_CAS: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{2,7}-\d{2}-\d$").unwrap());
static RE_HSN_CELL: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{4,8}$").unwrap());
static RE_GST_CELL: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{1,2}(?:\.\d+)?\s*%?$").unwrap());
static RE_PACK_SLASH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+(?:\.\d+)?)\s*/\s*([A-Za-z]+)").unwrap());

/// Canonical pack text: `2 / pk` → `2/PK`, whitespace collapsed.
pub fn normalize_pack(raw: &str) -> String {
    let collapsed = collapse_whitespace(raw);
    RE_PACK_SLASH
        .replace_all(&collapsed, |caps: &regex::Captures<'_>| {
            format!("{}/{}", &caps[1], caps[2].to_uppercase())
        })
        .to_string()
}

// ── Patterns ─────────────────────────────────────────────────────────────

fn default_min_confidence() -> f64 {
    0.6
}

/// A named column layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnPattern {
    pub name: String,
    /// Column roles in order.
    pub columns: Vec<Role>,
    /// Roles every accepted row must populate. Empty means `[price]`.
    #[serde(default)]
    pub required_roles: Vec<Role>,
    /// Extra words a header line must contain (at least two, or all if fewer).
    #[serde(default)]
    pub header_keywords: Vec<String>,
    /// Share of non-ignored cells that must validate.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    /// Currency assumed when a price cell carries no marker.
    #[serde(default)]
    pub currency: Option<String>,
    /// Rows are recognised without a header line.
    #[serde(default)]
    pub headerless: bool,
}

/// Widest table a column hint may address.
pub const MAX_HINT_COLUMNS: usize = 64;

/// "Column N holds role R", 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnHint {
    pub index: usize,
    pub role: Role,
}

struct RowParse {
    variant: Variant,
    accepted: bool,
}

impl ColumnPattern {
    fn new(name: &str, columns: &[Role], required: &[Role]) -> Self {
        Self {
            name: name.to_string(),
            columns: columns.to_vec(),
            required_roles: required.to_vec(),
            header_keywords: Vec::new(),
            min_confidence: default_min_confidence(),
            currency: None,
            headerless: false,
        }
    }

    /// Headerless pattern built from column hints. `None` without usable
    /// hints; indexes outside `1..=MAX_HINT_COLUMNS` are ignored.
    pub fn from_hints(hints: &[ColumnHint]) -> Option<Self> {
        let usable = || {
            hints
                .iter()
                .filter(|h| (1..=MAX_HINT_COLUMNS).contains(&h.index))
        };
        let width = usable().map(|h| h.index).max()?;
        let mut columns = vec![Role::Ignore; width];
        for hint in usable() {
            columns[hint.index - 1] = hint.role;
        }
        let mut required: Vec<Role> = columns
            .iter()
            .copied()
            .filter(|r| !matches!(r, Role::Ignore | Role::Notes))
            .collect();
        required.dedup();
        Some(Self {
            name: "column-hints".to_string(),
            required_roles: required,
            min_confidence: 0.5,
            headerless: true,
            columns,
            ..Self::new("", &[], &[])
        })
    }

    fn required(&self) -> Vec<Role> {
        if self.required_roles.is_empty() {
            vec![Role::Price]
        } else {
            self.required_roles.clone()
        }
    }

    fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("pattern has no name".into());
        }
        if self.columns.iter().all(|r| *r == Role::Ignore) {
            return Err(format!("pattern '{}' has no usable columns", self.name));
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(format!("pattern '{}': min_confidence must be in [0, 1]", self.name));
        }
        Ok(())
    }

    fn keywords_present(&self, text: &str) -> bool {
        if self.header_keywords.is_empty() {
            return true;
        }
        let lower = text.to_lowercase();
        let hits = self
            .header_keywords
            .iter()
            .filter(|k| lower.contains(&k.to_lowercase()))
            .count();
        hits >= self.header_keywords.len().min(2)
    }

    /// Column layout if `line` is a header for this pattern.
    fn header_layout(&self, line: &Line) -> Option<Vec<Role>> {
        if self.headerless || line.cells.len() < 2 || !self.keywords_present(&line.text) {
            return None;
        }
        let mapped: Vec<Option<Role>> = line.cells.iter().map(|c| Role::from_label(c)).collect();
        let known = mapped.iter().flatten().count();
        if known >= 2 && known * 2 >= line.cells.len() {
            let covers = self
                .columns
                .iter()
                .filter(|r| **r != Role::Ignore)
                .all(|r| mapped.contains(&Some(*r)));
            if covers {
                return Some(mapped.into_iter().map(|r| r.unwrap_or(Role::Ignore)).collect());
            }
        }
        // Custom layouts with unusual labels: trust position when keywords matched.
        if !self.header_keywords.is_empty() && line.cells.len() == self.columns.len() {
            return Some(self.columns.clone());
        }
        None
    }

    fn parse_row(&self, layout: &[Role], cells: &[String]) -> RowParse {
        let reject = RowParse {
            variant: Variant::default(),
            accepted: false,
        };
        let mut layout = layout.to_vec();
        let mut cells = cells.to_vec();

        if cells.len() < layout.len() {
            return reject;
        }
        if cells.len() > layout.len() {
            if self.headerless {
                layout.resize(cells.len(), Role::Ignore);
            } else if let Some(name_at) = layout.iter().position(|r| *r == Role::Name) {
                // Descriptions containing wide gaps split into extra cells.
                let extra = cells.len() - layout.len();
                let joined = cells
                    .drain(name_at..=name_at + extra)
                    .collect::<Vec<_>>()
                    .join(" ");
                cells.insert(name_at, joined);
            } else {
                return reject;
            }
        }

        let mut v = Variant::default();
        let mut counted = 0usize;
        let mut valid = 0usize;
        for (role, cell) in layout.iter().zip(cells.iter()) {
            if *role == Role::Ignore {
                continue;
            }
            counted += 1;
            if !role.validate(cell) {
                continue;
            }
            valid += 1;
            let cell = collapse_whitespace(cell);
            match role {
                Role::Code => v.code = Some(cell),
                Role::Name => {
                    v.name = Some(match v.name.take() {
                        Some(prev) => format!("{prev} {cell}"),
                        None => cell,
                    })
                }
                Role::Cas => v.cas = Some(cell),
                Role::Pack => v.pack = Some(normalize_pack(&cell)),
                Role::Size => v.size = Some(cell),
                Role::Hsn => v.hsn = Some(cell),
                Role::Gst => v.gst_percent = parse_price(&cell).map(|(g, _)| g),
                Role::Price => {
                    if let Some((p, cur)) = parse_price(&cell) {
                        v.price_value = Some(p);
                        if v.currency.is_none() {
                            v.currency = cur;
                        }
                    }
                }
                Role::Currency => v.currency = normalize_currency(&cell),
                Role::Notes => v.notes = Some(cell),
                Role::Ignore => {}
            }
        }

        if self.headerless && v.name.is_none() {
            v.name = layout
                .iter()
                .zip(cells.iter())
                .find(|(r, c)| **r == Role::Ignore && c.chars().any(char::is_alphabetic))
                .map(|(_, c)| collapse_whitespace(c));
        }
        if v.currency.is_none() {
            v.currency = self.currency.as_deref().and_then(normalize_currency);
        }

        let confidence = if counted == 0 {
            0.0
        } else {
            valid as f64 / counted as f64
        };
        v.confidence = confidence;
        let v = v.refreshed();
        let required_ok = self.required().iter().all(|r| match r {
            Role::Code => v.has_field("code"),
            Role::Name => v.has_field("name"),
            Role::Cas => v.has_field("cas"),
            Role::Pack => v.has_field("pack"),
            Role::Size => v.has_field("size"),
            Role::Hsn => v.has_field("hsn"),
            Role::Gst => v.has_field("gst_percent"),
            Role::Price => v.has_field("price_value"),
            Role::Currency => v.has_field("currency"),
            Role::Notes => v.has_field("notes"),
            Role::Ignore => true,
        });
        RowParse {
            accepted: required_ok && confidence >= self.min_confidence,
            variant: v,
        }
    }

    /// Run this pattern over `lines`. `Err` carries the failure reason.
    fn apply(&self, lines: &[Line]) -> Result<(Vec<Group>, Vec<String>), String> {
        let mut groups: Vec<Group> = Vec::new();
        let mut leftovers = Vec::new();
        let mut layout: Option<Vec<Role>> = None;
        let mut last_title: Option<String> = None;
        let mut pending_title: Option<String> = None;
        let mut header_seen = false;
        let mut rows = 0usize;

        let starts_section = |i: usize, layout: Option<&Vec<Role>>| -> bool {
            let Some(next) = lines.get(i + 1) else {
                return false;
            };
            if self.headerless {
                layout.is_some_and(|l| self.parse_row(l, &next.cells).accepted)
            } else {
                self.header_layout(next).is_some()
            }
        };

        if self.headerless {
            layout = Some(self.columns.clone());
        }

        for (i, line) in lines.iter().enumerate() {
            if let Some(found) = self.header_layout(line) {
                header_seen = true;
                let title = pending_title.take().or_else(|| last_title.take());
                if groups.is_empty() || title.is_some() {
                    let mut group = Group::new(
                        title.unwrap_or_else(|| format!("Page {} items", line.page)),
                    );
                    group.specs_headers = line.cells.clone();
                    groups.push(group);
                }
                layout = Some(found);
                continue;
            }

            let Some(current) = layout.as_ref() else {
                if is_title_like(line) {
                    last_title = Some(line.text.clone());
                } else {
                    leftovers.push(line.text.clone());
                }
                continue;
            };

            let row = self.parse_row(current, &line.cells);
            if row.accepted {
                let title = pending_title.take().or_else(|| last_title.take());
                if groups.is_empty() || title.is_some() {
                    let mut group = Group::new(
                        title.unwrap_or_else(|| format!("Page {} items", line.page)),
                    );
                    group.specs_headers = current
                        .iter()
                        .filter(|r| **r != Role::Ignore)
                        .map(|r| r.display().to_string())
                        .collect();
                    groups.push(group);
                }
                if let Some(group) = groups.last_mut() {
                    group.variants.push(row.variant);
                    rows += 1;
                }
                continue;
            }

            if is_title_like(line) && starts_section(i, layout.as_ref()) {
                pending_title = Some(line.text.clone());
                continue;
            }
            match groups.last_mut().and_then(|g| g.variants.last_mut()) {
                Some(prev) => {
                    let text = collapse_whitespace(&line.text);
                    prev.name = Some(match prev.name.take() {
                        Some(name) => format!("{name} {text}"),
                        None => text,
                    });
                    prev.refresh();
                }
                None => leftovers.push(line.text.clone()),
            }
        }

        groups.retain(|g| !g.variants.is_empty());
        if rows == 0 {
            return Err(if self.headerless || header_seen {
                "no valid rows".to_string()
            } else {
                "no header line".to_string()
            });
        }
        Ok((groups, leftovers))
    }
}

fn is_title_like(line: &Line) -> bool {
    line.cells.len() == 1
        && line.text.chars().count() <= 80
        && line.text.chars().any(char::is_alphabetic)
        && !line.text.trim_end().ends_with(|c: char| c.is_ascii_digit())
}

// ── Registry ─────────────────────────────────────────────────────────────

/// Result of running the registry over a set of lines.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchOutcome {
    pub pattern: Option<String>,
    pub groups: Vec<Group>,
    pub failed_attempts: Vec<PatternAttempt>,
    pub leftovers: Vec<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PatternFile {
    Many(Vec<ColumnPattern>),
    One(ColumnPattern),
}

/// Ordered collection of column patterns.
#[derive(Debug, Clone, PartialEq)]
pub struct PatternRegistry {
    patterns: Vec<ColumnPattern>,
}

impl Default for PatternRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl PatternRegistry {
    /// Built-in layouts, widest first so richer headers win.
    pub fn builtin() -> Self {
        use Role::*;
        Self {
            patterns: vec![
                ColumnPattern::new(
                    "code_name_pack_hsn_gst_price",
                    &[Code, Name, Pack, Hsn, Gst, Price],
                    &[Code, Price],
                ),
                ColumnPattern::new(
                    "code_name_cas_pack_price",
                    &[Code, Name, Cas, Pack, Price],
                    &[Code, Price],
                ),
                ColumnPattern::new("code_name_pack_price", &[Code, Name, Pack, Price], &[Code, Price]),
                ColumnPattern::new("code_name_price", &[Code, Name, Price], &[Code, Price]),
                ColumnPattern::new("name_size_price", &[Name, Size, Price], &[Name, Price]),
                ColumnPattern::new("name_price", &[Name, Price], &[Name, Price]),
            ],
        }
    }

    pub fn from_patterns(patterns: Vec<ColumnPattern>) -> Self {
        Self { patterns }
    }

    /// Built-ins plus every `*.json` file in `dir`, in file-name order.
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self, ExtractError> {
        let dir = dir.as_ref();
        let mut registry = Self::builtin();
        let entries = std::fs::read_dir(dir).map_err(|e| ExtractError::InvalidPattern {
            path: dir.to_path_buf(),
            detail: e.to_string(),
        })?;
        let mut files: Vec<_> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        files.sort();
        for path in files {
            registry.merge_file(&path)?;
        }
        Ok(registry)
    }

    /// Add the patterns of one JSON file; same-named patterns are replaced.
    pub fn merge_file(&mut self, path: &Path) -> Result<(), ExtractError> {
        let invalid = |detail: String| ExtractError::InvalidPattern {
            path: path.to_path_buf(),
            detail,
        };
        let raw = std::fs::read_to_string(path).map_err(|e| invalid(e.to_string()))?;
        let parsed: PatternFile = serde_json::from_str(&raw).map_err(|e| invalid(e.to_string()))?;
        let patterns = match parsed {
            PatternFile::Many(p) => p,
            PatternFile::One(p) => vec![p],
        };
        for pattern in patterns {
            pattern.validate().map_err(invalid)?;
            debug!("Patterns: loaded '{}' from {}", pattern.name, path.display());
            self.insert(pattern);
        }
        Ok(())
    }

    pub fn insert(&mut self, pattern: ColumnPattern) {
        match self.patterns.iter_mut().find(|p| p.name == pattern.name) {
            Some(slot) => *slot = pattern,
            None => self.patterns.push(pattern),
        }
    }

    pub fn patterns(&self) -> &[ColumnPattern] {
        &self.patterns
    }

    pub fn names(&self) -> Vec<&str> {
        self.patterns.iter().map(|p| p.name.as_str()).collect()
    }

    /// Registry order with preferred names moved to the front, in preference order.
    pub fn ordered(&self, preferences: &[String]) -> Vec<&ColumnPattern> {
        let mut out: Vec<&ColumnPattern> = preferences
            .iter()
            .filter_map(|name| self.patterns.iter().find(|p| &p.name == name))
            .collect();
        for p in &self.patterns {
            if !out.iter().any(|o| o.name == p.name) {
                out.push(p);
            }
        }
        out
    }

    /// Try patterns in order; the first that yields rows wins.
    ///
    /// Column hints, when present, form a synthetic headerless pattern tried
    /// before everything else.
    pub fn match_lines(
        &self,
        lines: &[Line],
        preferences: &[String],
        hints: &[ColumnHint],
    ) -> MatchOutcome {
        let synthetic = ColumnPattern::from_hints(hints);
        let candidates = synthetic.iter().chain(self.ordered(preferences));

        let mut outcome = MatchOutcome::default();
        for pattern in candidates {
            match pattern.apply(lines) {
                Ok((groups, leftovers)) => {
                    debug!(
                        "Patterns: '{}' matched {} groups",
                        pattern.name,
                        groups.len()
                    );
                    outcome.pattern = Some(pattern.name.clone());
                    outcome.groups = groups;
                    outcome.leftovers = leftovers;
                    return outcome;
                }
                Err(reason) => outcome.failed_attempts.push(PatternAttempt {
                    pattern: pattern.name.clone(),
                    reason,
                }),
            }
        }
        outcome
    }
}

/// Whether a line reads like a table header under any known role labels.
pub fn looks_like_header(cells: &[String]) -> bool {
    let known = cells.iter().filter(|c| Role::from_label(c).is_some()).count();
    known >= 2 && known * 2 >= cells.len()
}
