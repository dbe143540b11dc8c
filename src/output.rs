//! Output types: product groups, variants, and per-chunk / per-window /
//! per-document results.
//!
//! Everything here is `Serialize + Deserialize` so a [`DocumentResult`] can be
//! written straight to JSON by the CLI and so whole chunk results can be
//! persisted in the response cache.

use crate::error::ChunkError;
use crate::pipeline::repair::Adjustment;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Recognised variant fields, in canonical order.
pub const RECOGNIZED_FIELDS: &[&str] = &[
    "code",
    "name",
    "cas",
    "pack",
    "size",
    "hsn",
    "gst_percent",
    "price_value",
    "currency",
    "notes",
];

// ── Variants ─────────────────────────────────────────────────────────────

/// A scalar value for extension fields the pipeline does not model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Number(f64),
    Text(String),
}

/// Where a variant came from. Never part of its identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub chunk_id: String,
    pub source: ChunkSource,
    pub page_start: usize,
    pub page_end: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_index: Option<usize>,
}

/// One priced product row within a [`Group`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cas: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hsn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gst_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    /// Extraction confidence in `[0, 1]`.
    #[serde(default)]
    pub confidence: f64,
    /// Recognised fields that carry a value. Kept in sync by [`Variant::refresh`].
    #[serde(default)]
    pub fields_present: Vec<String>,
    /// Extension fields (brand, grade, …) the merger carries along untouched.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Scalar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<Provenance>,
}

impl Variant {
    /// Recompute `fields_present` and clamp `confidence`.
    pub fn refresh(&mut self) {
        self.confidence = if self.confidence.is_finite() {
            self.confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self.fields_present = RECOGNIZED_FIELDS
            .iter()
            .filter(|f| self.has_field(f))
            .map(|f| f.to_string())
            .collect();
    }

    /// Builder-style variant of [`Variant::refresh`].
    pub fn refreshed(mut self) -> Self {
        self.refresh();
        self
    }

    pub fn has_field(&self, field: &str) -> bool {
        fn some_text(v: &Option<String>) -> bool {
            v.as_deref().is_some_and(|s| !s.trim().is_empty())
        }
        match field {
            "code" => some_text(&self.code),
            "name" => some_text(&self.name),
            "cas" => some_text(&self.cas),
            "pack" => some_text(&self.pack),
            "size" => some_text(&self.size),
            "hsn" => some_text(&self.hsn),
            "gst_percent" => self.gst_percent.is_some(),
            "price_value" => self.price_value.is_some(),
            "currency" => some_text(&self.currency),
            "notes" => some_text(&self.notes),
            _ => false,
        }
    }

    /// Number of recognised fields that carry a value.
    pub fn populated_count(&self) -> usize {
        RECOGNIZED_FIELDS.iter().filter(|f| self.has_field(f)).count()
    }

    /// Length of the name in characters, 0 when absent.
    pub fn name_len(&self) -> usize {
        self.name.as_deref().map_or(0, |n| n.trim().chars().count())
    }

    /// Human label for diagnostics: code if present, else name.
    pub fn label(&self) -> String {
        self.code
            .clone()
            .or_else(|| self.name.clone())
            .unwrap_or_else(|| "<unnamed>".to_string())
    }
}

// ── Groups ───────────────────────────────────────────────────────────────

/// A named product family.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Canonical column headers, de-duplicated, first-seen order.
    #[serde(default)]
    pub specs_headers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub variants: Vec<Variant>,
}

impl Group {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }
}

// ── Chunk results ────────────────────────────────────────────────────────

/// Which path produced a chunk's groups. Final once recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkSource {
    Llm,
    Fallback,
    Error,
}

/// Overall status of a window or document. Ordered best → worst.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Ok,
    Partial,
    Error,
}

impl Status {
    /// The worse of two statuses (`error` > `partial` > `ok`).
    pub fn worst(self, other: Status) -> Status {
        self.max(other)
    }
}

/// One failed pattern attempt, kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternAttempt {
    pub pattern: String,
    pub reason: String,
}

/// A price-anchored row that fell below the confidence cutoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedRow {
    pub page: usize,
    pub line: String,
    pub confidence: f64,
}

/// What price-anchored recovery saw.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub lines_scanned: usize,
    pub accepted: usize,
    pub rejected: Vec<RejectedRow>,
    pub header_seen: bool,
}

/// Diagnostics from one deterministic extraction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_pattern: Option<String>,
    #[serde(default)]
    pub failed_attempts: Vec<PatternAttempt>,
    /// Lines that could not be attached to any row.
    #[serde(default)]
    pub leftovers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery: Option<RecoveryReport>,
}

/// Result of processing one chunk through the LLM or fallback path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkResult {
    pub chunk_id: String,
    pub page_start: usize,
    pub page_end: usize,
    pub content_hash: String,
    pub source: ChunkSource,
    pub groups: Vec<Group>,
    #[serde(default)]
    pub notes: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ChunkError>,
    pub retries: u32,
    pub from_cache: bool,
    pub cost_usd: f64,
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<ExtractionReport>,
}

impl ChunkResult {
    pub fn variant_count(&self) -> usize {
        self.groups.iter().map(|g| g.variants.len()).sum()
    }

    /// Group-free summary for diagnostics.
    pub fn diagnostic(&self, window_index: Option<usize>) -> ChunkDiagnostic {
        ChunkDiagnostic {
            chunk_id: self.chunk_id.clone(),
            window_index,
            page_start: self.page_start,
            page_end: self.page_end,
            source: self.source,
            error: self.error.as_ref().map(|e| e.to_string()),
            retries: self.retries,
            from_cache: self.from_cache,
            cost_usd: self.cost_usd,
            groups: self.groups.len(),
            variants: self.variant_count(),
            warnings: self.warnings.clone(),
        }
    }
}

/// Group-free view of a [`ChunkResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkDiagnostic {
    pub chunk_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_index: Option<usize>,
    pub page_start: usize,
    pub page_end: usize,
    pub source: ChunkSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub retries: u32,
    pub from_cache: bool,
    pub cost_usd: f64,
    pub groups: usize,
    pub variants: usize,
    #[serde(default)]
    pub warnings: Vec<String>,
}

// ── Merge results ────────────────────────────────────────────────────────

/// Two contributors under one merge key reported different prices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceConflict {
    pub merge_key: String,
    pub label: String,
    /// `[kept contributor, incoming contributor]`.
    pub chunk_ids: Vec<String>,
    /// Prices in the same order as `chunk_ids`.
    pub values: Vec<f64>,
    /// Price that survived the merge.
    pub resolved: f64,
}

// ── Audit ────────────────────────────────────────────────────────────────

/// One critique round and the adjustments it led to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub iteration: u32,
    pub passed: bool,
    #[serde(default)]
    pub repairs: Vec<String>,
    #[serde(default)]
    pub explanations: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub critique_error: Option<String>,
    /// Adjustments applied after this round (empty on the final round).
    #[serde(default)]
    pub applied: Vec<Adjustment>,
    /// Directives that matched no known adjustment.
    #[serde(default)]
    pub unrecognized: Vec<String>,
    /// Whether a repair pass ran after this round.
    pub repaired: bool,
    pub groups: usize,
    pub variants: usize,
}

/// Append-only critique/repair trail of one window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub window_index: usize,
    pub page_start: usize,
    pub page_end: usize,
    entries: Vec<AuditEntry>,
}

impl AuditRecord {
    pub fn new(window_index: usize, page_start: usize, page_end: usize) -> Self {
        Self {
            window_index,
            page_start,
            page_end,
            entries: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, entry: AuditEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[AuditEntry] {
        &self.entries
    }

    /// Rounds that were followed by a repair pass.
    pub fn repair_attempts(&self) -> u32 {
        self.entries.iter().filter(|e| e.repaired).count() as u32
    }
}

// ── Window & document results ────────────────────────────────────────────

/// Outcome of one page window after its critique/repair loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowResult {
    pub index: usize,
    pub page_start: usize,
    pub page_end: usize,
    pub status: Status,
    pub groups: Vec<Group>,
    #[serde(default)]
    pub notes: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub critique_passed: bool,
    pub repair_attempts: u32,
    pub chunks: Vec<ChunkDiagnostic>,
    #[serde(default)]
    pub price_conflicts: Vec<PriceConflict>,
    #[serde(default)]
    pub reports: Vec<ExtractionReport>,
    pub audit: AuditRecord,
}

/// Per-window line in the document diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowDiagnostic {
    pub index: usize,
    pub page_start: usize,
    pub page_end: usize,
    pub status: Status,
    pub critique_passed: bool,
    pub repair_attempts: u32,
    pub chunk_count: usize,
}

/// Spend and cache counters for the whole run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpendSummary {
    pub spent_usd: f64,
    pub reserved_usd: f64,
    /// `None` when the budget is unlimited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ceiling_usd: Option<f64>,
    pub llm_calls: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub chunks: Vec<ChunkDiagnostic>,
    pub windows: Vec<WindowDiagnostic>,
    pub spend: SpendSummary,
    pub price_conflicts: Vec<PriceConflict>,
    pub duration_ms: u64,
}

/// Final result of a document run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentResult {
    pub document_id: String,
    pub status: Status,
    pub groups: Vec<Group>,
    #[serde(default)]
    pub notes: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub validation_errors: Vec<String>,
    pub diagnostics: Diagnostics,
    #[serde(default)]
    pub audit: Vec<AuditRecord>,
}

impl DocumentResult {
    pub fn variant_count(&self) -> usize {
        self.groups.iter().map(|g| g.variants.len()).sum()
    }
}
