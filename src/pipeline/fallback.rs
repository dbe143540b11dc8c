//! Deterministic extractor and the per-chunk fallback decision.
//!
//! [`DeterministicExtractor`] is the fixed contract the orchestrator uses for
//! rule-based extraction; [`RuleBasedExtractor`] implements it with the
//! pattern registry first and price-anchored recovery second.
//!
//! [`select_result`] turns an LLM invocation outcome into the chunk's final
//! [`ChunkResult`]. It substitutes deterministic output when the call failed,
//! returned no groups, or flagged itself as low confidence. The recorded
//! `source` is final: a failing fallback yields `error`, never another try.

use crate::config::ExtractionConfig;
use crate::error::{ChunkError, ExtractError};
use crate::model::Page;
use crate::output::{ChunkResult, ChunkSource, ExtractionReport, Group, Provenance};
use crate::pipeline::chunk::Chunk;
use crate::pipeline::llm::Invocation;
use crate::pipeline::lines::page_lines;
use crate::pipeline::patterns::{ColumnHint, PatternRegistry};
use crate::pipeline::postprocess::normalize_groups;
use crate::pipeline::recovery;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Knobs for one deterministic extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractorOptions {
    /// Pattern names tried before the rest of the registry.
    #[serde(default)]
    pub preferred_patterns: Vec<String>,
    #[serde(default)]
    pub column_hints: Vec<ColumnHint>,
    /// Skip the pattern matcher (and the LLM) and go straight to recovery.
    #[serde(default)]
    pub force_recovery: bool,
    pub min_recovery_confidence: f64,
}

impl Default for ExtractorOptions {
    fn default() -> Self {
        Self {
            preferred_patterns: Vec::new(),
            column_hints: Vec::new(),
            force_recovery: false,
            min_recovery_confidence: 0.35,
        }
    }
}

impl ExtractorOptions {
    pub fn from_config(config: &ExtractionConfig) -> Self {
        Self {
            preferred_patterns: config.pattern_preferences.clone(),
            min_recovery_confidence: config.min_recovery_confidence,
            ..Self::default()
        }
    }
}

/// Output of a deterministic extraction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    pub groups: Vec<Group>,
    pub warnings: Vec<String>,
    pub report: ExtractionReport,
}

/// Rule-based extraction over a page range.
pub trait DeterministicExtractor: Send + Sync {
    fn extract(&self, pages: &[Page], options: &ExtractorOptions) -> Result<Extraction, ChunkError>;
}

/// Pattern matcher, then price-anchored recovery.
#[derive(Debug, Clone, Default)]
pub struct RuleBasedExtractor {
    registry: PatternRegistry,
}

impl RuleBasedExtractor {
    pub fn new(registry: PatternRegistry) -> Self {
        Self { registry }
    }

    /// Built-in patterns plus `config.patterns_dir`, if set.
    pub fn from_config(config: &ExtractionConfig) -> Result<Self, ExtractError> {
        let registry = match config.patterns_dir {
            Some(ref dir) => PatternRegistry::load_dir(dir)?,
            None => PatternRegistry::builtin(),
        };
        Ok(Self::new(registry))
    }

    pub fn registry(&self) -> &PatternRegistry {
        &self.registry
    }
}

impl DeterministicExtractor for RuleBasedExtractor {
    fn extract(&self, pages: &[Page], options: &ExtractorOptions) -> Result<Extraction, ChunkError> {
        let lines = page_lines(pages);
        let mut out = Extraction::default();

        if !options.force_recovery {
            let matched = self.registry.match_lines(
                &lines,
                &options.preferred_patterns,
                &options.column_hints,
            );
            out.report.failed_attempts = matched.failed_attempts;
            out.report.leftovers = matched.leftovers;
            if let Some(name) = matched.pattern {
                out.report.matched_pattern = Some(name);
                out.groups = normalize_groups(matched.groups);
                return Ok(out);
            }
        }

        let (groups, report) = recovery::recover(&lines, options.min_recovery_confidence);
        if !options.force_recovery {
            out.warnings
                .push("no column pattern matched; used price-anchored recovery".to_string());
        }
        if !report.rejected.is_empty() {
            out.warnings.push(format!(
                "{} low-confidence rows dropped by price-anchored recovery",
                report.rejected.len()
            ));
        }
        if groups.is_empty() && !lines.is_empty() {
            out.warnings
                .push("deterministic extraction found no product rows".to_string());
        }
        out.report.recovery = Some(report);
        out.groups = normalize_groups(groups);
        Ok(out)
    }
}

// ── Fallback selection ───────────────────────────────────────────────────

/// Why an LLM outcome cannot be kept, or `None` if it can.
pub fn fallback_reason(outcome: &Result<Invocation, ChunkError>) -> Option<String> {
    match outcome {
        Err(e) => Some(format!("LLM call failed ({}): {}", e.code(), e)),
        Ok(inv) if inv.payload.groups.is_empty() => Some("LLM returned no groups".to_string()),
        Ok(inv) if inv.payload.has_low_confidence_marker() => {
            Some("LLM output flagged low confidence".to_string())
        }
        Ok(_) => None,
    }
}

fn stamp(groups: &mut [Group], chunk: &Chunk, source: ChunkSource) {
    for v in groups.iter_mut().flat_map(|g| g.variants.iter_mut()) {
        v.provenance = Some(Provenance {
            chunk_id: chunk.id.clone(),
            source,
            page_start: chunk.page_start,
            page_end: chunk.page_end,
            window_index: None,
        });
    }
}

fn empty_result(chunk: &Chunk, source: ChunkSource) -> ChunkResult {
    ChunkResult {
        chunk_id: chunk.id.clone(),
        page_start: chunk.page_start,
        page_end: chunk.page_end,
        content_hash: chunk.content_hash.clone(),
        source,
        groups: Vec::new(),
        notes: Vec::new(),
        warnings: Vec::new(),
        error: None,
        retries: 0,
        from_cache: false,
        cost_usd: 0.0,
        prompt_tokens: 0,
        completion_tokens: 0,
        duration_ms: 0,
        report: None,
    }
}

/// Decide the chunk's final result.
///
/// `llm` is `None` when the LLM path was not taken at all (disabled, no
/// client, or recovery forced); the deterministic extractor then runs
/// directly without a fallback warning.
pub fn select_result(
    chunk: &Chunk,
    pages: &[Page],
    llm: Option<Result<Invocation, ChunkError>>,
    extractor: &dyn DeterministicExtractor,
    options: &ExtractorOptions,
) -> ChunkResult {
    let mut result = empty_result(chunk, ChunkSource::Fallback);

    let reason = match llm {
        None => None,
        Some(outcome) => {
            let reason = fallback_reason(&outcome);
            match outcome {
                Ok(inv) => {
                    result.retries = inv.retries;
                    result.from_cache = inv.from_cache;
                    result.cost_usd = inv.cost_usd;
                    result.prompt_tokens = inv.usage.prompt_tokens;
                    result.completion_tokens = inv.usage.completion_tokens;
                    result.duration_ms = inv.duration_ms;
                    if reason.is_none() {
                        let mut groups = inv.payload.groups;
                        stamp(&mut groups, chunk, ChunkSource::Llm);
                        result.source = ChunkSource::Llm;
                        result.groups = groups;
                        result.notes = inv.payload.notes;
                        result.warnings = inv.payload.warnings;
                        return result;
                    }
                    result.warnings.extend(inv.payload.warnings);
                }
                Err(e) => {
                    if let ChunkError::TransientService { attempts, .. } = &e {
                        result.retries = attempts.saturating_sub(1);
                    }
                    result.error = Some(e);
                }
            }
            reason
        }
    };

    if let Some(ref why) = reason {
        warn!("Chunk {}: falling back to deterministic extraction: {}", chunk.id, why);
        result.warnings.push(format!("fallback: {why}"));
    }

    match extractor.extract(pages, options) {
        Ok(extraction) => {
            let mut groups = extraction.groups;
            stamp(&mut groups, chunk, ChunkSource::Fallback);
            debug!(
                "Chunk {}: deterministic extraction produced {} groups",
                chunk.id,
                groups.len()
            );
            result.source = ChunkSource::Fallback;
            result.groups = groups;
            result.warnings.extend(extraction.warnings);
            result.report = Some(extraction.report);
        }
        Err(e) => {
            warn!("Chunk {}: deterministic extractor failed: {}", chunk.id, e);
            result.source = ChunkSource::Error;
            result.warnings.push(format!("{e}"));
            result.error = Some(e);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::Variant;
    use crate::pipeline::chunk::chunk_pages;
    use crate::pipeline::llm::{LlmPayload, Usage, LOW_CONFIDENCE_MARKER};

    struct FailingExtractor;

    impl DeterministicExtractor for FailingExtractor {
        fn extract(&self, _: &[Page], _: &ExtractorOptions) -> Result<Extraction, ChunkError> {
            Err(ChunkError::ExtractorFailure {
                detail: "boom".into(),
            })
        }
    }

    fn pages() -> Vec<Page> {
        vec![Page::from_text(
            1,
            "Code    Description    Pack    Price\nA-1    Widget    1/PK    100",
        )]
    }

    fn invocation(groups: Vec<Group>, warnings: Vec<String>) -> Invocation {
        Invocation {
            payload: LlmPayload {
                groups,
                notes: vec![],
                warnings,
            },
            usage: Usage {
                prompt_tokens: 10,
                completion_tokens: 5,
            },
            cost_usd: 0.002,
            retries: 1,
            from_cache: false,
            duration_ms: 3,
        }
    }

    fn llm_group() -> Group {
        Group {
            title: "From LLM".into(),
            variants: vec![Variant {
                code: Some("A-1".into()),
                price_value: Some(100.0),
                confidence: 0.9,
                ..Variant::default()
            }
            .refreshed()],
            ..Group::default()
        }
    }

    #[test]
    fn good_llm_result_is_kept() {
        let p = pages();
        let chunk = &chunk_pages("doc", &p, 10)[0];
        let r = select_result(
            chunk,
            &p,
            Some(Ok(invocation(vec![llm_group()], vec![]))),
            &RuleBasedExtractor::default(),
            &ExtractorOptions::default(),
        );
        assert_eq!(r.source, ChunkSource::Llm);
        assert_eq!(r.groups[0].title, "From LLM");
        assert_eq!(r.retries, 1);
        let prov = r.groups[0].variants[0].provenance.as_ref().unwrap();
        assert_eq!(prov.chunk_id, chunk.id);
        assert_eq!(prov.source, ChunkSource::Llm);
    }

    #[test]
    fn error_zero_groups_and_low_confidence_trigger_fallback() {
        let p = pages();
        let chunk = &chunk_pages("doc", &p, 10)[0];
        let outcomes = vec![
            Err(ChunkError::BudgetExceeded {
                needed: 1.0,
                available: 0.0,
            }),
            Ok(invocation(vec![], vec![])),
            Ok(invocation(vec![llm_group()], vec![LOW_CONFIDENCE_MARKER.to_string()])),
        ];
        for outcome in outcomes {
            let r = select_result(
                chunk,
                &p,
                Some(outcome),
                &RuleBasedExtractor::default(),
                &ExtractorOptions::default(),
            );
            assert_eq!(r.source, ChunkSource::Fallback);
            assert_eq!(r.groups[0].variants[0].code.as_deref(), Some("A-1"));
            assert!(r.warnings.iter().any(|w| w.starts_with("fallback:")));
            assert_eq!(
                r.report.as_ref().unwrap().matched_pattern.as_deref(),
                Some("code_name_pack_price")
            );
        }
    }

    #[test]
    fn failing_extractor_marks_chunk_as_error() {
        let p = pages();
        let chunk = &chunk_pages("doc", &p, 10)[0];
        let r = select_result(chunk, &p, None, &FailingExtractor, &ExtractorOptions::default());
        assert_eq!(r.source, ChunkSource::Error);
        assert!(r.groups.is_empty());
        assert!(matches!(r.error, Some(ChunkError::ExtractorFailure { .. })));
    }

    #[test]
    fn forced_recovery_skips_the_pattern_matcher() {
        let p = vec![Page::from_text(
            1,
            "3031-915    Calibration Buffer Solution    2/PK    12345678    18%    250",
        )];
        let options = ExtractorOptions {
            force_recovery: true,
            ..ExtractorOptions::default()
        };
        let out = RuleBasedExtractor::default().extract(&p, &options).unwrap();
        assert!(out.report.failed_attempts.is_empty());
        assert_eq!(out.report.recovery.as_ref().unwrap().accepted, 1);
        assert_eq!(out.groups[0].variants[0].hsn.as_deref(), Some("12345678"));
    }
}
