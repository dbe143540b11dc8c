//! Top-level extraction entry points and the windowed orchestrator.
//!
//! ## Window state machine
//!
//! ```text
//! baseline ──▶ critique ──pass──────────────────────────▶ final
//!                 │  ▲
//!            fail │  │ re-run chunks over adjusted pages
//!                 ▼  │
//!               repair  (at most `max_repair_iterations` times)
//! ```
//!
//! The baseline of a window is the full chunk pipeline: every chunk goes to
//! the LLM and falls back to the deterministic extractor on failure. Windows
//! run one after another; chunks inside a window run on a bounded pool.
//!
//! Use [`crate::stream::extract_stream`] to receive window results as they
//! settle instead of waiting for the whole document.

use crate::config::ExtractionConfig;
use crate::error::{ChunkError, ExtractError};
use crate::model::{load_pages, Page};
use crate::output::{
    AuditEntry, AuditRecord, ChunkResult, ChunkSource, Diagnostics, DocumentResult, Group,
    SpendSummary, Status, WindowDiagnostic, WindowResult,
};
use crate::pipeline::budget::BudgetTracker;
use crate::pipeline::cache::ResponseCache;
use crate::pipeline::chunk::{self, Chunk, Window};
use crate::pipeline::context::DocumentContext;
use crate::pipeline::critique::{Critic, CritiqueRequest, CritiqueResponse, LlmCritic};
use crate::pipeline::fallback::{
    select_result, DeterministicExtractor, ExtractorOptions, RuleBasedExtractor,
};
use crate::pipeline::llm::{resolve_client, ChunkRequest, CompletionClient, InvokerSettings, LlmInvoker};
use crate::pipeline::merge::{merge_group_sets, MergeOutcome};
use crate::pipeline::patterns::PatternRegistry;
use crate::pipeline::postprocess::validate_groups;
use crate::pipeline::repair::{self, Adjustment};
use crate::prompts;
use futures::stream::{self, StreamExt};
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Warning attached to a run over an empty page list.
pub const NO_PAGES_WARNING: &str = "document has no pages; nothing was extracted";

// ── Entry points ─────────────────────────────────────────────────────────

/// Extract price-list groups from an in-memory page model.
///
/// Never fails: provider, cache or pattern-directory problems degrade to the
/// deterministic path and show up in `warnings`; chunk and window failures
/// show up in the diagnostics.
pub async fn extract(pages: &[Page], config: &ExtractionConfig) -> DocumentResult {
    Orchestrator::lenient(config.clone()).run(pages).await
}

/// Load a page-model JSON file and extract from it.
///
/// # Errors
/// Only for an unreadable or invalid page-model file.
pub async fn extract_file(
    path: impl AsRef<Path>,
    config: &ExtractionConfig,
) -> Result<DocumentResult, ExtractError> {
    let pages = load_pages(path).await?;
    Ok(extract(&pages, config).await)
}

/// Extract and write the [`DocumentResult`] as pretty JSON.
///
/// Uses atomic write (temp file + rename) to prevent partial files.
pub async fn extract_to_file(
    input: impl AsRef<Path>,
    output_path: impl AsRef<Path>,
    config: &ExtractionConfig,
) -> Result<DocumentResult, ExtractError> {
    let result = extract_file(input, config).await?;
    write_result(&result, output_path.as_ref()).await?;
    Ok(result)
}

/// Atomically write `result` as pretty JSON to `path`.
pub async fn write_result(result: &DocumentResult, path: &Path) -> Result<(), ExtractError> {
    let write_err = |source: std::io::Error| ExtractError::OutputWriteFailed {
        path: path.to_path_buf(),
        source,
    };
    let json = serde_json::to_string_pretty(result)
        .map_err(|e| ExtractError::Internal(format!("serialise result: {e}")))?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
    }
    let tmp_path = path.with_extension("json.tmp");
    tokio::fs::write(&tmp_path, json).await.map_err(write_err)?;
    tokio::fs::rename(&tmp_path, path).await.map_err(write_err)?;
    Ok(())
}

/// Synchronous wrapper around [`extract`].
///
/// Creates a temporary tokio runtime internally.
pub fn extract_sync(pages: &[Page], config: &ExtractionConfig) -> Result<DocumentResult, ExtractError> {
    Ok(tokio::runtime::Runtime::new()
        .map_err(|e| ExtractError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(extract(pages, config)))
}

// ── Orchestrator ─────────────────────────────────────────────────────────

/// Collaborators of a run, resolved once from an [`ExtractionConfig`].
///
/// Every external dependency (completion client, critic, deterministic
/// extractor, response cache) is held explicitly, so tests can swap any of
/// them and parallel runs share nothing they did not opt into.
pub struct Orchestrator {
    config: ExtractionConfig,
    invoker: Option<Arc<LlmInvoker>>,
    critic: Option<Arc<dyn Critic>>,
    extractor: Arc<dyn DeterministicExtractor>,
    cache: Arc<ResponseCache>,
    setup_warnings: Vec<String>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("model", &self.invoker.as_ref().map(|i| i.model().to_string()))
            .field("critic", &self.critic.is_some())
            .field("cache", &self.cache)
            .finish()
    }
}

/// Shared state of one document run.
pub(crate) struct RunState {
    pub(crate) document_id: String,
    budget: BudgetTracker,
    context: DocumentContext,
    llm_calls: AtomicUsize,
    prompt_tokens: AtomicU64,
    completion_tokens: AtomicU64,
    cache_hits_at_start: u64,
    cache_misses_at_start: u64,
    started: Instant,
}

impl Orchestrator {
    /// Resolve every collaborator, failing on the first problem.
    ///
    /// # Errors
    /// [`ExtractError::ProviderNotConfigured`] when the LLM path is enabled
    /// but no provider can be resolved; cache directory or pattern directory
    /// errors otherwise.
    pub fn new(config: ExtractionConfig) -> Result<Self, ExtractError> {
        Self::assemble(config, true)
    }

    /// Like [`Orchestrator::new`], but problems become warnings on the
    /// result and the run continues with what could be resolved.
    pub fn lenient(config: ExtractionConfig) -> Self {
        match Self::assemble(config.clone(), false) {
            Ok(o) => o,
            Err(e) => {
                let mut o = Self::deterministic(config);
                o.setup_warnings.push(e.to_string());
                o
            }
        }
    }

    fn deterministic(config: ExtractionConfig) -> Self {
        Self {
            invoker: None,
            critic: config.critic.clone(),
            extractor: Arc::new(RuleBasedExtractor::default()),
            cache: Arc::new(ResponseCache::in_memory()),
            setup_warnings: Vec::new(),
            config,
        }
    }

    fn assemble(config: ExtractionConfig, strict: bool) -> Result<Self, ExtractError> {
        let mut setup_warnings = Vec::new();
        let mut degrade = |e: ExtractError| -> Result<(), ExtractError> {
            if strict {
                return Err(e);
            }
            warn!("{}", e);
            setup_warnings.push(e.to_string());
            Ok(())
        };

        let cache = match config.cache_dir {
            Some(ref dir) => match ResponseCache::persistent(dir) {
                Ok(c) => c,
                Err(e) => {
                    degrade(e)?;
                    ResponseCache::in_memory()
                }
            },
            None => ResponseCache::in_memory(),
        };

        let extractor = match RuleBasedExtractor::from_config(&config) {
            Ok(x) => x,
            Err(e) => {
                degrade(e)?;
                RuleBasedExtractor::new(PatternRegistry::builtin())
            }
        };

        let client = match resolve_client(&config) {
            Ok(c) => c,
            Err(e) => {
                degrade(e)?;
                None
            }
        };

        let mut orchestrator = Self {
            invoker: None,
            critic: config.critic.clone(),
            extractor: Arc::new(extractor),
            cache: Arc::new(cache),
            setup_warnings,
            config,
        };
        if let Some(client) = client {
            orchestrator = orchestrator.with_client(client);
        }
        Ok(orchestrator)
    }

    /// Use `client` for extraction (and critique, unless a critic was set).
    pub fn with_client(mut self, client: Arc<dyn CompletionClient>) -> Self {
        let settings = InvokerSettings::from_config(&self.config);
        if self.config.critic.is_none() && self.config.critique_enabled {
            self.critic = Some(Arc::new(
                LlmCritic::new(Arc::clone(&client), settings.clone())
                    .with_cancel(self.config.cancel.clone()),
            ));
        }
        self.invoker = Some(Arc::new(LlmInvoker::new(
            client,
            Arc::clone(&self.cache),
            settings,
        )));
        self
    }

    pub fn with_critic(mut self, critic: Arc<dyn Critic>) -> Self {
        self.critic = Some(critic);
        self
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn DeterministicExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    /// Share a response cache across runs. Rebinds the invoker to it.
    pub fn with_cache(mut self, cache: Arc<ResponseCache>) -> Self {
        self.cache = cache;
        if let Some(invoker) = self.invoker.take() {
            let client = Arc::clone(invoker.client());
            self.invoker = Some(Arc::new(LlmInvoker::new(
                client,
                Arc::clone(&self.cache),
                InvokerSettings::from_config(&self.config),
            )));
        }
        self
    }

    pub fn config(&self) -> &ExtractionConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    /// Run the whole document.
    pub async fn run(&self, pages: &[Page]) -> DocumentResult {
        if pages.is_empty() {
            return self.empty_result();
        }
        let state = self.start(pages);
        let windows = self.plan(pages, &state);

        let mut results = Vec::with_capacity(windows.len());
        for window in &windows {
            results.push(self.run_window(window, pages, &state).await);
        }
        self.finish(results, &state)
    }

    pub(crate) fn empty_result(&self) -> DocumentResult {
        warn!("{}", NO_PAGES_WARNING);
        let mut warnings = self.setup_warnings.clone();
        warnings.push(NO_PAGES_WARNING.to_string());
        if let Some(ref cb) = self.config.progress_callback {
            cb.on_extraction_start(0, 0);
            cb.on_extraction_complete(Status::Partial, 0);
        }
        DocumentResult {
            document_id: self
                .config
                .document_id
                .clone()
                .unwrap_or_else(|| chunk::document_id(&[])),
            status: Status::Partial,
            warnings,
            ..DocumentResult::default()
        }
    }

    pub(crate) fn start(&self, pages: &[Page]) -> RunState {
        let document_id = self
            .config
            .document_id
            .clone()
            .unwrap_or_else(|| chunk::document_id(pages));
        info!(
            "Starting extraction of {} ({} pages, model {})",
            document_id,
            pages.len(),
            self.invoker
                .as_ref()
                .map(|i| i.model().to_string())
                .unwrap_or_else(|| "none".to_string())
        );
        RunState {
            document_id,
            budget: BudgetTracker::new(self.config.budget_usd),
            context: DocumentContext::new(),
            llm_calls: AtomicUsize::new(0),
            prompt_tokens: AtomicU64::new(0),
            completion_tokens: AtomicU64::new(0),
            cache_hits_at_start: self.cache.hits(),
            cache_misses_at_start: self.cache.misses(),
            started: Instant::now(),
        }
    }

    /// Windows of the document; fires `on_extraction_start`.
    pub(crate) fn plan(&self, pages: &[Page], state: &RunState) -> Vec<Window> {
        let windows = chunk::windows(&state.document_id, pages, self.config.effective_window_pages());
        if let Some(ref cb) = self.config.progress_callback {
            let total_chunks = windows
                .iter()
                .map(|w| w.pages(pages).len().div_ceil(self.config.chunk_pages.max(1)))
                .sum();
            cb.on_extraction_start(windows.len(), total_chunks);
        }
        windows
    }

    // ── Window loop ──────────────────────────────────────────────────────

    /// Run one window through baseline, critique and bounded repair.
    pub(crate) async fn run_window(&self, window: &Window, pages: &[Page], state: &RunState) -> WindowResult {
        let window_pages = window.pages(pages);
        let chunk_size = self.config.chunk_pages.max(1);
        debug!(
            "Window {} (pages {}-{}): baseline",
            window.index, window.page_start, window.page_end
        );

        let mut options = ExtractorOptions::from_config(&self.config);
        let mut adjustments: Vec<Adjustment> = Vec::new();
        let mut current: Vec<Page> = window_pages.to_vec();
        let mut chunks = chunk::chunk_pages(&window.id, &current, chunk_size);
        let mut attempt = self
            .run_chunks(&chunks, &current, &options, true, window.index, state)
            .await;

        let mut audit = AuditRecord::new(window.index, window.page_start, window.page_end);
        let mut warnings = Vec::new();
        let mut passed = true;
        let mut repairs = 0u32;

        if let Some(ref critic) = self.critic {
            let mut iteration = 0u32;
            loop {
                let request = CritiqueRequest::sample(
                    window.index,
                    &current,
                    &attempt.merged.groups,
                    attempt.results.iter().map(|r| r.diagnostic(Some(window.index))).collect(),
                );
                let (verdict, critique_error) = match critic.critique(&request, &state.budget).await {
                    Ok(v) => (v, None),
                    Err(e) => {
                        warn!("Window {}: critique unavailable, treating as pass: {}", window.index, e);
                        warnings.push(match e {
                            ChunkError::CritiqueUnavailable { .. } => e.to_string(),
                            _ => format!("critique unavailable: {e}"),
                        });
                        (CritiqueResponse::passed(), Some(e.to_string()))
                    }
                };
                passed = verdict.pass;

                let mut entry = AuditEntry {
                    iteration,
                    passed: verdict.pass,
                    repairs: verdict.repairs.clone(),
                    explanations: verdict.explanations,
                    critique_error,
                    applied: Vec::new(),
                    unrecognized: Vec::new(),
                    repaired: false,
                    groups: attempt.merged.groups.len(),
                    variants: attempt.merged.groups.iter().map(|g| g.variants.len()).sum(),
                };

                if verdict.pass || repairs >= self.config.max_repair_iterations {
                    audit.push(entry);
                    break;
                }

                let parsed = repair::parse_directives(&verdict.repairs);
                if !parsed.unrecognized.is_empty() {
                    debug!(
                        "Window {}: {} unrecognised repair directives",
                        window.index,
                        parsed.unrecognized.len()
                    );
                }
                repair::apply_to_options(&mut options, &parsed.adjustments);
                for adj in &parsed.adjustments {
                    if !adjustments.contains(adj) {
                        adjustments.push(adj.clone());
                    }
                }
                entry.applied = parsed.adjustments;
                entry.unrecognized = parsed.unrecognized;
                entry.repaired = true;
                audit.push(entry);

                repairs += 1;
                iteration += 1;
                info!(
                    "Window {}: repair {}/{} with {} adjustments",
                    window.index,
                    repairs,
                    self.config.max_repair_iterations,
                    adjustments.len()
                );

                current = repair::apply_to_pages(window_pages, &adjustments);
                chunks = chunk::rechunk_stable(&window.id, &current, chunk_size, &chunks);
                // Extractor options only steer the rule-based path, and unchanged
                // pages would only replay cached answers.
                let use_llm = !adjustments.iter().any(Adjustment::steers_extractor)
                    && current.as_slice() != window_pages;
                debug!(
                    "Window {}: repair pass via {}",
                    window.index,
                    if use_llm { "LLM" } else { "rule-based extractor" }
                );
                attempt = self
                    .run_chunks(&chunks, &current, &options, use_llm, window.index, state)
                    .await;
            }
        }

        let status = window_status(&attempt.results, passed);
        for r in &attempt.results {
            warnings.extend(r.warnings.iter().map(|w| format!("{}: {}", r.chunk_id, w)));
        }
        let mut notes: Vec<String> = Vec::new();
        for note in attempt.results.iter().flat_map(|r| r.notes.iter()) {
            if !notes.contains(note) {
                notes.push(note.clone());
            }
        }

        if let Some(ref cb) = self.config.progress_callback {
            cb.on_window_complete(window.index, status, repairs);
        }
        info!(
            "Window {} done: {:?}, {} groups, {} repairs",
            window.index,
            status,
            attempt.merged.groups.len(),
            repairs
        );

        WindowResult {
            index: window.index,
            page_start: window.page_start,
            page_end: window.page_end,
            status,
            groups: attempt.merged.groups,
            notes,
            warnings,
            critique_passed: passed,
            repair_attempts: repairs,
            chunks: attempt
                .results
                .iter()
                .map(|r| r.diagnostic(Some(window.index)))
                .collect(),
            price_conflicts: attempt.merged.price_conflicts,
            reports: attempt.results.iter().filter_map(|r| r.report.clone()).collect(),
            audit,
        }
    }

    // ── Chunk pool ───────────────────────────────────────────────────────

    async fn run_chunks(
        &self,
        chunks: &[Chunk],
        pages: &[Page],
        options: &ExtractorOptions,
        use_llm: bool,
        window_index: usize,
        state: &RunState,
    ) -> WindowAttempt {
        let concurrency = self.config.concurrency.clamp(1, chunks.len().max(1));
        // Index-driven so the pooled futures stay `Send` for spawned streams.
        let mut results: Vec<(usize, ChunkResult)> = stream::iter(0..chunks.len())
            .map(|i| {
                let chunk = &chunks[i];
                async move {
                    let result = self
                        .process_chunk(chunk, pages, options, use_llm, window_index, state)
                        .await;
                    (chunk.ordinal, result)
                }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;
        results.sort_by_key(|(ordinal, _)| *ordinal);
        let results: Vec<ChunkResult> = results.into_iter().map(|(_, r)| r).collect();

        let merged = merge_group_sets(results.iter().map(|r| r.groups.as_slice()));
        WindowAttempt { results, merged }
    }

    async fn process_chunk(
        &self,
        chunk: &Chunk,
        pages: &[Page],
        options: &ExtractorOptions,
        use_llm: bool,
        window_index: usize,
        state: &RunState,
    ) -> ChunkResult {
        let chunk_pages = chunk.pages(pages);
        if let Some(ref cb) = self.config.progress_callback {
            cb.on_chunk_start(&chunk.id, chunk.page_start, chunk.page_end);
        }

        let llm = match self.invoker {
            Some(ref invoker) if use_llm && !options.force_recovery => {
                let context = state.context.render();
                let request = ChunkRequest {
                    chunk_id: chunk.id.clone(),
                    content_hash: chunk.content_hash.clone(),
                    system: self
                        .config
                        .system_prompt
                        .clone()
                        .unwrap_or_else(|| prompts::EXTRACTION_PROMPT.to_string()),
                    user: prompts::render_chunk_prompt(chunk, chunk_pages, context.as_deref()),
                };
                let outcome = invoker
                    .invoke(&request, &state.budget, None, self.config.cancel.as_ref())
                    .await;
                let reached_service = match outcome {
                    Ok(ref inv) => !inv.from_cache,
                    Err(ChunkError::BudgetExceeded { .. }) => false,
                    Err(_) => true,
                };
                if reached_service {
                    state.llm_calls.fetch_add(1, Ordering::Relaxed);
                }
                Some(outcome)
            }
            _ => None,
        };

        let mut result = select_result(chunk, chunk_pages, llm, self.extractor.as_ref(), options);
        for p in result
            .groups
            .iter_mut()
            .flat_map(|g| g.variants.iter_mut())
            .filter_map(|v| v.provenance.as_mut())
        {
            p.window_index = Some(window_index);
        }
        state
            .prompt_tokens
            .fetch_add(result.prompt_tokens as u64, Ordering::Relaxed);
        state
            .completion_tokens
            .fetch_add(result.completion_tokens as u64, Ordering::Relaxed);
        if result.source != ChunkSource::Error {
            state.context.record(chunk, &result.groups);
        }

        if let Some(ref cb) = self.config.progress_callback {
            cb.on_chunk_complete(&chunk.id, result.source, result.groups.len());
        }
        result
    }

    // ── Document assembly ────────────────────────────────────────────────

    pub(crate) fn finish(&self, windows: Vec<WindowResult>, state: &RunState) -> DocumentResult {
        let merged: MergeOutcome = merge_group_sets(windows.iter().map(|w| w.groups.as_slice()));
        let status = windows
            .iter()
            .fold(Status::Ok, |acc, w| acc.worst(w.status));

        let mut notes: Vec<String> = Vec::new();
        for note in windows.iter().flat_map(|w| w.notes.iter()) {
            if !notes.contains(note) {
                notes.push(note.clone());
            }
        }
        let mut warnings = self.setup_warnings.clone();
        warnings.extend(windows.iter().flat_map(|w| w.warnings.iter().cloned()));

        let mut price_conflicts: Vec<_> = windows
            .iter()
            .flat_map(|w| w.price_conflicts.iter().cloned())
            .collect();
        price_conflicts.extend(merged.price_conflicts);

        let budget = state.budget.snapshot();
        let spend = SpendSummary {
            spent_usd: budget.spent,
            reserved_usd: budget.reserved,
            ceiling_usd: (!budget.is_unlimited()).then_some(budget.ceiling),
            llm_calls: state.llm_calls.load(Ordering::Relaxed),
            cache_hits: self.cache.hits().saturating_sub(state.cache_hits_at_start),
            cache_misses: self.cache.misses().saturating_sub(state.cache_misses_at_start),
            prompt_tokens: state.prompt_tokens.load(Ordering::Relaxed),
            completion_tokens: state.completion_tokens.load(Ordering::Relaxed),
        };

        let diagnostics = Diagnostics {
            chunks: windows.iter().flat_map(|w| w.chunks.iter().cloned()).collect(),
            windows: windows
                .iter()
                .map(|w| WindowDiagnostic {
                    index: w.index,
                    page_start: w.page_start,
                    page_end: w.page_end,
                    status: w.status,
                    critique_passed: w.critique_passed,
                    repair_attempts: w.repair_attempts,
                    chunk_count: w.chunks.len(),
                })
                .collect(),
            spend,
            price_conflicts,
            duration_ms: state.started.elapsed().as_millis() as u64,
        };

        let groups: Vec<Group> = merged.groups;
        let validation_errors = validate_groups(&groups);
        let audit = windows.into_iter().map(|w| w.audit).collect();

        info!(
            "Extraction of {} complete: {:?}, {} groups, ${:.6} spent, {}ms",
            state.document_id,
            status,
            groups.len(),
            diagnostics.spend.spent_usd,
            diagnostics.duration_ms
        );
        if let Some(ref cb) = self.config.progress_callback {
            cb.on_extraction_complete(status, groups.len());
        }

        DocumentResult {
            document_id: state.document_id.clone(),
            status,
            groups,
            notes,
            warnings,
            validation_errors,
            diagnostics,
            audit,
        }
    }
}

struct WindowAttempt {
    results: Vec<ChunkResult>,
    merged: MergeOutcome,
}

/// `error` when every chunk failed, `partial` when any did or the critique
/// never passed, `ok` otherwise.
fn window_status(results: &[ChunkResult], critique_passed: bool) -> Status {
    let failed = results.iter().filter(|r| r.source == ChunkSource::Error).count();
    if !results.is_empty() && failed == results.len() {
        Status::Error
    } else if failed > 0 || !critique_passed {
        Status::Partial
    } else {
        Status::Ok
    }
}
