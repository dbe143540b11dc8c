//! CLI binary for edgequake-pricelist.
//!
//! A thin shim over the library crate that maps CLI flags
//! to `ExtractionConfig` and writes the document result as JSON.

use anyhow::{Context, Result};
use clap::Parser;
use edgequake_pricelist::{
    load_pages, write_result, ChunkSource, DocumentResult, ExtractionConfig,
    ExtractionProgressCallback, Orchestrator, ProgressCallback, Status,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

fn status_mark(status: Status) -> String {
    match status {
        Status::Ok => green("✓"),
        Status::Partial => yellow("⚠"),
        Status::Error => red("✗"),
    }
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Chunk progress bar plus one log line per window.
struct CliProgressCallback {
    bar: ProgressBar,
    fallbacks: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);
        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Loading pages…");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self {
            bar,
            fallbacks: AtomicUsize::new(0),
        })
    }
}

impl ExtractionProgressCallback for CliProgressCallback {
    fn on_extraction_start(&self, total_windows: usize, total_chunks: usize) {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} chunks  \
             ⏱ {elapsed_precise}  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);
        self.bar.set_length(total_chunks as u64);
        self.bar.set_style(style);
        self.bar.set_prefix("Extracting");
        self.bar.println(format!(
            "{} {}",
            bold("◆"),
            bold(&format!(
                "{total_chunks} chunks in {total_windows} windows"
            ))
        ));
    }

    fn on_chunk_start(&self, chunk_id: &str, page_start: usize, page_end: usize) {
        // Repair passes re-run chunks past the planned total.
        if self.bar.position() >= self.bar.length().unwrap_or(0) {
            self.bar.inc_length(1);
        }
        self.bar
            .set_message(format!("{chunk_id} (pages {page_start}-{page_end})"));
    }

    fn on_chunk_complete(&self, _chunk_id: &str, source: ChunkSource, _groups: usize) {
        if source != ChunkSource::Llm {
            self.fallbacks.fetch_add(1, Ordering::SeqCst);
        }
        self.bar.inc(1);
    }

    fn on_window_complete(&self, window_index: usize, status: Status, repair_attempts: u32) {
        let repairs = if repair_attempts > 0 {
            dim(&format!("  {repair_attempts} repairs"))
        } else {
            String::new()
        };
        self.bar.println(format!(
            "  {} Window {:>2}  {:?}{}",
            status_mark(status),
            window_index,
            status,
            repairs
        ));
    }

    fn on_extraction_complete(&self, status: Status, total_groups: usize) {
        self.bar.finish_and_clear();
        eprintln!(
            "{} {} groups  {}",
            status_mark(status),
            bold(&total_groups.to_string()),
            dim(&format!(
                "({} chunks used the deterministic path)",
                self.fallbacks.load(Ordering::SeqCst)
            ))
        );
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Extract to stdout
  pricelist catalog.pages.json

  # Extract to a file with a spend ceiling
  pricelist catalog.pages.json -o catalog.json --budget 0.25

  # Deterministic only (no API key needed)
  pricelist --no-llm catalog.pages.json

  # Persist LLM answers between runs
  pricelist --cache-dir .pricelist-cache catalog.pages.json -o catalog.json

  # Custom column patterns, tried first
  pricelist --patterns-dir patterns/ --prefer-pattern ref_rate catalog.pages.json

INPUT:
  A page-model JSON file: either an array of pages or {"pages": [...]}, each
  page {"number": N, "segments": [...]} with text, table and image segments.

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  GEMINI_API_KEY          Google Gemini API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
  RUST_LOG                Override the log filter
"#;

/// Extract structured price lists from catalog page models.
#[derive(Parser, Debug)]
#[command(
    name = "pricelist",
    version,
    about = "Extract structured price lists from catalog pages using LLMs with deterministic fallback",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Page-model JSON file.
    input: PathBuf,

    /// Write the result JSON to this file instead of stdout.
    #[arg(short, long, env = "PRICELIST_OUTPUT")]
    output: Option<PathBuf>,

    /// LLM model ID (e.g. gpt-4.1-nano, gpt-4.1-mini).
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Pages per chunk.
    #[arg(long, env = "PRICELIST_CHUNK_PAGES", default_value_t = 10,
          value_parser = clap::value_parser!(u32).range(1..))]
    chunk_pages: u32,

    /// Pages per critique/repair window.
    #[arg(long, env = "PRICELIST_WINDOW_PAGES", default_value_t = 30)]
    window_pages: usize,

    /// Concurrent chunk workers.
    #[arg(short, long, env = "PRICELIST_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,

    /// Spend ceiling in USD (0 = unlimited).
    #[arg(long, env = "PRICELIST_BUDGET", default_value_t = 0.0)]
    budget: f64,

    /// Retries per chunk on rate limits and 5xx.
    #[arg(long, env = "PRICELIST_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Per-call LLM timeout in seconds.
    #[arg(long, env = "PRICELIST_API_TIMEOUT", default_value_t = 90)]
    api_timeout: u64,

    /// Directory for persisted LLM answers.
    #[arg(long, env = "PRICELIST_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Directory of extra column-pattern JSON files.
    #[arg(long, env = "PRICELIST_PATTERNS_DIR")]
    patterns_dir: Option<PathBuf>,

    /// Pattern name to try first (repeatable).
    #[arg(long = "prefer-pattern", env = "PRICELIST_PREFER_PATTERN", value_delimiter = ',')]
    prefer_pattern: Vec<String>,

    /// Minimum confidence for price-anchored recovery rows (0–1).
    #[arg(long, env = "PRICELIST_MIN_CONFIDENCE", default_value_t = 0.35)]
    min_confidence: f64,

    /// Path to a text file containing a custom extraction prompt.
    #[arg(long, env = "PRICELIST_SYSTEM_PROMPT")]
    system_prompt: Option<PathBuf>,

    /// Deterministic extraction only; no LLM calls.
    #[arg(long, env = "PRICELIST_NO_LLM")]
    no_llm: bool,

    /// Skip the critique/repair loop.
    #[arg(long, env = "PRICELIST_NO_CRITIQUE")]
    no_critique: bool,

    /// Print a per-window summary to stderr after the run.
    #[arg(long, env = "PRICELIST_SUMMARY")]
    summary: bool,

    /// Disable progress bar.
    #[arg(long, env = "PRICELIST_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "PRICELIST_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "PRICELIST_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    let show_progress = !cli.quiet && !cli.no_progress;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Load input ───────────────────────────────────────────────────────
    let pages = load_pages(&cli.input)
        .await
        .with_context(|| format!("Failed to load {}", cli.input.display()))?;

    let progress_cb: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn ExtractionProgressCallback>)
    } else {
        None
    };
    let config = build_config(&cli, progress_cb).await?;
    let orchestrator = Orchestrator::new(config).context("Failed to set up extraction")?;

    // ── Run ──────────────────────────────────────────────────────────────
    let result = orchestrator.run(&pages).await;

    if let Some(ref output_path) = cli.output {
        write_result(&result, output_path)
            .await
            .context("Failed to write result")?;
        if !cli.quiet {
            eprintln!(
                "{}  {} variants  →  {}",
                status_mark(result.status),
                result.variant_count(),
                bold(&output_path.display().to_string())
            );
        }
    } else {
        let json = serde_json::to_string_pretty(&result).context("Failed to serialise result")?;
        println!("{json}");
    }

    if cli.summary && !cli.quiet {
        print_summary(&result);
    }
    Ok(())
}

/// Map CLI args to `ExtractionConfig`.
async fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<ExtractionConfig> {
    let system_prompt = if let Some(ref path) = cli.system_prompt {
        Some(
            tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read system prompt from {:?}", path))?,
        )
    } else {
        None
    };

    let mut builder = ExtractionConfig::builder()
        .chunk_pages(cli.chunk_pages as usize)
        .window_pages(cli.window_pages)
        .concurrency(cli.concurrency)
        .budget_usd(cli.budget)
        .max_retries(cli.max_retries)
        .api_timeout_secs(cli.api_timeout)
        .min_recovery_confidence(cli.min_confidence)
        .llm_enabled(!cli.no_llm)
        .critique_enabled(!cli.no_critique);

    for name in &cli.prefer_pattern {
        builder = builder.prefer_pattern(name.clone());
    }
    if let Some(ref model) = cli.model {
        builder = builder.model(model.clone());
    }
    if let Some(ref provider) = cli.provider {
        builder = builder.provider_name(provider.clone());
    }
    if let Some(ref dir) = cli.cache_dir {
        builder = builder.cache_dir(dir.clone());
    }
    if let Some(ref dir) = cli.patterns_dir {
        builder = builder.patterns_dir(dir.clone());
    }
    if let Some(prompt) = system_prompt {
        builder = builder.system_prompt(prompt);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

fn print_summary(result: &DocumentResult) {
    let spend = &result.diagnostics.spend;
    eprintln!();
    eprintln!("{}", bold(&format!("Document {}", result.document_id)));
    for w in &result.diagnostics.windows {
        eprintln!(
            "  {} pages {:>4}-{:<4}  {} chunks  critique {}  {} repairs",
            status_mark(w.status),
            w.page_start,
            w.page_end,
            w.chunk_count,
            if w.critique_passed { green("passed") } else { yellow("failed") },
            w.repair_attempts
        );
    }
    eprintln!(
        "  {} groups, {} variants, {} price conflicts, {} validation errors",
        result.groups.len(),
        result.variant_count(),
        result.diagnostics.price_conflicts.len(),
        result.validation_errors.len()
    );
    eprintln!(
        "  {}",
        dim(&format!(
            "{} LLM calls, {} cache hits, {} tokens in / {} out, ${:.4} spent, {}ms",
            spend.llm_calls,
            spend.cache_hits,
            spend.prompt_tokens,
            spend.completion_tokens,
            spend.spent_usd,
            result.diagnostics.duration_ms
        ))
    );
    for w in result.warnings.iter().take(20) {
        eprintln!("  {} {}", yellow("!"), w);
    }
}
