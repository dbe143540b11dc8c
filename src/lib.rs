//! # edgequake-pricelist
//!
//! Turn multi-page catalog price lists into structured product records.
//!
//! Catalog PDFs mix product families, wrapped descriptions, tax columns and
//! prices in layouts no single table parser handles. This crate sends each
//! page range to an LLM for structured extraction, falls back to a
//! deterministic column-pattern matcher (and, as a last resort, a
//! price-anchored line parser) whenever the LLM fails or is unsure, and lets
//! a critic review every page window with a bounded repair loop.
//!
//! ## Pipeline Overview
//!
//! ```text
//! page model (JSON from your PDF/OCR step)
//!  │
//!  ├─ 1. Window   split the document into page windows
//!  ├─ 2. Chunk    content-hashed page ranges, processed concurrently
//!  ├─ 3. LLM      structured extraction under a spend ceiling, cached
//!  ├─ 4. Fallback pattern matcher, then price-anchored recovery
//!  ├─ 5. Merge    union groups and variants, record price conflicts
//!  ├─ 6. Critique review each window; repair and re-run up to 3 times
//!  └─ 7. Output   merged groups + diagnostics + audit trail
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_pricelist::{extract_file, ExtractionConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from OPENAI_API_KEY / ANTHROPIC_API_KEY / GEMINI_API_KEY
//!     let config = ExtractionConfig::builder().budget_usd(0.25).build()?;
//!     let result = extract_file("catalog.pages.json", &config).await?;
//!     println!("{:?}: {} groups, {} variants", result.status, result.groups.len(), result.variant_count());
//!     eprintln!("spent ${:.4}", result.diagnostics.spend.spent_usd);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pricelist` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! edgequake-pricelist = { version = "0.3", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod extract;
pub mod model;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod stream;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{ExtractionConfig, ExtractionConfigBuilder};
pub use error::{ChunkError, ExtractError, ServiceError, ServiceErrorKind};
pub use extract::{extract, extract_file, extract_sync, extract_to_file, write_result, Orchestrator};
pub use model::{load_pages, parse_pages, BoundingBox, Page, Segment};
pub use output::{
    AuditEntry, AuditRecord, ChunkResult, ChunkSource, Diagnostics, DocumentResult, Group,
    PriceConflict, Provenance, Scalar, Status, Variant, WindowResult,
};
pub use pipeline::critique::{Critic, CritiqueRequest, CritiqueResponse};
pub use pipeline::fallback::{DeterministicExtractor, ExtractorOptions};
pub use pipeline::llm::{CompletionClient, CompletionRequest, CompletionResponse};
pub use progress::{ExtractionProgressCallback, NoopProgressCallback, ProgressCallback};
pub use stream::{extract_stream, WindowStream};
