//! Pipeline stages for price-list extraction.
//!
//! Each submodule implements one step; the orchestrator in
//! [`crate::extract`] wires them together.
//!
//! ## Data Flow
//!
//! ```text
//! pages ─▶ chunk ─▶ llm ─┬─ ok ──────────────────────────▶ merge ─▶ critique ─▶ final
//!                        └─ failed / low confidence ─▶ patterns ─▶ recovery ─┘     │  ▲
//!                                                                            repair ─┘
//! ```
//!
//! 1. [`chunk`]   : split pages into content-hashed chunks and windows
//! 2. [`budget`]  : shared spend ceiling; reserve before, settle after
//! 3. [`cache`]   : persisted LLM answers keyed by model + content hash
//! 4. [`llm`]     : the only stage with network I/O; retry and timeout
//! 5. [`fallback`]: pick the LLM answer or run the deterministic extractor
//!    ([`patterns`], then [`recovery`]) over the [`lines`] view
//! 6. [`merge`]   : union chunk groups under one precedence order
//! 7. [`critique`] / [`repair`]: bounded second-opinion loop per window

pub mod budget;
pub mod cache;
pub mod chunk;
pub mod context;
pub mod critique;
pub mod fallback;
pub mod lines;
pub mod llm;
pub mod merge;
pub mod patterns;
pub mod postprocess;
pub mod recovery;
pub mod repair;
