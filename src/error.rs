//! Error types for the edgequake-pricelist library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`ExtractError`]: **Fatal**: the run cannot start at all (page-model
//!   file missing or not JSON, invalid configuration, output not writable).
//!   Returned only by the file-oriented entry points and by
//!   [`crate::config::ExtractionConfigBuilder::build`].
//!
//! * [`ChunkError`]: **Non-fatal**: one chunk or window failed (budget
//!   exhausted, rate limited, malformed model output) but the rest of the
//!   document is fine. Stored inside [`crate::output::ChunkResult`] and the
//!   diagnostics so callers see partial success instead of losing the whole
//!   catalog to one bad page range.
//!
//! No chunk or window failure ever escapes [`crate::extract::extract`]; it
//! degrades into fallback output plus a warning.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the edgequake-pricelist library.
#[derive(Debug, Error)]
pub enum ExtractError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Page-model file was not found at the given path.
    #[error("Page model not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// The file exists but could not be read.
    #[error("Failed to read page model '{path}': {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file was read but is not a valid page-model JSON document.
    #[error("Page model '{path}' is not valid JSON: {detail}")]
    InvalidPageModel { path: PathBuf, detail: String },

    // ── LLM errors ────────────────────────────────────────────────────────
    /// The configured provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write the output JSON file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A pattern registry file could not be loaded.
    #[error("Invalid pattern file '{path}': {detail}")]
    InvalidPattern { path: PathBuf, detail: String },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A non-fatal error for a single chunk, window or critique round.
///
/// Every variant is eligible for fallback: the pipeline substitutes
/// deterministic output and records the error as a warning.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChunkError {
    /// Reserving the estimated cost would push spend past the ceiling.
    #[error("budget exceeded: needed ${needed:.6}, only ${available:.6} available")]
    BudgetExceeded { needed: f64, available: f64 },

    /// Rate limit or 5xx that persisted through every retry.
    #[error("transient service failure after {attempts} attempts: {detail}")]
    TransientService { attempts: u32, detail: String },

    /// Non-retryable service failure (auth, bad request, …).
    #[error("service error: {detail}")]
    Service { detail: String },

    /// The service answered but the payload did not match the group schema.
    #[error("malformed response: {detail}")]
    MalformedResponse { detail: String },

    /// The deterministic extractor itself failed.
    #[error("deterministic extractor failed: {detail}")]
    ExtractorFailure { detail: String },

    /// The critique service could not be reached or answered garbage.
    #[error("critique unavailable: {detail}")]
    CritiqueUnavailable { detail: String },

    /// The caller's cancellation token fired while the call was in flight.
    #[error("cancelled")]
    Cancelled,

    /// A single external call exceeded the per-call timeout.
    #[error("external call timed out after {secs}s")]
    Timeout { secs: u64 },
}

impl ChunkError {
    /// Whether the invoker should retry after this error.
    ///
    /// Only rate limiting and server-side failures qualify; the invoker maps
    /// those to [`ChunkError::TransientService`] once retries are exhausted.
    pub fn is_transient(&self) -> bool {
        matches!(self, ChunkError::TransientService { .. })
    }

    /// Short machine-readable tag used in diagnostics.
    pub fn code(&self) -> &'static str {
        match self {
            ChunkError::BudgetExceeded { .. } => "budget_exceeded",
            ChunkError::TransientService { .. } => "transient_service",
            ChunkError::Service { .. } => "service",
            ChunkError::MalformedResponse { .. } => "malformed_response",
            ChunkError::ExtractorFailure { .. } => "extractor_failure",
            ChunkError::CritiqueUnavailable { .. } => "critique_unavailable",
            ChunkError::Cancelled => "cancelled",
            ChunkError::Timeout { .. } => "timeout",
        }
    }
}

/// Failure reported by a [`crate::pipeline::llm::CompletionClient`].
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind:?}: {message}")]
pub struct ServiceError {
    pub kind: ServiceErrorKind,
    pub message: String,
}

/// Coarse classification of service failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceErrorKind {
    /// HTTP 429 or a provider-specific throttling signal.
    RateLimited,
    /// HTTP 5xx / overloaded backend.
    Server,
    /// The client gave up waiting.
    Timeout,
    /// Anything else (auth, bad request, unknown model, …).
    Other,
}

impl ServiceError {
    pub fn new(kind: ServiceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Rate limiting and 5xx are retried; everything else propagates.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            ServiceErrorKind::RateLimited | ServiceErrorKind::Server
        )
    }
}
