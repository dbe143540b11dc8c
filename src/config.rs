//! Configuration types for price-list extraction.
//!
//! All run behaviour is controlled through [`ExtractionConfig`], built via its
//! [`ExtractionConfigBuilder`]. Collaborators that cannot be described by
//! plain values (LLM provider, completion client, critic, cancellation token,
//! progress callback) live here too, as shared trait objects, so a config can
//! be cloned freely between runs.

use crate::error::ExtractError;
use crate::pipeline::critique::Critic;
use crate::pipeline::llm::CompletionClient;
use crate::progress::ProgressCallback;
use edgequake_llm::LLMProvider;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Configuration for one extraction run.
///
/// Built via [`ExtractionConfig::builder()`] or using
/// [`ExtractionConfig::default()`].
///
/// # Example
/// ```rust
/// use edgequake_pricelist::ExtractionConfig;
///
/// let config = ExtractionConfig::builder()
///     .chunk_pages(8)
///     .concurrency(6)
///     .budget_usd(0.50)
///     .model("gpt-4.1-nano")
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct ExtractionConfig {
    /// Stable document identifier. Default: derived from the page content hash.
    ///
    /// Chunk and window ids are prefixed with it, so fixing it keeps cache
    /// entries valid across edits that do not touch a given page range.
    pub document_id: Option<String>,

    /// Pages per chunk, the unit of LLM work. Default: 10.
    pub chunk_pages: usize,

    /// Pages per critique/repair window. Default: 30. Clamped up to
    /// `chunk_pages`.
    pub window_pages: usize,

    /// Concurrent chunk workers within a window. Default: 4.
    ///
    /// Clamped to the number of chunks at run time.
    pub concurrency: usize,

    /// Use the LLM path at all. Default: true.
    ///
    /// When false every chunk goes straight to deterministic extraction and
    /// no critique runs unless a [`Critic`] is supplied explicitly.
    pub llm_enabled: bool,

    /// LLM model identifier, e.g. "gpt-4.1-nano".
    pub model: Option<String>,

    /// LLM provider name (e.g. "openai", "anthropic", "ollama").
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Pre-built completion client. Takes precedence over every provider
    /// setting.
    pub client: Option<Arc<dyn CompletionClient>>,

    /// Sampling temperature. Default: 0.0.
    pub temperature: f32,

    /// Maximum output tokens per call. Default: 4096. Also the output side
    /// of the pre-call cost estimate.
    pub max_tokens: usize,

    /// Retries after a rate-limit or 5xx failure. Default: 3.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds, doubled per attempt. Default: 500.
    pub retry_backoff_ms: u64,

    /// Per-call timeout in seconds. Default: 90.
    pub api_timeout_secs: u64,

    /// Spend ceiling in USD for the whole run. Default: 0.0 (unlimited).
    pub budget_usd: f64,

    /// USD per 1 000 prompt tokens. Default: 0.0001.
    pub input_cost_per_1k: f64,

    /// USD per 1 000 completion tokens. Default: 0.0004.
    pub output_cost_per_1k: f64,

    /// Directory for persisted LLM responses. Default: None (memory only).
    pub cache_dir: Option<PathBuf>,

    /// Directory of extra pattern registry JSON files. Default: None.
    pub patterns_dir: Option<PathBuf>,

    /// Pattern names tried before the rest of the registry.
    pub pattern_preferences: Vec<String>,

    /// Cutoff for price-anchored recovery rows. Default: 0.35.
    pub min_recovery_confidence: f64,

    /// Mean variant confidence below which an LLM answer is marked low
    /// confidence and replaced by the deterministic path. Default: 0.5.
    pub low_confidence_threshold: f64,

    /// Run the critique/repair loop. Default: true.
    pub critique_enabled: bool,

    /// Pre-built critic. Default: an LLM critic over the resolved client.
    pub critic: Option<Arc<dyn Critic>>,

    /// Repair passes per window. Default: 3.
    pub max_repair_iterations: u32,

    /// Custom extraction system prompt. If None, uses the built-in one.
    pub system_prompt: Option<String>,

    /// Cancels in-flight calls; cancelled chunks fall back.
    pub cancel: Option<CancellationToken>,

    /// Optional progress callback.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            document_id: None,
            chunk_pages: 10,
            window_pages: 30,
            concurrency: 4,
            llm_enabled: true,
            model: None,
            provider_name: None,
            provider: None,
            client: None,
            temperature: 0.0,
            max_tokens: 4096,
            max_retries: 3,
            retry_backoff_ms: 500,
            api_timeout_secs: 90,
            budget_usd: 0.0,
            input_cost_per_1k: 0.0001,
            output_cost_per_1k: 0.0004,
            cache_dir: None,
            patterns_dir: None,
            pattern_preferences: Vec::new(),
            min_recovery_confidence: 0.35,
            low_confidence_threshold: 0.5,
            critique_enabled: true,
            critic: None,
            max_repair_iterations: 3,
            system_prompt: None,
            cancel: None,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for ExtractionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractionConfig")
            .field("document_id", &self.document_id)
            .field("chunk_pages", &self.chunk_pages)
            .field("window_pages", &self.window_pages)
            .field("concurrency", &self.concurrency)
            .field("llm_enabled", &self.llm_enabled)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("client", &self.client.as_ref().map(|c| c.model().to_string()))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("max_retries", &self.max_retries)
            .field("budget_usd", &self.budget_usd)
            .field("cache_dir", &self.cache_dir)
            .field("patterns_dir", &self.patterns_dir)
            .field("pattern_preferences", &self.pattern_preferences)
            .field("critique_enabled", &self.critique_enabled)
            .field("critic", &self.critic.as_ref().map(|_| "<dyn Critic>"))
            .field("max_repair_iterations", &self.max_repair_iterations)
            .finish()
    }
}

impl ExtractionConfig {
    /// Create a new builder for `ExtractionConfig`.
    pub fn builder() -> ExtractionConfigBuilder {
        ExtractionConfigBuilder {
            config: Self::default(),
        }
    }

    /// `window_pages` never smaller than `chunk_pages`.
    pub fn effective_window_pages(&self) -> usize {
        self.window_pages.max(self.chunk_pages).max(1)
    }
}

/// Builder for [`ExtractionConfig`].
#[derive(Debug)]
pub struct ExtractionConfigBuilder {
    config: ExtractionConfig,
}

impl ExtractionConfigBuilder {
    pub fn document_id(mut self, id: impl Into<String>) -> Self {
        self.config.document_id = Some(id.into());
        self
    }

    pub fn chunk_pages(mut self, n: usize) -> Self {
        self.config.chunk_pages = n;
        self
    }

    pub fn window_pages(mut self, n: usize) -> Self {
        self.config.window_pages = n;
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n;
        self
    }

    pub fn llm_enabled(mut self, v: bool) -> Self {
        self.config.llm_enabled = v;
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn client(mut self, client: Arc<dyn CompletionClient>) -> Self {
        self.config.client = Some(client);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn budget_usd(mut self, usd: f64) -> Self {
        self.config.budget_usd = usd;
        self
    }

    pub fn token_prices(mut self, input_per_1k: f64, output_per_1k: f64) -> Self {
        self.config.input_cost_per_1k = input_per_1k;
        self.config.output_cost_per_1k = output_per_1k;
        self
    }

    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.cache_dir = Some(dir.into());
        self
    }

    pub fn patterns_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.patterns_dir = Some(dir.into());
        self
    }

    pub fn prefer_pattern(mut self, name: impl Into<String>) -> Self {
        self.config.pattern_preferences.push(name.into());
        self
    }

    pub fn min_recovery_confidence(mut self, v: f64) -> Self {
        self.config.min_recovery_confidence = v;
        self
    }

    pub fn low_confidence_threshold(mut self, v: f64) -> Self {
        self.config.low_confidence_threshold = v;
        self
    }

    pub fn critique_enabled(mut self, v: bool) -> Self {
        self.config.critique_enabled = v;
        self
    }

    pub fn critic(mut self, critic: Arc<dyn Critic>) -> Self {
        self.config.critic = Some(critic);
        self
    }

    pub fn max_repair_iterations(mut self, n: u32) -> Self {
        self.config.max_repair_iterations = n;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.config.cancel = Some(token);
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ExtractionConfig, ExtractError> {
        let c = &self.config;
        if c.chunk_pages == 0 {
            return Err(ExtractError::InvalidConfig(
                "chunk_pages must be ≥ 1".into(),
            ));
        }
        if c.concurrency == 0 {
            return Err(ExtractError::InvalidConfig(
                "Concurrency must be ≥ 1".into(),
            ));
        }
        if !c.budget_usd.is_finite() {
            return Err(ExtractError::InvalidConfig(format!(
                "Budget must be a finite amount, got {}",
                c.budget_usd
            )));
        }
        if c.input_cost_per_1k < 0.0 || c.output_cost_per_1k < 0.0 {
            return Err(ExtractError::InvalidConfig(
                "Token prices must not be negative".into(),
            ));
        }
        for (name, v) in [
            ("min_recovery_confidence", c.min_recovery_confidence),
            ("low_confidence_threshold", c.low_confidence_threshold),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(ExtractError::InvalidConfig(format!(
                    "{name} must be within 0–1, got {v}"
                )));
            }
        }
        let mut config = self.config;
        config.window_pages = config.effective_window_pages();
        Ok(config)
    }
}
