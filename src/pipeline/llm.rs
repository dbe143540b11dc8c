//! LLM invoker: one structured-extraction request per chunk.
//!
//! The external service is reached through the [`CompletionClient`] trait so
//! the orchestrator never depends on a concrete provider. [`ProviderClient`]
//! adapts any `edgequake_llm::LLMProvider`; tests plug in stubs.
//!
//! ## Call discipline
//!
//! For every attempt the invoker reserves the estimated cost on the shared
//! [`BudgetTracker`] *before* the request leaves the process, and settles the
//! reservation with the measured cost afterwards (zero on failure). A cache
//! hit short-circuits all of this.
//!
//! ## Retry Strategy
//!
//! Only rate limiting and 5xx responses are retried, with exponential backoff
//! (`retry_backoff_ms * 2^attempt`). A malformed payload is a hard failure:
//! asking the same model the same question at temperature 0 rarely fixes it,
//! and the deterministic fallback is cheaper.

use crate::config::ExtractionConfig;
use crate::error::{ChunkError, ExtractError, ServiceError, ServiceErrorKind};
use crate::pipeline::budget::BudgetTracker;
use crate::pipeline::cache::ResponseCache;
use crate::pipeline::postprocess;
use crate::output::Group;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Warning tag that makes the fallback selector distrust an LLM result.
pub const LOW_CONFIDENCE_MARKER: &str = "low_confidence";

/// Default model when neither config nor environment names one.
pub const DEFAULT_MODEL: &str = "gpt-4.1-nano";

/// Upper bound on a single retry wait.
pub const MAX_BACKOFF_MS: u64 = 60_000;

// ── Service contract ─────────────────────────────────────────────────────

/// One chat-completion request.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: usize,
    pub system: String,
    pub user: String,
    /// JSON schema the answer must follow, for clients that can enforce it.
    pub schema: Option<serde_json::Value>,
}

/// Raw answer of the service.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionResponse {
    pub content: String,
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
}

/// Black-box text-completion service.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Model identifier used for cache validation and logging.
    fn model(&self) -> &str;

    async fn complete(&self, request: &CompletionRequest)
        -> Result<CompletionResponse, ServiceError>;
}

/// [`CompletionClient`] backed by an edgequake-llm provider.
pub struct ProviderClient {
    provider: Arc<dyn LLMProvider>,
    model: String,
}

impl ProviderClient {
    pub fn new(provider: Arc<dyn LLMProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }
}

#[async_trait]
impl CompletionClient for ProviderClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, ServiceError> {
        let system = match &request.schema {
            Some(schema) => format!(
                "{}\n\nThe answer MUST be a single JSON object valid against this schema:\n{}",
                request.system, schema
            ),
            None => request.system.clone(),
        };
        let messages = vec![
            ChatMessage::system(system.as_str()),
            ChatMessage::user(request.user.as_str()),
        ];
        let options = CompletionOptions {
            temperature: Some(request.temperature),
            max_tokens: Some(request.max_tokens),
            ..Default::default()
        };

        match self.provider.chat(&messages, Some(&options)).await {
            Ok(response) => Ok(CompletionResponse {
                content: response.content,
                prompt_tokens: response.prompt_tokens as usize,
                completion_tokens: response.completion_tokens as usize,
            }),
            Err(e) => {
                let message = e.to_string();
                Err(ServiceError::new(classify_provider_error(&message), message))
            }
        }
    }
}

/// Map a provider error message onto the retry taxonomy.
///
/// Providers surface HTTP status in wildly different shapes, so this matches
/// on the rendered message.
pub fn classify_provider_error(message: &str) -> ServiceErrorKind {
    let lower = message.to_lowercase();
    if lower.contains("429") || lower.contains("rate limit") || lower.contains("too many requests")
    {
        ServiceErrorKind::RateLimited
    } else if ["500", "502", "503", "504", "529", "overloaded", "internal server error", "service unavailable", "bad gateway"]
        .iter()
        .any(|needle| lower.contains(needle))
    {
        ServiceErrorKind::Server
    } else if lower.contains("timed out") || lower.contains("timeout") {
        ServiceErrorKind::Timeout
    } else {
        ServiceErrorKind::Other
    }
}

/// Instantiate a named provider with the given model.
fn create_provider(provider_name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, ExtractError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        ExtractError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Resolve the completion client, from most-specific to least-specific.
///
/// 1. **Pre-built client** (`config.client`): tests and custom middleware.
/// 2. **Pre-built provider** (`config.provider`): wrapped in [`ProviderClient`].
/// 3. **Named provider + model** (`config.provider_name`).
/// 4. **Environment pair** (`EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`).
/// 5. **OpenAI key present**: OpenAI with the configured or default model.
/// 6. **Full auto-detection** (`ProviderFactory::from_env`).
///
/// Returns `Ok(None)` when the LLM path is disabled in the config.
pub fn resolve_client(
    config: &ExtractionConfig,
) -> Result<Option<Arc<dyn CompletionClient>>, ExtractError> {
    if !config.llm_enabled {
        return Ok(None);
    }
    if let Some(ref client) = config.client {
        return Ok(Some(Arc::clone(client)));
    }

    let model = config.model.clone().unwrap_or_else(|| DEFAULT_MODEL.to_string());

    if let Some(ref provider) = config.provider {
        return Ok(Some(Arc::new(ProviderClient::new(Arc::clone(provider), model))));
    }

    if let Some(ref name) = config.provider_name {
        let provider = create_provider(name, &model)?;
        return Ok(Some(Arc::new(ProviderClient::new(provider, model))));
    }

    if let (Ok(prov), Ok(env_model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !env_model.is_empty() {
            let provider = create_provider(&prov, &env_model)?;
            return Ok(Some(Arc::new(ProviderClient::new(provider, env_model))));
        }
    }

    if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
        if !openai_key.is_empty() {
            let provider = create_provider("openai", &model)?;
            return Ok(Some(Arc::new(ProviderClient::new(provider, model))));
        }
    }

    let (provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| ExtractError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or configure a provider.\n\
                Error: {}",
                e
            ),
        })?;
    Ok(Some(Arc::new(ProviderClient::new(provider, model))))
}

// ── Invocation ───────────────────────────────────────────────────────────

/// Parsed, normalised model output for one chunk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmPayload {
    pub groups: Vec<Group>,
    #[serde(default)]
    pub notes: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl LlmPayload {
    pub fn has_low_confidence_marker(&self) -> bool {
        self.warnings.iter().any(|w| {
            let w = w.to_lowercase();
            w.contains(LOW_CONFIDENCE_MARKER) || w.contains("low confidence")
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
}

/// Everything one invocation produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    pub payload: LlmPayload,
    pub usage: Usage,
    pub cost_usd: f64,
    pub retries: u32,
    pub from_cache: bool,
    pub duration_ms: u64,
}

/// Per-chunk request: rendered prompt plus cache identity.
#[derive(Debug, Clone)]
pub struct ChunkRequest {
    pub chunk_id: String,
    pub content_hash: String,
    pub system: String,
    pub user: String,
}

/// Knobs the invoker needs, lifted out of [`ExtractionConfig`].
#[derive(Debug, Clone)]
pub struct InvokerSettings {
    pub temperature: f32,
    pub max_tokens: usize,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub api_timeout_secs: u64,
    pub input_cost_per_1k: f64,
    pub output_cost_per_1k: f64,
    pub low_confidence_threshold: f64,
}

impl InvokerSettings {
    pub fn from_config(config: &ExtractionConfig) -> Self {
        Self {
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            max_retries: config.max_retries,
            retry_backoff_ms: config.retry_backoff_ms,
            api_timeout_secs: config.api_timeout_secs,
            input_cost_per_1k: config.input_cost_per_1k,
            output_cost_per_1k: config.output_cost_per_1k,
            low_confidence_threshold: config.low_confidence_threshold,
        }
    }

    pub(crate) fn cost(&self, prompt_tokens: usize, completion_tokens: usize) -> f64 {
        prompt_tokens as f64 / 1000.0 * self.input_cost_per_1k
            + completion_tokens as f64 / 1000.0 * self.output_cost_per_1k
    }
}

impl Default for InvokerSettings {
    fn default() -> Self {
        Self::from_config(&ExtractionConfig::default())
    }
}

/// Rough token count: ~4 characters per token.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

enum CallFailure {
    Cancelled,
    Timeout,
    Service(ServiceError),
}

/// Budget-aware, retrying, caching front for a [`CompletionClient`].
pub struct LlmInvoker {
    client: Arc<dyn CompletionClient>,
    cache: Arc<ResponseCache>,
    settings: InvokerSettings,
}

impl LlmInvoker {
    pub fn new(
        client: Arc<dyn CompletionClient>,
        cache: Arc<ResponseCache>,
        settings: InvokerSettings,
    ) -> Self {
        Self {
            client,
            cache,
            settings,
        }
    }

    pub fn model(&self) -> &str {
        self.client.model()
    }

    pub fn client(&self) -> &Arc<dyn CompletionClient> {
        &self.client
    }

    /// Upper-bound cost estimate for a prompt: full input plus `max_tokens` output.
    pub fn estimate_cost(&self, system: &str, user: &str) -> f64 {
        let prompt_tokens = estimate_tokens(system) + estimate_tokens(user);
        self.settings.cost(prompt_tokens, self.settings.max_tokens)
    }

    /// Run one chunk through the service.
    ///
    /// `canned` replaces the network call with a recorded answer (replay and
    /// tests); it is parsed exactly like a live response and costs nothing.
    pub async fn invoke(
        &self,
        request: &ChunkRequest,
        budget: &BudgetTracker,
        canned: Option<&str>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Invocation, ChunkError> {
        let start = Instant::now();
        let model = self.client.model().to_string();

        if let Some(mut hit) = self
            .cache
            .get(&request.content_hash, &model)
            .await
        {
            debug!("Chunk {}: cache hit", request.chunk_id);
            hit.from_cache = true;
            hit.cost_usd = 0.0;
            hit.retries = 0;
            hit.usage = Usage::default();
            hit.duration_ms = 0;
            return Ok(hit);
        }

        if let Some(content) = canned {
            let payload = parse_payload(content, self.settings.low_confidence_threshold)?;
            return Ok(Invocation {
                payload,
                usage: Usage::default(),
                cost_usd: 0.0,
                retries: 0,
                from_cache: false,
                duration_ms: start.elapsed().as_millis() as u64,
            });
        }

        let completion = CompletionRequest {
            model: model.clone(),
            temperature: self.settings.temperature,
            max_tokens: self.settings.max_tokens,
            system: request.system.clone(),
            user: request.user.clone(),
            schema: Some(crate::prompts::extraction_schema()),
        };
        let estimate = self.estimate_cost(&request.system, &request.user);
        let mut last_err: Option<ServiceError> = None;

        for attempt in 0..=self.settings.max_retries {
            if attempt > 0 {
                let backoff = backoff_delay(self.settings.retry_backoff_ms, attempt);
                warn!(
                    "Chunk {}: retry {}/{} after {}ms",
                    request.chunk_id, attempt, self.settings.max_retries, backoff
                );
                if wait_or_cancel(Duration::from_millis(backoff), cancel).await {
                    return Err(ChunkError::Cancelled);
                }
            }

            let reservation = budget.reserve(estimate)?;

            match self.call(&completion, cancel).await {
                Ok(response) => {
                    let usage = Usage {
                        prompt_tokens: response.prompt_tokens,
                        completion_tokens: response.completion_tokens,
                    };
                    let cost = self.settings.cost(usage.prompt_tokens, usage.completion_tokens);
                    reservation.settle(cost);
                    debug!(
                        "Chunk {}: {} input tokens, {} output tokens, ${:.6}",
                        request.chunk_id, usage.prompt_tokens, usage.completion_tokens, cost
                    );

                    let payload =
                        parse_payload(&response.content, self.settings.low_confidence_threshold)?;
                    let invocation = Invocation {
                        payload,
                        usage,
                        cost_usd: cost,
                        retries: attempt,
                        from_cache: false,
                        duration_ms: start.elapsed().as_millis() as u64,
                    };
                    self.cache
                        .insert(&request.chunk_id, &request.content_hash, &model, &invocation)
                        .await;
                    return Ok(invocation);
                }
                Err(CallFailure::Cancelled) => {
                    reservation.settle(0.0);
                    return Err(ChunkError::Cancelled);
                }
                Err(CallFailure::Timeout) => {
                    reservation.settle(0.0);
                    return Err(ChunkError::Timeout {
                        secs: self.settings.api_timeout_secs,
                    });
                }
                Err(CallFailure::Service(e)) if e.is_transient() => {
                    reservation.settle(0.0);
                    warn!(
                        "Chunk {}: attempt {} failed: {}",
                        request.chunk_id,
                        attempt + 1,
                        e
                    );
                    last_err = Some(e);
                }
                Err(CallFailure::Service(e)) => {
                    reservation.settle(0.0);
                    return Err(ChunkError::Service {
                        detail: e.message,
                    });
                }
            }
        }

        Err(ChunkError::TransientService {
            attempts: self.settings.max_retries + 1,
            detail: last_err
                .map(|e| e.message)
                .unwrap_or_else(|| "Unknown error".to_string()),
        })
    }

    async fn call(
        &self,
        request: &CompletionRequest,
        cancel: Option<&CancellationToken>,
    ) -> Result<CompletionResponse, CallFailure> {
        let timeout = Duration::from_secs(self.settings.api_timeout_secs.max(1));
        let call = tokio::time::timeout(timeout, self.client.complete(request));
        tokio::select! {
            biased;
            _ = cancelled(cancel) => Err(CallFailure::Cancelled),
            outcome = call => match outcome {
                Err(_elapsed) => Err(CallFailure::Timeout),
                Ok(Ok(response)) => Ok(response),
                Ok(Err(e)) if e.kind == ServiceErrorKind::Timeout => Err(CallFailure::Timeout),
                Ok(Err(e)) => Err(CallFailure::Service(e)),
            },
        }
    }
}

/// Resolves when `cancel` fires; never resolves without a token.
pub(crate) async fn cancelled(cancel: Option<&CancellationToken>) {
    match cancel {
        Some(token) => token.cancelled().await,
        None => futures::future::pending::<()>().await,
    }
}

/// Exponential backoff before retry `attempt` (1-based), capped at
/// [`MAX_BACKOFF_MS`]. Saturates instead of overflowing for any retry count.
fn backoff_delay(base_ms: u64, attempt: u32) -> u64 {
    let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
    base_ms.saturating_mul(factor).min(MAX_BACKOFF_MS)
}

/// Sleep for `delay`; returns `true` if cancelled first.
async fn wait_or_cancel(delay: Duration, cancel: Option<&CancellationToken>) -> bool {
    tokio::select! {
        biased;
        _ = cancelled(cancel) => true,
        _ = sleep(delay) => false,
    }
}

// ── Payload parsing ──────────────────────────────────────────────────────

/// Parse the model's JSON answer into normalised groups.
///
/// The answer must be an object with a `groups` array whose items carry a
/// string `title` and a `variants` array of objects. Anything else is a
/// [`ChunkError::MalformedResponse`].
pub fn parse_payload(content: &str, low_confidence_threshold: f64) -> Result<LlmPayload, ChunkError> {
    let malformed = |detail: String| ChunkError::MalformedResponse { detail };

    let body = postprocess::strip_json_fences(content);
    let value: serde_json::Value =
        serde_json::from_str(&body).map_err(|e| malformed(format!("not JSON: {e}")))?;
    let obj = value
        .as_object()
        .ok_or_else(|| malformed("top level is not an object".into()))?;
    let raw_groups = obj
        .get("groups")
        .and_then(|g| g.as_array())
        .ok_or_else(|| malformed("missing `groups` array".into()))?;

    let mut groups = Vec::with_capacity(raw_groups.len());
    for (i, raw) in raw_groups.iter().enumerate() {
        let group = postprocess::group_from_json(raw, postprocess::DEFAULT_LLM_CONFIDENCE)
            .map_err(|e| malformed(format!("group {i}: {e}")))?;
        groups.push(group);
    }
    let groups = postprocess::normalize_groups(groups);

    let mut payload = LlmPayload {
        groups,
        notes: string_list(obj.get("notes")),
        warnings: string_list(obj.get("warnings")),
    };

    let confidences: Vec<f64> = payload
        .groups
        .iter()
        .flat_map(|g| g.variants.iter().map(|v| v.confidence))
        .collect();
    if !confidences.is_empty() {
        let mean = confidences.iter().sum::<f64>() / confidences.len() as f64;
        if mean < low_confidence_threshold && !payload.has_low_confidence_marker() {
            payload.warnings.push(format!(
                "{LOW_CONFIDENCE_MARKER}: mean variant confidence {mean:.2}"
            ));
        }
    }
    Ok(payload)
}

fn string_list(value: Option<&serde_json::Value>) -> Vec<String> {
    match value {
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .filter_map(|v| match v {
                serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
                _ => None,
            })
            .collect(),
        Some(serde_json::Value::String(s)) if !s.trim().is_empty() => vec![s.trim().to_string()],
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const GOOD: &str = r#"{"groups":[{"title":"Buffers","category":"Reagents","specs_headers":["Code","Pack","Price"],
        "variants":[{"code":"3031-915","name":"Calibration Buffer","pack":"2/PK","price_value":250,"currency":"INR","confidence":0.9}]}]}"#;

    /// Replays a scripted sequence of outcomes, then repeats the last one.
    struct ScriptedClient {
        script: Mutex<Vec<Result<CompletionResponse, ServiceError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedClient {
        fn new(script: Vec<Result<CompletionResponse, ServiceError>>) -> Self {
            Self {
                script: Mutex::new(script),
                calls: AtomicUsize::new(0),
            }
        }
    }

    fn ok(content: &str) -> Result<CompletionResponse, ServiceError> {
        Ok(CompletionResponse {
            content: content.to_string(),
            prompt_tokens: 1000,
            completion_tokens: 500,
        })
    }

    #[async_trait]
    impl CompletionClient for ScriptedClient {
        fn model(&self) -> &str {
            "stub-model"
        }

        async fn complete(
            &self,
            _request: &CompletionRequest,
        ) -> Result<CompletionResponse, ServiceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut script = self.script.lock().unwrap();
            if script.len() > 1 {
                script.remove(0)
            } else {
                script[0].clone()
            }
        }
    }

    #[test]
    fn backoff_doubles_then_caps() {
        assert_eq!(backoff_delay(500, 1), 500);
        assert_eq!(backoff_delay(500, 2), 1000);
        assert_eq!(backoff_delay(500, 4), 4000);
        assert_eq!(backoff_delay(500, 200), MAX_BACKOFF_MS);
        assert_eq!(backoff_delay(u64::MAX, 3), MAX_BACKOFF_MS);
        assert_eq!(backoff_delay(0, u32::MAX), 0);
    }

    fn settings() -> InvokerSettings {
        InvokerSettings {
            retry_backoff_ms: 1,
            ..InvokerSettings::default()
        }
    }

    fn request() -> ChunkRequest {
        ChunkRequest {
            chunk_id: "doc-w00-c000".into(),
            content_hash: "abc".into(),
            system: "system".into(),
            user: "user text".into(),
        }
    }

    fn invoker(client: Arc<ScriptedClient>) -> LlmInvoker {
        LlmInvoker::new(client, Arc::new(ResponseCache::in_memory()), settings())
    }

    #[tokio::test]
    async fn success_records_usage_and_cost() {
        let client = Arc::new(ScriptedClient::new(vec![ok(GOOD)]));
        let inv = invoker(Arc::clone(&client));
        let budget = BudgetTracker::unlimited();
        let out = inv.invoke(&request(), &budget, None, None).await.unwrap();
        assert_eq!(out.payload.groups.len(), 1);
        assert_eq!(out.retries, 0);
        assert!(!out.from_cache);
        assert!(out.cost_usd > 0.0);
        assert!((budget.snapshot().spent - out.cost_usd).abs() < 1e-12);
        assert_eq!(budget.snapshot().reserved, 0.0);
    }

    #[tokio::test]
    async fn second_call_is_a_cache_hit() {
        let client = Arc::new(ScriptedClient::new(vec![ok(GOOD)]));
        let inv = invoker(Arc::clone(&client));
        let budget = BudgetTracker::unlimited();
        inv.invoke(&request(), &budget, None, None).await.unwrap();
        let spent = budget.snapshot().spent;

        let again = inv.invoke(&request(), &budget, None, None).await.unwrap();
        assert!(again.from_cache);
        assert_eq!(again.cost_usd, 0.0);
        assert_eq!(again.retries, 0);
        assert_eq!(budget.snapshot().spent, spent);
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let client = Arc::new(ScriptedClient::new(vec![
            Err(ServiceError::new(ServiceErrorKind::RateLimited, "429")),
            Err(ServiceError::new(ServiceErrorKind::Server, "503")),
            ok(GOOD),
        ]));
        let inv = invoker(Arc::clone(&client));
        let out = inv
            .invoke(&request(), &BudgetTracker::unlimited(), None, None)
            .await
            .unwrap();
        assert_eq!(out.retries, 2);
        assert_eq!(client.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let client = Arc::new(ScriptedClient::new(vec![Err(ServiceError::new(
            ServiceErrorKind::Server,
            "502 bad gateway",
        ))]));
        let inv = invoker(Arc::clone(&client));
        let budget = BudgetTracker::unlimited();
        let err = inv.invoke(&request(), &budget, None, None).await.unwrap_err();
        assert!(matches!(err, ChunkError::TransientService { attempts: 4, .. }));
        assert_eq!(client.calls.load(Ordering::SeqCst), 4);
        assert_eq!(budget.snapshot().reserved, 0.0);
        assert_eq!(budget.snapshot().spent, 0.0);
    }

    #[tokio::test]
    async fn non_transient_errors_are_not_retried() {
        let client = Arc::new(ScriptedClient::new(vec![Err(ServiceError::new(
            ServiceErrorKind::Other,
            "401 unauthorized",
        ))]));
        let inv = invoker(Arc::clone(&client));
        let err = inv
            .invoke(&request(), &BudgetTracker::unlimited(), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ChunkError::Service { .. }));
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn malformed_payload_is_not_retried() {
        let client = Arc::new(ScriptedClient::new(vec![ok("Sorry, I cannot help.")]));
        let inv = invoker(Arc::clone(&client));
        let budget = BudgetTracker::unlimited();
        let err = inv.invoke(&request(), &budget, None, None).await.unwrap_err();
        assert!(matches!(err, ChunkError::MalformedResponse { .. }));
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
        assert!(budget.snapshot().spent > 0.0, "the failed parse still cost money");
    }

    #[tokio::test]
    async fn budget_exhaustion_fails_before_calling() {
        let client = Arc::new(ScriptedClient::new(vec![ok(GOOD)]));
        let inv = invoker(Arc::clone(&client));
        let budget = BudgetTracker::new(1e-9);
        let err = inv.invoke(&request(), &budget, None, None).await.unwrap_err();
        assert!(matches!(err, ChunkError::BudgetExceeded { .. }));
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);
        assert_eq!(budget.snapshot().reserved, 0.0);
    }

    #[tokio::test]
    async fn cancelled_token_aborts() {
        let client = Arc::new(ScriptedClient::new(vec![ok(GOOD)]));
        let inv = invoker(client);
        let token = CancellationToken::new();
        token.cancel();
        let err = inv
            .invoke(&request(), &BudgetTracker::unlimited(), None, Some(&token))
            .await
            .unwrap_err();
        assert_eq!(err, ChunkError::Cancelled);
    }

    #[tokio::test]
    async fn canned_response_skips_the_client() {
        let client = Arc::new(ScriptedClient::new(vec![ok("unused")]));
        let inv = invoker(Arc::clone(&client));
        let out = inv
            .invoke(&request(), &BudgetTracker::unlimited(), Some(GOOD), None)
            .await
            .unwrap();
        assert_eq!(out.payload.groups[0].variants[0].code.as_deref(), Some("3031-915"));
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn parse_rejects_missing_groups() {
        assert!(parse_payload(r#"{"items":[]}"#, 0.5).is_err());
        assert!(parse_payload(r#"[1,2]"#, 0.5).is_err());
        assert!(parse_payload(r#"{"groups":[{"variants":[]}]}"#, 0.5).is_err());
    }

    #[test]
    fn parse_accepts_fenced_json() {
        let fenced = format!("```json\n{GOOD}\n```");
        let payload = parse_payload(&fenced, 0.5).unwrap();
        assert_eq!(payload.groups[0].title, "Buffers");
    }

    #[test]
    fn low_mean_confidence_adds_marker() {
        let json = r#"{"groups":[{"title":"X","variants":[{"code":"A-1","price_value":5,"confidence":0.2}]}]}"#;
        let payload = parse_payload(json, 0.5).unwrap();
        assert!(payload.has_low_confidence_marker());
    }

    #[test]
    fn classifies_provider_messages() {
        assert_eq!(classify_provider_error("HTTP 429 Too Many Requests"), ServiceErrorKind::RateLimited);
        assert_eq!(classify_provider_error("upstream returned 503"), ServiceErrorKind::Server);
        assert_eq!(classify_provider_error("request timed out"), ServiceErrorKind::Timeout);
        assert_eq!(classify_provider_error("invalid api key"), ServiceErrorKind::Other);
    }

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcde"), 2);
    }
}
