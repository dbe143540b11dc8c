//! Critique: a second opinion on a window's candidate groups.
//!
//! The orchestrator hands a [`Critic`] a sampled view of the window (raw
//! segment excerpts, a few groups, per-chunk diagnostics) and gets back a
//! verdict plus free-form repair directives. Critics are optional: an absent
//! or failing critic never blocks a run, the caller treats it as a pass.

use crate::error::ChunkError;
use crate::model::Page;
use crate::output::{ChunkDiagnostic, Group};
use crate::pipeline::budget::BudgetTracker;
use crate::pipeline::llm::{
    cancelled, estimate_tokens, CompletionClient, CompletionRequest, InvokerSettings,
};
use crate::pipeline::postprocess::strip_json_fences;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const MAX_SEGMENTS: usize = 12;
const MAX_SEGMENT_CHARS: usize = 400;
const MAX_GROUPS: usize = 5;
const MAX_VARIANTS: usize = 8;

/// Raw excerpt of one page segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentSample {
    pub page: usize,
    pub id: String,
    pub kind: String,
    pub text: String,
}

/// What the critic is shown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CritiqueRequest {
    pub window_index: usize,
    pub page_start: usize,
    pub page_end: usize,
    pub segments: Vec<SegmentSample>,
    pub groups: Vec<Group>,
    pub diagnostics: Vec<ChunkDiagnostic>,
}

impl CritiqueRequest {
    /// Sample `pages` and `groups` down to prompt size.
    ///
    /// Segments are taken evenly across the window so late pages are not
    /// crowded out by a long first page.
    pub fn sample(
        window_index: usize,
        pages: &[Page],
        groups: &[Group],
        diagnostics: Vec<ChunkDiagnostic>,
    ) -> Self {
        let all: Vec<SegmentSample> = pages
            .iter()
            .flat_map(|p| {
                p.segments.iter().map(move |s| SegmentSample {
                    page: p.number,
                    id: s.id().to_string(),
                    kind: s.kind().to_string(),
                    text: truncate(&s.render_text(), MAX_SEGMENT_CHARS),
                })
            })
            .filter(|s| !s.text.trim().is_empty())
            .collect();

        let segments = if all.len() <= MAX_SEGMENTS {
            all
        } else {
            let step = all.len() as f64 / MAX_SEGMENTS as f64;
            (0..MAX_SEGMENTS)
                .map(|i| all[(i as f64 * step) as usize].clone())
                .collect()
        };

        let groups = groups
            .iter()
            .take(MAX_GROUPS)
            .map(|g| {
                let mut g = g.clone();
                g.variants.truncate(MAX_VARIANTS);
                g
            })
            .collect();

        Self {
            window_index,
            page_start: pages.first().map(|p| p.number).unwrap_or(0),
            page_end: pages.last().map(|p| p.number).unwrap_or(0),
            segments,
            groups,
            diagnostics,
        }
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", &s[..idx]),
        None => s.to_string(),
    }
}

/// The critic's verdict. Missing fields read as a pass with nothing to fix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CritiqueResponse {
    #[serde(default = "default_pass")]
    pub pass: bool,
    #[serde(default)]
    pub repairs: Vec<String>,
    #[serde(default)]
    pub explanations: Vec<String>,
}

fn default_pass() -> bool {
    true
}

impl CritiqueResponse {
    pub fn passed() -> Self {
        Self {
            pass: true,
            repairs: Vec::new(),
            explanations: Vec::new(),
        }
    }
}

/// Reviews a window's candidate groups.
#[async_trait]
pub trait Critic: Send + Sync {
    async fn critique(
        &self,
        request: &CritiqueRequest,
        budget: &BudgetTracker,
    ) -> Result<CritiqueResponse, ChunkError>;
}

/// [`Critic`] backed by the same completion service as extraction.
pub struct LlmCritic {
    client: Arc<dyn CompletionClient>,
    settings: InvokerSettings,
    cancel: Option<CancellationToken>,
}

impl LlmCritic {
    pub fn new(client: Arc<dyn CompletionClient>, settings: InvokerSettings) -> Self {
        Self {
            client,
            settings,
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, cancel: Option<CancellationToken>) -> Self {
        self.cancel = cancel;
        self
    }
}

#[async_trait]
impl Critic for LlmCritic {
    async fn critique(
        &self,
        request: &CritiqueRequest,
        budget: &BudgetTracker,
    ) -> Result<CritiqueResponse, ChunkError> {
        let unavailable = |detail: String| ChunkError::CritiqueUnavailable { detail };

        let system = crate::prompts::CRITIQUE_PROMPT;
        let user = serde_json::to_string_pretty(request)
            .map_err(|e| unavailable(format!("request not serialisable: {e}")))?;
        let estimate = self.settings.cost(
            estimate_tokens(system) + estimate_tokens(&user),
            self.settings.max_tokens,
        );
        let reservation = budget
            .reserve(estimate)
            .map_err(|e| unavailable(e.to_string()))?;

        let completion = CompletionRequest {
            model: self.client.model().to_string(),
            temperature: self.settings.temperature,
            max_tokens: self.settings.max_tokens,
            system: system.to_string(),
            user,
            schema: None,
        };
        let timeout = Duration::from_secs(self.settings.api_timeout_secs.max(1));
        let outcome = tokio::select! {
            biased;
            _ = cancelled(self.cancel.as_ref()) => None,
            outcome = tokio::time::timeout(timeout, self.client.complete(&completion)) => Some(outcome),
        };
        let Some(outcome) = outcome else {
            reservation.settle(0.0);
            return Err(unavailable("cancelled".into()));
        };

        let response = match outcome {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                reservation.settle(0.0);
                return Err(unavailable(e.to_string()));
            }
            Err(_) => {
                reservation.settle(0.0);
                return Err(unavailable(format!(
                    "timed out after {}s",
                    self.settings.api_timeout_secs
                )));
            }
        };
        reservation.settle(
            self.settings
                .cost(response.prompt_tokens, response.completion_tokens),
        );

        let body = strip_json_fences(&response.content);
        let verdict: CritiqueResponse = serde_json::from_str(&body)
            .map_err(|e| unavailable(format!("unparseable verdict: {e}")))?;
        debug!(
            "Window {}: critique pass={} repairs={}",
            request.window_index,
            verdict.pass,
            verdict.repairs.len()
        );
        Ok(verdict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ServiceError, ServiceErrorKind};
    use crate::output::Variant;
    use crate::pipeline::llm::CompletionResponse;

    struct FixedClient(Result<String, ServiceErrorKind>);

    #[async_trait]
    impl CompletionClient for FixedClient {
        fn model(&self) -> &str {
            "critic-stub"
        }

        async fn complete(
            &self,
            _request: &CompletionRequest,
        ) -> Result<CompletionResponse, ServiceError> {
            match &self.0 {
                Ok(content) => Ok(CompletionResponse {
                    content: content.clone(),
                    prompt_tokens: 100,
                    completion_tokens: 10,
                }),
                Err(kind) => Err(ServiceError::new(*kind, "boom")),
            }
        }
    }

    fn request() -> CritiqueRequest {
        let pages: Vec<Page> = (1..=20)
            .map(|n| Page::from_text(n, format!("line on page {n}")))
            .collect();
        let group = Group {
            title: "Buffers".into(),
            variants: vec![Variant::default(); 20],
            ..Group::default()
        };
        CritiqueRequest::sample(0, &pages, &vec![group; 9], Vec::new())
    }

    #[test]
    fn sampling_is_bounded() {
        let req = request();
        assert_eq!(req.segments.len(), MAX_SEGMENTS);
        assert_eq!(req.segments[0].page, 1);
        assert_eq!(req.groups.len(), MAX_GROUPS);
        assert!(req.groups.iter().all(|g| g.variants.len() == MAX_VARIANTS));
        assert_eq!((req.page_start, req.page_end), (1, 20));
    }

    #[test]
    fn truncation_is_char_safe() {
        assert_eq!(truncate("₹₹₹₹", 2), "₹₹…");
        assert_eq!(truncate("abc", 5), "abc");
    }

    #[tokio::test]
    async fn parses_fenced_verdict() {
        let critic = LlmCritic::new(
            Arc::new(FixedClient(Ok(
                "```json\n{\"pass\": false, \"repairs\": [\"stitch rows\"]}\n```".into(),
            ))),
            InvokerSettings::default(),
        );
        let budget = BudgetTracker::unlimited();
        let verdict = critic.critique(&request(), &budget).await.unwrap();
        assert!(!verdict.pass);
        assert_eq!(verdict.repairs, vec!["stitch rows"]);
        assert!(budget.snapshot().spent > 0.0);
    }

    #[tokio::test]
    async fn service_failure_is_unavailable() {
        let critic = LlmCritic::new(
            Arc::new(FixedClient(Err(ServiceErrorKind::Server))),
            InvokerSettings::default(),
        );
        let err = critic
            .critique(&request(), &BudgetTracker::unlimited())
            .await
            .unwrap_err();
        assert!(matches!(err, ChunkError::CritiqueUnavailable { .. }));
    }

    #[tokio::test]
    async fn exhausted_budget_is_unavailable() {
        let critic = LlmCritic::new(
            Arc::new(FixedClient(Ok("{}".into()))),
            InvokerSettings::default(),
        );
        let err = critic
            .critique(&request(), &BudgetTracker::new(1e-12))
            .await
            .unwrap_err();
        assert!(matches!(err, ChunkError::CritiqueUnavailable { .. }));
    }

    #[test]
    fn empty_verdict_reads_as_pass() {
        let v: CritiqueResponse = serde_json::from_str("{}").unwrap();
        assert_eq!(v, CritiqueResponse::passed());
    }
}
