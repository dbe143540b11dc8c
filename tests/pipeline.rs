//! Integration tests for the extraction pipeline.
//!
//! Every collaborator that would touch the network is a local stub, so these
//! run offline and deterministically.

use async_trait::async_trait;
use edgequake_pricelist::pipeline::budget::BudgetTracker;
use edgequake_pricelist::pipeline::chunk::{chunk_pages, rechunk_stable};
use edgequake_pricelist::pipeline::merge::merge_group_sets;
use edgequake_pricelist::pipeline::patterns::Role;
use edgequake_pricelist::pipeline::recovery::recover_line;
use edgequake_pricelist::pipeline::repair::Adjustment;
use edgequake_pricelist::{
    extract, ChunkError, ChunkSource, CompletionClient, CompletionRequest, CompletionResponse,
    Critic, CritiqueRequest, CritiqueResponse, DocumentResult, ExtractionConfig, Orchestrator,
    Page, ServiceError, ServiceErrorKind, Status,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// ── Stubs ────────────────────────────────────────────────────────────────────

const TABLE: &str = "Code    Description    Pack    Price\n\
                     A-100    Buffer solution    2/PK    250\n\
                     A-101    Buffer refill    1/PK    120";

fn payload(code: &str, price: f64) -> String {
    format!(
        r#"{{"groups":[{{"title":"Buffers","specs_headers":["Code","Pack","Price"],
            "variants":[{{"code":"{code}","name":"Calibration Buffer","pack":"2/PK","price_value":{price},"currency":"INR","confidence":0.9}}]}}]}}"#
    )
}

/// Answers by page range; optionally fails the first `fail_first` calls or
/// takes `delay` to answer.
struct StubClient {
    calls: AtomicUsize,
    fail_first: usize,
    delay: Duration,
    answer: Box<dyn Fn(&str) -> String + Send + Sync>,
}

impl StubClient {
    fn new(answer: impl Fn(&str) -> String + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail_first: 0,
            delay: Duration::ZERO,
            answer: Box::new(answer),
        })
    }

    fn flaky(fail_first: usize, answer: impl Fn(&str) -> String + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail_first,
            delay: Duration::ZERO,
            answer: Box::new(answer),
        })
    }

    fn slow(delay: Duration, answer: impl Fn(&str) -> String + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail_first: 0,
            delay,
            answer: Box::new(answer),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionClient for StubClient {
    fn model(&self) -> &str {
        "stub-model"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, ServiceError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if n < self.fail_first {
            return Err(ServiceError::new(ServiceErrorKind::RateLimited, "429 slow down"));
        }
        Ok(CompletionResponse {
            content: (self.answer)(&request.user),
            prompt_tokens: 800,
            completion_tokens: 200,
        })
    }
}

/// Plays back verdicts in order, repeating the last one.
struct ScriptedCritic {
    verdicts: Mutex<Vec<Result<CritiqueResponse, ChunkError>>>,
    calls: AtomicUsize,
}

impl ScriptedCritic {
    fn new(verdicts: Vec<Result<CritiqueResponse, ChunkError>>) -> Arc<Self> {
        Arc::new(Self {
            verdicts: Mutex::new(verdicts),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Critic for ScriptedCritic {
    async fn critique(
        &self,
        _request: &CritiqueRequest,
        _budget: &BudgetTracker,
    ) -> Result<CritiqueResponse, ChunkError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut verdicts = self.verdicts.lock().unwrap();
        if verdicts.len() > 1 {
            verdicts.remove(0)
        } else {
            verdicts[0].clone()
        }
    }
}

fn fail(repairs: &[&str]) -> Result<CritiqueResponse, ChunkError> {
    Ok(CritiqueResponse {
        pass: false,
        repairs: repairs.iter().map(|s| s.to_string()).collect(),
        explanations: vec!["rows look wrong".into()],
    })
}

fn offline() -> edgequake_pricelist::ExtractionConfigBuilder {
    ExtractionConfig::builder().llm_enabled(false)
}

fn table_pages(n: usize) -> Vec<Page> {
    (1..=n).map(|i| Page::from_text(i, TABLE)).collect()
}

/// One distinct product line per page.
fn catalogue_page(n: usize, price: u32) -> Page {
    Page::from_text(
        n,
        format!("Code    Description    Pack    Price\nB-{n}00    Reagent {n}    1/PK    {price}"),
    )
}

// ── Merge & conflicts ────────────────────────────────────────────────────────

#[tokio::test]
async fn differing_prices_across_chunks_are_one_conflict() {
    let client = StubClient::new(|user| {
        if user.contains("Pages 1-1") {
            payload("3031-915", 100.0)
        } else {
            payload("3031-915", 120.0)
        }
    });
    let config = ExtractionConfig::builder()
        .client(client.clone())
        .chunk_pages(1)
        .window_pages(2)
        .critique_enabled(false)
        .build()
        .unwrap();
    let doc = Orchestrator::new(config).unwrap().run(&table_pages(2)).await;

    assert_eq!(doc.status, Status::Ok);
    assert_eq!(doc.variant_count(), 1);
    let conflicts = &doc.diagnostics.price_conflicts;
    assert_eq!(conflicts.len(), 1);

    let c = &conflicts[0];
    let chunk_ids: Vec<&str> = doc.diagnostics.chunks.iter().map(|d| d.chunk_id.as_str()).collect();
    assert_eq!(c.chunk_ids.len(), 2);
    assert!(chunk_ids.contains(&c.chunk_ids[0].as_str()));
    assert!(chunk_ids.contains(&c.chunk_ids[1].as_str()));
    assert_ne!(c.chunk_ids[0], c.chunk_ids[1]);
    assert!(c.values.contains(&100.0));
    assert!(c.values.contains(&120.0));
}

#[tokio::test]
async fn merging_a_merged_result_changes_nothing() {
    let doc = extract(&table_pages(3), &offline().chunk_pages(1).build().unwrap()).await;
    let again = merge_group_sets([doc.groups.as_slice()]);
    assert_eq!(again.groups, doc.groups);
    assert!(again.price_conflicts.is_empty());
}

// ── Chunking ─────────────────────────────────────────────────────────────────

#[test]
fn twenty_three_pages_chunk_into_stable_ranges() {
    let pages: Vec<Page> = (1..=23)
        .map(|i| Page::from_text(i, format!("ITEM-{i}    Widget {i}    1/PK    {}", i * 10)))
        .collect();
    let chunks = chunk_pages("doc", &pages, 10);
    let ranges: Vec<_> = chunks.iter().map(|c| (c.page_start, c.page_end)).collect();
    assert_eq!(ranges, vec![(1, 10), (11, 20), (21, 23)]);

    let again = rechunk_stable("doc", &pages, 10, &chunks);
    let ids: Vec<_> = chunks.iter().map(|c| c.id.clone()).collect();
    let ids_again: Vec<_> = again.iter().map(|c| c.id.clone()).collect();
    assert_eq!(ids, ids_again);
    assert_eq!(chunks[0].content_hash, again[0].content_hash);
}

#[tokio::test]
async fn chunk_ids_are_stable_across_runs() {
    let pages = table_pages(5);
    let config = offline().chunk_pages(2).build().unwrap();
    let ids = |d: &DocumentResult| -> Vec<String> {
        d.diagnostics.chunks.iter().map(|c| c.chunk_id.clone()).collect()
    };
    let first = extract(&pages, &config).await;
    let second = extract(&pages, &config).await;
    assert_eq!(ids(&first).len(), 3);
    assert_eq!(ids(&first), ids(&second));
    assert_eq!(first.document_id, second.document_id);
}

// ── LLM invoker ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn second_run_is_served_from_cache() {
    let client = StubClient::flaky(1, |_| payload("3031-915", 250.0));
    let config = ExtractionConfig::builder()
        .client(client.clone())
        .retry_backoff_ms(1)
        .critique_enabled(false)
        .build()
        .unwrap();
    let orchestrator = Orchestrator::new(config).unwrap();
    let pages = table_pages(1);

    let first = orchestrator.run(&pages).await;
    let c = &first.diagnostics.chunks[0];
    assert_eq!(c.source, ChunkSource::Llm);
    assert!(!c.from_cache);
    assert_eq!(c.retries, 1);
    assert!(c.cost_usd > 0.0);
    assert_eq!(client.calls(), 2);

    let second = orchestrator.run(&pages).await;
    let c = &second.diagnostics.chunks[0];
    assert_eq!(c.source, ChunkSource::Llm);
    assert!(c.from_cache);
    assert_eq!(c.cost_usd, 0.0);
    assert_eq!(c.retries, 0);
    assert_eq!(client.calls(), 2);
    assert_eq!(second.diagnostics.spend.llm_calls, 0);
    assert_eq!(second.diagnostics.spend.cache_hits, 1);
    assert_eq!(second.groups, first.groups);
}

#[tokio::test]
async fn edited_page_only_recalls_its_own_chunk() {
    let client = StubClient::new(|user| {
        let code = if user.contains("Pages 2-2") { "B-200" } else { "B-100" };
        payload(code, 250.0)
    });
    let config = ExtractionConfig::builder()
        .client(client.clone())
        .chunk_pages(1)
        .critique_enabled(false)
        .build()
        .unwrap();
    let orchestrator = Orchestrator::new(config).unwrap();

    let mut pages: Vec<Page> = (1..=4).map(|n| catalogue_page(n, 250)).collect();
    let first = orchestrator.run(&pages).await;
    assert_eq!(client.calls(), 4);

    pages[1] = catalogue_page(2, 275);
    let second = orchestrator.run(&pages).await;

    assert_ne!(first.document_id, second.document_id);
    assert_ne!(
        first.diagnostics.chunks[0].chunk_id,
        second.diagnostics.chunks[0].chunk_id
    );
    assert_eq!(client.calls(), 5);
    assert_eq!(second.diagnostics.spend.llm_calls, 1);
    assert_eq!(second.diagnostics.spend.cache_hits, 3);
    let cached: Vec<bool> = second.diagnostics.chunks.iter().map(|c| c.from_cache).collect();
    assert_eq!(cached, vec![true, false, true, true]);
}

#[tokio::test]
async fn concurrent_chunks_never_overspend_the_budget() {
    let client = StubClient::slow(Duration::from_millis(20), |_| payload("3031-915", 250.0));
    // Each call reserves max_tokens worth of output (4.096) but settles at 0.2.
    let ceiling = 5.0;
    let config = ExtractionConfig::builder()
        .client(client.clone())
        .chunk_pages(1)
        .concurrency(4)
        .token_prices(0.0, 1.0)
        .max_tokens(4096)
        .budget_usd(ceiling)
        .critique_enabled(false)
        .build()
        .unwrap();
    let doc = Orchestrator::new(config).unwrap().run(&table_pages(4)).await;

    let spend = &doc.diagnostics.spend;
    assert!(spend.spent_usd <= ceiling);
    assert_eq!(spend.reserved_usd, 0.0);
    assert!(client.calls() >= 1);
    assert!(client.calls() < 4);

    let refused: Vec<_> = doc
        .diagnostics
        .chunks
        .iter()
        .filter(|c| c.error.as_deref().is_some_and(|e| e.contains("budget exceeded")))
        .collect();
    assert!(!refused.is_empty());
    assert!(refused.iter().all(|c| c.source == ChunkSource::Fallback));
    assert_ne!(doc.status, Status::Error);
    assert_eq!(doc.diagnostics.chunks.len(), 4);
}

#[tokio::test]
async fn cancelled_run_falls_back_without_calling() {
    let client = StubClient::new(|_| payload("3031-915", 250.0));
    let token = CancellationToken::new();
    token.cancel();
    let config = ExtractionConfig::builder()
        .client(client.clone())
        .chunk_pages(1)
        .critique_enabled(false)
        .cancel(token)
        .build()
        .unwrap();
    let doc = Orchestrator::new(config).unwrap().run(&table_pages(2)).await;

    assert_eq!(client.calls(), 0);
    assert_ne!(doc.status, Status::Error);
    for c in &doc.diagnostics.chunks {
        assert_eq!(c.source, ChunkSource::Fallback);
        assert!(c.error.as_deref().is_some_and(|e| e.contains("cancelled")));
    }
    assert_eq!(doc.diagnostics.spend.spent_usd, 0.0);
    assert_eq!(doc.variant_count(), 2);
}

#[tokio::test]
async fn exhausted_budget_falls_back_without_calling() {
    let client = StubClient::new(|_| payload("3031-915", 250.0));
    let config = ExtractionConfig::builder()
        .client(client.clone())
        .budget_usd(0.000_001)
        .critique_enabled(false)
        .build()
        .unwrap();
    let doc = Orchestrator::new(config).unwrap().run(&table_pages(1)).await;

    assert_eq!(client.calls(), 0);
    assert_eq!(doc.status, Status::Ok);
    let c = &doc.diagnostics.chunks[0];
    assert_eq!(c.source, ChunkSource::Fallback);
    assert!(c.error.as_deref().unwrap().contains("budget exceeded"));
    assert_eq!(doc.variant_count(), 2);
    assert_eq!(doc.diagnostics.spend.spent_usd, 0.0);
    assert_eq!(doc.diagnostics.spend.llm_calls, 0);
}

#[tokio::test]
async fn unusable_answer_falls_back_to_patterns() {
    let client = StubClient::new(|_| "I could not find a table.".to_string());
    let config = ExtractionConfig::builder()
        .client(client.clone())
        .critique_enabled(false)
        .build()
        .unwrap();
    let doc = Orchestrator::new(config).unwrap().run(&table_pages(1)).await;

    assert_eq!(client.calls(), 1);
    assert_eq!(doc.diagnostics.chunks[0].source, ChunkSource::Fallback);
    assert_eq!(doc.variant_count(), 2);
    assert!(doc.warnings.iter().any(|w| w.contains("fallback")));
}

// ── Recovery ─────────────────────────────────────────────────────────────────

#[test]
fn price_anchored_recovery_reads_a_catalogue_line() {
    let v = recover_line(
        "3031-915    Calibration Buffer Solution    2/PK    12345678    18%    250",
        false,
    )
    .unwrap();
    assert_eq!(v.code.as_deref(), Some("3031-915"));
    assert_eq!(v.name.as_deref(), Some("Calibration Buffer Solution"));
    assert_eq!(v.hsn.as_deref(), Some("12345678"));
    assert_eq!(v.gst_percent, Some(18.0));
    assert_eq!(v.price_value, Some(250.0));
}

// ── Critique & repair ────────────────────────────────────────────────────────

#[tokio::test]
async fn always_failing_critic_stops_after_three_repairs() {
    let critic = ScriptedCritic::new(vec![fail(&["stitch wrapped rows"])]);
    let config = offline().critic(critic.clone()).build().unwrap();
    let doc = Orchestrator::new(config).unwrap().run(&table_pages(2)).await;

    assert_eq!(critic.calls.load(Ordering::SeqCst), 4);
    assert_eq!(doc.diagnostics.windows[0].repair_attempts, 3);
    assert!(!doc.diagnostics.windows[0].critique_passed);
    assert_eq!(doc.audit[0].entries().len(), 4);
    assert_eq!(doc.audit[0].repair_attempts(), 3);
    assert_eq!(doc.status, Status::Partial);
    assert_ne!(doc.status, Status::Error);
    assert_eq!(doc.variant_count(), 2);
}

#[tokio::test]
async fn repair_directives_are_applied_and_audited() {
    let critic = ScriptedCritic::new(vec![
        fail(&["force price-anchored recovery", "make it nicer"]),
        Ok(CritiqueResponse::passed()),
    ]);
    let pages = vec![Page::from_text(
        1,
        "3031-915    Calibration Buffer Solution    2/PK    12345678    18%    250",
    )];
    let config = offline().critic(critic).build().unwrap();
    let doc = Orchestrator::new(config).unwrap().run(&pages).await;

    let entries = doc.audit[0].entries();
    assert_eq!(entries.len(), 2);
    assert!(entries[0].repaired);
    assert_eq!(entries[0].applied, vec![Adjustment::ForceRecovery]);
    assert_eq!(entries[0].unrecognized, vec!["make it nicer".to_string()]);
    assert!(entries[1].passed);
    assert!(!entries[1].repaired);

    assert_eq!(doc.status, Status::Ok);
    assert_eq!(doc.diagnostics.windows[0].repair_attempts, 1);
    let v = &doc.groups[0].variants[0];
    assert_eq!(v.code.as_deref(), Some("3031-915"));
    assert_eq!(v.price_value, Some(250.0));
}

#[tokio::test]
async fn column_repairs_override_a_wrong_llm_answer() {
    let client = StubClient::new(|_| payload("A-100", 999.0));
    let critic = ScriptedCritic::new(vec![fail(&["column 1 is the code, column 4 is the price"])]);
    let config = ExtractionConfig::builder()
        .client(client.clone())
        .critic(critic.clone())
        .build()
        .unwrap();
    let doc = Orchestrator::new(config).unwrap().run(&table_pages(1)).await;

    assert_eq!(client.calls(), 1, "repair passes must not replay the cached answer");
    assert_eq!(critic.calls.load(Ordering::SeqCst), 4);
    assert_eq!(doc.diagnostics.windows[0].repair_attempts, 3);
    assert_eq!(
        doc.audit[0].entries()[0].applied,
        vec![
            Adjustment::ColumnHint { index: 1, role: Role::Code },
            Adjustment::ColumnHint { index: 4, role: Role::Price },
        ]
    );
    assert!(doc
        .diagnostics
        .chunks
        .iter()
        .all(|c| c.source == ChunkSource::Fallback));

    let variants: Vec<_> = doc.groups.iter().flat_map(|g| g.variants.iter()).collect();
    assert!(variants.iter().all(|v| v.price_value != Some(999.0)));
    assert!(variants
        .iter()
        .any(|v| v.code.as_deref() == Some("A-100") && v.price_value == Some(250.0)));
}

#[tokio::test]
async fn absurd_column_number_is_left_unrecognised() {
    let critic = ScriptedCritic::new(vec![
        fail(&["column 18446744073709551615 is the price"]),
        Ok(CritiqueResponse::passed()),
    ]);
    let config = offline().critic(critic).build().unwrap();
    let doc = Orchestrator::new(config).unwrap().run(&table_pages(1)).await;

    let entries = doc.audit[0].entries();
    assert_eq!(entries.len(), 2);
    assert!(entries[0].applied.is_empty());
    assert_eq!(
        entries[0].unrecognized,
        vec!["column 18446744073709551615 is the price".to_string()]
    );
    assert_eq!(doc.status, Status::Ok);
    assert_eq!(doc.variant_count(), 2);
}

#[tokio::test]
async fn unavailable_critic_fails_open() {
    let critic = ScriptedCritic::new(vec![Err(ChunkError::CritiqueUnavailable {
        detail: "service down".into(),
    })]);
    let config = offline().critic(critic).build().unwrap();
    let doc = Orchestrator::new(config).unwrap().run(&table_pages(1)).await;

    assert_eq!(doc.status, Status::Ok);
    assert!(doc.diagnostics.windows[0].critique_passed);
    assert_eq!(doc.diagnostics.windows[0].repair_attempts, 0);
    assert!(doc.warnings.iter().any(|w| w.contains("critique unavailable")));
    let entries = doc.audit[0].entries();
    assert_eq!(entries.len(), 1);
    assert!(entries[0].critique_error.is_some());
}

#[tokio::test]
async fn no_critic_means_no_audit_entries() {
    let doc = extract(&table_pages(1), &offline().build().unwrap()).await;
    assert!(doc.diagnostics.windows[0].critique_passed);
    assert!(doc.audit[0].entries().is_empty());
}

// ── Document level ───────────────────────────────────────────────────────────

#[tokio::test]
async fn empty_document_is_partial() {
    let doc = extract(&[], &offline().build().unwrap()).await;
    assert_eq!(doc.status, Status::Partial);
    assert!(doc.groups.is_empty());
    assert!(!doc.warnings.is_empty());
}

#[tokio::test]
async fn result_file_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("catalog.pages.json");
    let output = dir.path().join("catalog.json");
    let pages = serde_json::json!({
        "pages": [{"number": 1, "segments": [{"kind": "text", "id": "t1", "text": TABLE}]}]
    });
    std::fs::write(&input, pages.to_string()).unwrap();

    let config = offline().build().unwrap();
    let doc = edgequake_pricelist::extract_to_file(&input, &output, &config)
        .await
        .unwrap();
    let back: DocumentResult =
        serde_json::from_str(&std::fs::read_to_string(&output).unwrap()).unwrap();
    assert_eq!(back.groups, doc.groups);
    assert_eq!(back.variant_count(), 2);
}

#[test]
fn sync_wrapper_matches_async_run() {
    let config = offline().build().unwrap();
    let sync = edgequake_pricelist::extract_sync(&table_pages(2), &config).unwrap();
    let streamed: Vec<_> = tokio_test::block_on(async {
        use futures::StreamExt;
        edgequake_pricelist::extract_stream(table_pages(2), &config)
            .collect::<Vec<_>>()
            .await
    });
    assert_eq!(streamed.len(), 1);
    assert_eq!(streamed[0].groups, sync.groups);
    assert_eq!(sync.status, Status::Ok);
}
