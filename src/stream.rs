//! Streaming extraction API: emit windows as their repair loops settle.
//!
//! Large catalogs take minutes. Unlike the eager [`crate::extract::extract`],
//! which returns only after every window has been merged into one
//! [`crate::output::DocumentResult`], [`extract_stream`] yields each
//! [`WindowResult`] as soon as its critique/repair loop finishes. Windows
//! arrive in page order because they run sequentially.
//!
//! Stream items are per-window: groups that span two windows are not merged
//! across them. Feed the windows' groups through
//! [`crate::pipeline::merge::merge_group_sets`] for the document view.

use crate::config::ExtractionConfig;
use crate::extract::Orchestrator;
use crate::model::Page;
use crate::output::WindowResult;
use futures::stream::{self, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use tokio_stream::Stream;
use tracing::warn;

/// A boxed stream of window results.
pub type WindowStream = Pin<Box<dyn Stream<Item = WindowResult> + Send>>;

/// Extract from `pages`, streaming window results in page order.
///
/// Collaborators are resolved leniently, as in [`crate::extract::extract`].
/// An empty page list yields an empty stream.
///
/// # Example
/// ```rust,no_run
/// use edgequake_pricelist::{extract_stream, ExtractionConfig, Page};
/// use futures::StreamExt;
///
/// # #[tokio::main]
/// # async fn main() {
/// let pages = vec![Page::from_text(1, "A-1    Widget    100")];
/// let config = ExtractionConfig::default();
/// let mut windows = extract_stream(pages, &config);
/// while let Some(w) = windows.next().await {
///     println!("pages {}-{}: {} groups ({:?})", w.page_start, w.page_end, w.groups.len(), w.status);
/// }
/// # }
/// ```
pub fn extract_stream(pages: Vec<Page>, config: &ExtractionConfig) -> WindowStream {
    stream_windows(Arc::new(Orchestrator::lenient(config.clone())), pages)
}

/// Stream windows through an already-assembled orchestrator.
pub fn stream_windows(orchestrator: Arc<Orchestrator>, pages: Vec<Page>) -> WindowStream {
    if pages.is_empty() {
        warn!("{}", crate::extract::NO_PAGES_WARNING);
        return Box::pin(stream::empty());
    }

    let pages = Arc::new(pages);
    let state = Arc::new(orchestrator.start(&pages));
    let windows = orchestrator.plan(&pages, &state);

    let s = stream::iter(windows).then(move |window| {
        let orchestrator = Arc::clone(&orchestrator);
        let pages = Arc::clone(&pages);
        let state = Arc::clone(&state);
        async move { orchestrator.run_window(&window, &pages, &state).await }
    });
    Box::pin(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::Status;

    fn offline() -> ExtractionConfig {
        ExtractionConfig::builder()
            .llm_enabled(false)
            .chunk_pages(2)
            .window_pages(2)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn windows_arrive_in_page_order() {
        let pages: Vec<Page> = (1..=5)
            .map(|n| Page::from_text(n, format!("Code    Description    Price\nA-{n}    Widget {n}    {n}00")))
            .collect();
        let windows: Vec<WindowResult> = extract_stream(pages, &offline()).collect().await;
        let ranges: Vec<_> = windows.iter().map(|w| (w.page_start, w.page_end)).collect();
        assert_eq!(ranges, vec![(1, 2), (3, 4), (5, 5)]);
        assert!(windows.iter().all(|w| w.status == Status::Ok));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stream_can_be_driven_from_a_spawned_task() {
        let pages: Vec<Page> = (1..=4)
            .map(|n| Page::from_text(n, format!("Code    Description    Price\nA-{n}    Widget {n}    {n}00")))
            .collect();
        let config = ExtractionConfig::builder()
            .llm_enabled(false)
            .chunk_pages(1)
            .window_pages(2)
            .concurrency(2)
            .build()
            .unwrap();
        let handle = tokio::spawn(async move { extract_stream(pages, &config).collect::<Vec<_>>().await });
        let windows = handle.await.unwrap();
        assert_eq!(windows.len(), 2);
        assert!(windows.iter().all(|w| w.chunks.len() == 2));
    }

    #[tokio::test]
    async fn empty_input_yields_nothing() {
        let windows: Vec<WindowResult> = extract_stream(Vec::new(), &offline()).collect().await;
        assert!(windows.is_empty());
    }
}
