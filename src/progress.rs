//! Progress-callback trait for chunk and window events.
//!
//! Inject an [`Arc<dyn ExtractionProgressCallback>`] via
//! [`crate::config::ExtractionConfigBuilder::progress_callback`] to receive
//! events as the orchestrator works through a document.
//!
//! # Example
//!
//! ```rust
//! use edgequake_pricelist::{ChunkSource, ExtractionConfig, ExtractionProgressCallback};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     chunks: AtomicUsize,
//! }
//!
//! impl ExtractionProgressCallback for CountingCallback {
//!     fn on_chunk_complete(&self, chunk_id: &str, source: ChunkSource, groups: usize) {
//!         self.chunks.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("{chunk_id}: {groups} groups via {source:?}");
//!     }
//! }
//!
//! let config = ExtractionConfig::builder()
//!     .progress_callback(Arc::new(CountingCallback { chunks: AtomicUsize::new(0) }))
//!     .build()
//!     .unwrap();
//! ```

use crate::output::{ChunkSource, Status};
use std::sync::Arc;

/// Called by the orchestrator as it processes chunks and windows.
///
/// All methods have default no-op implementations so callers only override
/// what they care about.
///
/// # Thread safety
///
/// Chunks within a window run concurrently, so `on_chunk_start` and
/// `on_chunk_complete` may be called from several tasks at once. Repair
/// passes re-run chunks, so one window can report the same chunk id more
/// than once.
pub trait ExtractionProgressCallback: Send + Sync {
    /// Called once before the first window, with the baseline chunk count.
    fn on_extraction_start(&self, total_windows: usize, total_chunks: usize) {
        let _ = (total_windows, total_chunks);
    }

    fn on_chunk_start(&self, chunk_id: &str, page_start: usize, page_end: usize) {
        let _ = (chunk_id, page_start, page_end);
    }

    /// `groups` is the number of groups the chunk contributed.
    fn on_chunk_complete(&self, chunk_id: &str, source: ChunkSource, groups: usize) {
        let _ = (chunk_id, source, groups);
    }

    /// Called after a window's critique/repair loop settles.
    fn on_window_complete(&self, window_index: usize, status: Status, repair_attempts: u32) {
        let _ = (window_index, status, repair_attempts);
    }

    fn on_extraction_complete(&self, status: Status, total_groups: usize) {
        let _ = (status, total_groups);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl ExtractionProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::ExtractionConfig`].
pub type ProgressCallback = Arc<dyn ExtractionProgressCallback>;
