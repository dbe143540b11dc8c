//! Chunker: partition pages into content-addressed work units.
//!
//! A [`Chunk`] is a contiguous page range with an identifier derived from its
//! scope (document or window id) and ordinal, plus a SHA-256 hash over every
//! segment's content. Both are pure functions of the input, so re-running the
//! same pages reproduces the same ids and hashes; the response cache relies on
//! that to turn re-runs into cache hits.

use crate::model::{Page, Segment};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;

/// A bounded, content-hashed page range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub ordinal: usize,
    /// First page number (inclusive).
    pub page_start: usize,
    /// Last page number (inclusive).
    pub page_end: usize,
    /// Index range into the page slice the chunk was built from.
    pub start_index: usize,
    pub end_index: usize,
    pub content_hash: String,
}

impl Chunk {
    /// The pages this chunk covers, out of the slice it was built from.
    pub fn pages<'a>(&self, pages: &'a [Page]) -> &'a [Page] {
        &pages[self.start_index..self.end_index]
    }

    pub fn page_count(&self) -> usize {
        self.end_index - self.start_index
    }
}

/// A larger page range processed by the windowed orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub id: String,
    pub index: usize,
    pub page_start: usize,
    pub page_end: usize,
    pub start_index: usize,
    pub end_index: usize,
}

impl Window {
    pub fn pages<'a>(&self, pages: &'a [Page]) -> &'a [Page] {
        &pages[self.start_index..self.end_index]
    }
}

/// SHA-256 over every segment's kind, id and content, hex encoded.
pub fn content_hash(pages: &[Page]) -> String {
    let mut hasher = Sha256::new();
    for page in pages {
        hasher.update(format!("page:{}\x1e", page.number).as_bytes());
        for seg in &page.segments {
            hasher.update(seg.kind().as_bytes());
            hasher.update(b"\x1f");
            hasher.update(seg.id().as_bytes());
            hasher.update(b"\x1f");
            match seg {
                Segment::Text { text, .. } => hasher.update(text.as_bytes()),
                Segment::Table {
                    header,
                    rows,
                    source_rows,
                    ..
                } => {
                    hasher.update(header.join("\x1f").as_bytes());
                    for row in rows {
                        hasher.update(b"\x1e");
                        hasher.update(row.join("\x1f").as_bytes());
                    }
                    for raw in source_rows {
                        hasher.update(b"\x1d");
                        hasher.update(raw.as_bytes());
                    }
                }
                Segment::Image { caption, .. } => {
                    hasher.update(caption.as_deref().unwrap_or("").as_bytes())
                }
            }
            hasher.update(b"\x1e");
        }
    }
    format!("{:x}", hasher.finalize())
}

/// Stable document identity: a short prefix of the whole-document hash.
pub fn document_id(pages: &[Page]) -> String {
    let hash = content_hash(pages);
    format!("doc-{}", &hash[..16])
}

fn chunk_id(scope: &str, ordinal: usize) -> String {
    format!("{scope}-c{ordinal:03}")
}

/// Split `pages` into consecutive chunks of at most `target` pages.
///
/// The last chunk may be smaller. `target == 0` is treated as 1.
pub fn chunk_pages(scope: &str, pages: &[Page], target: usize) -> Vec<Chunk> {
    let target = target.max(1);
    pages
        .chunks(target)
        .enumerate()
        .map(|(ordinal, slice)| {
            let start_index = ordinal * target;
            Chunk {
                id: chunk_id(scope, ordinal),
                ordinal,
                page_start: slice.first().map_or(0, |p| p.number),
                page_end: slice.last().map_or(0, |p| p.number),
                start_index,
                end_index: start_index + slice.len(),
                content_hash: content_hash(slice),
            }
        })
        .collect()
}

/// Re-chunk while reusing prior identifiers for unchanged page ranges.
///
/// A chunk whose `(page_start, page_end)` matches a prior chunk inherits that
/// chunk's id; its hash is always recomputed so changed content still misses
/// the cache. Remaining chunks get ordinal ids, suffixed with their page range
/// when the ordinal id is already taken by an inherited one.
pub fn rechunk_stable(scope: &str, pages: &[Page], target: usize, prior: &[Chunk]) -> Vec<Chunk> {
    let mut fresh = chunk_pages(scope, pages, target);
    let mut inherited = vec![false; fresh.len()];
    let mut used: HashSet<String> = HashSet::new();

    for (i, chunk) in fresh.iter_mut().enumerate() {
        if let Some(old) = prior
            .iter()
            .find(|p| p.page_start == chunk.page_start && p.page_end == chunk.page_end)
        {
            if used.insert(old.id.clone()) {
                chunk.id = old.id.clone();
                inherited[i] = true;
            }
        }
    }

    for (i, chunk) in fresh.iter_mut().enumerate() {
        if inherited[i] {
            continue;
        }
        if used.contains(&chunk.id) {
            chunk.id = format!("{}-p{}-{}", chunk.id, chunk.page_start, chunk.page_end);
        }
        used.insert(chunk.id.clone());
    }

    fresh
}

/// Split the document into windows of at most `window_pages` pages.
pub fn windows(document_id: &str, pages: &[Page], window_pages: usize) -> Vec<Window> {
    let size = window_pages.max(1);
    pages
        .chunks(size)
        .enumerate()
        .map(|(index, slice)| {
            let start_index = index * size;
            Window {
                id: format!("{document_id}-w{index:02}"),
                index,
                page_start: slice.first().map_or(0, |p| p.number),
                page_end: slice.last().map_or(0, |p| p.number),
                start_index,
                end_index: start_index + slice.len(),
            }
        })
        .collect()
}
