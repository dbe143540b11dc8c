//! Document context: what earlier chunks taught us, fed to later prompts.
//!
//! Workers record their accepted groups as they finish; later chunks render
//! the accumulated columns, brands, categories and codes into their user
//! prompt, plus a short summary of the most recent chunks. Completion order
//! decides what a given chunk sees, so the content is best-effort. Nothing
//! downstream depends on it for correctness.

use crate::output::{Group, Scalar};
use crate::pipeline::chunk::Chunk;
use std::collections::VecDeque;
use std::sync::Mutex;

const MAX_COLUMNS: usize = 24;
const MAX_BRANDS: usize = 24;
const MAX_CATEGORIES: usize = 24;
const MAX_CODES: usize = 40;
const MAX_SUMMARIES: usize = 3;

/// Point-in-time copy of the accumulated context.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextSnapshot {
    pub columns: Vec<String>,
    pub brands: Vec<String>,
    pub categories: Vec<String>,
    pub codes: Vec<String>,
    pub recent: Vec<String>,
}

impl ContextSnapshot {
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
            && self.brands.is_empty()
            && self.categories.is_empty()
            && self.codes.is_empty()
            && self.recent.is_empty()
    }

    /// Prompt fragment, or `None` when nothing has been learned yet.
    pub fn render(&self) -> Option<String> {
        if self.is_empty() {
            return None;
        }
        let mut out = String::from("Context from earlier pages of this document:\n");
        let mut line = |label: &str, items: &[String]| {
            if !items.is_empty() {
                out.push_str(&format!("- {label}: {}\n", items.join(", ")));
            }
        };
        line("Columns seen", &self.columns);
        line("Brands seen", &self.brands);
        line("Categories seen", &self.categories);
        line("Product codes seen", &self.codes);
        if !self.recent.is_empty() {
            out.push_str("- Recent chunks:\n");
            for s in &self.recent {
                out.push_str(&format!("  - {s}\n"));
            }
        }
        Some(out)
    }
}

#[derive(Debug, Default)]
struct ContextState {
    columns: Vec<String>,
    brands: Vec<String>,
    categories: Vec<String>,
    codes: Vec<String>,
    recent: VecDeque<String>,
}

fn push_bounded(list: &mut Vec<String>, value: &str, cap: usize) {
    let value = value.trim();
    if value.is_empty() || list.len() >= cap {
        return;
    }
    if !list.iter().any(|v| v.eq_ignore_ascii_case(value)) {
        list.push(value.to_string());
    }
}

/// Shared, append-only accumulator.
#[derive(Debug, Default)]
pub struct DocumentContext {
    state: Mutex<ContextState>,
}

impl DocumentContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one chunk's accepted groups into the context.
    pub fn record(&self, chunk: &Chunk, groups: &[Group]) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let mut variants = 0usize;
        for g in groups {
            for h in &g.specs_headers {
                push_bounded(&mut state.columns, h, MAX_COLUMNS);
            }
            if let Some(ref c) = g.category {
                push_bounded(&mut state.categories, c, MAX_CATEGORIES);
            }
            for v in &g.variants {
                variants += 1;
                if let Some(ref code) = v.code {
                    push_bounded(&mut state.codes, code, MAX_CODES);
                }
                if let Some(Scalar::Text(brand)) = v.extra.get("brand") {
                    push_bounded(&mut state.brands, brand, MAX_BRANDS);
                }
            }
        }

        let titles: Vec<&str> = groups.iter().take(3).map(|g| g.title.as_str()).collect();
        let summary = format!(
            "pages {}-{}: {} groups ({}), {} variants",
            chunk.page_start,
            chunk.page_end,
            groups.len(),
            titles.join("; "),
            variants
        );
        state.recent.push_back(summary);
        while state.recent.len() > MAX_SUMMARIES {
            state.recent.pop_front();
        }
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        ContextSnapshot {
            columns: state.columns.clone(),
            brands: state.brands.clone(),
            categories: state.categories.clone(),
            codes: state.codes.clone(),
            recent: state.recent.iter().cloned().collect(),
        }
    }

    pub fn render(&self) -> Option<String> {
        self.snapshot().render()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Page;
    use crate::output::Variant;
    use crate::pipeline::chunk::chunk_pages;

    #[test]
    fn empty_context_renders_nothing() {
        assert!(DocumentContext::new().render().is_none());
    }

    #[test]
    fn records_are_bounded_and_deduplicated() {
        let pages: Vec<Page> = (1..=5).map(|i| Page::from_text(i, "x")).collect();
        let chunks = chunk_pages("doc", &pages, 1);
        let ctx = DocumentContext::new();
        for chunk in &chunks {
            let mut v = Variant {
                code: Some(format!("C-{}", chunk.ordinal)),
                ..Variant::default()
            };
            v.extra.insert("brand".into(), Scalar::Text("Acme".into()));
            let g = Group {
                title: "Buffers".into(),
                category: Some("Reagents".into()),
                specs_headers: vec!["Code".into(), "code".into()],
                variants: vec![v],
                ..Group::default()
            };
            ctx.record(chunk, &[g]);
        }
        let snap = ctx.snapshot();
        assert_eq!(snap.columns, vec!["Code"]);
        assert_eq!(snap.brands, vec!["Acme"]);
        assert_eq!(snap.codes.len(), 5);
        assert_eq!(snap.recent.len(), 3);
        assert!(snap.recent[2].starts_with("pages 5-5"));
        let rendered = snap.render().unwrap();
        assert!(rendered.contains("Categories seen: Reagents"));
    }
}
