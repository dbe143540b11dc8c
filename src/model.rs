//! Page model produced by the upstream PDF/OCR stage.
//!
//! The extraction pipeline never looks at PDF bytes. It receives an ordered
//! list of [`Page`]s, each a flat list of typed [`Segment`]s, and treats them
//! as immutable for the whole run. Repair adjustments always operate on a
//! clone.

use crate::error::ExtractError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One page of the source document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    /// 1-indexed page number as printed by the extractor.
    pub number: usize,
    #[serde(default)]
    pub segments: Vec<Segment>,
}

/// Axis-aligned box in PDF user-space units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

/// A typed region on a page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Segment {
    Text {
        id: String,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bbox: Option<BoundingBox>,
    },
    Table {
        id: String,
        #[serde(default)]
        header: Vec<String>,
        #[serde(default)]
        rows: Vec<Vec<String>>,
        /// Raw text of each source row before cell splitting, when the
        /// extractor kept it. Used by re-segmentation.
        #[serde(default)]
        source_rows: Vec<String>,
    },
    Image {
        id: String,
        #[serde(default)]
        caption: Option<String>,
    },
}

impl Segment {
    pub fn id(&self) -> &str {
        match self {
            Segment::Text { id, .. } | Segment::Table { id, .. } | Segment::Image { id, .. } => id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Segment::Text { .. } => "text",
            Segment::Table { .. } => "table",
            Segment::Image { .. } => "image",
        }
    }

    /// Plain-text rendering used for prompts and critique excerpts.
    pub fn render_text(&self) -> String {
        match self {
            Segment::Text { text, .. } => text.clone(),
            Segment::Table { header, rows, .. } => {
                let mut out = Vec::with_capacity(rows.len() + 1);
                if !header.is_empty() {
                    out.push(format!("| {} |", header.join(" | ")));
                }
                for row in rows {
                    out.push(format!("| {} |", row.join(" | ")));
                }
                out.join("\n")
            }
            Segment::Image { caption, .. } => caption.clone().unwrap_or_default(),
        }
    }
}

impl Page {
    pub fn new(number: usize, segments: Vec<Segment>) -> Self {
        Self { number, segments }
    }

    /// Convenience constructor: one text segment per page.
    pub fn from_text(number: usize, text: impl Into<String>) -> Self {
        Self {
            number,
            segments: vec![Segment::Text {
                id: format!("p{number}-t0"),
                text: text.into(),
                bbox: None,
            }],
        }
    }

    /// All segment text joined with blank lines.
    pub fn render_text(&self) -> String {
        self.segments
            .iter()
            .map(Segment::render_text)
            .filter(|s| !s.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// On-disk page model: either a bare array of pages or `{ "pages": [...] }`.
#[derive(Deserialize)]
#[serde(untagged)]
enum PageModelFile {
    Bare(Vec<Page>),
    Wrapped { pages: Vec<Page> },
}

/// Parse a page-model JSON document.
pub fn parse_pages(json: &str) -> Result<Vec<Page>, serde_json::Error> {
    let file: PageModelFile = serde_json::from_str(json)?;
    let mut pages = match file {
        PageModelFile::Bare(p) => p,
        PageModelFile::Wrapped { pages } => pages,
    };
    pages.sort_by_key(|p| p.number);
    Ok(pages)
}

/// Load a page-model JSON file from disk.
pub async fn load_pages(path: impl AsRef<Path>) -> Result<Vec<Page>, ExtractError> {
    let path = path.as_ref();
    let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ExtractError::FileNotFound {
                path: path.to_path_buf(),
            }
        } else {
            ExtractError::ReadFailed {
                path: path.to_path_buf(),
                source: e,
            }
        }
    })?;
    parse_pages(&raw).map_err(|e| ExtractError::InvalidPageModel {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_and_wrapped_forms() {
        let bare = r#"[{"number":2,"segments":[]},{"number":1,"segments":[{"kind":"text","id":"a","text":"hi"}]}]"#;
        let pages = parse_pages(bare).unwrap();
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].number, 1, "pages are sorted by number");

        let wrapped = r#"{"pages":[{"number":1,"segments":[{"kind":"image","id":"i"}]}]}"#;
        let pages = parse_pages(wrapped).unwrap();
        assert_eq!(pages[0].segments[0].kind(), "image");
    }

    #[test]
    fn table_renders_as_pipe_rows() {
        let seg = Segment::Table {
            id: "t".into(),
            header: vec!["Code".into(), "Price".into()],
            rows: vec![vec!["A-1".into(), "100".into()]],
            source_rows: vec![],
        };
        assert_eq!(seg.render_text(), "| Code | Price |\n| A-1 | 100 |");
    }

    #[tokio::test]
    async fn load_missing_file_is_file_not_found() {
        let err = load_pages("/definitely/not/here.json").await.unwrap_err();
        assert!(matches!(err, ExtractError::FileNotFound { .. }));
    }

    #[tokio::test]
    async fn load_invalid_json_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pages.json");
        std::fs::write(&path, "not json").unwrap();
        let err = load_pages(&path).await.unwrap_err();
        assert!(matches!(err, ExtractError::InvalidPageModel { .. }));
    }
}
