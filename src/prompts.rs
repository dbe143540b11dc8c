//! Prompts for structured price-list extraction and window critique.
//!
//! Callers can override the extraction prompt via
//! [`crate::config::ExtractionConfig::system_prompt`]; the constants here are
//! used only when no override is provided. The critique prompt is fixed
//! because its answer shape is parsed.

use crate::model::Page;
use crate::pipeline::chunk::Chunk;
use serde_json::{json, Value};

/// Default system prompt for turning a chunk of catalog pages into groups.
pub const EXTRACTION_PROMPT: &str = r#"You are an expert at reading product catalogs and price lists. You receive the text of a few consecutive catalog pages, already split into segments (text blocks and tables). Extract every priced product row.

Follow these rules precisely:

1. GROUPS
   - A group is a product family: one heading with the rows listed under it
   - Use the heading text as `title`; use the section or chapter as `category` when visible
   - `specs_headers` lists the column headers of the family's table, in order

2. VARIANTS
   - One variant per priced row
   - `code`: catalog / part / reference number exactly as printed
   - `name`: the row description
   - `pack`: pack size or quantity per unit (e.g. "2/PK", "500 ml")
   - `hsn`: HSN/SAC tariff code; NEVER put it in `code`
   - `gst_percent`: tax rate as a number, without the % sign
   - `price_value`: the unit price as a plain number, no separators or symbols
   - `currency`: ISO code (INR, USD, EUR, GBP) when shown
   - Put any other labelled value (brand, grade, size, CAS number) in `extra`
   - `confidence` between 0 and 1: how sure you are the row is read correctly

3. WHAT TO IGNORE
   - Page numbers, running headers and footers
   - Terms and conditions, addresses, marketing text without prices

4. OUTPUT FORMAT
   - Output ONLY a JSON object: {"groups": [...], "notes": [...], "warnings": [...]}
   - Do NOT wrap in ```json fences
   - Do NOT invent rows or prices that are not on the page
   - If the pages are hard to read, add "low_confidence" to `warnings`"#;

/// System prompt for the window critic.
pub const CRITIQUE_PROMPT: &str = r#"You review machine-extracted price-list data against the raw catalog text it came from. You receive a JSON object with sampled raw segments, a sample of the extracted groups and per-chunk diagnostics.

Decide whether the extraction is faithful. Look for: prices attached to the wrong row, HSN codes used as product codes, rows split across two lines, columns shifted by one, tables that were missed entirely.

Answer ONLY with a JSON object:
{"pass": true|false, "repairs": ["..."], "explanations": ["..."]}

Each repair is one short instruction. Useful instructions are:
- "re-segment page N from raw text"
- "stitch wrapped rows"
- "column N is <code|name|cas|pack|size|hsn|gst|price|currency>"
- "prefer pattern <pattern name>"
- "force price-anchored recovery"
Leave `repairs` empty when `pass` is true."#;

/// JSON schema of the extraction answer, for clients that enforce it.
pub fn extraction_schema() -> Value {
    let nullable_str = json!({ "type": ["string", "null"] });
    let nullable_num = json!({ "type": ["number", "null"] });
    json!({
        "type": "object",
        "required": ["groups"],
        "properties": {
            "groups": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["title", "variants"],
                    "properties": {
                        "title": { "type": "string" },
                        "category": nullable_str,
                        "specs_headers": { "type": "array", "items": { "type": "string" } },
                        "description": nullable_str,
                        "variants": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "properties": {
                                    "code": nullable_str,
                                    "name": nullable_str,
                                    "cas": nullable_str,
                                    "pack": nullable_str,
                                    "size": nullable_str,
                                    "hsn": nullable_str,
                                    "gst_percent": nullable_num,
                                    "price_value": nullable_num,
                                    "currency": nullable_str,
                                    "notes": nullable_str,
                                    "confidence": { "type": "number" },
                                    "extra": { "type": "object" }
                                }
                            }
                        }
                    }
                }
            },
            "notes": { "type": "array", "items": { "type": "string" } },
            "warnings": { "type": "array", "items": { "type": "string" } }
        }
    })
}

/// User message for one chunk: the document context (if any) followed by
/// each page's segments.
pub fn render_chunk_prompt(chunk: &Chunk, pages: &[Page], context: Option<&str>) -> String {
    let mut out = String::new();
    if let Some(ctx) = context {
        out.push_str(ctx);
        out.push('\n');
    }
    out.push_str(&format!(
        "Pages {}-{} of the catalog:\n",
        chunk.page_start, chunk.page_end
    ));
    for page in pages {
        out.push_str(&format!("\n=== Page {} ===\n", page.number));
        for seg in &page.segments {
            let text = seg.render_text();
            if text.trim().is_empty() {
                continue;
            }
            out.push_str(&format!("[{} {}]\n{}\n", seg.kind(), seg.id(), text));
        }
    }
    out
}
