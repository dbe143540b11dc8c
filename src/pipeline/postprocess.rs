//! Post-processing: deterministic cleanup of model-generated group payloads.
//!
//! Even a well-prompted model occasionally returns output that is
//! *semantically* right but *structurally* loose:
//!
//! - Wrapping the JSON in ` ```json ... ``` ` fences despite the prompt
//! - Writing prices as strings (`"₹1,250.00"`, `"Rs. 450/-"`)
//! - Using currency symbols instead of ISO codes
//! - Confidence outside `[0, 1]`, duplicate `specs_headers`, ragged whitespace
//!
//! These rules fix model quirks without touching content, so the prompt can
//! stay focused on *what to extract*. The same normalisation runs over the
//! deterministic extractor's output, which keeps the merger's inputs uniform.

use crate::output::{Group, Scalar, Variant};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::HashSet;

/// Confidence assumed for model-emitted variants that omit one.
pub const DEFAULT_LLM_CONFIDENCE: f64 = 0.8;

// ── Rule 1: Strip outer JSON fences ──────────────────────────────────────

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```(?:json|JSON)?\s*\n(.*?)\n?```\s*$").unwrap());

/// Remove a surrounding ```` ```json ```` fence if present.
pub fn strip_json_fences(input: &str) -> String {
    let trimmed = input.trim().trim_start_matches('\u{feff}');
    if let Some(caps) = RE_OUTER_FENCES.captures(trimmed) {
        caps[1].trim().to_string()
    } else {
        trimmed.to_string()
    }
}

// ── Rule 2: Whitespace ───────────────────────────────────────────────────

static RE_WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Trim and collapse internal whitespace runs to a single space.
pub fn collapse_whitespace(input: &str) -> String {
    RE_WS.replace_all(input.trim(), " ").to_string()
}

fn clean_opt(value: Option<String>) -> Option<String> {
    value
        .map(|s| collapse_whitespace(&s))
        .filter(|s| !s.is_empty())
}

// ── Rule 3: Currency ─────────────────────────────────────────────────────

/// Map a currency symbol or name to its ISO 4217 code.
///
/// Unknown three-letter alphabetic codes pass through upper-cased; anything
/// else is dropped.
pub fn normalize_currency(raw: &str) -> Option<String> {
    let s = raw.trim().trim_end_matches('.').to_lowercase();
    let code = match s.as_str() {
        "" => return None,
        "₹" | "rs" | "inr" | "rupees" | "rupee" => "INR",
        "$" | "us$" | "usd" | "dollar" | "dollars" => "USD",
        "€" | "eur" | "euro" | "euros" => "EUR",
        "£" | "gbp" => "GBP",
        other if other.len() == 3 && other.chars().all(|c| c.is_ascii_alphabetic()) => {
            return Some(other.to_uppercase())
        }
        _ => return None,
    };
    Some(code.to_string())
}

static RE_CURRENCY_MARK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(₹|\$|€|£|\brs\.?|\binr\b|\busd\b|\beur\b|\bgbp\b)").unwrap());

static RE_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d[\d,]*(?:\.\d+)?|\.\d+").unwrap());

// ── Rule 4: Prices ───────────────────────────────────────────────────────

/// Parse a price written as text.
///
/// Accepts thousands separators (Western and Indian grouping), a leading or
/// trailing currency marker and a trailing `/-`. Returns the value and the
/// detected ISO currency, if any.
pub fn parse_price(raw: &str) -> Option<(f64, Option<String>)> {
    let currency = RE_CURRENCY_MARK
        .find(raw)
        .and_then(|m| normalize_currency(m.as_str()));
    let number = RE_NUMBER.find(raw)?;
    let value: f64 = number.as_str().replace(',', "").parse().ok()?;
    value.is_finite().then_some((value, currency))
}

fn number_from(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_price(s).map(|(v, _)| v),
        _ => None,
    }
}

fn text_from(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

// ── JSON → Group ─────────────────────────────────────────────────────────

/// Build a [`Group`] from one element of the model's `groups` array.
///
/// Errors when the element is not an object, lacks a string `title`, or has
/// a `variants` value that is not an array of objects.
pub fn group_from_json(raw: &Value, default_confidence: f64) -> Result<Group, String> {
    let obj = raw.as_object().ok_or("not an object")?;
    let title = obj
        .get("title")
        .and_then(Value::as_str)
        .ok_or("missing string `title`")?;
    let variants_raw = obj
        .get("variants")
        .and_then(Value::as_array)
        .ok_or("missing `variants` array")?;

    let mut variants = Vec::with_capacity(variants_raw.len());
    for (i, v) in variants_raw.iter().enumerate() {
        let vobj = v
            .as_object()
            .ok_or_else(|| format!("variant {i} is not an object"))?;
        variants.push(variant_from_json(vobj, default_confidence));
    }

    Ok(Group {
        title: title.to_string(),
        category: obj.get("category").and_then(text_from),
        specs_headers: obj
            .get("specs_headers")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(text_from).collect())
            .unwrap_or_default(),
        description: obj.get("description").and_then(text_from),
        variants,
    })
}

fn variant_from_json(obj: &serde_json::Map<String, Value>, default_confidence: f64) -> Variant {
    let mut v = Variant {
        confidence: default_confidence,
        ..Variant::default()
    };
    let mut currency_hint = None;

    for (key, value) in obj {
        if value.is_null() {
            continue;
        }
        match key.as_str() {
            "code" | "sku" | "cat_no" | "catalog_no" => v.code = v.code.take().or(text_from(value)),
            "name" | "product" | "description" => v.name = v.name.take().or(text_from(value)),
            "cas" | "cas_no" | "cas_number" => v.cas = text_from(value),
            "pack" | "pack_size" => v.pack = text_from(value),
            "size" => v.size = text_from(value),
            "hsn" | "hsn_code" => v.hsn = text_from(value),
            "gst_percent" | "gst" => v.gst_percent = number_from(value),
            "price_value" | "price" => {
                if v.price_value.is_none() {
                    match value {
                        Value::String(s) => {
                            if let Some((p, cur)) = parse_price(s) {
                                v.price_value = Some(p);
                                currency_hint = cur;
                            }
                        }
                        other => v.price_value = number_from(other),
                    }
                }
            }
            "currency" => v.currency = text_from(value),
            "notes" => v.notes = text_from(value),
            "confidence" => {
                if let Some(c) = number_from(value) {
                    v.confidence = c;
                }
            }
            "fields_present" | "provenance" => {}
            other => match value {
                Value::Number(n) => {
                    if let Some(f) = n.as_f64() {
                        v.extra.insert(other.to_string(), Scalar::Number(f));
                    }
                }
                Value::String(s) if !s.trim().is_empty() => {
                    v.extra
                        .insert(other.to_string(), Scalar::Text(s.trim().to_string()));
                }
                _ => {}
            },
        }
    }

    if v.currency.is_none() {
        v.currency = currency_hint;
    }
    v
}

// ── Normalisation pass ───────────────────────────────────────────────────

/// Clean every group and variant in place.
pub fn normalize_groups(groups: Vec<Group>) -> Vec<Group> {
    groups.into_iter().map(normalize_group).collect()
}

fn normalize_group(mut group: Group) -> Group {
    group.title = collapse_whitespace(&group.title);
    group.category = clean_opt(group.category.take());
    group.description = clean_opt(group.description.take());

    let mut seen = HashSet::new();
    group.specs_headers = group
        .specs_headers
        .iter()
        .map(|h| collapse_whitespace(h))
        .filter(|h| !h.is_empty() && seen.insert(h.to_lowercase()))
        .collect();

    group.variants = group.variants.into_iter().map(normalize_variant).collect();
    group
}

/// Clean one variant: whitespace, currency code, non-finite numbers,
/// confidence clamp, `fields_present`.
pub fn normalize_variant(mut v: Variant) -> Variant {
    v.code = clean_opt(v.code.take());
    v.name = clean_opt(v.name.take());
    v.cas = clean_opt(v.cas.take());
    v.pack = clean_opt(v.pack.take());
    v.size = clean_opt(v.size.take());
    v.hsn = clean_opt(v.hsn.take());
    v.notes = clean_opt(v.notes.take());
    v.currency = v.currency.take().and_then(|c| normalize_currency(&c));
    v.price_value = v.price_value.filter(|p| p.is_finite());
    v.gst_percent = v.gst_percent.filter(|g| g.is_finite());
    v.refreshed()
}

// ── Validation ───────────────────────────────────────────────────────────

/// Structural checks over a final group set. Never fails the run; the
/// messages end up in `DocumentResult::validation_errors`.
pub fn validate_groups(groups: &[Group]) -> Vec<String> {
    let mut errors = Vec::new();
    for (gi, group) in groups.iter().enumerate() {
        let label = if group.title.trim().is_empty() {
            errors.push(format!("group {gi}: empty title"));
            format!("group {gi}")
        } else {
            format!("group '{}'", group.title)
        };
        if group.variants.is_empty() {
            errors.push(format!("{label}: no variants"));
        }
        for (vi, v) in group.variants.iter().enumerate() {
            if !v.has_field("code") && !v.has_field("name") {
                errors.push(format!("{label} variant {vi}: neither code nor name"));
            }
            match v.price_value {
                Some(p) if p < 0.0 => {
                    errors.push(format!("{label} variant {vi} ({}): negative price {p}", v.label()))
                }
                None => errors.push(format!(
                    "{label} variant {vi} ({}): warning: no price",
                    v.label()
                )),
                _ => {}
            }
        }
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strips_json_fences() {
        assert_eq!(strip_json_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_json_fences("```\n{}\n```\n"), "{}");
        assert_eq!(strip_json_fences("  {\"a\":1} "), "{\"a\":1}");
    }

    #[test]
    fn parses_prices_with_separators_and_symbols() {
        assert_eq!(parse_price("₹1,250.00"), Some((1250.0, Some("INR".into()))));
        assert_eq!(parse_price("Rs. 1,25,000/-"), Some((125000.0, Some("INR".into()))));
        assert_eq!(parse_price("$ 12.5"), Some((12.5, Some("USD".into()))));
        assert_eq!(parse_price("450"), Some((450.0, None)));
        assert_eq!(parse_price("n/a"), None);
    }

    #[test]
    fn currency_symbols_map_to_iso() {
        assert_eq!(normalize_currency("₹").as_deref(), Some("INR"));
        assert_eq!(normalize_currency("Rs.").as_deref(), Some("INR"));
        assert_eq!(normalize_currency("€").as_deref(), Some("EUR"));
        assert_eq!(normalize_currency("chf").as_deref(), Some("CHF"));
        assert_eq!(normalize_currency("per pack"), None);
    }

    #[test]
    fn group_from_json_normalises_variants() {
        let raw = json!({
            "title": "  pH   Buffers ",
            "specs_headers": ["Code", "code", "Price"],
            "variants": [
                {"code": "B-1", "price": "₹ 1,200", "confidence": 3, "brand": "Acme", "hsn": 38220090}
            ]
        });
        let group = normalize_groups(vec![group_from_json(&raw, 0.8).unwrap()]).remove(0);
        assert_eq!(group.title, "pH Buffers");
        assert_eq!(group.specs_headers, vec!["Code", "Price"]);
        let v = &group.variants[0];
        assert_eq!(v.price_value, Some(1200.0));
        assert_eq!(v.currency.as_deref(), Some("INR"));
        assert_eq!(v.confidence, 1.0);
        assert_eq!(v.hsn.as_deref(), Some("38220090"));
        assert_eq!(v.extra["brand"], Scalar::Text("Acme".into()));
        assert!(v.fields_present.contains(&"price_value".to_string()));
    }

    #[test]
    fn group_without_title_is_rejected() {
        assert!(group_from_json(&json!({"variants": []}), 0.8).is_err());
        assert!(group_from_json(&json!({"title": "x", "variants": [1]}), 0.8).is_err());
        assert!(group_from_json(&json!("x"), 0.8).is_err());
    }

    #[test]
    fn missing_confidence_uses_default() {
        let g = group_from_json(&json!({"title": "t", "variants": [{"code": "A"}]}), 0.8).unwrap();
        assert_eq!(g.variants[0].confidence, 0.8);
    }

    #[test]
    fn validation_reports_structural_problems() {
        let groups = vec![
            Group::new(""),
            Group {
                title: "Buffers".into(),
                variants: vec![
                    Variant::default(),
                    Variant {
                        code: Some("A".into()),
                        price_value: Some(-1.0),
                        ..Variant::default()
                    },
                ],
                ..Group::default()
            },
        ];
        let errors = validate_groups(&groups);
        assert!(errors.iter().any(|e| e.contains("empty title")));
        assert!(errors.iter().any(|e| e.contains("no variants")));
        assert!(errors.iter().any(|e| e.contains("neither code nor name")));
        assert!(errors.iter().any(|e| e.contains("negative price")));
        assert!(errors.iter().any(|e| e.contains("no price")));
    }
}
