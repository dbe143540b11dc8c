//! Chunk merger: fold per-chunk (or per-window) groups into one catalog.
//!
//! Groups merge on normalised title. Within a group, variants merge on their
//! [`merge_key`]; the first occurrence is the base record and later ones are
//! folded in field by field. Whenever two variants compete, the winner is
//! decided by [`variant_precedence`], the single ordering used across the
//! crate:
//!
//! 1. higher confidence
//! 2. more populated recognised fields
//! 3. longer name
//! 4. earlier occurrence
//!
//! Differing non-null prices under one key are recorded as a
//! [`PriceConflict`] and resolved by the same rule.

use crate::output::{Group, PriceConflict, Variant};
use crate::pipeline::postprocess::collapse_whitespace;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

/// Lower-case, trim, collapse whitespace.
pub fn normalize_key(s: &str) -> String {
    collapse_whitespace(s).to_lowercase()
}

fn norm_opt(v: &Option<String>) -> String {
    v.as_deref().map(normalize_key).unwrap_or_default()
}

/// Deduplication identity of a variant.
///
/// Normalised code when present, otherwise name + pack + size. A variant
/// with none of those falls back to its remaining identifying values so that
/// unrelated anonymous rows do not collapse into one.
pub fn merge_key(v: &Variant) -> String {
    let code = norm_opt(&v.code);
    if !code.is_empty() {
        return format!("code:{code}");
    }
    let (name, pack, size) = (norm_opt(&v.name), norm_opt(&v.pack), norm_opt(&v.size));
    if !(name.is_empty() && pack.is_empty() && size.is_empty()) {
        return format!("name:{name}|{pack}|{size}");
    }
    format!(
        "anon:{}|{}|{}|{}",
        v.price_value.map(|p| p.to_string()).unwrap_or_default(),
        norm_opt(&v.cas),
        norm_opt(&v.hsn),
        norm_opt(&v.notes),
    )
}

/// Total precedence order. `Greater` means `a` wins over `b`.
///
/// Occurrence order is the caller's final tiebreak: on `Equal` the earlier
/// variant is kept.
pub fn variant_precedence(a: &Variant, b: &Variant) -> Ordering {
    a.confidence
        .partial_cmp(&b.confidence)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.populated_count().cmp(&b.populated_count()))
        .then_with(|| a.name_len().cmp(&b.name_len()))
}

fn pick<T: Clone>(base: &Option<T>, incoming: &Option<T>, incoming_wins: bool) -> Option<T> {
    match (base, incoming) {
        (Some(_), Some(i)) if incoming_wins => Some(i.clone()),
        (Some(b), _) => Some(b.clone()),
        (None, i) => i.clone(),
    }
}

fn blank_to_none(v: &Option<String>) -> Option<String> {
    v.as_ref().filter(|s| !s.trim().is_empty()).cloned()
}

/// Field-by-field fold of `incoming` into `base`.
fn merge_variant(base: &Variant, incoming: &Variant) -> Variant {
    let incoming_wins = variant_precedence(incoming, base) == Ordering::Greater;
    let text = |b: &Option<String>, i: &Option<String>| {
        pick(&blank_to_none(b), &blank_to_none(i), incoming_wins)
    };

    let mut extra = base.extra.clone();
    for (k, val) in &incoming.extra {
        if incoming_wins || !extra.contains_key(k) {
            extra.insert(k.clone(), val.clone());
        }
    }

    Variant {
        code: text(&base.code, &incoming.code),
        name: text(&base.name, &incoming.name),
        cas: text(&base.cas, &incoming.cas),
        pack: text(&base.pack, &incoming.pack),
        size: text(&base.size, &incoming.size),
        hsn: text(&base.hsn, &incoming.hsn),
        gst_percent: pick(&base.gst_percent, &incoming.gst_percent, incoming_wins),
        price_value: pick(&base.price_value, &incoming.price_value, incoming_wins),
        currency: text(&base.currency, &incoming.currency),
        notes: text(&base.notes, &incoming.notes),
        confidence: base.confidence.max(incoming.confidence),
        fields_present: Vec::new(),
        extra,
        provenance: if incoming_wins {
            incoming.provenance.clone()
        } else {
            base.provenance.clone()
        },
    }
    .refreshed()
}

fn chunk_of(v: &Variant) -> String {
    v.provenance
        .as_ref()
        .map(|p| p.chunk_id.clone())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Result of a merge.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeOutcome {
    pub groups: Vec<Group>,
    pub price_conflicts: Vec<PriceConflict>,
}

/// Incremental merger. Feed groups in occurrence order, then [`finish`].
///
/// [`finish`]: ChunkMerger::finish
#[derive(Debug, Default)]
pub struct ChunkMerger {
    groups: Vec<Group>,
    by_title: HashMap<String, usize>,
    by_key: Vec<HashMap<String, usize>>,
    header_seen: Vec<HashSet<String>>,
    conflicts: Vec<PriceConflict>,
}

impl ChunkMerger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_groups(&mut self, groups: &[Group]) {
        for g in groups {
            self.add_group(g);
        }
    }

    pub fn add_group(&mut self, group: &Group) {
        let title_key = normalize_key(&group.title);
        let gi = match self.by_title.get(&title_key) {
            Some(&gi) => gi,
            None => {
                let gi = self.groups.len();
                self.groups.push(Group {
                    title: collapse_whitespace(&group.title),
                    category: None,
                    specs_headers: Vec::new(),
                    description: None,
                    variants: Vec::new(),
                });
                self.by_title.insert(title_key, gi);
                self.by_key.push(HashMap::new());
                self.header_seen.push(HashSet::new());
                gi
            }
        };

        let target = &mut self.groups[gi];
        if target.category.is_none() {
            target.category = blank_to_none(&group.category);
        }
        if target.description.is_none() {
            target.description = blank_to_none(&group.description);
        }
        for header in &group.specs_headers {
            let key = normalize_key(header);
            if !key.is_empty() && self.header_seen[gi].insert(key) {
                target.specs_headers.push(collapse_whitespace(header));
            }
        }

        for incoming in &group.variants {
            let key = merge_key(incoming);
            match self.by_key[gi].get(&key) {
                None => {
                    self.by_key[gi].insert(key, target.variants.len());
                    target.variants.push(incoming.clone());
                }
                Some(&vi) => {
                    let base = &target.variants[vi];
                    let merged = merge_variant(base, incoming);
                    if let (Some(bp), Some(ip)) = (base.price_value, incoming.price_value) {
                        if (bp - ip).abs() > f64::EPSILON * bp.abs().max(ip.abs()).max(1.0) {
                            self.conflicts.push(PriceConflict {
                                merge_key: key,
                                label: merged.label(),
                                chunk_ids: vec![chunk_of(base), chunk_of(incoming)],
                                values: vec![bp, ip],
                                resolved: merged.price_value.unwrap_or(bp),
                            });
                        }
                    }
                    target.variants[vi] = merged;
                }
            }
        }
    }

    pub fn finish(self) -> MergeOutcome {
        MergeOutcome {
            groups: self.groups,
            price_conflicts: self.conflicts,
        }
    }
}

/// Merge several group sets, in order.
pub fn merge_group_sets<'a, I>(sets: I) -> MergeOutcome
where
    I: IntoIterator<Item = &'a [Group]>,
{
    let mut merger = ChunkMerger::new();
    for set in sets {
        merger.add_groups(set);
    }
    merger.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::{ChunkSource, Provenance};

    fn variant(code: &str, price: f64, confidence: f64, chunk: &str) -> Variant {
        Variant {
            code: Some(code.into()),
            name: Some("Buffer".into()),
            price_value: Some(price),
            confidence,
            provenance: Some(Provenance {
                chunk_id: chunk.into(),
                source: ChunkSource::Llm,
                page_start: 1,
                page_end: 1,
                window_index: None,
            }),
            ..Variant::default()
        }
        .refreshed()
    }

    fn group(title: &str, variants: Vec<Variant>) -> Group {
        Group {
            title: title.into(),
            specs_headers: vec!["Code".into(), "Price".into()],
            variants,
            ..Group::default()
        }
    }

    #[test]
    fn merge_key_normalises_whitespace_and_case() {
        let a = Variant {
            code: Some(" AB-1 ".into()),
            ..Variant::default()
        };
        let b = Variant {
            code: Some("ab-1".into()),
            ..Variant::default()
        };
        assert_eq!(merge_key(&a), merge_key(&b));

        let n = Variant {
            name: Some("Buffer  pH 7".into()),
            pack: Some("1 L".into()),
            ..Variant::default()
        };
        assert_eq!(merge_key(&n), "name:buffer ph 7|1 l|");
    }

    #[test]
    fn merging_a_result_with_itself_is_idempotent() {
        let groups = vec![group("Buffers", vec![variant("A-1", 100.0, 0.9, "c0")])];
        let out = merge_group_sets([groups.as_slice(), groups.as_slice()]);
        assert_eq!(out.groups, groups);
        assert!(out.price_conflicts.is_empty());
    }

    #[test]
    fn differing_prices_produce_one_conflict() {
        let a = vec![group("Buffers", vec![variant("A-1", 100.0, 0.8, "c0")])];
        let b = vec![group("buffers ", vec![variant("a-1", 120.0, 0.9, "c1")])];
        let out = merge_group_sets([a.as_slice(), b.as_slice()]);
        assert_eq!(out.groups.len(), 1);
        assert_eq!(out.groups[0].variants.len(), 1);
        assert_eq!(out.price_conflicts.len(), 1);
        let c = &out.price_conflicts[0];
        assert_eq!(c.chunk_ids, vec!["c0", "c1"]);
        assert_eq!(c.values, vec![100.0, 120.0]);
        assert_eq!(c.resolved, 120.0);
        let merged = &out.groups[0].variants[0];
        assert_eq!(merged.price_value, Some(120.0));
        assert_eq!(merged.provenance.as_ref().unwrap().chunk_id, "c1");
    }

    #[test]
    fn ties_keep_the_earlier_variant() {
        let a = vec![group("G", vec![variant("A-1", 100.0, 0.8, "c0")])];
        let b = vec![group("G", vec![variant("A-1", 120.0, 0.8, "c1")])];
        let out = merge_group_sets([a.as_slice(), b.as_slice()]);
        assert_eq!(out.groups[0].variants[0].price_value, Some(100.0));
        assert_eq!(out.price_conflicts[0].resolved, 100.0);
    }

    #[test]
    fn missing_fields_are_filled_from_the_loser() {
        let mut base = variant("A-1", 100.0, 0.9, "c0");
        base.pack = None;
        let mut incoming = variant("A-1", 100.0, 0.5, "c1");
        incoming.pack = Some("2/PK".into());
        incoming.hsn = Some("38220090".into());
        let out = merge_group_sets([
            vec![group("G", vec![base.refreshed()])].as_slice(),
            vec![group("G", vec![incoming.refreshed()])].as_slice(),
        ]);
        let v = &out.groups[0].variants[0];
        assert_eq!(v.pack.as_deref(), Some("2/PK"));
        assert_eq!(v.hsn.as_deref(), Some("38220090"));
        assert_eq!(v.confidence, 0.9);
        assert!(v.fields_present.contains(&"hsn".to_string()));
        assert_eq!(v.provenance.as_ref().unwrap().chunk_id, "c0");
    }

    #[test]
    fn precedence_falls_through_to_field_count_and_name_length() {
        let mut a = variant("A-1", 1.0, 0.5, "c0");
        let mut b = a.clone();
        b.pack = Some("1/PK".into());
        b.refresh();
        assert_eq!(variant_precedence(&b, &a), Ordering::Greater);
        a.name = Some("Buffer solution".into());
        b.pack = None;
        b.refresh();
        a.refresh();
        assert_eq!(variant_precedence(&a, &b), Ordering::Greater);
    }

    #[test]
    fn spec_headers_union_in_first_seen_order() {
        let mut a = group("G", vec![]);
        a.specs_headers = vec!["Code".into(), "Pack".into()];
        let mut b = group("G", vec![]);
        b.specs_headers = vec!["code".into(), "Price".into(), " Pack ".into()];
        let out = merge_group_sets([vec![a].as_slice(), vec![b].as_slice()]);
        assert_eq!(out.groups[0].specs_headers, vec!["Code", "Pack", "Price"]);
    }
}
