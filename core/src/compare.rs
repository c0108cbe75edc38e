use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::warn;

use crate::md5_json;
use crate::transform::{coerce_string, js_parse_float, number_value};
use crate::watch::ExtractorSpec;

/// Decision procedure over (current, prior) values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    /// MD5-of-JSON inequality.
    Hash,
    /// JSON serialization inequality.
    Exact,
    /// Sequence/string length difference.
    Length,
    /// Members present now but absent before.
    Added,
    /// Members present before but absent now.
    Removed,
    /// Union of `Added` and `Removed`.
    AddedOrRemoved,
    /// Absolute numeric delta beyond a threshold.
    Numeric,
    /// Numeric increase beyond a threshold.
    Increased,
    /// Numeric decrease beyond a threshold.
    Decreased,
    /// Never changed.
    None,
    /// User-supplied comparator body; unsupported in this runtime.
    Custom,
}

impl Comparator {
    /// Parse a comparator name. Unknown names degrade to `hash`.
    pub fn parse(name: &str) -> Comparator {
        match name {
            "hash" => Comparator::Hash,
            "exact" => Comparator::Exact,
            "length" => Comparator::Length,
            "added" => Comparator::Added,
            "removed" => Comparator::Removed,
            "addedOrRemoved" => Comparator::AddedOrRemoved,
            "numeric" => Comparator::Numeric,
            "increased" => Comparator::Increased,
            "decreased" => Comparator::Decreased,
            "none" => Comparator::None,
            "custom" => Comparator::Custom,
            other => {
                warn!("unknown comparator {other:?}, using hash");
                Comparator::Hash
            }
        }
    }

    /// The wire name recorded on change records.
    pub fn name(&self) -> &'static str {
        match self {
            Comparator::Hash => "hash",
            Comparator::Exact => "exact",
            Comparator::Length => "length",
            Comparator::Added => "added",
            Comparator::Removed => "removed",
            Comparator::AddedOrRemoved => "addedOrRemoved",
            Comparator::Numeric => "numeric",
            Comparator::Increased => "increased",
            Comparator::Decreased => "decreased",
            Comparator::None => "none",
            Comparator::Custom => "custom",
        }
    }
}

/// One detected change, emitted in extractor-declaration order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Extractor name the change belongs to.
    pub name: String,
    /// Prior value.
    pub previous: Value,
    /// Current value.
    pub current: Value,
    /// Comparator-specific details, when any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    /// Comparator that produced the verdict.
    pub comparator: String,
}

/// Outcome of a single comparison.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    /// Whether the field counts as changed.
    pub changed: bool,
    /// Comparator-specific details.
    pub details: Option<Value>,
}

impl Verdict {
    fn unchanged() -> Verdict {
        Verdict { changed: false, details: None }
    }
}

/// Evaluate one comparator against a (current, prior) pair.
pub fn evaluate(cmp: Comparator, current: &Value, previous: &Value, threshold: f64) -> Verdict {
    match cmp {
        Comparator::Hash => Verdict {
            changed: md5_json(current) != md5_json(previous),
            details: None,
        },
        Comparator::Exact => Verdict {
            changed: current.to_string() != previous.to_string(),
            details: None,
        },
        Comparator::Length => {
            let (cur, prev) = (length_of(current), length_of(previous));
            Verdict {
                changed: cur != prev,
                details: Some(json!({
                    "previous": prev,
                    "current": cur,
                    "diff": cur as i64 - prev as i64,
                })),
            }
        }
        Comparator::Added => {
            let added = missing_members(current, previous);
            Verdict {
                changed: !added.is_empty(),
                details: Some(json!({ "added": added })),
            }
        }
        Comparator::Removed => {
            let removed = missing_members(previous, current);
            Verdict {
                changed: !removed.is_empty(),
                details: Some(json!({ "removed": removed })),
            }
        }
        Comparator::AddedOrRemoved => {
            let added = missing_members(current, previous);
            let removed = missing_members(previous, current);
            Verdict {
                changed: !added.is_empty() || !removed.is_empty(),
                details: Some(json!({ "added": added, "removed": removed })),
            }
        }
        Comparator::Numeric => numeric_verdict(current, previous, |diff, t| diff.abs() > t, threshold),
        Comparator::Increased => {
            numeric_verdict(current, previous, |diff, t| diff > t, threshold)
        }
        Comparator::Decreased => {
            numeric_verdict(current, previous, |diff, t| diff < -t, threshold)
        }
        Comparator::None => Verdict::unchanged(),
        Comparator::Custom => {
            warn!("custom comparator is not supported, falling back to hash");
            evaluate(Comparator::Hash, current, previous, threshold)
        }
    }
}

/// Compare a freshly extracted snapshot against the prior one, resolving the
/// comparator and threshold per extractor. Records come out in extractor
/// declaration order.
pub fn diff_snapshots(
    current: &Map<String, Value>,
    previous: &Map<String, Value>,
    extractors: &[ExtractorSpec],
    default_comparator: Comparator,
    default_threshold: f64,
) -> Vec<ChangeRecord> {
    let mut changes = Vec::new();
    for spec in extractors {
        let Some(cur) = current.get(&spec.name) else { continue };
        let prev = previous.get(&spec.name).unwrap_or(&Value::Null);
        let cmp = spec
            .comparator
            .as_deref()
            .map(Comparator::parse)
            .unwrap_or(default_comparator);
        let threshold = spec.threshold.unwrap_or(default_threshold);
        let verdict = evaluate(cmp, cur, prev, threshold);
        if verdict.changed {
            changes.push(ChangeRecord {
                name: spec.name.clone(),
                previous: prev.clone(),
                current: cur.clone(),
                details: verdict.details,
                comparator: cmp.name().to_string(),
            });
        }
    }
    changes
}

fn length_of(v: &Value) -> usize {
    match v {
        Value::Array(items) => items.len(),
        Value::String(s) => s.chars().count(),
        _ => 0,
    }
}

/// Membership key: structured members compare by JSON serialization, scalars
/// by string coercion.
fn member_key(v: &Value) -> String {
    match v {
        Value::Array(_) | Value::Object(_) => v.to_string(),
        Value::Null => "null".to_string(),
        other => coerce_string(other),
    }
}

/// Members of `from` whose key is absent from `against`-as-set.
fn missing_members(from: &Value, against: &Value) -> Vec<Value> {
    let Value::Array(from_items) = from else { return Vec::new() };
    let against_keys: std::collections::HashSet<String> = match against {
        Value::Array(items) => items.iter().map(member_key).collect(),
        _ => Default::default(),
    };
    from_items
        .iter()
        .filter(|item| !against_keys.contains(&member_key(item)))
        .cloned()
        .collect()
}

fn coerce_number(v: &Value) -> f64 {
    match v {
        Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
        Value::String(s) => js_parse_float(s),
        Value::Bool(true) => 1.0,
        Value::Bool(false) => 0.0,
        _ => f64::NAN,
    }
}

fn numeric_verdict(
    current: &Value,
    previous: &Value,
    changed_if: impl Fn(f64, f64) -> bool,
    threshold: f64,
) -> Verdict {
    let (cur, prev) = (coerce_number(current), coerce_number(previous));
    if cur.is_nan() || prev.is_nan() {
        return Verdict::unchanged();
    }
    let diff = cur - prev;
    Verdict {
        changed: changed_if(diff, threshold),
        details: Some(json!({
            "previous": number_value(prev),
            "current": number_value(cur),
            "diff": number_value(diff),
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watch::ExtractorSpec;

    fn extractor(name: &str) -> ExtractorSpec {
        ExtractorSpec::text_named(name, "div")
    }

    fn extractor_with(name: &str, comparator: &str, threshold: Option<f64>) -> ExtractorSpec {
        let mut e = extractor(name);
        e.comparator = Some(comparator.to_string());
        e.threshold = threshold;
        e
    }

    fn snapshot(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn added_and_removed_members_are_reported() {
        // Prior ["a","b","c"], current ["b","c","d"]: one record with
        // added=["d"], removed=["a"].
        let current = snapshot(&[("items", json!(["b", "c", "d"]))]);
        let previous = snapshot(&[("items", json!(["a", "b", "c"]))]);
        let specs = vec![extractor_with("items", "addedOrRemoved", None)];
        let changes = diff_snapshots(&current, &previous, &specs, Comparator::Hash, 0.0);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].name, "items");
        assert_eq!(
            changes[0].details,
            Some(json!({"added": ["d"], "removed": ["a"]}))
        );
        assert_eq!(changes[0].comparator, "addedOrRemoved");
    }

    #[test]
    fn decreased_respects_threshold() {
        let v = evaluate(Comparator::Decreased, &json!(118.5), &json!(120), 1.0);
        assert!(v.changed);
        assert_eq!(
            v.details,
            Some(json!({"previous": 120, "current": 118.5, "diff": -1.5}))
        );
        let v = evaluate(Comparator::Decreased, &json!(118.5), &json!(120), 2.0);
        assert!(!v.changed);
    }

    #[test]
    fn increased_respects_threshold() {
        assert!(evaluate(Comparator::Increased, &json!(8), &json!(5), 0.0).changed);
        assert!(!evaluate(Comparator::Increased, &json!(8), &json!(5), 3.0).changed);
        assert!(!evaluate(Comparator::Increased, &json!(5), &json!(8), 0.0).changed);
    }

    #[test]
    fn numeric_coerces_strings() {
        let v = evaluate(Comparator::Numeric, &json!("€ 118.50"), &json!("€ 120.00"), 1.0);
        // parseFloat("€ ...") is NaN, so raw currency strings do not compare.
        assert!(!v.changed);
        let v = evaluate(Comparator::Numeric, &json!("118.50"), &json!("120.00"), 1.0);
        assert!(v.changed);
    }

    #[test]
    fn numeric_with_missing_prior_is_unchanged() {
        assert!(!evaluate(Comparator::Numeric, &json!(42), &Value::Null, 0.0).changed);
    }

    #[test]
    fn hash_and_exact_detect_value_changes() {
        assert!(!evaluate(Comparator::Hash, &json!(["a"]), &json!(["a"]), 0.0).changed);
        assert!(evaluate(Comparator::Hash, &json!(["a"]), &json!(["b"]), 0.0).changed);
        assert!(evaluate(Comparator::Exact, &json!({"a": 1}), &json!({"a": 2}), 0.0).changed);
    }

    #[test]
    fn length_counts_sequences_and_strings() {
        let v = evaluate(Comparator::Length, &json!(["a", "b"]), &Value::Null, 0.0);
        assert!(v.changed);
        assert_eq!(v.details, Some(json!({"previous": 0, "current": 2, "diff": 2})));
        assert!(!evaluate(Comparator::Length, &json!("abc"), &json!("xyz"), 0.0).changed);
    }

    #[test]
    fn none_never_changes() {
        assert!(!evaluate(Comparator::None, &json!(1), &json!(2), 0.0).changed);
    }

    #[test]
    fn unknown_comparator_degrades_to_hash() {
        assert_eq!(Comparator::parse("fancy"), Comparator::Hash);
    }

    #[test]
    fn custom_comparator_falls_back_to_hash() {
        assert!(evaluate(Comparator::Custom, &json!(1), &json!(2), 0.0).changed);
        assert!(!evaluate(Comparator::Custom, &json!(1), &json!(1), 0.0).changed);
    }

    #[test]
    fn records_follow_extractor_declaration_order() {
        let current = snapshot(&[("b", json!(2)), ("a", json!(1)), ("c", json!(3))]);
        let previous = snapshot(&[("b", json!(0)), ("a", json!(0)), ("c", json!(0))]);
        let specs = vec![extractor("c"), extractor("a"), extractor("b")];
        let changes = diff_snapshots(&current, &previous, &specs, Comparator::Exact, 0.0);
        let names: Vec<&str> = changes.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["c", "a", "b"]);
    }

    #[test]
    fn per_extractor_comparator_overrides_default() {
        let current = snapshot(&[("count", json!(10)), ("title", json!("new"))]);
        let previous = snapshot(&[("count", json!(9)), ("title", json!("old"))]);
        let specs = vec![
            extractor_with("count", "increased", Some(5.0)),
            extractor("title"),
        ];
        let changes = diff_snapshots(&current, &previous, &specs, Comparator::Hash, 0.0);
        // count moved by 1 < threshold 5 under increased; title changed by hash.
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].name, "title");
    }

    #[test]
    fn structured_members_compare_by_serialization() {
        let cur = json!([{"value": "a", "text": "A"}, {"value": "b", "text": "B"}]);
        let prev = json!([{"value": "a", "text": "A"}]);
        let v = evaluate(Comparator::Added, &cur, &prev, 0.0);
        assert!(v.changed);
        assert_eq!(v.details, Some(json!({"added": [{"value": "b", "text": "B"}]})));
    }
}
