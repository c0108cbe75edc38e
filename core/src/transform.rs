use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::jsonpath;

/// One entry of an extractor's `transforms` list: either a bare name or an
/// object carrying the name under `type` plus inline options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TransformStep {
    /// Transform name without options.
    Name(String),
    /// Transform with options.
    Spec {
        /// Transform name.
        #[serde(rename = "type")]
        name: String,
        /// Options interpreted per transform.
        #[serde(flatten)]
        options: Map<String, Value>,
    },
}

impl TransformStep {
    /// Build a step from a name and an options object.
    pub fn with_options(name: impl Into<String>, options: Map<String, Value>) -> Self {
        TransformStep::Spec { name: name.into(), options }
    }

    fn parts(&self) -> (&str, Option<&Map<String, Value>>) {
        match self {
            TransformStep::Name(name) => (name.as_str(), None),
            TransformStep::Spec { name, options } => (name.as_str(), Some(options)),
        }
    }
}

/// Apply an ordered transform chain.
pub fn apply_steps(value: Value, steps: &[TransformStep]) -> Value {
    steps.iter().fold(value, |acc, step| {
        let (name, options) = step.parts();
        apply(acc, name, options.unwrap_or(&Map::new()))
    })
}

/// Apply one transform by name. Unknown names are identity; every transform
/// no-ops gracefully on a type it does not understand.
pub fn apply(value: Value, name: &str, options: &Map<String, Value>) -> Value {
    // parseNumber is the one transform with defined null behavior (0).
    if value.is_null() && name != "parseNumber" {
        return value;
    }
    match name {
        "flatten" => flatten(value, opt_u64(options, "depth").unwrap_or(1)),
        "unique" => unique(value),
        "sort" => sort(value, opt_str(options, "key"), opt_bool(options, "desc")),
        "reverse" => match value {
            Value::Array(mut items) => {
                items.reverse();
                Value::Array(items)
            }
            other => other,
        },
        "join" => join(value, opt_str(options, "separator").unwrap_or(", ")),
        "split" => split(value, opt_str(options, "separator").unwrap_or(",")),
        "first" => match value {
            Value::Array(items) => items.into_iter().next().unwrap_or(Value::Null),
            other => other,
        },
        "last" => match value {
            Value::Array(items) => items.into_iter().next_back().unwrap_or(Value::Null),
            other => other,
        },
        "slice" => slice(
            value,
            opt_i64(options, "start").unwrap_or(0),
            opt_i64(options, "end"),
        ),
        "filter" => filter(value, opt_str(options, "include"), opt_str(options, "exclude")),
        "map" | "pluck" => pluck(value, opt_str(options, "key")),
        "trim" => map_strings(value, &|s| Value::String(s.trim().to_string())),
        "lowercase" => map_strings(value, &|s| Value::String(s.to_lowercase())),
        "uppercase" => map_strings(value, &|s| Value::String(s.to_uppercase())),
        "regex" => regex_match(
            value,
            opt_str(options, "pattern").unwrap_or(""),
            opt_str(options, "flags").unwrap_or("g"),
        ),
        "replace" => regex_replace(
            value,
            opt_str(options, "pattern").unwrap_or(""),
            opt_str(options, "replacement").unwrap_or(""),
            opt_str(options, "flags").unwrap_or("g"),
        ),
        "parseNumber" => parse_number(value),
        "parseJson" => match value {
            Value::String(s) => match serde_json::from_str(&s) {
                Ok(parsed) => parsed,
                Err(_) => Value::String(s),
            },
            other => other,
        },
        "jsonPath" => jsonpath::resolve_or_null(&value, opt_str(options, "path").unwrap_or("")),
        "compact" => match value {
            Value::Array(items) => Value::Array(
                items
                    .into_iter()
                    .filter(|v| !v.is_null() && v.as_str() != Some(""))
                    .collect(),
            ),
            other => other,
        },
        other => {
            debug!("unknown transform {other:?}, passing value through");
            value
        }
    }
}

/// Parse a leading numeric prefix with JavaScript `parseFloat` semantics.
/// Returns NaN when the text has no leading number.
pub fn js_parse_float(s: &str) -> f64 {
    let t = s.trim_start();
    let bytes = t.as_bytes();
    let mut end = 0;
    let mut seen_digit = false;
    let mut seen_dot = false;
    if matches!(bytes.first(), Some(b'+') | Some(b'-')) {
        end += 1;
    }
    while end < bytes.len() {
        match bytes[end] {
            b'0'..=b'9' => {
                seen_digit = true;
                end += 1;
            }
            b'.' if !seen_dot => {
                seen_dot = true;
                end += 1;
            }
            _ => break,
        }
    }
    if seen_digit && matches!(bytes.get(end), Some(b'e') | Some(b'E')) {
        let mut e = end + 1;
        if matches!(bytes.get(e), Some(b'+') | Some(b'-')) {
            e += 1;
        }
        let exp_start = e;
        while matches!(bytes.get(e), Some(c) if c.is_ascii_digit()) {
            e += 1;
        }
        if e > exp_start {
            end = e;
        }
    }
    if !seen_digit {
        return f64::NAN;
    }
    let head = t[..end].trim_end_matches('.');
    head.parse().unwrap_or(f64::NAN)
}

/// String coercion used by `join`, `split` inputs and member rendering.
pub fn coerce_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Number(n) => crate::template::format_number(
            n.as_f64().unwrap_or(f64::NAN),
        ),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Wrap an f64 into a JSON number, preferring the integer representation.
pub fn number_value(n: f64) -> Value {
    if n.is_finite() && n.fract() == 0.0 && (i64::MIN as f64..=i64::MAX as f64).contains(&n) {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::from(0))
    }
}

fn opt_str<'a>(options: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    options.get(key).and_then(Value::as_str)
}

fn opt_u64(options: &Map<String, Value>, key: &str) -> Option<u64> {
    options.get(key).and_then(Value::as_u64)
}

fn opt_i64(options: &Map<String, Value>, key: &str) -> Option<i64> {
    options.get(key).and_then(Value::as_i64)
}

fn opt_bool(options: &Map<String, Value>, key: &str) -> bool {
    options.get(key).and_then(Value::as_bool).unwrap_or(false)
}

fn map_strings(value: Value, f: &dyn Fn(&str) -> Value) -> Value {
    match value {
        Value::String(s) => f(&s),
        Value::Array(items) => Value::Array(items.into_iter().map(|v| map_strings(v, f)).collect()),
        other => other,
    }
}

fn flatten(value: Value, depth: u64) -> Value {
    match value {
        Value::Array(items) if depth > 0 => {
            let mut out = Vec::new();
            for item in items {
                match item {
                    Value::Array(_) => match flatten(item, depth - 1) {
                        Value::Array(inner) => out.extend(inner),
                        other => out.push(other),
                    },
                    other => out.push(other),
                }
            }
            Value::Array(out)
        }
        other => other,
    }
}

fn unique(value: Value) -> Value {
    match value {
        Value::Array(items) => {
            let mut seen = std::collections::HashSet::new();
            let mut out = Vec::new();
            for item in items {
                if seen.insert(item.to_string()) {
                    out.push(item);
                }
            }
            Value::Array(out)
        }
        other => other,
    }
}

fn cmp_values(a: &Value, b: &Value) -> std::cmp::Ordering {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal),
        _ => coerce_string(a).cmp(&coerce_string(b)),
    }
}

fn sort(value: Value, key: Option<&str>, desc: bool) -> Value {
    match value {
        Value::Array(mut items) => {
            items.sort_by(|a, b| {
                let ord = match key {
                    Some(k) => cmp_values(
                        a.get(k).unwrap_or(&Value::Null),
                        b.get(k).unwrap_or(&Value::Null),
                    ),
                    None => cmp_values(a, b),
                };
                if desc { ord.reverse() } else { ord }
            });
            Value::Array(items)
        }
        other => other,
    }
}

fn join(value: Value, separator: &str) -> Value {
    match value {
        Value::Array(items) => Value::String(
            items
                .iter()
                .map(coerce_string)
                .collect::<Vec<_>>()
                .join(separator),
        ),
        other => other,
    }
}

fn split(value: Value, separator: &str) -> Value {
    match value {
        Value::String(s) => Value::Array(
            s.split(separator)
                .map(|piece| Value::String(piece.trim().to_string()))
                .collect(),
        ),
        other => other,
    }
}

fn clamp_index(i: i64, len: usize) -> usize {
    if i < 0 {
        len.saturating_sub(i.unsigned_abs() as usize)
    } else {
        (i as usize).min(len)
    }
}

fn slice(value: Value, start: i64, end: Option<i64>) -> Value {
    match value {
        Value::Array(items) => {
            let len = items.len();
            let from = clamp_index(start, len);
            let to = end.map(|e| clamp_index(e, len)).unwrap_or(len).max(from);
            Value::Array(items[from..to].to_vec())
        }
        Value::String(s) => {
            let chars: Vec<char> = s.chars().collect();
            let len = chars.len();
            let from = clamp_index(start, len);
            let to = end.map(|e| clamp_index(e, len)).unwrap_or(len).max(from);
            Value::String(chars[from..to].iter().collect())
        }
        other => other,
    }
}

fn filter_text(v: &Value) -> String {
    match v {
        Value::Object(map) => map
            .get("value")
            .or_else(|| map.get("text"))
            .map(coerce_string)
            .unwrap_or_else(|| v.to_string()),
        other => coerce_string(other),
    }
}

fn filter(value: Value, include: Option<&str>, exclude: Option<&str>) -> Value {
    match value {
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .filter(|item| {
                    let text = filter_text(item);
                    let kept = include.map(|needle| text.contains(needle)).unwrap_or(true);
                    let dropped = exclude.map(|needle| text.contains(needle)).unwrap_or(false);
                    kept && !dropped
                })
                .collect(),
        ),
        other => other,
    }
}

fn pluck(value: Value, key: Option<&str>) -> Value {
    let Some(key) = key else { return value };
    match value {
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| item.get(key).cloned().unwrap_or(Value::Null))
                .collect(),
        ),
        other => other,
    }
}

fn build_regex(pattern: &str, flags: &str) -> Option<regex::Regex> {
    let mut inline = String::new();
    for flag in flags.chars() {
        match flag {
            'i' => inline.push('i'),
            'm' => inline.push('m'),
            's' => inline.push('s'),
            _ => {}
        }
    }
    let source = if inline.is_empty() {
        pattern.to_string()
    } else {
        format!("(?{inline}){pattern}")
    };
    match regex::Regex::new(&source) {
        Ok(re) => Some(re),
        Err(err) => {
            debug!("invalid regex {pattern:?}: {err}");
            None
        }
    }
}

fn regex_match(value: Value, pattern: &str, flags: &str) -> Value {
    let Some(re) = build_regex(pattern, flags) else { return value };
    let global = flags.contains('g');
    map_strings(value, &|s| {
        if global {
            let matches: Vec<Value> = re
                .find_iter(s)
                .map(|m| Value::String(m.as_str().to_string()))
                .collect();
            if matches.is_empty() { Value::Null } else { Value::Array(matches) }
        } else {
            match re.captures(s) {
                Some(caps) => Value::Array(
                    caps.iter()
                        .map(|m| match m {
                            Some(m) => Value::String(m.as_str().to_string()),
                            None => Value::Null,
                        })
                        .collect(),
                ),
                None => Value::Null,
            }
        }
    })
}

fn regex_replace(value: Value, pattern: &str, replacement: &str, flags: &str) -> Value {
    let Some(re) = build_regex(pattern, flags) else { return value };
    let global = flags.contains('g');
    map_strings(value, &|s| {
        let out = if global {
            re.replace_all(s, replacement)
        } else {
            re.replacen(s, 1, replacement)
        };
        Value::String(out.into_owned())
    })
}

fn parse_number(value: Value) -> Value {
    let raw = match &value {
        Value::Number(_) => return value,
        Value::Null => String::new(),
        other => coerce_string(other),
    };
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    let n = js_parse_float(&cleaned);
    if n.is_nan() { Value::from(0) } else { number_value(n) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step(name: &str, options: Value) -> TransformStep {
        let map = options.as_object().cloned().unwrap_or_default();
        TransformStep::with_options(name, map)
    }

    #[test]
    fn price_string_normalizes_to_number() {
        // trim then parseNumber, the common price pipeline.
        let steps = vec![
            TransformStep::Name("trim".into()),
            TransformStep::Name("parseNumber".into()),
        ];
        assert_eq!(apply_steps(json!("  € 120.00 "), &steps), json!(120));
        assert_eq!(apply_steps(json!("€ 118.50"), &steps), json!(118.5));
        assert_eq!(apply_steps(json!("no digits"), &steps), json!(0));
        assert_eq!(apply_steps(Value::Null, &steps), json!(0));
    }

    #[test]
    fn split_then_join_round_trips() {
        let original = json!(["a", "b", "c"]);
        let joined = apply(original.clone(), "join", &Map::new());
        let split = apply(joined, "split", &Map::new());
        assert_eq!(split, original);
    }

    #[test]
    fn parse_json_of_stringified_value_is_identity() {
        let value = json!({"a": [1, "two", null], "b": {"c": true}});
        let text = Value::String(value.to_string());
        assert_eq!(apply(text, "parseJson", &Map::new()), value);
        // Failure leaves the input untouched.
        assert_eq!(apply(json!("not json"), "parseJson", &Map::new()), json!("not json"));
    }

    #[test]
    fn null_passes_through_everything_except_parse_number() {
        for name in ["trim", "sort", "join", "regex", "jsonPath", "unknown"] {
            assert_eq!(apply(Value::Null, name, &Map::new()), Value::Null);
        }
        assert_eq!(apply(Value::Null, "parseNumber", &Map::new()), json!(0));
    }

    #[test]
    fn unknown_transform_is_identity() {
        let v = json!([1, 2]);
        assert_eq!(apply(v.clone(), "frobnicate", &Map::new()), v);
    }

    #[test]
    fn trim_maps_over_sequences_and_skips_numbers() {
        assert_eq!(
            apply(json!([" a ", 7, "b "]), "trim", &Map::new()),
            json!(["a", 7, "b"])
        );
        assert_eq!(apply(json!(42), "trim", &Map::new()), json!(42));
    }

    #[test]
    fn flatten_respects_depth() {
        let v = json!([1, [2, [3, [4]]]]);
        assert_eq!(apply(v.clone(), "flatten", &Map::new()), json!([1, 2, [3, [4]]]));
        assert_eq!(
            apply(v, "flatten", step("flatten", json!({"depth": 2})).parts().1.unwrap()),
            json!([1, 2, 3, [4]])
        );
    }

    #[test]
    fn unique_is_stable_and_structural() {
        let v = json!([{"a": 1}, "x", {"a": 1}, "x", "y"]);
        assert_eq!(apply(v, "unique", &Map::new()), json!([{"a": 1}, "x", "y"]));
    }

    #[test]
    fn sort_handles_numbers_strings_and_keys() {
        assert_eq!(apply(json!([3, 1, 2]), "sort", &Map::new()), json!([1, 2, 3]));
        let desc = step("sort", json!({"desc": true}));
        assert_eq!(apply_steps(json!(["a", "c", "b"]), &[desc]), json!(["c", "b", "a"]));
        let by_key = step("sort", json!({"key": "price"}));
        assert_eq!(
            apply_steps(json!([{"price": 9}, {"price": 2}]), &[by_key]),
            json!([{"price": 2}, {"price": 9}])
        );
    }

    #[test]
    fn slice_supports_negative_indices() {
        let v = json!([0, 1, 2, 3, 4]);
        assert_eq!(
            apply_steps(v.clone(), &[step("slice", json!({"start": 1, "end": 3}))]),
            json!([1, 2])
        );
        assert_eq!(
            apply_steps(v, &[step("slice", json!({"start": -2}))]),
            json!([3, 4])
        );
    }

    #[test]
    fn filter_matches_record_value_or_text() {
        let v = json!([
            {"value": "blue-shirt", "text": "Blue shirt"},
            {"value": "red-shirt", "text": "Red shirt"},
            "plain blue"
        ]);
        assert_eq!(
            apply_steps(v, &[step("filter", json!({"include": "blue"}))]),
            json!([{"value": "blue-shirt", "text": "Blue shirt"}, "plain blue"])
        );
        assert_eq!(
            apply_steps(
                json!(["alpha", "beta"]),
                &[step("filter", json!({"exclude": "et"}))]
            ),
            json!(["alpha"])
        );
    }

    #[test]
    fn pluck_extracts_keys() {
        let v = json!([{"id": 1, "name": "a"}, {"id": 2}]);
        assert_eq!(
            apply_steps(v, &[step("pluck", json!({"key": "id"}))]),
            json!([1, 2])
        );
    }

    #[test]
    fn regex_global_returns_all_matches() {
        let v = json!("v1.2 and v3.4");
        assert_eq!(
            apply_steps(v, &[step("regex", json!({"pattern": r"v\d+\.\d+"}))]),
            json!(["v1.2", "v3.4"])
        );
    }

    #[test]
    fn regex_non_global_returns_capture_groups() {
        let v = json!("price: 42 EUR");
        assert_eq!(
            apply_steps(
                v,
                &[step("regex", json!({"pattern": r"price: (\d+)", "flags": ""}))]
            ),
            json!(["price: 42", "42"])
        );
    }

    #[test]
    fn replace_honors_global_flag() {
        assert_eq!(
            apply_steps(json!("a-b-c"), &[step("replace", json!({"pattern": "-", "replacement": "+"}))]),
            json!("a+b+c")
        );
        assert_eq!(
            apply_steps(
                json!("a-b-c"),
                &[step("replace", json!({"pattern": "-", "replacement": "+", "flags": ""}))]
            ),
            json!("a+b-c")
        );
    }

    #[test]
    fn compact_drops_null_and_empty() {
        let v = json!([null, "", "x", 0, null]);
        assert_eq!(apply(v, "compact", &Map::new()), json!(["x", 0]));
    }

    #[test]
    fn json_path_transform_resolves() {
        let v = json!({"data": {"items": [10, 20]}});
        assert_eq!(
            apply_steps(v, &[step("jsonPath", json!({"path": "data.items[1]"}))]),
            json!(20)
        );
    }

    #[test]
    fn js_parse_float_edge_cases() {
        assert_eq!(js_parse_float("118.50"), 118.5);
        assert_eq!(js_parse_float("-3.5e2"), -350.0);
        assert_eq!(js_parse_float("12px"), 12.0);
        assert_eq!(js_parse_float("1.2.3"), 1.2);
        assert!(js_parse_float("abc").is_nan());
        assert!(js_parse_float("").is_nan());
    }
}
