use serde_json::Value;

/// Resolve a dotted/indexed path like `a.b[0].c` (an optional leading `$.`
/// or `$` is ignored) against a JSON value. Returns `None` when any segment
/// is missing or mistyped.
pub fn resolve<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in segments(path) {
        current = match segment {
            Segment::Key(key) => current.as_object()?.get(key)?,
            Segment::Index(i) => current.as_array()?.get(i)?,
        };
    }
    Some(current)
}

/// Like [`resolve`] but yields an owned value, `null` when unresolved.
pub fn resolve_or_null(value: &Value, path: &str) -> Value {
    resolve(value, path).cloned().unwrap_or(Value::Null)
}

enum Segment<'a> {
    Key(&'a str),
    Index(usize),
}

fn segments(path: &str) -> impl Iterator<Item = Segment<'_>> {
    let trimmed = path.trim().trim_start_matches('$').trim_start_matches('.');
    trimmed.split('.').flat_map(|piece| {
        let mut out = Vec::new();
        let mut rest = piece;
        if let Some(bracket) = rest.find('[') {
            if bracket > 0 {
                out.push(Segment::Key(&rest[..bracket]));
            }
            rest = &rest[bracket..];
            while let Some(close) = rest.find(']') {
                if let Ok(i) = rest[1..close].parse::<usize>() {
                    out.push(Segment::Index(i));
                }
                rest = &rest[close + 1..];
                if !rest.starts_with('[') {
                    break;
                }
            }
        } else if !rest.is_empty() {
            out.push(Segment::Key(rest));
        }
        out
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dotted_keys() {
        let v = json!({"a": {"b": {"c": 7}}});
        assert_eq!(resolve(&v, "a.b.c"), Some(&json!(7)));
        assert_eq!(resolve(&v, "$.a.b.c"), Some(&json!(7)));
    }

    #[test]
    fn indexed_arrays() {
        let v = json!({"items": [{"price": 10}, {"price": 20}]});
        assert_eq!(resolve(&v, "items[1].price"), Some(&json!(20)));
        assert_eq!(resolve(&v, "items[0]"), Some(&json!({"price": 10})));
    }

    #[test]
    fn nested_indices() {
        let v = json!({"m": [[1, 2], [3, 4]]});
        assert_eq!(resolve(&v, "m[1][0]"), Some(&json!(3)));
    }

    #[test]
    fn bare_index_on_root_array() {
        let v = json!([10, 20, 30]);
        assert_eq!(resolve(&v, "[2]"), Some(&json!(30)));
    }

    #[test]
    fn missing_segments_yield_none() {
        let v = json!({"a": {"b": 1}});
        assert_eq!(resolve(&v, "a.x"), None);
        assert_eq!(resolve(&v, "a.b.c"), None);
        assert_eq!(resolve(&v, "a[0]"), None);
        assert_eq!(resolve_or_null(&v, "nope"), Value::Null);
    }

    #[test]
    fn empty_path_is_identity() {
        let v = json!({"a": 1});
        assert_eq!(resolve(&v, ""), Some(&v));
        assert_eq!(resolve(&v, "$"), Some(&v));
    }
}
