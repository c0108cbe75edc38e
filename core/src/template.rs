use chrono::{DateTime, SecondsFormat, Utc};
use regex::{Captures, Regex};
use serde_json::{Map, Value};

use crate::compare::ChangeRecord;

/// Everything the renderer needs for one notification.
pub struct RenderInput<'a> {
    /// Watch display name.
    pub name: &'a str,
    /// Watch URL, used for the trailing link line.
    pub url: &'a str,
    /// Run timestamp.
    pub timestamp: DateTime<Utc>,
    /// Change records, in extractor order.
    pub changes: &'a [ChangeRecord],
    /// The freshly extracted snapshot.
    pub data: &'a Map<String, Value>,
    /// The prior snapshot, when one existed.
    pub previous: Option<&'a Map<String, Value>>,
}

/// Render the change notification: the user template with placeholders
/// substituted, or the default listing when no template is declared.
pub fn render_message(template: Option<&str>, input: &RenderInput<'_>) -> String {
    match template {
        Some(t) => substitute(t, input),
        None => default_message(input),
    }
}

/// Fixed template for persistent-failure notifications.
pub fn render_error_message(name: &str, url: &str, failures: u32, error: &str) -> String {
    format!(
        "⚠️ <b>{name}</b> has failed {failures} consecutive checks\nLast error: {error}\n{url}"
    )
}

/// Format an f64 the way JavaScript prints numbers: no trailing `.0`.
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        return "NaN".to_string();
    }
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

fn signed_number(n: f64) -> String {
    if n >= 0.0 {
        format!("+{}", format_number(n))
    } else {
        format_number(n)
    }
}

/// Render one extracted value for humans: records show their `text` or
/// `value` field, scalars print bare, the rest is JSON.
pub fn render_value(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Number(n) => format_number(n.as_f64().unwrap_or(f64::NAN)),
        Value::Bool(b) => b.to_string(),
        Value::Object(map) => map
            .get("text")
            .or_else(|| map.get("value"))
            .map(render_value)
            .unwrap_or_else(|| v.to_string()),
        Value::Array(_) => v.to_string(),
    }
}

fn substitute(template: &str, input: &RenderInput<'_>) -> String {
    let re = Regex::new(r"\{\{\s*([A-Za-z]+)(?:\.([^}\s]+))?\s*\}\}")
        .expect("placeholder regex is valid");
    re.replace_all(template, |caps: &Captures<'_>| {
        let field = caps.get(2).map(|m| m.as_str());
        match (&caps[1], field) {
            ("name", None) => input.name.to_string(),
            ("url", None) => input.url.to_string(),
            ("timestamp", None) => input
                .timestamp
                .to_rfc3339_opts(SecondsFormat::Millis, true),
            ("changes", None) => serde_json::to_string(input.changes).unwrap_or_default(),
            ("data", None) => {
                serde_json::to_string(&Value::Object(input.data.clone())).unwrap_or_default()
            }
            ("added", None) => join_members(&collect_details(input.changes, "added"), ", "),
            ("removed", None) => join_members(&collect_details(input.changes, "removed"), ", "),
            ("addedList", None) => bullet_lines(&collect_details(input.changes, "added")),
            ("removedList", None) => bullet_lines(&collect_details(input.changes, "removed")),
            ("addedCount", None) => collect_details(input.changes, "added").len().to_string(),
            ("removedCount", None) => collect_details(input.changes, "removed").len().to_string(),
            ("current", Some(key)) => {
                render_value(input.data.get(key).unwrap_or(&Value::Null))
            }
            ("previous", Some(key)) => render_value(
                input
                    .previous
                    .and_then(|p| p.get(key))
                    .unwrap_or(&Value::Null),
            ),
            ("diff", Some(key)) => render_diff(input, key),
            _ => caps[0].to_string(),
        }
    })
    .into_owned()
}

fn render_diff(input: &RenderInput<'_>, key: &str) -> String {
    let current = input.data.get(key).unwrap_or(&Value::Null);
    let previous = input.previous.and_then(|p| p.get(key));
    match previous {
        Some(prev) if !prev.is_null() => {
            let rendered = format!("{} → {}", render_value(prev), render_value(current));
            match (prev.as_f64(), current.as_f64()) {
                (Some(p), Some(c)) => format!("{rendered} ({})", signed_number(c - p)),
                _ => rendered,
            }
        }
        _ => render_value(current),
    }
}

fn collect_details(changes: &[ChangeRecord], key: &str) -> Vec<Value> {
    changes
        .iter()
        .filter_map(|c| c.details.as_ref())
        .filter_map(|d| d.get(key))
        .filter_map(Value::as_array)
        .flat_map(|items| items.iter().cloned())
        .collect()
}

fn join_members(members: &[Value], separator: &str) -> String {
    members
        .iter()
        .map(render_value)
        .collect::<Vec<_>>()
        .join(separator)
}

fn bullet_lines(members: &[Value]) -> String {
    members
        .iter()
        .map(|m| format!("• {}", render_value(m)))
        .collect::<Vec<_>>()
        .join("\n")
}

fn default_message(input: &RenderInput<'_>) -> String {
    let mut lines = vec![format!("<b>{}</b> changed:", input.name)];
    for change in input.changes {
        let details = change.details.as_ref();
        let added = details
            .and_then(|d| d.get("added"))
            .and_then(Value::as_array);
        let removed = details
            .and_then(|d| d.get("removed"))
            .and_then(Value::as_array);
        if added.is_some() || removed.is_some() {
            if let Some(added) = added.filter(|a| !a.is_empty()) {
                lines.push(format!("{} added: {}", change.name, join_members(added, ", ")));
            }
            if let Some(removed) = removed.filter(|r| !r.is_empty()) {
                lines.push(format!(
                    "{} removed: {}",
                    change.name,
                    join_members(removed, ", ")
                ));
            }
            continue;
        }
        let diff = details
            .and_then(|d| d.get("diff"))
            .and_then(Value::as_f64);
        match diff {
            Some(delta) => lines.push(format!(
                "{}: {} → {} ({})",
                change.name,
                render_value(&change.previous),
                render_value(&change.current),
                signed_number(delta),
            )),
            None => lines.push(format!(
                "{}: {} → {}",
                change.name,
                render_value(&change.previous),
                render_value(&change.current),
            )),
        }
    }
    lines.push(input.url.to_string());
    lines.join("\n")
}
