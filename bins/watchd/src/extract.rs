use anyhow::{anyhow, Result};
use serde_json::{Map, Value};
use std::path::Path;
use tracing::warn;

use watch_core::browser::{ElementPart, PageSurface, Selector};
use watch_core::jsonpath;
use watch_core::store::sanitize_id;
use watch_core::transform;
use watch_core::watch::{ExtractorKind, ExtractorSpec};

/// Run every declared extractor against the page. Per-extractor failures
/// substitute the declared default (or null) without aborting the run.
pub async fn run_extractors(
    page: &dyn PageSurface,
    specs: &[ExtractorSpec],
    screenshot_dir: &Path,
    watch_id: &str,
) -> Map<String, Value> {
    let mut snapshot = Map::new();
    for spec in specs {
        let value = match extract_one(page, spec, screenshot_dir, watch_id).await {
            Ok(value) => transform::apply_steps(value, &spec.transform_steps()),
            Err(err) => {
                warn!("extractor {:?} failed: {err:#}", spec.name);
                spec.default.clone().unwrap_or(Value::Null)
            }
        };
        snapshot.insert(spec.name.clone(), value);
    }
    snapshot
}

fn spec_selector(spec: &ExtractorSpec) -> Selector {
    let raw = spec.selector.as_deref().unwrap_or("");
    Selector::auto(raw, spec.xpath || spec.kind == ExtractorKind::Xpath)
}

/// Null, false and empty sequences count as "no result" for the purpose of
/// the child-frame fallback.
fn is_empty_result(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

async fn frame_query(
    page: &dyn PageSurface,
    selector: &Selector,
    part: &ElementPart,
    check_frames: bool,
) -> Result<Value> {
    let main = Value::Array(page.query_all(selector, part).await?);
    if check_frames && is_empty_result(&main) {
        for frame in page.frames().await? {
            match frame.query_all(selector, part).await {
                Ok(items) if !items.is_empty() => return Ok(Value::Array(items)),
                _ => {}
            }
        }
    }
    Ok(main)
}

fn trimmed(value: Value) -> Value {
    transform::apply(value, "trim", &Map::new())
}

async fn extract_one(
    page: &dyn PageSurface,
    spec: &ExtractorSpec,
    screenshot_dir: &Path,
    watch_id: &str,
) -> Result<Value> {
    let value = match spec.kind {
        ExtractorKind::Text | ExtractorKind::Xpath => trimmed(
            frame_query(page, &spec_selector(spec), &ElementPart::Text, spec.check_frames).await?,
        ),
        ExtractorKind::InnerText => trimmed(
            frame_query(
                page,
                &spec_selector(spec),
                &ElementPart::InnerText,
                spec.check_frames,
            )
            .await?,
        ),
        ExtractorKind::Attribute => {
            let name = spec
                .attribute
                .clone()
                .ok_or_else(|| anyhow!("attribute extractor without attribute name"))?;
            frame_query(
                page,
                &spec_selector(spec),
                &ElementPart::Attribute(name),
                spec.check_frames,
            )
            .await?
        }
        ExtractorKind::Value => {
            frame_query(page, &spec_selector(spec), &ElementPart::Value, spec.check_frames).await?
        }
        ExtractorKind::Options => {
            frame_query(page, &spec_selector(spec), &ElementPart::Options, spec.check_frames)
                .await?
        }
        ExtractorKind::Html => {
            frame_query(page, &spec_selector(spec), &ElementPart::InnerHtml, spec.check_frames)
                .await?
        }
        ExtractorKind::OuterHtml => {
            frame_query(page, &spec_selector(spec), &ElementPart::OuterHtml, spec.check_frames)
                .await?
        }
        ExtractorKind::Count => Value::from(page.count(&spec_selector(spec)).await?),
        ExtractorKind::Exists => {
            let selector = spec_selector(spec);
            let mut exists = page.count(&selector).await? > 0;
            if !exists && spec.check_frames {
                for frame in page.frames().await? {
                    if frame.count(&selector).await.unwrap_or(0) > 0 {
                        exists = true;
                        break;
                    }
                }
            }
            Value::Bool(exists)
        }
        ExtractorKind::Url => Value::String(page.url().await),
        ExtractorKind::Title => Value::String(page.title().await?),
        ExtractorKind::Evaluate => {
            let script = spec
                .script
                .as_deref()
                .ok_or_else(|| anyhow!("evaluate extractor without a script"))?;
            page.evaluate(script).await?
        }
        ExtractorKind::Json => {
            let body = page.body_text().await?;
            let parsed: Value = serde_json::from_str(body.trim())?;
            apply_path(parsed, spec.path.as_deref())
        }
        ExtractorKind::JsonFromScript => {
            let selector = spec
                .selector
                .clone()
                .unwrap_or_else(|| {
                    "script[type=\"application/json\"], script[type=\"application/ld+json\"]"
                        .to_string()
                });
            let bodies = page
                .query_all(&Selector::Css(selector), &ElementPart::Text)
                .await?;
            let text = bodies
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .find(|s| !s.is_empty())
                .ok_or_else(|| anyhow!("no JSON script tag matched"))?;
            let parsed: Value = serde_json::from_str(text)?;
            apply_path(parsed, spec.path.as_deref())
        }
        ExtractorKind::Screenshot => {
            let file = format!(
                "{}-{}-{}.png",
                sanitize_id(watch_id),
                sanitize_id(&spec.name),
                chrono::Utc::now().timestamp_millis()
            );
            let path = screenshot_dir.join(file);
            page.screenshot(&path, true).await?;
            Value::String(path.to_string_lossy().into_owned())
        }
    };
    Ok(value)
}

fn apply_path(value: Value, path: Option<&str>) -> Value {
    match path {
        Some(path) if !path.trim().is_empty() => jsonpath::resolve_or_null(&value, path),
        _ => value,
    }
}
