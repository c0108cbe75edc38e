use anyhow::{bail, Context, Result};
use serde_json::{Map, Value};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

use watch_core::browser::{PageSurface, Selector};
use watch_core::store::sanitize_id;
use watch_core::watch::{ActionKind, ActionSpec, ConditionSpec};

const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_TYPE_DELAY_MS: u64 = 50;

/// Execute the watch's action script in order, threading the action-context
/// map. A failing action aborts the script unless it is `optional`.
pub async fn run_actions(
    page: &dyn PageSurface,
    actions: &[ActionSpec],
    vars: &mut Map<String, Value>,
    screenshot_dir: &Path,
    watch_id: &str,
) -> Result<()> {
    for (index, action) in actions.iter().enumerate() {
        if let Some(condition) = &action.condition {
            if !eval_condition(page, condition, vars).await {
                debug!("action #{index} skipped by condition");
                continue;
            }
        }
        match run_one(page, &action.kind, vars, screenshot_dir, watch_id).await {
            Ok(()) => {}
            Err(err) if action.optional => {
                warn!("optional action #{index} failed: {err:#}");
                continue;
            }
            Err(err) => return Err(err).with_context(|| format!("action #{index}")),
        }
        if let Some(ms) = action.delay {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
    Ok(())
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Evaluate an action's `if` condition. Unknown types pass.
pub async fn eval_condition(
    page: &dyn PageSurface,
    condition: &ConditionSpec,
    vars: &Map<String, Value>,
) -> bool {
    match condition {
        ConditionSpec::Exists { selector } => {
            page.count(&Selector::auto(selector, false)).await.unwrap_or(0) > 0
        }
        ConditionSpec::NotExists { selector } => {
            page.count(&Selector::auto(selector, false)).await.unwrap_or(0) == 0
        }
        ConditionSpec::TextContains { selector, text } => {
            match page
                .query_all(
                    &Selector::auto(selector, false),
                    &watch_core::browser::ElementPart::Text,
                )
                .await
            {
                Ok(items) => items
                    .first()
                    .and_then(Value::as_str)
                    .map(|s| s.contains(text.as_str()))
                    .unwrap_or(false),
                Err(_) => false,
            }
        }
        ConditionSpec::Variable { name } => {
            vars.get(name).map(truthy).unwrap_or(false)
        }
        ConditionSpec::Evaluate { script } => match page.evaluate(script).await {
            Ok(value) => truthy(&value),
            Err(err) => {
                warn!("condition script failed: {err}");
                false
            }
        },
        ConditionSpec::Unknown(kind) => {
            debug!("unknown condition type {kind:?}, treating as true");
            true
        }
    }
}

/// A click probes the main frame first, then child frames unless disabled.
async fn click_with_frames(
    page: &dyn PageSurface,
    selector: &str,
    check_frames: Option<bool>,
) -> Result<()> {
    let sel = Selector::auto(selector, false);
    if page.count(&sel).await.unwrap_or(0) > 0 {
        page.click(&sel).await?;
        return Ok(());
    }
    if check_frames != Some(false) {
        for frame in page.frames().await? {
            if frame.count(&sel).await.unwrap_or(0) > 0 {
                frame.click(&sel).await?;
                return Ok(());
            }
        }
    }
    bail!("no element matched {selector:?}");
}

async fn run_one(
    page: &dyn PageSurface,
    kind: &ActionKind,
    vars: &mut Map<String, Value>,
    screenshot_dir: &Path,
    watch_id: &str,
) -> Result<()> {
    match kind {
        ActionKind::Wait { ms } => {
            tokio::time::sleep(Duration::from_millis(ms.unwrap_or(1000))).await;
        }
        ActionKind::WaitForSelector { selector, timeout } => {
            page.wait_for_selector(
                &Selector::auto(selector, false),
                timeout.map(Duration::from_millis).unwrap_or(DEFAULT_WAIT_TIMEOUT),
            )
            .await?;
        }
        ActionKind::WaitForXPath { xpath, timeout } => {
            page.wait_for_selector(
                &Selector::Xpath(xpath.clone()),
                timeout.map(Duration::from_millis).unwrap_or(DEFAULT_WAIT_TIMEOUT),
            )
            .await?;
        }
        ActionKind::WaitForNavigation { timeout } => {
            page.wait_for_navigation(
                timeout.map(Duration::from_millis).unwrap_or(DEFAULT_WAIT_TIMEOUT),
            )
            .await?;
        }
        ActionKind::Click { selector, check_frames } => {
            click_with_frames(page, selector, *check_frames).await?;
        }
        ActionKind::Type { selector, text } => {
            page.fill(&Selector::auto(selector, false), text).await?;
        }
        ActionKind::TypeSlowly { selector, text, delay } => {
            page.type_text(
                &Selector::auto(selector, false),
                text,
                Duration::from_millis(delay.unwrap_or(DEFAULT_TYPE_DELAY_MS)),
            )
            .await?;
        }
        ActionKind::PressKey { key } => {
            page.press_key(key).await?;
        }
        ActionKind::Select { selector, value } => {
            page.select_option(&Selector::auto(selector, false), value).await?;
        }
        ActionKind::Hover { selector } => {
            page.hover(&Selector::auto(selector, false)).await?;
        }
        ActionKind::Scroll { selector, x, y } => match selector {
            Some(selector) => {
                page.scroll_into_view(&Selector::auto(selector, false)).await?;
            }
            None => {
                page.scroll_by(x.unwrap_or(0.0), y.unwrap_or(0.0)).await?;
            }
        },
        ActionKind::Evaluate { script } => {
            let result = page.evaluate(script).await?;
            vars.insert("evalResult".to_string(), result);
        }
        ActionKind::Screenshot { path, full_page } => {
            let target = match path {
                Some(path) => Path::new(path).to_path_buf(),
                None => screenshot_dir.join(format!(
                    "{}-action-{}.png",
                    sanitize_id(watch_id),
                    chrono::Utc::now().timestamp_millis()
                )),
            };
            page.screenshot(&target, *full_page).await?;
        }
        ActionKind::SetVariable { name, value } => {
            vars.insert(name.clone(), value.clone());
        }
        ActionKind::Login {
            username_selector,
            username,
            password_selector,
            password,
            submit_selector,
        } => {
            if let (Some(selector), Some(text)) = (username_selector, username) {
                page.fill(&Selector::auto(selector, false), text).await?;
            }
            if let (Some(selector), Some(text)) = (password_selector, password) {
                page.fill(&Selector::auto(selector, false), text).await?;
            }
            if let Some(selector) = submit_selector {
                page.click(&Selector::auto(selector, false)).await?;
            }
            if let Err(err) = page.wait_for_navigation(Duration::from_secs(10)).await {
                debug!("post-login navigation did not settle: {err}");
            }
        }
        ActionKind::Unknown { type_name } => {
            debug!("skipping unknown action type {type_name:?}");
        }
    }
    Ok(())
}
