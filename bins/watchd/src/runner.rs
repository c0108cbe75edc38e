use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

use watch_core::browser::{BrowserHandle, ContextOptions, PageSurface, Selector};
use watch_core::compare::{self, Comparator};
use watch_core::store::{sanitize_id, StateStore};
use watch_core::watch::WatchConfig;

use crate::actions;
use crate::engine::{CheckResult, Engine};
use crate::extract;
use crate::notify::Notify;

const DEFAULT_NAV_TIMEOUT_MS: u64 = 60_000;
const SETTLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Perform one end-to-end run for a watch. Never panics or propagates
/// failures; the outcome is recorded in the engine state. Returns `None`
/// when a run for this watch is already in flight.
pub async fn run_watch(
    engine: &Engine,
    store: &StateStore,
    browser: &dyn BrowserHandle,
    notifier: &dyn Notify,
    watch: &WatchConfig,
) -> Option<CheckResult> {
    let id = watch.watch_id();
    if !engine.try_begin(&id).await {
        info!("watch {id} is still running, skipping this tick");
        return None;
    }
    let outcome = execute(engine, store, browser, notifier, watch, &id).await;
    engine.finish(&id).await;
    Some(outcome)
}

fn context_options(watch: &WatchConfig, engine: &Engine) -> ContextOptions {
    let settings = engine.settings();
    let storage_state_path = if watch.persist_session {
        let path = settings
            .session_dir
            .join(sanitize_id(&watch.watch_id()))
            .join("state.json");
        path.exists().then_some(path)
    } else {
        None
    };
    ContextOptions {
        user_agent: watch.user_agent.clone(),
        viewport: watch.viewport,
        locale: watch.locale.clone(),
        timezone: watch.timezone.clone(),
        headers: watch.headers.clone(),
        cookies: watch.cookies.clone(),
        proxy: watch.proxy.clone(),
        block_resources: watch.block_resources.clone(),
        storage_state_path,
    }
}

async fn execute(
    engine: &Engine,
    store: &StateStore,
    browser: &dyn BrowserHandle,
    notifier: &dyn Notify,
    watch: &WatchConfig,
    id: &str,
) -> CheckResult {
    debug!("checking {} ({id})", watch.display_name());
    let context = match browser.new_context(&context_options(watch, engine)).await {
        Ok(context) => context,
        Err(err) => {
            return record_failure(engine, store, notifier, watch, id, format!("{err}"), None)
                .await;
        }
    };
    let page = match context.new_page().await {
        Ok(page) => page,
        Err(err) => {
            let result =
                record_failure(engine, store, notifier, watch, id, format!("{err}"), None).await;
            context.close().await;
            return result;
        }
    };

    let result = match pipeline(engine, store, watch, id, page.as_ref()).await {
        Ok((data, changes, previous)) => {
            if watch.persist_session {
                let path = engine
                    .settings()
                    .session_dir
                    .join(sanitize_id(id))
                    .join("state.json");
                if let Err(err) = context.save_storage_state(&path).await {
                    warn!("session persist failed for {id}: {err}");
                }
            }
            let result = CheckResult::success(id.to_string(), data.clone(), changes.clone());
            engine.record_result(result.clone()).await;
            if changes.is_empty() {
                info!("no changes for {}", watch.display_name());
            } else if let Some(previous) = &previous {
                info!("{} change(s) for {}", changes.len(), watch.display_name());
                notifier
                    .notify_changes(watch, &changes, &data, Some(previous))
                    .await;
            } else {
                info!(
                    "first snapshot for {} stored, not notifying",
                    watch.display_name()
                );
            }
            result
        }
        Err(err) => {
            let screenshot = if watch.screenshot_on_error {
                capture_error_screenshot(engine, page.as_ref(), id).await
            } else {
                None
            };
            record_failure(engine, store, notifier, watch, id, format!("{err:#}"), screenshot)
                .await
        }
    };
    context.close().await;
    result
}

/// Steps 4–9 of a run: navigate with retries, act, settle, extract, diff,
/// persist.
async fn pipeline(
    engine: &Engine,
    store: &StateStore,
    watch: &WatchConfig,
    id: &str,
    page: &dyn PageSurface,
) -> Result<(Map<String, Value>, Vec<compare::ChangeRecord>, Option<Map<String, Value>>)> {
    let settings = engine.settings();
    navigate_with_retries(page, watch, settings).await?;

    let mut vars = Map::new();
    actions::run_actions(page, &watch.actions, &mut vars, &settings.screenshot_dir, id).await?;

    if let Some(selector) = &watch.wait_for_selector {
        if let Err(err) = page
            .wait_for_selector(&Selector::auto(selector, false), SETTLE_TIMEOUT)
            .await
        {
            debug!("settle selector {selector:?} never appeared: {err}");
        }
    }
    if let Some(ms) = watch.wait_ms {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    let data = extract::run_extractors(page, &watch.extractors, &settings.screenshot_dir, id).await;

    let previous = store.load(id).and_then(|state| state.data);
    let changes = match &previous {
        Some(previous) => compare::diff_snapshots(
            &data,
            previous,
            &watch.extractors,
            watch
                .comparator
                .as_deref()
                .map(Comparator::parse)
                .unwrap_or(Comparator::Hash),
            watch.threshold.unwrap_or(0.0),
        ),
        None => Vec::new(),
    };

    store.save_snapshot(id, &data).context("persist snapshot")?;
    Ok((data, changes, previous))
}

async fn navigate_with_retries(
    page: &dyn PageSurface,
    watch: &WatchConfig,
    settings: &watch_core::cfg::Settings,
) -> Result<()> {
    let retries = watch.retries.unwrap_or(settings.max_retries).max(1);
    let timeout = Duration::from_millis(watch.timeout.unwrap_or(DEFAULT_NAV_TIMEOUT_MS));
    let wait_until = watch.wait_until.unwrap_or_default();
    let mut attempt = 1u32;
    loop {
        match page.goto(&watch.url, timeout, wait_until).await {
            Ok(()) => return Ok(()),
            Err(err) => {
                warn!(
                    "navigation attempt {attempt}/{retries} failed for {}: {err}",
                    watch.url
                );
                let backoff = settings.retry_base_delay * 2u32.pow(attempt - 1);
                tokio::time::sleep(backoff).await;
                if attempt >= retries {
                    return Err(err).context("navigation retries exhausted");
                }
                attempt += 1;
            }
        }
    }
}

async fn capture_error_screenshot(
    engine: &Engine,
    page: &dyn PageSurface,
    id: &str,
) -> Option<String> {
    let path = engine.settings().screenshot_dir.join(format!(
        "error-{}-{}.png",
        sanitize_id(id),
        chrono::Utc::now().timestamp_millis()
    ));
    match page.screenshot(&path, true).await {
        Ok(()) => Some(path.to_string_lossy().into_owned()),
        Err(err) => {
            warn!("error screenshot failed for {id}: {err}");
            None
        }
    }
}

async fn record_failure(
    engine: &Engine,
    store: &StateStore,
    notifier: &dyn Notify,
    watch: &WatchConfig,
    id: &str,
    error: String,
    screenshot: Option<String>,
) -> CheckResult {
    warn!("run failed for {} ({id}): {error}", watch.display_name());
    if let Err(err) = store.record_error(id, &error) {
        warn!("state annotation failed for {id}: {err:#}");
    }
    let result = CheckResult::failure(id.to_string(), error.clone(), screenshot);
    let failures = engine.record_result(result.clone()).await;
    let threshold = watch
        .error_threshold
        .unwrap_or(engine.settings().error_notify_threshold);
    if watch.notify_on_error && failures >= threshold {
        notifier.notify_error(watch, failures, &error).await;
    }
    result
}
