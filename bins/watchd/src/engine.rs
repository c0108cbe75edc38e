use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use watch_core::cfg::Settings;
use watch_core::compare::ChangeRecord;
use watch_core::watch::WatchConfig;

/// Commands consumed by the scheduler's event loop.
#[derive(Debug)]
pub enum Command {
    Trigger(String),
}

/// Result record of one pipeline run, kept per watch id.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResult {
    pub id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
    pub changes: Vec<ChangeRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_screenshot: Option<String>,
    pub last_check: DateTime<Utc>,
}

impl CheckResult {
    pub fn success(id: String, data: Map<String, Value>, changes: Vec<ChangeRecord>) -> Self {
        CheckResult {
            id,
            success: true,
            error: None,
            data: Some(data),
            changes,
            error_screenshot: None,
            last_check: Utc::now(),
        }
    }

    pub fn failure(id: String, error: String, error_screenshot: Option<String>) -> Self {
        CheckResult {
            id,
            success: false,
            error: Some(error),
            data: None,
            changes: Vec::new(),
            error_screenshot,
            last_check: Utc::now(),
        }
    }
}

/// One dashboard/health row joining config and latest result.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchRow {
    pub id: String,
    pub name: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_check: Option<DateTime<Utc>>,
    pub changes: usize,
    pub error_count: u32,
    pub errors_total: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

struct Inner {
    started: Instant,
    settings: Settings,
    watches: Mutex<HashMap<String, WatchConfig>>,
    results: Mutex<HashMap<String, CheckResult>>,
    error_counts: Mutex<HashMap<String, u32>>,
    error_totals: Mutex<HashMap<String, u64>>,
    notified: Mutex<HashMap<String, Instant>>,
    busy: Mutex<HashSet<String>>,
}

/// Process-wide runtime state: the watch set, last-check results, error
/// counters, notification timestamps and busy flags, all behind one handle.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    pub fn new(settings: Settings) -> Engine {
        Engine {
            inner: Arc::new(Inner {
                started: Instant::now(),
                settings,
                watches: Mutex::new(HashMap::new()),
                results: Mutex::new(HashMap::new()),
                error_counts: Mutex::new(HashMap::new()),
                error_totals: Mutex::new(HashMap::new()),
                notified: Mutex::new(HashMap::new()),
                busy: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub fn uptime(&self) -> Duration {
        self.inner.started.elapsed()
    }

    /// Claim the per-watch busy flag. False means a run is already in
    /// flight and this tick must be skipped.
    pub async fn try_begin(&self, id: &str) -> bool {
        self.inner.busy.lock().await.insert(id.to_string())
    }

    pub async fn finish(&self, id: &str) {
        self.inner.busy.lock().await.remove(id);
    }

    /// Store a run result and maintain the consecutive-error counter.
    /// Returns the counter after this run (0 on success).
    pub async fn record_result(&self, result: CheckResult) -> u32 {
        let id = result.id.clone();
        let success = result.success;
        self.inner.results.lock().await.insert(id.clone(), result);
        let mut counts = self.inner.error_counts.lock().await;
        if success {
            counts.remove(&id);
            0
        } else {
            let count = counts.entry(id.clone()).or_insert(0);
            *count += 1;
            *self.inner.error_totals.lock().await.entry(id).or_insert(0) += 1;
            *count
        }
    }

    pub async fn upsert_watch(&self, watch: WatchConfig) {
        self.inner
            .watches
            .lock()
            .await
            .insert(watch.watch_id(), watch);
    }

    pub async fn remove_watch(&self, id: &str) {
        self.inner.watches.lock().await.remove(id);
        self.inner.busy.lock().await.remove(id);
    }

    pub async fn watch(&self, id: &str) -> Option<WatchConfig> {
        self.inner.watches.lock().await.get(id).cloned()
    }

    pub async fn known(&self, id: &str) -> bool {
        self.inner.watches.lock().await.contains_key(id)
    }

    /// The currently scheduled watch set as id → config content hash.
    pub async fn config_hashes(&self) -> HashMap<String, String> {
        self.inner
            .watches
            .lock()
            .await
            .iter()
            .map(|(id, w)| (id.clone(), w.content_hash.clone()))
            .collect()
    }

    /// Throttle check: true when no change notification went out for this
    /// watch within `window`.
    pub async fn notification_allowed(&self, id: &str, window: Duration) -> bool {
        match self.inner.notified.lock().await.get(id) {
            Some(last) => last.elapsed() >= window,
            None => true,
        }
    }

    pub async fn mark_notified(&self, id: &str) {
        self.inner
            .notified
            .lock()
            .await
            .insert(id.to_string(), Instant::now());
    }

    /// Join configs, results and counters into display rows, in watch-name
    /// order.
    pub async fn status_rows(&self) -> Vec<WatchRow> {
        let watches = self.inner.watches.lock().await;
        let results = self.inner.results.lock().await;
        let counts = self.inner.error_counts.lock().await;
        let totals = self.inner.error_totals.lock().await;
        let mut rows: Vec<WatchRow> = watches
            .iter()
            .map(|(id, watch)| {
                let result = results.get(id);
                WatchRow {
                    id: id.clone(),
                    name: watch.display_name().to_string(),
                    url: watch.url.clone(),
                    success: result.map(|r| r.success),
                    last_check: result.map(|r| r.last_check),
                    changes: result.map(|r| r.changes.len()).unwrap_or(0),
                    error_count: counts.get(id).copied().unwrap_or(0),
                    errors_total: totals.get(id).copied().unwrap_or(0),
                    last_error: result.and_then(|r| r.error.clone()),
                }
            })
            .collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        rows
    }
}
