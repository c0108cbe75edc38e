use std::net::SocketAddr;

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse},
    routing::{get, post},
    Json, Router,
};
use chrono::{SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::engine::{Command, Engine, WatchRow};
use crate::module::{Module, ModuleCtx};

#[derive(Clone)]
struct AppState {
    engine: Engine,
    trigger_tx: mpsc::Sender<Command>,
}

#[derive(Deserialize)]
struct TriggerQuery {
    id: Option<String>,
}

pub struct StatusServer {
    addr: SocketAddr,
    trigger_tx: mpsc::Sender<Command>,
}

impl StatusServer {
    pub fn new(addr: SocketAddr, trigger_tx: mpsc::Sender<Command>) -> Self {
        StatusServer { addr, trigger_tx }
    }
}

impl Module for StatusServer {
    fn name(&self) -> &'static str {
        "web"
    }

    fn spawn(self: Box<Self>, ctx: ModuleCtx) -> JoinHandle<anyhow::Result<()>> {
        tokio::spawn(async move {
            let state = AppState { engine: ctx.engine.clone(), trigger_tx: self.trigger_tx };

            let app = Router::new()
                .route("/", get(dashboard))
                .route("/dashboard", get(dashboard))
                .route("/health", get(health))
                .route("/api/health", get(health))
                .route("/metrics", get(metrics))
                .route("/api/trigger", post(trigger))
                .with_state(state);

            let listener = tokio::net::TcpListener::bind(self.addr).await?;
            info!("status server listening on http://{}", self.addr);

            let mut shutdown = ctx.shutdown.clone();

            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown.changed().await;
                })
                .await?;

            Ok(())
        })
    }
}

async fn dashboard(State(state): State<AppState>) -> impl IntoResponse {
    let rows = state.engine.status_rows().await;
    Html(render_dashboard(&rows, state.engine.uptime().as_secs()))
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let rows = state.engine.status_rows().await;
    Json(json!({
        "status": "ok",
        "uptime": state.engine.uptime().as_secs(),
        "watches": rows,
        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    }))
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let rows = state.engine.status_rows().await;
    let body = render_metrics(&rows, state.engine.uptime().as_secs());
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}

async fn trigger(
    State(state): State<AppState>,
    Query(query): Query<TriggerQuery>,
) -> impl IntoResponse {
    let Some(id) = query.id else {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": "id is required"})))
            .into_response();
    };
    if !state.engine.known(&id).await {
        return (StatusCode::NOT_FOUND, Json(json!({"error": "unknown watch"})))
            .into_response();
    }
    let _ = state.trigger_tx.send(Command::Trigger(id.clone())).await;
    Json(json!({"status": "triggered", "watchId": id})).into_response()
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn render_dashboard(rows: &[WatchRow], uptime_seconds: u64) -> String {
    let mut body = String::from(
        "<!doctype html><html><head><meta charset=\"utf-8\">\
         <meta http-equiv=\"refresh\" content=\"10\">\
         <title>watchd</title>\
         <style>\
         body{font-family:sans-serif;margin:2em;background:#fafafa}\
         table{border-collapse:collapse;width:100%}\
         th,td{padding:6px 10px;border-bottom:1px solid #ddd;text-align:left}\
         tr.err td{background:#fde8e8}\
         .muted{color:#888}\
         </style></head><body>",
    );
    body.push_str(&format!(
        "<h1>watchd</h1><p class=\"muted\">uptime {uptime_seconds}s · {} watch(es)</p>",
        rows.len()
    ));
    body.push_str(
        "<table><tr><th>Name</th><th>Id</th><th>Last check</th>\
         <th>Result</th><th>Changes</th><th>Errors</th></tr>",
    );
    for row in rows {
        let class = if row.success == Some(false) { " class=\"err\"" } else { "" };
        let last_check = row
            .last_check
            .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
            .unwrap_or_else(|| "-".to_string());
        let result = match row.success {
            Some(true) => "ok",
            Some(false) => "error",
            None => "pending",
        };
        body.push_str(&format!(
            "<tr{class}><td><a href=\"{}\">{}</a></td><td>{}</td><td>{}</td>\
             <td>{}</td><td>{}</td><td>{}</td></tr>",
            html_escape(&row.url),
            html_escape(&row.name),
            html_escape(&row.id),
            last_check,
            result,
            row.changes,
            row.error_count,
        ));
    }
    body.push_str("</table></body></html>");
    body
}

fn metric_escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

fn render_metrics(rows: &[WatchRow], uptime_seconds: u64) -> String {
    let mut out = String::new();
    out.push_str("# HELP web_monitor_up Whether the monitor is running\n");
    out.push_str("# TYPE web_monitor_up gauge\n");
    out.push_str("web_monitor_up 1\n");
    out.push_str("# HELP web_monitor_uptime_seconds Uptime in seconds\n");
    out.push_str("# TYPE web_monitor_uptime_seconds counter\n");
    out.push_str(&format!("web_monitor_uptime_seconds {uptime_seconds}\n"));
    out.push_str("# HELP web_monitor_watch_success Last check result per watch\n");
    out.push_str("# TYPE web_monitor_watch_success gauge\n");
    for row in rows {
        let success = match row.success {
            Some(true) => 1,
            _ => 0,
        };
        out.push_str(&format!(
            "web_monitor_watch_success{{watch=\"{}\",name=\"{}\"}} {success}\n",
            metric_escape(&row.id),
            metric_escape(&row.name),
        ));
    }
    out.push_str("# HELP web_monitor_watch_errors_total Failed checks per watch\n");
    out.push_str("# TYPE web_monitor_watch_errors_total counter\n");
    for row in rows {
        out.push_str(&format!(
            "web_monitor_watch_errors_total{{watch=\"{}\",name=\"{}\"}} {}\n",
            metric_escape(&row.id),
            metric_escape(&row.name),
            row.errors_total,
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn row(name: &str, success: Option<bool>) -> WatchRow {
        WatchRow {
            id: "abcd1234".to_string(),
            name: name.to_string(),
            url: "https://example.com".to_string(),
            success,
            last_check: Some(Utc.with_ymd_and_hms(2026, 8, 2, 12, 0, 0).unwrap()),
            changes: 2,
            error_count: 1,
            errors_total: 5,
            last_error: None,
        }
    }

    #[test]
    fn metrics_exposition_format() {
        let out = render_metrics(&[row("Shop", Some(true)), row("Blog", Some(false))], 42);
        assert!(out.contains("web_monitor_up 1\n"));
        assert!(out.contains("web_monitor_uptime_seconds 42\n"));
        assert!(out.contains("web_monitor_watch_success{watch=\"abcd1234\",name=\"Shop\"} 1\n"));
        assert!(out.contains("web_monitor_watch_success{watch=\"abcd1234\",name=\"Blog\"} 0\n"));
        assert!(out
            .contains("web_monitor_watch_errors_total{watch=\"abcd1234\",name=\"Blog\"} 5\n"));
    }

    #[test]
    fn metric_labels_are_escaped() {
        let mut bad = row("evil\"name", Some(true));
        bad.id = "a\\b".to_string();
        let out = render_metrics(&[bad], 0);
        assert!(out.contains("watch=\"a\\\\b\",name=\"evil\\\"name\""));
    }

    #[test]
    fn dashboard_marks_failing_rows() {
        let out = render_dashboard(&[row("Shop", Some(false))], 10);
        assert!(out.contains("class=\"err\""));
        assert!(out.contains("Shop"));
        assert!(out.contains("error"));
        let out = render_dashboard(&[row("Shop", None)], 10);
        assert!(out.contains("pending"));
    }

    #[test]
    fn dashboard_escapes_html() {
        let mut r = row("<script>alert(1)</script>", Some(true));
        r.url = "https://example.com/?a=<b>".to_string();
        let out = render_dashboard(&[r], 0);
        assert!(!out.contains("<script>alert"));
        assert!(out.contains("&lt;script&gt;"));
    }
}
