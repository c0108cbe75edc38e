use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{info, warn};

use watch_core::compare::ChangeRecord;
use watch_core::template::{self, RenderInput};
use watch_core::watch::{ChannelSpec, WatchConfig};

use crate::engine::Engine;

/// Sink for rendered notifications; the runner only sees this trait.
#[async_trait]
pub trait Notify: Send + Sync {
    /// Dispatch a change notification, subject to the throttle window.
    async fn notify_changes(
        &self,
        watch: &WatchConfig,
        changes: &[ChangeRecord],
        data: &Map<String, Value>,
        previous: Option<&Map<String, Value>>,
    );

    /// Dispatch a persistent-failure notification. Never throttled.
    async fn notify_error(&self, watch: &WatchConfig, failures: u32, error: &str);
}

/// A concrete transport target resolved from channel config or environment.
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    Telegram {
        bot_token: String,
        chat_id: String,
        enable_preview: bool,
    },
    Ntfy {
        url: String,
        title: Option<String>,
        priority: Option<String>,
        tags: Option<String>,
    },
    Webhook {
        url: String,
        headers: BTreeMap<String, String>,
    },
}

/// Templates messages, enforces throttling and fans out over HTTP.
pub struct Router {
    engine: Engine,
    client: reqwest::Client,
}

impl Router {
    pub fn new(engine: Engine) -> Router {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Router { engine, client }
    }

    async fn dispatch_all(&self, watch: &WatchConfig, message: &str) -> bool {
        let targets = resolve_targets(watch, self.engine.settings());
        if targets.is_empty() {
            info!("no notification transport configured for {}", watch.display_name());
            return false;
        }
        let mut accepted = false;
        for target in targets {
            match self.dispatch(watch, &target, message).await {
                Ok(()) => accepted = true,
                Err(err) => warn!(
                    "notification dispatch failed for {}: {err:#}",
                    watch.display_name()
                ),
            }
        }
        accepted
    }

    async fn dispatch(&self, watch: &WatchConfig, target: &Target, message: &str) -> Result<()> {
        match target {
            Target::Telegram { bot_token, chat_id, enable_preview } => {
                let url = format!("https://api.telegram.org/bot{bot_token}/sendMessage");
                self.client
                    .post(&url)
                    .json(&json!({
                        "chat_id": chat_id,
                        "text": message,
                        "parse_mode": "HTML",
                        "disable_web_page_preview": !enable_preview,
                    }))
                    .send()
                    .await
                    .context("telegram send")?
                    .error_for_status()
                    .context("telegram status")?;
            }
            Target::Ntfy { url, title, priority, tags } => {
                let mut request = self
                    .client
                    .post(url)
                    .header("Title", title.clone().unwrap_or_else(|| {
                        watch.display_name().to_string()
                    }));
                if let Some(priority) = priority {
                    request = request.header("Priority", priority.clone());
                }
                if let Some(tags) = tags {
                    request = request.header("Tags", tags.clone());
                }
                request
                    .body(strip_html(message))
                    .send()
                    .await
                    .context("ntfy send")?
                    .error_for_status()
                    .context("ntfy status")?;
            }
            Target::Webhook { url, headers } => {
                let mut request = self.client.post(url);
                for (name, value) in headers {
                    request = request.header(name.as_str(), value.as_str());
                }
                request
                    .json(&json!({
                        "watch": watch.display_name(),
                        "id": watch.watch_id(),
                        "url": watch.url,
                        "message": message,
                        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                    }))
                    .send()
                    .await
                    .context("webhook send")?
                    .error_for_status()
                    .context("webhook status")?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Notify for Router {
    async fn notify_changes(
        &self,
        watch: &WatchConfig,
        changes: &[ChangeRecord],
        data: &Map<String, Value>,
        previous: Option<&Map<String, Value>>,
    ) {
        let id = watch.watch_id();
        let window = self.engine.settings().notification_throttle;
        if !self.engine.notification_allowed(&id, window).await {
            info!("notification for {} suppressed by throttle", watch.display_name());
            return;
        }
        let input = RenderInput {
            name: watch.display_name(),
            url: &watch.url,
            timestamp: Utc::now(),
            changes,
            data,
            previous,
        };
        let message = template::render_message(watch.message_template.as_deref(), &input);
        if self.dispatch_all(watch, &message).await {
            self.engine.mark_notified(&id).await;
        }
    }

    async fn notify_error(&self, watch: &WatchConfig, failures: u32, error: &str) {
        let message = template::render_error_message(
            watch.display_name(),
            &watch.url,
            failures,
            error,
        );
        self.dispatch_all(watch, &message).await;
    }
}

/// Resolve the targets for one watch: its declared channels in order, or
/// the globally configured transports when it declares none.
pub fn resolve_targets(watch: &WatchConfig, settings: &watch_core::cfg::Settings) -> Vec<Target> {
    if watch.notifications.is_empty() {
        return global_targets(settings);
    }
    watch
        .notifications
        .iter()
        .filter_map(|channel| channel_target(channel, settings))
        .collect()
}

fn channel_target(
    channel: &ChannelSpec,
    settings: &watch_core::cfg::Settings,
) -> Option<Target> {
    let kind = channel.kind.clone().unwrap_or_else(|| {
        if channel.telegram.is_some() {
            "telegram".to_string()
        } else if channel.ntfy.is_some() {
            "ntfy".to_string()
        } else if channel.webhook.is_some() {
            "webhook".to_string()
        } else {
            String::new()
        }
    });
    match kind.as_str() {
        "telegram" => {
            let overrides = channel.telegram.as_ref();
            let bot_token = overrides
                .and_then(|t| t.bot_token.clone())
                .or_else(|| settings.telegram.as_ref().map(|t| t.bot_token.clone()))?;
            let chat_id = overrides
                .and_then(|t| t.chat_id.clone())
                .or_else(|| settings.telegram.as_ref().map(|t| t.chat_id.clone()))?;
            Some(Target::Telegram {
                bot_token,
                chat_id,
                enable_preview: overrides.map(|t| t.enable_preview).unwrap_or(false),
            })
        }
        "ntfy" => {
            let ntfy = channel.ntfy.as_ref();
            let url = ntfy
                .map(|n| n.url.clone())
                .or_else(|| settings.ntfy_url.clone())?;
            Some(Target::Ntfy {
                url,
                title: ntfy.and_then(|n| n.title.clone()),
                priority: ntfy.and_then(|n| n.priority.clone()),
                tags: ntfy.and_then(|n| n.tags.clone()),
            })
        }
        "webhook" => {
            let webhook = channel.webhook.as_ref();
            let url = webhook
                .map(|w| w.url.clone())
                .or_else(|| settings.webhook_url.clone())?;
            Some(Target::Webhook {
                url,
                headers: webhook.map(|w| w.headers.clone()).unwrap_or_default(),
            })
        }
        other => {
            warn!("unknown notification channel type {other:?}, skipping");
            None
        }
    }
}

fn global_targets(settings: &watch_core::cfg::Settings) -> Vec<Target> {
    let mut targets = Vec::new();
    if let Some(telegram) = &settings.telegram {
        targets.push(Target::Telegram {
            bot_token: telegram.bot_token.clone(),
            chat_id: telegram.chat_id.clone(),
            enable_preview: false,
        });
    }
    if let Some(url) = &settings.ntfy_url {
        targets.push(Target::Ntfy {
            url: url.clone(),
            title: None,
            priority: None,
            tags: None,
        });
    }
    if let Some(url) = &settings.webhook_url {
        targets.push(Target::Webhook { url: url.clone(), headers: BTreeMap::new() });
    }
    targets
}

/// ntfy bodies are plain text; drop any markup the template produced.
pub fn strip_html(message: &str) -> String {
    let re = regex::Regex::new("<[^>]*>").expect("static regex");
    re.replace_all(message, "").into_owned()
}
