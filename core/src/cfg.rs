use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::browser::ProxyConfig;

/// Identifier used to compute per-app configuration directories.
#[derive(Clone, Copy)]
pub struct AppId {
    /// Reverse-DNS style qualifier, e.g. `"com"`.
    pub qualifier: &'static str,
    /// Organization or vendor name, e.g. `"local"`.
    pub organization: &'static str,
    /// Application name, e.g. `"watchd"`.
    pub application: &'static str,
}

/// Application configuration persisted to `config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Tracing level to use if `RUST_LOG` is not set (e.g. `"info"`).
    pub log_level: String,
}

/// Return the configuration directory for this app, creating it if needed.
pub fn config_dir(app: &AppId) -> Result<PathBuf> {
    let pd = project_dirs(app)?;
    let dir = pd.config_dir().to_path_buf();
    fs::create_dir_all(&dir).with_context(|| format!("create config dir {}", dir.display()))?;
    Ok(dir)
}

/// Return the data directory for this app, creating it if needed.
pub fn data_dir(app: &AppId) -> Result<PathBuf> {
    let pd = project_dirs(app)?;
    let dir = pd.data_dir().to_path_buf();
    fs::create_dir_all(&dir).with_context(|| format!("create data dir {}", dir.display()))?;
    Ok(dir)
}

fn project_dirs(app: &AppId) -> Result<ProjectDirs> {
    ProjectDirs::from(app.qualifier, app.organization, app.application)
        .ok_or_else(|| anyhow::anyhow!("failed to resolve ProjectDirs"))
}

/// Load `config.toml` from the app config dir or create a default one.
pub fn load_or_init(app: &AppId) -> Result<Config> {
    let dir = config_dir(app)?;
    let path = dir.join("config.toml");
    if path.exists() {
        let txt = fs::read_to_string(&path)
            .with_context(|| format!("read {}", path.display()))?;
        let cfg: Config = toml::from_str(&txt)
            .with_context(|| format!("parse {}", path.display()))?;
        Ok(cfg)
    } else {
        let cfg = Config { log_level: "info".to_string() };
        save_config(&path, &cfg)?;
        Ok(cfg)
    }
}

fn save_config(path: &Path, cfg: &Config) -> Result<()> {
    let s = toml::to_string_pretty(cfg)?;
    fs::write(path, s).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

/// Globally configured telegram transport.
#[derive(Debug, Clone)]
pub struct TelegramSettings {
    /// Bot token for the HTTP API.
    pub bot_token: String,
    /// Destination chat id.
    pub chat_id: String,
}

/// Runtime settings resolved from the environment, with directory defaults
/// derived from the app's config/data dirs.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Directory scanned for watch configuration documents.
    pub config_dir: PathBuf,
    /// Directory holding per-watch state snapshots.
    pub state_dir: PathBuf,
    /// Directory receiving error screenshots.
    pub screenshot_dir: PathBuf,
    /// Directory holding per-watch browser storage state.
    pub session_dir: PathBuf,
    /// Default check period for watches that declare neither interval nor cron.
    pub check_interval: Duration,
    /// Status server port.
    pub health_port: u16,
    /// Navigation attempts per run.
    pub max_retries: u32,
    /// Base delay for the exponential navigation backoff.
    pub retry_base_delay: Duration,
    /// Startup delay between scheduling successive watches.
    pub stagger_delay: Duration,
    /// Minimum wall-clock interval between change notifications per watch.
    pub notification_throttle: Duration,
    /// Consecutive failures before an error notification is emitted.
    pub error_notify_threshold: u32,
    /// Global proxy applied at browser launch.
    pub proxy: Option<ProxyConfig>,
    /// Global telegram transport, if configured.
    pub telegram: Option<TelegramSettings>,
    /// Global ntfy topic URL, if configured.
    pub ntfy_url: Option<String>,
    /// Global webhook URL, if configured.
    pub webhook_url: Option<String>,
}

impl Settings {
    /// Resolve settings from the process environment.
    pub fn from_env(app: &AppId) -> Result<Self> {
        Self::resolve(app, |key| std::env::var(key).ok())
    }

    /// Resolve settings through an arbitrary variable lookup.
    pub fn resolve(app: &AppId, get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let config_dir = match get("CONFIG_DIR") {
            Some(v) => PathBuf::from(v),
            None => config_dir(app)?.join("watches"),
        };
        let data_root = |sub: &str| -> Result<PathBuf> { Ok(data_dir(app)?.join(sub)) };
        let state_dir = match get("STATE_DIR") {
            Some(v) => PathBuf::from(v),
            None => data_root("state")?,
        };
        let screenshot_dir = match get("SCREENSHOT_DIR") {
            Some(v) => PathBuf::from(v),
            None => data_root("screenshots")?,
        };
        let session_dir = match get("SESSION_DIR") {
            Some(v) => PathBuf::from(v),
            None => data_root("sessions")?,
        };

        let proxy = get("PROXY_SERVER").map(|server| ProxyConfig {
            server,
            username: get("PROXY_USERNAME"),
            password: get("PROXY_PASSWORD"),
        });
        let telegram = match (get("TELEGRAM_BOT_TOKEN"), get("TELEGRAM_CHAT_ID")) {
            (Some(bot_token), Some(chat_id)) => Some(TelegramSettings { bot_token, chat_id }),
            _ => None,
        };

        Ok(Settings {
            config_dir,
            state_dir,
            screenshot_dir,
            session_dir,
            check_interval: Duration::from_millis(num(&get, "CHECK_INTERVAL_MS", 300_000)?),
            health_port: num(&get, "HEALTH_PORT", 8080)? as u16,
            max_retries: num(&get, "MAX_RETRIES", 3)? as u32,
            retry_base_delay: Duration::from_millis(num(&get, "RETRY_BASE_DELAY_MS", 5_000)?),
            stagger_delay: Duration::from_millis(num(&get, "STAGGER_DELAY_MS", 2_000)?),
            notification_throttle: Duration::from_millis(num(
                &get,
                "NOTIFICATION_THROTTLE_MS",
                60_000,
            )?),
            error_notify_threshold: num(&get, "ERROR_NOTIFY_THRESHOLD", 3)? as u32,
            proxy,
            telegram,
            ntfy_url: get("NTFY_URL"),
            webhook_url: get("WEBHOOK_URL"),
        })
    }
}

fn num(get: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> Result<u64> {
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .with_context(|| format!("parse {key}={raw}")),
        None => Ok(default),
    }
}
