use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by a browser driver implementation.
#[derive(Debug, Error)]
pub enum DriverError {
    /// An operation exceeded its deadline.
    #[error("timed out after {ms}ms: {what}")]
    Timeout {
        /// What was being waited on.
        what: String,
        /// The deadline that elapsed.
        ms: u128,
    },
    /// Navigation to a URL failed.
    #[error("failed to navigate to {url}: {details}")]
    Navigation {
        /// Target URL.
        url: String,
        /// Driver-reported cause.
        details: String,
    },
    /// A selector did not resolve to an element.
    #[error("selector {selector:?} not found: {details}")]
    Selector {
        /// The selector that failed.
        selector: String,
        /// Driver-reported cause.
        details: String,
    },
    /// In-page script evaluation failed.
    #[error("script evaluation failed: {0}")]
    Eval(String),
    /// Driver internal error.
    #[error("driver error: {0}")]
    Internal(String),
}

/// Page-ready criterion for navigation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WaitUntil {
    /// The `load` event fired.
    #[default]
    Load,
    /// The `DOMContentLoaded` event fired.
    #[serde(alias = "dom-content-loaded")]
    Domcontentloaded,
    /// The network went quiet after load.
    #[serde(alias = "networkidle0", alias = "networkidle2")]
    Networkidle,
}

/// A CSS or XPath element selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    /// CSS selector evaluated with `querySelectorAll`.
    Css(String),
    /// XPath expression evaluated with `document.evaluate`.
    Xpath(String),
}

impl Selector {
    /// Interpret `raw` as XPath when flagged or when it starts with `//`.
    pub fn auto(raw: &str, xpath: bool) -> Self {
        if xpath || raw.starts_with("//") {
            Selector::Xpath(raw.to_string())
        } else {
            Selector::Css(raw.to_string())
        }
    }

    /// The raw selector text.
    pub fn raw(&self) -> &str {
        match self {
            Selector::Css(s) | Selector::Xpath(s) => s,
        }
    }
}

/// What `query_all` reads out of each matched element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElementPart {
    /// `textContent`.
    Text,
    /// `innerText`.
    InnerText,
    /// `getAttribute(name)`.
    Attribute(String),
    /// The form-control `value` property.
    Value,
    /// `innerHTML`.
    InnerHtml,
    /// `outerHTML`.
    OuterHtml,
    /// `{value, text}` records for non-empty-value `<option>` children.
    Options,
}

/// Viewport dimensions for a browser context.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Viewport {
    /// Width in CSS pixels.
    pub width: u32,
    /// Height in CSS pixels.
    pub height: u32,
}

/// A cookie pre-added to a browser context.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cookie {
    /// Cookie name.
    pub name: String,
    /// Cookie value.
    pub value: String,
    /// Domain scope.
    #[serde(default)]
    pub domain: Option<String>,
    /// Path scope.
    #[serde(default)]
    pub path: Option<String>,
    /// URL scope, used when `domain` is absent.
    #[serde(default)]
    pub url: Option<String>,
}

/// Proxy configuration, either global or per watch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    /// Proxy server URL, e.g. `http://host:3128`.
    pub server: String,
    /// Optional proxy username.
    #[serde(default)]
    pub username: Option<String>,
    /// Optional proxy password.
    #[serde(default)]
    pub password: Option<String>,
}

/// Per-run browser context options derived from a watch configuration.
#[derive(Debug, Clone, Default)]
pub struct ContextOptions {
    /// User agent override.
    pub user_agent: Option<String>,
    /// Viewport override.
    pub viewport: Option<Viewport>,
    /// BCP-47 locale override.
    pub locale: Option<String>,
    /// IANA timezone override.
    pub timezone: Option<String>,
    /// Extra HTTP headers sent with every request.
    pub headers: BTreeMap<String, String>,
    /// Cookies added before navigation.
    pub cookies: Vec<Cookie>,
    /// Per-watch proxy override.
    pub proxy: Option<ProxyConfig>,
    /// Resource types to abort at the network layer.
    pub block_resources: Vec<String>,
    /// Storage state to restore, when a prior session was persisted.
    pub storage_state_path: Option<PathBuf>,
}

/// The process-wide browser handle. Only `new_context` is ever called
/// concurrently; contexts are exclusive to a single run.
#[async_trait]
pub trait BrowserHandle: Send + Sync {
    /// Create a fresh, isolated context configured with `opts`.
    async fn new_context(&self, opts: &ContextOptions) -> Result<Box<dyn PageContext>, DriverError>;

    /// Tear the browser down at shutdown.
    async fn close(&self);
}

/// An isolated browsing context owned by one pipeline run.
#[async_trait]
pub trait PageContext: Send + Sync {
    /// Open the context's page.
    async fn new_page(&self) -> Result<Box<dyn PageSurface>, DriverError>;

    /// Persist cookies/localStorage to `path` for session reuse.
    async fn save_storage_state(&self, path: &Path) -> Result<(), DriverError>;

    /// Release the context. Always called, including on error paths.
    async fn close(&self);
}

/// The narrow page surface the action and extractor engines run against.
/// Child frames are themselves `PageSurface`s.
#[async_trait]
pub trait PageSurface: Send + Sync {
    /// Navigate and wait for the given readiness criterion.
    async fn goto(
        &self,
        url: &str,
        timeout: Duration,
        wait_until: WaitUntil,
    ) -> Result<(), DriverError>;

    /// Wait until `selector` matches at least one element.
    async fn wait_for_selector(
        &self,
        selector: &Selector,
        timeout: Duration,
    ) -> Result<(), DriverError>;

    /// Wait for the next navigation to settle.
    async fn wait_for_navigation(&self, timeout: Duration) -> Result<(), DriverError>;

    /// Read `part` from every element matched by `selector`, in document order.
    async fn query_all(
        &self,
        selector: &Selector,
        part: &ElementPart,
    ) -> Result<Vec<Value>, DriverError>;

    /// Number of elements matched by `selector`.
    async fn count(&self, selector: &Selector) -> Result<u64, DriverError>;

    /// Evaluate a script inside the page. The script string is forwarded
    /// verbatim; the core never interprets it.
    async fn evaluate(&self, script: &str) -> Result<Value, DriverError>;

    /// The document body's visible text.
    async fn body_text(&self) -> Result<String, DriverError>;

    /// Child frames in document order. May be empty when the driver cannot
    /// enumerate frames.
    async fn frames(&self) -> Result<Vec<Box<dyn PageSurface>>, DriverError>;

    /// Current page URL.
    async fn url(&self) -> String;

    /// Current page title.
    async fn title(&self) -> Result<String, DriverError>;

    /// Write a PNG screenshot to `path`.
    async fn screenshot(&self, path: &Path, full_page: bool) -> Result<(), DriverError>;

    /// Click the first element matched by `selector`.
    async fn click(&self, selector: &Selector) -> Result<(), DriverError>;

    /// Replace the value of the matched form control with `text`.
    async fn fill(&self, selector: &Selector, text: &str) -> Result<(), DriverError>;

    /// Type `text` into the matched element with a per-key delay.
    async fn type_text(
        &self,
        selector: &Selector,
        text: &str,
        delay: Duration,
    ) -> Result<(), DriverError>;

    /// Press a named keyboard key.
    async fn press_key(&self, key: &str) -> Result<(), DriverError>;

    /// Select an option by value on the matched `<select>`.
    async fn select_option(&self, selector: &Selector, value: &str) -> Result<(), DriverError>;

    /// Hover the matched element.
    async fn hover(&self, selector: &Selector) -> Result<(), DriverError>;

    /// Scroll the matched element into view.
    async fn scroll_into_view(&self, selector: &Selector) -> Result<(), DriverError>;

    /// Scroll the window by a pixel delta.
    async fn scroll_by(&self, x: f64, y: f64) -> Result<(), DriverError>;
}
