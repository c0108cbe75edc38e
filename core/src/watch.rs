use anyhow::{bail, Context, Result};
use serde::de::{self, Deserializer};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::browser::{Cookie, ProxyConfig, Viewport, WaitUntil};
use crate::cron::CronExpr;
use crate::md5_hex;
use crate::transform::TransformStep;

/// Extractor type vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExtractorKind {
    /// Trimmed `textContent` per match.
    Text,
    /// Trimmed `innerText` per match.
    InnerText,
    /// `getAttribute(attribute)` per match.
    Attribute,
    /// Form-control `value` per match.
    Value,
    /// `{value, text}` records for `<option>`s under matched selects.
    Options,
    /// `innerHTML` per match.
    Html,
    /// `outerHTML` per match.
    OuterHtml,
    /// Match count.
    Count,
    /// Whether any element matches, optionally frame-aware.
    Exists,
    /// Current page URL.
    Url,
    /// Page title.
    Title,
    /// Trimmed `textContent` for XPath matches.
    Xpath,
    /// Result of in-page script evaluation.
    Evaluate,
    /// JSON-parse of the page body text, with optional `path`.
    Json,
    /// JSON-parse of a `<script>` body, with optional `path`.
    JsonFromScript,
    /// Full-page PNG; the value is the file path.
    Screenshot,
}

impl ExtractorKind {
    /// Whether this extractor type needs a `selector` to run.
    pub fn requires_selector(self) -> bool {
        matches!(
            self,
            ExtractorKind::Text
                | ExtractorKind::InnerText
                | ExtractorKind::Attribute
                | ExtractorKind::Value
                | ExtractorKind::Options
                | ExtractorKind::Html
                | ExtractorKind::OuterHtml
                | ExtractorKind::Count
                | ExtractorKind::Exists
                | ExtractorKind::Xpath
        )
    }
}

/// One declared extractor: produces one named value per run.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractorSpec {
    /// Result key in the snapshot.
    #[serde(default)]
    pub name: String,
    /// Extractor type.
    #[serde(rename = "type")]
    pub kind: ExtractorKind,
    /// CSS selector (XPath when `xpath` is set or the type is `xpath`).
    #[serde(default)]
    pub selector: Option<String>,
    /// Reinterpret `selector` as XPath.
    #[serde(default)]
    pub xpath: bool,
    /// Attribute name for `attribute`-typed extractors.
    #[serde(default)]
    pub attribute: Option<String>,
    /// JSON path applied to `json`/`jsonFromScript` results.
    #[serde(default)]
    pub path: Option<String>,
    /// Fall back to child frames when the main frame yields nothing.
    #[serde(default)]
    pub check_frames: bool,
    /// Value substituted when extraction fails.
    #[serde(default)]
    pub default: Option<Value>,
    /// Script body for `evaluate`-typed extractors.
    #[serde(default)]
    pub script: Option<String>,
    /// Single transform name; options come from `filter` or inline fields.
    #[serde(default)]
    pub transform: Option<String>,
    /// Ordered transform chain.
    #[serde(default)]
    pub transforms: Vec<TransformStep>,
    /// Options object for the single `transform`.
    #[serde(default)]
    pub filter: Option<Value>,
    /// Per-field comparator override.
    #[serde(default)]
    pub comparator: Option<String>,
    /// Per-field numeric threshold override.
    #[serde(default)]
    pub threshold: Option<f64>,
    /// Inline options for the single `transform` (unknown fields land here).
    #[serde(flatten)]
    pub options: Map<String, Value>,
}

impl ExtractorSpec {
    /// A plain `text` extractor, the most common declaration.
    pub fn text_named(name: impl Into<String>, selector: impl Into<String>) -> Self {
        ExtractorSpec {
            name: name.into(),
            kind: ExtractorKind::Text,
            selector: Some(selector.into()),
            xpath: false,
            attribute: None,
            path: None,
            check_frames: false,
            default: None,
            script: None,
            transform: None,
            transforms: Vec::new(),
            filter: None,
            comparator: None,
            threshold: None,
            options: Map::new(),
        }
    }

    /// The effective transform chain: the single `transform` (options from
    /// `filter` or the inline fields) followed by the `transforms` list.
    pub fn transform_steps(&self) -> Vec<TransformStep> {
        let mut steps = Vec::new();
        if let Some(name) = &self.transform {
            let options = self
                .filter
                .as_ref()
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_else(|| self.options.clone());
            steps.push(TransformStep::with_options(name.clone(), options));
        }
        steps.extend(self.transforms.iter().cloned());
        steps
    }
}

/// Action type vocabulary. Unknown tags become [`ActionKind::Unknown`],
/// which executes as a no-op.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ActionKind {
    /// Sleep for `ms`.
    Wait {
        /// Milliseconds to sleep.
        #[serde(default)]
        ms: Option<u64>,
    },
    /// Wait until a CSS selector matches.
    WaitForSelector {
        /// Selector to wait for.
        selector: String,
        /// Deadline in ms (default 30s).
        #[serde(default)]
        timeout: Option<u64>,
    },
    /// Wait until an XPath expression matches.
    WaitForXPath {
        /// XPath to wait for.
        xpath: String,
        /// Deadline in ms (default 30s).
        #[serde(default)]
        timeout: Option<u64>,
    },
    /// Wait for the next navigation to settle.
    WaitForNavigation {
        /// Deadline in ms (default 30s).
        #[serde(default)]
        timeout: Option<u64>,
    },
    /// Click the first match, probing child frames unless disabled.
    Click {
        /// Selector to click (`//`-prefixed means XPath).
        selector: String,
        /// Probe child frames when the main frame misses (default true).
        #[serde(default)]
        check_frames: Option<bool>,
    },
    /// Replace a form control's value.
    Type {
        /// Target control.
        selector: String,
        /// Replacement text.
        text: String,
    },
    /// Type with a per-key delay.
    TypeSlowly {
        /// Target control.
        selector: String,
        /// Text to type.
        text: String,
        /// Per-key delay in ms.
        #[serde(default)]
        delay: Option<u64>,
    },
    /// Press a named key.
    PressKey {
        /// Key name, e.g. `Enter`.
        key: String,
    },
    /// Select an option by value.
    Select {
        /// Target `<select>`.
        selector: String,
        /// Option value.
        value: String,
    },
    /// Hover an element.
    Hover {
        /// Target element.
        selector: String,
    },
    /// Scroll an element into view, or the window by a delta.
    Scroll {
        /// Element to scroll into view, when present.
        #[serde(default)]
        selector: Option<String>,
        /// Horizontal window delta.
        #[serde(default)]
        x: Option<f64>,
        /// Vertical window delta.
        #[serde(default)]
        y: Option<f64>,
    },
    /// Evaluate a script; the result lands in the action context under
    /// `evalResult`.
    Evaluate {
        /// Script body, forwarded verbatim.
        script: String,
    },
    /// Capture a screenshot mid-script.
    Screenshot {
        /// Output path override.
        #[serde(default)]
        path: Option<String>,
        /// Capture the full page.
        #[serde(default)]
        full_page: bool,
    },
    /// Write a value into the action context.
    SetVariable {
        /// Context slot.
        name: String,
        /// Stored value.
        value: Value,
    },
    /// Composite login: fill username and password, submit, wait.
    Login {
        /// Username field selector.
        #[serde(default)]
        username_selector: Option<String>,
        /// Username text.
        #[serde(default)]
        username: Option<String>,
        /// Password field selector.
        #[serde(default)]
        password_selector: Option<String>,
        /// Password text.
        #[serde(default)]
        password: Option<String>,
        /// Submit button selector.
        #[serde(default)]
        submit_selector: Option<String>,
    },
    /// Unrecognized action tag; executes as a no-op.
    #[serde(skip)]
    Unknown {
        /// The tag that was not recognized.
        type_name: String,
    },
}

/// One scripted step with its condition and failure policy.
#[derive(Debug, Clone)]
pub struct ActionSpec {
    /// What to do.
    pub kind: ActionKind,
    /// Skip the action when this condition is false.
    pub condition: Option<ConditionSpec>,
    /// Suppress failures instead of aborting the script.
    pub optional: bool,
    /// Pause after success, in ms.
    pub delay: Option<u64>,
}

impl<'de> Deserialize<'de> for ActionSpec {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let mut value = Value::deserialize(deserializer)?;
        let obj = value
            .as_object_mut()
            .ok_or_else(|| de::Error::custom("action must be an object"))?;
        let condition = match obj.remove("if") {
            Some(v) => Some(ConditionSpec::deserialize(v).map_err(de::Error::custom)?),
            None => None,
        };
        let optional = obj
            .remove("optional")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let delay = obj.remove("delay").and_then(|v| v.as_u64());
        let kind = match ActionKind::deserialize(value.clone()) {
            Ok(kind) => kind,
            Err(_) => ActionKind::Unknown {
                type_name: value
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string(),
            },
        };
        Ok(ActionSpec { kind, condition, optional, delay })
    }
}

/// Condition attached to an action via `if`. Unknown condition types pass.
#[derive(Debug, Clone)]
pub enum ConditionSpec {
    /// An element matches the selector.
    Exists {
        /// Selector to probe.
        selector: String,
    },
    /// No element matches the selector.
    NotExists {
        /// Selector to probe.
        selector: String,
    },
    /// The first match's text contains a substring.
    TextContains {
        /// Selector to probe.
        selector: String,
        /// Substring to look for.
        text: String,
    },
    /// An action-context slot is truthy.
    Variable {
        /// Context slot name.
        name: String,
    },
    /// An in-page script returns truthy.
    Evaluate {
        /// Script body, forwarded verbatim.
        script: String,
    },
    /// Unrecognized condition type; always passes.
    Unknown(String),
}

impl<'de> Deserialize<'de> for ConditionSpec {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let field = |key: &str| {
            value
                .get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        let parsed = match kind.as_str() {
            "exists" => field("selector").map(|selector| ConditionSpec::Exists { selector }),
            "notExists" => field("selector").map(|selector| ConditionSpec::NotExists { selector }),
            "textContains" => match (field("selector"), field("text")) {
                (Some(selector), Some(text)) => Some(ConditionSpec::TextContains { selector, text }),
                _ => None,
            },
            "variable" => field("name").map(|name| ConditionSpec::Variable { name }),
            "evaluate" => field("script").map(|script| ConditionSpec::Evaluate { script }),
            _ => None,
        };
        Ok(parsed.unwrap_or(ConditionSpec::Unknown(kind)))
    }
}

/// Telegram channel override.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelegramChannel {
    /// Bot token; the global token applies when absent.
    #[serde(default)]
    pub bot_token: Option<String>,
    /// Chat id; the global chat applies when absent.
    #[serde(default)]
    pub chat_id: Option<String>,
    /// Keep link previews on.
    #[serde(default)]
    pub enable_preview: bool,
}

/// ntfy channel declaration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NtfyChannel {
    /// Topic URL.
    pub url: String,
    /// `Title` header override.
    #[serde(default)]
    pub title: Option<String>,
    /// `Priority` header.
    #[serde(default)]
    pub priority: Option<String>,
    /// `Tags` header.
    #[serde(default)]
    pub tags: Option<String>,
}

/// Generic webhook channel declaration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookChannel {
    /// Endpoint URL.
    pub url: String,
    /// Headers merged over `Content-Type: application/json`.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

/// One per-watch notification channel. The transport is selected by `type`
/// or inferred from whichever sub-object is present.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSpec {
    /// Explicit transport name.
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    /// Telegram settings.
    #[serde(default)]
    pub telegram: Option<TelegramChannel>,
    /// ntfy settings.
    #[serde(default)]
    pub ntfy: Option<NtfyChannel>,
    /// Webhook settings.
    #[serde(default)]
    pub webhook: Option<WebhookChannel>,
}

/// How a watch is scheduled.
#[derive(Debug, Clone)]
pub enum Cadence {
    /// Fixed-period ticker.
    Every(Duration),
    /// Cron predicate evaluated each minute.
    Cron(CronExpr),
}

fn default_true() -> bool {
    true
}

/// One declarative watch configuration document.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchConfig {
    /// Stable id; derived from the URL hash when absent.
    #[serde(default)]
    pub id: Option<String>,
    /// Display name.
    #[serde(default)]
    pub name: Option<String>,
    /// Page or endpoint to load.
    #[serde(default)]
    pub url: String,
    /// Disabled watches are loaded but never scheduled.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Fixed period in ms; mutually exclusive with `schedule`.
    #[serde(default)]
    pub interval: Option<u64>,
    /// Cron expression; mutually exclusive with `interval`.
    #[serde(default)]
    pub schedule: Option<String>,
    /// User agent override.
    #[serde(default)]
    pub user_agent: Option<String>,
    /// Viewport override.
    #[serde(default)]
    pub viewport: Option<Viewport>,
    /// BCP-47 locale override.
    #[serde(default)]
    pub locale: Option<String>,
    /// IANA timezone override.
    #[serde(default)]
    pub timezone: Option<String>,
    /// Extra HTTP headers.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Cookies added before navigation.
    #[serde(default)]
    pub cookies: Vec<Cookie>,
    /// Per-watch proxy override.
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
    /// Resource types aborted at the network layer.
    #[serde(default)]
    pub block_resources: Vec<String>,
    /// Persist cookies/localStorage across runs.
    #[serde(default)]
    pub persist_session: bool,
    /// Scripted interaction run before extraction.
    #[serde(default)]
    pub actions: Vec<ActionSpec>,
    /// Post-action settlement selector (silent 30s wait).
    #[serde(default)]
    pub wait_for_selector: Option<String>,
    /// Post-action settlement sleep in ms.
    #[serde(default)]
    pub wait_ms: Option<u64>,
    /// Ordered extractor list; must be non-empty.
    #[serde(default)]
    pub extractors: Vec<ExtractorSpec>,
    /// Default comparator for all extractors.
    #[serde(default)]
    pub comparator: Option<String>,
    /// Default numeric threshold.
    #[serde(default)]
    pub threshold: Option<f64>,
    /// User-supplied comparator body (unsupported; kept for diagnostics).
    #[serde(default)]
    pub custom_comparator: Option<String>,
    /// Navigation attempts; the global default applies when absent.
    #[serde(default)]
    pub retries: Option<u32>,
    /// Navigation timeout in ms (default 60s).
    #[serde(default)]
    pub timeout: Option<u64>,
    /// Page-ready criterion.
    #[serde(default)]
    pub wait_until: Option<WaitUntil>,
    /// Capture a screenshot when a run fails.
    #[serde(default)]
    pub screenshot_on_error: bool,
    /// Emit error notifications after repeated failures.
    #[serde(default)]
    pub notify_on_error: bool,
    /// Consecutive failures before notifying; global default when absent.
    #[serde(default)]
    pub error_threshold: Option<u32>,
    /// Per-watch notification channels; global transports apply when empty.
    #[serde(default)]
    pub notifications: Vec<ChannelSpec>,
    /// Message template with `{{placeholder}}` substitution.
    #[serde(default)]
    pub message_template: Option<String>,
    /// Source document path, attached at load.
    #[serde(skip)]
    pub source_file: Option<PathBuf>,
    /// MD5 of the source JSON, attached at load.
    #[serde(skip)]
    pub content_hash: String,
}

impl WatchConfig {
    /// Stable watch id: the configured `id`, else the 8-hex prefix of
    /// MD5(url).
    pub fn watch_id(&self) -> String {
        match &self.id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => md5_hex(self.url.as_bytes())[..8].to_string(),
        }
    }

    /// Display name, falling back to the URL.
    pub fn display_name(&self) -> &str {
        match &self.name {
            Some(name) if !name.is_empty() => name,
            _ => &self.url,
        }
    }

    /// The scheduling cadence, with the process-wide default period.
    pub fn cadence(&self, default_interval: Duration) -> Cadence {
        if let Some(raw) = &self.schedule {
            if let Ok(expr) = CronExpr::parse(raw) {
                return Cadence::Cron(expr);
            }
        }
        Cadence::Every(
            self.interval
                .map(Duration::from_millis)
                .unwrap_or(default_interval),
        )
    }

    /// Reject configurations that cannot be scheduled or extracted from.
    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            bail!("watch is missing a url");
        }
        if self.interval.is_some() && self.schedule.is_some() {
            bail!("watch declares both interval and schedule");
        }
        if let Some(raw) = &self.schedule {
            CronExpr::parse(raw).with_context(|| format!("watch schedule {raw:?}"))?;
        }
        if self.extractors.is_empty() {
            bail!("watch declares no extractors");
        }
        for (i, extractor) in self.extractors.iter().enumerate() {
            if extractor.name.trim().is_empty() {
                bail!("extractor #{i} is missing a name");
            }
            if extractor.kind.requires_selector() && extractor.selector.is_none() {
                bail!("extractor {:?} is missing a selector", extractor.name);
            }
            if extractor.kind == ExtractorKind::Attribute && extractor.attribute.is_none() {
                bail!("extractor {:?} is missing the attribute name", extractor.name);
            }
        }
        Ok(())
    }
}

/// A config document that could not be loaded, with the reason.
#[derive(Debug)]
pub struct RejectedConfig {
    /// Document path.
    pub path: PathBuf,
    /// Parse or validation failure.
    pub reason: String,
}

/// Outcome of one scan of the config directory.
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Valid watches, in filename order.
    pub watches: Vec<WatchConfig>,
    /// Rejected documents.
    pub rejected: Vec<RejectedConfig>,
}

/// Parse and validate one watch document, attaching the source path and
/// content hash.
pub fn load_file(path: &Path) -> Result<WatchConfig> {
    let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let raw: Value =
        serde_json::from_str(&text).with_context(|| format!("parse {}", path.display()))?;
    let hash = crate::md5_json(&raw);
    let mut watch: WatchConfig =
        serde_json::from_value(raw).with_context(|| format!("decode {}", path.display()))?;
    watch.validate().with_context(|| format!("validate {}", path.display()))?;
    watch.source_file = Some(path.to_path_buf());
    watch.content_hash = hash;
    Ok(watch)
}

/// Scan a directory for `*.json` watch documents. A missing directory is an
/// empty report; unreadable entries land in `rejected`.
pub fn load_dir(dir: &Path) -> Result<LoadReport> {
    let mut report = LoadReport::default();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(report),
        Err(err) => return Err(err).with_context(|| format!("scan {}", dir.display())),
    };
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
        .collect();
    paths.sort();
    for path in paths {
        match load_file(&path) {
            Ok(watch) => report.watches.push(watch),
            Err(err) => report.rejected.push(RejectedConfig {
                path,
                reason: format!("{err:#}"),
            }),
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: Value) -> WatchConfig {
        serde_json::from_value(value).unwrap()
    }

    fn minimal() -> Value {
        json!({
            "name": "Demo",
            "url": "https://example.com",
            "extractors": [{"name": "title", "type": "title"}]
        })
    }

    #[test]
    fn minimal_document_parses_and_validates() {
        let w = parse(minimal());
        assert!(w.enabled);
        assert_eq!(w.display_name(), "Demo");
        w.validate().unwrap();
    }

    #[test]
    fn id_derives_from_url_hash() {
        let w = parse(minimal());
        let expected = &md5_hex(b"https://example.com")[..8];
        assert_eq!(w.watch_id(), expected);
        let mut with_id = parse(minimal());
        with_id.id = Some("my-watch".into());
        assert_eq!(with_id.watch_id(), "my-watch");
    }

    #[test]
    fn interval_and_schedule_are_mutually_exclusive() {
        let mut doc = minimal();
        doc["interval"] = json!(60000);
        doc["schedule"] = json!("*/5 * * * *");
        assert!(parse(doc).validate().is_err());
    }

    #[test]
    fn missing_url_and_empty_extractors_are_rejected() {
        let w = parse(json!({"extractors": [{"name": "t", "type": "title"}]}));
        assert!(w.validate().is_err());
        let w = parse(json!({"url": "https://example.com"}));
        assert!(w.validate().is_err());
    }

    #[test]
    fn selector_requirements_are_enforced() {
        let mut doc = minimal();
        doc["extractors"] = json!([{"name": "t", "type": "text"}]);
        assert!(parse(doc.clone()).validate().is_err());
        doc["extractors"] = json!([{"name": "t", "type": "attribute", "selector": "a"}]);
        assert!(parse(doc.clone()).validate().is_err());
        doc["extractors"] =
            json!([{"name": "t", "type": "attribute", "selector": "a", "attribute": "href"}]);
        parse(doc).validate().unwrap();
    }

    #[test]
    fn unknown_top_level_fields_are_ignored() {
        let mut doc = minimal();
        doc["futureKnob"] = json!({"nested": true});
        parse(doc).validate().unwrap();
    }

    #[test]
    fn camel_case_fields_bind() {
        let doc = json!({
            "url": "https://example.com",
            "userAgent": "UA",
            "blockResources": ["image", "font"],
            "persistSession": true,
            "waitForSelector": ".ready",
            "waitMs": 250,
            "screenshotOnError": true,
            "notifyOnError": true,
            "errorThreshold": 5,
            "messageTemplate": "{{name}}",
            "customComparator": "return {changed: false}",
            "extractors": [{"name": "t", "type": "title"}]
        });
        let w = parse(doc);
        assert_eq!(w.user_agent.as_deref(), Some("UA"));
        assert_eq!(w.block_resources, vec!["image", "font"]);
        assert!(w.persist_session);
        assert_eq!(w.wait_for_selector.as_deref(), Some(".ready"));
        assert_eq!(w.wait_ms, Some(250));
        assert!(w.screenshot_on_error);
        assert_eq!(w.error_threshold, Some(5));
        assert!(w.custom_comparator.is_some());
    }

    #[test]
    fn actions_parse_with_condition_and_policy() {
        let doc = json!({
            "url": "https://example.com",
            "actions": [
                {"type": "click", "selector": "#accept", "optional": true, "delay": 100,
                 "if": {"type": "exists", "selector": "#accept"}},
                {"type": "teleport", "somewhere": "else"},
                {"type": "setVariable", "name": "page", "value": 2}
            ],
            "extractors": [{"name": "t", "type": "title"}]
        });
        let w = parse(doc);
        assert_eq!(w.actions.len(), 3);
        assert!(w.actions[0].optional);
        assert_eq!(w.actions[0].delay, Some(100));
        assert!(matches!(w.actions[0].kind, ActionKind::Click { .. }));
        assert!(matches!(
            w.actions[0].condition,
            Some(ConditionSpec::Exists { .. })
        ));
        assert!(matches!(
            w.actions[1].kind,
            ActionKind::Unknown { ref type_name } if type_name == "teleport"
        ));
        assert!(matches!(w.actions[2].kind, ActionKind::SetVariable { .. }));
    }

    #[test]
    fn unknown_condition_types_parse_as_unknown() {
        let cond: ConditionSpec =
            serde_json::from_value(json!({"type": "moonPhase", "phase": "full"})).unwrap();
        assert!(matches!(cond, ConditionSpec::Unknown(ref t) if t == "moonPhase"));
        // A known type missing its required field degrades the same way.
        let cond: ConditionSpec = serde_json::from_value(json!({"type": "exists"})).unwrap();
        assert!(matches!(cond, ConditionSpec::Unknown(_)));
    }

    #[test]
    fn single_transform_takes_options_from_filter_or_inline() {
        let spec: ExtractorSpec = serde_json::from_value(json!({
            "name": "v",
            "type": "text",
            "selector": ".v",
            "transform": "replace",
            "pattern": "-", "replacement": "+"
        }))
        .unwrap();
        let steps = spec.transform_steps();
        assert_eq!(steps.len(), 1);
        let TransformStep::Spec { name, options } = &steps[0] else {
            panic!("expected options on the single transform");
        };
        assert_eq!(name, "replace");
        assert_eq!(options.get("pattern"), Some(&json!("-")));

        let spec: ExtractorSpec = serde_json::from_value(json!({
            "name": "v",
            "type": "text",
            "selector": ".v",
            "transform": "filter",
            "filter": {"include": "blue"}
        }))
        .unwrap();
        let TransformStep::Spec { options, .. } = &spec.transform_steps()[0] else {
            panic!("expected options");
        };
        assert_eq!(options.get("include"), Some(&json!("blue")));
    }

    #[test]
    fn cadence_prefers_schedule() {
        let mut doc = minimal();
        doc["schedule"] = json!("*/5 * * * *");
        let w = parse(doc);
        assert!(matches!(w.cadence(Duration::from_secs(300)), Cadence::Cron(_)));
        let mut doc = minimal();
        doc["interval"] = json!(1000);
        let w = parse(doc);
        match w.cadence(Duration::from_secs(300)) {
            Cadence::Every(d) => assert_eq!(d, Duration::from_millis(1000)),
            _ => panic!("expected fixed cadence"),
        }
    }

    #[test]
    fn load_dir_reports_rejects_and_hashes() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("ok.json"),
            serde_json::to_string(&minimal()).unwrap(),
        )
        .unwrap();
        fs::write(dir.path().join("bad.json"), "{\"url\": \"x\"").unwrap();
        fs::write(dir.path().join("ignored.txt"), "not a config").unwrap();
        let report = load_dir(dir.path()).unwrap();
        assert_eq!(report.watches.len(), 1);
        assert_eq!(report.rejected.len(), 1);
        let watch = &report.watches[0];
        assert!(!watch.content_hash.is_empty());
        assert!(watch.source_file.as_deref().unwrap().ends_with("ok.json"));

        // Same content, different cosmetic path: hash is content-derived.
        let report2 = load_dir(dir.path()).unwrap();
        assert_eq!(report2.watches[0].content_hash, watch.content_hash);
    }

    #[test]
    fn load_dir_of_missing_directory_is_empty() {
        let report = load_dir(Path::new("/nonexistent/watches")).unwrap();
        assert!(report.watches.is_empty());
        assert!(report.rejected.is_empty());
    }
}
