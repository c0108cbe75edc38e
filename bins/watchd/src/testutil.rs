use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use watch_core::browser::{
    BrowserHandle, ContextOptions, DriverError, ElementPart, PageContext, PageSurface, Selector,
    WaitUntil,
};
use watch_core::compare::ChangeRecord;
use watch_core::watch::WatchConfig;

use crate::notify::Notify;

/// One canned element the stub page serves for a selector.
#[derive(Debug, Clone, Default)]
pub struct StubElement {
    pub text: String,
    pub inner_text: String,
    pub value: Option<String>,
    pub inner_html: String,
    pub outer_html: String,
    pub attrs: HashMap<String, String>,
    pub options: Vec<(String, String)>,
}

impl StubElement {
    pub fn text(s: &str) -> StubElement {
        StubElement {
            text: s.to_string(),
            inner_text: s.to_string(),
            ..StubElement::default()
        }
    }
}

/// Scripted page used to exercise the engines without a real browser.
#[derive(Clone)]
pub struct StubPage {
    pub url: String,
    pub title: String,
    pub body: String,
    pub elements: HashMap<String, Vec<StubElement>>,
    pub eval_results: HashMap<String, Value>,
    pub frames: Vec<StubPage>,
    pub goto_failures: Arc<AtomicU32>,
    log: Arc<Mutex<Vec<String>>>,
}

pub fn page_with(elements: &[(&str, Vec<StubElement>)]) -> StubPage {
    StubPage {
        url: "https://stub.example/".to_string(),
        title: "Stub Page".to_string(),
        body: String::new(),
        elements: elements
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect(),
        eval_results: HashMap::new(),
        frames: Vec::new(),
        goto_failures: Arc::new(AtomicU32::new(0)),
        log: Arc::new(Mutex::new(Vec::new())),
    }
}

impl StubPage {
    pub fn interactions(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn record(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }

    fn find(&self, selector: &Selector) -> &[StubElement] {
        self.elements
            .get(selector.raw())
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    fn require(&self, selector: &Selector) -> Result<&StubElement, DriverError> {
        self.find(selector).first().ok_or_else(|| DriverError::Selector {
            selector: selector.raw().to_string(),
            details: "no match in stub".to_string(),
        })
    }
}

#[async_trait]
impl PageSurface for StubPage {
    async fn goto(
        &self,
        url: &str,
        _timeout: Duration,
        _wait_until: WaitUntil,
    ) -> Result<(), DriverError> {
        self.record(format!("goto:{url}"));
        let remaining = self.goto_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.goto_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(DriverError::Navigation {
                url: url.to_string(),
                details: "stubbed failure".to_string(),
            });
        }
        Ok(())
    }

    async fn wait_for_selector(
        &self,
        selector: &Selector,
        timeout: Duration,
    ) -> Result<(), DriverError> {
        if self.find(selector).is_empty() {
            Err(DriverError::Timeout {
                what: format!("selector {:?}", selector.raw()),
                ms: timeout.as_millis(),
            })
        } else {
            Ok(())
        }
    }

    async fn wait_for_navigation(&self, _timeout: Duration) -> Result<(), DriverError> {
        self.record("wait_for_navigation".to_string());
        Ok(())
    }

    async fn query_all(
        &self,
        selector: &Selector,
        part: &ElementPart,
    ) -> Result<Vec<Value>, DriverError> {
        let out = self
            .find(selector)
            .iter()
            .flat_map(|el| match part {
                ElementPart::Text => vec![Value::String(el.text.clone())],
                ElementPart::InnerText => vec![Value::String(el.inner_text.clone())],
                ElementPart::Attribute(name) => vec![el
                    .attrs
                    .get(name)
                    .map(|v| Value::String(v.clone()))
                    .unwrap_or(Value::Null)],
                ElementPart::Value => vec![el
                    .value
                    .clone()
                    .map(Value::String)
                    .unwrap_or(Value::Null)],
                ElementPart::InnerHtml => vec![Value::String(el.inner_html.clone())],
                ElementPart::OuterHtml => vec![Value::String(el.outer_html.clone())],
                ElementPart::Options => el
                    .options
                    .iter()
                    .map(|(value, text)| {
                        serde_json::json!({"value": value, "text": text})
                    })
                    .collect(),
            })
            .collect();
        Ok(out)
    }

    async fn count(&self, selector: &Selector) -> Result<u64, DriverError> {
        Ok(self.find(selector).len() as u64)
    }

    async fn evaluate(&self, script: &str) -> Result<Value, DriverError> {
        match self.eval_results.get(script) {
            Some(value) => Ok(value.clone()),
            None => Err(DriverError::Eval(format!("no scripted result for {script:?}"))),
        }
    }

    async fn body_text(&self) -> Result<String, DriverError> {
        Ok(self.body.clone())
    }

    async fn frames(&self) -> Result<Vec<Box<dyn PageSurface>>, DriverError> {
        Ok(self
            .frames
            .iter()
            .map(|f| Box::new(f.clone()) as Box<dyn PageSurface>)
            .collect())
    }

    async fn url(&self) -> String {
        self.url.clone()
    }

    async fn title(&self) -> Result<String, DriverError> {
        Ok(self.title.clone())
    }

    async fn screenshot(&self, path: &Path, _full_page: bool) -> Result<(), DriverError> {
        self.record(format!("screenshot:{}", path.display()));
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        std::fs::write(path, b"png").map_err(|e| DriverError::Internal(e.to_string()))?;
        Ok(())
    }

    async fn click(&self, selector: &Selector) -> Result<(), DriverError> {
        self.require(selector)?;
        self.record(format!("click:{}", selector.raw()));
        Ok(())
    }

    async fn fill(&self, selector: &Selector, text: &str) -> Result<(), DriverError> {
        self.require(selector)?;
        self.record(format!("fill:{}={text}", selector.raw()));
        Ok(())
    }

    async fn type_text(
        &self,
        selector: &Selector,
        text: &str,
        _delay: Duration,
    ) -> Result<(), DriverError> {
        self.require(selector)?;
        self.record(format!("type:{}={text}", selector.raw()));
        Ok(())
    }

    async fn press_key(&self, key: &str) -> Result<(), DriverError> {
        self.record(format!("press:{key}"));
        Ok(())
    }

    async fn select_option(&self, selector: &Selector, value: &str) -> Result<(), DriverError> {
        self.require(selector)?;
        self.record(format!("select:{}={value}", selector.raw()));
        Ok(())
    }

    async fn hover(&self, selector: &Selector) -> Result<(), DriverError> {
        self.require(selector)?;
        self.record(format!("hover:{}", selector.raw()));
        Ok(())
    }

    async fn scroll_into_view(&self, selector: &Selector) -> Result<(), DriverError> {
        self.require(selector)?;
        self.record(format!("scroll_into_view:{}", selector.raw()));
        Ok(())
    }

    async fn scroll_by(&self, x: f64, y: f64) -> Result<(), DriverError> {
        self.record(format!("scroll_by:{x},{y}"));
        Ok(())
    }
}

/// Browser stub handing out contexts over one shared scripted page.
pub struct StubBrowser {
    pub page: StubPage,
    pub contexts: Arc<Mutex<Vec<ContextOptions>>>,
    pub closed_contexts: Arc<AtomicU32>,
    pub storage_saves: Arc<Mutex<Vec<PathBuf>>>,
}

impl StubBrowser {
    pub fn new(page: StubPage) -> StubBrowser {
        StubBrowser {
            page,
            contexts: Arc::new(Mutex::new(Vec::new())),
            closed_contexts: Arc::new(AtomicU32::new(0)),
            storage_saves: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl BrowserHandle for StubBrowser {
    async fn new_context(&self, opts: &ContextOptions) -> Result<Box<dyn PageContext>, DriverError> {
        self.contexts.lock().unwrap().push(opts.clone());
        Ok(Box::new(StubContext {
            page: self.page.clone(),
            closed: self.closed_contexts.clone(),
            storage_saves: self.storage_saves.clone(),
        }))
    }

    async fn close(&self) {}
}

struct StubContext {
    page: StubPage,
    closed: Arc<AtomicU32>,
    storage_saves: Arc<Mutex<Vec<PathBuf>>>,
}

#[async_trait]
impl PageContext for StubContext {
    async fn new_page(&self) -> Result<Box<dyn PageSurface>, DriverError> {
        Ok(Box::new(self.page.clone()))
    }

    async fn save_storage_state(&self, path: &Path) -> Result<(), DriverError> {
        self.storage_saves.lock().unwrap().push(path.to_path_buf());
        Ok(())
    }

    async fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// What a notifier was asked to send, for assertions.
#[derive(Debug, Clone, PartialEq)]
pub enum NotifyEvent {
    Changes { id: String, count: usize },
    Error { id: String, failures: u32 },
}

#[derive(Clone, Default)]
pub struct RecordingNotifier {
    pub events: Arc<Mutex<Vec<NotifyEvent>>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<NotifyEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notify for RecordingNotifier {
    async fn notify_changes(
        &self,
        watch: &WatchConfig,
        changes: &[ChangeRecord],
        _data: &Map<String, Value>,
        _previous: Option<&Map<String, Value>>,
    ) {
        self.events.lock().unwrap().push(NotifyEvent::Changes {
            id: watch.watch_id(),
            count: changes.len(),
        });
    }

    async fn notify_error(&self, watch: &WatchConfig, failures: u32, _error: &str) {
        self.events.lock().unwrap().push(NotifyEvent::Error {
            id: watch.watch_id(),
            failures,
        });
    }
}
