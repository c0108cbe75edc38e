use anyhow::{Context, Result};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::emulation::{
    SetDeviceMetricsOverrideParams, SetLocaleOverrideParams, SetTimezoneOverrideParams,
    SetUserAgentOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::input::InsertTextParams;
use chromiumoxide::cdp::browser_protocol::network::{
    CookieParam, Headers, SetCookiesParams, SetExtraHttpHeadersParams,
};
use chromiumoxide::cdp::browser_protocol::page::{
    AddScriptToEvaluateOnNewDocumentParams, CaptureScreenshotFormat, CaptureScreenshotParams,
};
use chromiumoxide::Page;
use futures::StreamExt;
use serde_json::{json, Value};
use std::path::Path;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use watch_core::browser::{
    BrowserHandle, ContextOptions, DriverError, ElementPart, PageContext, PageSurface, ProxyConfig,
    Selector, WaitUntil,
};

const HANDLER_ERROR_TOLERANCE: usize = 3;
const SELECTOR_POLL: Duration = Duration::from_millis(100);

fn internal(e: impl std::fmt::Display) -> DriverError {
    DriverError::Internal(e.to_string())
}

fn js_str(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}

/// Process-wide chromium handle behind the driver facade.
pub struct CdpBrowser {
    browser: Mutex<Browser>,
    handler: JoinHandle<()>,
}

impl CdpBrowser {
    /// Launch a headless chromium, optionally through a global proxy.
    pub async fn launch(proxy: Option<&ProxyConfig>) -> Result<CdpBrowser> {
        let mut args = vec![
            "--disable-dev-shm-usage".to_string(),
            "--disable-gpu".to_string(),
            "--no-first-run".to_string(),
            "--disable-extensions".to_string(),
        ];
        if let Some(proxy) = proxy {
            args.push(format!("--proxy-server={}", proxy.server));
            if proxy.username.is_some() {
                warn!("proxy credentials are not supported by the CDP driver; continuing without auth");
            }
        }
        let config = BrowserConfig::builder()
            .args(args)
            .build()
            .map_err(|e| anyhow::anyhow!("browser config: {e}"))?;
        let (browser, mut handler) = Browser::launch(config).await.context("launch chromium")?;
        info!("chromium launched");

        let task = tokio::spawn(async move {
            let mut consecutive_errors = 0usize;
            while let Some(event) = handler.next().await {
                match event {
                    Ok(_) => consecutive_errors = 0,
                    Err(err) => {
                        consecutive_errors += 1;
                        warn!(
                            "chromium handler error (#{consecutive_errors}/{HANDLER_ERROR_TOLERANCE}): {err}"
                        );
                        if consecutive_errors >= HANDLER_ERROR_TOLERANCE {
                            break;
                        }
                    }
                }
            }
            warn!("chromium event loop exited");
        });

        Ok(CdpBrowser { browser: Mutex::new(browser), handler: task })
    }
}

#[async_trait]
impl BrowserHandle for CdpBrowser {
    async fn new_context(&self, opts: &ContextOptions) -> Result<Box<dyn PageContext>, DriverError> {
        let page = {
            let browser = self.browser.lock().await;
            browser
                .new_page("about:blank")
                .await
                .map_err(internal)?
        };
        apply_options(&page, opts).await?;
        Ok(Box::new(CdpContext { page }))
    }

    async fn close(&self) {
        let mut browser = self.browser.lock().await;
        if let Err(err) = browser.close().await {
            warn!("browser close: {err}");
        }
        self.handler.abort();
    }
}

async fn apply_options(page: &Page, opts: &ContextOptions) -> Result<(), DriverError> {
    if let Some(ua) = &opts.user_agent {
        page.execute(SetUserAgentOverrideParams::new(ua.clone()))
            .await
            .map_err(internal)?;
    }
    if let Some(viewport) = &opts.viewport {
        let params = SetDeviceMetricsOverrideParams::builder()
            .width(viewport.width as i64)
            .height(viewport.height as i64)
            .device_scale_factor(1.0)
            .mobile(false)
            .build()
            .map_err(DriverError::Internal)?;
        page.execute(params).await.map_err(internal)?;
    }
    if let Some(timezone) = &opts.timezone {
        page.execute(SetTimezoneOverrideParams::new(timezone.clone()))
            .await
            .map_err(internal)?;
    }
    if let Some(locale) = &opts.locale {
        let params = SetLocaleOverrideParams::builder().locale(locale.clone()).build();
        page.execute(params).await.map_err(internal)?;
    }
    if !opts.headers.is_empty() {
        let headers = Headers::new(json!(opts.headers));
        page.execute(SetExtraHttpHeadersParams::new(headers))
            .await
            .map_err(internal)?;
    }
    if !opts.cookies.is_empty() {
        let mut cookies = Vec::new();
        for cookie in &opts.cookies {
            let mut builder = CookieParam::builder()
                .name(cookie.name.clone())
                .value(cookie.value.clone());
            if let Some(domain) = &cookie.domain {
                builder = builder.domain(domain.clone());
            }
            if let Some(path) = &cookie.path {
                builder = builder.path(path.clone());
            }
            if let Some(url) = &cookie.url {
                builder = builder.url(url.clone());
            }
            cookies.push(builder.build().map_err(DriverError::Internal)?);
        }
        page.execute(SetCookiesParams::new(cookies))
            .await
            .map_err(internal)?;
    }
    if let Some(path) = &opts.storage_state_path {
        match std::fs::read_to_string(path) {
            Ok(raw) => {
                let script = format!(
                    r#"(() => {{
                        try {{
                            const st = {raw};
                            if (!st || location.origin !== st.origin) return;
                            for (const [k, v] of Object.entries(st.localStorage || {{}})) {{
                                localStorage.setItem(k, v);
                            }}
                            (st.cookies || '').split('; ').filter(Boolean)
                                .forEach(c => document.cookie = c);
                        }} catch (e) {{}}
                    }})()"#
                );
                page.execute(AddScriptToEvaluateOnNewDocumentParams::new(script))
                    .await
                    .map_err(internal)?;
            }
            Err(err) => debug!("no storage state at {}: {err}", path.display()),
        }
    }
    if !opts.block_resources.is_empty() {
        warn!(
            "resource blocking ({:?}) is not supported by the CDP driver",
            opts.block_resources
        );
    }
    if opts.proxy.is_some() {
        warn!("per-watch proxy override is not supported by the CDP driver; the launch proxy applies");
    }
    Ok(())
}

struct CdpContext {
    page: Page,
}

#[async_trait]
impl PageContext for CdpContext {
    async fn new_page(&self) -> Result<Box<dyn PageSurface>, DriverError> {
        Ok(Box::new(CdpPage { page: self.page.clone() }))
    }

    async fn save_storage_state(&self, path: &Path) -> Result<(), DriverError> {
        let page = CdpPage { page: self.page.clone() };
        let state = page
            .evaluate(
                r#"(() => {
                    const ls = {};
                    for (let i = 0; i < localStorage.length; i++) {
                        const k = localStorage.key(i);
                        ls[k] = localStorage.getItem(k);
                    }
                    return { origin: location.origin, cookies: document.cookie, localStorage: ls };
                })()"#,
            )
            .await?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(internal)?;
        }
        let body = serde_json::to_vec_pretty(&state).map_err(internal)?;
        std::fs::write(path, body).map_err(internal)?;
        Ok(())
    }

    async fn close(&self) {
        if let Err(err) = self.page.clone().close().await {
            debug!("page close: {err}");
        }
    }
}

struct CdpPage {
    page: Page,
}

impl CdpPage {
    fn nodes_expr(selector: &Selector) -> String {
        match selector {
            Selector::Css(s) => {
                format!("Array.from(document.querySelectorAll({}))", js_str(s))
            }
            Selector::Xpath(s) => format!(
                "(() => {{ const out = []; const it = document.evaluate({}, document, null, \
                 XPathResult.ORDERED_NODE_SNAPSHOT_TYPE, null); \
                 for (let i = 0; i < it.snapshotLength; i++) out.push(it.snapshotItem(i)); \
                 return out; }})()",
                js_str(s)
            ),
        }
    }

    fn first_node_script(selector: &Selector, body: &str) -> String {
        format!(
            "(() => {{ const nodes = {}; if (!nodes.length) return false; const el = nodes[0]; {body} return true; }})()",
            Self::nodes_expr(selector)
        )
    }

    async fn run_on_first(&self, selector: &Selector, body: &str) -> Result<(), DriverError> {
        let found = self
            .evaluate(&Self::first_node_script(selector, body))
            .await?;
        if found.as_bool() == Some(true) {
            Ok(())
        } else {
            Err(DriverError::Selector {
                selector: selector.raw().to_string(),
                details: "no match".to_string(),
            })
        }
    }
}

#[async_trait]
impl PageSurface for CdpPage {
    async fn goto(
        &self,
        url: &str,
        timeout: Duration,
        wait_until: WaitUntil,
    ) -> Result<(), DriverError> {
        if wait_until != WaitUntil::Load {
            debug!("waitUntil {wait_until:?} approximated as load by the CDP driver");
        }
        let navigate = async {
            self.page.goto(url).await.map_err(|e| DriverError::Navigation {
                url: url.to_string(),
                details: e.to_string(),
            })?;
            self.page
                .wait_for_navigation()
                .await
                .map_err(|e| DriverError::Navigation {
                    url: url.to_string(),
                    details: e.to_string(),
                })?;
            Ok(())
        };
        match tokio::time::timeout(timeout, navigate).await {
            Ok(result) => result,
            Err(_) => Err(DriverError::Timeout {
                what: format!("goto {url}"),
                ms: timeout.as_millis(),
            }),
        }
    }

    async fn wait_for_selector(
        &self,
        selector: &Selector,
        timeout: Duration,
    ) -> Result<(), DriverError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.count(selector).await.unwrap_or(0) > 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(DriverError::Timeout {
                    what: format!("selector {:?}", selector.raw()),
                    ms: timeout.as_millis(),
                });
            }
            tokio::time::sleep(SELECTOR_POLL).await;
        }
    }

    async fn wait_for_navigation(&self, timeout: Duration) -> Result<(), DriverError> {
        match tokio::time::timeout(timeout, self.page.wait_for_navigation()).await {
            Ok(result) => result.map(|_| ()).map_err(internal),
            Err(_) => Err(DriverError::Timeout {
                what: "navigation".to_string(),
                ms: timeout.as_millis(),
            }),
        }
    }

    async fn query_all(
        &self,
        selector: &Selector,
        part: &ElementPart,
    ) -> Result<Vec<Value>, DriverError> {
        let (method, map_body) = match part {
            ElementPart::Text => ("map", "el.textContent".to_string()),
            ElementPart::InnerText => ("map", "el.innerText".to_string()),
            ElementPart::Attribute(name) => {
                ("map", format!("el.getAttribute({})", js_str(name)))
            }
            ElementPart::Value => ("map", "(el.value === undefined ? null : el.value)".to_string()),
            ElementPart::InnerHtml => ("map", "el.innerHTML".to_string()),
            ElementPart::OuterHtml => ("map", "el.outerHTML".to_string()),
            ElementPart::Options => (
                "flatMap",
                "Array.from(el.querySelectorAll('option')).filter(o => o.value)\
                 .map(o => ({value: o.value, text: (o.textContent || '').trim()}))"
                    .to_string(),
            ),
        };
        let script = format!(
            "(() => {{ const nodes = {}; return nodes.{method}(el => {map_body}); }})()",
            Self::nodes_expr(selector)
        );
        let value = self.evaluate(&script).await?;
        Ok(value.as_array().cloned().unwrap_or_default())
    }

    async fn count(&self, selector: &Selector) -> Result<u64, DriverError> {
        let script = format!(
            "(() => {{ const nodes = {}; return nodes.length; }})()",
            Self::nodes_expr(selector)
        );
        Ok(self.evaluate(&script).await?.as_u64().unwrap_or(0))
    }

    async fn evaluate(&self, script: &str) -> Result<Value, DriverError> {
        let result = self
            .page
            .evaluate(script)
            .await
            .map_err(|e| DriverError::Eval(e.to_string()))?;
        Ok(result.value().cloned().unwrap_or(Value::Null))
    }

    async fn body_text(&self) -> Result<String, DriverError> {
        let value = self
            .evaluate("document.body ? document.body.innerText : ''")
            .await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn frames(&self) -> Result<Vec<Box<dyn PageSurface>>, DriverError> {
        debug!("frame enumeration is not supported by the CDP driver");
        Ok(Vec::new())
    }

    async fn url(&self) -> String {
        match self.evaluate("window.location.href").await {
            Ok(value) => value.as_str().unwrap_or_default().to_string(),
            Err(_) => String::new(),
        }
    }

    async fn title(&self) -> Result<String, DriverError> {
        let title = self.page.get_title().await.map_err(internal)?;
        Ok(title.unwrap_or_default())
    }

    async fn screenshot(&self, path: &Path, full_page: bool) -> Result<(), DriverError> {
        let params = CaptureScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .capture_beyond_viewport(full_page)
            .build();
        let bytes = self.page.screenshot(params).await.map_err(internal)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(internal)?;
        }
        std::fs::write(path, bytes).map_err(internal)?;
        Ok(())
    }

    async fn click(&self, selector: &Selector) -> Result<(), DriverError> {
        if let Selector::Css(css) = selector {
            if let Ok(element) = self.page.find_element(css.clone()).await {
                if element.click().await.is_ok() {
                    return Ok(());
                }
            }
        }
        self.run_on_first(selector, "el.click();").await
    }

    async fn fill(&self, selector: &Selector, text: &str) -> Result<(), DriverError> {
        let body = format!(
            r#"el.focus();
               const text = {};
               const proto = el.tagName === 'TEXTAREA'
                   ? HTMLTextAreaElement.prototype : HTMLInputElement.prototype;
               const desc = Object.getOwnPropertyDescriptor(proto, 'value');
               if (desc && desc.set) {{ desc.set.call(el, text); }} else {{ el.value = text; }}
               el.dispatchEvent(new Event('input', {{bubbles: true}}));
               el.dispatchEvent(new Event('change', {{bubbles: true}}));"#,
            js_str(text)
        );
        self.run_on_first(selector, &body).await
    }

    async fn type_text(
        &self,
        selector: &Selector,
        text: &str,
        delay: Duration,
    ) -> Result<(), DriverError> {
        self.run_on_first(selector, "el.focus();").await?;
        for ch in text.chars() {
            self.page
                .execute(InsertTextParams::new(ch.to_string()))
                .await
                .map_err(internal)?;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
        Ok(())
    }

    async fn press_key(&self, key: &str) -> Result<(), DriverError> {
        use chromiumoxide::cdp::browser_protocol::input::{
            DispatchKeyEventParams, DispatchKeyEventType,
        };
        use chromiumoxide::keys;

        let definition = keys::get_key_definition(key)
            .ok_or_else(|| DriverError::Internal(format!("unsupported key {key:?}")))?;
        let mut builder = DispatchKeyEventParams::builder()
            .key(definition.key)
            .code(definition.code)
            .windows_virtual_key_code(definition.key_code)
            .native_virtual_key_code(definition.key_code);
        if let Some(text) = definition.text {
            builder = builder.text(text);
        }
        let down = builder
            .clone()
            .r#type(DispatchKeyEventType::KeyDown)
            .build()
            .map_err(DriverError::Internal)?;
        self.page.execute(down).await.map_err(internal)?;
        let up = builder
            .r#type(DispatchKeyEventType::KeyUp)
            .build()
            .map_err(DriverError::Internal)?;
        self.page.execute(up).await.map_err(internal)?;
        Ok(())
    }

    async fn select_option(&self, selector: &Selector, value: &str) -> Result<(), DriverError> {
        let body = format!(
            r#"el.value = {};
               el.dispatchEvent(new Event('input', {{bubbles: true}}));
               el.dispatchEvent(new Event('change', {{bubbles: true}}));"#,
            js_str(value)
        );
        self.run_on_first(selector, &body).await
    }

    async fn hover(&self, selector: &Selector) -> Result<(), DriverError> {
        self.run_on_first(
            selector,
            "el.dispatchEvent(new MouseEvent('mouseover', {bubbles: true}));\
             el.dispatchEvent(new MouseEvent('mouseenter', {bubbles: true}));",
        )
        .await
    }

    async fn scroll_into_view(&self, selector: &Selector) -> Result<(), DriverError> {
        self.run_on_first(
            selector,
            "el.scrollIntoView({block: 'center', inline: 'center', behavior: 'instant'});",
        )
        .await
    }

    async fn scroll_by(&self, x: f64, y: f64) -> Result<(), DriverError> {
        self.evaluate(&format!("window.scrollBy({x}, {y})"))
            .await
            .map(|_| ())
    }
}
