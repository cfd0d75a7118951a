//! The browser collaborator. One Chrome process is shared; every job gets
//! its own browser context and tab so cookies and history never leak across jobs.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use headless_chrome::protocol::cdp::Page::CaptureScreenshotFormatOption;
use headless_chrome::protocol::cdp::Target::DisposeBrowserContext;
use headless_chrome::{Browser, LaunchOptions, Tab};
use tokio::sync::Mutex;

use crate::config::BrowserConfig;
use crate::dom;
use crate::error::{AgentError, Result};
use crate::types::{ActionDecision, ActionKind, InteractableElement, Phase, RawElement, ScrollDirection};

const SCROLL_PIXELS: u32 = 600;
const WAIT_ACTION: Duration = Duration::from_millis(1000);

/// A job's private view of the browser.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    async fn navigate(&self, address: &str) -> Result<()>;

    async fn current_url(&self) -> Result<String>;

    /// PNG bytes of the visible viewport.
    async fn screenshot(&self) -> Result<Vec<u8>>;

    async fn list_interactable_elements(&self, phase_hint: Phase) -> Result<Vec<RawElement>>;

    /// Carry out `action`; `element` is the ranked target for click/type.
    async fn perform_action(
        &self,
        action: &ActionDecision,
        element: Option<&InteractableElement>,
    ) -> Result<String>;

    async fn dismiss_consent_if_present(&self) -> Result<bool>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Hands out isolated sessions. Failing here is the one fatal setup error a job can hit.
#[async_trait]
pub trait BrowserProvider: Send + Sync {
    async fn open_session(&self) -> Result<Box<dyn BrowserSession>>;
}

/// Chrome over the DevTools protocol, launched (or attached to) on first use.
pub struct ChromeProvider {
    config: BrowserConfig,
    consent_phrases: Arc<Vec<String>>,
    chrome: Mutex<Option<SharedChrome>>,
}

/// The shared process plus a tab in the default context. Browser-level
/// commands such as disposing a job's context go through that tab, since a
/// job's own tab is gone by the time its context is released.
#[derive(Clone)]
struct SharedChrome {
    browser: Browser,
    control: Arc<Tab>,
}

impl ChromeProvider {
    pub fn new(config: BrowserConfig, consent_phrases: Vec<String>) -> Self {
        Self {
            config,
            consent_phrases: Arc::new(consent_phrases),
            chrome: Mutex::new(None),
        }
    }

    async fn shared_chrome(&self) -> Result<SharedChrome> {
        let mut slot = self.chrome.lock().await;
        if let Some(chrome) = slot.as_ref() {
            return Ok(chrome.clone());
        }
        let config = self.config.clone();
        let chrome = tokio::task::spawn_blocking(move || -> anyhow::Result<SharedChrome> {
            let browser = launch(&config)?;
            let control = browser.new_tab()?;
            Ok(SharedChrome { browser, control })
        })
        .await
        .map_err(|e| AgentError::Browser(format!("browser launch panicked: {}", e)))?
        .map_err(AgentError::browser)?;
        *slot = Some(chrome.clone());
        Ok(chrome)
    }

    /// A fresh browser context with one tab in it; returns the tab and the context id.
    async fn new_tab(&self, browser: Browser) -> Result<(Arc<Tab>, String)> {
        let timeout = self.config.navigation_timeout();
        tokio::task::spawn_blocking(move || -> anyhow::Result<(Arc<Tab>, String)> {
            let context = browser.new_context()?;
            let tab = context.new_tab()?;
            tab.set_default_timeout(timeout);
            Ok((tab, context.get_id().to_string()))
        })
        .await
        .map_err(|e| AgentError::Browser(format!("tab creation panicked: {}", e)))?
        .map_err(AgentError::browser)
    }
}

#[async_trait]
impl BrowserProvider for ChromeProvider {
    async fn open_session(&self) -> Result<Box<dyn BrowserSession>> {
        let mut chrome = self.shared_chrome().await?;
        let (tab, context_id) = match self.new_tab(chrome.browser.clone()).await {
            Ok(opened) => opened,
            Err(err) => {
                // The shared connection may have died; relaunch once.
                tracing::warn!(error = %err, "shared browser unusable, relaunching");
                self.chrome.lock().await.take();
                chrome = self.shared_chrome().await?;
                self.new_tab(chrome.browser.clone()).await?
            }
        };
        tracing::debug!(context_id = %context_id, "opened browser context");
        Ok(Box::new(ChromeSession {
            tab,
            control: chrome.control,
            context_id,
            consent_phrases: self.consent_phrases.clone(),
        }))
    }
}

fn launch(config: &BrowserConfig) -> anyhow::Result<Browser> {
    if let Some(url) = &config.attach_url {
        tracing::info!(%url, "attaching to existing Chrome");
        match Browser::connect(url.clone()) {
            Ok(browser) => return Ok(browser),
            Err(e) => tracing::warn!(error = %e, "could not attach, launching a new Chrome"),
        }
    }

    let options = LaunchOptions {
        headless: config.headless,
        path: find_chrome(config),
        window_size: Some((config.window_width, config.window_height)),
        args: vec![
            std::ffi::OsStr::new("--no-first-run"),
            std::ffi::OsStr::new("--no-default-browser-check"),
            std::ffi::OsStr::new("--disable-blink-features=AutomationControlled"),
            std::ffi::OsStr::new("--disable-infobars"),
        ],
        idle_browser_timeout: Duration::from_secs(600),
        ..Default::default()
    };

    tracing::info!(headless = config.headless, "launching Chrome");
    let browser = Browser::new(options)
        .map_err(|e| anyhow::anyhow!("Browser launch failed: {}", e))?;
    tracing::info!("Chrome ready");
    Ok(browser)
}

/// Configured path first, then well-known install locations. `None` lets the
/// driver run its own detection.
fn find_chrome(config: &BrowserConfig) -> Option<PathBuf> {
    if let Some(path) = &config.chrome_path {
        return Some(path.clone());
    }
    let candidates = [
        "/usr/bin/google-chrome",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
        "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
        r"C:\Program Files\Google\Chrome\Application\chrome.exe",
        r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
    ];
    candidates.iter().map(PathBuf::from).find(|p| p.exists())
}

pub struct ChromeSession {
    tab: Arc<Tab>,
    control: Arc<Tab>,
    context_id: String,
    consent_phrases: Arc<Vec<String>>,
}

impl ChromeSession {
    /// Run driver calls on the blocking pool so they don't stall tokio.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Arc<Tab>) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let tab = self.tab.clone();
        tokio::task::spawn_blocking(move || f(&tab))
            .await
            .map_err(|e| AgentError::Browser(format!("browser task panicked: {}", e)))?
            .map_err(AgentError::browser)
    }
}

#[async_trait]
impl BrowserSession for ChromeSession {
    async fn navigate(&self, address: &str) -> Result<()> {
        let address = address.to_string();
        self.blocking(move |tab| {
            tab.navigate_to(&address)?;
            tab.wait_until_navigated()?;
            Ok(())
        })
        .await
    }

    async fn current_url(&self) -> Result<String> {
        self.blocking(|tab| dom::get_current_url(tab)).await
    }

    async fn screenshot(&self) -> Result<Vec<u8>> {
        self.blocking(|tab| {
            tab.capture_screenshot(CaptureScreenshotFormatOption::Png, None, None, true)
        })
        .await
    }

    async fn list_interactable_elements(&self, phase_hint: Phase) -> Result<Vec<RawElement>> {
        let elements = self.blocking(|tab| dom::list_elements(tab)).await?;
        tracing::debug!(phase = %phase_hint, count = elements.len(), "listed interactable elements");
        Ok(elements)
    }

    async fn perform_action(
        &self,
        action: &ActionDecision,
        element: Option<&InteractableElement>,
    ) -> Result<String> {
        let action = action.clone();
        let element = element.cloned();
        self.blocking(move |tab| execute_on_tab(tab, &action, element.as_ref()))
            .await
    }

    async fn dismiss_consent_if_present(&self) -> Result<bool> {
        let phrases = self.consent_phrases.clone();
        self.blocking(move |tab| dom::dismiss_consent(tab, &phrases)).await
    }

    async fn close(&self) -> Result<()> {
        let closed = self
            .blocking(|tab| {
                tab.close(true)?;
                Ok(())
            })
            .await;

        let control = self.control.clone();
        let request = dispose_request(&self.context_id);
        let disposed = tokio::task::spawn_blocking(move || control.call_method(request))
            .await
            .map_err(|e| AgentError::Browser(format!("browser task panicked: {}", e)))
            .and_then(|r| r.map_err(AgentError::browser));
        if let Err(err) = disposed {
            tracing::warn!(context_id = %self.context_id, error = %err, "could not dispose browser context");
        }
        closed
    }
}

/// Execute one decision using just the tab (so it can run in spawn_blocking).
fn execute_on_tab(
    tab: &Arc<Tab>,
    action: &ActionDecision,
    element: Option<&InteractableElement>,
) -> anyhow::Result<String> {
    match action.kind {
        ActionKind::Click => {
            let target = element.ok_or_else(|| anyhow::anyhow!("click without a target element"))?;
            tab.find_element(&dom::ref_selector(target.dom_ref))?.click()?;
            Ok(format!("Clicked [{}] \"{}\"", target.id, target.label))
        }
        ActionKind::Type => {
            let target = element.ok_or_else(|| anyhow::anyhow!("type without a target element"))?;
            let text = action
                .text
                .as_deref()
                .filter(|t| !t.is_empty())
                .ok_or_else(|| anyhow::anyhow!("type without text"))?;
            let selector = dom::ref_selector(target.dom_ref);
            let el = tab.find_element(&selector)?;
            el.click()?;
            let js_sel = selector.replace('\'', "\\'");
            tab.evaluate(
                &format!(
                    "(() => {{ const el = document.querySelector('{js_sel}'); if (el && 'value' in el) el.value = ''; }})()"
                ),
                false,
            )?;
            tab.type_str(text)?;
            tab.press_key("Enter")?;
            Ok(format!("Typed \"{}\" into [{}] and submitted", text, target.id))
        }
        ActionKind::Scroll => {
            let direction = action.direction.unwrap_or(ScrollDirection::Down);
            dom::scroll(tab, direction, SCROLL_PIXELS)?;
            Ok(format!("Scrolled {}", direction))
        }
        ActionKind::Wait => {
            std::thread::sleep(WAIT_ACTION);
            Ok("Waited".to_string())
        }
    }
}

fn dispose_request(context_id: &str) -> DisposeBrowserContext {
    DisposeBrowserContext {
        browser_context_id: context_id.to_string(),
    }
}
