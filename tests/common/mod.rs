//! Test doubles: a rule-based reasoner and an in-memory shop that behaves
//! like a tiny storefront (home → search results → product page).
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use persona_pilot::config::AgentConfig;
use persona_pilot::types::{
    ActionDecision, ActionKind, InteractableElement, Phase, RawElement, Rect, Role,
};
use persona_pilot::{
    AgentError, BrowserProvider, BrowserSession, InMemoryJobRegistry, Job, Orchestrator,
    OutputMode, Reasoner, Result,
};

pub const HOME: &str = "https://shop.test/";
pub const PRODUCT: &str = "https://shop.test/product/alpine-parka";

const CONSENT_REF: usize = 0;
const SEARCH_BOX_REF: usize = 1;
const SEARCH_BUTTON_REF: usize = 2;
const IMPRINT_REF: usize = 3;
const SALE_REF: usize = 4;
const PARKA_REF: usize = 10;
const SHELL_REF: usize = 11;
const CART_REF: usize = 20;
const BACK_REF: usize = 21;

/// Fast loop settings: no settle delay, no retry backoff.
pub fn test_config() -> AgentConfig {
    let mut config = AgentConfig::default();
    config.agent.settle_delay_ms = 0;
    config.agent.pause_poll_ms = 20;
    config.retry.base_delay_ms = 0;
    config
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Script {
    /// Plans a search, picks the top element, reports success on a product page.
    Shopper,
    /// Structured replies are prose, every other call fails.
    Malformed,
    /// Always scrolls, never reports success.
    Idle,
}

pub struct ScriptedReasoner {
    script: Script,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedReasoner {
    fn with(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn shopper() -> Arc<Self> {
        Self::with(Script::Shopper)
    }

    pub fn malformed() -> Arc<Self> {
        Self::with(Script::Malformed)
    }

    pub fn idle() -> Arc<Self> {
        Self::with(Script::Idle)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }

    fn reply(&self, prompt: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().push(prompt.to_string());

        let is_decide = prompt.contains("Reply with a JSON object");
        if self.script == Script::Malformed {
            return if is_decide {
                Ok("Sure! I would click on the nicest looking jacket.".to_string())
            } else {
                Err(AgentError::Reasoning("backend unavailable".into()))
            };
        }

        let reply = if is_decide {
            match self.script {
                Script::Idle => r#"{"action": "scroll", "direction": "down", "confidence": 0.4, "rationale": "Browse a bit"}"#,
                _ => r#"```json
{"action": "click", "element_id": 0, "confidence": 0.8, "rationale": "Most relevant element"}
```"#,
            }
            .to_string()
        } else if prompt.contains("In ONE short sentence") {
            match self.script {
                Script::Idle => "Browse around the page.".to_string(),
                _ => "Use the search box to look for the product.".to_string(),
            }
        } else if prompt.contains("Describe in at most three sentences") {
            if self.script == Script::Shopper && prompt.contains("product detail page") {
                "A parka with a clear price and an add to cart button. GOAL_COMPLETE".to_string()
            } else {
                "A tidy shop page with a few links.".to_string()
            }
        } else if prompt.contains("assess whether the action") {
            "The action had the expected effect.".to_string()
        } else if prompt.contains("Summarize") {
            "The shopper searched, opened a parka and was satisfied.".to_string()
        } else {
            String::new()
        };
        Ok(reply)
    }
}

#[async_trait]
impl Reasoner for ScriptedReasoner {
    async fn complete_text(&self, prompt: &str, _mode: OutputMode) -> Result<String> {
        self.reply(prompt)
    }

    async fn complete_vision(
        &self,
        prompt: &str,
        _image: &[u8],
        _mode: OutputMode,
    ) -> Result<String> {
        self.reply(prompt)
    }
}

struct ShopState {
    address: String,
    consent_open: bool,
    actions: Vec<ActionDecision>,
    closed: bool,
}

struct ShopInner {
    state: Mutex<ShopState>,
    gate: Option<Semaphore>,
    attempts: AtomicUsize,
    fail_navigation: bool,
    fail_actions: bool,
}

/// A storefront in memory. Clones share state, so a test can keep one handle
/// while the job drives another.
#[derive(Clone)]
pub struct FakeShop {
    inner: Arc<ShopInner>,
}

pub struct ShopBuilder {
    consent: bool,
    gated: bool,
    fail_navigation: bool,
    fail_actions: bool,
}

impl ShopBuilder {
    pub fn with_consent(mut self) -> Self {
        self.consent = true;
        self
    }

    /// Every action waits for a permit handed out by [`FakeShop::release`].
    pub fn gated(mut self) -> Self {
        self.gated = true;
        self
    }

    pub fn failing_navigation(mut self) -> Self {
        self.fail_navigation = true;
        self
    }

    pub fn failing_actions(mut self) -> Self {
        self.fail_actions = true;
        self
    }

    pub fn build(self) -> FakeShop {
        FakeShop {
            inner: Arc::new(ShopInner {
                state: Mutex::new(ShopState {
                    address: "about:blank".to_string(),
                    consent_open: self.consent,
                    actions: Vec::new(),
                    closed: false,
                }),
                gate: self.gated.then(|| Semaphore::new(0)),
                attempts: AtomicUsize::new(0),
                fail_navigation: self.fail_navigation,
                fail_actions: self.fail_actions,
            }),
        }
    }
}

impl FakeShop {
    pub fn builder() -> ShopBuilder {
        ShopBuilder {
            consent: false,
            gated: false,
            fail_navigation: false,
            fail_actions: false,
        }
    }

    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Start on the home page without going through `navigate`.
    pub fn at_home(self) -> Self {
        self.inner.state.lock().address = HOME.to_string();
        self
    }

    pub fn address(&self) -> String {
        self.inner.state.lock().address.clone()
    }

    pub fn actions(&self) -> Vec<ActionDecision> {
        self.inner.state.lock().actions.clone()
    }

    pub fn typed(&self) -> Vec<String> {
        self.actions()
            .into_iter()
            .filter(|a| a.kind == ActionKind::Type)
            .filter_map(|a| a.text)
            .collect()
    }

    pub fn consent_open(&self) -> bool {
        self.inner.state.lock().consent_open
    }

    pub fn closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Actions requested so far, including ones still waiting at the gate.
    pub fn attempts(&self) -> usize {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    pub fn release(&self, permits: usize) {
        if let Some(gate) = &self.inner.gate {
            gate.add_permits(permits);
        }
    }

    pub fn open_gate(&self) {
        self.release(10_000);
    }

    fn page(&self) -> Vec<RawElement> {
        let state = self.inner.state.lock();
        let mut elements = Vec::new();
        if state.consent_open {
            elements.push(button(CONSENT_REF, "Accept all"));
        }
        if state.address.contains("/product/") {
            elements.push(button(CART_REF, "Add to cart"));
            elements.push(link(BACK_REF, "Back to results"));
        } else if state.address.contains("/search") {
            elements.push(search_box());
            elements.push(button(SEARCH_BUTTON_REF, "Search"));
            elements.push(link(PARKA_REF, "Alpine Parka 129,99 €"));
            elements.push(link(SHELL_REF, "Storm Shell Jacket 89,00 €"));
            elements.push(link(IMPRINT_REF, "Imprint"));
        } else if state.address.starts_with(HOME) {
            elements.push(link(SALE_REF, "Sale"));
            elements.push(search_box());
            elements.push(button(SEARCH_BUTTON_REF, "Search"));
            elements.push(link(IMPRINT_REF, "Imprint"));
            elements.push(RawElement {
                visible: false,
                ..link(99, "Hidden promo")
            });
        }
        elements
    }

    fn apply(&self, action: &ActionDecision, element: Option<&InteractableElement>) -> String {
        let mut state = self.inner.state.lock();
        state.actions.push(action.clone());
        match (action.kind, element.map(|el| el.dom_ref)) {
            (ActionKind::Click, Some(CONSENT_REF)) => {
                state.consent_open = false;
                "Clicked consent".to_string()
            }
            (ActionKind::Click, Some(PARKA_REF | SHELL_REF)) => {
                state.address = PRODUCT.to_string();
                "Opened product".to_string()
            }
            (ActionKind::Type, Some(SEARCH_BOX_REF)) => {
                let query = action.text.clone().unwrap_or_default().replace(' ', "+");
                state.address = format!("https://shop.test/search?q={}", query);
                "Submitted search".to_string()
            }
            (ActionKind::Scroll, _) => "Scrolled".to_string(),
            (ActionKind::Wait, _) => "Waited".to_string(),
            (kind, target) => format!("{:?} on {:?} had no visible effect", kind, target),
        }
    }
}

#[async_trait]
impl BrowserSession for FakeShop {
    async fn navigate(&self, address: &str) -> Result<()> {
        if self.inner.fail_navigation {
            return Err(AgentError::Browser(format!("net::ERR_NAME_NOT_RESOLVED at {}", address)));
        }
        self.inner.state.lock().address = address.to_string();
        Ok(())
    }

    async fn current_url(&self) -> Result<String> {
        Ok(self.address())
    }

    async fn screenshot(&self) -> Result<Vec<u8>> {
        Ok(vec![0x89, b'P', b'N', b'G'])
    }

    async fn list_interactable_elements(&self, _phase_hint: Phase) -> Result<Vec<RawElement>> {
        Ok(self.page())
    }

    async fn perform_action(
        &self,
        action: &ActionDecision,
        element: Option<&InteractableElement>,
    ) -> Result<String> {
        self.inner.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.inner.gate {
            gate.acquire()
                .await
                .map_err(|e| AgentError::Browser(e.to_string()))?
                .forget();
        }
        if self.inner.fail_actions {
            return Err(AgentError::Browser("element is detached".into()));
        }
        Ok(self.apply(action, element))
    }

    async fn dismiss_consent_if_present(&self) -> Result<bool> {
        let mut state = self.inner.state.lock();
        Ok(std::mem::replace(&mut state.consent_open, false))
    }

    async fn close(&self) -> Result<()> {
        self.inner.state.lock().closed = true;
        Ok(())
    }
}

enum Supply {
    Shared(FakeShop),
    PerSession,
    Unavailable,
}

/// Hands out browser sessions to jobs: one shared shop, a fresh gated shop per
/// session, or nothing at all.
pub struct ShopProvider {
    supply: Supply,
    opened: Mutex<Vec<FakeShop>>,
}

impl ShopProvider {
    fn with(supply: Supply) -> Arc<Self> {
        Arc::new(Self {
            supply,
            opened: Mutex::new(Vec::new()),
        })
    }

    pub fn new(shop: FakeShop) -> Arc<Self> {
        Self::with(Supply::Shared(shop))
    }

    /// Every session gets its own shop, gated so tests can interleave jobs.
    pub fn per_session() -> Arc<Self> {
        Self::with(Supply::PerSession)
    }

    pub fn unavailable() -> Arc<Self> {
        Self::with(Supply::Unavailable)
    }

    /// Shops handed out so far, in the order sessions were opened.
    pub fn sessions(&self) -> Vec<FakeShop> {
        self.opened.lock().clone()
    }
}

#[async_trait]
impl BrowserProvider for ShopProvider {
    async fn open_session(&self) -> Result<Box<dyn BrowserSession>> {
        let shop = match &self.supply {
            Supply::Shared(shop) => shop.clone(),
            Supply::PerSession => FakeShop::builder().gated().build(),
            Supply::Unavailable => {
                return Err(AgentError::Browser("Chrome could not be launched".into()));
            }
        };
        self.opened.lock().push(shop.clone());
        Ok(Box::new(shop))
    }
}

pub fn orchestrator(reasoner: Arc<ScriptedReasoner>, provider: Arc<ShopProvider>) -> Orchestrator {
    Orchestrator::new(
        &test_config(),
        reasoner,
        provider,
        Arc::new(InMemoryJobRegistry::new()),
    )
    .unwrap()
}

/// Poll `condition` until it holds; panics after two seconds.
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn wait_finished(job: &Job) {
    wait_until("job to finish", || job.status().is_terminal()).await;
}

fn rect() -> Rect {
    Rect {
        x: 10.0,
        y: 10.0,
        width: 120.0,
        height: 32.0,
    }
}

fn button(dom_ref: usize, label: &str) -> RawElement {
    RawElement {
        dom_ref,
        role: Role::Button,
        rect: rect(),
        visible: true,
        label: label.to_string(),
        placeholder: None,
    }
}

fn link(dom_ref: usize, label: &str) -> RawElement {
    RawElement {
        role: Role::Link,
        ..button(dom_ref, label)
    }
}

fn search_box() -> RawElement {
    RawElement {
        role: Role::Textbox,
        label: String::new(),
        placeholder: Some("Search products".to_string()),
        ..button(SEARCH_BOX_REF, "")
    }
}
