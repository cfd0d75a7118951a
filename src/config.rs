//! Layered configuration: TOML file, then environment, then CLI flags.
//!
//! ```toml
//! [server]
//! bind = "127.0.0.1"
//! port = 3000
//!
//! [llm]
//! model = "gpt-4o-mini"
//! vision_model = "gpt-4o-mini"
//!
//! [agent]
//! default_max_steps = 10
//! settle_delay_ms = 1500
//!
//! [retry]
//! attempts = 2
//! base_delay_ms = 1000
//!
//! [scoring]
//! consent_band = 1000
//! search_band = 500
//! product_band = 400
//!
//! [[personas]]
//! name = "collector"
//! description = "Hunts for rare editions and reads every detail."
//! ```
//!
//! Every section is optional; missing keys fall back to the defaults below.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};
use crate::persona::Persona;

pub const APP_DIR: &str = "persona-pilot";
pub const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub server: ServerConfig,
    pub llm: LlmConfig,
    pub browser: BrowserConfig,
    pub agent: LoopConfig,
    pub retry: RetryPolicy,
    pub scoring: ScoringPolicy,
    pub phases: PhasePatterns,
    pub personas: Vec<Persona>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 3000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Base of an OpenAI-compatible API, without the trailing `/chat/completions`.
    pub api_base: String,
    pub model: String,
    pub vision_model: String,
    pub temperature: f32,
    pub timeout_secs: u64,
    /// Only ever read from the environment.
    #[serde(skip)]
    pub api_key: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            vision_model: "gpt-4o-mini".to_string(),
            temperature: 0.2,
            timeout_secs: 60,
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub headless: bool,
    /// DevTools address of an already running Chrome, e.g. `http://127.0.0.1:9222`.
    pub attach_url: Option<String>,
    pub chrome_path: Option<PathBuf>,
    pub navigation_timeout_secs: u64,
    pub window_width: u32,
    pub window_height: u32,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: true,
            attach_url: None,
            chrome_path: None,
            navigation_timeout_secs: 30,
            window_width: 1366,
            window_height: 900,
        }
    }
}

impl BrowserConfig {
    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_secs(self.navigation_timeout_secs)
    }
}

/// Knobs of the per-job run loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    pub default_max_steps: usize,
    pub max_steps_limit: usize,
    /// Pause between steps so the page can settle.
    pub settle_delay_ms: u64,
    /// How many ranked elements the Decide stage shows the reasoner.
    pub top_n: usize,
    /// Upper bound on how long a paused job sleeps before re-checking its status.
    pub pause_poll_ms: u64,
    /// Finished jobs older than this are dropped from the registry.
    pub retention_secs: u64,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            default_max_steps: 10,
            max_steps_limit: 50,
            settle_delay_ms: 1500,
            top_n: 12,
            pause_poll_ms: 500,
            retention_secs: 3600,
        }
    }
}

impl LoopConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn pause_poll(&self) -> Duration {
        Duration::from_millis(self.pause_poll_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

/// Bounded retry with linearly increasing delay, wrapped around every reasoning call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 2,
            base_delay_ms: 1000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after the given (1-based) failed attempt.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.base_delay_ms.saturating_mul(u64::from(attempt)))
    }
}

/// Score bands and vocabularies used by the element ranker.
///
/// The bands are policy, not physics: `consent_band > search_band > product_band`
/// is the only ordering the decision rules depend on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringPolicy {
    pub consent_band: i32,
    pub search_band: i32,
    pub product_band: i32,
    /// Search-intent textbox while still on the home page.
    pub search_box: i32,
    /// Search-intent button (opens a search surface) while on the home page.
    pub search_button: i32,
    /// Subtracted from search boxes and buttons once results are showing.
    pub results_search_penalty: i32,
    pub textbox_base: i32,
    pub product_link: i32,
    pub button_base: i32,
    pub link_base: i32,
    pub boilerplate: i32,
    /// Elements narrower or shorter than this (px) are dropped before scoring.
    pub min_element_size: f64,
    /// Link labels at least this long count as descriptive product text.
    pub long_text_chars: usize,
    pub consent_keywords: Vec<String>,
    pub search_keywords: Vec<String>,
    pub boilerplate_keywords: Vec<String>,
    /// Regex matching prices in link labels.
    pub price_pattern: String,
}

impl Default for ScoringPolicy {
    fn default() -> Self {
        Self {
            consent_band: 1000,
            search_band: 500,
            product_band: 400,
            search_box: 600,
            search_button: 550,
            results_search_penalty: 250,
            textbox_base: 300,
            product_link: 450,
            button_base: 100,
            link_base: 50,
            boilerplate: 1,
            min_element_size: 8.0,
            long_text_chars: 40,
            consent_keywords: strings(&[
                "accept all",
                "accept cookies",
                "accept",
                "agree",
                "allow all",
                "alle akzeptieren",
                "akzeptieren",
                "zustimmen",
                "einverstanden",
                "got it",
            ]),
            search_keywords: strings(&["search", "suche", "suchen", "find", "query", "was suchen"]),
            boilerplate_keywords: strings(&[
                "imprint",
                "impressum",
                "privacy",
                "datenschutz",
                "terms",
                "agb",
                "legal",
                "cookie settings",
                "cookie-einstellungen",
            ]),
            price_pattern: r"(?i)([€$£]\s?\d)|(\d+[.,]\d{2}\s?(€|eur|usd|\$|£))".to_string(),
        }
    }
}

/// URL fragments that identify navigation phases. Each entry is a regex
/// matched case-insensitively against the full address.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PhasePatterns {
    pub product: Vec<String>,
    pub search: Vec<String>,
}

impl Default for PhasePatterns {
    fn default() -> Self {
        Self {
            product: strings(&[
                r"/dp/",
                r"/p/",
                r"/product[s]?/",
                r"/item[s]?/",
                r"/artikel/",
                r"/pd/",
                r"-p-\d+",
                r"\.html?\?.*\bsku=",
            ]),
            search: strings(&[
                r"[?&](q|query|k|search|keyword|searchterm)=",
                r"/search",
                r"/suche",
                r"/s\?",
                r"/c/",
                r"/category/",
                r"/kategorie/",
            ]),
        }
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl AgentConfig {
    /// Load from `path`, or from the per-user config file when it exists,
    /// or fall back to defaults; then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path().filter(|p| p.exists()) {
                Some(path) => Self::from_file(&path)?,
                None => Self::default(),
            },
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            AgentError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// `<config dir>/persona-pilot/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_DIR).join(CONFIG_FILE))
    }

    /// Apply overrides from an environment-like lookup.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup("OPENAI_API_KEY").filter(|k| !k.trim().is_empty()) {
            self.llm.api_key = Some(key);
        }
        if let Some(base) = lookup("OPENAI_BASE_URL") {
            self.llm.api_base = base.trim_end_matches('/').to_string();
        }
        if let Some(model) = lookup("PILOT_MODEL") {
            self.llm.vision_model = model.clone();
            self.llm.model = model;
        }
        if let Some(port) = lookup("PILOT_PORT").and_then(|p| p.parse().ok()) {
            self.server.port = port;
        }
        if let Some(headless) = lookup("PILOT_HEADLESS") {
            self.browser.headless = !matches!(headless.as_str(), "0" | "false" | "no");
        }
    }

    pub fn validate(&self) -> Result<()> {
        let s = &self.scoring;
        if !(s.consent_band > s.search_band && s.search_band > s.product_band) {
            return Err(AgentError::Config(format!(
                "score bands must satisfy consent > search > product (got {} / {} / {})",
                s.consent_band, s.search_band, s.product_band
            )));
        }
        if s.search_box < s.search_band || s.search_box < s.search_button {
            return Err(AgentError::Config(
                "scoring.search_box must reach the search band and outrank search_button".into(),
            ));
        }
        if s.product_link < s.product_band || s.product_link >= s.search_band {
            return Err(AgentError::Config(
                "scoring.product_link must fall inside the product band".into(),
            ));
        }
        if self.retry.attempts == 0 {
            return Err(AgentError::Config("retry.attempts must be at least 1".into()));
        }
        if self.agent.default_max_steps == 0
            || self.agent.default_max_steps > self.agent.max_steps_limit
        {
            return Err(AgentError::Config(format!(
                "agent.default_max_steps must be within 1..={}",
                self.agent.max_steps_limit
            )));
        }
        if self.agent.top_n == 0 {
            return Err(AgentError::Config("agent.top_n must be at least 1".into()));
        }
        regex::Regex::new(&s.price_pattern)
            .map_err(|e| AgentError::Config(format!("scoring.price_pattern: {}", e)))?;
        Ok(())
    }
}
