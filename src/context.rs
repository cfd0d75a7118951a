//! Navigation-phase tracking for a single job.

use regex::Regex;
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::config::PhasePatterns;
use crate::error::{AgentError, Result};
use crate::types::{ActionDecision, ActionKind, Phase};

/// Root-like paths: `/`, `/index.html`, `/de/`, `/en-us`.
const HOME_PATH: &str = r"(?i)^/(index\.(html?|php))?$|^/[a-z]{2}([-_][a-z]{2})?/?$";

/// Maps an address to a navigation phase. Product patterns win over search patterns.
#[derive(Debug, Clone)]
pub struct PhaseClassifier {
    product: Vec<Regex>,
    search: Vec<Regex>,
    home: Regex,
}

impl PhaseClassifier {
    pub fn new(patterns: &PhasePatterns) -> Result<Self> {
        Ok(Self {
            product: compile(&patterns.product)?,
            search: compile(&patterns.search)?,
            home: Regex::new(HOME_PATH)
                .map_err(|e| AgentError::Config(format!("home pattern: {}", e)))?,
        })
    }

    pub fn classify(&self, address: &str) -> Phase {
        let Some(url) = web_url(address) else {
            return Phase::Unknown;
        };
        // Host names are ignored so that e.g. `search.example.com/` still reads as home.
        let tail = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        };

        if self.product.iter().any(|re| re.is_match(&tail)) {
            Phase::ProductDetail
        } else if self.search.iter().any(|re| re.is_match(&tail)) {
            Phase::SearchResults
        } else if self.home.is_match(url.path()) {
            Phase::Home
        } else {
            Phase::Unknown
        }
    }
}

fn compile(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(&format!("(?i){}", p))
                .map_err(|e| AgentError::Config(format!("phase pattern '{}': {}", p, e)))
        })
        .collect()
}

fn web_url(address: &str) -> Option<Url> {
    Url::parse(address.trim())
        .ok()
        .filter(|url| matches!(url.scheme(), "http" | "https"))
}

/// Per-job navigation state. Owned by the job's loop and mutated only there.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionContext {
    pub phase: Phase,
    pub address: Option<String>,
    pub last_action: Option<String>,
    pub scroll_count: u32,
    pub search_submitted: bool,
    pub submitted_query: Option<String>,
}

impl SessionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reclassify from the latest address. Addresses that are not web pages
    /// (`about:blank`, empty strings, driver noise) leave the phase as it was.
    pub fn observe_address(&mut self, classifier: &PhaseClassifier, address: &str) -> Phase {
        if web_url(address).is_some() {
            self.phase = classifier.classify(address);
            self.address = Some(address.trim().to_string());
        }
        self.phase
    }

    pub fn on_search_results(&self) -> bool {
        self.phase == Phase::SearchResults
    }

    pub fn on_product_page(&self) -> bool {
        self.phase == Phase::ProductDetail
    }

    pub fn record_action(&mut self, decision: &ActionDecision) {
        if decision.kind == ActionKind::Scroll {
            self.scroll_count += 1;
        }
        self.last_action = Some(decision.describe());
    }

    /// Mark the run's search as submitted. Returns `false` if it already was.
    pub fn record_search(&mut self, query: &str) -> bool {
        if self.search_submitted {
            return false;
        }
        self.search_submitted = true;
        self.submitted_query = Some(query.to_string());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ScrollDirection;

    fn classifier() -> PhaseClassifier {
        PhaseClassifier::new(&PhasePatterns::default()).unwrap()
    }

    #[test]
    fn classifies_common_shop_addresses() {
        let c = classifier();
        assert_eq!(c.classify("https://shop.example.com/"), Phase::Home);
        assert_eq!(c.classify("https://shop.example.com/de/"), Phase::Home);
        assert_eq!(c.classify("https://shop.example.com/search?q=jacket"), Phase::SearchResults);
        assert_eq!(c.classify("https://www.amazon.de/s?k=winterjacke"), Phase::SearchResults);
        assert_eq!(c.classify("https://shop.example.com/p/winter-jacket-123"), Phase::ProductDetail);
        assert_eq!(c.classify("https://www.amazon.de/dp/B0ABC123"), Phase::ProductDetail);
        assert_eq!(c.classify("https://shop.example.com/account/orders"), Phase::Unknown);
    }

    #[test]
    fn product_patterns_take_precedence() {
        let c = classifier();
        assert_eq!(
            c.classify("https://shop.example.com/product/jacket-1?q=jacket"),
            Phase::ProductDetail
        );
    }

    #[test]
    fn host_name_does_not_trigger_search() {
        let c = classifier();
        assert_eq!(c.classify("https://search.example.com/"), Phase::Home);
    }

    #[test]
    fn non_web_addresses_are_unknown() {
        let c = classifier();
        assert_eq!(c.classify("about:blank"), Phase::Unknown);
        assert_eq!(c.classify(""), Phase::Unknown);
    }

    #[test]
    fn blank_address_keeps_prior_phase() {
        let c = classifier();
        let mut ctx = SessionContext::new();
        ctx.observe_address(&c, "https://shop.example.com/search?q=boots");
        assert!(ctx.on_search_results());
        ctx.observe_address(&c, "about:blank");
        assert!(ctx.on_search_results());
        assert!(!ctx.on_product_page());
        ctx.observe_address(&c, "https://shop.example.com/p/boot-9");
        assert!(ctx.on_product_page());
        assert!(!ctx.on_search_results());
    }

    #[test]
    fn search_is_recorded_once() {
        let mut ctx = SessionContext::new();
        assert!(ctx.record_search("winter jacket"));
        assert!(!ctx.record_search("something else"));
        assert_eq!(ctx.submitted_query.as_deref(), Some("winter jacket"));
    }

    #[test]
    fn scrolls_are_counted() {
        let mut ctx = SessionContext::new();
        ctx.record_action(&ActionDecision::scroll(ScrollDirection::Down, 0.1, "x"));
        ctx.record_action(&ActionDecision::click(2, 0.5, "y"));
        assert_eq!(ctx.scroll_count, 1);
        assert_eq!(ctx.last_action.as_deref(), Some("click [2]"));
    }
}
