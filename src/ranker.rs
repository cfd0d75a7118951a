//! Element ranking: filter what the browser found, score it against the
//! current phase, and hand back a list where rank and identifier coincide.

use regex::Regex;

use crate::config::ScoringPolicy;
use crate::error::{AgentError, Result};
use crate::types::{InteractableElement, MAX_LABEL_CHARS, Phase, RawElement, Role};

#[derive(Debug, Clone)]
pub struct ElementRanker {
    policy: ScoringPolicy,
    price: Regex,
}

impl ElementRanker {
    pub fn new(policy: ScoringPolicy) -> Result<Self> {
        let price = Regex::new(&policy.price_pattern)
            .map_err(|e| AgentError::Config(format!("scoring.price_pattern: {}", e)))?;
        Ok(Self { policy, price })
    }

    pub fn policy(&self) -> &ScoringPolicy {
        &self.policy
    }

    /// Drop invisible and tiny elements, score the rest, sort by descending
    /// score (extraction order breaks ties) and renumber from 0.
    pub fn rank(&self, raw: &[RawElement], phase: Phase) -> Vec<InteractableElement> {
        let mut scored: Vec<InteractableElement> = raw
            .iter()
            .filter(|el| self.is_displayed(el))
            .map(|el| InteractableElement {
                id: 0,
                dom_ref: el.dom_ref,
                role: el.role,
                rect: el.rect,
                label: normalize_label(&el.label),
                placeholder: el
                    .placeholder
                    .as_deref()
                    .map(normalize_label)
                    .filter(|p| !p.is_empty()),
                score: self.score(el, phase),
            })
            .collect();

        scored.sort_by(|a, b| b.score.cmp(&a.score));
        for (rank, element) in scored.iter_mut().enumerate() {
            element.id = rank;
        }
        scored
    }

    pub fn score(&self, el: &RawElement, phase: Phase) -> i32 {
        let p = &self.policy;
        let text = searchable_text(el);
        let on_results = phase == Phase::SearchResults;

        match el.role {
            Role::Button if contains_any(&text, &p.consent_keywords) => p.consent_band,
            Role::Textbox if contains_any(&text, &p.search_keywords) => {
                if on_results {
                    p.search_box - p.results_search_penalty
                } else {
                    p.search_box
                }
            }
            Role::Textbox => p.textbox_base,
            _ if contains_any(&text, &p.boilerplate_keywords) => p.boilerplate,
            Role::Button if contains_any(&text, &p.search_keywords) => {
                if on_results {
                    p.search_button - p.results_search_penalty
                } else {
                    p.search_button
                }
            }
            Role::Button => p.button_base,
            Role::Link if on_results && self.looks_like_product(&el.label) => p.product_link,
            Role::Link => p.link_base,
        }
    }

    pub fn is_consent(&self, el: &InteractableElement) -> bool {
        el.score >= self.policy.consent_band
    }

    /// Elements inside the product band. Search controls and consent
    /// buttons rank above it and are not products.
    pub fn product_count(&self, ranked: &[InteractableElement]) -> usize {
        ranked
            .iter()
            .filter(|el| self.is_product(el))
            .count()
    }

    pub fn is_product(&self, el: &InteractableElement) -> bool {
        (self.policy.product_band..self.policy.search_band).contains(&el.score)
    }

    /// The highest-ranked element in the search band, if any.
    pub fn search_target<'a>(
        &self,
        ranked: &'a [InteractableElement],
    ) -> Option<&'a InteractableElement> {
        ranked
            .iter()
            .find(|el| el.score >= self.policy.search_band && !self.is_consent(el))
    }

    fn is_displayed(&self, el: &RawElement) -> bool {
        el.visible
            && el.rect.width >= self.policy.min_element_size
            && el.rect.height >= self.policy.min_element_size
    }

    fn looks_like_product(&self, label: &str) -> bool {
        self.price.is_match(label) || label.trim().chars().count() >= self.policy.long_text_chars
    }
}

fn searchable_text(el: &RawElement) -> String {
    let mut text = el.label.to_lowercase();
    if let Some(placeholder) = &el.placeholder {
        text.push(' ');
        text.push_str(&placeholder.to_lowercase());
    }
    text
}

fn normalize_label(label: &str) -> String {
    label
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(MAX_LABEL_CHARS)
        .collect()
}

fn contains_any(text: &str, terms: &[String]) -> bool {
    terms.iter().any(|term| contains_term(text, &term.to_lowercase()))
}

/// Whole-word containment, so "agb" does not fire inside "tagbag".
pub(crate) fn contains_term(text: &str, term: &str) -> bool {
    if term.is_empty() {
        return false;
    }
    text.match_indices(term).any(|(start, _)| {
        let end = start + term.len();
        let before = text[..start].chars().next_back();
        let after = text[end..].chars().next();
        !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
    })
}
