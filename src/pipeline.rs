//! The per-step reasoning cycle: Plan → Observe → Decide → Execute → Reflect.
//!
//! Every stage that talks to the reasoner has a deterministic fallback, so a
//! cycle always yields exactly one action and one [`LogStep`] no matter which
//! collaborator misbehaves.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;

use crate::brain::{OutputMode, Reasoner, strip_code_fences, with_retry};
use crate::config::{AgentConfig, RetryPolicy};
use crate::context::{PhaseClassifier, SessionContext};
use crate::error::{AgentError, Result};
use crate::hands::BrowserSession;
use crate::persona::Persona;
use crate::prompts;
use crate::ranker::ElementRanker;
use crate::types::{
    ActionDecision, ActionKind, InteractableElement, LogStep, Phase, Role, ScrollDirection,
};

pub const REFLECT_FALLBACK: &str = "Could not reflect, continuing.";
const PLAN_MAX_CHARS: usize = 240;
const QUERY_MAX_WORDS: usize = 4;
const DEFAULT_QUERY: &str = "products";

/// Words that carry no product meaning in a goal like "find me a winter jacket".
const FILLER_WORDS: &[&str] = &[
    "a", "an", "the", "find", "buy", "search", "for", "look", "looking", "i", "want", "wants",
    "to", "me", "some", "please", "get", "need", "order", "purchase", "new", "my", "shop",
    "ich", "suche", "eine", "einen", "ein", "kaufen", "finde", "nach", "die", "der", "das",
];

/// Read-only inputs shared by every stage of one cycle.
#[derive(Debug, Clone, Copy)]
pub struct CycleInput<'a> {
    pub goal: &'a str,
    pub persona: &'a Persona,
    pub step: usize,
    pub max_steps: usize,
    pub debug: bool,
}

/// Output of a reasoning stage. `degraded` marks a deterministic fallback.
#[derive(Debug, Clone, PartialEq)]
pub struct StageText {
    pub text: String,
    pub degraded: bool,
}

impl StageText {
    fn reasoned(text: String) -> Self {
        Self {
            text,
            degraded: false,
        }
    }

    fn fallback(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            degraded: true,
        }
    }

    /// Only text that came from the reasoner may end a job early.
    pub fn signals_goal_complete(&self) -> bool {
        !self.degraded && mentions_goal_complete(&self.text)
    }
}

#[derive(Debug, Clone)]
pub struct CycleOutcome {
    pub log: LogStep,
    pub decision: ActionDecision,
    pub goal_reached: bool,
}

pub struct DecisionPipeline {
    reasoner: Arc<dyn Reasoner>,
    ranker: ElementRanker,
    classifier: PhaseClassifier,
    retry: RetryPolicy,
    top_n: usize,
}

impl DecisionPipeline {
    pub fn new(reasoner: Arc<dyn Reasoner>, config: &AgentConfig) -> Result<Self> {
        Ok(Self {
            reasoner,
            ranker: ElementRanker::new(config.scoring.clone())?,
            classifier: PhaseClassifier::new(&config.phases)?,
            retry: config.retry,
            top_n: config.agent.top_n,
        })
    }

    pub fn ranker(&self) -> &ElementRanker {
        &self.ranker
    }

    pub fn classifier(&self) -> &PhaseClassifier {
        &self.classifier
    }

    /// Run one full cycle against the browser and return its log record.
    pub async fn run_cycle(
        &self,
        browser: &dyn BrowserSession,
        ctx: &mut SessionContext,
        input: &CycleInput<'_>,
    ) -> CycleOutcome {
        let mut lines = Vec::new();

        match browser.current_url().await {
            Ok(url) => {
                ctx.observe_address(&self.classifier, &url);
            }
            Err(err) => {
                tracing::warn!(error = %err, "could not read current address, keeping phase");
                lines.push(format!("Address unavailable: {}", err));
            }
        }
        let phase = ctx.phase;
        lines.push(format!("Phase: {}", phase));

        let screenshot = match browser.screenshot().await {
            Ok(png) => Some(png),
            Err(err) => {
                tracing::warn!(error = %err, "screenshot failed");
                lines.push(format!("Screenshot unavailable: {}", err));
                None
            }
        };

        let raw = match browser.list_interactable_elements(phase).await {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(error = %err, "element listing failed");
                lines.push(format!("Elements unavailable: {}", err));
                Vec::new()
            }
        };
        let ranked = self.ranker.rank(&raw, phase);
        let product_count = self.ranker.product_count(&ranked);
        lines.push(format!(
            "{} candidate elements, {} in the product band",
            ranked.len(),
            product_count
        ));

        let plan = self.plan(ctx, input).await;
        lines.push(stage_line("Plan", &plan));

        let observation = self.observe(ctx, input, screenshot.as_deref(), &ranked).await;
        lines.push(stage_line("Observation", &observation));

        let decision = self.decide(ctx, input, &plan.text, &ranked).await;
        lines.push(format!(
            "Decision: {} (confidence {:.2}) - {}",
            decision.describe(),
            decision.confidence,
            decision.rationale
        ));

        let result = self.execute(browser, &decision, &ranked).await;
        ctx.record_action(&decision);
        lines.push(format!("Result: {}", result));

        let reflection = self
            .reflect(input, &plan.text, &decision, &result, phase)
            .await;
        lines.push(stage_line("Reflection", &reflection));

        let goal_reached =
            observation.signals_goal_complete() || reflection.signals_goal_complete();
        if goal_reached {
            lines.push("Goal reported as complete".to_string());
        }

        tracing::info!(
            step = input.step,
            %phase,
            action = %decision.describe(),
            goal_reached,
            "cycle finished"
        );

        let log = LogStep {
            title: format!("Step {}: {}", input.step, decision.describe()),
            lines,
            image: screenshot
                .filter(|_| input.debug)
                .map(|png| STANDARD.encode(png)),
            timestamp: Utc::now(),
            plan: Some(plan.text),
            observation: Some(observation.text),
            decision: Some(decision.describe()),
            reflection: Some(reflection.text),
        };

        CycleOutcome {
            log,
            decision,
            goal_reached,
        }
    }

    /// Plan: one short next-step sentence.
    pub async fn plan(&self, ctx: &SessionContext, input: &CycleInput<'_>) -> StageText {
        let prompt = prompts::plan(input.goal, input.persona, ctx, input.step, input.max_steps);
        let reply = with_retry(self.retry, "plan", || {
            self.reasoner.complete_text(&prompt, OutputMode::Text)
        })
        .await;

        match reply.map(|text| first_sentence_line(&text)) {
            Ok(text) if !text.is_empty() => StageText::reasoned(text),
            Ok(_) => {
                tracing::warn!("plan reply was empty, using fallback");
                StageText::fallback(fallback_plan(ctx.phase))
            }
            Err(err) => {
                tracing::warn!(error = %err, "plan failed, using fallback");
                StageText::fallback(fallback_plan(ctx.phase))
            }
        }
    }

    /// Observe: persona-filtered description of the screenshot.
    pub async fn observe(
        &self,
        ctx: &SessionContext,
        input: &CycleInput<'_>,
        screenshot: Option<&[u8]>,
        ranked: &[InteractableElement],
    ) -> StageText {
        let product_count = self.ranker.product_count(ranked);
        let fallback = || StageText::fallback(self.describe_from_counts(ctx.phase, ranked));

        let Some(image) = screenshot else {
            return fallback();
        };

        let prompt = prompts::observe(input.goal, input.persona, ctx.phase, ranked.len(), product_count);
        let reply = with_retry(self.retry, "observe", || {
            self.reasoner.complete_vision(&prompt, image, OutputMode::Text)
        })
        .await;

        match reply {
            Ok(text) if !text.trim().is_empty() => StageText::reasoned(text.trim().to_string()),
            Ok(_) => fallback(),
            Err(err) => {
                tracing::warn!(error = %err, "observe failed, describing from element counts");
                fallback()
            }
        }
    }

    /// Decide: turn the plan into one concrete action.
    ///
    /// Rules in order: a visible consent control is clicked; a search-minded
    /// plan on the home page goes straight to the search box; otherwise the
    /// reasoner picks among the top-ranked elements and anything unusable
    /// becomes `scroll down`.
    ///
    /// The search rule fires once per run. Back on the home page after a
    /// search has been submitted, a search-minded plan goes to the reasoner
    /// like any other, so it may click the box instead of typing into it.
    pub async fn decide(
        &self,
        ctx: &mut SessionContext,
        input: &CycleInput<'_>,
        plan: &str,
        ranked: &[InteractableElement],
    ) -> ActionDecision {
        if let Some(top) = ranked.first().filter(|el| self.ranker.is_consent(el)) {
            tracing::debug!(label = %top.label, "consent control on top, clicking it");
            return ActionDecision::click(
                top.id,
                0.95,
                format!("Consent control \"{}\" blocks the page", top.label),
            );
        }

        if ctx.phase == Phase::Home
            && !ctx.search_submitted
            && self.expresses_search_intent(plan)
        {
            if let Some(target) = self.ranker.search_target(ranked) {
                tracing::debug!(role = %target.role, "search rule fired");
                if target.role == Role::Textbox {
                    let query = extract_search_query(input.goal);
                    ctx.record_search(&query);
                    return ActionDecision::type_text(
                        target.id,
                        query,
                        0.9,
                        "Plan calls for a search and a search box is available",
                    );
                }
                return ActionDecision::click(
                    target.id,
                    0.8,
                    format!("Open the search surface via \"{}\"", target.label),
                );
            }
        }

        let shown = &ranked[..ranked.len().min(self.top_n)];
        if shown.is_empty() {
            return fallback_scroll("No interactable elements visible");
        }

        let prompt = prompts::decide(input.goal, input.persona, plan, ctx, shown);
        let reply = with_retry(self.retry, "decide", || {
            self.reasoner.complete_text(&prompt, OutputMode::Json)
        })
        .await;

        match reply.and_then(|text| parse_choice(&text)) {
            Ok(choice) => self.resolve_choice(choice, ctx, input.goal, shown),
            Err(err) => {
                tracing::warn!(error = %err, "decide failed, scrolling down");
                fallback_scroll("Could not interpret the decision, scrolling down")
            }
        }
    }

    /// Execute: hand the decision to the browser. Failures become result text.
    pub async fn execute(
        &self,
        browser: &dyn BrowserSession,
        decision: &ActionDecision,
        ranked: &[InteractableElement],
    ) -> String {
        let element = decision.element_id.and_then(|id| ranked.get(id));
        match browser.perform_action(decision, element).await {
            Ok(result) => result,
            Err(err) => {
                tracing::warn!(error = %err, action = %decision.describe(), "action failed");
                format!("Action failed: {}", err)
            }
        }
    }

    /// Reflect: short assessment, kept for the summary only.
    pub async fn reflect(
        &self,
        input: &CycleInput<'_>,
        plan: &str,
        decision: &ActionDecision,
        result: &str,
        phase: Phase,
    ) -> StageText {
        let prompt = prompts::reflect(input.goal, plan, &decision.describe(), result, phase);
        let reply = with_retry(self.retry, "reflect", || {
            self.reasoner.complete_text(&prompt, OutputMode::Text)
        })
        .await;

        match reply {
            Ok(text) if !text.trim().is_empty() => {
                StageText::reasoned(first_sentences(text.trim(), 2))
            }
            Ok(_) => StageText::fallback(REFLECT_FALLBACK),
            Err(err) => {
                tracing::warn!(error = %err, "reflect failed");
                StageText::fallback(REFLECT_FALLBACK)
            }
        }
    }

    /// Short wrap-up over all reflections, with a deterministic fallback.
    pub async fn summarize(
        &self,
        goal: &str,
        persona: &Persona,
        steps: &[LogStep],
        ctx: &SessionContext,
    ) -> String {
        let fallback = || fallback_summary(steps.len(), ctx);
        if steps.is_empty() {
            return fallback();
        }

        let prompt = prompts::summary(goal, persona, steps);
        match with_retry(self.retry, "summary", || {
            self.reasoner.complete_text(&prompt, OutputMode::Text)
        })
        .await
        {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => fallback(),
            Err(err) => {
                tracing::warn!(error = %err, "summary failed");
                fallback()
            }
        }
    }

    fn expresses_search_intent(&self, plan: &str) -> bool {
        let plan = plan.to_lowercase();
        self.ranker
            .policy()
            .search_keywords
            .iter()
            .any(|kw| plan.contains(&kw.to_lowercase()))
    }

    fn resolve_choice(
        &self,
        choice: Choice,
        ctx: &mut SessionContext,
        goal: &str,
        shown: &[InteractableElement],
    ) -> ActionDecision {
        let confidence = choice.confidence.clamp(0.0, 1.0);
        let rationale = choice.rationale;
        let target = choice.element_id.filter(|id| *id < shown.len());

        match choice.kind {
            ActionKind::Click => match target {
                Some(id) => ActionDecision::click(id, confidence, rationale),
                None => fallback_scroll("Chosen click target is not on the page"),
            },
            ActionKind::Type => {
                let Some(id) = target else {
                    return fallback_scroll("Chosen text field is not on the page");
                };
                let text = match choice.text.filter(|t| !t.trim().is_empty()) {
                    Some(text) => text.trim().to_string(),
                    None if !ctx.search_submitted => extract_search_query(goal),
                    None => return fallback_scroll("Nothing left to type"),
                };
                ctx.record_search(&text);
                ActionDecision::type_text(id, text, confidence, rationale)
            }
            ActionKind::Scroll => ActionDecision::scroll(
                choice.direction.unwrap_or(ScrollDirection::Down),
                confidence,
                rationale,
            ),
            ActionKind::Wait => ActionDecision::wait(confidence, rationale),
        }
    }

    fn describe_from_counts(&self, phase: Phase, ranked: &[InteractableElement]) -> String {
        let count = |role: Role| ranked.iter().filter(|el| el.role == role).count();
        let consent = ranked.iter().filter(|el| self.ranker.is_consent(el)).count();
        format!(
            "A {} page with {} interactable elements: {} links, {} buttons, {} text fields; \
             {} look like products, {} consent controls.",
            phase,
            ranked.len(),
            count(Role::Link),
            count(Role::Button),
            count(Role::Textbox),
            self.ranker.product_count(ranked),
            consent
        )
    }
}

/// A structured choice as parsed from the reasoner, before validation.
#[derive(Debug, Clone, PartialEq)]
pub struct Choice {
    pub kind: ActionKind,
    pub element_id: Option<usize>,
    pub text: Option<String>,
    pub direction: Option<ScrollDirection>,
    pub confidence: f32,
    pub rationale: String,
}

#[derive(Deserialize)]
struct WireChoice {
    action: String,
    #[serde(default)]
    element_id: Option<Value>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    direction: Option<String>,
    #[serde(default)]
    confidence: Option<f32>,
    #[serde(default)]
    rationale: Option<String>,
}

/// Parse the Decide stage's JSON reply. Tolerates fences and prose around the object.
pub fn parse_choice(reply: &str) -> Result<Choice> {
    let cleaned = strip_code_fences(reply);
    let json = match (cleaned.find('{'), cleaned.rfind('}')) {
        (Some(start), Some(end)) if start < end => &cleaned[start..=end],
        _ => return Err(AgentError::MalformedOutput(format!("no JSON object in: {}", cleaned))),
    };
    let wire: WireChoice =
        serde_json::from_str(json).map_err(|e| AgentError::MalformedOutput(e.to_string()))?;

    let kind = match wire.action.trim().to_lowercase().as_str() {
        "click" => ActionKind::Click,
        "type" => ActionKind::Type,
        "scroll" => ActionKind::Scroll,
        "wait" => ActionKind::Wait,
        other => {
            return Err(AgentError::MalformedOutput(format!("unknown action '{}'", other)));
        }
    };
    let element_id = wire.element_id.and_then(|v| match v {
        Value::Number(n) => n.as_u64().map(|n| n as usize),
        Value::String(s) => s.trim().trim_matches(|c| c == '[' || c == ']').parse().ok(),
        _ => None,
    });
    let direction = match wire.direction.as_deref().map(str::to_lowercase).as_deref() {
        Some("up") => Some(ScrollDirection::Up),
        Some("down") => Some(ScrollDirection::Down),
        _ => None,
    };

    Ok(Choice {
        kind,
        element_id,
        text: wire.text,
        direction,
        confidence: wire.confidence.unwrap_or(0.5),
        rationale: wire.rationale.unwrap_or_default(),
    })
}

/// Pull a short search phrase out of a goal: "find a winter jacket" → "winter jacket".
pub fn extract_search_query(goal: &str) -> String {
    let words: Vec<String> = goal
        .split(|c: char| !(c.is_alphanumeric() || c == '-' || c == '\''))
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .filter(|w| !FILLER_WORDS.contains(&w.as_str()))
        .take(QUERY_MAX_WORDS)
        .collect();
    if !words.is_empty() {
        return words.join(" ");
    }
    let raw = goal
        .split_whitespace()
        .take(QUERY_MAX_WORDS)
        .collect::<Vec<_>>()
        .join(" ");
    if raw.is_empty() {
        DEFAULT_QUERY.to_string()
    } else {
        raw
    }
}

pub fn fallback_plan(phase: Phase) -> &'static str {
    match phase {
        Phase::Home => "Analyze the page and look for orientation, then search for the goal.",
        Phase::SearchResults => "Scan the results and open the most relevant product.",
        Phase::ProductDetail => "Check the product details against the goal.",
        Phase::Unknown => "Analyze the page and look for orientation.",
    }
}

/// Summary built only from the session state, for when the reasoner is not asked or fails.
pub fn fallback_summary(step_count: usize, ctx: &SessionContext) -> String {
    format!(
        "{} steps taken, ended on a {} page; search {}.",
        step_count,
        ctx.phase,
        match &ctx.submitted_query {
            Some(query) => format!("submitted for \"{}\"", query),
            None => "never submitted".to_string(),
        }
    )
}

pub fn mentions_goal_complete(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("goal_complete") || lower.contains("goal complete") || lower.contains("goal achieved")
}

fn fallback_scroll(reason: &str) -> ActionDecision {
    ActionDecision::scroll(ScrollDirection::Down, 0.1, reason)
}

fn stage_line(label: &str, stage: &StageText) -> String {
    if stage.degraded {
        format!("{} (fallback): {}", label, stage.text)
    } else {
        format!("{}: {}", label, stage.text)
    }
}

fn first_sentence_line(text: &str) -> String {
    let line = text
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or_default();
    line.chars().take(PLAN_MAX_CHARS).collect()
}

/// Keep at most `n` sentences. A terminator only ends a sentence when
/// whitespace or the end of the text follows, so prices like `129.99` survive.
fn first_sentences(text: &str, n: usize) -> String {
    let mut end = text.len();
    let mut seen = 0;
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        let at_boundary = chars.peek().is_none_or(|&(_, next)| next.is_whitespace());
        if matches!(c, '.' | '!' | '?') && at_boundary {
            seen += 1;
            if seen == n {
                end = i + c.len_utf8();
                break;
            }
        }
    }
    text[..end].trim().to_string()
}
