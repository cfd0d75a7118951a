use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type JobId = Uuid;

/// Longest label kept per element; anything past this is noise for ranking and prompts.
pub const MAX_LABEL_CHARS: usize = 120;

/// Token the reasoner is asked to emit once the goal is visibly reached.
pub const GOAL_COMPLETE_TOKEN: &str = "GOAL_COMPLETE";

/// Navigation context of the current page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Home,
    SearchResults,
    ProductDetail,
    #[default]
    Unknown,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Home => write!(f, "home"),
            Phase::SearchResults => write!(f, "search-results"),
            Phase::ProductDetail => write!(f, "product-detail"),
            Phase::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Link,
    Button,
    Textbox,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Link => write!(f, "link"),
            Role::Button => write!(f, "button"),
            Role::Textbox => write!(f, "textbox"),
        }
    }
}

/// Bounding box in CSS pixels, relative to the viewport.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// An element exactly as the browser reported it, before filtering and scoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawElement {
    /// Position in the page's extraction order; the browser uses it to find the node again.
    pub dom_ref: usize,
    pub role: Role,
    pub rect: Rect,
    #[serde(default = "default_visible")]
    pub visible: bool,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub placeholder: Option<String>,
}

fn default_visible() -> bool {
    true
}

/// A ranked candidate action target. `id` equals its rank for the current cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractableElement {
    pub id: usize,
    pub dom_ref: usize,
    pub role: Role,
    pub rect: Rect,
    pub label: String,
    pub placeholder: Option<String>,
    pub score: i32,
}

impl InteractableElement {
    /// One-line rendering used in prompts and log lines.
    pub fn describe(&self) -> String {
        let mut line = format!("[{}] {} \"{}\"", self.id, self.role, self.label);
        if let Some(placeholder) = self.placeholder.as_deref().filter(|p| !p.is_empty()) {
            line.push_str(&format!(" placeholder=\"{}\"", placeholder));
        }
        line.push_str(&format!(" score={}", self.score));
        line
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Click,
    Type,
    Scroll,
    Wait,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionKind::Click => write!(f, "click"),
            ActionKind::Type => write!(f, "type"),
            ActionKind::Scroll => write!(f, "scroll"),
            ActionKind::Wait => write!(f, "wait"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrollDirection {
    Up,
    Down,
}

impl fmt::Display for ScrollDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScrollDirection::Up => write!(f, "up"),
            ScrollDirection::Down => write!(f, "down"),
        }
    }
}

/// The single concrete action chosen for one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionDecision {
    #[serde(rename = "action")]
    pub kind: ActionKind,
    pub element_id: Option<usize>,
    pub text: Option<String>,
    pub direction: Option<ScrollDirection>,
    pub confidence: f32,
    pub rationale: String,
}

impl ActionDecision {
    pub fn click(element_id: usize, confidence: f32, rationale: impl Into<String>) -> Self {
        Self {
            kind: ActionKind::Click,
            element_id: Some(element_id),
            text: None,
            direction: None,
            confidence,
            rationale: rationale.into(),
        }
    }

    pub fn type_text(
        element_id: usize,
        text: impl Into<String>,
        confidence: f32,
        rationale: impl Into<String>,
    ) -> Self {
        Self {
            kind: ActionKind::Type,
            element_id: Some(element_id),
            text: Some(text.into()),
            direction: None,
            confidence,
            rationale: rationale.into(),
        }
    }

    pub fn scroll(direction: ScrollDirection, confidence: f32, rationale: impl Into<String>) -> Self {
        Self {
            kind: ActionKind::Scroll,
            element_id: None,
            text: None,
            direction: Some(direction),
            confidence,
            rationale: rationale.into(),
        }
    }

    pub fn wait(confidence: f32, rationale: impl Into<String>) -> Self {
        Self {
            kind: ActionKind::Wait,
            element_id: None,
            text: None,
            direction: None,
            confidence,
            rationale: rationale.into(),
        }
    }

    /// Short imperative form, e.g. `type "winter jacket" into [0]`.
    pub fn describe(&self) -> String {
        match self.kind {
            ActionKind::Click => match self.element_id {
                Some(id) => format!("click [{}]", id),
                None => "click".to_string(),
            },
            ActionKind::Type => format!(
                "type \"{}\" into [{}]",
                self.text.as_deref().unwrap_or_default(),
                self.element_id.map(|id| id.to_string()).unwrap_or_default()
            ),
            ActionKind::Scroll => format!(
                "scroll {}",
                self.direction.unwrap_or(ScrollDirection::Down)
            ),
            ActionKind::Wait => "wait".to_string(),
        }
    }
}

/// Immutable record of one completed cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogStep {
    pub title: String,
    pub lines: Vec<String>,
    /// Base64-encoded PNG, present only for debug-visualization jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reflection: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Paused,
    Stopped,
    Completed,
    Error,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Stopped | JobStatus::Completed | JobStatus::Error)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Running => write!(f, "running"),
            JobStatus::Paused => write!(f, "paused"),
            JobStatus::Stopped => write!(f, "stopped"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlCommand {
    Pause,
    Resume,
    Stop,
}

/// What a caller asks for when starting a simulation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    pub url: String,
    pub goal: String,
    #[serde(default)]
    pub persona: Option<String>,
    #[serde(default)]
    pub max_steps: Option<usize>,
    #[serde(default)]
    pub debug: bool,
}

/// Envelope pushed to a job's observer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    History {
        steps: Vec<LogStep>,
        status: JobStatus,
    },
    Step {
        step: LogStep,
    },
    Status {
        status: JobStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
    },
    Error {
        message: String,
    },
}

impl JobEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            JobEvent::History { .. } => "history",
            JobEvent::Step { .. } => "step",
            JobEvent::Status { .. } => "status",
            JobEvent::Error { .. } => "error",
        }
    }
}
