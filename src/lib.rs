//! Persona-driven browser agent.
//!
//! A job drives a browser toward a natural-language goal one cycle at a time
//! (plan, observe, decide, execute, reflect). Jobs run in the background and
//! can be paused, resumed, stopped and watched live over SSE.

pub mod brain;
pub mod config;
pub mod context;
pub mod dom;
pub mod error;
pub mod face;
pub mod hands;
pub mod job;
pub mod orchestrator;
pub mod persona;
pub mod pipeline;
pub mod prompts;
pub mod ranker;
pub mod registry;
pub mod types;

pub use brain::{Brain, OutputMode, Reasoner};
pub use config::AgentConfig;
pub use context::{PhaseClassifier, SessionContext};
pub use error::{AgentError, Result};
pub use hands::{BrowserProvider, BrowserSession, ChromeProvider};
pub use job::{EventStream, Job, JobSpec};
pub use orchestrator::Orchestrator;
pub use persona::{Persona, PersonaCatalog};
pub use pipeline::DecisionPipeline;
pub use ranker::ElementRanker;
pub use registry::{InMemoryJobRegistry, JobRegistry};
pub use types::{ControlCommand, JobEvent, JobId, JobRequest, JobStatus, LogStep};
