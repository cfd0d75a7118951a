//! Job lifecycle: validate and submit, run the decision loop in the
//! background, apply pause/resume/stop, and hand out event streams.

use std::sync::Arc;

use reqwest::Url;
use tracing::Instrument;

use crate::brain::Reasoner;
use crate::config::{AgentConfig, LoopConfig};
use crate::context::SessionContext;
use crate::error::{AgentError, Result};
use crate::hands::{BrowserProvider, BrowserSession};
use crate::job::{EventStream, Job, JobSpec};
use crate::persona::PersonaCatalog;
use crate::pipeline::{CycleInput, DecisionPipeline, fallback_summary};
use crate::registry::JobRegistry;
use crate::types::{ControlCommand, JobId, JobRequest, JobStatus};

#[derive(Clone)]
pub struct Orchestrator {
    registry: Arc<dyn JobRegistry>,
    browsers: Arc<dyn BrowserProvider>,
    pipeline: Arc<DecisionPipeline>,
    personas: Arc<PersonaCatalog>,
    settings: LoopConfig,
}

impl Orchestrator {
    pub fn new(
        config: &AgentConfig,
        reasoner: Arc<dyn Reasoner>,
        browsers: Arc<dyn BrowserProvider>,
        registry: Arc<dyn JobRegistry>,
    ) -> Result<Self> {
        Ok(Self {
            registry,
            browsers,
            pipeline: Arc::new(DecisionPipeline::new(reasoner, config)?),
            personas: Arc::new(PersonaCatalog::new(&config.personas)),
            settings: config.agent.clone(),
        })
    }

    pub fn personas(&self) -> &PersonaCatalog {
        &self.personas
    }

    /// Validate `request`, register a new job and start its loop. Returns
    /// immediately. Must be called from within a tokio runtime.
    pub fn submit(&self, request: JobRequest) -> Result<JobId> {
        let spec = self.resolve(request)?;

        let pruned = self.registry.prune_finished(self.settings.retention());
        if pruned > 0 {
            tracing::debug!(pruned, "dropped expired jobs");
        }

        let job = Arc::new(Job::new(spec));
        let id = job.id();
        self.registry.insert(job.clone());
        tracing::info!(job_id = %id, goal = %job.spec().goal, url = %job.spec().url, "job submitted");

        let runner = JobRunner {
            job: job.clone(),
            browsers: self.browsers.clone(),
            pipeline: self.pipeline.clone(),
            settings: self.settings.clone(),
        };
        let span = tracing::info_span!("job", job_id = %id);
        tokio::spawn(async move {
            // The inner task turns a panic into a JoinError instead of a job stuck in `running`.
            let outcome = tokio::spawn(runner.run().instrument(span)).await;
            if let Err(err) = outcome {
                tracing::error!(job_id = %id, error = %err, "job task crashed");
                job.finish(
                    JobStatus::Error,
                    None,
                    Some(format!("Job task crashed: {}", err)),
                );
            }
        });

        Ok(id)
    }

    pub fn control(&self, id: JobId, command: ControlCommand) -> Result<JobStatus> {
        let job = self.get(id)?;
        let status = job.control(command);
        tracing::debug!(job_id = %id, ?command, %status, "control applied");
        Ok(status)
    }

    /// Become the job's observer: full history first, then live events.
    pub fn attach(&self, id: JobId) -> Result<EventStream> {
        Ok(self.get(id)?.attach())
    }

    pub fn get(&self, id: JobId) -> Result<Arc<Job>> {
        self.registry.get(&id).ok_or(AgentError::JobNotFound(id))
    }

    pub fn list(&self) -> Vec<Arc<Job>> {
        self.registry.list()
    }

    fn resolve(&self, request: JobRequest) -> Result<JobSpec> {
        let url = Url::parse(request.url.trim())
            .ok()
            .filter(|u| matches!(u.scheme(), "http" | "https"))
            .ok_or_else(|| {
                AgentError::InvalidRequest(format!("'{}' is not an http(s) address", request.url))
            })?;

        let goal = request.goal.trim();
        if goal.is_empty() {
            return Err(AgentError::InvalidRequest("goal must not be empty".into()));
        }

        let max_steps = request.max_steps.unwrap_or(self.settings.default_max_steps);
        if max_steps == 0 || max_steps > self.settings.max_steps_limit {
            return Err(AgentError::InvalidRequest(format!(
                "max_steps must be within 1..={}",
                self.settings.max_steps_limit
            )));
        }

        Ok(JobSpec {
            url: url.to_string(),
            goal: goal.to_string(),
            persona: self.personas.resolve(request.persona.as_deref())?,
            max_steps,
            debug: request.debug,
        })
    }
}

/// Everything one background run needs, moved into its task.
struct JobRunner {
    job: Arc<Job>,
    browsers: Arc<dyn BrowserProvider>,
    pipeline: Arc<DecisionPipeline>,
    settings: LoopConfig,
}

impl JobRunner {
    async fn run(self) {
        let spec = self.job.spec().clone();
        tracing::info!(persona = %spec.persona.name, max_steps = spec.max_steps, "job started");

        let session = match self.browsers.open_session().await {
            Ok(session) => session,
            Err(err) => {
                self.fail(format!("Could not acquire a browser session: {}", err));
                return;
            }
        };

        if let Err(err) = session.navigate(&spec.url).await {
            self.fail(format!("Could not open {}: {}", spec.url, err));
            close(session.as_ref()).await;
            return;
        }

        let mut arrival_note = match session.dismiss_consent_if_present().await {
            Ok(true) => Some("Dismissed a consent banner on arrival".to_string()),
            Ok(false) => None,
            Err(err) => Some(format!("Consent check failed: {}", err)),
        };

        let mut ctx = SessionContext::new();
        let mut step = 0;

        while step < spec.max_steps {
            self.job.wait_while_paused(self.settings.pause_poll()).await;
            if self.job.stop_requested() {
                tracing::info!(step, "stop observed at step boundary");
                break;
            }

            step += 1;
            let input = CycleInput {
                goal: &spec.goal,
                persona: &spec.persona,
                step,
                max_steps: spec.max_steps,
                debug: spec.debug,
            };
            let mut outcome = self
                .pipeline
                .run_cycle(session.as_ref(), &mut ctx, &input)
                .await;
            if let Some(note) = arrival_note.take() {
                outcome.log.lines.insert(0, note);
            }
            self.job.record_step(outcome.log, &ctx);

            if outcome.goal_reached {
                tracing::info!(step, "goal reached");
                break;
            }
            if step < spec.max_steps && !self.job.stop_requested() {
                tokio::time::sleep(self.settings.settle_delay()).await;
            }
        }

        let (status, summary) = if self.job.stop_requested() {
            (JobStatus::Stopped, fallback_summary(step, &ctx))
        } else {
            let steps = self.job.steps();
            let summary = self
                .pipeline
                .summarize(&spec.goal, &spec.persona, &steps, &ctx)
                .await;
            (JobStatus::Completed, summary)
        };

        close(session.as_ref()).await;
        self.job.finish(status, Some(summary), None);
    }

    fn fail(&self, message: String) {
        tracing::error!(error = %message, "job failed during setup");
        self.job.finish(JobStatus::Error, None, Some(message));
    }
}

async fn close(session: &dyn BrowserSession) {
    if let Err(err) = session.close().await {
        tracing::debug!(error = %err, "closing browser session failed");
    }
}
