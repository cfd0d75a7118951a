//! One simulation run: its status signal, stop flag, history and observer.
//!
//! The history doubles as the replay buffer: attaching an observer sends the
//! full history first and then forwards live events. Only one observer is held
//! at a time; a new attach replaces (and thereby disconnects) the previous one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::context::SessionContext;
use crate::persona::Persona;
use crate::types::{ControlCommand, JobEvent, JobId, JobStatus, LogStep};

pub type EventStream = mpsc::UnboundedReceiver<JobEvent>;

/// A validated, fully resolved job request.
#[derive(Debug, Clone, Serialize)]
pub struct JobSpec {
    pub url: String,
    pub goal: String,
    pub persona: Persona,
    pub max_steps: usize,
    pub debug: bool,
}

pub struct Job {
    id: JobId,
    spec: JobSpec,
    created_at: DateTime<Utc>,
    status: watch::Sender<JobStatus>,
    stop: AtomicBool,
    record: Mutex<JobRecord>,
}

#[derive(Default)]
struct JobRecord {
    steps: Vec<LogStep>,
    observer: Option<mpsc::UnboundedSender<JobEvent>>,
    context: SessionContext,
    summary: Option<String>,
    error: Option<String>,
    finished_at: Option<DateTime<Utc>>,
    finished: Option<Instant>,
}

impl JobRecord {
    /// Best effort: a closed observer is dropped, never retried.
    fn publish(&mut self, job_id: JobId, event: JobEvent) {
        if let Some(observer) = &self.observer {
            if observer.send(event).is_err() {
                tracing::debug!(%job_id, "observer disconnected, clearing sink");
                self.observer = None;
            }
        }
    }
}

impl Job {
    pub fn new(spec: JobSpec) -> Self {
        let (status, _) = watch::channel(JobStatus::Running);
        Self {
            id: Uuid::new_v4(),
            spec,
            created_at: Utc::now(),
            status,
            stop: AtomicBool::new(false),
            record: Mutex::new(JobRecord::default()),
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn spec(&self) -> &JobSpec {
        &self.spec
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn status(&self) -> JobStatus {
        *self.status.borrow()
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn steps(&self) -> Vec<LogStep> {
        self.record.lock().steps.clone()
    }

    pub fn step_count(&self) -> usize {
        self.record.lock().steps.len()
    }

    /// Latest SessionContext as of the last completed step.
    pub fn context(&self) -> SessionContext {
        self.record.lock().context.clone()
    }

    pub fn summary(&self) -> Option<String> {
        self.record.lock().summary.clone()
    }

    /// How long ago the job reached a terminal state, if it has.
    pub fn finished_for(&self) -> Option<Duration> {
        self.record.lock().finished.map(|at| at.elapsed())
    }

    /// Apply a control command and return the resulting status. Commands that
    /// don't fit the current status (including any on a finished job) are no-ops.
    pub fn control(&self, command: ControlCommand) -> JobStatus {
        let mut record = self.record.lock();
        match command {
            ControlCommand::Pause => {
                self.transition(&mut record, JobStatus::Running, JobStatus::Paused);
            }
            ControlCommand::Resume => {
                self.transition(&mut record, JobStatus::Paused, JobStatus::Running);
            }
            ControlCommand::Stop => {
                if !self.status().is_terminal() {
                    self.stop.store(true, Ordering::SeqCst);
                    // Wake a paused loop so it can observe the flag.
                    self.status.send_modify(|_| {});
                    tracing::info!(job_id = %self.id, "stop requested");
                }
            }
        }
        self.status()
    }

    fn transition(&self, record: &mut JobRecord, from: JobStatus, to: JobStatus) {
        let changed = self.status.send_if_modified(|status| {
            if *status == from {
                *status = to;
                true
            } else {
                false
            }
        });
        if changed {
            tracing::info!(job_id = %self.id, status = %to, "status changed");
            record.publish(
                self.id,
                JobEvent::Status {
                    status: to,
                    summary: None,
                },
            );
        }
    }

    /// Register the caller as the observer. The returned stream starts with the
    /// full history; the previous observer, if any, is disconnected.
    pub fn attach(&self) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut record = self.record.lock();
        // The receiver is alive, so this cannot fail.
        let _ = tx.send(JobEvent::History {
            steps: record.steps.clone(),
            status: self.status(),
        });
        if let Some(error) = &record.error {
            let _ = tx.send(JobEvent::Error {
                message: error.clone(),
            });
        }
        if record.observer.replace(tx).is_some() {
            tracing::debug!(job_id = %self.id, "observer replaced");
        }
        rx
    }

    /// Block (asynchronously) while the job is paused. Returns early on stop.
    pub async fn wait_while_paused(&self, poll: Duration) {
        let mut status = self.status.subscribe();
        loop {
            if self.stop_requested() || *status.borrow_and_update() != JobStatus::Paused {
                return;
            }
            let _ = tokio::time::timeout(poll, status.changed()).await;
        }
    }

    pub(crate) fn record_step(&self, step: LogStep, context: &SessionContext) {
        let mut record = self.record.lock();
        record.steps.push(step.clone());
        record.context = context.clone();
        record.publish(self.id, JobEvent::Step { step });
    }

    /// Move to a terminal status. Only the first call has any effect.
    pub(crate) fn finish(&self, status: JobStatus, summary: Option<String>, error: Option<String>) {
        let mut record = self.record.lock();
        if self.status().is_terminal() {
            return;
        }
        record.summary = summary.clone();
        record.error = error.clone();
        record.finished_at = Some(Utc::now());
        record.finished = Some(Instant::now());
        self.status.send_replace(status);

        tracing::info!(job_id = %self.id, %status, steps = record.steps.len(), "job finished");
        if let Some(message) = error {
            record.publish(self.id, JobEvent::Error { message });
        }
        record.publish(self.id, JobEvent::Status { status, summary });
    }

    pub fn snapshot(&self) -> JobSnapshot {
        let record = self.record.lock();
        JobSnapshot {
            id: self.id,
            status: self.status(),
            spec: self.spec.clone(),
            created_at: self.created_at,
            finished_at: record.finished_at,
            summary: record.summary.clone(),
            error: record.error.clone(),
            context: record.context.clone(),
            steps: record.steps.clone(),
        }
    }

    pub fn overview(&self) -> JobOverview {
        JobOverview {
            id: self.id,
            status: self.status(),
            goal: self.spec.goal.clone(),
            persona: self.spec.persona.name.clone(),
            step_count: self.step_count(),
            created_at: self.created_at,
        }
    }
}

/// Full job record as served to clients.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub status: JobStatus,
    #[serde(flatten)]
    pub spec: JobSpec,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub summary: Option<String>,
    pub error: Option<String>,
    pub context: SessionContext,
    pub steps: Vec<LogStep>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobOverview {
    pub id: JobId,
    pub status: JobStatus,
    pub goal: String,
    pub persona: String,
    pub step_count: usize,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        Job::new(JobSpec {
            url: "https://shop.example.com/".into(),
            goal: "find a winter jacket".into(),
            persona: Persona::new("default", "An average shopper."),
            max_steps: 5,
            debug: false,
        })
    }

    fn step(title: &str) -> LogStep {
        LogStep {
            title: title.into(),
            lines: vec![],
            image: None,
            timestamp: Utc::now(),
            plan: None,
            observation: None,
            decision: None,
            reflection: None,
        }
    }

    #[test]
    fn pause_resume_transitions() {
        let job = job();
        assert_eq!(job.control(ControlCommand::Resume), JobStatus::Running);
        assert_eq!(job.control(ControlCommand::Pause), JobStatus::Paused);
        assert_eq!(job.control(ControlCommand::Pause), JobStatus::Paused);
        assert_eq!(job.control(ControlCommand::Resume), JobStatus::Running);
    }

    #[test]
    fn stop_sets_flag_but_not_status() {
        let job = job();
        assert_eq!(job.control(ControlCommand::Stop), JobStatus::Running);
        assert!(job.stop_requested());
    }

    #[test]
    fn controls_on_finished_job_are_noops() {
        let job = job();
        job.finish(JobStatus::Completed, Some("done".into()), None);
        assert_eq!(job.control(ControlCommand::Pause), JobStatus::Completed);
        assert_eq!(job.control(ControlCommand::Stop), JobStatus::Completed);
        assert!(!job.stop_requested());
        job.finish(JobStatus::Error, None, Some("late".into()));
        assert_eq!(job.status(), JobStatus::Completed);
        assert_eq!(job.summary().as_deref(), Some("done"));
    }

    #[test]
    fn attach_replays_history_first() {
        let job = job();
        let ctx = SessionContext::new();
        job.record_step(step("Step 1"), &ctx);
        job.record_step(step("Step 2"), &ctx);

        let mut rx = job.attach();
        job.record_step(step("Step 3"), &ctx);

        match rx.try_recv().unwrap() {
            JobEvent::History { steps, status } => {
                assert_eq!(steps.len(), 2);
                assert_eq!(steps[0].title, "Step 1");
                assert_eq!(status, JobStatus::Running);
            }
            other => panic!("expected history, got {:?}", other),
        }
        match rx.try_recv().unwrap() {
            JobEvent::Step { step } => assert_eq!(step.title, "Step 3"),
            other => panic!("expected step, got {:?}", other),
        }
    }

    #[test]
    fn reattach_replaces_previous_observer() {
        let job = job();
        let mut first = job.attach();
        let _ = first.try_recv();
        let mut second = job.attach();
        job.record_step(step("Step 1"), &SessionContext::new());

        assert!(matches!(first.try_recv(), Err(mpsc::error::TryRecvError::Disconnected)));
        assert!(matches!(second.try_recv(), Ok(JobEvent::History { .. })));
        assert!(matches!(second.try_recv(), Ok(JobEvent::Step { .. })));
    }

    #[test]
    fn dropped_observer_is_cleared() {
        let job = job();
        drop(job.attach());
        job.record_step(step("Step 1"), &SessionContext::new());
        assert!(job.record.lock().observer.is_none());
        assert_eq!(job.step_count(), 1);
    }

    #[test]
    fn finish_publishes_error_then_status() {
        let job = job();
        let mut rx = job.attach();
        let _ = rx.try_recv();
        job.finish(JobStatus::Error, None, Some("no browser".into()));
        assert!(matches!(rx.try_recv(), Ok(JobEvent::Error { .. })));
        assert!(matches!(
            rx.try_recv(),
            Ok(JobEvent::Status {
                status: JobStatus::Error,
                ..
            })
        ));
        assert!(job.finished_for().is_some());
    }

    #[tokio::test]
    async fn paused_wait_wakes_on_resume() {
        let job = std::sync::Arc::new(job());
        job.control(ControlCommand::Pause);
        let waiter = {
            let job = job.clone();
            tokio::spawn(async move { job.wait_while_paused(Duration::from_secs(30)).await })
        };
        tokio::task::yield_now().await;
        job.control(ControlCommand::Resume);
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn paused_wait_wakes_on_stop() {
        let job = std::sync::Arc::new(job());
        job.control(ControlCommand::Pause);
        let waiter = {
            let job = job.clone();
            tokio::spawn(async move { job.wait_while_paused(Duration::from_secs(30)).await })
        };
        tokio::task::yield_now().await;
        job.control(ControlCommand::Stop);
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(job.stop_requested());
    }
}
