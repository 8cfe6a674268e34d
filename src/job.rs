#![forbid(unsafe_code)]

//! A single URL-to-file task and the cooperative checkpoints it runs through.
//!
//! A job checks the shared flags twice: once before its transfer starts and
//! again on every progress event. While paused it is held in a bounded
//! sleep-and-recheck loop; once cancelled it stops asking the backend for
//! progress and never reports success or failure.

use crate::backend::{HookAction, MediaBackend, ProgressEvent};
use crate::results::Failure;
use crate::stages::OutputSpec;
use crate::state::{BatchState, Checkpoint};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct JobId(pub usize);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Paused,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

/// Final view of a job, listed in the batch report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSummary {
    pub id: JobId,
    pub url: String,
    pub state: JobState,
    pub progress: f32,
}

#[derive(Debug)]
pub struct Job {
    id: JobId,
    url: String,
    spec: Arc<OutputSpec>,
    state: JobState,
    progress: f32,
}

/// What happened when a job was handed to a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobRun {
    /// Dropped at the pre-start checkpoint; never counted as completed.
    Skipped,
    /// Entered `Running` and was counted. `last` is set for the completion
    /// that brought the batch to its total.
    Completed { last: bool },
}

impl Job {
    pub fn new(id: JobId, url: impl Into<String>, spec: Arc<OutputSpec>) -> Self {
        Self {
            id,
            url: url.into(),
            spec,
            state: JobState::Pending,
            progress: 0.0,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn spec(&self) -> &OutputSpec {
        &self.spec
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn progress(&self) -> f32 {
        self.progress
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.id,
            url: self.url.clone(),
            state: self.state,
            progress: self.progress,
        }
    }

    /// Marks a job that was discarded before any worker reached it.
    pub fn discard(&mut self) {
        if !self.state.is_terminal() {
            self.state = JobState::Cancelled;
        }
    }

    fn enter(&mut self, state: JobState, batch: &BatchState) {
        self.state = state;
        batch.set_job_state(self.id, state);
    }

    /// Runs the job to completion on the calling thread. Backend errors are
    /// recorded as failures and never propagate.
    pub fn run(&mut self, backend: &dyn MediaBackend, batch: &BatchState) -> JobRun {
        if batch.is_paused() && !batch.is_cancelled() {
            self.enter(JobState::Paused, batch);
        }
        if batch.checkpoint() == Checkpoint::Cancelled {
            tracing::debug!(job = %self.id, "skipped after cancellation");
            self.enter(JobState::Cancelled, batch);
            return JobRun::Skipped;
        }

        self.enter(JobState::Running, batch);
        tracing::debug!(job = %self.id, url = %self.url, "starting transfer");

        let id = self.id;
        let mut last_fraction = self.progress;
        let mut stopped = false;
        let mut hook = |event: ProgressEvent| -> HookAction {
            if stopped {
                return HookAction::Stop;
            }
            if batch.is_paused() && !batch.is_cancelled() {
                batch.set_job_state(id, JobState::Paused);
                let checkpoint = batch.checkpoint();
                batch.set_job_state(id, JobState::Running);
                if checkpoint == Checkpoint::Cancelled {
                    stopped = true;
                    return HookAction::Stop;
                }
            } else if batch.is_cancelled() {
                stopped = true;
                return HookAction::Stop;
            }
            match event {
                ProgressEvent::Downloading(fraction) if fraction.is_finite() => {
                    last_fraction = fraction.clamp(0.0, 1.0);
                    batch.progress().record_fraction(last_fraction);
                }
                ProgressEvent::Downloading(_) => {}
                ProgressEvent::Finished => {
                    last_fraction = 1.0;
                    batch.progress().record_fraction(1.0);
                }
            }
            HookAction::Continue
        };

        let result = backend.fetch(&self.url, &self.spec, &mut hook);
        self.progress = last_fraction;

        if stopped || batch.is_cancelled() {
            tracing::debug!(job = %self.id, "transfer ended after cancellation");
            self.enter(JobState::Cancelled, batch);
        } else {
            match result {
                Ok(()) => {
                    self.progress = 1.0;
                    batch.record_success();
                    self.enter(JobState::Succeeded, batch);
                    tracing::debug!(job = %self.id, "transfer finished");
                }
                Err(err) => {
                    batch.record_failure(Failure::new(self.id, &self.url, format!("{err:#}")));
                    self.enter(JobState::Failed, batch);
                }
            }
        }

        JobRun::Completed {
            last: batch.finish_job(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Resolved;
    use crate::options::AudioOptions;
    use crate::results::track_label;
    use anyhow::{Result, bail};
    use parking_lot::Mutex;
    use std::path::PathBuf;

    /// Replays a fixed list of progress events, then succeeds or fails.
    struct Replay {
        events: Vec<ProgressEvent>,
        fail_with: Option<&'static str>,
        delivered: Mutex<Vec<ProgressEvent>>,
    }

    impl Replay {
        fn new(events: Vec<ProgressEvent>, fail_with: Option<&'static str>) -> Self {
            Self {
                events,
                fail_with,
                delivered: Mutex::new(Vec::new()),
            }
        }
    }

    impl MediaBackend for Replay {
        fn resolve(&self, url: &str) -> Result<Resolved> {
            Ok(Resolved::track(url))
        }

        fn fetch(
            &self,
            _url: &str,
            _spec: &OutputSpec,
            on_progress: &mut dyn FnMut(ProgressEvent) -> HookAction,
        ) -> Result<()> {
            for event in &self.events {
                if on_progress(*event) == HookAction::Stop {
                    break;
                }
                self.delivered.lock().push(*event);
            }
            if let Some(message) = self.fail_with {
                bail!(message);
            }
            Ok(())
        }
    }

    fn job(url: &str) -> Job {
        let spec = OutputSpec::new(PathBuf::from("/m/%(title)s.%(ext)s"), &AudioOptions::default());
        Job::new(JobId(0), url, Arc::new(spec))
    }

    #[test]
    fn successful_job_counts_and_reaches_full_progress() {
        let backend = Replay::new(
            vec![
                ProgressEvent::Downloading(0.4),
                ProgressEvent::Downloading(0.2),
                ProgressEvent::Finished,
            ],
            None,
        );
        let batch = BatchState::new(1);
        let mut job = job("https://x/watch?v=a");
        assert_eq!(job.run(&backend, &batch), JobRun::Completed { last: true });
        assert_eq!(job.state(), JobState::Succeeded);
        assert_eq!(job.progress(), 1.0);
        assert_eq!(batch.completed(), 1);
        assert_eq!(batch.job_states(), vec![JobState::Succeeded]);
        assert!(batch.results().is_full_success());
    }

    #[test]
    fn backend_error_becomes_a_failure_record() {
        let backend = Replay::new(vec![ProgressEvent::Downloading(0.3)], Some("HTTP Error 403"));
        let batch = BatchState::new(2);
        let mut job = job("https://x/watch?v=b");
        assert_eq!(job.run(&backend, &batch), JobRun::Completed { last: false });
        assert_eq!(job.state(), JobState::Failed);
        let failures = batch.results().failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].label, track_label("https://x/watch?v=b"));
        assert!(failures[0].reason.contains("403"));
    }

    #[test]
    fn cancelled_before_start_is_skipped() {
        let backend = Replay::new(vec![ProgressEvent::Finished], None);
        let batch = BatchState::new(1);
        batch.cancel();
        let mut job = job("https://x/1");
        assert_eq!(job.run(&backend, &batch), JobRun::Skipped);
        assert_eq!(job.state(), JobState::Cancelled);
        assert_eq!(batch.completed(), 0);
        assert!(backend.delivered.lock().is_empty());
    }

    #[test]
    fn cancel_mid_transfer_stops_progress_but_counts_the_job() {
        struct CancelsHalfway {
            batch: Arc<BatchState>,
            delivered: Mutex<usize>,
        }

        impl MediaBackend for CancelsHalfway {
            fn resolve(&self, url: &str) -> Result<Resolved> {
                Ok(Resolved::track(url))
            }

            fn fetch(
                &self,
                _url: &str,
                _spec: &OutputSpec,
                on_progress: &mut dyn FnMut(ProgressEvent) -> HookAction,
            ) -> Result<()> {
                for step in 1..=4 {
                    if step == 3 {
                        self.batch.cancel();
                    }
                    if on_progress(ProgressEvent::Downloading(step as f32 / 4.0))
                        == HookAction::Stop
                    {
                        return Ok(());
                    }
                    *self.delivered.lock() += 1;
                }
                Ok(())
            }
        }

        let batch = Arc::new(BatchState::new(1));
        let backend = CancelsHalfway {
            batch: Arc::clone(&batch),
            delivered: Mutex::new(0),
        };
        let mut job = job("https://x/2");
        assert_eq!(job.run(&backend, &batch), JobRun::Completed { last: true });
        assert_eq!(job.state(), JobState::Cancelled);
        assert_eq!(*backend.delivered.lock(), 2);
        assert_eq!(batch.completed(), 1);
        assert!(batch.results().is_full_success());
        assert_eq!(batch.results().succeeded(), 0);
    }

    #[test]
    fn discard_leaves_terminal_jobs_alone() {
        let mut pending = job("https://x/3");
        pending.discard();
        assert_eq!(pending.state(), JobState::Cancelled);
    }
}
