#![forbid(unsafe_code)]

//! State shared between the controller and every running job.
//!
//! Flags are lock-free atomics so jobs can check them from any checkpoint.
//! Counters live behind the aggregator's lock so a reader always sees a
//! consistent `(completed, current)` pair. Finalization goes through a
//! single-fire latch: whoever wins it computes the outcome, everyone else
//! gets `None`.

use crate::job::{JobId, JobState};
use crate::progress::{ProgressAggregator, ProgressSnapshot};
use crate::results::{Failure, ResultCollector};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

/// Sleep between two looks at the pause flag while a job is held.
pub const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Terminal result of a batch, as reported to the presentation side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "camelCase")]
pub enum BatchOutcome {
    AllSucceeded,
    PartialFailure(Vec<Failure>),
    Cancelled,
    HardError(String),
}

/// Result of a cooperative checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    Proceed,
    Cancelled,
}

#[derive(Debug)]
pub struct BatchState {
    paused: AtomicBool,
    cancelled: AtomicBool,
    finalized: AtomicBool,
    progress: ProgressAggregator,
    results: ResultCollector,
    jobs: Mutex<Vec<JobState>>,
    outcome: Mutex<Option<BatchOutcome>>,
}

impl BatchState {
    pub fn new(total: usize) -> Self {
        Self {
            paused: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
            progress: ProgressAggregator::new(total),
            results: ResultCollector::new(),
            jobs: Mutex::new(vec![JobState::Pending; total]),
            outcome: Mutex::new(None),
        }
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    /// Once set, the flag stays set for the rest of the batch.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> usize {
        self.progress.total()
    }

    pub fn completed(&self) -> usize {
        self.progress.completed()
    }

    pub fn progress(&self) -> &ProgressAggregator {
        &self.progress
    }

    pub fn results(&self) -> &ResultCollector {
        &self.results
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.progress.snapshot()
    }

    pub fn status_text(&self) -> String {
        self.progress.status_text(self.is_paused(), self.is_cancelled())
    }

    /// Holds the caller while the batch is paused, re-checking every
    /// [`PAUSE_POLL_INTERVAL`]. Returns as soon as the batch is resumed or
    /// cancelled.
    pub fn checkpoint(&self) -> Checkpoint {
        loop {
            if self.is_cancelled() {
                return Checkpoint::Cancelled;
            }
            if !self.is_paused() {
                return Checkpoint::Proceed;
            }
            thread::sleep(PAUSE_POLL_INTERVAL);
        }
    }

    /// Publishes a job transition so the presentation side can list jobs
    /// while they run.
    pub fn set_job_state(&self, job: JobId, state: JobState) {
        if let Some(slot) = self.jobs.lock().get_mut(job.0) {
            *slot = state;
        }
    }

    pub fn job_states(&self) -> Vec<JobState> {
        self.jobs.lock().clone()
    }

    pub fn record_failure(&self, failure: Failure) {
        self.results.record_failure(failure);
    }

    pub fn record_success(&self) {
        self.results.record_success();
    }

    /// Counts a job that entered `Running`, whatever its outcome. Returns
    /// `true` for the completion that brings the count to the total.
    pub fn finish_job(&self) -> bool {
        let total = self.total();
        let completed = self.progress.record_completion();
        completed == total
    }

    /// Fires the finalization latch. Only the first caller gets the outcome;
    /// later callers (a racing last job, the controller after draining the
    /// pool) get `None`.
    pub fn try_finalize(&self, hard_error: Option<String>) -> Option<BatchOutcome> {
        if self
            .finalized
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return None;
        }
        let outcome = match hard_error {
            Some(message) => BatchOutcome::HardError(message),
            None if self.is_cancelled() => BatchOutcome::Cancelled,
            None if self.results.is_full_success() => BatchOutcome::AllSucceeded,
            None => BatchOutcome::PartialFailure(self.results.failures()),
        };
        *self.outcome.lock() = Some(outcome.clone());
        Some(outcome)
    }

    pub fn outcome(&self) -> Option<BatchOutcome> {
        self.outcome.lock().clone()
    }
}
