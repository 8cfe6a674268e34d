#![forbid(unsafe_code)]

//! Batch orchestration: URL resolution, the bounded worker pool, progress
//! polling and single-shot finalization.
//!
//! A batch goes through two steps. [`BatchController::prepare`] validates
//! the input, expands playlists and creates the output folder; any error
//! there aborts the batch before a single job runs. [`PreparedBatch::launch`]
//! then hands the jobs to `pool_size` blocking workers and returns a
//! [`BatchHandle`]. [`BatchController::start`] does both in one call.

use crate::backend::{MediaBackend, Resolved};
use crate::error::{BatchError, Result};
use crate::job::{Job, JobId, JobRun, JobSummary};
use crate::options::BatchConfig;
use crate::paths::{self, PLAYLIST_TITLE_FALLBACK};
use crate::progress::ProgressSnapshot;
use crate::stages::OutputSpec;
use crate::state::{BatchOutcome, BatchState};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// How often the reporting side samples the shared state.
pub const PROGRESS_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Query marking a playlist page, rejected in a manual queue even when the
/// listing looks like a single track.
const PLAYLIST_QUERY: &str = "playlist?list=";

/// Lifecycle notifications for the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchEvent {
    Started { total: usize },
    Progress(ProgressSnapshot),
    Finished(BatchOutcome),
}

/// Everything known about a batch once it is over.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub outcome: BatchOutcome,
    /// Every job in submission order with its final state.
    pub jobs: Vec<JobSummary>,
    pub completed: usize,
    pub total: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Event channel that closes itself after `Finished`, so a late progress
/// sample can never arrive after the final outcome.
#[derive(Debug, Clone, Default)]
struct EventSink {
    tx: Arc<Mutex<Option<UnboundedSender<BatchEvent>>>>,
}

impl EventSink {
    fn new(tx: Option<UnboundedSender<BatchEvent>>) -> Self {
        Self {
            tx: Arc::new(Mutex::new(tx)),
        }
    }

    fn send(&self, event: BatchEvent) {
        if let Some(tx) = self.tx.lock().as_ref() {
            // A dropped receiver only means nobody is watching.
            let _ = tx.send(event);
        }
    }

    fn finish(&self, last: ProgressSnapshot, outcome: BatchOutcome) {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(BatchEvent::Progress(last));
            let _ = tx.send(BatchEvent::Finished(outcome));
        }
    }
}

/// Cloneable pause/resume/cancel handle, safe to use from any thread.
#[derive(Debug, Clone)]
pub struct BatchControl {
    state: Arc<BatchState>,
}

impl BatchControl {
    /// Jobs stop at their next checkpoint; running transfers are not
    /// interrupted.
    pub fn pause(&self) {
        tracing::info!("pausing batch");
        self.state.pause();
    }

    pub fn resume(&self) {
        tracing::info!("resuming batch");
        self.state.resume();
    }

    /// Discards jobs that have not started and asks running ones to stop
    /// reporting progress. Running transfers reach their own end and files
    /// already written stay on disk.
    ///
    /// `Finished(Cancelled)` is sent once those running transfers are over,
    /// so the completed count it carries covers every job that started.
    pub fn cancel(&self) {
        tracing::info!("cancelling batch");
        self.state.cancel();
    }

    pub fn is_paused(&self) -> bool {
        self.state.is_paused()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.is_cancelled()
    }

    pub fn global_progress(&self) -> f32 {
        self.state.progress().global_progress()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.state.snapshot()
    }

    pub fn status_text(&self) -> String {
        self.state.status_text()
    }

    pub fn job_states(&self) -> Vec<crate::job::JobState> {
        self.state.job_states()
    }
}

pub struct BatchController {
    backend: Arc<dyn MediaBackend>,
    events: Option<UnboundedSender<BatchEvent>>,
}

impl BatchController {
    pub fn new(backend: Arc<dyn MediaBackend>) -> Self {
        Self {
            backend,
            events: None,
        }
    }

    pub fn with_events(mut self, events: UnboundedSender<BatchEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Prepares and launches a batch.
    pub async fn start(
        &self,
        urls: Vec<String>,
        expand_playlists: bool,
        config: BatchConfig,
    ) -> Result<BatchHandle> {
        let prepared = self.prepare(urls, expand_playlists, config).await?;
        Ok(prepared.launch())
    }

    /// Resolves the input and creates the output folder without starting any
    /// job. Errors are reported to the event channel as a hard error and
    /// returned to the caller.
    pub async fn prepare(
        &self,
        urls: Vec<String>,
        expand_playlists: bool,
        config: BatchConfig,
    ) -> Result<PreparedBatch> {
        match self.plan(urls, expand_playlists, config).await {
            Ok(plan) => {
                let sink = EventSink::new(self.events.clone());
                Ok(PreparedBatch::new(Arc::clone(&self.backend), sink, plan))
            }
            Err(err) => {
                tracing::error!("batch not started: {err}");
                if let Some(events) = &self.events {
                    let _ = events.send(BatchEvent::Finished(BatchOutcome::HardError(
                        err.to_string(),
                    )));
                }
                Err(err)
            }
        }
    }

    async fn plan(
        &self,
        urls: Vec<String>,
        expand_playlists: bool,
        config: BatchConfig,
    ) -> Result<Plan> {
        let backend = Arc::clone(&self.backend);
        tokio::task::spawn_blocking(move || {
            build_plan(backend.as_ref(), urls, expand_playlists, config)
        })
        .await
        .map_err(|err| BatchError::Interrupted(err.to_string()))?
    }
}

#[derive(Debug)]
struct Plan {
    urls: Vec<String>,
    output_dir: PathBuf,
    collection_title: Option<String>,
    config: BatchConfig,
}

/// Input validation and playlist expansion. Runs before any job exists, so
/// every error here aborts the whole batch. A manual queue is resolved too,
/// only to keep playlists out of it.
fn build_plan(
    backend: &dyn MediaBackend,
    urls: Vec<String>,
    expand_playlists: bool,
    config: BatchConfig,
) -> Result<Plan> {
    let urls: Vec<String> = urls
        .into_iter()
        .map(|url| url.trim().to_string())
        .filter(|url| !url.is_empty())
        .collect();
    if urls.is_empty() {
        return Err(BatchError::NoInput);
    }
    if let Some(bad) = urls.iter().find(|url| !paths::is_http_url(url)) {
        return Err(BatchError::InvalidUrl(bad.clone()));
    }

    if !expand_playlists {
        for url in &urls {
            if url.contains(PLAYLIST_QUERY) || resolve(backend, url)?.is_collection {
                return Err(BatchError::PlaylistInQueue(url.clone()));
            }
        }
        paths::ensure_dir(&config.music_root)?;
        return Ok(Plan {
            urls,
            output_dir: config.music_root.clone(),
            collection_title: None,
            config,
        });
    }

    let mut entries = Vec::new();
    let mut collection_title = None;
    for (index, url) in urls.iter().enumerate() {
        let resolved = resolve(backend, url)?;
        if !resolved.is_collection {
            return Err(BatchError::NotAPlaylist(url.clone()));
        }
        tracing::debug!(%url, entries = resolved.entries.len(), "expanded playlist");
        if index == 0 {
            collection_title = resolved.title.filter(|title| !title.trim().is_empty());
        }
        entries.extend(resolved.entries);
    }
    if entries.is_empty() {
        return Err(BatchError::EmptyResult);
    }

    let title = collection_title.unwrap_or_else(|| PLAYLIST_TITLE_FALLBACK.to_string());
    let output_dir = paths::playlist_dir(&config.music_root, &title);
    paths::ensure_dir(&output_dir)?;

    Ok(Plan {
        urls: entries,
        output_dir,
        collection_title: Some(title),
        config,
    })
}

fn resolve(backend: &dyn MediaBackend, url: &str) -> Result<Resolved> {
    backend.resolve(url).map_err(|source| BatchError::Resolve {
        url: url.to_string(),
        source,
    })
}

/// A batch whose jobs exist but are not running yet.
pub struct PreparedBatch {
    backend: Arc<dyn MediaBackend>,
    sink: EventSink,
    state: Arc<BatchState>,
    jobs: Vec<Job>,
    output_dir: PathBuf,
    collection_title: Option<String>,
    pool_size: usize,
}

impl PreparedBatch {
    fn new(backend: Arc<dyn MediaBackend>, sink: EventSink, plan: Plan) -> Self {
        let spec = Arc::new(OutputSpec::new(
            paths::track_template(&plan.output_dir),
            &plan.config.audio,
        ));
        let jobs: Vec<Job> = plan
            .urls
            .into_iter()
            .enumerate()
            .map(|(index, url)| Job::new(JobId(index), url, Arc::clone(&spec)))
            .collect();
        Self {
            backend,
            sink,
            state: Arc::new(BatchState::new(jobs.len())),
            jobs,
            output_dir: plan.output_dir,
            collection_title: plan.collection_title,
            pool_size: plan.config.effective_pool_size(),
        }
    }

    pub fn total(&self) -> usize {
        self.jobs.len()
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Title of the expanded playlist, `None` for a manual queue.
    pub fn collection_title(&self) -> Option<&str> {
        self.collection_title.as_deref()
    }

    pub fn control(&self) -> BatchControl {
        BatchControl {
            state: Arc::clone(&self.state),
        }
    }

    /// Hands every job to the worker pool. Must be called inside a Tokio
    /// runtime.
    pub fn launch(self) -> BatchHandle {
        let Self {
            backend,
            sink,
            state,
            jobs,
            output_dir,
            collection_title,
            pool_size,
        } = self;
        let total = jobs.len();
        let started_at = Utc::now();
        let workers_count = pool_size.min(total).max(1);

        tracing::info!(
            total,
            workers = workers_count,
            output = %output_dir.display(),
            playlist = collection_title.as_deref().unwrap_or("-"),
            "starting batch"
        );
        sink.send(BatchEvent::Started { total });

        let queue = Arc::new(Mutex::new(VecDeque::from(jobs)));
        let done = Arc::new(Mutex::new(Vec::with_capacity(total)));

        let workers: Vec<JoinHandle<()>> = (0..workers_count)
            .map(|_| {
                let queue = Arc::clone(&queue);
                let done = Arc::clone(&done);
                let backend = Arc::clone(&backend);
                let state = Arc::clone(&state);
                let sink = sink.clone();
                tokio::task::spawn_blocking(move || {
                    run_worker(&queue, &done, backend.as_ref(), &state, &sink)
                })
            })
            .collect();

        let monitor = tokio::spawn(monitor_progress(Arc::clone(&state), sink.clone()));

        let driver_state = Arc::clone(&state);
        let driver = tokio::spawn(async move {
            let state = driver_state;
            let mut hard_error = None;
            for worker in workers {
                if let Err(err) = worker.await {
                    hard_error.get_or_insert_with(|| format!("download worker stopped: {err}"));
                }
            }
            monitor.abort();

            let mut jobs: Vec<Job> = done.lock().drain(..).collect();
            for mut job in queue.lock().drain(..) {
                job.discard();
                state.set_job_state(job.id(), job.state());
                jobs.push(job);
            }
            jobs.sort_by_key(Job::id);

            finalize(&state, &sink, hard_error);
            let outcome = state.outcome().unwrap_or_else(|| {
                BatchOutcome::HardError("batch ended without an outcome".to_string())
            });

            BatchReport {
                outcome,
                jobs: jobs.iter().map(Job::summary).collect(),
                completed: state.completed(),
                total,
                started_at,
                finished_at: Utc::now(),
            }
        });

        BatchHandle {
            control: BatchControl { state },
            driver,
            total,
            started_at,
        }
    }
}

/// Running batch.
pub struct BatchHandle {
    control: BatchControl,
    driver: JoinHandle<BatchReport>,
    total: usize,
    started_at: DateTime<Utc>,
}

impl BatchHandle {
    pub fn control(&self) -> BatchControl {
        self.control.clone()
    }

    pub fn pause(&self) {
        self.control.pause();
    }

    pub fn resume(&self) {
        self.control.resume();
    }

    pub fn cancel(&self) {
        self.control.cancel();
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// Waits for every worker to drain and returns the report.
    pub async fn wait(self) -> BatchReport {
        match self.driver.await {
            Ok(report) => report,
            Err(err) => BatchReport {
                outcome: BatchOutcome::HardError(format!("batch driver stopped: {err}")),
                jobs: Vec::new(),
                completed: self.control.state.completed(),
                total: self.total,
                started_at: self.started_at,
                finished_at: Utc::now(),
            },
        }
    }
}

fn run_worker(
    queue: &Mutex<VecDeque<Job>>,
    done: &Mutex<Vec<Job>>,
    backend: &dyn MediaBackend,
    state: &BatchState,
    sink: &EventSink,
) {
    loop {
        let Some(mut job) = queue.lock().pop_front() else {
            break;
        };
        let run = job.run(backend, state);
        done.lock().push(job);
        if run == (JobRun::Completed { last: true }) {
            finalize(state, sink, None);
        }
    }
}

/// Both the worker finishing the last job and the driver after draining the
/// pool land here; the latch in [`BatchState::try_finalize`] lets only one
/// of them report.
fn finalize(state: &BatchState, sink: &EventSink, hard_error: Option<String>) {
    if let Some(outcome) = state.try_finalize(hard_error) {
        tracing::info!(
            completed = state.completed(),
            total = state.total(),
            outcome = ?outcome,
            "batch finished"
        );
        sink.finish(state.snapshot(), outcome);
    }
}

async fn monitor_progress(state: Arc<BatchState>, sink: EventSink) {
    let mut ticker = tokio::time::interval(PROGRESS_POLL_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last = None;
    loop {
        ticker.tick().await;
        if state.is_finalized() {
            break;
        }
        let snapshot = state.snapshot();
        if last != Some(snapshot) {
            sink.send(BatchEvent::Progress(snapshot));
            last = Some(snapshot);
        }
    }
}
