#![forbid(unsafe_code)]

//! Per-job outcomes collected while a batch runs.

use crate::job::JobId;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};

/// One failed job. `label` is the short name shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    pub job: JobId,
    pub url: String,
    pub label: String,
    pub reason: String,
}

impl Failure {
    pub fn new(job: JobId, url: &str, reason: impl Into<String>) -> Self {
        Self {
            job,
            url: url.to_string(),
            label: track_label(url),
            reason: reason.into(),
        }
    }
}

/// Short label for a track URL: the `v=` query value when there is one,
/// otherwise the URL itself.
pub fn track_label(url: &str) -> String {
    url.split_once("v=")
        .map(|(_, rest)| rest.split('&').next().unwrap_or(rest))
        .filter(|id| !id.is_empty())
        .unwrap_or(url)
        .to_string()
}

/// Failures are kept in completion order, which differs between runs.
#[derive(Debug, Default)]
pub struct ResultCollector {
    failures: Mutex<Vec<Failure>>,
    succeeded: AtomicUsize,
}

impl ResultCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self) {
        self.succeeded.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_failure(&self, failure: Failure) {
        tracing::warn!(url = %failure.url, reason = %failure.reason, "track failed");
        self.failures.lock().push(failure);
    }

    pub fn succeeded(&self) -> usize {
        self.succeeded.load(Ordering::SeqCst)
    }

    pub fn is_full_success(&self) -> bool {
        self.failures.lock().is_empty()
    }

    pub fn failures(&self) -> Vec<Failure> {
        self.failures.lock().clone()
    }
}
