#![forbid(unsafe_code)]

//! JSON progress file for external watchers, plus the final batch report.
//!
//! Both are written to a `.tmp` sibling first and renamed into place, so a
//! reader never sees a half-written document.

use crate::controller::BatchReport;
use crate::progress::ProgressSnapshot;
use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressReport {
    /// Whole-batch percentage, 0..=100.
    pub progress: u8,
    pub current_job: u8,
    pub completed: usize,
    pub total: usize,
    pub message: String,
}

impl ProgressReport {
    pub fn from_snapshot(snapshot: &ProgressSnapshot, message: &str) -> Self {
        Self {
            progress: percent(snapshot.global),
            current_job: percent(snapshot.current_job),
            completed: snapshot.completed,
            total: snapshot.total,
            message: message.to_string(),
        }
    }
}

fn percent(fraction: f32) -> u8 {
    (fraction.clamp(0.0, 1.0) * 100.0).round() as u8
}

#[derive(Debug, Clone)]
pub struct ProgressWriter {
    path: PathBuf,
}

impl ProgressWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Best effort: a progress file that cannot be written is logged and
    /// otherwise ignored.
    pub fn write(&self, snapshot: &ProgressSnapshot, message: &str) {
        let report = ProgressReport::from_snapshot(snapshot, message);
        if let Err(err) = write_json_atomic(&self.path, &report) {
            tracing::warn!("could not update progress file: {err:#}");
        }
    }
}

/// Writes the end-of-batch report.
pub fn write_batch_report(path: &Path, report: &BatchReport) -> Result<()> {
    write_json_atomic(path, report)
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let payload = serde_json::to_vec_pretty(value).context("serializing report")?;
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, payload).with_context(|| format!("writing {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("finalizing {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobId, JobState, JobSummary};
    use crate::state::BatchOutcome;
    use chrono::Utc;
    use serde_json::Value;
    use tempfile::tempdir;

    fn snapshot() -> ProgressSnapshot {
        ProgressSnapshot {
            global: 0.456,
            current_job: 0.5,
            completed: 1,
            total: 3,
        }
    }

    #[test]
    fn progress_file_is_written_atomically() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state").join("progress.json");
        let writer = ProgressWriter::new(&path);
        writer.write(&snapshot(), "Downloading 1 of 3 tracks...");

        let value: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["progress"], 46);
        assert_eq!(value["currentJob"], 50);
        assert_eq!(value["completed"], 1);
        assert_eq!(value["total"], 3);
        assert_eq!(value["message"], "Downloading 1 of 3 tracks...");
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn unwritable_progress_file_is_ignored() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, b"x").unwrap();
        ProgressWriter::new(blocker.join("progress.json")).write(&snapshot(), "x");
    }

    #[test]
    fn batch_report_lists_outcome_and_jobs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("report.json");
        let report = BatchReport {
            outcome: BatchOutcome::Cancelled,
            jobs: vec![JobSummary {
                id: JobId(0),
                url: "https://x/watch?v=a".into(),
                state: JobState::Cancelled,
                progress: 0.25,
            }],
            completed: 1,
            total: 1,
            started_at: Utc::now(),
            finished_at: Utc::now(),
        };
        write_batch_report(&path, &report).unwrap();

        let value: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["outcome"]["kind"], "cancelled");
        assert_eq!(value["jobs"][0]["state"], "cancelled");
        assert_eq!(value["completed"], 1);
        assert!(value["startedAt"].is_string());
    }
}
