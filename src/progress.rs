#![forbid(unsafe_code)]

//! Folds per-job fractions into one batch-wide percentage.

use parking_lot::Mutex;
use serde::Serialize;

/// Consistent view of the aggregate, taken under a single lock.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    /// Batch-wide fraction in `[0, 1]`, never decreasing within a batch.
    pub global: f32,
    /// Last fraction reported by whichever job reported most recently.
    pub current_job: f32,
    pub completed: usize,
    pub total: usize,
}

#[derive(Debug, Default)]
struct Tally {
    completed: usize,
    current: f32,
    high_water: f32,
}

impl Tally {
    fn computed(&self, total: usize) -> f32 {
        if total == 0 {
            return 0.0;
        }
        if total == 1 && self.completed == 0 {
            return self.current;
        }
        (self.completed as f32 + self.current) / total as f32
    }

    fn raise(&mut self, total: usize) {
        let computed = self.computed(total).clamp(0.0, 1.0);
        if computed > self.high_water {
            self.high_water = computed;
        }
    }
}

#[derive(Debug)]
pub struct ProgressAggregator {
    total: usize,
    tally: Mutex<Tally>,
}

impl ProgressAggregator {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            tally: Mutex::new(Tally::default()),
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn completed(&self) -> usize {
        self.tally.lock().completed
    }

    /// Records the latest fraction of a running job. The latest value wins
    /// for the per-job display even when it is lower than the previous one;
    /// non-finite values are dropped.
    pub fn record_fraction(&self, fraction: f32) {
        if !fraction.is_finite() {
            return;
        }
        let mut tally = self.tally.lock();
        tally.current = fraction.clamp(0.0, 1.0);
        tally.raise(self.total);
    }

    /// Counts one finished job (whatever its outcome) and returns the new
    /// completed count. Never exceeds the total.
    pub fn record_completion(&self) -> usize {
        let mut tally = self.tally.lock();
        if tally.completed < self.total {
            tally.completed += 1;
        }
        tally.current = 0.0;
        tally.raise(self.total);
        tally.completed
    }

    pub fn global_progress(&self) -> f32 {
        self.tally.lock().high_water
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let tally = self.tally.lock();
        ProgressSnapshot {
            global: tally.high_water,
            current_job: tally.current,
            completed: tally.completed,
            total: self.total,
        }
    }

    pub fn status_text(&self, paused: bool, cancelled: bool) -> String {
        if cancelled {
            return "Cancelled".to_string();
        }
        if paused {
            return "Paused".to_string();
        }
        let snapshot = self.snapshot();
        if snapshot.total <= 1 {
            format!("Downloading... {:.1}%", snapshot.global * 100.0)
        } else {
            format!(
                "Downloading {} of {} tracks...",
                snapshot.completed, snapshot.total
            )
        }
    }
}
