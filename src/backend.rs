#![forbid(unsafe_code)]

//! The media extraction capability the engine is written against.
//!
//! The engine never talks to a concrete downloader directly. It resolves
//! URLs and fetches tracks through [`MediaBackend`], which keeps the batch
//! logic testable with scripted backends and lets [`crate::ytdlp`] stay a
//! thin process wrapper.

use crate::stages::OutputSpec;
use anyhow::Result;

/// Flat listing of a URL. Collections carry their entry URLs; single tracks
/// report `is_collection == false` and no entries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolved {
    pub title: Option<String>,
    pub is_collection: bool,
    pub entries: Vec<String>,
}

impl Resolved {
    pub fn track(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            is_collection: false,
            entries: Vec::new(),
        }
    }

    pub fn collection(title: Option<String>, entries: Vec<String>) -> Self {
        Self {
            title,
            is_collection: true,
            entries,
        }
    }
}

/// Progress reported while a track is fetched.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProgressEvent {
    /// Fraction in `[0, 1]`. May arrive many times and is not guaranteed to
    /// increase.
    Downloading(f32),
    /// The transfer is done; emitted at most once.
    Finished,
}

/// Answer of a progress hook. `Stop` asks the backend to stop emitting
/// progress; the transfer itself is left to reach its own end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookAction {
    Continue,
    Stop,
}

pub trait MediaBackend: Send + Sync + 'static {
    /// Lists a URL without downloading anything.
    fn resolve(&self, url: &str) -> Result<Resolved>;

    /// Writes one audio file according to `spec`, calling `on_progress` as
    /// the transfer advances. Any error marks the job as failed.
    fn fetch(
        &self,
        url: &str,
        spec: &OutputSpec,
        on_progress: &mut dyn FnMut(ProgressEvent) -> HookAction,
    ) -> Result<()>;
}
