#![forbid(unsafe_code)]

//! Batch audio downloading: concurrent, pausable and cancellable
//! download-and-transcode jobs with aggregated progress and per-track
//! failure reporting.
//!
//! [`controller::BatchController`] is the entry point. It runs jobs against
//! any [`backend::MediaBackend`]; [`ytdlp::YtDlpBackend`] is the production
//! one.

pub mod backend;
pub mod config;
pub mod controller;
pub mod error;
pub mod job;
pub mod logging;
pub mod options;
pub mod paths;
pub mod progress;
pub mod report;
pub mod results;
pub mod stages;
pub mod state;
pub mod ytdlp;

pub use backend::{HookAction, MediaBackend, ProgressEvent, Resolved};
pub use controller::{BatchControl, BatchController, BatchEvent, BatchHandle, BatchReport};
pub use error::BatchError;
pub use options::{AudioOptions, BatchConfig};
pub use state::BatchOutcome;
