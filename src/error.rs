#![forbid(unsafe_code)]

//! Errors that stop a batch before any job runs.
//!
//! Per-job failures never show up here: they are collected by
//! [`crate::results::ResultCollector`] and reported in the final outcome.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("no URLs were provided")]
    NoInput,

    #[error("not a valid http(s) URL: {0}")]
    InvalidUrl(String),

    #[error("not a playlist: {0}")]
    NotAPlaylist(String),

    #[error("playlists cannot be queued as songs: {0}")]
    PlaylistInQueue(String),

    #[error("the playlist did not contain any tracks")]
    EmptyResult,

    #[error("could not resolve {url}: {source:#}")]
    Resolve {
        url: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("could not prepare {}: {source}", path.display())]
    Setup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("batch setup was interrupted: {0}")]
    Interrupted(String),
}

impl BatchError {
    /// Input errors are caused by what the caller submitted; everything else
    /// is a setup failure surfaced as a hard error.
    pub fn is_input(&self) -> bool {
        matches!(
            self,
            Self::NoInput
                | Self::InvalidUrl(_)
                | Self::NotAPlaylist(_)
                | Self::PlaylistInQueue(_)
                | Self::EmptyResult
        )
    }
}

pub type Result<T> = std::result::Result<T, BatchError>;
