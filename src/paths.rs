#![forbid(unsafe_code)]

//! Output layout: single tracks land directly under the music root, playlist
//! tracks go into a subfolder named after the playlist.

use crate::error::{BatchError, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// File name template handed to the backend for every track.
pub const TRACK_TEMPLATE: &str = "%(title)s.%(ext)s";

/// Title used when a playlist title cannot be resolved.
pub const PLAYLIST_TITLE_FALLBACK: &str = "Playlist";

/// Folder name used when sanitizing leaves nothing usable.
pub const EMPTY_FOLDER_PLACEHOLDER: &str = "Untitled_Playlist";

const PATH_BREAKING: [char; 9] = ['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Turns a playlist title into a single safe path component. Path-breaking
/// characters become `_`, control characters are dropped, and a name made of
/// nothing but separators or dots is replaced by the placeholder.
pub fn clean_folder_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| !c.is_control())
        .map(|c| if PATH_BREAKING.contains(&c) { '_' } else { c })
        .collect();
    let cleaned = cleaned.trim();

    let meaningful = cleaned
        .chars()
        .any(|c| !matches!(c, '_' | '.') && !c.is_whitespace());
    if meaningful {
        cleaned.to_string()
    } else {
        EMPTY_FOLDER_PLACEHOLDER.to_string()
    }
}

pub fn track_template(dir: &Path) -> PathBuf {
    dir.join(TRACK_TEMPLATE)
}

pub fn playlist_dir(music_root: &Path, title: &str) -> PathBuf {
    music_root.join(clean_folder_name(title))
}

/// Creates `dir` (and parents) if missing. Failures are setup errors.
pub fn ensure_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).map_err(|source| BatchError::Setup {
        path: dir.to_path_buf(),
        source,
    })
}

pub fn is_http_url(url: &str) -> bool {
    let lower = url.trim_start().to_ascii_lowercase();
    ["http://", "https://"]
        .iter()
        .any(|scheme| lower.len() > scheme.len() && lower.starts_with(scheme))
}
