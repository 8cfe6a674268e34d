#![forbid(unsafe_code)]

//! [`MediaBackend`] backed by the `yt-dlp` executable.
//!
//! Listings come from `--flat-playlist --dump-single-json`. Downloads run
//! with a dedicated `--progress-template` so progress lines can be told
//! apart from everything else yt-dlp prints on stdout.

use crate::backend::{HookAction, MediaBackend, ProgressEvent, Resolved};
use crate::stages::{OutputSpec, Stage};
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;

pub const DEFAULT_PROGRAM: &str = "yt-dlp";

/// Marker put in front of every progress line we ask yt-dlp to print.
const PROGRESS_MARKER: &str = "tunr-progress:";

/// Default number of results for a search.
pub const SEARCH_LIMIT: usize = 10;

#[derive(Debug, Clone)]
pub struct YtDlpBackend {
    program: PathBuf,
    cookies: Option<PathBuf>,
}

impl Default for YtDlpBackend {
    fn default() -> Self {
        Self::new(DEFAULT_PROGRAM)
    }
}

/// One search result. Collections (playlists, channels) can be queued in
/// playlist mode; everything else is a single track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub is_collection: bool,
}

#[derive(Debug, Deserialize)]
struct FlatListing {
    title: Option<String>,
    #[serde(rename = "_type")]
    kind: Option<String>,
    entries: Option<Vec<Option<FlatEntry>>>,
}

#[derive(Debug, Deserialize)]
struct FlatEntry {
    id: Option<String>,
    title: Option<String>,
    url: Option<String>,
    webpage_url: Option<String>,
    #[serde(rename = "_type")]
    kind: Option<String>,
    ie_key: Option<String>,
}

impl FlatEntry {
    fn link(&self) -> Option<String> {
        self.url
            .clone()
            .or_else(|| self.webpage_url.clone())
            .or_else(|| {
                self.id
                    .as_ref()
                    .map(|id| format!("https://www.youtube.com/watch?v={id}"))
            })
    }

    fn is_collection(&self, link: &str) -> bool {
        self.kind.as_deref() == Some("playlist")
            || self.ie_key.as_deref() == Some("YoutubeTab")
            || link.contains("list=")
    }
}

impl FlatListing {
    fn into_resolved(self) -> Resolved {
        let is_collection = self.kind.as_deref() == Some("playlist") || self.entries.is_some();
        if !is_collection {
            return Resolved {
                title: self.title,
                is_collection: false,
                entries: Vec::new(),
            };
        }
        let entries = self
            .entries
            .unwrap_or_default()
            .into_iter()
            .flatten()
            .filter_map(|entry| entry.link())
            .collect();
        Resolved::collection(self.title, entries)
    }
}

impl YtDlpBackend {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            cookies: None,
        }
    }

    /// Passes `--cookies` to every invocation when the file exists.
    pub fn with_cookies(mut self, cookies: impl Into<PathBuf>) -> Self {
        self.cookies = Some(cookies.into());
        self
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        if let Some(cookies) = self.cookies.as_ref().filter(|path| path.exists()) {
            command
                .arg("--cookies")
                .arg(cookies.to_string_lossy().to_string());
        }
        command
    }

    /// Runs `<program> --version` to fail loudly when yt-dlp is missing.
    pub fn ensure_available(&self) -> Result<String> {
        let output = Command::new(&self.program)
            .arg("--version")
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output();

        match output {
            Ok(output) if output.status.success() => {
                Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
            }
            Ok(_) => bail!(
                "{} is installed but returned a failure status",
                self.program.display()
            ),
            Err(err) => bail!(
                "{} is not installed or not in PATH: {}",
                self.program.display(),
                err
            ),
        }
    }

    fn dump_listing(&self, target: &str) -> Result<FlatListing> {
        let mut command = self.command();
        command
            .arg("--flat-playlist")
            .arg("--dump-single-json")
            .arg("--no-warnings")
            .arg("--no-progress")
            .arg(target)
            .stdin(Stdio::null());

        let output = command
            .output()
            .with_context(|| format!("listing {}", target))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            match last_error_line(stderr.lines()) {
                Some(reason) => bail!("{}", reason),
                None => bail!("listing {} failed (status {})", target, output.status),
            }
        }

        serde_json::from_slice(&output.stdout)
            .with_context(|| format!("parsing listing JSON for {}", target))
    }

    /// Searches for `query` and returns at most `limit` hits.
    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        let query = query.trim();
        if query.is_empty() {
            bail!("search query is empty");
        }
        let listing = self.dump_listing(&format!("ytsearch{}:{}", limit.max(1), query))?;
        let hits = listing
            .entries
            .unwrap_or_default()
            .into_iter()
            .flatten()
            .filter_map(|entry| {
                let url = entry.link()?;
                let is_collection = entry.is_collection(&url);
                let title = entry.title.clone().unwrap_or_else(|| url.clone());
                Some(SearchHit {
                    title,
                    url,
                    is_collection,
                })
            })
            .take(limit.max(1))
            .collect();
        Ok(hits)
    }
}

impl MediaBackend for YtDlpBackend {
    fn resolve(&self, url: &str) -> Result<Resolved> {
        Ok(self.dump_listing(url)?.into_resolved())
    }

    fn fetch(
        &self,
        url: &str,
        spec: &OutputSpec,
        on_progress: &mut dyn FnMut(ProgressEvent) -> HookAction,
    ) -> Result<()> {
        let mut command = self.command();
        command
            .args(download_args(url, spec))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        tracing::debug!(program = %self.program.display(), %url, "spawning download");
        let mut child = command
            .spawn()
            .with_context(|| format!("starting {} for {}", self.program.display(), url))?;

        let stderr = child.stderr.take().context("capturing yt-dlp stderr")?;
        let stderr_reader = thread::spawn(move || read_last_error(stderr));
        let stdout = child.stdout.take().context("capturing yt-dlp stdout")?;

        let mut stopped = false;
        for line in BufReader::new(stdout).lines().map_while(|line| line.ok()) {
            if stopped {
                continue;
            }
            let Some(fraction) = parse_progress_line(&line) else {
                tracing::trace!(%url, "{line}");
                continue;
            };
            if on_progress(ProgressEvent::Downloading(fraction)) == HookAction::Stop {
                // The process is left to finish on its own; its output is
                // still drained so it never blocks on a full pipe.
                stopped = true;
            }
        }

        let status = child
            .wait()
            .with_context(|| format!("waiting for yt-dlp on {}", url))?;
        let last_error = stderr_reader.join().ok().flatten();

        if stopped {
            return Ok(());
        }
        if !status.success() {
            match last_error {
                Some(reason) => bail!("{}", reason),
                None => bail!("yt-dlp exited with {} for {}", status, url),
            }
        }
        on_progress(ProgressEvent::Finished);
        Ok(())
    }
}

/// Command line for one track download.
pub fn download_args(url: &str, spec: &OutputSpec) -> Vec<String> {
    let mut args = vec![
        "--no-playlist".to_string(),
        "--newline".to_string(),
        "--no-color".to_string(),
        "--progress-template".to_string(),
        format!("download:{PROGRESS_MARKER}%(progress._percent_str)s"),
        "-f".to_string(),
        spec.format.clone(),
        "-o".to_string(),
        spec.template.to_string_lossy().to_string(),
    ];

    if let Some((codec, bitrate)) = spec.extraction() {
        args.push("-x".to_string());
        args.push("--audio-format".to_string());
        args.push(codec.as_str().to_string());
        if let Some(bitrate) = bitrate {
            args.push("--audio-quality".to_string());
            args.push(format!("{}K", bitrate.kbps()));
        }
    }
    if spec.has_stage(&Stage::EmbedMetadata) {
        args.push("--embed-metadata".to_string());
    }
    if spec.has_stage(&Stage::EmbedThumbnail) {
        args.push("--embed-thumbnail".to_string());
    } else if spec.write_thumbnail {
        args.push("--write-thumbnail".to_string());
    }
    if spec.keep_original {
        args.push("-k".to_string());
    }

    let ffmpeg = spec.ffmpeg_args();
    if !ffmpeg.is_empty() {
        args.push("--postprocessor-args".to_string());
        args.push(format!("ExtractAudio+ffmpeg_o:{}", ffmpeg.join(" ")));
    }

    args.push(url.to_string());
    args
}

/// Reads a fraction out of a `tunr-progress: 42.0%` line. Lines without the
/// marker and unknown percentages (`N/A`) yield `None`. Only the number right
/// before the last `%` counts, so colour codes around it are ignored.
fn parse_progress_line(line: &str) -> Option<f32> {
    let raw = line.trim().strip_prefix(PROGRESS_MARKER)?;
    let number = raw.rfind('%').map_or(raw, |end| &raw[..end]).trim_end();
    let prefix = number.trim_end_matches(|c: char| c.is_ascii_digit() || c == '.');
    let percent = number[prefix.len()..].parse::<f32>().ok()?;
    Some((percent / 100.0).clamp(0.0, 1.0))
}

/// Picks the most useful line of a failed run: the last `ERROR:` line,
/// otherwise the last non-empty one.
fn last_error_line<'a>(lines: impl Iterator<Item = &'a str>) -> Option<String> {
    let mut last = None;
    let mut last_error = None;
    for line in lines.map(str::trim).filter(|line| !line.is_empty()) {
        if let Some(reason) = line.strip_prefix("ERROR:") {
            last_error = Some(reason.trim().to_string());
        }
        last = Some(line.to_string());
    }
    last_error.or(last)
}

fn read_last_error(stderr: impl Read) -> Option<String> {
    let lines: Vec<String> = BufReader::new(stderr)
        .lines()
        .map_while(|line| line.ok())
        .collect();
    last_error_line(lines.iter().map(String::as_str))
}
