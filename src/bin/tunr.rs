#![forbid(unsafe_code)]

//! Command-line front end for the batch downloader.
//!
//! `tunr songs <url>...` downloads individual tracks into the music root,
//! `tunr playlist <url>...` expands playlists into a folder named after the
//! first one, and `tunr search <query>` lists matches. While a batch runs,
//! typing `p`, `r` or `c` followed by Enter pauses, resumes or cancels it;
//! Ctrl-C cancels as well.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::fs;
use std::io::{BufRead, IsTerminal};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::mpsc::unbounded_channel;
use tunr_tools::config::{SettingsOverrides, load_audio_options, resolve_settings};
use tunr_tools::controller::{BatchControl, BatchController, BatchEvent};
use tunr_tools::logging;
use tunr_tools::options::{
    AudioOptions, BatchConfig, BitDepth, Bitrate, ChannelLayout, Codec, LoudnessTarget,
    Normalization, SampleRate,
};
use tunr_tools::report::{ProgressWriter, write_batch_report};
use tunr_tools::state::BatchOutcome;
use tunr_tools::ytdlp::{SEARCH_LIMIT, YtDlpBackend};

const EXIT_FAILURES: u8 = 1;
const EXIT_BAD_INPUT: u8 = 2;
const EXIT_CANCELLED: u8 = 130;

#[derive(Debug, Parser)]
#[command(name = "tunr", version, about = "Batch audio downloader built on yt-dlp")]
struct Cli {
    /// Log debug details (overridden by RUST_LOG).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Download individual tracks into the music root.
    Songs(DownloadArgs),
    /// Expand playlists and download every track into a playlist folder.
    Playlist(DownloadArgs),
    /// List matches for a free-text query.
    Search(SearchArgs),
}

#[derive(Debug, Args)]
struct DownloadArgs {
    /// Track or playlist URLs.
    urls: Vec<String>,

    /// Read additional URLs from a file, one per line (`#` starts a comment).
    #[arg(long, value_name = "FILE")]
    input: Option<PathBuf>,

    #[command(flatten)]
    settings: SettingsArgs,

    #[command(flatten)]
    audio: AudioArgs,

    /// Keep a JSON progress snapshot up to date at this path.
    #[arg(long, value_name = "FILE")]
    progress_file: Option<PathBuf>,

    /// Write the final batch report as JSON.
    #[arg(long, value_name = "FILE")]
    report: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct SearchArgs {
    query: Vec<String>,

    #[arg(long, default_value_t = SEARCH_LIMIT)]
    limit: usize,

    /// Print results as JSON.
    #[arg(long)]
    json: bool,

    #[command(flatten)]
    settings: SettingsArgs,
}

#[derive(Debug, Default, Args)]
struct SettingsArgs {
    /// Root folder for downloaded music [env: TUNR_MUSIC_ROOT].
    #[arg(long, value_name = "DIR")]
    music_root: Option<PathBuf>,

    /// Parallel downloads, 1 to 8 [env: TUNR_THREADS].
    #[arg(long)]
    threads: Option<usize>,

    /// yt-dlp executable [env: TUNR_YT_DLP].
    #[arg(long = "yt-dlp", value_name = "PATH")]
    yt_dlp: Option<PathBuf>,

    /// Netscape cookie file handed to yt-dlp [env: TUNR_COOKIES].
    #[arg(long, value_name = "FILE")]
    cookies: Option<PathBuf>,

    /// Alternative `.env` file.
    #[arg(long, value_name = "FILE")]
    env_file: Option<PathBuf>,
}

impl SettingsArgs {
    fn overrides(&self) -> SettingsOverrides {
        SettingsOverrides {
            music_root: self.music_root.clone(),
            threads: self.threads,
            yt_dlp: self.yt_dlp.clone(),
            cookies: self.cookies.clone(),
            env_path: self.env_file.clone(),
        }
    }
}

#[derive(Debug, Default, Args)]
struct AudioArgs {
    /// TOML preset with audio options; flags below override it.
    #[arg(long, value_name = "FILE")]
    options: Option<PathBuf>,

    #[arg(long, value_parser = Codec::parse)]
    codec: Option<Codec>,

    /// Bitrate in kbps (lossy codecs).
    #[arg(long, value_parser = parse_bitrate)]
    bitrate: Option<Bitrate>,

    /// Bits per sample (lossless codecs).
    #[arg(long, value_parser = parse_bit_depth)]
    bit_depth: Option<BitDepth>,

    /// Sample rate in Hz (lossless codecs).
    #[arg(long, value_parser = parse_sample_rate)]
    sample_rate: Option<SampleRate>,

    /// stereo, mono or multichannel.
    #[arg(long, value_parser = ChannelLayout::parse)]
    channels: Option<ChannelLayout>,

    /// off, lufs_14, lufs_23 or custom.
    #[arg(long, value_parser = Normalization::parse)]
    normalize: Option<Normalization>,

    /// Integrated loudness for custom normalization.
    #[arg(long, allow_hyphen_values = true)]
    lufs_i: Option<f32>,

    /// Loudness range for custom normalization.
    #[arg(long)]
    lufs_lra: Option<f32>,

    /// True peak for custom normalization.
    #[arg(long, allow_hyphen_values = true)]
    lufs_tp: Option<f32>,

    /// Apply dynamic range compression.
    #[arg(long)]
    compress: bool,

    /// Keep the downloaded stream as is.
    #[arg(long)]
    no_extract: bool,

    /// Skip embedding tags and cover art.
    #[arg(long)]
    no_metadata: bool,

    /// Save the cover art next to the track.
    #[arg(long)]
    write_thumbnail: bool,

    /// Keep the source file after conversion.
    #[arg(long)]
    keep_original: bool,
}

impl AudioArgs {
    fn resolve(&self) -> Result<AudioOptions> {
        let mut options = match &self.options {
            Some(path) => load_audio_options(path)?,
            None => AudioOptions::default(),
        };
        if let Some(codec) = self.codec {
            options.codec = codec;
        }
        if let Some(bitrate) = self.bitrate {
            options.bitrate = bitrate;
        }
        if let Some(bit_depth) = self.bit_depth {
            options.bit_depth = bit_depth;
        }
        if let Some(sample_rate) = self.sample_rate {
            options.sample_rate = sample_rate;
        }
        if let Some(channels) = self.channels {
            options.channels = channels;
        }
        if let Some(normalization) = self.normalize {
            options.normalization = normalization;
        }
        if let Normalization::Custom(target) = &mut options.normalization {
            apply_custom_target(target, self.lufs_i, self.lufs_lra, self.lufs_tp);
        }
        options.dynamic_compression |= self.compress;
        options.extract_audio &= !self.no_extract;
        options.metadata &= !self.no_metadata;
        options.write_thumbnail |= self.write_thumbnail;
        options.keep_original |= self.keep_original;
        Ok(options)
    }
}

fn apply_custom_target(
    target: &mut LoudnessTarget,
    i: Option<f32>,
    lra: Option<f32>,
    tp: Option<f32>,
) {
    if let Some(i) = i {
        target.i = i;
    }
    if let Some(lra) = lra {
        target.lra = lra;
    }
    if let Some(tp) = tp {
        target.tp = tp;
    }
}

fn parse_bitrate(value: &str) -> std::result::Result<Bitrate, String> {
    let kbps = value
        .trim()
        .trim_end_matches(['k', 'K'])
        .parse::<u16>()
        .map_err(|err| format!("invalid bitrate {value}: {err}"))?;
    Bitrate::try_from(kbps)
}

fn parse_bit_depth(value: &str) -> std::result::Result<BitDepth, String> {
    let bits = value
        .trim()
        .parse::<u16>()
        .map_err(|err| format!("invalid bit depth {value}: {err}"))?;
    BitDepth::try_from(bits)
}

fn parse_sample_rate(value: &str) -> std::result::Result<SampleRate, String> {
    let hz = value
        .trim()
        .parse::<u32>()
        .map_err(|err| format!("invalid sample rate {value}: {err}"))?;
    SampleRate::try_from(hz)
}

/// Keyboard commands accepted on stdin while a batch runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlCommand {
    Pause,
    Resume,
    Cancel,
}

fn parse_control_line(line: &str) -> Option<ControlCommand> {
    match line.trim().to_ascii_lowercase().as_str() {
        "p" | "pause" => Some(ControlCommand::Pause),
        "r" | "resume" => Some(ControlCommand::Resume),
        "c" | "cancel" | "q" => Some(ControlCommand::Cancel),
        _ => None,
    }
}

/// URLs from the command line followed by those listed in `--input`.
fn collect_urls(urls: &[String], input: Option<&Path>) -> Result<Vec<String>> {
    let mut all = urls.to_vec();
    if let Some(path) = input {
        let raw =
            fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
        all.extend(
            raw.lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(str::to_string),
        );
    }
    Ok(all)
}

/// Reads control commands from stdin on a plain thread; the thread simply
/// ends when stdin closes.
fn spawn_stdin_control(control: BatchControl) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines().map_while(|line| line.ok()) {
            match parse_control_line(&line) {
                Some(ControlCommand::Pause) => control.pause(),
                Some(ControlCommand::Resume) => control.resume(),
                Some(ControlCommand::Cancel) => control.cancel(),
                None => eprintln!("Unknown command {:?} (use p, r or c)", line.trim()),
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    logging::init(cli.verbose)?;

    match cli.command {
        Command::Songs(args) => run_batch(args, false).await,
        Command::Playlist(args) => run_batch(args, true).await,
        Command::Search(args) => run_search(args).await,
    }
}

fn backend_for(settings: &tunr_tools::config::RuntimeSettings) -> YtDlpBackend {
    let backend = YtDlpBackend::new(&settings.yt_dlp);
    match &settings.cookies {
        Some(cookies) => backend.with_cookies(cookies),
        None => backend,
    }
}

async fn run_batch(args: DownloadArgs, expand_playlists: bool) -> Result<ExitCode> {
    let settings = resolve_settings(args.settings.overrides())?;
    let audio = args.audio.resolve()?;
    let urls = collect_urls(&args.urls, args.input.as_deref())?;

    let backend = backend_for(&settings);
    let version = backend.ensure_available()?;
    tracing::debug!(%version, "yt-dlp available");

    let config = BatchConfig::new(&settings.music_root)
        .with_audio(audio)
        .with_pool_size(settings.threads);

    let (events_tx, mut events) = unbounded_channel();
    let controller = BatchController::new(Arc::new(backend)).with_events(events_tx);
    let prepared = match controller.prepare(urls, expand_playlists, config).await {
        Ok(prepared) => prepared,
        Err(err) => {
            eprintln!("Error: {err}");
            let code = if err.is_input() {
                EXIT_BAD_INPUT
            } else {
                EXIT_FAILURES
            };
            return Ok(ExitCode::from(code));
        }
    };
    drop(controller);

    println!("===================================");
    println!("tunr batch download");
    println!("===================================");
    if let Some(title) = prepared.collection_title() {
        println!("Playlist: {title}");
    }
    println!("Tracks: {}", prepared.total());
    println!("Output: {}", prepared.output_dir().display());
    if std::io::stdin().is_terminal() {
        println!("Type p + Enter to pause, r to resume, c to cancel.");
    }
    println!();

    let control = prepared.control();
    spawn_stdin_control(control.clone());
    {
        let control = control.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!();
                eprintln!("Cancelling...");
                control.cancel();
            }
        });
    }

    let progress = args.progress_file.as_ref().map(ProgressWriter::new);
    let handle = prepared.launch();

    let mut last_status = String::new();
    while let Some(event) = events.recv().await {
        match event {
            BatchEvent::Started { total } => {
                tracing::debug!(total, "batch started");
            }
            BatchEvent::Progress(snapshot) => {
                let status = control.status_text();
                if let Some(writer) = &progress {
                    writer.write(&snapshot, &status);
                }
                if status != last_status {
                    println!("{status}");
                    last_status = status;
                }
            }
            BatchEvent::Finished(_) => break,
        }
    }

    let report = handle.wait().await;
    if let Some(writer) = &progress {
        writer.write(&control.snapshot(), &control.status_text());
    }
    if let Some(path) = &args.report {
        write_batch_report(path, &report)?;
    }

    println!();
    let code = match &report.outcome {
        BatchOutcome::AllSucceeded => {
            println!("Done: {} of {} tracks downloaded.", report.completed, report.total);
            ExitCode::SUCCESS
        }
        BatchOutcome::PartialFailure(failures) => {
            println!(
                "Finished with errors: {} of {} tracks failed.",
                failures.len(),
                report.total
            );
            for failure in failures {
                println!("  - {}: {}", failure.label, failure.reason);
            }
            ExitCode::from(EXIT_FAILURES)
        }
        BatchOutcome::Cancelled => {
            println!(
                "Cancelled after {} of {} tracks. Finished files were kept.",
                report.completed, report.total
            );
            ExitCode::from(EXIT_CANCELLED)
        }
        BatchOutcome::HardError(message) => {
            eprintln!("Error: {message}");
            ExitCode::from(EXIT_FAILURES)
        }
    };
    Ok(code)
}

async fn run_search(args: SearchArgs) -> Result<ExitCode> {
    let settings = resolve_settings(args.settings.overrides())?;
    let backend = backend_for(&settings);
    backend.ensure_available()?;

    let query = args.query.join(" ");
    let limit = args.limit;
    let hits = tokio::task::spawn_blocking(move || backend.search(&query, limit))
        .await
        .context("search task stopped")??;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&hits)?);
        return Ok(ExitCode::SUCCESS);
    }
    if hits.is_empty() {
        println!("No results.");
    }
    for (index, hit) in hits.iter().enumerate() {
        let kind = if hit.is_collection { "playlist" } else { "track" };
        println!("{:>2}. [{kind}] {}", index + 1, hit.title);
        println!("    {}", hit.url);
    }
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn download_args(argv: &[&str]) -> DownloadArgs {
        let cli = Cli::try_parse_from(argv).unwrap();
        match cli.command {
            Command::Songs(args) | Command::Playlist(args) => args,
            Command::Search(_) => panic!("expected a download command"),
        }
    }

    #[test]
    fn songs_command_collects_urls_and_settings() {
        let args = download_args(&[
            "tunr",
            "songs",
            "https://x/watch?v=a",
            "https://x/watch?v=b",
            "--threads",
            "2",
            "--music-root",
            "/srv/music",
        ]);
        assert_eq!(args.urls.len(), 2);
        let overrides = args.settings.overrides();
        assert_eq!(overrides.threads, Some(2));
        assert_eq!(overrides.music_root, Some(PathBuf::from("/srv/music")));
    }

    #[test]
    fn audio_flags_override_defaults() {
        let args = download_args(&[
            "tunr",
            "playlist",
            "https://x/list",
            "--codec",
            "FLAC",
            "--bit-depth",
            "24",
            "--sample-rate",
            "48000",
            "--channels",
            "mono",
            "--compress",
            "--no-metadata",
        ]);
        let options = args.audio.resolve().unwrap();
        assert_eq!(options.codec, Codec::Flac);
        assert_eq!(options.bit_depth, BitDepth::TwentyFour);
        assert_eq!(options.sample_rate.hz(), 48_000);
        assert_eq!(options.channels, ChannelLayout::Mono);
        assert!(options.dynamic_compression);
        assert!(!options.metadata);
        assert!(options.extract_audio);
    }

    #[test]
    fn unsupported_values_are_rejected_by_the_parser() {
        assert!(Cli::try_parse_from(["tunr", "songs", "--bitrate", "100"]).is_err());
        assert!(Cli::try_parse_from(["tunr", "songs", "--codec", "ogg"]).is_err());
        assert!(Cli::try_parse_from(["tunr", "songs", "--sample-rate", "22050"]).is_err());
        assert!(Cli::try_parse_from(["tunr", "songs", "--bitrate", "320k"]).is_ok());
    }

    #[test]
    fn custom_loudness_takes_flag_values() {
        let args = download_args(&[
            "tunr",
            "songs",
            "--normalize",
            "custom",
            "--lufs-i",
            "-16",
            "--lufs-tp",
            "-1",
        ]);
        let options = args.audio.resolve().unwrap();
        assert_eq!(
            options.normalization,
            Normalization::Custom(LoudnessTarget {
                i: -16.0,
                lra: 11.0,
                tp: -1.0,
            })
        );
    }

    #[test]
    fn preset_file_is_applied_before_flags() {
        let mut preset = NamedTempFile::new().unwrap();
        write!(preset, "codec = \"opus\"\nbitrate = 96\nkeep_original = true\n").unwrap();
        let path = preset.path().to_string_lossy().to_string();
        let args = download_args(&["tunr", "songs", "--options", &path, "--bitrate", "128"]);
        let options = args.audio.resolve().unwrap();
        assert_eq!(options.codec, Codec::Opus);
        assert_eq!(options.bitrate.kbps(), 128);
        assert!(options.keep_original);
    }

    #[test]
    fn input_file_extends_url_list() {
        let mut list = NamedTempFile::new().unwrap();
        write!(list, "# favourites\nhttps://x/watch?v=b\n\n  https://x/watch?v=c  \n").unwrap();
        let urls = collect_urls(&["https://x/watch?v=a".to_string()], Some(list.path())).unwrap();
        assert_eq!(
            urls,
            vec!["https://x/watch?v=a", "https://x/watch?v=b", "https://x/watch?v=c"]
        );
    }

    #[test]
    fn control_lines_map_to_commands() {
        assert_eq!(parse_control_line("p\n"), Some(ControlCommand::Pause));
        assert_eq!(parse_control_line(" R "), Some(ControlCommand::Resume));
        assert_eq!(parse_control_line("cancel"), Some(ControlCommand::Cancel));
        assert_eq!(parse_control_line("x"), None);
    }

    #[test]
    fn search_joins_query_words() {
        let cli = Cli::try_parse_from(["tunr", "search", "lofi", "beats", "--limit", "3"]).unwrap();
        match cli.command {
            Command::Search(args) => {
                assert_eq!(args.query.join(" "), "lofi beats");
                assert_eq!(args.limit, 3);
            }
            _ => panic!("expected search"),
        }
    }
}
