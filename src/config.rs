#![forbid(unsafe_code)]

use crate::options::{AudioOptions, DEFAULT_POOL_SIZE, clamp_pool_size};
use crate::ytdlp::DEFAULT_PROGRAM;
use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_MUSIC_ROOT: &str = "Music";

pub const MUSIC_ROOT_KEY: &str = "TUNR_MUSIC_ROOT";
pub const THREADS_KEY: &str = "TUNR_THREADS";
pub const YT_DLP_KEY: &str = "TUNR_YT_DLP";
pub const COOKIES_KEY: &str = "TUNR_COOKIES";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeSettings {
    pub music_root: PathBuf,
    pub threads: usize,
    pub yt_dlp: PathBuf,
    pub cookies: Option<PathBuf>,
}

/// Values given on the command line. They win over the environment and the
/// `.env` file.
#[derive(Debug, Clone, Default)]
pub struct SettingsOverrides {
    pub music_root: Option<PathBuf>,
    pub threads: Option<usize>,
    pub yt_dlp: Option<PathBuf>,
    pub cookies: Option<PathBuf>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_settings(overrides: SettingsOverrides) -> Result<RuntimeSettings> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    Ok(build_settings(&file_vars, env_var_string, overrides))
}

fn build_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: SettingsOverrides,
) -> RuntimeSettings {
    let music_root = overrides
        .music_root
        .filter(|path| !path.as_os_str().is_empty())
        .or_else(|| lookup_value(MUSIC_ROOT_KEY, file_vars, &env_lookup).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_MUSIC_ROOT));
    let threads = overrides
        .threads
        .or_else(|| {
            lookup_value(THREADS_KEY, file_vars, &env_lookup)
                .and_then(|value| value.parse::<usize>().ok())
        })
        .map(clamp_pool_size)
        .unwrap_or(DEFAULT_POOL_SIZE);
    let yt_dlp = overrides
        .yt_dlp
        .filter(|path| !path.as_os_str().is_empty())
        .or_else(|| lookup_value(YT_DLP_KEY, file_vars, &env_lookup).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_PROGRAM));
    let cookies = overrides
        .cookies
        .or_else(|| lookup_value(COOKIES_KEY, file_vars, &env_lookup).map(PathBuf::from));

    RuntimeSettings {
        music_root,
        threads,
        yt_dlp,
        cookies,
    }
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key)
        .or_else(|| file_vars.get(key).cloned())
        .filter(|value| !value.trim().is_empty())
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}

/// Reads an audio preset. Every field is optional and falls back to the
/// first-launch defaults; out-of-range values are rejected.
pub fn load_audio_options(path: &Path) -> Result<AudioOptions> {
    let raw = fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("Parsing audio options in {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{Bitrate, ChannelLayout, Codec, Normalization};
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn make_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    fn settings_from(contents: &str) -> RuntimeSettings {
        let cfg = make_config(contents);
        let vars = read_env_file(cfg.path()).unwrap();
        build_settings(&vars, |_| None, SettingsOverrides::default())
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let settings = settings_from("");
        assert_eq!(settings.music_root, PathBuf::from(DEFAULT_MUSIC_ROOT));
        assert_eq!(settings.threads, DEFAULT_POOL_SIZE);
        assert_eq!(settings.yt_dlp, PathBuf::from("yt-dlp"));
        assert_eq!(settings.cookies, None);
    }

    #[test]
    fn env_file_values_are_used() {
        let settings = settings_from(
            "TUNR_MUSIC_ROOT=\"/srv/music\"\nTUNR_THREADS=6\nTUNR_YT_DLP='/opt/yt-dlp'\n",
        );
        assert_eq!(settings.music_root, PathBuf::from("/srv/music"));
        assert_eq!(settings.threads, 6);
        assert_eq!(settings.yt_dlp, PathBuf::from("/opt/yt-dlp"));
    }

    #[test]
    fn thread_count_is_clamped_or_defaulted() {
        assert_eq!(settings_from("TUNR_THREADS=64\n").threads, 8);
        assert_eq!(settings_from("TUNR_THREADS=0\n").threads, 1);
        assert_eq!(settings_from("TUNR_THREADS=lots\n").threads, DEFAULT_POOL_SIZE);
    }

    #[test]
    fn blank_values_count_as_unset() {
        let settings = settings_from("TUNR_MUSIC_ROOT=\"  \"\n");
        assert_eq!(settings.music_root, PathBuf::from(DEFAULT_MUSIC_ROOT));
    }

    #[test]
    fn env_wins_over_file_and_overrides_win_over_env() {
        let vars = read_env_file(
            make_config("TUNR_MUSIC_ROOT=/file\nTUNR_THREADS=2\nTUNR_YT_DLP=/file/yt-dlp\n")
                .path(),
        )
        .unwrap();
        let env = |key: &str| match key {
            MUSIC_ROOT_KEY => Some("/env".to_string()),
            THREADS_KEY => Some("3".to_string()),
            _ => None,
        };

        let settings = build_settings(&vars, env, SettingsOverrides::default());
        assert_eq!(settings.music_root, PathBuf::from("/env"));
        assert_eq!(settings.threads, 3);
        assert_eq!(settings.yt_dlp, PathBuf::from("/file/yt-dlp"));

        let settings = build_settings(
            &vars,
            env,
            SettingsOverrides {
                music_root: Some(PathBuf::from("/cli")),
                threads: Some(12),
                ..SettingsOverrides::default()
            },
        );
        assert_eq!(settings.music_root, PathBuf::from("/cli"));
        assert_eq!(settings.threads, 8);
    }

    #[test]
    fn read_env_file_handles_export_and_quotes() {
        let cfg = make_config(
            r#"
            export TUNR_MUSIC_ROOT="/media"
            TUNR_YT_DLP='/bin/yt-dlp'
            TUNR_THREADS =  "5"
            # comment
            INVALID_LINE
            "#,
        );
        let vars = read_env_file(cfg.path()).unwrap();
        assert_eq!(vars.get("TUNR_MUSIC_ROOT").unwrap(), "/media");
        assert_eq!(vars.get("TUNR_YT_DLP").unwrap(), "/bin/yt-dlp");
        assert_eq!(vars.get("TUNR_THREADS").unwrap(), "5");
        assert!(!vars.contains_key("INVALID_LINE"));
    }

    #[test]
    fn read_env_file_missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let vars = read_env_file(&dir.path().join("missing.env")).unwrap();
        assert!(vars.is_empty());
    }

    #[test]
    fn resolve_settings_reads_given_env_file() {
        let cfg = make_config("TUNR_COOKIES=/tmp/cookies.txt\n");
        let settings = resolve_settings(SettingsOverrides {
            env_path: Some(cfg.path().to_path_buf()),
            music_root: Some(PathBuf::from("/cli")),
            ..SettingsOverrides::default()
        })
        .unwrap();
        assert_eq!(settings.music_root, PathBuf::from("/cli"));
        if env::var_os(COOKIES_KEY).is_none() {
            assert_eq!(settings.cookies, Some(PathBuf::from("/tmp/cookies.txt")));
        }
    }

    #[test]
    fn audio_options_load_from_toml() {
        let cfg = make_config(
            r#"
            codec = "opus"
            bitrate = 128
            channels = "mono"
            normalization = "lufs_14"
            dynamic_compression = true
            "#,
        );
        let options = load_audio_options(cfg.path()).unwrap();
        assert_eq!(options.codec, Codec::Opus);
        assert_eq!(options.bitrate, Bitrate::try_from(128u16).unwrap());
        assert_eq!(options.channels, ChannelLayout::Mono);
        assert_eq!(options.normalization, Normalization::Lufs14);
        assert!(options.dynamic_compression);
        assert!(options.extract_audio);
    }

    #[test]
    fn audio_options_reject_unsupported_values() {
        let cfg = make_config("bitrate = 100\n");
        assert!(load_audio_options(cfg.path()).is_err());
        let cfg = make_config("codec = \"ogg\"\n");
        assert!(load_audio_options(cfg.path()).is_err());
    }
}
