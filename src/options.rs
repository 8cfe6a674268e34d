#![forbid(unsafe_code)]

//! Codec and quality settings that shape every job of a batch.
//!
//! All types deserialize from the TOML presets read by
//! [`crate::config::load_audio_options`]; missing fields fall back to the
//! same defaults the interactive application starts with.

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

pub const DEFAULT_POOL_SIZE: usize = 4;
pub const MIN_POOL_SIZE: usize = 1;
pub const MAX_POOL_SIZE: usize = 8;

pub const BITRATES_KBPS: [u16; 9] = [32, 48, 64, 96, 128, 160, 192, 256, 320];
pub const SAMPLE_RATES_HZ: [u32; 4] = [44_100, 48_000, 96_000, 192_000];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    #[default]
    Mp3,
    Aac,
    Opus,
    Flac,
    Wav,
    Alac,
}

impl Codec {
    pub const ALL: [Codec; 6] = [
        Codec::Mp3,
        Codec::Aac,
        Codec::Opus,
        Codec::Flac,
        Codec::Wav,
        Codec::Alac,
    ];

    /// Name understood by the extraction backend.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mp3 => "mp3",
            Self::Aac => "aac",
            Self::Opus => "opus",
            Self::Flac => "flac",
            Self::Wav => "wav",
            Self::Alac => "alac",
        }
    }

    /// Lossy codecs take a bitrate; lossless ones take bit depth and sample rate.
    pub fn is_lossy(self) -> bool {
        matches!(self, Self::Mp3 | Self::Aac | Self::Opus)
    }

    /// File extension of the extracted audio.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Aac | Self::Alac => "m4a",
            other => other.as_str(),
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        let wanted = value.trim().to_ascii_lowercase();
        match Self::ALL.iter().find(|codec| codec.as_str() == wanted) {
            Some(codec) => Ok(*codec),
            None => bail!("unknown codec: {value}"),
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Target bitrate in kbps, restricted to the values the encoder presets offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct Bitrate(u16);

impl Bitrate {
    pub fn kbps(self) -> u16 {
        self.0
    }
}

impl Default for Bitrate {
    fn default() -> Self {
        Self(192)
    }
}

impl TryFrom<u16> for Bitrate {
    type Error = String;

    fn try_from(value: u16) -> std::result::Result<Self, Self::Error> {
        if BITRATES_KBPS.contains(&value) {
            Ok(Self(value))
        } else {
            Err(format!("unsupported bitrate: {value} kbps"))
        }
    }
}

impl From<Bitrate> for u16 {
    fn from(value: Bitrate) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum BitDepth {
    #[default]
    Sixteen,
    TwentyFour,
    ThirtyTwo,
}

impl BitDepth {
    pub fn bits(self) -> u16 {
        match self {
            Self::Sixteen => 16,
            Self::TwentyFour => 24,
            Self::ThirtyTwo => 32,
        }
    }
}

impl TryFrom<u16> for BitDepth {
    type Error = String;

    fn try_from(value: u16) -> std::result::Result<Self, Self::Error> {
        match value {
            16 => Ok(Self::Sixteen),
            24 => Ok(Self::TwentyFour),
            32 => Ok(Self::ThirtyTwo),
            _ => Err(format!("unsupported bit depth: {value}")),
        }
    }
}

impl From<BitDepth> for u16 {
    fn from(value: BitDepth) -> Self {
        value.bits()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct SampleRate(u32);

impl SampleRate {
    pub fn hz(self) -> u32 {
        self.0
    }
}

impl Default for SampleRate {
    fn default() -> Self {
        Self(44_100)
    }
}

impl TryFrom<u32> for SampleRate {
    type Error = String;

    fn try_from(value: u32) -> std::result::Result<Self, Self::Error> {
        if SAMPLE_RATES_HZ.contains(&value) {
            Ok(Self(value))
        } else {
            Err(format!("unsupported sample rate: {value} Hz"))
        }
    }
}

impl From<SampleRate> for u32 {
    fn from(value: SampleRate) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelLayout {
    #[default]
    Stereo,
    Mono,
    Multichannel,
}

impl ChannelLayout {
    /// Channel count to force, `None` when the source layout is kept.
    pub fn forced_channels(self) -> Option<u8> {
        match self {
            Self::Stereo => None,
            Self::Mono => Some(1),
            Self::Multichannel => Some(6),
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "stereo" => Ok(Self::Stereo),
            "mono" => Ok(Self::Mono),
            "multichannel" | "surround" => Ok(Self::Multichannel),
            _ => bail!("unknown channel layout: {value}"),
        }
    }
}

/// EBU R128 loudness target passed to ffmpeg's `loudnorm` filter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoudnessTarget {
    /// Integrated loudness, LUFS.
    pub i: f32,
    /// Loudness range, LU.
    pub lra: f32,
    /// True peak, dBTP.
    pub tp: f32,
}

impl Default for LoudnessTarget {
    fn default() -> Self {
        Self {
            i: -14.0,
            lra: 11.0,
            tp: -1.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub enum Normalization {
    #[default]
    #[serde(rename = "off")]
    Off,
    /// Streaming platforms preset.
    #[serde(rename = "lufs_14")]
    Lufs14,
    /// EBU broadcast preset.
    #[serde(rename = "lufs_23")]
    Lufs23,
    #[serde(rename = "custom")]
    Custom(LoudnessTarget),
}

impl Normalization {
    pub fn target(self) -> Option<LoudnessTarget> {
        match self {
            Self::Off => None,
            Self::Lufs14 => Some(LoudnessTarget {
                i: -14.0,
                lra: 11.0,
                tp: -1.5,
            }),
            Self::Lufs23 => Some(LoudnessTarget {
                i: -23.0,
                lra: 7.0,
                tp: -2.0,
            }),
            Self::Custom(target) => Some(target),
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "off" => Ok(Self::Off),
            "lufs_14" | "lufs14" => Ok(Self::Lufs14),
            "lufs_23" | "lufs23" => Ok(Self::Lufs23),
            "custom" => Ok(Self::Custom(LoudnessTarget::default())),
            _ => bail!("unknown normalization profile: {value}"),
        }
    }
}

/// Everything that decides how a downloaded track is transcoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioOptions {
    pub codec: Codec,
    pub bitrate: Bitrate,
    pub bit_depth: BitDepth,
    pub sample_rate: SampleRate,
    pub channels: ChannelLayout,
    pub normalization: Normalization,
    pub dynamic_compression: bool,
    pub extract_audio: bool,
    pub metadata: bool,
    pub write_thumbnail: bool,
    pub keep_original: bool,
}

impl Default for AudioOptions {
    fn default() -> Self {
        Self {
            codec: Codec::default(),
            bitrate: Bitrate::default(),
            bit_depth: BitDepth::default(),
            sample_rate: SampleRate::default(),
            channels: ChannelLayout::default(),
            normalization: Normalization::default(),
            dynamic_compression: false,
            extract_audio: true,
            metadata: true,
            write_thumbnail: false,
            keep_original: false,
        }
    }
}

/// Settings frozen for the lifetime of one batch. The controller takes it by
/// value, so edits made by the caller afterwards only affect the next batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchConfig {
    /// Root folder every output path is built under.
    pub music_root: PathBuf,
    pub audio: AudioOptions,
    pub pool_size: usize,
}

impl BatchConfig {
    pub fn new(music_root: impl Into<PathBuf>) -> Self {
        Self {
            music_root: music_root.into(),
            audio: AudioOptions::default(),
            pool_size: DEFAULT_POOL_SIZE,
        }
    }

    pub fn with_audio(mut self, audio: AudioOptions) -> Self {
        self.audio = audio;
        self
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Worker count actually used, clamped to the supported range.
    pub fn effective_pool_size(&self) -> usize {
        clamp_pool_size(self.pool_size)
    }
}

pub fn clamp_pool_size(value: usize) -> usize {
    value.clamp(MIN_POOL_SIZE, MAX_POOL_SIZE)
}
