#![forbid(unsafe_code)]

//! Post-processing stages requested from the backend for each job.
//!
//! The stage list is assembled from a fixed, ordered table of builders. Each
//! builder looks at the frozen [`AudioOptions`] and either contributes one
//! stage or nothing, so the same options always yield the same pipeline.

use crate::options::{AudioOptions, BitDepth, Bitrate, Codec, LoudnessTarget, SampleRate};
use std::path::PathBuf;

/// Format selector handed to the backend: best audio-only stream, falling
/// back to the best muxed one.
pub const AUDIO_FORMAT_SELECTOR: &str = "bestaudio/best";

/// Filter used by the dynamic-range compression toggle.
pub const COMPRESSOR_FILTER: &str = "acompressor=threshold=-21dB:ratio=9:attack=200:release=1000";

#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    ExtractAudio {
        codec: Codec,
        /// Only set for lossy codecs.
        bitrate: Option<Bitrate>,
    },
    EmbedMetadata,
    EmbedThumbnail,
    Loudness(LoudnessTarget),
    Compressor,
    SampleFormat {
        bit_depth: BitDepth,
        sample_rate: SampleRate,
    },
    Channels(u8),
}

impl Stage {
    /// Audio filter contributed to the ffmpeg `-af` chain.
    pub fn audio_filter(&self) -> Option<String> {
        match self {
            Self::Loudness(target) => Some(format!(
                "loudnorm=I={}:TP={}:LRA={}",
                target.i, target.tp, target.lra
            )),
            Self::Compressor => Some(COMPRESSOR_FILTER.to_string()),
            _ => None,
        }
    }

    /// Plain ffmpeg output options (everything that is not a filter).
    pub fn output_args(&self) -> Vec<String> {
        match self {
            Self::SampleFormat {
                bit_depth,
                sample_rate,
            } => {
                let mut args = vec![
                    "-sample_fmt".to_string(),
                    sample_format_name(*bit_depth).to_string(),
                ];
                if *bit_depth == BitDepth::TwentyFour {
                    args.push("-bits_per_raw_sample".to_string());
                    args.push("24".to_string());
                }
                args.push("-ar".to_string());
                args.push(sample_rate.hz().to_string());
                args
            }
            Self::Channels(count) => vec!["-ac".to_string(), count.to_string()],
            _ => Vec::new(),
        }
    }
}

// ffmpeg has no packed 24-bit sample format; 24-bit output is s32 with a
// reduced raw sample width.
fn sample_format_name(depth: BitDepth) -> &'static str {
    match depth {
        BitDepth::Sixteen => "s16",
        BitDepth::TwentyFour | BitDepth::ThirtyTwo => "s32",
    }
}

type StageBuilder = fn(&AudioOptions) -> Option<Stage>;

const STAGE_TABLE: [StageBuilder; 7] = [
    extract_audio,
    embed_metadata,
    embed_thumbnail,
    loudness,
    compressor,
    sample_format,
    channels,
];

fn extract_audio(options: &AudioOptions) -> Option<Stage> {
    Some(Stage::ExtractAudio {
        codec: options.codec,
        bitrate: options.codec.is_lossy().then_some(options.bitrate),
    })
}

fn embed_metadata(options: &AudioOptions) -> Option<Stage> {
    options.metadata.then_some(Stage::EmbedMetadata)
}

fn embed_thumbnail(options: &AudioOptions) -> Option<Stage> {
    options.metadata.then_some(Stage::EmbedThumbnail)
}

fn loudness(options: &AudioOptions) -> Option<Stage> {
    options.normalization.target().map(Stage::Loudness)
}

fn compressor(options: &AudioOptions) -> Option<Stage> {
    options.dynamic_compression.then_some(Stage::Compressor)
}

fn sample_format(options: &AudioOptions) -> Option<Stage> {
    (!options.codec.is_lossy()).then_some(Stage::SampleFormat {
        bit_depth: options.bit_depth,
        sample_rate: options.sample_rate,
    })
}

fn channels(options: &AudioOptions) -> Option<Stage> {
    options.channels.forced_channels().map(Stage::Channels)
}

/// Builds the ordered stage list. Every stage depends on audio extraction, so
/// nothing is requested when extraction is off.
pub fn build_stages(options: &AudioOptions) -> Vec<Stage> {
    if !options.extract_audio {
        return Vec::new();
    }
    STAGE_TABLE
        .iter()
        .filter_map(|builder| builder(options))
        .collect()
}

/// Everything the backend needs to turn one URL into one file.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputSpec {
    /// Output template with `%(title)s` / `%(ext)s` placeholders.
    pub template: PathBuf,
    pub format: String,
    pub stages: Vec<Stage>,
    pub write_thumbnail: bool,
    pub keep_original: bool,
}

impl OutputSpec {
    pub fn new(template: PathBuf, options: &AudioOptions) -> Self {
        let stages = build_stages(options);
        let write_thumbnail =
            options.extract_audio && (options.metadata || options.write_thumbnail);
        Self {
            template,
            format: AUDIO_FORMAT_SELECTOR.to_string(),
            stages,
            write_thumbnail,
            keep_original: options.keep_original,
        }
    }

    pub fn extraction(&self) -> Option<(Codec, Option<Bitrate>)> {
        self.stages.iter().find_map(|stage| match stage {
            Stage::ExtractAudio { codec, bitrate } => Some((*codec, *bitrate)),
            _ => None,
        })
    }

    pub fn has_stage(&self, wanted: &Stage) -> bool {
        self.stages.iter().any(|stage| stage == wanted)
    }

    /// ffmpeg arguments for the extraction step. Filters from several stages
    /// are joined into a single `-af` chain so a later stage cannot replace an
    /// earlier one.
    pub fn ffmpeg_args(&self) -> Vec<String> {
        let filters: Vec<String> = self.stages.iter().filter_map(Stage::audio_filter).collect();
        let mut args = Vec::new();
        if !filters.is_empty() {
            args.push("-af".to_string());
            args.push(filters.join(","));
        }
        for stage in &self.stages {
            args.extend(stage.output_args());
        }
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{ChannelLayout, Normalization};

    fn stage_names(stages: &[Stage]) -> Vec<&'static str> {
        stages
            .iter()
            .map(|stage| match stage {
                Stage::ExtractAudio { .. } => "extract",
                Stage::EmbedMetadata => "metadata",
                Stage::EmbedThumbnail => "thumbnail",
                Stage::Loudness(_) => "loudness",
                Stage::Compressor => "compressor",
                Stage::SampleFormat { .. } => "sample_format",
                Stage::Channels(_) => "channels",
            })
            .collect()
    }

    #[test]
    fn defaults_extract_and_embed() {
        let stages = build_stages(&AudioOptions::default());
        assert_eq!(stage_names(&stages), vec!["extract", "metadata", "thumbnail"]);
        assert_eq!(
            stages[0],
            Stage::ExtractAudio {
                codec: Codec::Mp3,
                bitrate: Some(Bitrate::default()),
            }
        );
    }

    #[test]
    fn every_toggle_composes_in_table_order() {
        let options = AudioOptions {
            codec: Codec::Flac,
            channels: ChannelLayout::Mono,
            normalization: Normalization::Lufs14,
            dynamic_compression: true,
            ..AudioOptions::default()
        };
        let stages = build_stages(&options);
        assert_eq!(
            stage_names(&stages),
            vec![
                "extract",
                "metadata",
                "thumbnail",
                "loudness",
                "compressor",
                "sample_format",
                "channels"
            ]
        );
        assert_eq!(
            stages[0],
            Stage::ExtractAudio {
                codec: Codec::Flac,
                bitrate: None,
            }
        );
    }

    #[test]
    fn nothing_is_requested_without_extraction() {
        let options = AudioOptions {
            extract_audio: false,
            dynamic_compression: true,
            keep_original: true,
            ..AudioOptions::default()
        };
        let spec = OutputSpec::new(PathBuf::from("/m/%(title)s.%(ext)s"), &options);
        assert!(spec.stages.is_empty());
        assert!(!spec.write_thumbnail);
        assert!(spec.keep_original);
        assert!(spec.ffmpeg_args().is_empty());
    }

    #[test]
    fn filters_join_into_one_chain() {
        let options = AudioOptions {
            codec: Codec::Wav,
            bit_depth: BitDepth::TwentyFour,
            sample_rate: SampleRate::try_from(48_000).unwrap(),
            channels: ChannelLayout::Multichannel,
            normalization: Normalization::Lufs23,
            dynamic_compression: true,
            metadata: false,
            ..AudioOptions::default()
        };
        let spec = OutputSpec::new(PathBuf::from("/m/%(title)s.%(ext)s"), &options);
        assert_eq!(
            spec.ffmpeg_args(),
            vec![
                "-af",
                "loudnorm=I=-23:TP=-2:LRA=7,acompressor=threshold=-21dB:ratio=9:attack=200:release=1000",
                "-sample_fmt",
                "s32",
                "-bits_per_raw_sample",
                "24",
                "-ar",
                "48000",
                "-ac",
                "6",
            ]
        );
    }

    #[test]
    fn thumbnail_writing_follows_toggles() {
        let only_thumbnail = AudioOptions {
            metadata: false,
            write_thumbnail: true,
            ..AudioOptions::default()
        };
        let spec = OutputSpec::new(PathBuf::from("t"), &only_thumbnail);
        assert!(spec.write_thumbnail);
        assert!(!spec.has_stage(&Stage::EmbedThumbnail));

        let neither = AudioOptions {
            metadata: false,
            ..AudioOptions::default()
        };
        assert!(!OutputSpec::new(PathBuf::from("t"), &neither).write_thumbnail);
    }

    #[test]
    fn custom_loudness_is_formatted() {
        let stage = Stage::Loudness(LoudnessTarget {
            i: -16.0,
            lra: 9.5,
            tp: -1.0,
        });
        assert_eq!(
            stage.audio_filter().as_deref(),
            Some("loudnorm=I=-16:TP=-1:LRA=9.5")
        );
    }
}
