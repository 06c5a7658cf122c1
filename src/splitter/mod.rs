//! Media splitting boundary.
//!
//! A [`MediaSplitter`] partitions a source file into self-contained audio segments of
//! bounded byte size. Splitting is all-or-nothing: on error no segment files are left
//! behind.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub mod ffmpeg;

pub use ffmpeg::FfmpegSplitter;

/// Fraction of the byte budget actually planned for; the rest absorbs container and
/// encoder overhead.
const SIZE_SAFETY_FACTOR: f64 = 0.9;

/// Audio encoding of produced segments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// 64 kbit/s mono MP3 at 16 kHz
    #[default]
    Mp3,
    /// 16-bit PCM mono WAV at 16 kHz
    Wav,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Mp3 => "mp3",
            OutputFormat::Wav => "wav",
        }
    }

    /// Nominal encoded size of one second of audio
    pub fn bytes_per_second(self) -> u64 {
        match self {
            OutputFormat::Mp3 => 64_000 / 8,
            OutputFormat::Wav => 16_000 * 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitOptions {
    /// Upper bound on each segment's size in bytes
    pub target_chunk_bytes: u64,
    pub output_format: OutputFormat,
}

/// Result of a successful split
#[derive(Debug, Clone, PartialEq)]
pub struct SplitOutput {
    /// Segment files, in temporal order
    pub chunk_paths: Vec<PathBuf>,
    pub chunk_count: usize,
    pub total_duration_secs: f64,
    pub chunk_duration_secs: f64,
}

#[derive(Error, Debug)]
pub enum SplitError {
    /// Required tooling is missing
    #[error("Media splitter unavailable: {0}")]
    Unavailable(String),

    #[error("Input file not found: {0}")]
    InputNotFound(PathBuf),

    #[error("Invalid split options: {0}")]
    InvalidOptions(String),

    #[error("Failed to probe media: {0}")]
    Probe(String),

    #[error("Media has no audio duration")]
    EmptyMedia,

    #[error("Failed to render segment {index}: {message}")]
    Segment { index: usize, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Splits media into bounded-size audio segments
#[async_trait]
pub trait MediaSplitter: Send + Sync {
    /// Whether the splitter can run at all (e.g. external tools installed)
    fn is_available(&self) -> bool;

    /// Split `input` into ordered segments
    async fn split(&self, input: &Path, options: &SplitOptions) -> Result<SplitOutput, SplitError>;
}

/// Segment layout for a file of `total_duration_secs`.
///
/// Returns `(segment_count, segment_duration_secs)`. Segments are equal length and each
/// is planned to stay under `target_chunk_bytes` once encoded as `format`.
pub fn plan_segments(
    total_duration_secs: f64,
    target_chunk_bytes: u64,
    format: OutputFormat,
) -> Result<(usize, f64), SplitError> {
    if !total_duration_secs.is_finite() || total_duration_secs <= 0.0 {
        return Err(SplitError::EmptyMedia);
    }

    let usable_bytes = target_chunk_bytes as f64 * SIZE_SAFETY_FACTOR;
    let max_segment_secs = usable_bytes / format.bytes_per_second() as f64;
    if max_segment_secs < 1.0 {
        return Err(SplitError::InvalidOptions(format!(
            "target chunk size of {} bytes is too small for {:?} output",
            target_chunk_bytes, format
        )));
    }

    let count = (total_duration_secs / max_segment_secs).ceil().max(1.0) as usize;
    Ok((count, total_duration_secs / count as f64))
}
