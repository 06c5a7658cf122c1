//! Segment transcription boundary.
//!
//! A [`SegmentTranscriber`] turns one bounded-size audio file into text. Failures are
//! classified so the retry policy can back off harder on rate limiting.

use async_trait::async_trait;
use std::path::Path;
use thiserror::Error;

use crate::protocol::TranscriptionOptions;

pub mod http;

pub use http::{HttpTranscriber, HttpTranscriberConfig};

/// Lower-cased substrings that identify rate-limit or capacity pushback
const RATE_LIMIT_SIGNALS: &[&str] = &[
    "rate limit",
    "rate_limit",
    "ratelimit",
    "429",
    "too many requests",
    "quota",
    "capacity",
    "overloaded",
];

/// Errors returned by a segment transcriber
#[derive(Debug, Clone, Error)]
pub enum TranscribeError {
    /// Upstream signalled rate limiting (HTTP 429 or equivalent)
    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    /// Upstream returned a non-success status
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Transport-level failure
    #[error("Request failed: {0}")]
    Request(String),

    /// Segment exceeds the upstream per-request ceiling
    #[error("Segment is {size} bytes, over the {limit} byte limit")]
    TooLarge { size: u64, limit: u64 },

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Empty transcription response")]
    EmptyResponse,

    #[error("Transcription failed: {0}")]
    Other(String),
}

impl TranscribeError {
    /// Whether this failure looks like rate limiting or capacity pushback.
    ///
    /// Besides the explicit [`TranscribeError::RateLimited`] variant, any error whose
    /// message carries a known signal counts (some providers report 429s as 5xx bodies).
    /// URLs inside the message are ignored.
    pub fn is_rate_limited(&self) -> bool {
        let message = match self {
            TranscribeError::RateLimited(_) => return true,
            TranscribeError::Api { status: 429, .. } => return true,
            TranscribeError::TooLarge { .. } | TranscribeError::EmptyResponse => return false,
            TranscribeError::Api { message, .. } => message,
            TranscribeError::Request(message)
            | TranscribeError::Io(message)
            | TranscribeError::Other(message) => message,
        };

        let text = message
            .split_whitespace()
            .filter(|word| !word.contains("://"))
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();
        RATE_LIMIT_SIGNALS.iter().any(|signal| text.contains(signal))
    }
}

impl From<std::io::Error> for TranscribeError {
    fn from(e: std::io::Error) -> Self {
        TranscribeError::Io(e.to_string())
    }
}

/// Transcribes a single audio segment
#[async_trait]
pub trait SegmentTranscriber: Send + Sync {
    /// Transcribe the audio file at `segment` and return its text.
    async fn transcribe(
        &self,
        segment: &Path,
        options: &TranscriptionOptions,
    ) -> Result<String, TranscribeError>;
}
