//! Chunked Transcriber - transcription of media larger than an API upload limit
//!
//! Large audio or video files are split into bounded-size segments, each segment is
//! transcribed through a rate-limited speech-to-text API, and the results are merged
//! back in source order. It features:
//!
//! - Sled-backed job store with MessagePack records that survives restarts
//! - Bounded-concurrency batches with per-chunk retry and rate-limit aware backoff
//! - Background job workflow that always records an outcome and removes its temp files
//! - Retention sweep evicting finished jobs
//!
//! # Example
//!
//! ```no_run
//! use chunked_transcriber::{
//!     ChunkedTranscriptionService, FfmpegSplitter, HttpTranscriber, HttpTranscriberConfig,
//!     JobStore, ServiceConfig, TranscriptionOptions,
//! };
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(JobStore::open("/tmp/chunked-transcriber/jobs")?);
//!     let splitter = Arc::new(FfmpegSplitter::new("/tmp/chunked-transcriber/work"));
//!     let transcriber = Arc::new(HttpTranscriber::new(HttpTranscriberConfig::default())?);
//!
//!     let service =
//!         ChunkedTranscriptionService::new(splitter, transcriber, store, ServiceConfig::default());
//!
//!     let started = service
//!         .start_job(Path::new("lecture.mp4"), "lecture.mp4", TranscriptionOptions::default())
//!         .await?;
//!     println!("job {} has {} chunks", started.job_id, started.total_chunks);
//!
//!     // Poll until the job is terminal
//!     let status = service.get_status(&started.job_id)?;
//!     println!("{:?}", status);
//!     Ok(())
//! }
//! ```

pub mod orchestrator;
pub mod protocol;
pub mod retry;
pub mod splitter;
pub mod store;
pub mod transcriber;

// Re-export commonly used types for convenience
pub use orchestrator::{ChunkedTranscriptionService, JobRequest, ServiceConfig};
pub use protocol::{JobState, JobStatus, StartedJob, TranscriptionOptions};
pub use retry::{ChunkError, RetryPolicy};
pub use splitter::{FfmpegSplitter, MediaSplitter, OutputFormat, SplitError};
pub use store::{JobStore, RetentionSweeper, StoreError};
pub use transcriber::{HttpTranscriber, HttpTranscriberConfig, SegmentTranscriber, TranscribeError};

use thiserror::Error;

/// Errors surfaced synchronously by the transcription service
#[derive(Error, Debug)]
pub enum Error {
    /// Splitting tools are missing; no job was created
    #[error("Media splitter unavailable: {0}")]
    SplitterUnavailable(String),

    /// The input could not be split; no job was created
    #[error("Split failed: {0}")]
    Split(#[from] SplitError),

    /// Job store operation failed
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Result type alias for service operations
pub type Result<T> = std::result::Result<T, Error>;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Segment byte budget, kept safely under the 25 MiB upload ceiling
pub const DEFAULT_TARGET_CHUNK_BYTES: u64 = 20 * 1024 * 1024;

/// Default on-disk locations
pub const DEFAULT_STORE_PATH: &str = "/tmp/chunked-transcriber/jobs";
pub const DEFAULT_WORK_DIR: &str = "/tmp/chunked-transcriber/work";
