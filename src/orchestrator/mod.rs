//! Job orchestration.
//!
//! [`ChunkedTranscriptionService`] splits a media file, registers a job and drives the
//! chunk transcriptions in a detached task. Callers poll [`ChunkedTranscriptionService::get_status`]
//! for the outcome.

use futures::future::join_all;
use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::protocol::{generate_job_id, ChunkResult, JobStatus, StartedJob, TranscriptionOptions};
use crate::retry::{transcribe_with_retry, ChunkError, RetryPolicy};
use crate::splitter::{MediaSplitter, OutputFormat, SplitError, SplitOptions};
use crate::store::{JobStore, RetentionSweeper, StoreError};
use crate::transcriber::SegmentTranscriber;
use crate::{Error, Result, DEFAULT_TARGET_CHUNK_BYTES};

pub mod merge;

pub use merge::merge_transcripts;

/// Called after every batch with `(completed_chunks, total_chunks)`
pub type ProgressCallback = Arc<dyn Fn(usize, usize) + Send + Sync>;

/// Configuration for the transcription service
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Byte budget handed to the splitter for each segment
    pub target_chunk_bytes: u64,
    /// Encoding of produced segments
    pub output_format: OutputFormat,
    /// Chunks transcribed concurrently within one batch
    pub max_concurrency: usize,
    /// Per-chunk retry budget
    pub retry: RetryPolicy,
    /// Age after which finished jobs are evicted
    pub retention: Duration,
    /// How often the retention sweep runs
    pub sweep_interval: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            target_chunk_bytes: DEFAULT_TARGET_CHUNK_BYTES,
            output_format: OutputFormat::Mp3,
            max_concurrency: 3,
            retry: RetryPolicy::default(),
            retention: Duration::from_secs(60 * 60),
            sweep_interval: Duration::from_secs(10 * 60),
        }
    }
}

/// A transcription request
#[derive(Clone)]
pub struct JobRequest {
    /// Media file to split
    pub audio_path: PathBuf,
    /// Display name stored with the job
    pub filename: String,
    pub options: TranscriptionOptions,
    /// Intermediate extracted audio, deleted together with the chunks
    pub original_audio_path: Option<PathBuf>,
    pub on_progress: Option<ProgressCallback>,
}

impl JobRequest {
    pub fn new<P: Into<PathBuf>, S: Into<String>>(audio_path: P, filename: S) -> Self {
        Self {
            audio_path: audio_path.into(),
            filename: filename.into(),
            options: TranscriptionOptions::default(),
            original_audio_path: None,
            on_progress: None,
        }
    }

    pub fn with_options(mut self, options: TranscriptionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_original_audio<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.original_audio_path = Some(path.into());
        self
    }

    pub fn with_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(usize, usize) + Send + Sync + 'static,
    {
        self.on_progress = Some(Arc::new(callback));
        self
    }
}

impl std::fmt::Debug for JobRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRequest")
            .field("audio_path", &self.audio_path)
            .field("filename", &self.filename)
            .field("options", &self.options)
            .field("original_audio_path", &self.original_audio_path)
            .field("on_progress", &self.on_progress.is_some())
            .finish()
    }
}

/// Splits media, fans chunks out to the transcriber and tracks jobs in the store
pub struct ChunkedTranscriptionService {
    splitter: Arc<dyn MediaSplitter>,
    transcriber: Arc<dyn SegmentTranscriber>,
    store: Arc<JobStore>,
    sweeper: RetentionSweeper,
    config: ServiceConfig,
}

impl ChunkedTranscriptionService {
    /// Create the service over `store`.
    ///
    /// When called inside a Tokio runtime over a store that already holds jobs (e.g. after a
    /// restart) the retention sweeper starts right away.
    pub fn new(
        splitter: Arc<dyn MediaSplitter>,
        transcriber: Arc<dyn SegmentTranscriber>,
        store: Arc<JobStore>,
        config: ServiceConfig,
    ) -> Self {
        let sweeper =
            RetentionSweeper::new(Arc::clone(&store), config.sweep_interval, config.retention);
        if !store.is_empty() {
            sweeper.ensure_running();
        }

        Self {
            splitter,
            transcriber,
            store,
            sweeper,
            config,
        }
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Split `audio_path` and start transcribing it in the background.
    ///
    /// Returns once the job is registered; the transcription itself is not awaited.
    pub async fn start_job(
        &self,
        audio_path: &Path,
        filename: &str,
        options: TranscriptionOptions,
    ) -> Result<StartedJob> {
        self.submit(JobRequest::new(audio_path, filename).with_options(options))
            .await
    }

    /// General form of [`start_job`](Self::start_job)
    pub async fn submit(&self, request: JobRequest) -> Result<StartedJob> {
        if !self.splitter.is_available() {
            return Err(Error::SplitterUnavailable(
                "media splitting tools are not installed".to_string(),
            ));
        }

        let split_options = SplitOptions {
            target_chunk_bytes: self.config.target_chunk_bytes,
            output_format: self.config.output_format,
        };
        let split = match self.splitter.split(&request.audio_path, &split_options).await {
            Ok(split) => split,
            Err(SplitError::Unavailable(reason)) => return Err(Error::SplitterUnavailable(reason)),
            Err(e) => return Err(e.into()),
        };

        let job_id = generate_job_id();
        let record = match self
            .store
            .create(
                &job_id,
                split.chunk_paths.clone(),
                &request.filename,
                request.original_audio_path.clone(),
            )
            .await
        {
            Ok(record) => record,
            Err(e) => {
                // The job never existed, so nothing else owns these files.
                remove_files(&job_id, &split.chunk_paths, None).await;
                return Err(e.into());
            }
        };

        info!(
            "Started job {} for {} ({} chunks, {:.1}s of media)",
            job_id, request.filename, record.total_chunks, split.total_duration_secs
        );

        self.sweeper.ensure_running();

        let workflow = JobWorkflow {
            job_id: job_id.clone(),
            chunk_paths: record.chunk_paths,
            original_audio_path: record.original_audio_path,
            options: request.options,
            on_progress: request.on_progress,
            transcriber: Arc::clone(&self.transcriber),
            store: Arc::clone(&self.store),
            retry: self.config.retry.clone(),
            max_concurrency: self.config.max_concurrency.max(1),
        };
        workflow.spawn();

        Ok(StartedJob {
            job_id,
            total_chunks: record.total_chunks,
        })
    }

    /// Current status of a job, or `None` if it is unknown or already evicted
    pub fn get_status(&self, job_id: &str) -> Result<Option<JobStatus>> {
        Ok(self.store.get(job_id)?.map(|record| record.status()))
    }

    pub fn list_jobs(&self) -> Result<Vec<JobStatus>> {
        Ok(self
            .store
            .list_jobs()?
            .iter()
            .map(|record| record.status())
            .collect())
    }

    /// Forget a job. A job that is still running keeps running but is no longer tracked.
    pub async fn delete_job(&self, job_id: &str) -> Result<bool> {
        Ok(self.store.delete(job_id).await?)
    }

    /// Give up on a running job: its temporary files are removed and it is marked failed.
    ///
    /// Meant for shutdown, when the background workflow will not get to clean up. Returns
    /// false for unknown or already terminal jobs, which are left untouched.
    pub async fn abandon(&self, job_id: &str, reason: &str) -> Result<bool> {
        let Some(record) = self.store.get(job_id)? else {
            return Ok(false);
        };
        if record.is_terminal() {
            return Ok(false);
        }

        remove_files(
            job_id,
            &record.chunk_paths,
            record.original_audio_path.as_deref(),
        )
        .await;
        warn!("Job {} abandoned: {}", job_id, reason);
        Ok(self.store.fail(job_id, reason.to_string()).await?)
    }

    /// Run one retention sweep now, returning the number of evicted jobs
    pub async fn sweep_expired(&self) -> usize {
        self.sweeper.sweep_now().await
    }
}

#[derive(Debug, thiserror::Error)]
enum WorkflowError {
    #[error(transparent)]
    Chunk(#[from] ChunkError),

    #[error("Failed to record progress: {0}")]
    Store(#[from] StoreError),
}

/// Everything the background task needs for one job
struct JobWorkflow {
    job_id: String,
    chunk_paths: Vec<PathBuf>,
    original_audio_path: Option<PathBuf>,
    options: TranscriptionOptions,
    on_progress: Option<ProgressCallback>,
    transcriber: Arc<dyn SegmentTranscriber>,
    store: Arc<JobStore>,
    retry: RetryPolicy,
    max_concurrency: usize,
}

impl JobWorkflow {
    /// Detach the workflow.
    ///
    /// The transcription runs in its own task; a supervising task awaits it so that
    /// errors and panics both end in a terminal store write. Temporary files are removed
    /// before that write, so a job observed as terminal has no files left on disk.
    fn spawn(self) {
        let job_id = self.job_id.clone();
        let store = Arc::clone(&self.store);
        let chunk_paths = self.chunk_paths.clone();
        let original_audio_path = self.original_audio_path.clone();

        tokio::spawn(async move {
            let outcome = match tokio::spawn(self.run()).await {
                Ok(Ok(transcript)) => Ok(transcript),
                Ok(Err(e)) => Err(e.to_string()),
                Err(join_error) if join_error.is_panic() => Err(format!(
                    "Job workflow panicked: {}",
                    panic_message(join_error.into_panic())
                )),
                Err(join_error) => Err(format!("Job workflow was cancelled: {}", join_error)),
            };

            remove_files(&job_id, &chunk_paths, original_audio_path.as_deref()).await;

            let message = match outcome {
                Ok(transcript) => match store.complete(&job_id, transcript).await {
                    Ok(_) => {
                        info!("Job {} succeeded", job_id);
                        return;
                    }
                    Err(e) => format!("Failed to store transcript: {}", e),
                },
                Err(message) => message,
            };

            error!("Job {} failed: {}", job_id, message);
            if let Err(e) = store.fail(&job_id, message).await {
                error!("Failed to record failure of job {}: {}", job_id, e);
            }
        });
    }

    /// Transcribe every chunk in bounded batches and merge the results
    async fn run(self) -> std::result::Result<String, WorkflowError> {
        let total = self.chunk_paths.len();
        self.store.mark_processing(&self.job_id).await?;

        let transcriber = self.transcriber.as_ref();
        let retry = &self.retry;
        let options = &self.options;
        let mut results = Vec::with_capacity(total);
        let mut completed = 0;

        for (batch_number, batch) in self.chunk_paths.chunks(self.max_concurrency).enumerate() {
            let offset = batch_number * self.max_concurrency;
            debug!(
                "Job {}: dispatching chunks {}..={} of {}",
                self.job_id,
                offset + 1,
                offset + batch.len(),
                total
            );

            let transcriptions = batch.iter().enumerate().map(|(i, path)| {
                let index = offset + i;
                async move {
                    transcribe_with_retry(transcriber, retry, path, index, total, options)
                        .await
                        .map(|text| ChunkResult::new(index, text))
                }
            });

            for outcome in join_all(transcriptions).await {
                results.push(outcome?);
            }

            completed += batch.len();
            let current_chunk = offset + batch.len() - 1;
            self.store
                .update_progress(&self.job_id, completed, Some(current_chunk))
                .await?;
            if let Some(on_progress) = &self.on_progress {
                on_progress(completed, total);
            }
            debug!("Job {}: {}/{} chunks done", self.job_id, completed, total);
        }

        Ok(merge_transcripts(results))
    }
}

/// Delete a job's temporary files and, when it is left empty, their directory
async fn remove_files(job_id: &str, chunk_paths: &[PathBuf], original_audio: Option<&Path>) {
    for path in chunk_paths.iter().map(PathBuf::as_path).chain(original_audio) {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                "Job {}: failed to remove {}: {}",
                job_id,
                path.display(),
                e
            ),
        }
    }

    if let Some(dir) = chunk_paths.first().and_then(|path| path.parent()) {
        if tokio::fs::remove_dir(dir).await.is_ok() {
            debug!("Job {}: removed {}", job_id, dir.display());
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
