use anyhow::{bail, Context, Result};
use chrono::Utc;
use chunked_transcriber::{
    ChunkedTranscriptionService, FfmpegSplitter, HttpTranscriber, HttpTranscriberConfig,
    JobRequest, JobState, JobStatus, JobStore, OutputFormat, RetryPolicy, ServiceConfig,
    TranscriptionOptions, DEFAULT_STORE_PATH, DEFAULT_TARGET_CHUNK_BYTES, DEFAULT_WORK_DIR,
};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::time::sleep;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "chunked-transcriber")]
#[command(about = "Transcribe media larger than the upload limit by splitting it into chunks")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Args {
    /// Job store directory path
    #[arg(long, default_value = DEFAULT_STORE_PATH)]
    pub store_path: PathBuf,

    /// Use a throwaway store instead of the on-disk one
    #[arg(long)]
    pub ephemeral: bool,

    /// Directory for temporary chunk files
    #[arg(long, default_value = DEFAULT_WORK_DIR)]
    pub work_dir: PathBuf,

    /// Chunks transcribed concurrently
    #[arg(long, default_value = "3")]
    pub concurrency: usize,

    /// Target size of each chunk in bytes
    #[arg(long, default_value_t = DEFAULT_TARGET_CHUNK_BYTES)]
    pub chunk_bytes: u64,

    /// Encoding of chunk files
    #[arg(long, value_enum, default_value = "mp3")]
    pub chunk_format: ChunkFormat,

    /// Attempts per chunk, including the first
    #[arg(long, default_value = "3")]
    pub max_attempts: u32,

    /// Delay before retrying a failed chunk in milliseconds (doubled on rate limits)
    #[arg(long, default_value = "2000")]
    pub retry_delay: u64,

    /// Transcription endpoint URL
    #[arg(long, default_value = "https://api.openai.com/v1/audio/transcriptions")]
    pub endpoint: String,

    /// API key for the transcription endpoint
    #[arg(long, env = "TRANSCRIBER_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Transcription model
    #[arg(long, default_value = "whisper-1")]
    pub model: String,

    /// Per-request timeout in seconds
    #[arg(long, default_value = "300")]
    pub request_timeout: u64,

    /// Log level
    #[arg(long, value_enum, default_value = "info")]
    pub log_level: LogLevel,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Split and transcribe a media file, waiting for the result
    Transcribe {
        /// Audio or video file
        file: PathBuf,

        /// Display name stored with the job (defaults to the file name)
        #[arg(long)]
        filename: Option<String>,

        /// ISO 639-1 language hint
        #[arg(long)]
        language: Option<String>,

        /// Context prompt for the model
        #[arg(long)]
        prompt: Option<String>,

        /// Status polling interval in milliseconds
        #[arg(long, default_value = "1000")]
        poll_interval: u64,
    },

    /// Print the status of a job as JSON
    Status { job_id: String },

    /// List tracked jobs
    Jobs,

    /// Evict finished jobs older than the retention window
    Sweep {
        /// Retention window in seconds (defaults to one hour)
        #[arg(long)]
        retention_secs: Option<u64>,
    },

    /// Forget a job
    Delete { job_id: String },
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Debug)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum, Debug)]
pub enum ChunkFormat {
    Mp3,
    Wav,
}

impl From<ChunkFormat> for OutputFormat {
    fn from(format: ChunkFormat) -> Self {
        match format {
            ChunkFormat::Mp3 => OutputFormat::Mp3,
            ChunkFormat::Wav => OutputFormat::Wav,
        }
    }
}

impl Args {
    fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            target_chunk_bytes: self.chunk_bytes,
            output_format: self.chunk_format.into(),
            max_concurrency: self.concurrency.max(1),
            retry: RetryPolicy::new(self.max_attempts, Duration::from_millis(self.retry_delay)),
            ..Default::default()
        }
    }

    fn transcriber_config(&self) -> HttpTranscriberConfig {
        HttpTranscriberConfig {
            endpoint: self.endpoint.clone(),
            api_key: self.api_key.clone(),
            model: self.model.clone(),
            request_timeout: Duration::from_secs(self.request_timeout),
            ..Default::default()
        }
    }

    fn open_store(&self) -> Result<JobStore> {
        if self.ephemeral {
            return JobStore::temporary().context("Failed to create temporary job store");
        }
        JobStore::open(&self.store_path).with_context(|| {
            format!("Failed to open job store at {}", self.store_path.display())
        })
    }

    fn build_service(&self) -> Result<ChunkedTranscriptionService> {
        let store = Arc::new(self.open_store()?);
        let splitter = Arc::new(FfmpegSplitter::new(&self.work_dir));
        let transcriber = Arc::new(
            HttpTranscriber::new(self.transcriber_config())
                .context("Failed to create HTTP transcriber")?,
        );

        Ok(ChunkedTranscriptionService::new(
            splitter,
            transcriber,
            store,
            self.service_config(),
        ))
    }
}

/// Start a job and poll it until it reaches a terminal state
async fn transcribe(
    service: &ChunkedTranscriptionService,
    file: &Path,
    filename: Option<String>,
    options: TranscriptionOptions,
    poll_interval: Duration,
) -> Result<JobStatus> {
    let filename = filename.unwrap_or_else(|| {
        file.file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| file.display().to_string())
    });

    let request = JobRequest::new(file, filename)
        .with_options(options)
        .with_progress(|completed, total| info!("Progress: {}/{} chunks", completed, total));

    let started = service
        .submit(request)
        .await
        .with_context(|| format!("Failed to start transcription of {}", file.display()))?;

    info!(
        "Job {} started with {} chunks",
        started.job_id, started.total_chunks
    );

    loop {
        tokio::select! {
            _ = sleep(poll_interval) => {}
            _ = signal::ctrl_c() => {
                warn!("Interrupted, abandoning job {}", started.job_id);
                service
                    .abandon(&started.job_id, "Interrupted before completion")
                    .await?;
                bail!("Job {} interrupted", started.job_id);
            }
        }

        match service.get_status(&started.job_id)? {
            Some(status) if status.state.is_terminal() => return Ok(status),
            Some(_) => {}
            None => bail!("Job {} disappeared from the store", started.job_id),
        }
    }
}

fn print_jobs(jobs: &[JobStatus]) {
    if jobs.is_empty() {
        println!("No jobs");
        return;
    }

    for job in jobs {
        println!(
            "{}  {:<10}  {:>3}/{:<3}  {}  {}",
            job.job_id,
            job.state.to_string(),
            job.completed_chunks,
            job.total_chunks,
            job.updated_at.format("%Y-%m-%d %H:%M:%S"),
            job.filename
        );
    }
}

async fn run(args: Args) -> Result<()> {
    let service = args.build_service()?;

    match args.command.clone() {
        Command::Transcribe {
            file,
            filename,
            language,
            prompt,
            poll_interval,
        } => {
            let options = TranscriptionOptions {
                language,
                prompt,
                ..Default::default()
            };
            let status = transcribe(
                &service,
                &file,
                filename,
                options,
                Duration::from_millis(poll_interval.max(1)),
            )
            .await?;

            match status.state {
                JobState::Succeeded => {
                    println!("{}", status.transcript.unwrap_or_default());
                }
                _ => bail!(
                    "Job {} failed: {}",
                    status.job_id,
                    status.error.unwrap_or_else(|| "unknown error".to_string())
                ),
            }
        }
        Command::Status { job_id } => match service.get_status(&job_id)? {
            Some(status) => println!("{}", serde_json::to_string_pretty(&status)?),
            None => bail!("Job {} not found", job_id),
        },
        Command::Jobs => print_jobs(&service.list_jobs()?),
        Command::Sweep { retention_secs } => {
            let removed = match retention_secs {
                Some(secs) => service
                    .store()
                    .sweep_expired(Duration::from_secs(secs), Utc::now())
                    .await
                    .context("Retention sweep failed")?,
                None => service.sweep_expired().await,
            };
            println!("Removed {} expired jobs", removed);
        }
        Command::Delete { job_id } => {
            if !service.delete_job(&job_id).await? {
                bail!("Job {} not found", job_id);
            }
            println!("Deleted job {}", job_id);
        }
    }

    service.store().flush().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level: tracing::Level = args.log_level.into();
    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!("Starting Chunked Transcriber v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration:");
    if args.ephemeral {
        info!("  Job store: ephemeral");
    } else {
        info!("  Job store: {}", args.store_path.display());
    }
    info!("  Work dir: {}", args.work_dir.display());
    info!("  Concurrency: {}", args.concurrency);
    info!("  Chunk size: {} bytes", args.chunk_bytes);
    info!("  Endpoint: {}", args.endpoint);
    info!("  Log level: {:?}", args.log_level);

    if let Err(e) = run(args).await {
        error!("{:#}", e);
        return Err(e);
    }

    Ok(())
}
