use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// Lifecycle state of a transcription job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Registered, background workflow not yet running
    Pending,
    /// Chunks are being transcribed
    Processing,
    /// Terminal: transcript available
    Succeeded,
    /// Terminal: error available
    Failed,
}

impl JobState {
    /// Whether the state is final. Terminal jobs never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Persisted job record, owned by the job store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Opaque job handle, also the storage key
    pub job_id: String,
    /// Current lifecycle state
    pub state: JobState,
    /// Number of segments produced by the splitter (>= 1)
    pub total_chunks: usize,
    /// Segments transcribed so far
    pub completed_chunks: usize,
    /// Index of the most recently dispatched segment
    pub current_chunk: Option<usize>,
    /// Merged transcript, set only when succeeded
    pub transcript: Option<String>,
    /// Failure description, set only when failed
    pub error: Option<String>,
    /// Temporary segment files, in original order
    pub chunk_paths: Vec<PathBuf>,
    /// Intermediate extracted audio to remove with the segments
    pub original_audio_path: Option<PathBuf>,
    /// Display name supplied by the caller
    pub filename: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// Create a new pending record
    pub fn new(
        job_id: String,
        chunk_paths: Vec<PathBuf>,
        filename: String,
        original_audio_path: Option<PathBuf>,
    ) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            state: JobState::Pending,
            total_chunks: chunk_paths.len(),
            completed_chunks: 0,
            current_chunk: None,
            transcript: None,
            error: None,
            chunk_paths,
            original_audio_path,
            filename,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Record progress. `completed` is clamped to `total_chunks` and never moves backwards.
    pub fn record_progress(&mut self, completed: usize, current_chunk: Option<usize>) {
        self.completed_chunks = self.completed_chunks.max(completed.min(self.total_chunks));
        if current_chunk.is_some() {
            self.current_chunk = current_chunk;
        }
        self.state = JobState::Processing;
        self.touch();
    }

    /// Move to processing without touching progress counters
    pub fn mark_processing(&mut self) {
        self.state = JobState::Processing;
        self.touch();
    }

    /// Terminal success
    pub fn mark_succeeded(&mut self, transcript: String) {
        self.state = JobState::Succeeded;
        self.completed_chunks = self.total_chunks;
        self.transcript = Some(transcript);
        self.error = None;
        self.touch();
    }

    /// Terminal failure. Progress stays at whatever was reached.
    pub fn mark_failed(&mut self, error: String) {
        self.state = JobState::Failed;
        self.error = Some(error);
        self.transcript = None;
        self.touch();
    }

    /// Caller-facing view of this record
    pub fn status(&self) -> JobStatus {
        JobStatus::from(self)
    }

    fn touch(&mut self) {
        // Keep updated_at monotonic even if the wall clock steps backwards.
        self.updated_at = Utc::now().max(self.updated_at);
    }

    /// Serialize this record to MessagePack format
    pub fn to_bytes(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec_named(self)
    }

    /// Deserialize from MessagePack format
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }
}

/// Job status as exposed to pollers. Temporary file locations are not included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_id: String,
    pub state: JobState,
    pub total_chunks: usize,
    pub completed_chunks: usize,
    pub current_chunk: Option<usize>,
    pub transcript: Option<String>,
    pub error: Option<String>,
    pub filename: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&JobRecord> for JobStatus {
    fn from(record: &JobRecord) -> Self {
        Self {
            job_id: record.job_id.clone(),
            state: record.state,
            total_chunks: record.total_chunks,
            completed_chunks: record.completed_chunks,
            current_chunk: record.current_chunk,
            transcript: record.transcript.clone(),
            error: record.error.clone(),
            filename: record.filename.clone(),
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

/// Handle returned when a job has been registered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartedJob {
    pub job_id: String,
    pub total_chunks: usize,
}

/// Transcribed text of one segment, tagged with its position in the source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkResult {
    /// Zero-based index of the segment
    pub index: usize,
    pub text: String,
}

impl ChunkResult {
    pub fn new(index: usize, text: impl Into<String>) -> Self {
        Self {
            index,
            text: text.into(),
        }
    }
}

/// Options forwarded to the segment transcriber for every chunk of a job
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionOptions {
    /// ISO 639-1 language hint
    pub language: Option<String>,
    /// Context prompt to bias recognition
    pub prompt: Option<String>,
    /// Model override
    pub model: Option<String>,
    /// Sampling temperature (0.0 to 1.0)
    pub temperature: Option<f32>,
}

/// Generate a new opaque job identifier
pub fn generate_job_id() -> String {
    Uuid::new_v4().to_string()
}
