use chrono::{DateTime, Utc};
use sled::{Db, Tree};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::protocol::JobRecord;

pub mod retention;

pub use retention::RetentionSweeper;

/// Errors raised by the job store
#[derive(Error, Debug)]
pub enum StoreError {
    /// Underlying sled failure
    #[error("Storage error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("Deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    /// `create` called twice for the same id
    #[error("Job {0} already exists")]
    AlreadyExists(String),

    #[error("Job {0} must have at least one chunk")]
    NoChunks(String),
}

/// Durable job registry backed by Sled.
///
/// Each job is one key in the `jobs` tree holding a full MessagePack record. Every
/// mutation rewrites the whole record with a single insert, so concurrent readers
/// observe either the previous record or the new one. Writes are serialized through
/// `write_lock` and flushed before returning so that progress survives a restart.
pub struct JobStore {
    db: Db,
    jobs: Tree,
    write_lock: Mutex<()>,
}

impl JobStore {
    /// Open (or create) a store at the specified path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(&path)?;
        let jobs = db.open_tree("jobs")?;

        info!(
            "Opened job store at {} ({} jobs)",
            path.as_ref().display(),
            jobs.len()
        );

        Ok(Self {
            db,
            jobs,
            write_lock: Mutex::new(()),
        })
    }

    /// Create a store that is discarded on drop (useful for testing)
    pub fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        let jobs = db.open_tree("jobs")?;

        Ok(Self {
            db,
            jobs,
            write_lock: Mutex::new(()),
        })
    }

    /// Register a new pending job. Fails if the id is already taken.
    pub async fn create(
        &self,
        job_id: &str,
        chunk_paths: Vec<PathBuf>,
        filename: &str,
        original_audio_path: Option<PathBuf>,
    ) -> Result<JobRecord, StoreError> {
        if chunk_paths.is_empty() {
            return Err(StoreError::NoChunks(job_id.to_string()));
        }

        let record = JobRecord::new(
            job_id.to_string(),
            chunk_paths,
            filename.to_string(),
            original_audio_path,
        );
        let bytes = record.to_bytes()?;

        let _guard = self.write_lock.lock().await;
        let swapped = self
            .jobs
            .compare_and_swap(job_id.as_bytes(), None as Option<&[u8]>, Some(bytes))?;
        if swapped.is_err() {
            return Err(StoreError::AlreadyExists(job_id.to_string()));
        }
        self.db.flush_async().await?;

        debug!(
            "Created job {} with {} chunks",
            job_id, record.total_chunks
        );
        Ok(record)
    }

    /// Record progress for a running job.
    ///
    /// Unknown and terminal jobs are left untouched with a warning; `Ok(false)` is
    /// returned in that case.
    pub async fn update_progress(
        &self,
        job_id: &str,
        completed_chunks: usize,
        current_chunk: Option<usize>,
    ) -> Result<bool, StoreError> {
        self.modify(job_id, "progress update", |record| {
            record.record_progress(completed_chunks, current_chunk);
        })
        .await
    }

    /// Transition a pending job to processing
    pub async fn mark_processing(&self, job_id: &str) -> Result<bool, StoreError> {
        self.modify(job_id, "processing transition", JobRecord::mark_processing)
            .await
    }

    /// Terminal success write
    pub async fn complete(&self, job_id: &str, transcript: String) -> Result<bool, StoreError> {
        self.modify(job_id, "completion", move |record| {
            record.mark_succeeded(transcript);
        })
        .await
    }

    /// Terminal failure write
    pub async fn fail(&self, job_id: &str, error: String) -> Result<bool, StoreError> {
        self.modify(job_id, "failure", move |record| {
            record.mark_failed(error);
        })
        .await
    }

    /// Read a job record
    pub fn get(&self, job_id: &str) -> Result<Option<JobRecord>, StoreError> {
        match self.jobs.get(job_id.as_bytes())? {
            Some(bytes) => Ok(Some(JobRecord::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Remove a job record. Returns whether a record existed.
    pub async fn delete(&self, job_id: &str) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        let removed = self.jobs.remove(job_id.as_bytes())?.is_some();
        if removed {
            self.db.flush_async().await?;
            debug!("Deleted job {}", job_id);
        }
        Ok(removed)
    }

    /// All readable job records, oldest first
    pub fn list_jobs(&self) -> Result<Vec<JobRecord>, StoreError> {
        let mut records = Vec::with_capacity(self.jobs.len());
        for entry in self.jobs.iter() {
            let (key, bytes) = entry?;
            match JobRecord::from_bytes(&bytes) {
                Ok(record) => records.push(record),
                Err(e) => warn!(
                    "Skipping unreadable job record {}: {}",
                    String::from_utf8_lossy(&key),
                    e
                ),
            }
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Delete terminal jobs last updated before `now - retention`.
    ///
    /// Pending and processing jobs are kept regardless of age.
    pub async fn sweep_expired(
        &self,
        retention: Duration,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let Some(cutoff) = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|retention| now.checked_sub_signed(retention))
        else {
            return Ok(0);
        };

        let _guard = self.write_lock.lock().await;
        let mut removed = 0;

        for entry in self.jobs.iter() {
            let (key, bytes) = entry?;
            let record = match JobRecord::from_bytes(&bytes) {
                Ok(record) => record,
                Err(e) => {
                    warn!(
                        "Retention sweep skipping unreadable record {}: {}",
                        String::from_utf8_lossy(&key),
                        e
                    );
                    continue;
                }
            };

            if record.is_terminal() && record.updated_at < cutoff {
                debug!(
                    "Removing expired job {} ({}, last updated {})",
                    record.job_id, record.state, record.updated_at
                );
                self.jobs.remove(&key)?;
                removed += 1;
            }
        }

        if removed > 0 {
            self.db.flush_async().await?;
            info!("Retention sweep removed {} expired jobs", removed);
        }

        Ok(removed)
    }

    /// Flush all pending writes to disk
    pub async fn flush(&self) -> Result<(), StoreError> {
        self.db.flush_async().await?;
        Ok(())
    }

    async fn modify<F>(&self, job_id: &str, action: &str, apply: F) -> Result<bool, StoreError>
    where
        F: FnOnce(&mut JobRecord),
    {
        let _guard = self.write_lock.lock().await;

        let Some(bytes) = self.jobs.get(job_id.as_bytes())? else {
            warn!("Ignoring {} for unknown job {}", action, job_id);
            return Ok(false);
        };

        let mut record = JobRecord::from_bytes(&bytes)?;
        if record.is_terminal() {
            warn!(
                "Ignoring {} for job {} already in terminal state {}",
                action, job_id, record.state
            );
            return Ok(false);
        }

        apply(&mut record);
        self.jobs.insert(job_id.as_bytes(), record.to_bytes()?)?;
        self.db.flush_async().await?;

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::JobState;

    fn paths(n: usize) -> Vec<PathBuf> {
        (0..n)
            .map(|i| PathBuf::from(format!("/tmp/split/chunk_{i:03}.mp3")))
            .collect()
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = JobStore::temporary().unwrap();
        store
            .create("job-1", paths(3), "talk.mp3", None)
            .await
            .unwrap();

        let record = store.get("job-1").unwrap().unwrap();
        assert_eq!(record.state, JobState::Pending);
        assert_eq!(record.total_chunks, 3);
        assert_eq!(record.chunk_paths, paths(3));
        assert_eq!(record.filename, "talk.mp3");
        assert!(store.get("missing").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_twice_is_rejected() {
        let store = JobStore::temporary().unwrap();
        store.create("job-1", paths(1), "a.mp3", None).await.unwrap();

        let err = store
            .create("job-1", paths(2), "b.mp3", None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(id) if id == "job-1"));
        assert_eq!(store.get("job-1").unwrap().unwrap().total_chunks, 1);
    }

    #[tokio::test]
    async fn test_create_requires_chunks() {
        let store = JobStore::temporary().unwrap();
        let err = store.create("job-1", Vec::new(), "a.mp3", None).await.unwrap_err();
        assert!(matches!(err, StoreError::NoChunks(_)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_progress_moves_to_processing() {
        let store = JobStore::temporary().unwrap();
        store.create("job-1", paths(4), "a.mp3", None).await.unwrap();

        assert!(store.update_progress("job-1", 2, Some(1)).await.unwrap());
        let record = store.get("job-1").unwrap().unwrap();
        assert_eq!(record.state, JobState::Processing);
        assert_eq!(record.completed_chunks, 2);
        assert_eq!(record.current_chunk, Some(1));
    }

    #[tokio::test]
    async fn test_progress_for_unknown_job_is_a_noop() {
        let store = JobStore::temporary().unwrap();
        assert!(!store.update_progress("ghost", 1, None).await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_terminal_jobs_are_immutable() {
        let store = JobStore::temporary().unwrap();
        store.create("job-1", paths(2), "a.mp3", None).await.unwrap();
        assert!(store.complete("job-1", "text".to_string()).await.unwrap());

        assert!(!store.fail("job-1", "late".to_string()).await.unwrap());
        assert!(!store.update_progress("job-1", 0, Some(0)).await.unwrap());
        assert!(!store.mark_processing("job-1").await.unwrap());

        let record = store.get("job-1").unwrap().unwrap();
        assert_eq!(record.state, JobState::Succeeded);
        assert_eq!(record.transcript.as_deref(), Some("text"));
        assert_eq!(record.completed_chunks, 2);
        assert!(record.error.is_none());
    }

    #[tokio::test]
    async fn test_fail_keeps_progress() {
        let store = JobStore::temporary().unwrap();
        store.create("job-1", paths(3), "a.mp3", None).await.unwrap();
        store.update_progress("job-1", 1, Some(0)).await.unwrap();
        store.fail("job-1", "boom".to_string()).await.unwrap();

        let record = store.get("job-1").unwrap().unwrap();
        assert_eq!(record.state, JobState::Failed);
        assert_eq!(record.completed_chunks, 1);
        assert_eq!(record.error.as_deref(), Some("boom"));
        assert!(record.transcript.is_none());
    }

    #[tokio::test]
    async fn test_delete_and_list() {
        let store = JobStore::temporary().unwrap();
        store.create("job-1", paths(1), "a.mp3", None).await.unwrap();
        store.create("job-2", paths(1), "b.mp3", None).await.unwrap();

        let ids: Vec<_> = store
            .list_jobs()
            .unwrap()
            .into_iter()
            .map(|r| r.job_id)
            .collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"job-1".to_string()));

        assert!(store.delete("job-1").await.unwrap());
        assert!(!store.delete("job-1").await.unwrap());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_removes_only_old_terminal_jobs() {
        let store = JobStore::temporary().unwrap();
        store.create("done", paths(1), "a.mp3", None).await.unwrap();
        store.create("failed", paths(1), "b.mp3", None).await.unwrap();
        store.create("running", paths(2), "c.mp3", None).await.unwrap();
        store.create("waiting", paths(1), "d.mp3", None).await.unwrap();

        store.complete("done", "ok".to_string()).await.unwrap();
        store.fail("failed", "nope".to_string()).await.unwrap();
        store.update_progress("running", 1, Some(0)).await.unwrap();

        let retention = Duration::from_secs(3600);

        // Nothing is old enough yet
        let removed = store.sweep_expired(retention, Utc::now()).await.unwrap();
        assert_eq!(removed, 0);
        assert_eq!(store.len(), 4);

        let later = Utc::now() + chrono::Duration::hours(2);
        let removed = store.sweep_expired(retention, later).await.unwrap();
        assert_eq!(removed, 2);

        assert!(store.get("done").unwrap().is_none());
        assert!(store.get("failed").unwrap().is_none());
        assert!(store.get("running").unwrap().is_some());
        assert!(store.get("waiting").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_store_persistence() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("jobs");

        {
            let store = JobStore::open(&path).unwrap();
            store.create("job-1", paths(3), "a.mp3", None).await.unwrap();
            store.update_progress("job-1", 2, Some(1)).await.unwrap();
        }

        {
            let store = JobStore::open(&path).unwrap();
            let record = store.get("job-1").unwrap().unwrap();
            assert_eq!(record.state, JobState::Processing);
            assert_eq!(record.completed_chunks, 2);
        }
    }

    #[tokio::test]
    async fn test_terminal_reads_are_identical() {
        let store = JobStore::temporary().unwrap();
        store.create("job-1", paths(1), "a.mp3", None).await.unwrap();
        store.complete("job-1", "final".to_string()).await.unwrap();

        let first = store.get("job-1").unwrap().unwrap();
        let second = store.get("job-1").unwrap().unwrap();
        assert_eq!(first.to_bytes().unwrap(), second.to_bytes().unwrap());
    }
}
