use std::future::Future;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, error, warn};

use crate::protocol::TranscriptionOptions;
use crate::transcriber::{SegmentTranscriber, TranscribeError};

/// How a failed attempt is treated when computing backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Rate limiting or capacity pushback; waits longer
    RateLimited,
    Generic,
}

impl ErrorClass {
    pub fn of(error: &TranscribeError) -> Self {
        if error.is_rate_limited() {
            ErrorClass::RateLimited
        } else {
            ErrorClass::Generic
        }
    }
}

/// Bounded retry with backoff differentiated by error class
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Wait before retrying a generic failure
    pub base_delay: Duration,
    /// Rate-limited failures wait `base_delay * rate_limit_multiplier`
    pub rate_limit_multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            rate_limit_multiplier: 2,
        }
    }
}

/// All attempts failed
#[derive(Debug, Clone)]
pub struct RetryExhausted {
    pub attempts: u32,
    pub last_error: TranscribeError,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            ..Default::default()
        }
    }

    /// Number of retries after the initial attempt
    pub fn max_retries(&self) -> u32 {
        self.max_attempts.saturating_sub(1)
    }

    /// Delay before the next attempt after a failure of the given class
    pub fn delay_for(&self, class: ErrorClass) -> Duration {
        match class {
            ErrorClass::Generic => self.base_delay,
            ErrorClass::RateLimited => self.base_delay * self.rate_limit_multiplier,
        }
    }

    /// Run `operation` until it succeeds or the attempt budget is spent.
    ///
    /// The closure receives the 1-based attempt number. Backoff uses `tokio::time`, so
    /// tests can run it on a paused clock.
    pub async fn run<F, Fut, T>(&self, mut operation: F) -> Result<T, RetryExhausted>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, TranscribeError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(last_error) if attempt >= max_attempts => {
                    return Err(RetryExhausted {
                        attempts: attempt,
                        last_error,
                    });
                }
                Err(e) => {
                    let class = ErrorClass::of(&e);
                    let delay = self.delay_for(class);
                    warn!(
                        "Attempt {}/{} failed ({:?}): {}; retrying in {:?}",
                        attempt, max_attempts, class, e, delay
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}

/// A chunk could not be transcribed within its retry budget
#[derive(Debug, Clone, Error)]
#[error("Chunk {chunk} of {total} failed after {attempts} attempts: {last_error}")]
pub struct ChunkError {
    /// 1-based chunk number
    pub chunk: usize,
    pub total: usize,
    pub attempts: u32,
    #[source]
    pub last_error: TranscribeError,
}

/// Transcribe one chunk under `policy`.
///
/// `chunk_index` is zero-based; errors report the 1-based chunk number.
pub async fn transcribe_with_retry(
    transcriber: &dyn SegmentTranscriber,
    policy: &RetryPolicy,
    chunk_path: &Path,
    chunk_index: usize,
    total_chunks: usize,
    options: &TranscriptionOptions,
) -> Result<String, ChunkError> {
    let chunk = chunk_index + 1;

    let result = policy
        .run(move |attempt| {
            debug!(
                "Transcribing chunk {}/{} (attempt {}): {}",
                chunk,
                total_chunks,
                attempt,
                chunk_path.display()
            );
            transcriber.transcribe(chunk_path, options)
        })
        .await;

    result.map_err(|exhausted| {
        error!(
            "Chunk {}/{} exhausted {} attempts: {}",
            chunk, total_chunks, exhausted.attempts, exhausted.last_error
        );
        ChunkError {
            chunk,
            total: total_chunks,
            attempts: exhausted.attempts,
            last_error: exhausted.last_error,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tokio::time::Instant;

    /// Replays scripted outcomes, then succeeds
    struct ScriptedTranscriber {
        script: Mutex<VecDeque<TranscribeError>>,
        calls: AtomicU32,
    }

    impl ScriptedTranscriber {
        fn new(failures: Vec<TranscribeError>) -> Self {
            Self {
                script: Mutex::new(failures.into()),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl SegmentTranscriber for ScriptedTranscriber {
        async fn transcribe(
            &self,
            segment: &Path,
            _options: &TranscriptionOptions,
        ) -> Result<String, TranscribeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.script.lock().unwrap().pop_front() {
                Some(e) => Err(e),
                None => Ok(format!("text of {}", segment.display())),
            }
        }
    }

    fn generic() -> TranscribeError {
        TranscribeError::Request("connection reset".into())
    }

    fn rate_limited() -> TranscribeError {
        TranscribeError::RateLimited("429".into())
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_secs(2))
    }

    #[test]
    fn test_policy_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.max_retries(), 2);
        assert_eq!(policy.delay_for(ErrorClass::Generic), Duration::from_secs(2));
        assert_eq!(
            policy.delay_for(ErrorClass::RateLimited),
            Duration::from_secs(4)
        );
    }

    #[test]
    fn test_error_classification() {
        assert_eq!(ErrorClass::of(&rate_limited()), ErrorClass::RateLimited);
        assert_eq!(ErrorClass::of(&generic()), ErrorClass::Generic);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_attempt_success_has_no_delay() {
        let transcriber = ScriptedTranscriber::new(vec![]);
        let start = Instant::now();

        let text = transcribe_with_retry(
            &transcriber,
            &policy(),
            &PathBuf::from("c0.mp3"),
            0,
            1,
            &TranscriptionOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(text, "text of c0.mp3");
        assert_eq!(transcriber.calls.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_within_budget_after_two_backoffs() {
        let transcriber = ScriptedTranscriber::new(vec![generic(), generic()]);
        let start = Instant::now();

        let text = transcribe_with_retry(
            &transcriber,
            &policy(),
            &PathBuf::from("c1.mp3"),
            1,
            3,
            &TranscriptionOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(text, "text of c1.mp3");
        assert_eq!(transcriber.calls.load(Ordering::SeqCst), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_waits_longer() {
        let transcriber = ScriptedTranscriber::new(vec![rate_limited(), generic()]);
        let start = Instant::now();

        transcribe_with_retry(
            &transcriber,
            &policy(),
            &PathBuf::from("c0.mp3"),
            0,
            1,
            &TranscriptionOptions::default(),
        )
        .await
        .unwrap();

        // 4s after the rate limit, 2s after the generic failure
        assert_eq!(start.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_names_chunk_and_attempts() {
        let transcriber =
            ScriptedTranscriber::new(vec![generic(), generic(), generic(), generic()]);

        let err = transcribe_with_retry(
            &transcriber,
            &policy(),
            &PathBuf::from("c1.mp3"),
            1,
            3,
            &TranscriptionOptions::default(),
        )
        .await
        .unwrap_err();

        assert_eq!(err.chunk, 2);
        assert_eq!(err.total, 3);
        assert_eq!(err.attempts, 3);
        assert_eq!(transcriber.calls.load(Ordering::SeqCst), 3);

        let message = err.to_string();
        assert!(message.contains("Chunk 2 of 3"));
        assert!(message.contains("3 attempts"));
        assert!(message.contains("connection reset"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_attempt_policy_never_sleeps() {
        let transcriber = ScriptedTranscriber::new(vec![rate_limited()]);
        let start = Instant::now();

        let err = transcribe_with_retry(
            &transcriber,
            &RetryPolicy::new(1, Duration::from_secs(2)),
            &PathBuf::from("c0.mp3"),
            0,
            1,
            &TranscriptionOptions::default(),
        )
        .await
        .unwrap_err();

        assert_eq!(err.attempts, 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
