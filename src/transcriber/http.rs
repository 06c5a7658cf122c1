use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

use super::{SegmentTranscriber, TranscribeError};
use crate::protocol::TranscriptionOptions;

/// Hard per-request upload ceiling of the upstream API
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 25 * 1024 * 1024;

/// Configuration for the HTTP transcriber
#[derive(Debug, Clone)]
pub struct HttpTranscriberConfig {
    /// Full URL of the transcription endpoint
    pub endpoint: String,
    /// Bearer token, if the endpoint requires one
    pub api_key: Option<String>,
    /// Model used when the job options do not override it
    pub model: String,
    /// Timeout for a single upload + transcription request
    pub request_timeout: Duration,
    /// Segments above this size are rejected without a request
    pub max_upload_bytes: u64,
}

impl Default for HttpTranscriberConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/audio/transcriptions".to_string(),
            api_key: None,
            model: "whisper-1".to_string(),
            request_timeout: Duration::from_secs(300),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

/// Transcriber for OpenAI-compatible `audio/transcriptions` endpoints
pub struct HttpTranscriber {
    client: reqwest::Client,
    config: HttpTranscriberConfig,
}

impl HttpTranscriber {
    pub fn new(config: HttpTranscriberConfig) -> Result<Self, TranscribeError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| TranscribeError::Other(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &HttpTranscriberConfig {
        &self.config
    }

    fn build_form(
        &self,
        file_name: String,
        bytes: Vec<u8>,
        mime: &str,
        options: &TranscriptionOptions,
    ) -> Result<Form, TranscribeError> {
        let part = Part::bytes(bytes)
            .file_name(file_name)
            .mime_str(mime)
            .map_err(|e| TranscribeError::Other(format!("Invalid MIME type {}: {}", mime, e)))?;

        let model = options
            .model
            .clone()
            .unwrap_or_else(|| self.config.model.clone());

        let mut form = Form::new()
            .part("file", part)
            .text("model", model)
            .text("response_format", "json");

        if let Some(language) = &options.language {
            form = form.text("language", language.clone());
        }
        if let Some(prompt) = &options.prompt {
            form = form.text("prompt", prompt.clone());
        }
        if let Some(temperature) = options.temperature {
            form = form.text("temperature", temperature.to_string());
        }

        Ok(form)
    }
}

#[async_trait]
impl SegmentTranscriber for HttpTranscriber {
    async fn transcribe(
        &self,
        segment: &Path,
        options: &TranscriptionOptions,
    ) -> Result<String, TranscribeError> {
        let size = tokio::fs::metadata(segment).await?.len();
        if size > self.config.max_upload_bytes {
            return Err(TranscribeError::TooLarge {
                size,
                limit: self.config.max_upload_bytes,
            });
        }

        let bytes = tokio::fs::read(segment).await?;
        let file_name = segment
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "segment".to_string());
        let form = self.build_form(file_name, bytes, mime_for_path(segment), options)?;

        debug!("Uploading {} ({} bytes) for transcription", segment.display(), size);

        let mut request = self.client.post(&self.config.endpoint).multipart(form);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TranscribeError::Request(e.without_url().to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| TranscribeError::Request(e.without_url().to_string()))?;

        if !status.is_success() {
            let message = error_message(&body);
            warn!("Transcription request for {} failed: {} {}", segment.display(), status, message);

            if status == StatusCode::TOO_MANY_REQUESTS {
                return Err(TranscribeError::RateLimited(message));
            }
            return Err(TranscribeError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: TranscriptionResponse = serde_json::from_str(&body)
            .map_err(|e| TranscribeError::Other(format!("Failed to parse API response: {}", e)))?;

        parsed.text.ok_or(TranscribeError::EmptyResponse)
    }
}

/// Extract a readable message from an error response body
fn error_message(body: &str) -> String {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => envelope.error.message,
        Err(_) if body.trim().is_empty() => "no response body".to_string(),
        Err(_) => body.trim().to_string(),
    }
}

fn mime_for_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    match ext.as_deref() {
        Some("mp3") => "audio/mpeg",
        Some("wav") => "audio/wav",
        Some("m4a") | Some("mp4") => "audio/mp4",
        Some("ogg") | Some("oga") => "audio/ogg",
        Some("flac") => "audio/flac",
        Some("webm") => "audio/webm",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_config_default() {
        let config = HttpTranscriberConfig::default();
        assert_eq!(config.model, "whisper-1");
        assert_eq!(config.max_upload_bytes, 25 * 1024 * 1024);
        assert!(config.api_key.is_none());
    }

    #[test]
    fn test_mime_for_path() {
        assert_eq!(mime_for_path(&PathBuf::from("a/chunk_000.mp3")), "audio/mpeg");
        assert_eq!(mime_for_path(&PathBuf::from("chunk.WAV")), "audio/wav");
        assert_eq!(mime_for_path(&PathBuf::from("chunk")), "application/octet-stream");
    }

    #[test]
    fn test_error_message_extraction() {
        let body = r#"{"error":{"message":"Rate limit reached","type":"requests"}}"#;
        assert_eq!(error_message(body), "Rate limit reached");
        assert_eq!(error_message("  upstream down "), "upstream down");
        assert_eq!(error_message(""), "no response body");
    }

    #[tokio::test]
    async fn test_oversized_segment_is_rejected_locally() {
        let temp_dir = tempfile::tempdir().unwrap();
        let segment = temp_dir.path().join("chunk_000.mp3");
        tokio::fs::write(&segment, vec![0u8; 64]).await.unwrap();

        let transcriber = HttpTranscriber::new(HttpTranscriberConfig {
            endpoint: "http://127.0.0.1:9/unused".to_string(),
            max_upload_bytes: 16,
            ..Default::default()
        })
        .unwrap();

        let err = transcriber
            .transcribe(&segment, &TranscriptionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TranscribeError::TooLarge { size: 64, limit: 16 }));
    }
}
