use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{plan_segments, MediaSplitter, OutputFormat, SplitError, SplitOptions, SplitOutput};

/// Splits media with the `ffmpeg` / `ffprobe` command-line tools.
///
/// Binaries are taken from `FFMPEG_PATH` / `FFPROBE_PATH` when set, otherwise looked up
/// on `PATH`. Video inputs are handled directly: only the audio stream is rendered.
#[derive(Debug, Clone)]
pub struct FfmpegSplitter {
    ffmpeg: Option<PathBuf>,
    ffprobe: Option<PathBuf>,
    work_dir: PathBuf,
}

impl FfmpegSplitter {
    /// Create a splitter writing segments under `work_dir`
    pub fn new<P: Into<PathBuf>>(work_dir: P) -> Self {
        Self {
            ffmpeg: locate_binary("FFMPEG_PATH", "ffmpeg"),
            ffprobe: locate_binary("FFPROBE_PATH", "ffprobe"),
            work_dir: work_dir.into(),
        }
    }

    /// Create a splitter with explicit binary locations
    pub fn with_binaries<P: Into<PathBuf>>(
        ffmpeg: Option<PathBuf>,
        ffprobe: Option<PathBuf>,
        work_dir: P,
    ) -> Self {
        Self {
            ffmpeg,
            ffprobe,
            work_dir: work_dir.into(),
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    fn binaries(&self) -> Result<(&Path, &Path), SplitError> {
        match (&self.ffmpeg, &self.ffprobe) {
            (Some(ffmpeg), Some(ffprobe)) => Ok((ffmpeg, ffprobe)),
            (None, _) => Err(SplitError::Unavailable("ffmpeg not found".to_string())),
            (_, None) => Err(SplitError::Unavailable("ffprobe not found".to_string())),
        }
    }

    /// Total duration of `input` in seconds
    async fn probe_duration(&self, ffprobe: &Path, input: &Path) -> Result<f64, SplitError> {
        let output = Command::new(ffprobe)
            .args(["-v", "error", "-show_entries", "format=duration", "-of", "json"])
            .arg(input)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| SplitError::Probe(format!("failed to run ffprobe: {}", e)))?;

        if !output.status.success() {
            return Err(SplitError::Probe(format!(
                "ffprobe exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        parse_probe_duration(&output.stdout)
    }

    async fn render_segment(
        &self,
        ffmpeg: &Path,
        input: &Path,
        segment: &SegmentPlan,
        format: OutputFormat,
    ) -> Result<(), SplitError> {
        let index = segment.index;
        let mut cmd = Command::new(ffmpeg);
        cmd.args(["-hide_banner", "-loglevel", "error", "-y"])
            .arg("-ss")
            .arg(format!("{:.3}", segment.start_secs))
            .arg("-t")
            .arg(format!("{:.3}", segment.duration_secs))
            .arg("-i")
            .arg(input)
            .args(["-vn", "-ac", "1", "-ar", "16000"]);

        match format {
            OutputFormat::Mp3 => cmd.args(["-c:a", "libmp3lame", "-b:a", "64k"]),
            OutputFormat::Wav => cmd.args(["-c:a", "pcm_s16le"]),
        };

        let output = cmd
            .arg(&segment.output_path)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| SplitError::Segment {
                index,
                message: format!("failed to run ffmpeg: {}", e),
            })?;

        if !output.status.success() {
            return Err(SplitError::Segment {
                index,
                message: format!(
                    "ffmpeg exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        if !tokio::fs::try_exists(&segment.output_path).await? {
            return Err(SplitError::Segment {
                index,
                message: "ffmpeg produced no output".to_string(),
            });
        }

        Ok(())
    }

    async fn render_all(
        &self,
        ffmpeg: &Path,
        input: &Path,
        segments: &[SegmentPlan],
        options: &SplitOptions,
    ) -> Result<Vec<PathBuf>, SplitError> {
        let count = segments.len();
        let mut chunk_paths = Vec::with_capacity(count);

        for segment in segments {
            self.render_segment(ffmpeg, input, segment, options.output_format)
                .await?;

            let size = tokio::fs::metadata(&segment.output_path).await?.len();
            if size > options.target_chunk_bytes {
                warn!(
                    "Segment {} is {} bytes, above the {} byte target",
                    segment.index, size, options.target_chunk_bytes
                );
            }
            debug!("Rendered segment {}/{} ({} bytes)", segment.index + 1, count, size);
            chunk_paths.push(segment.output_path.clone());
        }

        Ok(chunk_paths)
    }
}

/// One segment to cut from the input
#[derive(Debug, Clone, PartialEq)]
struct SegmentPlan {
    index: usize,
    start_secs: f64,
    duration_secs: f64,
    output_path: PathBuf,
}

/// Lay out `count` segments of `segment_secs` over `total_secs` of media
fn segment_plans(
    out_dir: &Path,
    count: usize,
    segment_secs: f64,
    total_secs: f64,
    format: OutputFormat,
) -> Vec<SegmentPlan> {
    (0..count)
        .map(|index| {
            let start_secs = segment_secs * index as f64;
            // The last segment runs to the end so rounding never drops audio
            let duration_secs = if index + 1 == count {
                total_secs - start_secs
            } else {
                segment_secs
            };
            SegmentPlan {
                index,
                start_secs,
                duration_secs,
                output_path: out_dir.join(format!("chunk_{:03}.{}", index, format.extension())),
            }
        })
        .collect()
}

#[async_trait]
impl MediaSplitter for FfmpegSplitter {
    fn is_available(&self) -> bool {
        self.binaries().is_ok()
    }

    async fn split(&self, input: &Path, options: &SplitOptions) -> Result<SplitOutput, SplitError> {
        let (ffmpeg, ffprobe) = self.binaries()?;

        if !tokio::fs::try_exists(input).await? {
            return Err(SplitError::InputNotFound(input.to_path_buf()));
        }

        let total_secs = self.probe_duration(ffprobe, input).await?;
        let (count, segment_secs) =
            plan_segments(total_secs, options.target_chunk_bytes, options.output_format)?;

        let out_dir = self.work_dir.join(format!("split-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&out_dir).await?;

        info!(
            "Splitting {} ({:.1}s) into {} segments of {:.1}s",
            input.display(),
            total_secs,
            count,
            segment_secs
        );

        let segments =
            segment_plans(&out_dir, count, segment_secs, total_secs, options.output_format);
        match self.render_all(ffmpeg, input, &segments, options).await {
            Ok(chunk_paths) => Ok(SplitOutput {
                chunk_count: chunk_paths.len(),
                chunk_paths,
                total_duration_secs: total_secs,
                chunk_duration_secs: segment_secs,
            }),
            Err(e) => {
                if let Err(cleanup_err) = tokio::fs::remove_dir_all(&out_dir).await {
                    warn!(
                        "Failed to remove partial split output {}: {}",
                        out_dir.display(),
                        cleanup_err
                    );
                }
                Err(e)
            }
        }
    }
}

fn locate_binary(env_var: &str, name: &str) -> Option<PathBuf> {
    if let Ok(path) = std::env::var(env_var) {
        let path = PathBuf::from(path);
        if path.is_file() {
            return Some(path);
        }
        warn!("{} points to missing file {}", env_var, path.display());
    }
    which::which(name).ok()
}

/// Parse `ffprobe -show_entries format=duration -of json` output
fn parse_probe_duration(stdout: &[u8]) -> Result<f64, SplitError> {
    let value: serde_json::Value = serde_json::from_slice(stdout)
        .map_err(|e| SplitError::Probe(format!("invalid ffprobe output: {}", e)))?;

    let duration = value
        .get("format")
        .and_then(|format| format.get("duration"))
        .ok_or_else(|| SplitError::Probe("ffprobe reported no duration".to_string()))?;

    // ffprobe renders numbers as strings in JSON output
    let parsed = match duration {
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        serde_json::Value::Number(n) => n.as_f64(),
        _ => None,
    };

    parsed.ok_or_else(|| SplitError::Probe(format!("unparseable duration: {}", duration)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_probe_duration() {
        let out = br#"{"format": {"duration": "3600.512000"}}"#;
        assert_eq!(parse_probe_duration(out).unwrap(), 3600.512);

        let numeric = br#"{"format": {"duration": 12.5}}"#;
        assert_eq!(parse_probe_duration(numeric).unwrap(), 12.5);

        assert!(parse_probe_duration(br#"{"format": {}}"#).is_err());
        assert!(parse_probe_duration(b"not json").is_err());
        assert!(parse_probe_duration(br#"{"format": {"duration": "N/A"}}"#).is_err());
    }

    #[test]
    fn test_segment_plans_cover_whole_input() {
        let out_dir = Path::new("/work/split-1");
        let plans = segment_plans(out_dir, 3, 33.75, 100.0, OutputFormat::Mp3);

        assert_eq!(plans.len(), 3);
        assert_eq!(plans[0].output_path, out_dir.join("chunk_000.mp3"));
        assert_eq!(plans[2].output_path, out_dir.join("chunk_002.mp3"));
        assert_eq!(plans[1].start_secs, 33.75);
        assert_eq!(plans[1].duration_secs, 33.75);

        // Last segment absorbs the remainder
        assert_eq!(plans[2].start_secs, 67.5);
        assert_eq!(plans[2].duration_secs, 32.5);
        let covered: f64 = plans.iter().map(|plan| plan.duration_secs).sum();
        assert!((covered - 100.0).abs() < 1e-9);

        let single = segment_plans(out_dir, 1, 40.0, 12.0, OutputFormat::Wav);
        assert_eq!(single[0].duration_secs, 12.0);
        assert!(single[0].output_path.ends_with("chunk_000.wav"));
    }

    #[tokio::test]
    async fn test_missing_tools_make_splitter_unavailable() {
        let temp_dir = tempfile::tempdir().unwrap();
        let splitter = FfmpegSplitter::with_binaries(None, None, temp_dir.path());
        assert!(!splitter.is_available());

        let options = SplitOptions {
            target_chunk_bytes: 1024 * 1024,
            output_format: OutputFormat::Mp3,
        };
        let err = splitter
            .split(&temp_dir.path().join("in.mp3"), &options)
            .await
            .unwrap_err();
        assert!(matches!(err, SplitError::Unavailable(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_split_is_atomic_with_stub_tools() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = tempfile::tempdir().unwrap();
        let bin_dir = temp_dir.path().join("bin");
        let work_dir = temp_dir.path().join("work");
        std::fs::create_dir_all(&bin_dir).unwrap();

        let write_script = |name: &str, body: &str| {
            let path = bin_dir.join(name);
            std::fs::write(&path, body).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        };

        // 100 seconds of media
        let ffprobe = write_script(
            "ffprobe",
            "#!/bin/sh\necho '{\"format\": {\"duration\": \"100.0\"}}'\n",
        );
        // Writes a small file to its last argument; fails for the second segment when
        // FAIL_SEGMENT is present next to the script.
        let ffmpeg = write_script(
            "ffmpeg",
            &format!(
                "#!/bin/sh\nfor last; do :; done\ncase \"$last\" in\n  *chunk_001*) [ -f '{}' ] && exit 1 ;;\nesac\necho audio > \"$last\"\n",
                bin_dir.join("FAIL_SEGMENT").display()
            ),
        );

        let input = temp_dir.path().join("talk.mp4");
        std::fs::write(&input, b"media").unwrap();

        let splitter = FfmpegSplitter::with_binaries(Some(ffmpeg), Some(ffprobe), &work_dir);
        assert!(splitter.is_available());

        // 64 kbit/s => 8000 B/s; 300 kB * 0.9 / 8000 = 33.75s => 3 segments
        let options = SplitOptions {
            target_chunk_bytes: 300_000,
            output_format: OutputFormat::Mp3,
        };

        let output = splitter.split(&input, &options).await.unwrap();
        assert_eq!(output.chunk_count, 3);
        assert_eq!(output.chunk_paths.len(), 3);
        assert_eq!(output.total_duration_secs, 100.0);
        for path in &output.chunk_paths {
            assert!(path.exists());
        }
        assert!(output.chunk_paths[0].ends_with("chunk_000.mp3"));
        assert!(output.chunk_paths[2].ends_with("chunk_002.mp3"));

        // Now make the second segment fail: no split directory may remain.
        std::fs::write(bin_dir.join("FAIL_SEGMENT"), b"").unwrap();
        let before: Vec<_> = std::fs::read_dir(&work_dir).unwrap().collect();

        let err = splitter.split(&input, &options).await.unwrap_err();
        assert!(matches!(err, SplitError::Segment { index: 1, .. }));

        let after: Vec<_> = std::fs::read_dir(&work_dir).unwrap().collect();
        assert_eq!(before.len(), after.len());
    }
}
