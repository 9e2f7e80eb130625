use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PostProcessError {
    #[error("source file does not exist: {0}")]
    MissingSource(PathBuf),

    #[error("ffmpeg failed: {0}")]
    Failed(String),

    #[error("audio file is missing or empty: {0}")]
    EmptyOutput(PathBuf),
}

#[async_trait]
pub trait AudioPostProcessor: Send + Sync {
    async fn extract_audio(&self, video: &Path, output: &Path) -> Result<(), PostProcessError>;
}

/// Local audio extraction: stream copy first, re-encode if the container won't take the codec.
pub struct FfmpegAudioExtractor {
    binary: PathBuf,
    codec: String,
    bitrate: String,
    timeout: Duration,
}

impl Default for FfmpegAudioExtractor {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("ffmpeg"),
            codec: "libmp3lame".to_string(),
            bitrate: "192k".to_string(),
            timeout: Duration::from_secs(300),
        }
    }
}

impl FfmpegAudioExtractor {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self { binary: binary.into(), ..Self::default() }
    }

    fn copy_args(video: &Path, output: &Path) -> Vec<String> {
        vec![
            "-i".into(),
            video.to_string_lossy().into_owned(),
            "-vn".into(),
            "-acodec".into(),
            "copy".into(),
            "-y".into(),
            output.to_string_lossy().into_owned(),
        ]
    }

    fn encode_args(&self, video: &Path, output: &Path) -> Vec<String> {
        vec![
            "-i".into(),
            video.to_string_lossy().into_owned(),
            "-vn".into(),
            "-acodec".into(),
            self.codec.clone(),
            "-ab".into(),
            self.bitrate.clone(),
            "-y".into(),
            output.to_string_lossy().into_owned(),
        ]
    }

    async fn run(&self, args: &[String]) -> Result<(), String> {
        let fut = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();
        let output = match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(o)) => o,
            Ok(Err(e)) => return Err(format!("failed to start {}: {}", self.binary.display(), e)),
            Err(_) => return Err(format!("timed out after {}s", self.timeout.as_secs())),
        };
        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(stderr.lines().last().unwrap_or("unknown error").trim().to_string())
        }
    }
}

#[async_trait]
impl AudioPostProcessor for FfmpegAudioExtractor {
    async fn extract_audio(&self, video: &Path, output: &Path) -> Result<(), PostProcessError> {
        if tokio::fs::metadata(video).await.is_err() {
            return Err(PostProcessError::MissingSource(video.to_path_buf()));
        }

        tracing::info!(video = %video.display(), output = %output.display(), "extracting audio");
        if let Err(e) = self.run(&Self::copy_args(video, output)).await {
            tracing::debug!(error = %e, "stream copy failed, re-encoding");
            self.run(&self.encode_args(video, output)).await.map_err(PostProcessError::Failed)?;
        }

        match tokio::fs::metadata(output).await {
            Ok(m) if m.len() > 0 => Ok(()),
            _ => Err(PostProcessError::EmptyOutput(output.to_path_buf())),
        }
    }
}
