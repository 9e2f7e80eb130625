//! Site extraction library seam and its `yt-dlp` implementation.

use crate::core::model::CookieSource;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookStatus {
    Downloading,
    Finished,
    Error,
}

/// One progress callback from the extractor.
#[derive(Debug, Clone, PartialEq)]
pub struct HookEvent {
    pub status: HookStatus,
    pub downloaded_bytes: Option<u64>,
    pub total_bytes: Option<u64>,
    pub total_bytes_estimate: Option<u64>,
    pub speed: Option<f64>,
    pub filename: Option<String>,
}

impl HookEvent {
    pub fn new(status: HookStatus) -> Self {
        Self {
            status,
            downloaded_bytes: None,
            total_bytes: None,
            total_bytes_estimate: None,
            speed: None,
            filename: None,
        }
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    /// Percentage when a size is known, preferring the exact total over the estimate.
    pub fn percent(&self) -> Option<f64> {
        let done = self.downloaded_bytes? as f64;
        let total = self.total_bytes.or(self.total_bytes_estimate).filter(|t| *t > 0)? as f64;
        Some((done / total * 100.0).min(100.0))
    }
}

pub type Hook<'a> = &'a (dyn Fn(&HookEvent) + Send + Sync);

/// Everything the extractor needs for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractOptions {
    /// Output template, e.g. `/dl/clip.%(ext)s`.
    pub output_template: String,
    pub format: String,
    pub playlist: bool,
    pub subtitles: Vec<String>,
    pub cookies: Option<CookieSource>,
    pub rate_limit: Option<u64>,
    pub retries: u32,
    pub fragment_retries: u32,
    pub extractor_retries: u32,
    pub socket_timeout_secs: u64,
    pub user_agent: Option<String>,
    /// Let the extractor transcode to mp3 after downloading the audio stream.
    pub extract_audio_mp3: bool,
    pub merge_output_format: Option<String>,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            output_template: "%(title)s.%(ext)s".to_string(),
            format: "best".to_string(),
            playlist: false,
            subtitles: vec![],
            cookies: None,
            rate_limit: None,
            retries: 3,
            fragment_retries: 3,
            extractor_retries: 3,
            socket_timeout_secs: 15,
            user_agent: None,
            extract_audio_mp3: false,
            merge_output_format: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatInfo {
    pub id: String,
    pub note: Option<String>,
    pub ext: Option<String>,
    pub height: Option<u32>,
}

impl std::fmt::Display for FormatInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id)?;
        let mut parts = vec![];
        if let Some(h) = self.height {
            parts.push(format!("{}p", h));
        }
        if let Some(n) = self.note.as_deref().filter(|n| !n.is_empty()) {
            parts.push(n.to_string());
        }
        if let Some(e) = &self.ext {
            parts.push(e.clone());
        }
        if !parts.is_empty() {
            write!(f, " ({})", parts.join(", "))?;
        }
        Ok(())
    }
}

/// Raw extractor failure. The text is what the retry policy classifies.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ExtractorError(pub String);

#[async_trait]
pub trait SiteExtractor: Send + Sync {
    async fn extract(&self, url: &str, opts: &ExtractOptions, hook: Hook<'_>) -> Result<(), ExtractorError>;

    async fn list_formats(&self, url: &str, opts: &ExtractOptions) -> Result<Vec<FormatInfo>, ExtractorError>;
}

const PROGRESS_PREFIX: &str = "[mg-progress] ";
const PROGRESS_TEMPLATE: &str = "download:[mg-progress] %(progress.status)s|%(progress.downloaded_bytes)s|%(progress.total_bytes)s|%(progress.total_bytes_estimate)s|%(progress.speed)s|%(progress.filename)s";

pub struct YtDlpExtractor {
    binary: PathBuf,
}

impl YtDlpExtractor {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self { binary: binary.into() }
    }

    fn common_args(opts: &ExtractOptions) -> Vec<String> {
        let mut args = vec![];
        if !opts.playlist {
            args.extend(["--no-playlist".to_string(), "--playlist-items".to_string(), "1".to_string()]);
        }
        match &opts.cookies {
            Some(CookieSource::File(p)) => {
                args.push("--cookies".to_string());
                args.push(p.to_string_lossy().into_owned());
            }
            Some(CookieSource::Browser(b)) => {
                args.push("--cookies-from-browser".to_string());
                args.push(b.clone());
            }
            None => {}
        }
        if let Some(ua) = &opts.user_agent {
            args.push("--user-agent".to_string());
            args.push(ua.clone());
        }
        args.push("--socket-timeout".to_string());
        args.push(opts.socket_timeout_secs.to_string());
        args
    }

    pub fn download_args(url: &str, opts: &ExtractOptions) -> Vec<String> {
        let mut args = vec![
            "--newline".to_string(),
            "--no-mtime".to_string(),
            "--progress-template".to_string(),
            PROGRESS_TEMPLATE.to_string(),
            "-o".to_string(),
            opts.output_template.clone(),
            "-f".to_string(),
            opts.format.clone(),
            "--retries".to_string(),
            opts.retries.to_string(),
            "--fragment-retries".to_string(),
            opts.fragment_retries.to_string(),
            "--extractor-retries".to_string(),
            opts.extractor_retries.to_string(),
        ];
        args.extend(Self::common_args(opts));

        if !opts.subtitles.is_empty() {
            args.push("--write-subs".to_string());
            args.push("--sub-langs".to_string());
            args.push(opts.subtitles.join(","));
        }
        if let Some(rate) = opts.rate_limit {
            args.push("--limit-rate".to_string());
            args.push(rate.to_string());
        }
        if opts.extract_audio_mp3 {
            args.extend(
                ["-x", "--audio-format", "mp3", "--audio-quality", "192K"]
                    .iter()
                    .map(|s| s.to_string()),
            );
        } else if let Some(fmt) = &opts.merge_output_format {
            args.push("--merge-output-format".to_string());
            args.push(fmt.clone());
        }

        args.push("--".to_string());
        args.push(url.to_string());
        args
    }
}

impl Default for YtDlpExtractor {
    fn default() -> Self {
        Self::new("yt-dlp")
    }
}

fn parse_num(s: &str) -> Option<f64> {
    let s = s.trim();
    if s.is_empty() || s == "NA" || s == "None" {
        return None;
    }
    s.parse::<f64>().ok().filter(|v| v.is_finite() && *v >= 0.0)
}

/// Turns one stdout line into a hook event, if it carries one.
pub fn parse_output_line(line: &str) -> Option<HookEvent> {
    let line = line.trim();

    if let Some(rest) = line.strip_prefix(PROGRESS_PREFIX) {
        let mut parts = rest.splitn(6, '|');
        let status = match parts.next()? {
            "downloading" => HookStatus::Downloading,
            "finished" => HookStatus::Finished,
            "error" => HookStatus::Error,
            _ => return None,
        };
        let downloaded_bytes = parts.next().and_then(parse_num).map(|v| v as u64);
        let total_bytes = parts.next().and_then(parse_num).map(|v| v as u64);
        let total_bytes_estimate = parts.next().and_then(parse_num).map(|v| v as u64);
        let speed = parts.next().and_then(parse_num);
        let filename = parts.next().map(str::trim).filter(|f| !f.is_empty() && *f != "NA").map(String::from);
        return Some(HookEvent { status, downloaded_bytes, total_bytes, total_bytes_estimate, speed, filename });
    }

    if let Some(rest) = line.strip_prefix("[download] Destination:") {
        return Some(HookEvent::new(HookStatus::Downloading).with_filename(rest.trim()));
    }
    if let Some(rest) = line.strip_prefix("[Merger] Merging formats into \"") {
        return Some(HookEvent::new(HookStatus::Finished).with_filename(rest.trim_end_matches('"')));
    }
    if let Some(rest) = line.strip_prefix("[ExtractAudio] Destination:") {
        return Some(HookEvent::new(HookStatus::Finished).with_filename(rest.trim()));
    }
    if let Some(rest) = line.strip_prefix("[download] ") {
        if let Some(path) = rest.strip_suffix(" has already been downloaded") {
            return Some(HookEvent::new(HookStatus::Finished).with_filename(path));
        }
    }
    None
}

/// Picks the most useful text out of the extractor's stderr.
fn error_text(stderr: &str, code: Option<i32>) -> String {
    let errors: Vec<&str> = stderr
        .lines()
        .map(str::trim)
        .filter(|l| l.starts_with("ERROR:"))
        .collect();
    if !errors.is_empty() {
        return errors.join("\n");
    }
    stderr
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .last()
        .map(String::from)
        .unwrap_or_else(|| match code {
            Some(c) => format!("yt-dlp exited with status {}", c),
            None => "yt-dlp was terminated by a signal".to_string(),
        })
}

pub fn parse_formats(json: &serde_json::Value) -> Vec<FormatInfo> {
    json.get("formats")
        .and_then(|f| f.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|f| {
                    Some(FormatInfo {
                        id: f.get("format_id")?.as_str()?.to_string(),
                        note: f.get("format_note").and_then(|v| v.as_str()).map(String::from),
                        ext: f.get("ext").and_then(|v| v.as_str()).map(String::from),
                        height: f.get("height").and_then(|v| v.as_u64()).map(|h| h as u32),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl SiteExtractor for YtDlpExtractor {
    async fn extract(&self, url: &str, opts: &ExtractOptions, hook: Hook<'_>) -> Result<(), ExtractorError> {
        let args = Self::download_args(url, opts);
        tracing::debug!(binary = %self.binary.display(), ?args, "spawning extractor");

        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExtractorError(format!("failed to start {}: {}", self.binary.display(), e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExtractorError("extractor stdout unavailable".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ExtractorError("extractor stderr unavailable".to_string()))?;

        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::trace!(target: "yt-dlp", "{}", line);
                buf.push_str(&line);
                buf.push('\n');
            }
            buf
        });

        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(evt) = parse_output_line(&line) {
                hook(&evt);
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| ExtractorError(format!("waiting for extractor failed: {}", e)))?;
        let stderr_text = stderr_task.await.unwrap_or_default();

        if status.success() {
            return Ok(());
        }
        let message = error_text(&stderr_text, status.code());
        hook(&HookEvent::new(HookStatus::Error));
        Err(ExtractorError(message))
    }

    async fn list_formats(&self, url: &str, opts: &ExtractOptions) -> Result<Vec<FormatInfo>, ExtractorError> {
        let mut args = vec!["-J".to_string(), "--skip-download".to_string()];
        args.extend(Self::common_args(opts));
        args.push("--".to_string());
        args.push(url.to_string());

        let output = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ExtractorError(format!("failed to start {}: {}", self.binary.display(), e)))?;
        if !output.status.success() {
            return Err(ExtractorError(error_text(&String::from_utf8_lossy(&output.stderr), output.status.code())));
        }

        let json: serde_json::Value =
            serde_json::from_slice(&output.stdout).map_err(|e| ExtractorError(format!("invalid format listing: {}", e)))?;
        Ok(parse_formats(&json))
    }
}
