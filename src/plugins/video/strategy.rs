//! Video site downloads through the site extraction library.
//!
//! Flow per item: connectivity check, format selection, extraction with the
//! retry policy, on-disk verification, then optional audio post-processing.

use crate::core::connectivity::{ensure_connected, ConnectivityProbe, Service};
use crate::core::error::{DownloadError, FormatExhaustion};
use crate::core::events::ProgressSink;
use crate::core::model::{DownloadOptions, Quality};
use crate::core::retry::{classify, friendly_message, ErrorClass, RetryDecision, RetryPolicy, FORMAT_LADDER};
use crate::plugins::registry::{DownloadOutcome, PlatformStrategy, StrategyRequest};
use crate::plugins::video::audio::AudioPostProcessor;
use crate::plugins::video::extractor::{ExtractOptions, ExtractorError, HookEvent, HookStatus, SiteExtractor};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

const MAX_LISTED_FORMATS: usize = 10;

/// Format-selection expression for the requested quality and stream flags.
pub fn format_selector(opts: &DownloadOptions) -> String {
    if opts.audio_only {
        return "bestaudio/best".to_string();
    }
    if opts.video_only {
        return match opts.quality {
            Quality::Highest => "bestvideo".to_string(),
            Quality::Lowest => "worstvideo".to_string(),
            Quality::MaxHeight(h) => format!("bestvideo[height<={h}]/bestvideo"),
        };
    }
    match opts.quality {
        Quality::Highest => "bestvideo+bestaudio/best".to_string(),
        Quality::Lowest => "worstvideo+worstaudio/worst".to_string(),
        Quality::MaxHeight(h) => format!("bestvideo[height<={h}]+bestaudio/best[height<={h}]/best"),
    }
}

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut s = base.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

pub struct VideoSiteStrategy {
    extractor: Arc<dyn SiteExtractor>,
    probe: Arc<dyn ConnectivityProbe>,
    audio: Arc<dyn AudioPostProcessor>,
    policy: RetryPolicy,
    user_agent: Option<String>,
}

impl VideoSiteStrategy {
    pub fn new(
        extractor: Arc<dyn SiteExtractor>,
        probe: Arc<dyn ConnectivityProbe>,
        audio: Arc<dyn AudioPostProcessor>,
        policy: RetryPolicy,
    ) -> Self {
        Self { extractor, probe, audio, policy, user_agent: None }
    }

    pub fn with_user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = Some(ua.into());
        self
    }

    fn extract_options(&self, req: &StrategyRequest) -> ExtractOptions {
        let o = &req.options;
        let base = req.destination.to_string_lossy();
        let output_template = if o.playlist {
            format!("{}_%(playlist_index)03d.%(ext)s", base)
        } else {
            format!("{}.%(ext)s", base)
        };
        ExtractOptions {
            output_template,
            format: format_selector(o),
            playlist: o.playlist,
            subtitles: o.subtitles.clone(),
            cookies: o.cookies.clone(),
            rate_limit: o.rate_limit,
            user_agent: self.user_agent.clone(),
            extract_audio_mp3: o.audio_only,
            merge_output_format: (!o.audio_only && !o.video_only).then(|| "mp4".to_string()),
            ..ExtractOptions::default()
        }
    }

    /// Single-file downloads land exactly here; playlists only report through the hook.
    fn expected_output(req: &StrategyRequest) -> Option<PathBuf> {
        if req.options.playlist {
            return None;
        }
        let ext = if req.options.audio_only { ".mp3" } else { ".mp4" };
        Some(with_suffix(&req.destination, ext))
    }

    /// One extractor run. Returns the filenames the hook reported as finished.
    async fn run_once(&self, url: &str, opts: &ExtractOptions, sink: &ProgressSink) -> Result<Vec<PathBuf>, ExtractorError> {
        let files: Mutex<Vec<PathBuf>> = Mutex::new(Vec::new());
        let hook_error = AtomicBool::new(false);
        let started = Instant::now();

        let hook = |evt: &HookEvent| match evt.status {
            HookStatus::Downloading => {
                if let Some(p) = evt.percent() {
                    let speed = evt.speed.unwrap_or_else(|| {
                        let secs = started.elapsed().as_secs_f64();
                        match evt.downloaded_bytes {
                            Some(d) if secs > 0.0 => d as f64 / secs,
                            _ => 0.0,
                        }
                    });
                    // 100 is reserved for after verification.
                    sink.report(p.min(99.0), speed);
                }
            }
            HookStatus::Finished => {
                if let Some(f) = &evt.filename {
                    files.lock().push(PathBuf::from(f));
                }
            }
            HookStatus::Error => hook_error.store(true, Ordering::SeqCst),
        };

        self.extractor.extract(url, opts, &hook).await?;
        if hook_error.load(Ordering::SeqCst) {
            return Err(ExtractorError("extractor reported an error during download".to_string()));
        }
        Ok(files.into_inner())
    }

    /// Confirms something real is on disk. A leftover `.part`/`.temp` with no
    /// final file means the transfer was cut short.
    async fn verify(expected: Option<&Path>, reported: &[PathBuf]) -> Result<Vec<PathBuf>, DownloadError> {
        let mut candidates: Vec<PathBuf> = expected.map(Path::to_path_buf).into_iter().collect();
        for r in reported {
            if !candidates.contains(r) {
                candidates.push(r.clone());
            }
        }

        let mut found = vec![];
        let mut empty = vec![];
        for c in &candidates {
            match tokio::fs::metadata(c).await {
                Ok(m) if m.is_file() && m.len() > 0 => found.push(c.clone()),
                Ok(_) => empty.push(c.clone()),
                Err(_) => {}
            }
        }
        if !found.is_empty() {
            return Ok(found);
        }

        for c in &candidates {
            for suffix in [".part", ".temp"] {
                let partial = with_suffix(c, suffix);
                if tokio::fs::metadata(&partial).await.is_ok() {
                    return Err(DownloadError::Verification(format!(
                        "extractor reported success but only a partial file remains: {}",
                        partial.display()
                    )));
                }
            }
        }
        if let Some(e) = empty.first() {
            return Err(DownloadError::Verification(format!("output file is empty: {}", e.display())));
        }
        let what = expected
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "any playlist entry".to_string());
        Err(DownloadError::Verification(format!(
            "extractor reported success but no output file was written ({})",
            what
        )))
    }

    async fn fatal(&self, class: ErrorClass, attempt: u32, raw: String, url: &str, opts: &ExtractOptions, tried: &[String]) -> DownloadError {
        let attempts = attempt + 1;
        match class {
            ErrorClass::RateLimit => DownloadError::RateLimit { attempts, message: raw },
            ErrorClass::Network => DownloadError::TransientNetwork { attempts, message: raw },
            ErrorClass::Format => {
                let listing = match self.extractor.list_formats(url, opts).await {
                    Ok(formats) if !formats.is_empty() => {
                        let shown: Vec<String> = formats.iter().take(MAX_LISTED_FORMATS).map(|f| f.to_string()).collect();
                        for f in &shown {
                            tracing::info!(url, format = %f, "available format");
                        }
                        format!("available formats: {}", shown.join("; "))
                    }
                    Ok(_) => "no formats listed".to_string(),
                    Err(e) => format!("could not list formats: {}", e),
                };
                // `tried` holds the original selector plus each fallback used.
                let reason = if tried.len() > FORMAT_LADDER.len() {
                    FormatExhaustion::Ladder
                } else {
                    FormatExhaustion::Attempts
                };
                DownloadError::FormatUnavailable {
                    reason,
                    tried: tried.join(", "),
                    message: format!("{} ({})", raw, listing),
                }
            }
            ErrorClass::Other => match friendly_message(&raw) {
                Some(friendly) => DownloadError::Other(format!("{} ({})", friendly, raw)),
                None => DownloadError::Other(raw),
            },
        }
    }

    async fn post_process(&self, req: &StrategyRequest, files: &[PathBuf]) -> Vec<String> {
        let mut warnings = vec![];
        if !req.options.extract_audio || req.options.audio_only {
            return warnings;
        }
        for video in files {
            let output = video.with_extension("mp3");
            match self.audio.extract_audio(video, &output).await {
                Ok(()) => tracing::info!(output = %output.display(), "audio extracted"),
                Err(e) => {
                    tracing::warn!(video = %video.display(), error = %e, "audio extraction failed; keeping video");
                    warnings.push(format!("audio extraction failed for {}: {}", video.display(), e));
                }
            }
        }
        warnings
    }
}

#[async_trait]
impl PlatformStrategy for VideoSiteStrategy {
    fn name(&self) -> &'static str {
        "video"
    }

    fn service(&self) -> Service {
        Service::VideoSite
    }

    async fn download(&self, req: &StrategyRequest, sink: &ProgressSink) -> Result<DownloadOutcome, DownloadError> {
        ensure_connected(self.probe.as_ref(), Service::VideoSite).await?;

        if let Some(parent) = req.destination.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut opts = self.extract_options(req);
        let mut tried = vec![opts.format.clone()];
        let expected = Self::expected_output(req);

        for attempt in 0..self.policy.max_attempts {
            if req.cancel.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }
            tracing::info!(url = %req.url, attempt = attempt + 1, max = self.policy.max_attempts, format = %opts.format, "extracting");

            let raw = match self.run_once(&req.url, &opts, sink).await {
                Ok(reported) => {
                    let files = Self::verify(expected.as_deref(), &reported).await?;
                    let warnings = self.post_process(req, &files).await;
                    sink.finish();
                    return Ok(DownloadOutcome { files, warnings });
                }
                Err(e) => e.0,
            };

            let class = classify(&raw);
            match self.policy.decide(class, attempt) {
                RetryDecision::Retry { delay, format } => {
                    if let Some(f) = format {
                        tracing::warn!(url = %req.url, from = %opts.format, to = f, "format not available, falling back");
                        opts.format = f.to_string();
                        tried.push(f.to_string());
                    } else {
                        tracing::warn!(url = %req.url, class = ?class, delay_ms = delay.as_millis() as u64, error = %raw, "retrying");
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = req.cancel.cancelled() => return Err(DownloadError::Cancelled),
                    }
                }
                RetryDecision::Fatal => {
                    let err = self.fatal(class, attempt, raw, &req.url, &opts, &tried).await;
                    tracing::error!(url = %req.url, error = %err, "video download failed");
                    return Err(err);
                }
            }
        }

        Err(DownloadError::other("no download attempts were made"))
    }
}
