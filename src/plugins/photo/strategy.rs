use crate::core::connectivity::{ensure_connected, ConnectivityProbe, Service};
use crate::core::error::DownloadError;
use crate::core::events::ProgressSink;
use crate::core::transfer::FileTransferService;
use crate::plugins::photo::api::{MediaNode, PostMedia};
use crate::plugins::photo::auth::AuthenticationManager;
use crate::plugins::registry::{DownloadOutcome, PlatformStrategy, StrategyRequest};
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const NO_CAPTION: &str = "No caption";

/// Shortcode from `/p/<code>/` or `/reel/<code>/`, optionally behind a profile segment.
pub fn extract_shortcode(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let segments: Vec<&str> = parsed.path_segments()?.filter(|s| !s.is_empty()).collect();
    segments
        .windows(2)
        .find(|w| matches!(w[0], "p" | "reel"))
        .map(|w| w[1].to_string())
}

fn suffixed(base: &Path, suffix: &str) -> PathBuf {
    let mut s: OsString = base.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

pub struct PhotoNetworkStrategy {
    auth: Arc<AuthenticationManager>,
    transfer: FileTransferService,
    probe: Arc<dyn ConnectivityProbe>,
}

impl PhotoNetworkStrategy {
    pub fn new(auth: Arc<AuthenticationManager>, transfer: FileTransferService, probe: Arc<dyn ConnectivityProbe>) -> Self {
        Self { auth, transfer, probe }
    }

    /// Carousel slides are `{base}_slide_{n}`, a single item is `{base}`.
    fn targets(base: &Path, media: &PostMedia) -> Vec<(MediaNode, PathBuf)> {
        match media {
            PostMedia::Single(node) => vec![(node.clone(), suffixed(base, &format!(".{}", node.extension())))],
            PostMedia::Carousel(nodes) => nodes
                .iter()
                .enumerate()
                .map(|(i, n)| (n.clone(), suffixed(base, &format!("_slide_{}.{}", i, n.extension()))))
                .collect(),
        }
    }
}

#[async_trait]
impl PlatformStrategy for PhotoNetworkStrategy {
    fn name(&self) -> &'static str {
        "photo_network"
    }

    fn service(&self) -> Service {
        Service::PhotoNetwork
    }

    async fn download(&self, req: &StrategyRequest, sink: &ProgressSink) -> Result<DownloadOutcome, DownloadError> {
        // No network traffic at all without a session.
        if !self.auth.is_authenticated() {
            return Err(DownloadError::AuthenticationRequired(
                "log in to the photo network before downloading".to_string(),
            ));
        }
        ensure_connected(self.probe.as_ref(), Service::PhotoNetwork).await?;

        let shortcode = extract_shortcode(&req.url)
            .ok_or_else(|| DownloadError::other(format!("Unsupported post URL: {}", req.url)))?;
        let post = self.auth.fetch_post(&shortcode).await?;

        if let Some(parent) = req.destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let targets = Self::targets(&req.destination, &post.media);
        let mut outcome = DownloadOutcome::default();
        for (i, (node, path)) in targets.iter().enumerate() {
            if req.cancel.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }
            let result = self.transfer.download_file(&node.url, path, &sink.part(i, targets.len())).await;
            match result.file_path {
                Some(p) if result.success => outcome.files.push(p),
                _ => {
                    let err = result.error.unwrap_or_default();
                    tracing::warn!(shortcode = %shortcode, index = i, error = %err, "post media failed");
                    outcome.warnings.push(format!("media item {} failed: {}", i, err));
                }
            }
        }

        let caption_path = suffixed(&req.destination, "_caption.txt");
        let caption = post.caption.as_deref().unwrap_or(NO_CAPTION);
        tokio::fs::write(&caption_path, caption).await?;

        if outcome.files.is_empty() {
            return Err(DownloadError::other(format!(
                "Failed to download media from post {}: {}",
                shortcode,
                outcome.warnings.join("; ")
            )));
        }
        outcome.files.push(caption_path);
        sink.finish();
        Ok(outcome)
    }
}
