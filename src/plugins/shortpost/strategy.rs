use crate::core::connectivity::{ensure_connected, ConnectivityProbe, Service};
use crate::core::error::DownloadError;
use crate::core::events::ProgressSink;
use crate::core::transfer::FileTransferService;
use crate::plugins::http::driver::{get_json, HttpClient};
use crate::plugins::registry::{DownloadOutcome, PlatformStrategy, StrategyRequest};
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

pub const DEFAULT_API_BASE: &str = "https://api.vxtwitter.com";

fn post_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:twitter|x)\.com/.{1,15}/(?:web|status(?:es)?)/([0-9]{1,20})").expect("static regex")
    })
}

fn short_link_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"https?://t\.co/[A-Za-z0-9]+").expect("static regex"))
}

/// Numeric post ids in order of appearance, without duplicates.
pub fn extract_post_ids(text: &str) -> Vec<String> {
    let mut ids: Vec<String> = vec![];
    for cap in post_id_re().captures_iter(text) {
        let id = cap[1].to_string();
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    ids
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Gif,
    Video,
}

impl MediaKind {
    fn parse(s: &str) -> Self {
        match s {
            "video" => MediaKind::Video,
            "gif" => MediaKind::Gif,
            _ => MediaKind::Image,
        }
    }

    /// Animated "gifs" are served as mp4 clips.
    pub fn extension(self) -> &'static str {
        match self {
            MediaKind::Image => "jpg",
            MediaKind::Gif | MediaKind::Video => "mp4",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostMedia {
    pub url: String,
    pub kind: MediaKind,
}

#[derive(Deserialize)]
struct StatusPayload {
    #[serde(default)]
    media_extended: Vec<MediaEntry>,
}

#[derive(Deserialize)]
struct MediaEntry {
    url: String,
    #[serde(rename = "type", default)]
    kind: String,
}

pub struct ShortPostStrategy {
    http: Arc<dyn HttpClient>,
    transfer: FileTransferService,
    probe: Arc<dyn ConnectivityProbe>,
    api_base: String,
}

impl ShortPostStrategy {
    pub fn new(http: Arc<dyn HttpClient>, transfer: FileTransferService, probe: Arc<dyn ConnectivityProbe>) -> Self {
        Self { http, transfer, probe, api_base: DEFAULT_API_BASE.to_string() }
    }

    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into().trim_end_matches('/').to_string();
        self
    }

    /// Replaces every `t.co` link with where it redirects. Unresolvable links stay as they are.
    pub async fn expand_short_links(&self, text: &str) -> String {
        let mut out = text.to_string();
        let links: Vec<String> = short_link_re().find_iter(text).map(|m| m.as_str().to_string()).collect();
        for link in links {
            match self.http.resolve_redirect(&link).await {
                Ok(target) => {
                    tracing::debug!(from = %link, to = %target, "expanded short link");
                    out = out.replace(&link, &target);
                }
                Err(e) => tracing::warn!(link = %link, error = %e, "could not expand short link"),
            }
        }
        out
    }

    pub async fn fetch_media(&self, post_id: &str) -> Result<Vec<PostMedia>, DownloadError> {
        let url = format!("{}/Twitter/status/{}", self.api_base, post_id);
        let value = get_json(self.http.as_ref(), &url, &HashMap::new())
            .await
            .map_err(|e| DownloadError::other(format!("fetching post {}: {}", post_id, e)))?;
        let payload: StatusPayload = serde_json::from_value(value)
            .map_err(|e| DownloadError::other(format!("unexpected metadata for post {}: {}", post_id, e)))?;
        Ok(payload
            .media_extended
            .into_iter()
            .map(|m| PostMedia { url: m.url, kind: MediaKind::parse(&m.kind) })
            .collect())
    }

    fn media_path(base: &Path, index: usize, count: usize, kind: MediaKind) -> PathBuf {
        let mut s = base.as_os_str().to_os_string();
        if count > 1 {
            s.push(format!("_{}", index));
        }
        s.push(".");
        s.push(kind.extension());
        PathBuf::from(s)
    }

    async fn download_media(&self, media: &[PostMedia], base: &Path, sink: &ProgressSink) -> DownloadOutcome {
        let mut outcome = DownloadOutcome::default();
        for (i, m) in media.iter().enumerate() {
            let path = Self::media_path(base, i, media.len(), m.kind);
            let result = self.transfer.download_file(&m.url, &path, &sink.part(i, media.len())).await;
            match result.file_path {
                Some(p) if result.success => outcome.files.push(p),
                _ => {
                    let err = result.error.unwrap_or_default();
                    tracing::warn!(index = i, url = %m.url, error = %err, "media item failed");
                    outcome.warnings.push(format!("media item {} failed: {}", i, err));
                }
            }
        }
        outcome
    }
}

#[async_trait]
impl PlatformStrategy for ShortPostStrategy {
    fn name(&self) -> &'static str {
        "short_post"
    }

    fn service(&self) -> Service {
        Service::ShortPost
    }

    async fn download(&self, req: &StrategyRequest, sink: &ProgressSink) -> Result<DownloadOutcome, DownloadError> {
        ensure_connected(self.probe.as_ref(), Service::ShortPost).await?;

        let text = self.expand_short_links(&req.url).await;
        let ids = extract_post_ids(&text);
        if ids.is_empty() {
            return Err(DownloadError::other(format!("No post IDs found in URL: {}", req.url)));
        }

        for id in &ids {
            if req.cancel.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }
            let media = match self.fetch_media(id).await {
                Ok(m) if !m.is_empty() => m,
                Ok(_) => {
                    tracing::info!(post_id = %id, "post has no media");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(post_id = %id, error = %e, "post metadata unavailable");
                    continue;
                }
            };

            // The first post that has media is the one we download.
            let outcome = self.download_media(&media, &req.destination, sink).await;
            if outcome.files.is_empty() {
                return Err(DownloadError::other(format!(
                    "Failed to download media from post {}: {}",
                    id,
                    outcome.warnings.join("; ")
                )));
            }
            sink.finish();
            return Ok(outcome);
        }

        Err(DownloadError::other(format!("No media found in post(s) {}", ids.join(", "))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connectivity::ConnectionResult;
    use crate::core::model::DownloadOptions;
    use crate::plugins::http::driver::ReqwestClient;
    use crate::plugins::registry::DriverContext;
    use mockito::Server;
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio_util::sync::CancellationToken;

    struct Up;

    #[async_trait]
    impl ConnectivityProbe for Up {
        async fn check(&self, _s: Service) -> ConnectionResult {
            ConnectionResult::connected(Duration::ZERO)
        }
    }

    fn strategy(api: &str) -> ShortPostStrategy {
        let http: Arc<dyn HttpClient> = Arc::new(
            ReqwestClient::new(DriverContext { retries: 0, retry_backoff_ms: 1, ..Default::default() }).unwrap(),
        );
        ShortPostStrategy::new(http.clone(), FileTransferService::new(http), Arc::new(Up)).with_api_base(api)
    }

    fn request(url: &str, dest: PathBuf) -> StrategyRequest {
        StrategyRequest { url: url.into(), destination: dest, options: DownloadOptions::default(), cancel: CancellationToken::new() }
    }

    #[test]
    fn extracts_and_dedupes_ids() {
        let text = "https://x.com/someone/status/123?s=20 https://twitter.com/other/statuses/456 https://x.com/someone/status/123";
        assert_eq!(extract_post_ids(text), vec!["123", "456"]);
        assert!(extract_post_ids("https://x.com/home").is_empty());
    }

    #[test]
    fn names_follow_media_count() {
        let base = Path::new("/dl/post");
        assert_eq!(ShortPostStrategy::media_path(base, 0, 1, MediaKind::Video), PathBuf::from("/dl/post.mp4"));
        assert_eq!(ShortPostStrategy::media_path(base, 2, 3, MediaKind::Image), PathBuf::from("/dl/post_2.jpg"));
        assert_eq!(MediaKind::parse("gif").extension(), "mp4");
    }

    #[tokio::test]
    async fn downloads_every_media_item_of_first_post() {
        let mut server = Server::new_async().await;
        let body = serde_json::json!({
            "media_extended": [
                {"url": format!("{}/m/a.jpg", server.url()), "type": "image"},
                {"url": format!("{}/m/b.mp4", server.url()), "type": "video"}
            ]
        });
        server
            .mock("GET", "/Twitter/status/111")
            .with_header("content-type", "application/json")
            .with_body(body.to_string())
            .create_async()
            .await;
        let second = server.mock("GET", "/Twitter/status/222").expect(0).create_async().await;
        server.mock("GET", "/m/a.jpg").with_body("jpeg").create_async().await;
        server.mock("GET", "/m/b.mp4").with_body("video").create_async().await;

        let dir = tempdir().unwrap();
        let req = request("https://x.com/a/status/111 https://x.com/b/status/222", dir.path().join("post"));
        let out = strategy(&server.url()).download(&req, &ProgressSink::noop()).await.unwrap();

        assert_eq!(out.files, vec![dir.path().join("post_0.jpg"), dir.path().join("post_1.mp4")]);
        assert_eq!(std::fs::read_to_string(dir.path().join("post_1.mp4")).unwrap(), "video");
        second.assert_async().await;
    }

    #[tokio::test]
    async fn partial_failure_still_succeeds() {
        let mut server = Server::new_async().await;
        let body = serde_json::json!({
            "media_extended": [
                {"url": format!("{}/m/ok.jpg", server.url()), "type": "image"},
                {"url": format!("{}/m/gone.jpg", server.url()), "type": "image"}
            ]
        });
        server.mock("GET", "/Twitter/status/7").with_body(body.to_string()).create_async().await;
        server.mock("GET", "/m/ok.jpg").with_body("x").create_async().await;
        server.mock("GET", "/m/gone.jpg").with_status(404).create_async().await;

        let dir = tempdir().unwrap();
        let req = request("https://twitter.com/a/status/7", dir.path().join("p"));
        let out = strategy(&server.url()).download(&req, &ProgressSink::noop()).await.unwrap();
        assert_eq!(out.files.len(), 1);
        assert_eq!(out.warnings.len(), 1);
    }

    #[tokio::test]
    async fn skips_posts_without_media() {
        let mut server = Server::new_async().await;
        server.mock("GET", "/Twitter/status/1").with_body(r#"{"media_extended": []}"#).create_async().await;
        server.mock("GET", "/Twitter/status/2").with_status(500).create_async().await;

        let dir = tempdir().unwrap();
        let req = request("https://x.com/a/status/1 https://x.com/a/status/2", dir.path().join("p"));
        let err = strategy(&server.url()).download(&req, &ProgressSink::noop()).await.unwrap_err();
        assert!(err.to_string().contains("No media found"), "{err}");
    }

    #[tokio::test]
    async fn url_without_ids_is_rejected() {
        let dir = tempdir().unwrap();
        let req = request("https://x.com/someone", dir.path().join("p"));
        let err = strategy("http://127.0.0.1:9").download(&req, &ProgressSink::noop()).await.unwrap_err();
        assert!(err.to_string().contains("No post IDs"));
    }
}
