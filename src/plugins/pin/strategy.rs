use crate::core::connectivity::{ensure_connected, ConnectivityProbe, Service};
use crate::core::error::DownloadError;
use crate::core::events::ProgressSink;
use crate::core::transfer::FileTransferService;
use crate::plugins::http::driver::HttpClient;
use crate::plugins::registry::{DownloadOutcome, PlatformStrategy, StrategyRequest};
use async_trait::async_trait;
use scraper::{Html, Selector};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "gif", "webp"];

/// `og:image` content, whether declared with `property` or `name`.
pub fn og_image(doc: &Html) -> Option<String> {
    let sel = Selector::parse(r#"meta[property="og:image"], meta[name="og:image"]"#).ok()?;
    doc.select(&sel)
        .filter_map(|m| m.value().attr("content"))
        .map(str::trim)
        .find(|c| !c.is_empty())
        .map(str::to_string)
}

/// First image URL found in the page's `application/ld+json` blocks.
pub fn ld_json_image(doc: &Html) -> Option<String> {
    let sel = Selector::parse(r#"script[type="application/ld+json"]"#).ok()?;
    doc.select(&sel).find_map(|script| {
        let text: String = script.text().collect();
        match serde_json::from_str::<Value>(text.trim()) {
            Ok(v) => image_in(&v),
            Err(e) => {
                tracing::debug!(error = %e, "skipping malformed ld+json block");
                None
            }
        }
    })
}

fn image_in(v: &Value) -> Option<String> {
    match v {
        Value::Array(items) => items.iter().find_map(image_in),
        Value::Object(map) => map
            .get("image")
            .and_then(image_url)
            .or_else(|| map.get("@graph").and_then(image_in)),
        _ => None,
    }
}

/// `image` may be a URL, a list of URLs, or an `ImageObject`.
fn image_url(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Array(items) => items.iter().find_map(image_url),
        Value::Object(map) => map
            .get("url")
            .or_else(|| map.get("contentUrl"))
            .and_then(image_url),
        _ => None,
    }
}

pub fn image_extension(image_url: &str) -> &'static str {
    url::Url::parse(image_url)
        .ok()
        .and_then(|u| {
            let path = u.path().to_ascii_lowercase();
            let ext = path.rsplit_once('.')?.1.to_string();
            IMAGE_EXTENSIONS.iter().find(|e| **e == ext).copied()
        })
        .unwrap_or("jpg")
}

pub struct ImagePinStrategy {
    http: Arc<dyn HttpClient>,
    transfer: FileTransferService,
    probe: Arc<dyn ConnectivityProbe>,
}

impl ImagePinStrategy {
    pub fn new(http: Arc<dyn HttpClient>, transfer: FileTransferService, probe: Arc<dyn ConnectivityProbe>) -> Self {
        Self { http, transfer, probe }
    }

    /// Direct image URL for a pin page, resolved against the page URL.
    pub async fn find_image(&self, page_url: &str) -> Result<String, DownloadError> {
        let html = self
            .http
            .get_text(page_url, &HashMap::new())
            .await
            .map_err(|e| DownloadError::other(format!("fetching pin page: {}", e)))?;

        let found = {
            let doc = Html::parse_document(&html);
            og_image(&doc).or_else(|| {
                tracing::debug!(url = %page_url, "no og:image, trying ld+json");
                ld_json_image(&doc)
            })
        };
        let raw = found.ok_or_else(|| DownloadError::other(format!("No image found on pin page {}", page_url)))?;

        let resolved = url::Url::parse(page_url)
            .and_then(|base| base.join(&raw))
            .map(|u| u.to_string())
            .unwrap_or(raw);
        Ok(resolved)
    }
}

#[async_trait]
impl PlatformStrategy for ImagePinStrategy {
    fn name(&self) -> &'static str {
        "image_pin"
    }

    fn service(&self) -> Service {
        Service::ImagePin
    }

    async fn download(&self, req: &StrategyRequest, sink: &ProgressSink) -> Result<DownloadOutcome, DownloadError> {
        ensure_connected(self.probe.as_ref(), Service::ImagePin).await?;

        let image = self.find_image(&req.url).await?;
        if req.cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        let mut target = req.destination.as_os_str().to_os_string();
        target.push(".");
        target.push(image_extension(&image));
        let target = PathBuf::from(target);

        let result = self.transfer.download_file(&image, &target, sink).await;
        match result.file_path {
            Some(path) if result.success => Ok(DownloadOutcome { files: vec![path], warnings: vec![] }),
            _ => Err(DownloadError::other(format!(
                "Failed to download pin image: {}",
                result.error.unwrap_or_default()
            ))),
        }
    }
}
