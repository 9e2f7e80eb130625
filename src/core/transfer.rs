//! Streams a URL to disk through a `.part` staging file.

use crate::core::events::ProgressSink;
use crate::plugins::http::driver::HttpClient;
use futures::StreamExt;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

const MIB: f64 = 1024.0 * 1024.0;
/// Ceiling for the progress proxy used when the total size is unknown.
const INDETERMINATE_CAP: f64 = 99.0;

#[derive(Debug, Clone, PartialEq)]
pub struct TransferResult {
    pub success: bool,
    pub file_path: Option<PathBuf>,
    pub bytes_downloaded: u64,
    pub error: Option<String>,
    pub elapsed: Duration,
}

impl TransferResult {
    fn failed(error: impl Into<String>, started: Instant) -> Self {
        Self {
            success: false,
            file_path: None,
            bytes_downloaded: 0,
            error: Some(error.into()),
            elapsed: started.elapsed(),
        }
    }
}

pub fn part_path(save_path: &Path) -> PathBuf {
    let mut s = save_path.as_os_str().to_os_string();
    s.push(".part");
    PathBuf::from(s)
}

/// Percentage for `downloaded` bytes. With an unknown total the value grows by
/// one point per MiB and stays below 100 until the stream ends.
pub fn transfer_progress(downloaded: u64, total: Option<u64>) -> f64 {
    match total {
        Some(t) if t > 0 => (downloaded as f64 / t as f64 * 100.0).min(100.0),
        _ => (downloaded as f64 / MIB).min(INDETERMINATE_CAP),
    }
}

#[derive(Clone)]
pub struct FileTransferService {
    client: Arc<dyn HttpClient>,
    headers: HashMap<String, String>,
}

impl FileTransferService {
    pub fn new(client: Arc<dyn HttpClient>) -> Self {
        Self { client, headers: HashMap::new() }
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub async fn download_file(&self, url: &str, save_path: &Path, progress: &ProgressSink) -> TransferResult {
        let started = Instant::now();

        if let Some(parent) = save_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return TransferResult::failed(format!("failed to create directory {}: {}", parent.display(), e), started);
            }
        }

        let temp = part_path(save_path);
        match self.stream_to(url, &temp, progress).await {
            Ok(bytes) => {
                if let Err(e) = Self::promote(&temp, save_path).await {
                    remove_quietly(&temp).await;
                    return TransferResult::failed(format!("failed to finalize {}: {}", save_path.display(), e), started);
                }
                progress.finish();
                let elapsed = started.elapsed();
                tracing::info!(
                    path = %save_path.display(),
                    bytes,
                    secs = elapsed.as_secs_f64(),
                    "download completed"
                );
                TransferResult {
                    success: true,
                    file_path: Some(save_path.to_path_buf()),
                    bytes_downloaded: bytes,
                    error: None,
                    elapsed,
                }
            }
            Err(e) => {
                tracing::error!(url, error = %e, "download error");
                remove_quietly(&temp).await;
                TransferResult::failed(e, started)
            }
        }
    }

    async fn stream_to(&self, url: &str, temp: &Path, progress: &ProgressSink) -> Result<u64, String> {
        let resp = self.client.get_stream(url, &self.headers).await.map_err(|e| e.to_string())?;
        let total = resp.content_length;
        let mut body = resp.body;

        let mut file = File::create(temp)
            .await
            .map_err(|e| format!("create {}: {}", temp.display(), e))?;

        let start = Instant::now();
        let mut downloaded = 0u64;
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| e.to_string())?;
            if chunk.is_empty() {
                continue;
            }
            file.write_all(&chunk).await.map_err(|e| format!("write {}: {}", temp.display(), e))?;
            downloaded += chunk.len() as u64;

            let elapsed = start.elapsed().as_secs_f64();
            let speed = if elapsed > 0.0 { downloaded as f64 / elapsed } else { 0.0 };
            progress.report(transfer_progress(downloaded, total), speed);
        }

        file.flush().await.map_err(|e| format!("flush {}: {}", temp.display(), e))?;
        file.sync_all().await.map_err(|e| format!("sync {}: {}", temp.display(), e))?;
        Ok(downloaded)
    }

    async fn promote(temp: &Path, save_path: &Path) -> std::io::Result<()> {
        if tokio::fs::metadata(save_path).await.is_ok() {
            tokio::fs::remove_file(save_path).await?;
        }
        tokio::fs::rename(temp, save_path).await
    }
}

async fn remove_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "could not remove partial file"),
    }
}
