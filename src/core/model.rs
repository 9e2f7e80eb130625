use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

pub type ItemId = Uuid;
pub type BatchId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownloadStatus {
    Pending,
    Downloading,
    Completed,
    Failed,
    Paused,
    Cancelled,
}

impl DownloadStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ItemError {
    #[error("invalid url {0:?}: must start with http:// or https://")]
    InvalidUrl(String),

    #[error("item name must not be empty")]
    EmptyName,

    #[error("invalid quality {0:?}")]
    InvalidQuality(String),
}

/// Requested video quality, expressed as a height ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Quality {
    Highest,
    Lowest,
    MaxHeight(u32),
}

impl Default for Quality {
    fn default() -> Self {
        Quality::MaxHeight(720)
    }
}

impl std::str::FromStr for Quality {
    type Err = ItemError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let t = s.trim().to_ascii_lowercase();
        match t.as_str() {
            "highest" | "best" => return Ok(Quality::Highest),
            "lowest" | "worst" => return Ok(Quality::Lowest),
            _ => {}
        }
        t.strip_suffix('p')
            .unwrap_or(&t)
            .parse::<u32>()
            .ok()
            .filter(|h| *h > 0)
            .map(Quality::MaxHeight)
            .ok_or_else(|| ItemError::InvalidQuality(s.to_string()))
    }
}

impl std::fmt::Display for Quality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Quality::Highest => write!(f, "highest"),
            Quality::Lowest => write!(f, "lowest"),
            Quality::MaxHeight(h) => write!(f, "{}p", h),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CookieSource {
    File(PathBuf),
    Browser(String),
}

/// Platform-specific knobs. Strategies ignore the ones that don't apply to them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadOptions {
    pub quality: Quality,
    pub audio_only: bool,
    pub video_only: bool,
    pub playlist: bool,
    /// Keep the video and also write a separate audio file next to it.
    pub extract_audio: bool,
    pub subtitles: Vec<String>,
    pub cookies: Option<CookieSource>,
    /// Bytes per second, passed through to the extractor.
    pub rate_limit: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DownloadItem {
    pub id: ItemId,
    pub name: String,
    pub url: String,
    pub status: DownloadStatus,
    pub progress: f64,
    pub speed: f64,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub options: DownloadOptions,
}

impl DownloadItem {
    pub fn new(name: impl Into<String>, url: impl Into<String>, options: DownloadOptions) -> Result<Self, ItemError> {
        let name = name.into();
        let url = url.into();
        if name.trim().is_empty() {
            return Err(ItemError::EmptyName);
        }
        let trimmed = url.trim();
        if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
            return Err(ItemError::InvalidUrl(url));
        }

        Ok(Self {
            id: Uuid::new_v4(),
            name,
            url: trimmed.to_string(),
            status: DownloadStatus::Pending,
            progress: 0.0,
            speed: 0.0,
            created_at: Utc::now(),
            completed_at: None,
            error_message: None,
            options,
        })
    }

    pub fn with_defaults(name: impl Into<String>, url: impl Into<String>) -> Result<Self, ItemError> {
        Self::new(name, url, DownloadOptions::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_http_urls() {
        for bad in ["ftp://host/file", "youtube.com/watch?v=x", "", "  "] {
            let err = DownloadItem::with_defaults("clip", bad).unwrap_err();
            assert!(matches!(err, ItemError::InvalidUrl(_)), "{bad:?} -> {err:?}");
        }
    }

    #[test]
    fn accepts_http_and_https() {
        let a = DownloadItem::with_defaults("a", "http://example.com/x").unwrap();
        let b = DownloadItem::with_defaults("b", "https://example.com/x").unwrap();
        assert_eq!(a.status, DownloadStatus::Pending);
        assert_eq!(b.progress, 0.0);
        assert!(b.error_message.is_none());
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn rejects_empty_name() {
        assert_eq!(
            DownloadItem::with_defaults(" ", "https://example.com").unwrap_err(),
            ItemError::EmptyName
        );
    }

    #[test]
    fn parses_quality() {
        assert_eq!("720p".parse::<Quality>().unwrap(), Quality::MaxHeight(720));
        assert_eq!("1080".parse::<Quality>().unwrap(), Quality::MaxHeight(1080));
        assert_eq!("Highest".parse::<Quality>().unwrap(), Quality::Highest);
        assert_eq!("worst".parse::<Quality>().unwrap(), Quality::Lowest);
        assert!("0p".parse::<Quality>().is_err());
        assert!("hd".parse::<Quality>().is_err());
        assert_eq!(Quality::MaxHeight(480).to_string(), "480p");
    }
}
