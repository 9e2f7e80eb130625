//! Photo network web client: session login and post metadata.

use crate::plugins::http::driver::HttpError;
use crate::plugins::registry::DriverContext;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, COOKIE, REFERER, SET_COOKIE, USER_AGENT};
use serde_json::Value;
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://www.instagram.com";
const WEB_APP_ID: &str = "936619743392459";
const SHORTCODE_ALPHABET: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";

/// Process-lifetime login state. Never written to disk.
#[derive(Clone, PartialEq, Eq)]
pub struct PhotoSession {
    pub username: String,
    pub session_id: String,
    pub csrf_token: String,
}

impl std::fmt::Debug for PhotoSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhotoSession")
            .field("username", &self.username)
            .field("session_id", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaNode {
    pub is_video: bool,
    pub url: String,
}

impl MediaNode {
    pub fn extension(&self) -> &'static str {
        if self.is_video {
            "mp4"
        } else {
            "jpg"
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostMedia {
    Single(MediaNode),
    Carousel(Vec<MediaNode>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhotoPost {
    pub shortcode: String,
    pub caption: Option<String>,
    pub media: PostMedia,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PhotoApiError {
    #[error("login rejected: {0}")]
    BadCredentials(String),

    #[error("session is not authorized")]
    Unauthorized,

    #[error("post not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Http(#[from] HttpError),

    #[error("unexpected response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for PhotoApiError {
    fn from(e: reqwest::Error) -> Self {
        PhotoApiError::Http(e.into())
    }
}

#[async_trait]
pub trait PhotoApi: Send + Sync {
    async fn login(&self, username: &str, password: &str) -> Result<PhotoSession, PhotoApiError>;

    async fn fetch_post(&self, session: &PhotoSession, shortcode: &str) -> Result<PhotoPost, PhotoApiError>;
}

/// Shortcodes are the media id written in a url-safe base64 alphabet.
pub fn shortcode_to_media_id(shortcode: &str) -> Option<u64> {
    if shortcode.is_empty() {
        return None;
    }
    shortcode.chars().try_fold(0u64, |acc, c| {
        let digit = SHORTCODE_ALPHABET.find(c)? as u64;
        acc.checked_mul(64)?.checked_add(digit)
    })
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(|v| v.split(';').next())
        .filter_map(|kv| kv.split_once('='))
        .find(|(k, _)| k.trim() == name)
        .map(|(_, v)| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn node_from_item(item: &Value) -> Option<MediaNode> {
    let is_video = item.get("media_type").and_then(Value::as_u64) == Some(2);
    let url = if is_video {
        item.pointer("/video_versions/0/url")
    } else {
        item.pointer("/image_versions2/candidates/0/url")
    }?
    .as_str()?
    .to_string();
    Some(MediaNode { is_video, url })
}

/// Parses a `media/{id}/info` payload.
pub fn parse_post(shortcode: &str, json: &Value) -> Result<PhotoPost, PhotoApiError> {
    let item = json
        .pointer("/items/0")
        .ok_or_else(|| PhotoApiError::Decode("no items in media info".to_string()))?;

    let caption = item
        .pointer("/caption/text")
        .and_then(Value::as_str)
        .map(str::to_string)
        .filter(|c| !c.trim().is_empty());

    let media = match item.get("carousel_media").and_then(Value::as_array) {
        Some(children) => {
            let nodes: Vec<MediaNode> = children.iter().filter_map(node_from_item).collect();
            if nodes.is_empty() {
                return Err(PhotoApiError::Decode("carousel without media".to_string()));
            }
            PostMedia::Carousel(nodes)
        }
        None => PostMedia::Single(
            node_from_item(item).ok_or_else(|| PhotoApiError::Decode("post without media url".to_string()))?,
        ),
    };

    Ok(PhotoPost { shortcode: shortcode.to_string(), caption, media })
}

pub struct InstagramWebApi {
    client: reqwest::Client,
    base: String,
    user_agent: String,
}

impl InstagramWebApi {
    pub fn new(ctx: &DriverContext) -> Result<Self, PhotoApiError> {
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(Duration::from_secs(ctx.timeout_secs.max(1)))
            .build()?;
        Ok(Self { client, base: DEFAULT_BASE_URL.to_string(), user_agent: ctx.user_agent.clone() })
    }

    pub fn with_base_url(mut self, base: impl Into<String>) -> Self {
        self.base = base.into().trim_end_matches('/').to_string();
        self
    }

    fn web_headers(&self, csrf: &str) -> Result<HeaderMap, PhotoApiError> {
        let bad = |e: reqwest::header::InvalidHeaderValue| PhotoApiError::Http(HttpError::Header(e.to_string()));
        let mut h = HeaderMap::new();
        h.insert(USER_AGENT, HeaderValue::from_str(&self.user_agent).map_err(bad)?);
        h.insert("X-IG-App-ID", HeaderValue::from_static(WEB_APP_ID));
        h.insert("X-Requested-With", HeaderValue::from_static("XMLHttpRequest"));
        h.insert("X-CSRFToken", HeaderValue::from_str(csrf).map_err(bad)?);
        h.insert(REFERER, HeaderValue::from_str(&format!("{}/", self.base)).map_err(bad)?);
        Ok(h)
    }
}

#[async_trait]
impl PhotoApi for InstagramWebApi {
    async fn login(&self, username: &str, password: &str) -> Result<PhotoSession, PhotoApiError> {
        let page = self
            .client
            .get(format!("{}/accounts/login/", self.base))
            .header(USER_AGENT, self.user_agent.as_str())
            .send()
            .await?;
        let csrf = cookie_value(page.headers(), "csrftoken")
            .ok_or_else(|| PhotoApiError::Decode("login page did not set a csrf token".to_string()))?;

        let enc_password = format!("#PWD_INSTAGRAM_BROWSER:0:{}:{}", chrono::Utc::now().timestamp(), password);
        let resp = self
            .client
            .post(format!("{}/api/v1/web/accounts/login/ajax/", self.base))
            .headers(self.web_headers(&csrf)?)
            .form(&[("username", username), ("enc_password", enc_password.as_str()), ("queryParams", "{}")])
            .send()
            .await?;

        let headers = resp.headers().clone();
        let status = resp.status();
        let body: Value = resp.json().await.unwrap_or(Value::Null);

        if body.get("two_factor_required").and_then(Value::as_bool) == Some(true) {
            return Err(PhotoApiError::BadCredentials("two-factor authentication is required".to_string()));
        }
        if body.get("checkpoint_url").is_some() {
            return Err(PhotoApiError::BadCredentials("account checkpoint required; confirm the login in the app".to_string()));
        }
        if !status.is_success() || body.get("authenticated").and_then(Value::as_bool) != Some(true) {
            let msg = body
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("username or password is incorrect");
            return Err(PhotoApiError::BadCredentials(msg.to_string()));
        }

        let session_id = cookie_value(&headers, "sessionid")
            .ok_or_else(|| PhotoApiError::Decode("login succeeded without a session cookie".to_string()))?;
        let csrf_token = cookie_value(&headers, "csrftoken").unwrap_or(csrf);
        tracing::info!(username, "photo network login succeeded");
        Ok(PhotoSession { username: username.to_string(), session_id, csrf_token })
    }

    async fn fetch_post(&self, session: &PhotoSession, shortcode: &str) -> Result<PhotoPost, PhotoApiError> {
        let media_id = shortcode_to_media_id(shortcode)
            .ok_or_else(|| PhotoApiError::NotFound(format!("invalid shortcode {:?}", shortcode)))?;

        let mut headers = self.web_headers(&session.csrf_token)?;
        let cookie = format!("sessionid={}; csrftoken={}", session.session_id, session.csrf_token);
        headers.insert(
            COOKIE,
            HeaderValue::from_str(&cookie).map_err(|e| PhotoApiError::Http(HttpError::Header(e.to_string())))?,
        );

        let resp = self
            .client
            .get(format!("{}/api/v1/media/{}/info/", self.base, media_id))
            .headers(headers)
            .send()
            .await?;
        match resp.status().as_u16() {
            200..=299 => {}
            401 | 403 => return Err(PhotoApiError::Unauthorized),
            404 => return Err(PhotoApiError::NotFound(shortcode.to_string())),
            s => return Err(PhotoApiError::Http(HttpError::Status(s))),
        }

        let json: Value = resp.json().await.map_err(|e| PhotoApiError::Decode(e.to_string()))?;
        parse_post(shortcode, &json)
    }
}
