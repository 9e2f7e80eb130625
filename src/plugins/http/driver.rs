use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use reqwest::StatusCode;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::sleep;

use crate::plugins::registry::DriverContext;

pub type ByteStream = BoxStream<'static, Result<Bytes, HttpError>>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum HttpError {
    #[error("http status error: {0}")]
    Status(u16),

    #[error("request timed out")]
    Timeout,

    #[error("connection error: {0}")]
    Connect(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid header: {0}")]
    Header(String),

    #[error("decode error: {0}")]
    Decode(String),
}

impl HttpError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, HttpError::Status(429))
    }
}

impl From<reqwest::Error> for HttpError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            HttpError::Timeout
        } else if e.is_connect() {
            HttpError::Connect(e.to_string())
        } else if let Some(s) = e.status() {
            HttpError::Status(s.as_u16())
        } else if e.is_decode() {
            HttpError::Decode(e.to_string())
        } else {
            HttpError::Transport(e.to_string())
        }
    }
}

/// A successful (2xx) response whose body has not been read yet.
pub struct HttpResponse {
    pub final_url: String,
    pub content_length: Option<u64>,
    pub body: ByteStream,
}

/// The slice of an HTTP client the strategies and the transfer service need.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// GET with redirects followed; non-2xx is an error.
    async fn get_stream(&self, url: &str, headers: &HashMap<String, String>) -> Result<HttpResponse, HttpError>;

    async fn get_text(&self, url: &str, headers: &HashMap<String, String>) -> Result<String, HttpError>;

    /// Follows redirects and returns where they end.
    async fn resolve_redirect(&self, url: &str) -> Result<String, HttpError>;

    /// HEAD without following redirects. Any status counts as a response.
    async fn head_status(&self, url: &str) -> Result<u16, HttpError>;
}

pub async fn get_json(
    client: &dyn HttpClient,
    url: &str,
    headers: &HashMap<String, String>,
) -> Result<serde_json::Value, HttpError> {
    let text = client.get_text(url, headers).await?;
    serde_json::from_str(&text).map_err(|e| HttpError::Decode(e.to_string()))
}

pub struct ReqwestClient {
    client: reqwest::Client,
    no_redirect: reqwest::Client,
    ctx: DriverContext,
}

impl ReqwestClient {
    pub fn new(ctx: DriverContext) -> Result<Self, HttpError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .cookie_store(true)
            .connect_timeout(Duration::from_secs(ctx.timeout_secs))
            .build()?;
        let no_redirect = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(Duration::from_secs(ctx.timeout_secs))
            .build()?;
        Ok(Self { client, no_redirect, ctx })
    }

    pub fn context(&self) -> &DriverContext {
        &self.ctx
    }

    fn build_headers(&self, extra: &HashMap<String, String>) -> Result<HeaderMap, HttpError> {
        let mut h = HeaderMap::new();
        h.insert(
            USER_AGENT,
            HeaderValue::from_str(&self.ctx.user_agent).map_err(|e| HttpError::Header(e.to_string()))?,
        );
        for (k, v) in extra {
            let name = HeaderName::from_bytes(k.as_bytes()).map_err(|e| HttpError::Header(e.to_string()))?;
            let value = HeaderValue::from_str(v).map_err(|e| HttpError::Header(e.to_string()))?;
            h.insert(name, value);
        }
        Ok(h)
    }

    fn should_retry_status(status: StatusCode) -> bool {
        status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::REQUEST_TIMEOUT
            || status.is_server_error()
    }

    async fn sleep_backoff(&self, attempt: u32) {
        let base = self.ctx.retry_backoff_ms.max(1);
        let shift = attempt.min(16);
        let ms = base.saturating_mul(1u64 << shift).min(30_000);
        sleep(Duration::from_millis(ms)).await;
    }

    /// Sends a GET, retrying connection errors and retryable statuses.
    async fn send_get(&self, url: &str, headers: HeaderMap, total_timeout: Option<Duration>) -> Result<reqwest::Response, HttpError> {
        let mut last_err: Option<HttpError> = None;
        for attempt in 0..=self.ctx.retries {
            if attempt > 0 {
                self.sleep_backoff(attempt - 1).await;
            }

            let mut req = self.client.get(url).headers(headers.clone());
            if let Some(t) = total_timeout {
                req = req.timeout(t);
            }
            let resp = match req.send().await {
                Ok(r) => r,
                Err(e) => {
                    tracing::debug!(url, attempt, error = %e, "GET failed");
                    last_err = Some(e.into());
                    continue;
                }
            };

            let status = resp.status();
            if status.is_success() {
                return Ok(resp);
            }
            if Self::should_retry_status(status) {
                last_err = Some(HttpError::Status(status.as_u16()));
                continue;
            }
            return Err(HttpError::Status(status.as_u16()));
        }

        Err(last_err.unwrap_or(HttpError::Timeout))
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn get_stream(&self, url: &str, headers: &HashMap<String, String>) -> Result<HttpResponse, HttpError> {
        let headers = self.build_headers(headers)?;
        // Streams have no total deadline; the connect timeout still applies.
        let resp = self.send_get(url, headers, None).await?;

        // Length of the decoded body; unknown when reqwest decompresses.
        let content_length = resp.content_length();
        let final_url = resp.url().to_string();
        let body = resp.bytes_stream().map(|r| r.map_err(HttpError::from)).boxed();

        Ok(HttpResponse { final_url, content_length, body })
    }

    async fn get_text(&self, url: &str, headers: &HashMap<String, String>) -> Result<String, HttpError> {
        let headers = self.build_headers(headers)?;
        let resp = self
            .send_get(url, headers, Some(Duration::from_secs(self.ctx.timeout_secs)))
            .await?;
        Ok(resp.text().await?)
    }

    async fn resolve_redirect(&self, url: &str) -> Result<String, HttpError> {
        let headers = self.build_headers(&HashMap::new())?;
        let resp = self
            .send_get(url, headers, Some(Duration::from_secs(self.ctx.timeout_secs)))
            .await?;
        Ok(resp.url().to_string())
    }

    async fn head_status(&self, url: &str) -> Result<u16, HttpError> {
        let headers = self.build_headers(&HashMap::new())?;
        let resp = self.no_redirect.head(url).headers(headers).send().await?;
        Ok(resp.status().as_u16())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Server;

    fn ctx() -> DriverContext {
        DriverContext {
            user_agent: "media-grabber-test".to_string(),
            timeout_secs: 5,
            retries: 1,
            retry_backoff_ms: 1,
        }
    }

    #[tokio::test]
    async fn get_text_sends_user_agent() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/page")
            .match_header("user-agent", "media-grabber-test")
            .with_status(200)
            .with_body("hello")
            .create_async()
            .await;

        let client = ReqwestClient::new(ctx()).unwrap();
        let body = client.get_text(&format!("{}/page", server.url()), &HashMap::new()).await.unwrap();
        assert_eq!(body, "hello");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn compressed_bodies_have_no_known_length() {
        const GZ_BODY: [u8; 36] = [
            0x1f, 0x8b, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x02, 0x03, 0xcb, 0x48, 0xcd, 0xc9, 0xc9, 0x57, 0x48, 0xaf,
            0xca, 0x2c, 0x50, 0x28, 0xcf, 0x2f, 0xca, 0x49, 0x01, 0x00, 0x6b, 0x7d, 0xe8, 0xb7, 0x10, 0x00, 0x00, 0x00,
        ];
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/gz")
            .with_status(200)
            .with_header("content-encoding", "gzip")
            .with_body(GZ_BODY)
            .create_async()
            .await;
        server.mock("GET", "/plain").with_status(200).with_body("0123456789").create_async().await;

        let client = ReqwestClient::new(ctx()).unwrap();
        let resp = client.get_stream(&format!("{}/gz", server.url()), &HashMap::new()).await.unwrap();
        assert_eq!(resp.content_length, None);
        let chunks: Vec<Bytes> = resp.body.map(|c| c.unwrap()).collect().await;
        assert_eq!(chunks.concat(), b"hello gzip world");

        let resp = client.get_stream(&format!("{}/plain", server.url()), &HashMap::new()).await.unwrap();
        assert_eq!(resp.content_length, Some(10));
    }

    #[tokio::test]
    async fn retries_server_errors_then_gives_up() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/flaky")
            .with_status(503)
            .expect(2)
            .create_async()
            .await;

        let client = ReqwestClient::new(ctx()).unwrap();
        let err = client
            .get_text(&format!("{}/flaky", server.url()), &HashMap::new())
            .await
            .unwrap_err();
        assert_eq!(err, HttpError::Status(503));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let mut server = Server::new_async().await;
        let mock = server.mock("GET", "/gone").with_status(404).expect(1).create_async().await;

        let client = ReqwestClient::new(ctx()).unwrap();
        let err = client
            .get_text(&format!("{}/gone", server.url()), &HashMap::new())
            .await
            .unwrap_err();
        assert_eq!(err, HttpError::Status(404));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn resolve_redirect_follows_location() {
        let mut server = Server::new_async().await;
        let target = format!("{}/final", server.url());
        server
            .mock("GET", "/short")
            .with_status(302)
            .with_header("location", &target)
            .create_async()
            .await;
        server.mock("GET", "/final").with_status(200).create_async().await;

        let client = ReqwestClient::new(ctx()).unwrap();
        let got = client.resolve_redirect(&format!("{}/short", server.url())).await.unwrap();
        assert_eq!(got, target);
    }

    #[tokio::test]
    async fn head_status_reports_raw_status() {
        let mut server = Server::new_async().await;
        server.mock("HEAD", "/").with_status(429).create_async().await;

        let client = ReqwestClient::new(ctx()).unwrap();
        assert_eq!(client.head_status(&format!("{}/", server.url())).await.unwrap(), 429);
    }
}
