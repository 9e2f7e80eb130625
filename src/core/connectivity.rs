//! Reachability probes for the supported platforms.
//!
//! Each host is tried as DNS -> TCP connect -> HTTP HEAD on a few endpoints,
//! primary host first, then fallbacks. When every host fails a DNS-only check
//! of the bare domain has the last word, since some networks block direct
//! sockets but still let the extractor through.

use crate::core::error::DownloadError;
use crate::plugins::http::driver::HttpClient;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    VideoSite,
    ShortPost,
    PhotoNetwork,
    ImagePin,
}

impl Service {
    pub const ALL: [Service; 4] = [Service::VideoSite, Service::ShortPost, Service::PhotoNetwork, Service::ImagePin];

    pub fn display_name(self) -> &'static str {
        match self {
            Service::VideoSite => "YouTube",
            Service::ShortPost => "X (Twitter)",
            Service::PhotoNetwork => "Instagram",
            Service::ImagePin => "Pinterest",
        }
    }
}

impl std::fmt::Display for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    RateLimited,
    Unreachable,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionResult {
    pub status: ConnectionStatus,
    pub message: Option<String>,
    pub response_time: Duration,
}

impl ConnectionResult {
    pub fn connected(response_time: Duration) -> Self {
        Self { status: ConnectionStatus::Connected, message: None, response_time }
    }

    pub fn rate_limited(message: impl Into<String>, response_time: Duration) -> Self {
        Self { status: ConnectionStatus::RateLimited, message: Some(message.into()), response_time }
    }

    pub fn unreachable(message: impl Into<String>, response_time: Duration) -> Self {
        Self { status: ConnectionStatus::Unreachable, message: Some(message.into()), response_time }
    }

    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }
}

#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn check(&self, service: Service) -> ConnectionResult;
}

/// Pre-flight check shared by the strategies. Anything but `Connected` is terminal for the item.
pub async fn ensure_connected(probe: &dyn ConnectivityProbe, service: Service) -> Result<(), DownloadError> {
    let result = probe.check(service).await;
    if result.is_connected() {
        return Ok(());
    }
    tracing::error!(service = %service, status = ?result.status, "cannot download: service not reachable");
    Err(DownloadError::Connectivity {
        service: service.to_string(),
        message: result.message.unwrap_or_else(|| format!("{:?}", result.status)),
    })
}

/// Where and how to probe one service.
#[derive(Debug, Clone)]
pub struct ServiceTarget {
    pub hosts: Vec<String>,
    pub lenient_domain: String,
    pub port: u16,
    pub endpoints: Vec<String>,
    pub scheme: &'static str,
}

impl ServiceTarget {
    fn https(hosts: &[&str], lenient_domain: &str, endpoints: &[&str]) -> Self {
        Self {
            hosts: hosts.iter().map(|s| s.to_string()).collect(),
            lenient_domain: lenient_domain.to_string(),
            port: 443,
            endpoints: endpoints.iter().map(|s| s.to_string()).collect(),
            scheme: "https",
        }
    }

    pub fn default_for(service: Service) -> Self {
        match service {
            Service::VideoSite => Self::https(
                &["www.youtube.com", "m.youtube.com", "music.youtube.com"],
                "youtube.com",
                &["/", "/watch", "/feed/trending"],
            ),
            Service::ShortPost => Self::https(&["x.com", "api.x.com", "mobile.x.com"], "x.com", &["/", "/i/flow/login"]),
            Service::PhotoNetwork => Self::https(
                &["www.instagram.com", "m.instagram.com", "graph.instagram.com"],
                "instagram.com",
                &["/", "/explore/", "/accounts/login/"],
            ),
            Service::ImagePin => Self::https(&["www.pinterest.com"], "pinterest.com", &["/"]),
        }
    }
}

pub struct SiteConnectivityChecker {
    http: Arc<dyn HttpClient>,
    timeout: Duration,
    targets: HashMap<Service, ServiceTarget>,
    internet_probe: String,
    internet_host: ServiceTarget,
}

impl SiteConnectivityChecker {
    pub fn new(http: Arc<dyn HttpClient>, timeout: Duration) -> Self {
        let targets = Service::ALL.iter().map(|s| (*s, ServiceTarget::default_for(*s))).collect();
        Self {
            http,
            timeout,
            targets,
            internet_probe: "8.8.8.8:53".to_string(),
            internet_host: ServiceTarget::https(&["www.google.com"], "google.com", &["/"]),
        }
    }

    pub fn with_target(mut self, service: Service, target: ServiceTarget) -> Self {
        self.targets.insert(service, target);
        self
    }

    pub async fn check_service(&self, service: Service) -> ConnectionResult {
        let started = Instant::now();
        let Some(target) = self.targets.get(&service) else {
            return ConnectionResult::unreachable(format!("Unknown service: {}", service), started.elapsed());
        };

        let result = self.probe_target(service.display_name(), target, started).await;
        tracing::debug!(
            service = %service,
            status = ?result.status,
            ms = result.response_time.as_millis() as u64,
            "connectivity check"
        );
        result
    }

    pub async fn check_all(&self) -> Vec<(Service, ConnectionResult)> {
        let checks = Service::ALL.iter().map(|s| async move { (*s, self.check_service(*s).await) });
        futures::future::join_all(checks).await
    }

    /// General reachability: a public DNS server socket first, then a well-known site.
    pub async fn check_internet(&self) -> ConnectionResult {
        let started = Instant::now();
        match timeout(self.timeout, TcpStream::connect(self.internet_probe.as_str())).await {
            Ok(Ok(_)) => self.probe_target("the internet", &self.internet_host, started).await,
            Ok(Err(e)) => ConnectionResult::unreachable(format!("Cannot connect to network: {}", e), started.elapsed()),
            Err(_) => ConnectionResult::unreachable("Cannot connect to network: timed out", started.elapsed()),
        }
    }

    async fn probe_target(&self, name: &str, target: &ServiceTarget, started: Instant) -> ConnectionResult {
        for host in &target.hosts {
            if let Some(result) = self.probe_host(name, host, target, started).await {
                return result;
            }
        }

        if self.resolves(&target.lenient_domain, target.port).await {
            tracing::debug!(service = name, domain = %target.lenient_domain, "probes failed but DNS resolves; assuming reachable");
            return ConnectionResult::connected(started.elapsed());
        }

        ConnectionResult::unreachable(
            format!("Cannot connect to {} - service may be down or restricted in your region", name),
            started.elapsed(),
        )
    }

    /// `None` means this host told us nothing and the next one should be tried.
    async fn probe_host(&self, name: &str, host: &str, target: &ServiceTarget, started: Instant) -> Option<ConnectionResult> {
        if !self.resolves(host, target.port).await {
            return None;
        }

        if let Ok(Ok(_)) = timeout(self.timeout, TcpStream::connect((host, target.port))).await {
            return Some(ConnectionResult::connected(started.elapsed()));
        }

        for endpoint in &target.endpoints {
            let url = format!("{}://{}:{}{}", target.scheme, host, target.port, endpoint);
            let status = match timeout(self.timeout, self.http.head_status(&url)).await {
                Ok(Ok(s)) => s,
                _ => continue,
            };
            match status {
                200..=399 | 401 | 403 => return Some(ConnectionResult::connected(started.elapsed())),
                429 => {
                    return Some(ConnectionResult::rate_limited(
                        format!("{} is rate limiting requests", name),
                        started.elapsed(),
                    ))
                }
                _ => continue,
            }
        }
        None
    }

    async fn resolves(&self, host: &str, port: u16) -> bool {
        match timeout(self.timeout, lookup_host((host, port))).await {
            Ok(Ok(mut addrs)) => addrs.next().is_some(),
            _ => false,
        }
    }
}

#[async_trait]
impl ConnectivityProbe for SiteConnectivityChecker {
    async fn check(&self, service: Service) -> ConnectionResult {
        self.check_service(service).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::http::driver::{HttpError, HttpResponse};
    use parking_lot::Mutex;

    /// Answers HEAD with a fixed status and records the URLs asked for.
    struct HeadOnly {
        status: u16,
        asked: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl HttpClient for HeadOnly {
        async fn get_stream(&self, _u: &str, _h: &HashMap<String, String>) -> Result<HttpResponse, HttpError> {
            Err(HttpError::Status(500))
        }
        async fn get_text(&self, _u: &str, _h: &HashMap<String, String>) -> Result<String, HttpError> {
            Err(HttpError::Status(500))
        }
        async fn resolve_redirect(&self, url: &str) -> Result<String, HttpError> {
            Ok(url.to_string())
        }
        async fn head_status(&self, url: &str) -> Result<u16, HttpError> {
            self.asked.lock().push(url.to_string());
            Ok(self.status)
        }
    }

    fn checker(status: u16) -> (SiteConnectivityChecker, Arc<HeadOnly>) {
        let http = Arc::new(HeadOnly { status, asked: Mutex::new(vec![]) });
        (SiteConnectivityChecker::new(http.clone(), Duration::from_secs(2)), http)
    }

    fn local_target(port: u16) -> ServiceTarget {
        ServiceTarget {
            hosts: vec!["127.0.0.1".into()],
            lenient_domain: "nonexistent.invalid".into(),
            port,
            endpoints: vec!["/".into(), "/login".into()],
            scheme: "http",
        }
    }

    /// A port nothing listens on: bind, read the port, drop the listener.
    async fn closed_port() -> u16 {
        let l = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        l.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn open_socket_means_connected() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (c, http) = checker(500);
        let c = c.with_target(Service::ImagePin, local_target(port));

        let r = c.check(Service::ImagePin).await;
        assert!(r.is_connected(), "{:?}", r);
        assert!(http.asked.lock().is_empty(), "HEAD is only a fallback");
    }

    #[tokio::test]
    async fn head_429_is_rate_limited() {
        let port = closed_port().await;
        let (c, _) = checker(429);
        let c = c.with_target(Service::ShortPost, local_target(port));

        let r = c.check(Service::ShortPost).await;
        assert_eq!(r.status, ConnectionStatus::RateLimited);
        assert!(r.message.unwrap().contains("rate limiting"));
    }

    #[tokio::test]
    async fn head_403_still_counts_as_reachable() {
        let port = closed_port().await;
        let (c, _) = checker(403);
        let c = c.with_target(Service::PhotoNetwork, local_target(port));
        assert!(c.check(Service::PhotoNetwork).await.is_connected());
    }

    #[tokio::test]
    async fn all_endpoints_failing_is_unreachable() {
        let port = closed_port().await;
        let (c, http) = checker(500);
        let c = c.with_target(Service::VideoSite, local_target(port));

        let r = c.check(Service::VideoSite).await;
        assert_eq!(r.status, ConnectionStatus::Unreachable);
        assert!(r.message.unwrap().contains("Cannot connect to YouTube"));
        assert_eq!(http.asked.lock().len(), 2);
    }

    #[test]
    fn default_targets_have_fallbacks() {
        assert_eq!(ServiceTarget::default_for(Service::ShortPost).hosts, vec!["x.com", "api.x.com", "mobile.x.com"]);
        assert_eq!(ServiceTarget::default_for(Service::VideoSite).hosts.len(), 3);
        assert_eq!(ServiceTarget::default_for(Service::ImagePin).port, 443);
    }
}
