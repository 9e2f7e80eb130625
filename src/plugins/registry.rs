use async_trait::async_trait;
use crate::core::connectivity::Service;
use crate::core::error::DownloadError;
use crate::core::events::ProgressSink;
use crate::core::model::DownloadOptions;
use clap::{ArgMatches, Command};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

#[derive(Debug, Clone)]
pub struct DriverContext {
    pub user_agent: String,
    pub timeout_secs: u64,
    pub retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for DriverContext {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout_secs: 10,
            retries: 2,
            retry_backoff_ms: 400,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DownloadCliConfig {
    pub headers: HashMap<String, String>,
    pub options: DownloadOptions,
    pub driver_ctx: DriverContext,
    pub photo_username: Option<String>,
    pub photo_password: Option<String>,
}

pub trait CliPlugin: Send + Sync {
    fn name(&self) -> &'static str;
    fn augment_download_command(&self, cmd: Command) -> Command;
    fn apply_download_matches(&self, matches: &ArgMatches, cfg: &mut DownloadCliConfig) -> anyhow::Result<()>;
}

/// One item's worth of work for a strategy.
#[derive(Debug, Clone)]
pub struct StrategyRequest {
    pub url: String,
    /// Output path without extension; strategies pick the extension and any suffixes.
    pub destination: PathBuf,
    pub options: DownloadOptions,
    pub cancel: CancellationToken,
}

/// What a successful strategy run left on disk. Never empty on `Ok`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DownloadOutcome {
    pub files: Vec<PathBuf>,
    pub warnings: Vec<String>,
}

#[async_trait]
pub trait PlatformStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn service(&self) -> Service;

    /// Must report 100% through `sink` before returning `Ok`.
    async fn download(&self, req: &StrategyRequest, sink: &ProgressSink) -> Result<DownloadOutcome, DownloadError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainMatcher {
    Exact(String),
    Contains(String),
}

impl DomainMatcher {
    fn matches(&self, host: &str) -> bool {
        match self {
            DomainMatcher::Exact(d) => host == d,
            DomainMatcher::Contains(n) => host.contains(n.as_str()),
        }
    }

    fn is_exact(&self) -> bool {
        matches!(self, DomainMatcher::Exact(_))
    }
}

pub struct Route {
    pub matcher: DomainMatcher,
    pub strategy: Arc<dyn PlatformStrategy>,
}

/// The four strategies the default routing table dispatches to.
pub struct PlatformStrategies {
    pub video: Arc<dyn PlatformStrategy>,
    pub short_post: Arc<dyn PlatformStrategy>,
    pub photo: Arc<dyn PlatformStrategy>,
    pub image_pin: Arc<dyn PlatformStrategy>,
}

/// Ordered domain table. Exact host routes always win over containment routes,
/// and within each group the first registered route wins.
#[derive(Default)]
pub struct StrategyRouter {
    routes: Vec<Route>,
}

impl StrategyRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults(s: PlatformStrategies) -> Self {
        let mut r = Self::new();
        for d in ["youtube.com", "youtu.be", "m.youtube.com", "music.youtube.com"] {
            r.add_exact(d, s.video.clone());
        }
        for d in ["twitter.com", "x.com", "t.co", "mobile.twitter.com", "mobile.x.com"] {
            r.add_exact(d, s.short_post.clone());
        }
        for d in ["instagram.com", "m.instagram.com"] {
            r.add_exact(d, s.photo.clone());
        }
        for d in ["pinterest.com", "pin.it"] {
            r.add_exact(d, s.image_pin.clone());
        }
        r.add_contains("pinterest.", s.image_pin);
        r
    }

    pub fn add_exact(&mut self, domain: &str, strategy: Arc<dyn PlatformStrategy>) -> &mut Self {
        self.routes.push(Route { matcher: DomainMatcher::Exact(normalize_host(domain)), strategy });
        self
    }

    pub fn add_contains(&mut self, needle: &str, strategy: Arc<dyn PlatformStrategy>) -> &mut Self {
        self.routes.push(Route { matcher: DomainMatcher::Contains(needle.to_ascii_lowercase()), strategy });
        self
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// `None` for unknown hosts and for anything that doesn't parse as an absolute URL.
    pub fn route(&self, url: &str) -> Option<Arc<dyn PlatformStrategy>> {
        let parsed = url::Url::parse(url.trim()).ok()?;
        let host = normalize_host(parsed.host_str()?);
        if host.is_empty() {
            return None;
        }

        let exact = self.routes.iter().filter(|r| r.matcher.is_exact());
        let contains = self.routes.iter().filter(|r| !r.matcher.is_exact());
        exact
            .chain(contains)
            .find(|r| r.matcher.matches(&host))
            .map(|r| r.strategy.clone())
    }
}

fn normalize_host(host: &str) -> String {
    let h = host.trim().trim_end_matches('.').to_ascii_lowercase();
    match h.strip_prefix("www.") {
        Some(rest) => rest.to_string(),
        None => h,
    }
}

pub struct PluginRegistry {
    cli_plugins: Vec<Box<dyn CliPlugin>>,
}

impl PluginRegistry {
    pub fn with_defaults() -> Self {
        let mut reg = Self { cli_plugins: vec![] };

        reg.cli_plugins.push(Box::new(crate::plugins::http::cli::HttpCliPlugin::new()));
        reg.cli_plugins.push(Box::new(crate::plugins::video::cli::VideoCliPlugin::new()));
        reg.cli_plugins.push(Box::new(crate::plugins::photo::cli::PhotoCliPlugin::new()));
        reg
    }

    pub fn augment_download_command(&self, cmd: Command) -> Command {
        self.cli_plugins
            .iter()
            .fold(cmd, |c, p| p.augment_download_command(c))
    }

    pub fn apply_download_matches(&self, matches: &ArgMatches, cfg: &mut DownloadCliConfig) -> anyhow::Result<()> {
        for p in &self.cli_plugins {
            p.apply_download_matches(matches, cfg)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str, Service);

    #[async_trait]
    impl PlatformStrategy for Named {
        fn name(&self) -> &'static str {
            self.0
        }
        fn service(&self) -> Service {
            self.1
        }
        async fn download(&self, _req: &StrategyRequest, _sink: &ProgressSink) -> Result<DownloadOutcome, DownloadError> {
            Err(DownloadError::other("not used"))
        }
    }

    fn router() -> StrategyRouter {
        StrategyRouter::with_defaults(PlatformStrategies {
            video: Arc::new(Named("video", Service::VideoSite)),
            short_post: Arc::new(Named("short_post", Service::ShortPost)),
            photo: Arc::new(Named("photo", Service::PhotoNetwork)),
            image_pin: Arc::new(Named("image_pin", Service::ImagePin)),
        })
    }

    fn routed(r: &StrategyRouter, url: &str) -> Option<&'static str> {
        r.route(url).map(|s| s.name())
    }

    #[test]
    fn routes_known_hosts() {
        let r = router();
        assert_eq!(routed(&r, "https://www.youtube.com/watch?v=abc"), Some("video"));
        assert_eq!(routed(&r, "https://youtu.be/abc"), Some("video"));
        assert_eq!(routed(&r, "https://x.com/user/status/123"), Some("short_post"));
        assert_eq!(routed(&r, "https://t.co/xyz"), Some("short_post"));
        assert_eq!(routed(&r, "https://www.instagram.com/p/Cabc/"), Some("photo"));
        assert_eq!(routed(&r, "https://pin.it/3xyz"), Some("image_pin"));
        assert_eq!(routed(&r, "https://de.pinterest.com/pin/1/"), Some("image_pin"));
        assert_eq!(routed(&r, "https://WWW.PINTEREST.CO.UK/pin/1/"), Some("image_pin"));
    }

    #[test]
    fn unknown_and_malformed_urls_route_nowhere() {
        let r = router();
        assert_eq!(routed(&r, "https://unknown-host.example/x"), None);
        assert_eq!(routed(&r, "youtube.com/watch?v=abc"), None);
        assert_eq!(routed(&r, "not a url at all"), None);
        assert_eq!(routed(&r, ""), None);
        assert_eq!(routed(&r, "file:///etc/passwd"), None);
    }

    #[test]
    fn exact_beats_contains_regardless_of_registration_order() {
        let mut r = StrategyRouter::new();
        r.add_contains("example", Arc::new(Named("broad", Service::ImagePin)));
        r.add_exact("media.example.com", Arc::new(Named("narrow", Service::VideoSite)));

        assert_eq!(routed(&r, "https://media.example.com/a"), Some("narrow"));
        assert_eq!(routed(&r, "https://other.example.com/a"), Some("broad"));
    }

    #[test]
    fn routing_is_pure() {
        let r = router();
        let urls = ["https://youtu.be/a", "https://x.com/a/status/1", "https://nope.example", "https://pin.it/z"];
        let first: Vec<_> = urls.iter().map(|u| routed(&r, u)).collect();
        let again: Vec<_> = urls.iter().rev().map(|u| routed(&r, u)).collect();
        assert_eq!(first, again.into_iter().rev().collect::<Vec<_>>());
    }
}
