use crate::plugins::registry::{CliPlugin, DownloadCliConfig, DEFAULT_USER_AGENT};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use reqwest::header::{HeaderName, HeaderValue};

/// Network settings shared by every platform.
///
/// Timeouts and retries end up in [`crate::plugins::registry::DriverContext`];
/// `--header` values only go to direct media transfers.
pub struct HttpCliPlugin;

impl HttpCliPlugin {
    pub fn new() -> Self {
        Self
    }
}

/// `Name: value`, checked against what reqwest will accept so a typo fails
/// at startup instead of on the first media request.
fn parse_header(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected 'Name: value', got '{}'", raw))?;
    let (name, value) = (name.trim(), value.trim());
    HeaderName::from_bytes(name.as_bytes()).map_err(|_| format!("invalid header name '{}'", name))?;
    HeaderValue::from_str(value).map_err(|_| format!("invalid value for header '{}'", name))?;
    Ok((name.to_string(), value.to_string()))
}

impl CliPlugin for HttpCliPlugin {
    fn name(&self) -> &'static str {
        "http"
    }

    fn augment_download_command(&self, cmd: Command) -> Command {
        cmd.arg(
            Arg::new("http_header")
                .long("header")
                .help_heading("Network")
                .help("Extra header for direct media requests (repeatable), e.g. --header 'Referer: https://x.com/'")
                .action(ArgAction::Append)
                .value_parser(parse_header)
                .num_args(1),
        )
        .arg(
            Arg::new("http_user_agent")
                .long("user-agent")
                .env("MG_USER_AGENT")
                .help_heading("Network")
                .help("User-Agent for page, API and media requests")
                .default_value(DEFAULT_USER_AGENT)
                .num_args(1),
        )
        .arg(
            Arg::new("http_timeout_secs")
                .long("timeout-secs")
                .help_heading("Network")
                .help("Per-request timeout in seconds; also bounds each connectivity probe")
                .value_parser(value_parser!(u64).range(1..=600))
                .default_value("10"),
        )
        .arg(
            Arg::new("http_retries")
                .long("retries")
                .help_heading("Network")
                .help("Extra tries for 429/408/5xx responses and connection errors")
                .value_parser(value_parser!(u32).range(0..=10))
                .default_value("2"),
        )
        .arg(
            Arg::new("http_retry_backoff_ms")
                .long("retry-backoff-ms")
                .help_heading("Network")
                .help("Base delay between HTTP retries in milliseconds, doubled per try")
                .value_parser(value_parser!(u64).range(1..))
                .default_value("400"),
        )
    }

    fn apply_download_matches(&self, matches: &ArgMatches, cfg: &mut DownloadCliConfig) -> anyhow::Result<()> {
        let ctx = &mut cfg.driver_ctx;
        if let Some(ua) = matches.get_one::<String>("http_user_agent") {
            ctx.user_agent = ua.trim().to_string();
        }
        if let Some(secs) = matches.get_one::<u64>("http_timeout_secs") {
            ctx.timeout_secs = *secs;
        }
        if let Some(n) = matches.get_one::<u32>("http_retries") {
            ctx.retries = *n;
        }
        if let Some(ms) = matches.get_one::<u64>("http_retry_backoff_ms") {
            ctx.retry_backoff_ms = *ms;
        }
        if ctx.user_agent.is_empty() {
            anyhow::bail!("--user-agent must not be empty");
        }

        if let Some(headers) = matches.get_many::<(String, String)>("http_header") {
            cfg.headers.extend(headers.cloned());
        }
        Ok(())
    }
}
