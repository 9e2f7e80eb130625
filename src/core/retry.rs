//! Error classification and backoff for extractor-driven downloads.

use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;

/// Selectors tried in order after the requested one reports a format error.
pub const FORMAT_LADDER: [&str; 2] = ["best", "worst"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3, base_delay: Duration::from_secs(3) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    RateLimit,
    Network,
    Format,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep for `delay`, then try again. `format` replaces the selector when set.
    Retry { delay: Duration, format: Option<&'static str> },
    Fatal,
}

struct Patterns {
    rate_limit: Regex,
    network: Regex,
    format: Regex,
}

fn patterns() -> &'static Patterns {
    static P: OnceLock<Patterns> = OnceLock::new();
    P.get_or_init(|| Patterns {
        rate_limit: Regex::new(r"(?i)HTTP Error 429|Too Many Requests").expect("static regex"),
        network: Regex::new(r"(?i)Connection refused|Network Error|Unable to download|Errno 111|timed out")
            .expect("static regex"),
        format: Regex::new(r"(?i)Requested format is not available|No video formats found").expect("static regex"),
    })
}

pub fn classify(message: &str) -> ErrorClass {
    let p = patterns();
    if p.rate_limit.is_match(message) {
        ErrorClass::RateLimit
    } else if p.network.is_match(message) {
        ErrorClass::Network
    } else if p.format.is_match(message) {
        ErrorClass::Format
    } else {
        ErrorClass::Other
    }
}

/// Human wording for extractor failures that are never worth retrying.
pub fn friendly_message(message: &str) -> Option<&'static str> {
    let m = message.to_ascii_lowercase();
    if m.contains("video unavailable") || m.contains("private video") || m.contains("is private") {
        Some("This video is unavailable or private")
    } else if m.contains("sign in to confirm your age") || m.contains("age-restricted") || m.contains("age restricted") {
        Some("This video requires age verification; provide cookies from a signed-in browser")
    } else if m.contains("only images are available") {
        Some("Only image storyboards are available for this video")
    } else if m.contains("nsig extraction failed") {
        Some("The site's anti-bot protection blocked extraction (nsig extraction failed); update the extractor")
    } else {
        None
    }
}

impl RetryPolicy {
    pub fn rate_limit_delay(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1u32 << attempt.min(16))
    }

    pub fn network_delay(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt.saturating_add(1))
    }

    /// What to do after `class` failed the zero-based `attempt`.
    ///
    /// The format ladder is indexed by the same attempt counter as the
    /// backoff, so a format error late in the run skips straight to fatal.
    pub fn decide(&self, class: ErrorClass, attempt: u32) -> RetryDecision {
        let last = attempt.saturating_add(1) >= self.max_attempts;
        match class {
            ErrorClass::Other => RetryDecision::Fatal,
            _ if last => RetryDecision::Fatal,
            ErrorClass::RateLimit => RetryDecision::Retry { delay: self.rate_limit_delay(attempt), format: None },
            ErrorClass::Network => RetryDecision::Retry { delay: self.network_delay(attempt), format: None },
            ErrorClass::Format => match FORMAT_LADDER.get(attempt as usize) {
                Some(f) => RetryDecision::Retry { delay: Duration::ZERO, format: Some(f) },
                None => RetryDecision::Fatal,
            },
        }
    }
}
