use crate::core::model::ItemError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidItem,
    UnsupportedDomain,
    Connectivity,
    RateLimit,
    TransientNetwork,
    FormatUnavailable,
    AuthenticationRequired,
    Verification,
    Cancelled,
    Io,
    Other,
}

/// Why a format error became final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatExhaustion {
    /// Every fallback selector was tried.
    Ladder,
    /// The attempt limit ran out before the ladder did.
    Attempts,
}

impl std::fmt::Display for FormatExhaustion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FormatExhaustion::Ladder => f.write_str("exhausted fallback formats"),
            FormatExhaustion::Attempts => f.write_str("retry attempts exhausted before all fallback formats were tried"),
        }
    }
}

/// Every failure a strategy or the engine can surface for one item.
///
/// The `Display` text is what ends up in `DownloadItem::error_message`, so each
/// variant starts with a fixed phrase that identifies its kind.
#[derive(thiserror::Error, Debug)]
pub enum DownloadError {
    #[error("Invalid item: {0}")]
    InvalidItem(#[from] ItemError),

    #[error("Unsupported domain: {0}")]
    UnsupportedDomain(String),

    #[error("Connectivity check failed for {service}: {message}")]
    Connectivity { service: String, message: String },

    #[error("Rate limited after {attempts} attempts: {message}")]
    RateLimit { attempts: u32, message: String },

    #[error("Network error after {attempts} attempts: {message}")]
    TransientNetwork { attempts: u32, message: String },

    #[error("Format unavailable: {reason} (tried {tried}): {message}")]
    FormatUnavailable { reason: FormatExhaustion, tried: String, message: String },

    #[error("Authentication required: {0}")]
    AuthenticationRequired(String),

    #[error("Verification failed: {0}")]
    Verification(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Download failed: {0}")]
    Other(String),
}

impl DownloadError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DownloadError::InvalidItem(_) => ErrorKind::InvalidItem,
            DownloadError::UnsupportedDomain(_) => ErrorKind::UnsupportedDomain,
            DownloadError::Connectivity { .. } => ErrorKind::Connectivity,
            DownloadError::RateLimit { .. } => ErrorKind::RateLimit,
            DownloadError::TransientNetwork { .. } => ErrorKind::TransientNetwork,
            DownloadError::FormatUnavailable { .. } => ErrorKind::FormatUnavailable,
            DownloadError::AuthenticationRequired(_) => ErrorKind::AuthenticationRequired,
            DownloadError::Verification(_) => ErrorKind::Verification,
            DownloadError::Cancelled => ErrorKind::Cancelled,
            DownloadError::Io(_) => ErrorKind::Io,
            DownloadError::Other(_) => ErrorKind::Other,
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        DownloadError::Other(message.into())
    }
}

pub type Result<T> = std::result::Result<T, DownloadError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_their_category() {
        let cases = [
            (DownloadError::UnsupportedDomain("foo.example".into()), "Unsupported domain"),
            (DownloadError::AuthenticationRequired("login first".into()), "Authentication required"),
            (DownloadError::Verification("empty file".into()), "Verification failed"),
            (
                DownloadError::Connectivity { service: "video site".into(), message: "dns".into() },
                "Connectivity check failed",
            ),
            (
                DownloadError::FormatUnavailable {
                    reason: FormatExhaustion::Ladder,
                    tried: "bv*+ba, best, worst".into(),
                    message: "x".into(),
                },
                "Format unavailable: exhausted fallback formats (tried bv*+ba, best, worst)",
            ),
            (
                DownloadError::FormatUnavailable {
                    reason: FormatExhaustion::Attempts,
                    tried: "bv*+ba".into(),
                    message: "x".into(),
                },
                "retry attempts exhausted before all fallback formats were tried (tried bv*+ba)",
            ),
        ];
        for (err, needle) in cases {
            assert!(err.to_string().contains(needle), "{err}");
        }
    }

    #[test]
    fn kind_follows_variant() {
        assert_eq!(DownloadError::other("x").kind(), ErrorKind::Other);
        assert_eq!(
            DownloadError::RateLimit { attempts: 3, message: "429".into() }.kind(),
            ErrorKind::RateLimit
        );
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk");
        assert_eq!(DownloadError::from(io).kind(), ErrorKind::Io);
    }
}
