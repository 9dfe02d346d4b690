//! Error types for the proxy core.

use opaque_frame_client::FetchError;
use opaque_frame_common::ConfigError;
use thiserror::Error;

/// Errors produced by token handling, rewriting and image resolution.
///
/// Token variants are only ever visible in logs; callers of
/// [`ProxyService::resolve_token`](crate::ProxyService::resolve_token) see a
/// fixed diagnostic page instead.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProxyError {
    /// The token could not be decoded, authenticated or parsed.
    #[error("Invalid token")]
    InvalidToken,

    /// The token payload carries a version this build does not accept.
    #[error("Unsupported token version: {0}")]
    UnsupportedVersion(u32),

    /// The token is past its expiry time.
    #[error("Token expired")]
    TokenExpired,

    /// The host is not on the relevant allowlist.
    #[error("Host not allowed: {0}")]
    HostNotAllowed(String),

    /// The origin document is larger than the HTML size limit.
    #[error("Content too large: {observed} > {limit} bytes")]
    ContentTooLarge {
        /// Maximum accepted document size.
        limit: u64,
        /// Size that was declared or counted.
        observed: u64,
    },

    /// An upstream body passed its size limit.
    #[error("Response exceeds {limit} bytes")]
    SizeExceeded {
        /// Maximum accepted body size.
        limit: u64,
    },

    /// The origin could not be fetched.
    #[error("Fetch failed: {0}")]
    FetchFailed(#[source] FetchError),

    /// The stream was cancelled by the consumer.
    #[error("Transfer cancelled")]
    Cancelled,

    /// No mapping exists for the slug, or it may no longer be served.
    #[error("Not found")]
    NotFound,

    /// A caller-supplied argument is malformed.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The protection key or cipher failed.
    #[error("Protection error: {0}")]
    Protection(String),

    /// The mapping store failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration was rejected.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl From<FetchError> for ProxyError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::SizeExceeded { limit, .. } => Self::SizeExceeded { limit },
            FetchError::Cancelled => Self::Cancelled,
            other => Self::FetchFailed(other),
        }
    }
}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl ProxyError {
    /// Short label used in log fields.
    pub const fn cause(&self) -> &'static str {
        match self {
            Self::InvalidToken => "invalid",
            Self::UnsupportedVersion(_) => "unsupported_version",
            Self::TokenExpired => "expired",
            Self::HostNotAllowed(_) => "host_not_allowed",
            Self::ContentTooLarge { .. } => "content_too_large",
            Self::SizeExceeded { .. } => "size_exceeded",
            Self::FetchFailed(_) => "fetch_failed",
            Self::Cancelled => "cancelled",
            Self::NotFound => "not_found",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::Protection(_) => "protection",
            Self::Storage(_) => "storage",
            Self::Config(_) => "config",
        }
    }
}

/// Result type alias using `ProxyError`.
pub type Result<T> = std::result::Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_error_mapping() {
        let err: ProxyError = FetchError::SizeExceeded {
            limit: 5,
            observed: 9,
        }
        .into();
        assert!(matches!(err, ProxyError::SizeExceeded { limit: 5 }));

        let err: ProxyError = FetchError::Status(503).into();
        assert!(matches!(err, ProxyError::FetchFailed(FetchError::Status(503))));

        let err: ProxyError = FetchError::Cancelled.into();
        assert!(matches!(err, ProxyError::Cancelled));
    }

    #[test]
    fn test_cause_labels() {
        assert_eq!(ProxyError::TokenExpired.cause(), "expired");
        assert_eq!(
            ProxyError::ContentTooLarge {
                limit: 10,
                observed: 20
            }
            .cause(),
            "content_too_large"
        );
    }
}
