//! Error types for origin fetches.

use thiserror::Error;

/// Errors that can occur while fetching from an origin server.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FetchError {
    /// The body is larger than the caller's limit.
    ///
    /// Raised before any body bytes are read when the origin declares a
    /// `Content-Length` above the limit, otherwise as soon as the running
    /// byte count passes it.
    #[error("Response exceeds {limit} bytes (observed {observed})")]
    SizeExceeded {
        /// Maximum accepted body size.
        limit: u64,
        /// Declared length, or bytes counted when the limit was passed.
        observed: u64,
    },

    /// The origin answered with a non-success status.
    #[error("Origin returned status {0}")]
    Status(u16),

    /// Connection, TLS or protocol failure.
    #[error("Network error: {0}")]
    Network(#[source] reqwest::Error),

    /// The request did not complete within the configured timeout.
    #[error("Timeout error")]
    Timeout,

    /// The transfer was cancelled by the caller.
    #[error("Transfer cancelled")]
    Cancelled,

    /// Writing to the destination failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The URL cannot be fetched (not http or https).
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// The request or one of its redirects targets a host the caller does
    /// not allow.
    #[error("Host not allowed: {0}")]
    HostNotAllowed(String),

    /// The origin kept redirecting past the hop limit.
    #[error("Too many redirects (limit {0})")]
    TooManyRedirects(usize),
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Network(err)
        }
    }
}

impl FetchError {
    /// Check if the size limit was hit.
    pub const fn is_size_exceeded(&self) -> bool {
        matches!(self, Self::SizeExceeded { .. })
    }

    /// Check if the origin could not be reached or did not answer in time.
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout)
    }
}

/// Result type alias using `FetchError`.
pub type Result<T> = std::result::Result<T, FetchError>;
