//! Configuration error types.

use thiserror::Error;

/// Errors raised while loading or validating proxy configuration.
///
/// Every variant is fatal at startup. Nothing in this enum is ever produced
/// while serving a request.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A host allowlist is empty.
    #[error("{0} must list at least one host")]
    MissingAllowlist(&'static str),

    /// A route template is missing a required placeholder.
    #[error("{field} must contain {placeholder}")]
    InvalidTemplate {
        /// Name of the offending template setting.
        field: &'static str,
        /// The placeholder that was not found.
        placeholder: &'static str,
    },

    /// The decoded slug secret is shorter than the minimum key length.
    #[error("slug_secret must be at least {min} bytes (got {actual})")]
    SecretTooShort {
        /// Minimum accepted length in bytes.
        min: usize,
        /// Length of the decoded secret.
        actual: usize,
    },

    /// The base path contains characters outside `[a-zA-Z0-9-/]`.
    #[error("Invalid base path: {0}")]
    InvalidBasePath(String),

    /// Any other out-of-range or malformed value.
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue {
        /// Name of the offending setting.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },

    /// Reading the configuration file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file is not valid TOML for this schema.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Result type alias using `ConfigError`.
pub type Result<T> = std::result::Result<T, ConfigError>;
