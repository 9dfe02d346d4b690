//! Proxy configuration and route template resolution.
//!
//! Configuration is normally read from a TOML file by the binary and validated
//! once at startup. Every check in this module is fatal: a misconfigured proxy
//! refuses to start rather than failing on the first request.
//!
//! ## Example Configuration
//!
//! ```toml
//! [proxy]
//! allowed_html_hosts = ["news.example"]
//! allowed_image_hosts = ["news.example", "cdn.news.example"]
//! base_path = "proxy"
//!
//! [proxy.routes]
//! html_token_template = "/{basePath}/t/{token}"
//! image_slug_template = "/{basePath}/img/s/{slug}"
//!
//! [map]
//! map_root = "data/img-map"
//! slug_secret = "c2x1Zy1zZWNyZXQtZm9yLXRlc3Rz"
//!
//! [protection]
//! key = "AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8"
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::Engine;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::error::{ConfigError, Result};

/// Placeholder for the trimmed base path in route templates.
pub const BASE_PATH_PLACEHOLDER: &str = "{basePath}";
/// Placeholder for the opaque token in the HTML route template.
pub const TOKEN_PLACEHOLDER: &str = "{token}";
/// Placeholder for the image slug in the image route template.
pub const SLUG_PLACEHOLDER: &str = "{slug}";

/// Default HTML route template.
pub const DEFAULT_HTML_TOKEN_TEMPLATE: &str = "/{basePath}/t/{token}";
/// Default image route template.
pub const DEFAULT_IMAGE_SLUG_TEMPLATE: &str = "/{basePath}/img/s/{slug}";

/// Minimum slug secret length in bytes, after decoding.
pub const MIN_SLUG_SECRET_BYTES: usize = 16;
/// Exact token protection key length in bytes, after decoding.
pub const PROTECTION_KEY_BYTES: usize = 32;

const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

const STANDARD_LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Decodes a configured secret into key bytes.
///
/// Base64url is preferred (padding optional), then standard base64. When the
/// value decodes as neither, its raw UTF-8 bytes are used.
#[must_use]
pub fn decode_key_material(value: &str) -> Vec<u8> {
    URL_SAFE_LENIENT
        .decode(value)
        .or_else(|_| STANDARD_LENIENT.decode(value))
        .unwrap_or_else(|_| value.as_bytes().to_vec())
}

/// Replaces every ASCII-case-insensitive occurrence of `placeholder`.
fn substitute(template: &str, placeholder: &str, value: &str) -> String {
    let haystack = template.to_ascii_lowercase();
    let needle = placeholder.to_ascii_lowercase();

    let mut out = String::with_capacity(template.len() + value.len());
    let mut last = 0;
    for (idx, _) in haystack.match_indices(&needle) {
        out.push_str(&template[last..idx]);
        out.push_str(value);
        last = idx + needle.len();
    }
    out.push_str(&template[last..]);
    out
}

fn contains_placeholder(template: &str, placeholder: &str) -> bool {
    template
        .to_ascii_lowercase()
        .contains(&placeholder.to_ascii_lowercase())
}

fn with_leading_slash(path: String) -> String {
    if path.starts_with('/') {
        path
    } else {
        format!("/{path}")
    }
}

fn host_in(list: &[String], host: &str) -> bool {
    list.iter().any(|allowed| allowed.eq_ignore_ascii_case(host))
}

/// Route templates for the two proxy endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteOptions {
    /// Template of the HTML endpoint, e.g. `/{basePath}/t/{token}`.
    #[serde(default = "default_html_token_template")]
    pub html_token_template: String,

    /// Template of the image endpoint, e.g. `/{basePath}/img/s/{slug}`.
    #[serde(default = "default_image_slug_template")]
    pub image_slug_template: String,
}

impl Default for RouteOptions {
    fn default() -> Self {
        Self {
            html_token_template: default_html_token_template(),
            image_slug_template: default_image_slug_template(),
        }
    }
}

impl RouteOptions {
    /// Validates that both templates carry their placeholders.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidTemplate`] naming the first missing
    /// placeholder.
    pub fn validate(&self) -> Result<()> {
        let checks = [
            (
                "routes.html_token_template",
                &self.html_token_template,
                BASE_PATH_PLACEHOLDER,
            ),
            (
                "routes.html_token_template",
                &self.html_token_template,
                TOKEN_PLACEHOLDER,
            ),
            (
                "routes.image_slug_template",
                &self.image_slug_template,
                BASE_PATH_PLACEHOLDER,
            ),
            (
                "routes.image_slug_template",
                &self.image_slug_template,
                SLUG_PLACEHOLDER,
            ),
        ];

        for (field, template, placeholder) in checks {
            if !contains_placeholder(template, placeholder) {
                return Err(ConfigError::InvalidTemplate { field, placeholder });
            }
        }

        Ok(())
    }
}

fn default_html_token_template() -> String {
    DEFAULT_HTML_TOKEN_TEMPLATE.to_string()
}

fn default_image_slug_template() -> String {
    DEFAULT_IMAGE_SLUG_TEMPLATE.to_string()
}

fn default_base_path() -> String {
    "proxy".to_string()
}

const fn default_token_lifetime_secs() -> u64 {
    3600
}

const fn default_max_html_size_bytes() -> usize {
    2 * 1024 * 1024
}

const fn default_max_img_rewrite() -> usize {
    300
}

const fn default_image_max_age_secs() -> u64 {
    30 * 24 * 60 * 60
}

/// Host policy, limits and routes of the proxy.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
pub struct ProxyOptions {
    /// Hosts whose pages may be embedded.
    pub allowed_html_hosts: Vec<String>,

    /// Hosts whose images may be proxied.
    pub allowed_image_hosts: Vec<String>,

    /// Path prefix substituted for `{basePath}` (may be empty).
    #[serde(default = "default_base_path")]
    #[builder(default = default_base_path(), setter(into))]
    pub base_path: String,

    /// Prefix the host application is mounted under, e.g. `/app`.
    #[serde(default)]
    #[builder(default, setter(into))]
    pub path_base: String,

    /// Default token lifetime in seconds.
    #[serde(default = "default_token_lifetime_secs")]
    #[builder(default = default_token_lifetime_secs())]
    pub html_token_lifetime_secs: u64,

    /// Maximum size of an origin HTML document in bytes.
    #[serde(default = "default_max_html_size_bytes")]
    #[builder(default = default_max_html_size_bytes())]
    pub max_html_size_bytes: usize,

    /// Maximum number of `<img>` elements processed per document.
    #[serde(default = "default_max_img_rewrite")]
    #[builder(default = default_max_img_rewrite())]
    pub max_img_rewrite: usize,

    /// Recommended cache lifetime for proxied images in seconds.
    #[serde(default = "default_image_max_age_secs")]
    #[builder(default = default_image_max_age_secs())]
    pub image_max_age_secs: u64,

    /// Route templates.
    #[serde(default)]
    #[builder(default)]
    pub routes: RouteOptions,
}

impl ProxyOptions {
    /// Validates allowlists, base path, limits and templates.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<()> {
        if self.allowed_html_hosts.iter().all(|h| h.trim().is_empty()) {
            return Err(ConfigError::MissingAllowlist("allowed_html_hosts"));
        }
        if self.allowed_image_hosts.iter().all(|h| h.trim().is_empty()) {
            return Err(ConfigError::MissingAllowlist("allowed_image_hosts"));
        }

        if !self
            .base_path
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '/')
        {
            return Err(ConfigError::InvalidBasePath(self.base_path.clone()));
        }

        if !self.path_base.is_empty() && !self.path_base.starts_with('/') {
            return Err(ConfigError::InvalidValue {
                field: "path_base",
                reason: "must be empty or start with '/'".to_string(),
            });
        }

        let limits = [
            ("html_token_lifetime_secs", self.html_token_lifetime_secs),
            ("max_html_size_bytes", self.max_html_size_bytes as u64),
            ("max_img_rewrite", self.max_img_rewrite as u64),
        ];
        for (field, value) in limits {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: "must be at least 1".to_string(),
                });
            }
        }

        self.routes.validate()
    }

    /// Trims and lowercases both allowlists, dropping blank entries.
    pub fn normalize_hosts(&mut self) {
        for list in [&mut self.allowed_html_hosts, &mut self.allowed_image_hosts] {
            *list = list
                .iter()
                .map(|host| host.trim().to_ascii_lowercase())
                .filter(|host| !host.is_empty())
                .collect();
        }
    }

    /// Returns `true` if pages from `host` may be embedded.
    #[must_use]
    pub fn is_html_host_allowed(&self, host: &str) -> bool {
        host_in(&self.allowed_html_hosts, host)
    }

    /// Returns `true` if images from `host` may be proxied.
    #[must_use]
    pub fn is_image_host_allowed(&self, host: &str) -> bool {
        host_in(&self.allowed_image_hosts, host)
    }

    /// The default token lifetime.
    #[must_use]
    pub const fn html_token_lifetime(&self) -> Duration {
        Duration::from_secs(self.html_token_lifetime_secs)
    }

    /// The recommended cache lifetime for proxied images.
    #[must_use]
    pub const fn image_max_age(&self) -> Duration {
        Duration::from_secs(self.image_max_age_secs)
    }

    /// Base path with surrounding slashes removed.
    #[must_use]
    pub fn trimmed_base_path(&self) -> &str {
        self.base_path.trim_matches('/')
    }

    /// Route pattern of the HTML endpoint, `{token}` left in place.
    #[must_use]
    pub fn html_route(&self) -> String {
        with_leading_slash(substitute(
            &self.routes.html_token_template,
            BASE_PATH_PLACEHOLDER,
            self.trimmed_base_path(),
        ))
    }

    /// Route pattern of the image endpoint, `{slug}` left in place.
    #[must_use]
    pub fn image_route(&self) -> String {
        with_leading_slash(substitute(
            &self.routes.image_slug_template,
            BASE_PATH_PLACEHOLDER,
            self.trimmed_base_path(),
        ))
    }

    /// Concrete path of the HTML endpoint for `token`.
    #[must_use]
    pub fn html_path(&self, token: &str) -> String {
        substitute(&self.html_route(), TOKEN_PLACEHOLDER, token)
    }

    /// Concrete path of the image endpoint for `slug`, prefixed with
    /// [`path_base`](Self::path_base) when the application is not mounted at
    /// the root.
    #[must_use]
    pub fn image_path(&self, slug: &str) -> String {
        let path = substitute(&self.image_route(), SLUG_PLACEHOLDER, slug);
        let prefix = self.path_base.trim_end_matches('/');

        if prefix.is_empty()
            || path
                .to_ascii_lowercase()
                .starts_with(&prefix.to_ascii_lowercase())
        {
            path
        } else {
            format!("{prefix}{path}")
        }
    }
}

fn default_map_root() -> PathBuf {
    PathBuf::from("data/img-map")
}

const fn default_max_file_size_bytes() -> u64 {
    10 * 1024 * 1024
}

/// Slug mapping storage and image size limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapOptions {
    /// Directory holding one `{slug}.bin` file per mapping.
    #[serde(default = "default_map_root")]
    pub map_root: PathBuf,

    /// HMAC secret for slug derivation, base64url or raw UTF-8.
    #[serde(skip_serializing)]
    pub slug_secret: SecretString,

    /// Maximum proxied image size in bytes.
    #[serde(default = "default_max_file_size_bytes")]
    pub max_file_size_bytes: u64,
}

impl MapOptions {
    /// Creates map options with the default root and size limit.
    pub fn new(slug_secret: impl Into<String>) -> Self {
        Self {
            map_root: default_map_root(),
            slug_secret: SecretString::new(slug_secret.into().into()),
            max_file_size_bytes: default_max_file_size_bytes(),
        }
    }

    /// Sets the mapping directory.
    #[must_use]
    pub fn with_map_root(mut self, map_root: impl Into<PathBuf>) -> Self {
        self.map_root = map_root.into();
        self
    }

    /// Sets the maximum image size.
    #[must_use]
    pub const fn with_max_file_size_bytes(mut self, max: u64) -> Self {
        self.max_file_size_bytes = max;
        self
    }

    /// Decodes the slug secret into key bytes.
    #[must_use]
    pub fn key_bytes(&self) -> Vec<u8> {
        decode_key_material(self.slug_secret.expose_secret())
    }

    /// Validates the secret length and size limit.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::SecretTooShort`] or [`ConfigError::InvalidValue`].
    pub fn validate(&self) -> Result<()> {
        let actual = self.key_bytes().len();
        if actual < MIN_SLUG_SECRET_BYTES {
            return Err(ConfigError::SecretTooShort {
                min: MIN_SLUG_SECRET_BYTES,
                actual,
            });
        }

        if self.max_file_size_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_file_size_bytes",
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(())
    }
}

const fn default_timeout_secs() -> u64 {
    15
}

/// Outbound HTTP client settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchOptions {
    /// Total timeout of an origin request in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// User-Agent override; the crate name and version when unset.
    #[serde(default)]
    pub user_agent: Option<String>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            user_agent: None,
        }
    }
}

impl FetchOptions {
    /// The total request timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_purpose() -> String {
    "opaque-frame:html-token".to_string()
}

/// Token protection key material.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectionOptions {
    /// Base64url encoded 32-byte key.
    #[serde(skip_serializing)]
    pub key: SecretString,

    /// Purpose string bound into every protected token.
    #[serde(default = "default_purpose")]
    pub purpose: String,
}

impl ProtectionOptions {
    /// Creates protection options with the default purpose.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: SecretString::new(key.into().into()),
            purpose: default_purpose(),
        }
    }

    /// Decodes the key.
    #[must_use]
    pub fn key_bytes(&self) -> Vec<u8> {
        decode_key_material(self.key.expose_secret())
    }

    /// Validates the decoded key length.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] unless the key decodes to
    /// exactly 32 bytes.
    pub fn validate(&self) -> Result<()> {
        let len = self.key_bytes().len();
        if len != PROTECTION_KEY_BYTES {
            return Err(ConfigError::InvalidValue {
                field: "protection.key",
                reason: format!("must decode to {PROTECTION_KEY_BYTES} bytes (got {len})"),
            });
        }
        Ok(())
    }
}

/// Complete proxy configuration as read from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpaqueFrameConfig {
    /// Host policy, limits and routes.
    pub proxy: ProxyOptions,

    /// Slug mapping settings.
    pub map: MapOptions,

    /// Outbound client settings.
    #[serde(default)]
    pub fetch: FetchOptions,

    /// Token protection key.
    pub protection: ProtectionOptions,
}

impl OpaqueFrameConfig {
    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document does not parse or fails validation.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(contents)?;
        config.proxy.normalize_hosts();
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, does not parse or fails
    /// validation.
    pub fn from_path(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Validates every section.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<()> {
        self.proxy.validate()?;
        self.map.validate()?;
        self.protection.validate()?;

        if self.fetch.timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "fetch.timeout_secs",
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(())
    }
}
