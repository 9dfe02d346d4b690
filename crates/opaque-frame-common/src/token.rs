//! Token payload carried inside opaque HTML tokens.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

/// Version written into newly issued tokens.
pub const TOKEN_VERSION: u32 = 1;

/// Version implied by tokens that carry no version field.
pub const LEGACY_TOKEN_VERSION: u32 = 0;

/// Returns `true` if tokens of `version` are still accepted.
#[must_use]
pub const fn is_supported_version(version: u32) -> bool {
    matches!(version, LEGACY_TOKEN_VERSION | TOKEN_VERSION)
}

/// Authenticated claims of an HTML token.
///
/// Serialized as compact JSON with the field names `ver`, `origin`, `iat`,
/// `exp` and `extra`. Timestamps are Unix seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPayload {
    /// Payload format version.
    #[serde(rename = "ver")]
    pub version: u32,

    /// Absolute URL of the origin page.
    pub origin: String,

    /// Issue time.
    #[serde(rename = "iat")]
    pub issued_at: i64,

    /// Expiry time.
    #[serde(rename = "exp")]
    pub expires_at: i64,

    /// Free-form claims carried alongside the origin.
    #[serde(rename = "extra")]
    pub extra_claims: Option<BTreeMap<String, Value>>,
}

impl TokenPayload {
    /// Creates a current-version payload valid for `ttl_secs` from `issued_at`.
    pub fn new(origin: impl Into<String>, issued_at: i64, ttl_secs: u64) -> Self {
        let ttl = i64::try_from(ttl_secs).unwrap_or(i64::MAX);
        Self {
            version: TOKEN_VERSION,
            origin: origin.into(),
            issued_at,
            expires_at: issued_at.saturating_add(ttl),
            extra_claims: None,
        }
    }

    /// Attaches extra claims. An empty map is stored as no claims.
    #[must_use]
    pub fn with_extra_claims(mut self, claims: BTreeMap<String, Value>) -> Self {
        self.extra_claims = if claims.is_empty() { None } else { Some(claims) };
        self
    }

    /// Returns `true` once `now` is past the expiry time.
    #[must_use]
    pub const fn is_expired_at(&self, now: i64) -> bool {
        self.expires_at < now
    }

    /// Parses the origin as an absolute URL.
    #[must_use]
    pub fn origin_url(&self) -> Option<Url> {
        Url::parse(&self.origin).ok()
    }
}
