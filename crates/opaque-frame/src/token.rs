//! Opaque HTML tokens.
//!
//! A token is a [`TokenPayload`] serialized as JSON, sealed by a
//! [`Protector`] and encoded as unpadded base64url so it fits in a single path
//! segment. Older tokens used padded standard base64, percent-escaped; those
//! are still accepted on decode.
//!
//! Decoding validates in a fixed order: version, then structure, then
//! expiry, then host policy. Every failure is logged with its cause and
//! the encoding it arrived in.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use chrono::Utc;
use percent_encoding::{NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use opaque_frame_common::token::is_supported_version;
use opaque_frame_common::{ProxyOptions, TokenPayload};

use crate::error::{ProxyError, Result};
use crate::protect::Protector;

/// Which encoding a token arrived in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenEncoding {
    /// Unpadded base64url.
    Current,
    /// Percent-escaped standard base64.
    Legacy,
}

impl TokenEncoding {
    /// Label used in log fields.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Current => "current",
            Self::Legacy => "legacy",
        }
    }
}

/// A token that passed every check.
#[derive(Debug, Clone)]
pub struct DecodedToken {
    /// The authenticated claims.
    pub payload: TokenPayload,
    /// The parsed origin URL.
    pub origin: Url,
    /// Encoding the token arrived in.
    pub encoding: TokenEncoding,
}

/// Payload as found on the wire, before validation.
#[derive(Debug, Deserialize)]
struct WirePayload {
    #[serde(default)]
    ver: u32,
    origin: Option<String>,
    iat: Option<i64>,
    exp: Option<i64>,
    extra: Option<BTreeMap<String, Value>>,
}

/// Issues and validates opaque HTML tokens.
#[derive(Clone)]
pub struct TokenCodec {
    protector: Arc<dyn Protector>,
    options: Arc<ProxyOptions>,
}

impl std::fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCodec").finish_non_exhaustive()
    }
}

impl TokenCodec {
    /// Creates a codec sealing with `protector` and checking hosts against
    /// `options`.
    pub fn new(protector: Arc<dyn Protector>, options: Arc<ProxyOptions>) -> Self {
        Self { protector, options }
    }

    /// Issues a token for `origin` valid for `ttl` (or the configured
    /// lifetime) from now.
    ///
    /// # Errors
    ///
    /// - [`ProxyError::InvalidArgument`] if `origin` is not an absolute
    ///   http(s) URL or `ttl` is zero
    /// - [`ProxyError::HostNotAllowed`] if the origin host is not on the HTML
    ///   allowlist
    pub fn encode(
        &self,
        origin: &str,
        ttl: Option<Duration>,
        extra_claims: Option<BTreeMap<String, Value>>,
    ) -> Result<String> {
        self.encode_at(origin, Utc::now().timestamp(), ttl, extra_claims)
    }

    /// [`encode`](Self::encode) with an explicit issue time.
    ///
    /// # Errors
    ///
    /// See [`encode`](Self::encode).
    pub fn encode_at(
        &self,
        origin: &str,
        now: i64,
        ttl: Option<Duration>,
        extra_claims: Option<BTreeMap<String, Value>>,
    ) -> Result<String> {
        let url = parse_origin(origin)
            .ok_or_else(|| ProxyError::InvalidArgument(format!("not an absolute URL: {origin}")))?;
        let host = url.host_str().unwrap_or_default();
        if !self.options.is_html_host_allowed(host) {
            return Err(ProxyError::HostNotAllowed(host.to_string()));
        }

        let ttl = ttl.unwrap_or_else(|| self.options.html_token_lifetime());
        if ttl.as_secs() == 0 {
            return Err(ProxyError::InvalidArgument(
                "ttl must be at least one second".to_string(),
            ));
        }

        let payload = TokenPayload::new(origin, now, ttl.as_secs())
            .with_extra_claims(extra_claims.unwrap_or_default());
        let sealed = self.seal(&payload)?;

        debug!(host, expires_at = payload.expires_at, "Issued token");
        Ok(URL_SAFE_NO_PAD.encode(sealed))
    }

    /// Seals `payload` in the legacy percent-escaped encoding.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Protection`] if sealing fails.
    pub fn encode_legacy(&self, payload: &TokenPayload) -> Result<String> {
        let sealed = self.seal(payload)?;
        Ok(utf8_percent_encode(&STANDARD.encode(sealed), NON_ALPHANUMERIC).to_string())
    }

    /// Decodes and validates `token` against the current time.
    ///
    /// # Errors
    ///
    /// - [`ProxyError::InvalidToken`] if the token does not decode, open or
    ///   parse, or lacks an origin or expiry
    /// - [`ProxyError::UnsupportedVersion`] for unknown payload versions
    /// - [`ProxyError::TokenExpired`] once the expiry has passed
    /// - [`ProxyError::HostNotAllowed`] if the origin host is no longer on the
    ///   HTML allowlist
    pub fn decode(&self, token: &str) -> Result<DecodedToken> {
        self.decode_at(token, Utc::now().timestamp())
    }

    /// [`decode`](Self::decode) with an explicit current time.
    ///
    /// # Errors
    ///
    /// See [`decode`](Self::decode).
    pub fn decode_at(&self, token: &str, now: i64) -> Result<DecodedToken> {
        let Some((plaintext, encoding)) = self.open(token) else {
            warn!(cause = "invalid", "Rejected token that does not open");
            return Err(ProxyError::InvalidToken);
        };

        self.validate(&plaintext, now)
            .map_err(|Rejected { error, origin }| {
                warn!(
                    cause = error.cause(),
                    encoding = encoding.as_str(),
                    origin = origin.as_ref().map(Url::as_str),
                    host = origin.as_ref().and_then(Url::host_str),
                    error = %error,
                    "Rejected token"
                );
                error
            })
            .map(|(payload, origin)| DecodedToken {
                payload,
                origin,
                encoding,
            })
    }

    fn seal(&self, payload: &TokenPayload) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(payload)
            .map_err(|e| ProxyError::Protection(format!("payload serialization failed: {e}")))?;
        self.protector.protect(&json)
    }

    fn open(&self, token: &str) -> Option<(Vec<u8>, TokenEncoding)> {
        let current = URL_SAFE_NO_PAD
            .decode(token)
            .ok()
            .and_then(|sealed| self.protector.unprotect(&sealed).ok());
        if let Some(plaintext) = current {
            return Some((plaintext, TokenEncoding::Current));
        }

        let unescaped = percent_decode_str(token).decode_utf8().ok()?;
        let sealed = STANDARD.decode(unescaped.as_bytes()).ok()?;
        let plaintext = self.protector.unprotect(&sealed).ok()?;
        Some((plaintext, TokenEncoding::Legacy))
    }

    fn validate(
        &self,
        plaintext: &[u8],
        now: i64,
    ) -> std::result::Result<(TokenPayload, Url), Rejected> {
        let wire: WirePayload =
            serde_json::from_slice(plaintext).map_err(|_| Rejected::bare(ProxyError::InvalidToken))?;

        if !is_supported_version(wire.ver) {
            return Err(Rejected::bare(ProxyError::UnsupportedVersion(wire.ver)));
        }

        let origin = wire
            .origin
            .filter(|origin| !origin.trim().is_empty())
            .ok_or_else(|| Rejected::bare(ProxyError::InvalidToken))?;
        let url = parse_origin(&origin).ok_or_else(|| Rejected::bare(ProxyError::InvalidToken))?;
        let Some(expires_at) = wire.exp else {
            return Err(Rejected::at(ProxyError::InvalidToken, url));
        };

        if expires_at < now {
            return Err(Rejected::at(ProxyError::TokenExpired, url));
        }

        let host = url.host_str().unwrap_or_default();
        if !self.options.is_html_host_allowed(host) {
            let error = ProxyError::HostNotAllowed(host.to_string());
            return Err(Rejected::at(error, url));
        }

        let payload = TokenPayload {
            version: wire.ver,
            origin,
            issued_at: wire.iat.unwrap_or_default(),
            expires_at,
            extra_claims: wire.extra,
        };

        Ok((payload, url))
    }
}

/// A validation failure, with the origin when the payload named a usable one.
#[derive(Debug)]
struct Rejected {
    error: ProxyError,
    origin: Option<Url>,
}

impl Rejected {
    const fn bare(error: ProxyError) -> Self {
        Self {
            error,
            origin: None,
        }
    }

    const fn at(error: ProxyError, origin: Url) -> Self {
        Self {
            error,
            origin: Some(origin),
        }
    }
}

fn parse_origin(origin: &str) -> Option<Url> {
    Url::parse(origin)
        .ok()
        .filter(|url| matches!(url.scheme(), "http" | "https") && url.host_str().is_some())
}
