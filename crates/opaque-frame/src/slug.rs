//! Keyed slugs for image URLs.

use std::fmt::{self, Write};

use hmac::{Hmac, Mac};
use sha2::Sha256;

use opaque_frame_common::config::MIN_SLUG_SECRET_BYTES;
use opaque_frame_common::{ConfigError, MapOptions};

use crate::error::Result;

type HmacSha256 = Hmac<Sha256>;

/// Length of a slug in hex characters.
pub const SLUG_LEN: usize = 64;

/// Returns `true` if `slug` has the shape of a slug: 64 lowercase hex digits.
#[must_use]
pub fn is_valid_slug(slug: &str) -> bool {
    slug.len() == SLUG_LEN && slug.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// HMAC-SHA-256 key that turns URLs into slugs.
///
/// The slug of a URL is the lowercase hex digest of its UTF-8 bytes. It is
/// stable for a given key and reveals nothing about the URL.
#[derive(Clone)]
pub struct SlugKey {
    mac: HmacSha256,
}

impl fmt::Debug for SlugKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SlugKey { .. }")
    }
}

impl SlugKey {
    /// Creates a key from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::SecretTooShort`] for keys under 16 bytes.
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.len() < MIN_SLUG_SECRET_BYTES {
            return Err(ConfigError::SecretTooShort {
                min: MIN_SLUG_SECRET_BYTES,
                actual: key.len(),
            }
            .into());
        }

        // HMAC accepts keys of any length
        let mac = HmacSha256::new_from_slice(key).map_err(|_| ConfigError::SecretTooShort {
            min: MIN_SLUG_SECRET_BYTES,
            actual: key.len(),
        })?;

        Ok(Self { mac })
    }

    /// Creates a key from the configured slug secret.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::SecretTooShort`] if the decoded secret is under
    /// 16 bytes.
    pub fn from_options(options: &MapOptions) -> Result<Self> {
        Self::new(&options.key_bytes())
    }

    /// Computes the slug of `url`.
    #[must_use]
    pub fn slug_for(&self, url: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(url.as_bytes());
        let digest = mac.finalize().into_bytes();

        let mut slug = String::with_capacity(SLUG_LEN);
        for byte in digest {
            let _ = write!(slug, "{byte:02x}");
        }
        slug
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_known_digest() {
        // RFC 4231 test case 1
        let key = SlugKey::new(&[0x0b; 20]).unwrap();
        assert_eq!(
            key.slug_for("Hi There"),
            "b0344c61d8db38535ca8afceaf0bf12b881dc200c9833da726e9376c2e32cff7"
        );
    }

    #[test]
    fn test_slug_shape() {
        let key = SlugKey::new(b"0123456789abcdef").unwrap();
        let slug = key.slug_for("https://news.example/logo.png");
        assert!(is_valid_slug(&slug));
    }

    #[test]
    fn test_short_key_rejected() {
        assert!(SlugKey::new(b"too-short").is_err());
    }

    #[test]
    fn test_from_options_decodes_base64url() {
        // 18 bytes once decoded
        let options = MapOptions::new("AAECAwQFBgcICQoLDA0ODxAR");
        let key = SlugKey::from_options(&options).unwrap();
        let direct = SlugKey::new(&(0u8..18).collect::<Vec<_>>()).unwrap();
        assert_eq!(key.slug_for("x"), direct.slug_for("x"));
    }

    #[test]
    fn test_slug_validation() {
        assert!(is_valid_slug(&"a".repeat(64)));
        assert!(!is_valid_slug(&"A".repeat(64)));
        assert!(!is_valid_slug(&"a".repeat(63)));
        assert!(!is_valid_slug("../../etc/passwd"));
    }
}

#[cfg(test)]
mod proptests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn fuzz_slug_is_deterministic(url in ".{0,200}") {
            let key = SlugKey::new(b"a-sixteen-byte-key!").unwrap();
            prop_assert_eq!(key.slug_for(&url), key.slug_for(&url));
            prop_assert!(is_valid_slug(&key.slug_for(&url)));
        }

        #[test]
        fn fuzz_distinct_urls_distinct_slugs(a in ".{0,100}", b in ".{0,100}") {
            prop_assume!(a != b);
            let key = SlugKey::new(b"a-sixteen-byte-key!").unwrap();
            prop_assert_ne!(key.slug_for(&a), key.slug_for(&b));
        }

        #[test]
        fn fuzz_distinct_keys_distinct_slugs(url in ".{0,100}") {
            let a = SlugKey::new(b"first-sixteen-byte-key").unwrap();
            let b = SlugKey::new(b"second-sixteen-byte-key").unwrap();
            prop_assert_ne!(a.slug_for(&url), b.slug_for(&url));
        }
    }
}
