//! The proxy's two request paths and token issuance.
//!
//! - [`ProxyService::resolve_token`]: token → origin page with image
//!   references rewritten to slug paths
//! - [`ProxyService::resolve_slug`]: slug → streaming image, or the
//!   placeholder when the origin cannot supply one within limits
//!
//! Token failures never reach the caller as errors. They are logged with
//! their cause and answered with one fixed page, so a client cannot tell an
//! expired token from a forged one.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};
use url::Url;

use opaque_frame_client::{FetchError, OriginClient};
use opaque_frame_common::{HtmlResult, OpaqueFrameConfig, ProxyOptions};

use crate::error::{ProxyError, Result};
use crate::image::ImageCopyHandle;
use crate::protect::{AeadProtector, Protector};
use crate::rewrite::HtmlRewriter;
use crate::slug::{SlugKey, is_valid_slug};
use crate::store::{FileMappingStore, MappingStore};
use crate::token::TokenCodec;

/// Orchestrates token validation, page rewriting and image streaming.
#[derive(Clone)]
pub struct ProxyService {
    options: Arc<ProxyOptions>,
    codec: TokenCodec,
    slug_key: Arc<SlugKey>,
    rewriter: HtmlRewriter,
    store: Arc<dyn MappingStore>,
    client: OriginClient,
    max_image_bytes: u64,
}

impl std::fmt::Debug for ProxyService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyService")
            .field("options", &self.options)
            .field("max_image_bytes", &self.max_image_bytes)
            .finish_non_exhaustive()
    }
}

impl ProxyService {
    /// Assembles a service from its collaborators.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Config`] if `options` fail validation.
    pub fn new(
        options: ProxyOptions,
        protector: Arc<dyn Protector>,
        slug_key: SlugKey,
        store: Arc<dyn MappingStore>,
        client: OriginClient,
        max_image_bytes: u64,
    ) -> Result<Self> {
        options.validate()?;

        let options = Arc::new(options);
        let slug_key = Arc::new(slug_key);

        Ok(Self {
            codec: TokenCodec::new(protector, Arc::clone(&options)),
            rewriter: HtmlRewriter::new(Arc::clone(&slug_key), Arc::clone(&options)),
            options,
            slug_key,
            store,
            client,
            max_image_bytes,
        })
    }

    /// Builds the default stack from configuration: AEAD protector, file
    /// mapping store and a fresh HTTP client.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the HTTP client
    /// cannot be created.
    pub fn from_config(config: &OpaqueFrameConfig) -> Result<Self> {
        config.validate()?;

        let protector = Arc::new(AeadProtector::from_options(&config.protection)?);
        let slug_key = SlugKey::from_options(&config.map)?;
        let store = Arc::new(FileMappingStore::new(config.map.map_root.clone()));
        let client = OriginClient::new(&config.fetch)?;

        Self::new(
            config.proxy.clone(),
            protector,
            slug_key,
            store,
            client,
            config.map.max_file_size_bytes,
        )
    }

    /// The validated proxy options.
    #[must_use]
    pub fn options(&self) -> &ProxyOptions {
        &self.options
    }

    /// The token codec.
    #[must_use]
    pub const fn codec(&self) -> &TokenCodec {
        &self.codec
    }

    /// Computes the slug the rewriter would assign to `url`.
    #[must_use]
    pub fn slug_for(&self, url: &str) -> String {
        self.slug_key.slug_for(url)
    }

    /// Issues a token for `origin`.
    ///
    /// # Errors
    ///
    /// - [`ProxyError::InvalidArgument`] if `origin` is not absolute
    /// - [`ProxyError::HostNotAllowed`] if its host is not on the HTML
    ///   allowlist
    pub fn issue_token(
        &self,
        origin: &str,
        ttl: Option<Duration>,
        extra_claims: Option<BTreeMap<String, Value>>,
    ) -> Result<String> {
        self.codec.encode(origin, ttl, extra_claims)
    }

    /// Issues a token and returns the relative path of the HTML endpoint
    /// for it, ready for an `<iframe src>`.
    ///
    /// # Errors
    ///
    /// See [`issue_token`](Self::issue_token).
    pub fn issue_url(
        &self,
        origin: &str,
        ttl: Option<Duration>,
        extra_claims: Option<BTreeMap<String, Value>>,
    ) -> Result<String> {
        let token = self.issue_token(origin, ttl, extra_claims)?;
        Ok(self.options.html_path(&token))
    }

    /// Resolves a token to the rewritten origin page.
    ///
    /// Never fails: invalid, expired or disallowed tokens yield the fixed
    /// diagnostic page, an origin page over the size limit yields the
    /// "content too large" page, and an origin that cannot be fetched or
    /// processed yields the "unavailable" page. Every result is marked
    /// non-cacheable.
    #[instrument(skip(self, token))]
    pub async fn resolve_token(&self, token: &str) -> HtmlResult {
        let Ok(decoded) = self.codec.decode(token) else {
            return HtmlResult::invalid_token();
        };
        let origin = decoded.origin;
        let limit = u64::try_from(self.options.max_html_size_bytes).unwrap_or(u64::MAX);

        let (body, content_type) = match self.fetch_page(&origin, limit).await {
            Ok(page) => page,
            Err(FetchError::SizeExceeded { observed, .. }) => {
                let err = ProxyError::ContentTooLarge { limit, observed };
                warn!(origin = %origin, cause = err.cause(), error = %err, "Origin page over size limit");
                return HtmlResult::too_large();
            }
            Err(err) => {
                let err = ProxyError::from(err);
                warn!(
                    origin = %origin,
                    host = origin.host_str().unwrap_or_default(),
                    cause = err.cause(),
                    error = %err,
                    "Origin page fetch failed"
                );
                return HtmlResult::unavailable();
            }
        };

        let rewritten = match self
            .rewriter
            .rewrite_with_content_type(&body, &origin, content_type.as_deref())
        {
            Ok(rewritten) => rewritten,
            Err(err) => {
                warn!(origin = %origin, cause = err.cause(), error = %err, "Origin page could not be rewritten");
                return HtmlResult::unavailable();
            }
        };
        if rewritten.too_large {
            let err = ProxyError::ContentTooLarge {
                limit,
                observed: body.len() as u64,
            };
            warn!(origin = %origin, cause = err.cause(), error = %err, "Origin page over size limit");
            return HtmlResult::too_large();
        }

        for (slug, url) in &rewritten.mappings {
            if let Err(err) = self.store.persist(slug, url).await {
                error!(slug = %slug, url = %url, error = %err, "Failed to persist image mapping");
            }
        }

        info!(
            origin = %origin,
            encoding = decoded.encoding.as_str(),
            rewritten = rewritten.rewritten,
            "Served proxied page"
        );
        HtmlResult::page(rewritten.html)
    }

    async fn fetch_page(
        &self,
        origin: &Url,
        limit: u64,
    ) -> std::result::Result<(Bytes, Option<String>), FetchError> {
        let response = self
            .client
            .fetch_bounded_within(origin, limit, |host| self.options.is_html_host_allowed(host))
            .await?;
        let content_type = response.content_type().map(String::from);
        Ok((response.read_to_bytes().await?, content_type))
    }

    /// Resolves a slug to an image.
    ///
    /// A slug that is malformed, unknown, or maps to a host no longer on the
    /// image allowlist is [`ProxyError::NotFound`]. Once a mapping is found,
    /// any upstream failure (bad status, declared size over the limit,
    /// transport error) yields the placeholder image instead of an error.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::NotFound`] as above, or
    /// [`ProxyError::Storage`] if the mapping store cannot be read.
    #[instrument(skip(self), fields(slug = %slug))]
    pub async fn resolve_slug(&self, slug: &str) -> Result<ImageCopyHandle> {
        if !is_valid_slug(slug) {
            debug!("Malformed slug");
            return Err(ProxyError::NotFound);
        }

        let Some(stored) = self.store.lookup(slug).await? else {
            debug!("Unknown slug");
            return Err(ProxyError::NotFound);
        };

        let Ok(url) = Url::parse(&stored) else {
            warn!(url = %stored, "Stored mapping is not a URL");
            return Err(ProxyError::NotFound);
        };

        let host = url.host_str().unwrap_or_default();
        if !self.options.is_image_host_allowed(host) {
            warn!(host, "Mapped host is no longer allowed");
            return Err(ProxyError::NotFound);
        }

        let max_age = self.options.image_max_age();
        let fetched = self
            .client
            .fetch_bounded_within(&url, self.max_image_bytes, |host| {
                self.options.is_image_host_allowed(host)
            })
            .await;

        match fetched {
            Ok(response) => Ok(ImageCopyHandle::upstream(response, max_age)),
            Err(err) if err.is_transport() => {
                warn!(url = %url, error = %err, "Origin unreachable, serving placeholder image");
                Ok(ImageCopyHandle::fallback(max_age))
            }
            Err(err) => {
                info!(
                    url = %url,
                    limit = self.max_image_bytes,
                    error = %err,
                    "Serving placeholder image"
                );
                Ok(ImageCopyHandle::fallback(max_age))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use opaque_frame_common::content::{
        CONTENT_TOO_LARGE_HTML, INVALID_TOKEN_HTML, ORIGIN_UNAVAILABLE_HTML,
    };
    use tokio_util::sync::CancellationToken;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::image::FALLBACK_PNG;
    use crate::store::MemoryMappingStore;

    struct Fixture {
        service: ProxyService,
        store: Arc<MemoryMappingStore>,
        server: MockServer,
        origin: String,
    }

    /// A service whose client resolves `news.example` to a mock server.
    async fn fixture_with(configure: impl FnOnce(&mut ProxyOptions), max_image_bytes: u64) -> Fixture {
        let server = MockServer::start().await;
        let origin = format!("http://news.example:{}", server.address().port());

        let mut options = ProxyOptions::builder()
            .allowed_html_hosts(vec!["news.example".to_string()])
            .allowed_image_hosts(vec!["news.example".to_string()])
            .build();
        configure(&mut options);

        let client = OriginClient::from_builder(
            reqwest::Client::builder().resolve("news.example", *server.address()),
        )
        .unwrap();
        let store = Arc::new(MemoryMappingStore::new());
        let service = ProxyService::new(
            options,
            Arc::new(AeadProtector::new(&[3u8; 32], "service-test").unwrap()),
            SlugKey::new(b"service-test-slug-secret").unwrap(),
            store.clone(),
            client,
            max_image_bytes,
        )
        .unwrap();

        Fixture {
            service,
            store,
            server,
            origin,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(|_| {}, 1024).await
    }

    async fn mount_page(server: &MockServer, route: &str, html: &str) {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(200).set_body_raw(html.to_string(), "text/html"))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_end_to_end_page_and_image() {
        let fx = fixture().await;
        mount_page(&fx.server, "/a", r#"<html><body><img src="/logo.png"></body></html>"#).await;
        Mock::given(method("GET"))
            .and(path("/logo.png"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("etag", "\"logo-1\"")
                    .set_body_raw(b"PNGDATA".to_vec(), "image/png"),
            )
            .mount(&fx.server)
            .await;

        let token = fx
            .service
            .issue_token(&format!("{}/a", fx.origin), None, None)
            .unwrap();
        let page = fx.service.resolve_token(&token).await;

        let image_url = format!("{}/logo.png", fx.origin);
        let slug = fx.service.slug_for(&image_url);
        let expected_src = fx.service.options().image_path(&slug);

        assert!(page.html.contains(&format!(r#"<img src="{expected_src}">"#)));
        assert!(!page.html.contains("/logo.png\""));
        assert_eq!(page.content_type, "text/html; charset=utf-8");
        assert!(!page.cacheable);
        assert_eq!(
            fx.store.lookup(&slug).await.unwrap().as_deref(),
            Some(image_url.as_str())
        );

        let image = fx.service.resolve_slug(&slug).await.unwrap();
        assert!(!image.is_fallback());
        assert_eq!(image.content_type(), "image/png");
        assert_eq!(image.etag(), Some("\"logo-1\""));
        assert_eq!(image.max_age(), Duration::from_secs(30 * 24 * 60 * 60));

        let mut body: Vec<u8> = Vec::new();
        image
            .copy_to(&mut body, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(body, b"PNGDATA");
    }

    #[tokio::test]
    async fn test_invalid_token_yields_diagnostic_page() {
        let fx = fixture().await;
        let page = fx.service.resolve_token("garbage").await;

        assert_eq!(page.html, INVALID_TOKEN_HTML);
        assert!(!page.cacheable);
    }

    #[tokio::test]
    async fn test_expired_token_never_fetches() {
        let fx = fixture().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&fx.server)
            .await;

        let token = fx
            .service
            .codec()
            .encode_at(&format!("{}/a", fx.origin), 1_000, Some(Duration::from_secs(60)), None)
            .unwrap();
        let page = fx.service.resolve_token(&token).await;

        assert_eq!(page, HtmlResult::invalid_token());
    }

    #[tokio::test]
    async fn test_failure_pages_are_identical() {
        let fx = fixture().await;
        let expired = fx
            .service
            .codec()
            .encode_at(&format!("{}/a", fx.origin), 1_000, Some(Duration::from_secs(60)), None)
            .unwrap();

        let a = fx.service.resolve_token(&expired).await;
        let b = fx.service.resolve_token("not-a-token").await;
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_oversize_page_yields_placeholder_page() {
        let fx = fixture_with(|o| o.max_html_size_bytes = 64, 1024).await;
        mount_page(&fx.server, "/big", &"x".repeat(1000)).await;

        let token = fx
            .service
            .issue_token(&format!("{}/big", fx.origin), None, None)
            .unwrap();
        let page = fx.service.resolve_token(&token).await;

        assert_eq!(page.html, CONTENT_TOO_LARGE_HTML);
        assert!(fx.store.is_empty());
    }

    #[tokio::test]
    async fn test_origin_error_yields_unavailable_page() {
        let fx = fixture().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&fx.server)
            .await;

        let token = fx
            .service
            .issue_token(&format!("{}/a", fx.origin), None, None)
            .unwrap();
        let page = fx.service.resolve_token(&token).await;

        assert_eq!(page.html, ORIGIN_UNAVAILABLE_HTML);
        assert_eq!(page.content_type, "text/html; charset=utf-8");
        assert!(!page.cacheable);
    }

    #[tokio::test]
    async fn test_page_redirect_to_internal_host_not_followed() {
        let fx = fixture().await;
        let internal = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("INTERNAL-SECRET"))
            .expect(0)
            .mount(&internal)
            .await;
        Mock::given(method("GET"))
            .and(path("/a"))
            .respond_with(
                ResponseTemplate::new(302).insert_header("location", format!("{}/admin", internal.uri())),
            )
            .mount(&fx.server)
            .await;

        let token = fx
            .service
            .issue_token(&format!("{}/a", fx.origin), None, None)
            .unwrap();
        let page = fx.service.resolve_token(&token).await;

        assert_eq!(page, HtmlResult::unavailable());
    }

    #[tokio::test]
    async fn test_page_charset_from_content_type() {
        let fx = fixture().await;
        Mock::given(method("GET"))
            .and(path("/latin"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(b"<p>na\xefve</p>".to_vec(), "text/html; charset=iso-8859-1"),
            )
            .mount(&fx.server)
            .await;

        let token = fx
            .service
            .issue_token(&format!("{}/latin", fx.origin), None, None)
            .unwrap();
        let page = fx.service.resolve_token(&token).await;

        assert_eq!(page.html, "<p>naïve</p>");
    }

    #[tokio::test]
    async fn test_disallowed_images_not_mapped() {
        let fx = fixture().await;
        mount_page(&fx.server, "/a", r#"<img src="https://evil.example/x.png">"#).await;

        let token = fx
            .service
            .issue_token(&format!("{}/a", fx.origin), None, None)
            .unwrap();
        let page = fx.service.resolve_token(&token).await;

        assert_eq!(page.html, r#"<img src="https://evil.example/x.png">"#);
        assert!(fx.store.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_slug_is_not_found() {
        let fx = fixture().await;
        let slug = fx.service.slug_for("http://news.example/never-seen.png");

        assert!(matches!(
            fx.service.resolve_slug(&slug).await,
            Err(ProxyError::NotFound)
        ));
        assert!(matches!(
            fx.service.resolve_slug("../etc/passwd").await,
            Err(ProxyError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_mapped_host_rechecked() {
        let fx = fixture().await;
        let url = "https://evil.example/x.png";
        let slug = fx.service.slug_for(url);
        fx.store.persist(&slug, url).await.unwrap();

        assert!(matches!(
            fx.service.resolve_slug(&slug).await,
            Err(ProxyError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_upstream_error_yields_fallback() {
        let fx = fixture().await;
        Mock::given(method("GET"))
            .and(path("/gone.png"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&fx.server)
            .await;

        let url = format!("{}/gone.png", fx.origin);
        let slug = fx.service.slug_for(&url);
        fx.store.persist(&slug, &url).await.unwrap();

        let image = fx.service.resolve_slug(&slug).await.unwrap();
        assert!(image.is_fallback());

        let mut body: Vec<u8> = Vec::new();
        image
            .copy_to(&mut body, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(body, FALLBACK_PNG);
    }

    #[tokio::test]
    async fn test_image_redirect_to_internal_host_yields_fallback() {
        let fx = fixture().await;
        let internal = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("INTERNAL-SECRET"))
            .expect(0)
            .mount(&internal)
            .await;
        Mock::given(method("GET"))
            .and(path("/hop.png"))
            .respond_with(
                ResponseTemplate::new(302).insert_header("location", format!("{}/secret", internal.uri())),
            )
            .mount(&fx.server)
            .await;

        let url = format!("{}/hop.png", fx.origin);
        let slug = fx.service.slug_for(&url);
        fx.store.persist(&slug, &url).await.unwrap();

        let image = fx.service.resolve_slug(&slug).await.unwrap();
        assert!(image.is_fallback());

        let mut body: Vec<u8> = Vec::new();
        image
            .copy_to(&mut body, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(body, FALLBACK_PNG);
    }

    #[tokio::test]
    async fn test_image_redirect_within_allowlist_followed() {
        let fx = fixture().await;
        Mock::given(method("GET"))
            .and(path("/moved.png"))
            .respond_with(ResponseTemplate::new(301).insert_header("location", "/current.png"))
            .mount(&fx.server)
            .await;
        Mock::given(method("GET"))
            .and(path("/current.png"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(b"PNGDATA".to_vec(), "image/png"))
            .mount(&fx.server)
            .await;

        let url = format!("{}/moved.png", fx.origin);
        let slug = fx.service.slug_for(&url);
        fx.store.persist(&slug, &url).await.unwrap();

        let image = fx.service.resolve_slug(&slug).await.unwrap();
        assert!(!image.is_fallback());
        assert_eq!(image.content_type(), "image/png");
    }

    #[tokio::test]
    async fn test_declared_oversize_image_yields_fallback() {
        let fx = fixture_with(|_| {}, 100).await;
        Mock::given(method("GET"))
            .and(path("/huge.png"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(vec![0u8; 4096], "image/png"))
            .mount(&fx.server)
            .await;

        let url = format!("{}/huge.png", fx.origin);
        let slug = fx.service.slug_for(&url);
        fx.store.persist(&slug, &url).await.unwrap();

        let image = fx.service.resolve_slug(&slug).await.unwrap();
        assert!(image.is_fallback());
        assert_eq!(image.content_type(), "image/png");
    }

    #[tokio::test]
    async fn test_issue_url() {
        let fx = fixture().await;
        let path = fx
            .service
            .issue_url(&format!("{}/a", fx.origin), None, None)
            .unwrap();

        let token = path.strip_prefix("/proxy/t/").expect("html route prefix");
        assert!(fx.service.codec().decode(token).is_ok());
    }

    #[tokio::test]
    async fn test_issue_token_rejections() {
        let fx = fixture().await;

        assert!(matches!(
            fx.service.issue_token("https://evil.example/", None, None),
            Err(ProxyError::HostNotAllowed(_))
        ));
        assert!(matches!(
            fx.service.issue_token("/relative", None, None),
            Err(ProxyError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_from_config_uses_file_store() {
        let dir = tempfile::TempDir::new().unwrap();
        let toml = format!(
            r#"
[proxy]
allowed_html_hosts = ["news.example"]
allowed_image_hosts = ["news.example"]

[map]
map_root = "{}"
slug_secret = "from-config-slug-secret!"

[protection]
key = "AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8"
"#,
            dir.path().display()
        );
        let config = OpaqueFrameConfig::from_toml_str(&toml).unwrap();
        let service = ProxyService::from_config(&config).unwrap();

        let direct = SlugKey::new(b"from-config-slug-secret!").unwrap();
        assert_eq!(
            service.slug_for("https://news.example/a.png"),
            direct.slug_for("https://news.example/a.png")
        );
    }
}
