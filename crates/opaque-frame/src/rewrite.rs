//! `<img src>` rewriting.
//!
//! Every `img[src]` in the document is visited in order. Those that resolve
//! to an allowlisted image host get their `src` replaced with the proxy's
//! image path for the URL's slug; everything else is left as it was. The
//! rewriter is a pure transformation: the slug to URL pairs it produced are
//! returned to the caller, who persists them before serving the document.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::Arc;

use encoding_rs::{Encoding, UTF_8};
use lol_html::{HtmlRewriter as StreamingRewriter, Settings, element};
use tracing::{debug, warn};
use url::Url;

use opaque_frame_common::ProxyOptions;
use opaque_frame_common::content::CONTENT_TOO_LARGE_HTML;

use crate::error::{ProxyError, Result};
use crate::slug::SlugKey;

/// Result of rewriting one document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RewrittenHtml {
    /// The serialized document.
    pub html: String,
    /// Number of `src` attributes replaced.
    pub rewritten: usize,
    /// Slug to absolute URL for every replaced attribute.
    pub mappings: BTreeMap<String, String>,
    /// The input exceeded the size limit and was not parsed.
    pub too_large: bool,
}

/// Rewrites image references in fetched HTML.
#[derive(Debug, Clone)]
pub struct HtmlRewriter {
    slug_key: Arc<SlugKey>,
    options: Arc<ProxyOptions>,
}

impl HtmlRewriter {
    /// Creates a rewriter using the allowlist, limits and routes in
    /// `options`.
    pub fn new(slug_key: Arc<SlugKey>, options: Arc<ProxyOptions>) -> Self {
        Self { slug_key, options }
    }

    /// Rewrites UTF-8 `html`, resolving relative references against `base`.
    ///
    /// # Errors
    ///
    /// See [`rewrite_with_content_type`](Self::rewrite_with_content_type).
    pub fn rewrite(&self, html: &[u8], base: &Url) -> Result<RewrittenHtml> {
        self.rewrite_with_content_type(html, base, None)
    }

    /// Rewrites `html` as served with `content_type`, resolving relative
    /// references against `base`.
    ///
    /// The body is decoded using the `charset` parameter of `content_type`
    /// (UTF-8 when absent or unknown; a byte order mark wins) and the output
    /// is always UTF-8. Input over the configured HTML size limit, measured
    /// in encoded bytes, is not parsed; the result is the fixed "content too
    /// large" page instead.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::InvalidArgument`] if the HTML stream cannot be
    /// processed at all. A malformed individual `src` is never an error.
    pub fn rewrite_with_content_type(
        &self,
        html: &[u8],
        base: &Url,
        content_type: Option<&str>,
    ) -> Result<RewrittenHtml> {
        let limit = self.options.max_html_size_bytes;
        if html.len() > limit {
            warn!(
                origin = %base,
                limit,
                total = html.len(),
                "HTML over size limit, not rewriting"
            );
            return Ok(RewrittenHtml {
                html: CONTENT_TOO_LARGE_HTML.to_string(),
                too_large: true,
                ..RewrittenHtml::default()
            });
        }

        let encoding = content_type
            .and_then(charset_label)
            .and_then(|label| Encoding::for_label(label.as_bytes()))
            .unwrap_or(UTF_8);
        let (decoded, used, lossy) = encoding.decode(html);
        if lossy {
            debug!(origin = %base, charset = used.name(), "Replaced undecodable bytes");
        }
        let html = decoded.as_bytes();

        let max_rewrites = self.options.max_img_rewrite;
        let visited = RefCell::new(0usize);
        let replaced = RefCell::new(0usize);
        let mappings = RefCell::new(BTreeMap::new());
        let mut output = Vec::with_capacity(html.len());

        let mut rewriter = StreamingRewriter::new(
            Settings {
                element_content_handlers: vec![element!("img[src]", |el| {
                    let mut visited = visited.borrow_mut();
                    if *visited >= max_rewrites {
                        return Ok(());
                    }
                    *visited += 1;

                    let Some(src) = el.get_attribute("src") else {
                        return Ok(());
                    };
                    if let Some((slug, url)) = self.proxied(&src, base) {
                        el.set_attribute("src", &self.options.image_path(&slug))?;
                        mappings.borrow_mut().insert(slug, url);
                        *replaced.borrow_mut() += 1;
                    }
                    Ok(())
                })],
                ..Settings::default()
            },
            |chunk: &[u8]| output.extend_from_slice(chunk),
        );

        rewriter
            .write(html)
            .and_then(|()| rewriter.end())
            .map_err(|e| ProxyError::InvalidArgument(format!("unprocessable HTML: {e}")))?;

        let rewritten = replaced.into_inner();
        debug!(
            origin = %base,
            visited = visited.into_inner(),
            rewritten,
            "Rewrote image references"
        );

        Ok(RewrittenHtml {
            html: String::from_utf8_lossy(&output).into_owned(),
            rewritten,
            mappings: mappings.into_inner(),
            too_large: false,
        })
    }

    /// Resolves `src` and returns its slug and absolute URL if it may be
    /// proxied.
    fn proxied(&self, src: &str, base: &Url) -> Option<(String, String)> {
        if src.trim().is_empty() {
            return None;
        }

        let url = base.join(src).ok()?;
        let host = url.host_str()?;
        if !self.options.is_image_host_allowed(host) {
            return None;
        }

        Some((self.slug_key.slug_for(url.as_str()), url.into()))
    }
}

/// Extracts the `charset` parameter of a `Content-Type` value.
fn charset_label(content_type: &str) -> Option<&str> {
    content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        name.trim()
            .eq_ignore_ascii_case("charset")
            .then(|| value.trim().trim_matches('"'))
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::fmt::Write;

    use super::*;

    fn options() -> ProxyOptions {
        ProxyOptions::builder()
            .allowed_html_hosts(vec!["news.example".to_string()])
            .allowed_image_hosts(vec!["news.example".to_string(), "cdn.news.example".to_string()])
            .build()
    }

    fn rewriter_with(options: ProxyOptions) -> (HtmlRewriter, Arc<SlugKey>) {
        let key = Arc::new(SlugKey::new(b"rewrite-test-secret").unwrap());
        (HtmlRewriter::new(Arc::clone(&key), Arc::new(options)), key)
    }

    fn base() -> Url {
        Url::parse("https://news.example/articles/today").unwrap()
    }

    #[test]
    fn test_relative_src_rewritten() {
        let (rewriter, key) = rewriter_with(options());
        let out = rewriter
            .rewrite(br#"<p><img src="/logo.png" alt="x"></p>"#, &base())
            .unwrap();

        let slug = key.slug_for("https://news.example/logo.png");
        assert_eq!(
            out.html,
            format!(r#"<p><img src="/proxy/img/s/{slug}" alt="x"></p>"#)
        );
        assert_eq!(out.rewritten, 1);
        assert_eq!(
            out.mappings.get(&slug).map(String::as_str),
            Some("https://news.example/logo.png")
        );
    }

    #[test]
    fn test_path_relative_src_resolved_against_base() {
        let (rewriter, key) = rewriter_with(options());
        let out = rewriter.rewrite(br#"<img src="pic.jpg">"#, &base()).unwrap();

        let slug = key.slug_for("https://news.example/articles/pic.jpg");
        assert!(out.html.contains(&slug));
    }

    #[test]
    fn test_disallowed_host_left_alone() {
        let (rewriter, _) = rewriter_with(options());
        let input = r#"<img src="https://evil.example/x.png">"#;
        let out = rewriter.rewrite(input.as_bytes(), &base()).unwrap();

        assert_eq!(out.html, input);
        assert_eq!(out.rewritten, 0);
        assert!(out.mappings.is_empty());
    }

    #[test]
    fn test_host_match_ignores_case() {
        let (rewriter, _) = rewriter_with(options());
        let out = rewriter
            .rewrite(br#"<img src="https://CDN.News.Example/a.png">"#, &base())
            .unwrap();
        assert_eq!(out.rewritten, 1);
    }

    #[test]
    fn test_empty_and_data_src_skipped() {
        let (rewriter, _) = rewriter_with(options());
        let input = r#"<img src=""><img src="   "><img src="data:image/png;base64,AAAA">"#;
        let out = rewriter.rewrite(input.as_bytes(), &base()).unwrap();

        assert_eq!(out.html, input);
        assert_eq!(out.rewritten, 0);
    }

    #[test]
    fn test_rewrite_cap_leaves_rest_untouched() {
        let (rewriter, key) = rewriter_with(options());

        let mut input = String::new();
        for i in 0..301 {
            let _ = write!(input, r#"<img src="/img/{i}.png">"#);
        }
        let out = rewriter.rewrite(input.as_bytes(), &base()).unwrap();

        assert_eq!(out.rewritten, 300);
        for i in 0..300 {
            let slug = key.slug_for(&format!("https://news.example/img/{i}.png"));
            assert!(out.html.contains(&slug));
        }
        assert!(out.html.ends_with(r#"<img src="/img/300.png">"#));
    }

    #[test]
    fn test_skipped_elements_count_toward_cap() {
        let mut opts = options();
        opts.max_img_rewrite = 2;
        let (rewriter, _) = rewriter_with(opts);

        let input = r#"<img src="https://evil.example/a.png"><img src="/b.png"><img src="/c.png">"#;
        let out = rewriter.rewrite(input.as_bytes(), &base()).unwrap();

        assert_eq!(out.rewritten, 1);
        assert!(out.html.ends_with(r#"<img src="/c.png">"#));
    }

    #[test]
    fn test_oversize_input_short_circuits() {
        let mut opts = options();
        opts.max_html_size_bytes = 16;
        let (rewriter, _) = rewriter_with(opts);

        let out = rewriter
            .rewrite(br#"<img src="/logo.png"><p>more than sixteen bytes</p>"#, &base())
            .unwrap();

        assert!(out.too_large);
        assert_eq!(out.html, CONTENT_TOO_LARGE_HTML);
        assert!(out.mappings.is_empty());
    }

    #[test]
    fn test_malformed_markup_tolerated() {
        let (rewriter, _) = rewriter_with(options());
        let out = rewriter
            .rewrite(br#"<div><p>unclosed <img src="/a.png"><b>bold</i></div"#, &base())
            .unwrap();

        assert_eq!(out.rewritten, 1);
        assert!(out.html.contains("unclosed"));
    }

    #[test]
    fn test_path_base_prefixed() {
        let mut opts = options();
        opts.path_base = "/app".to_string();
        let (rewriter, key) = rewriter_with(opts);

        let out = rewriter.rewrite(br#"<img src="/logo.png">"#, &base()).unwrap();
        let slug = key.slug_for("https://news.example/logo.png");
        assert_eq!(out.html, format!(r#"<img src="/app/proxy/img/s/{slug}">"#));
    }

    #[test]
    fn test_declared_charset_decoded() {
        let (rewriter, _) = rewriter_with(options());
        // "Café" in windows-1252
        let input = b"<p>Caf\xe9</p><img src=\"/a.png\">";
        let out = rewriter
            .rewrite_with_content_type(input, &base(), Some("text/html; charset=windows-1252"))
            .unwrap();

        assert!(out.html.starts_with("<p>Café</p>"));
        assert!(!out.html.contains('\u{FFFD}'));
        assert_eq!(out.rewritten, 1);
    }

    #[test]
    fn test_unknown_charset_falls_back_to_utf8() {
        let (rewriter, _) = rewriter_with(options());
        let out = rewriter
            .rewrite_with_content_type("<p>Café</p>".as_bytes(), &base(), Some("text/html; charset=bogus"))
            .unwrap();
        assert_eq!(out.html, "<p>Café</p>");
    }

    #[test]
    fn test_charset_label_parsing() {
        assert_eq!(charset_label("text/html; charset=ISO-8859-1"), Some("ISO-8859-1"));
        assert_eq!(charset_label("text/html;Charset=\"utf-8\""), Some("utf-8"));
        assert_eq!(charset_label("text/html"), None);
        assert_eq!(charset_label("text/html; boundary=x"), None);
    }

    #[test]
    fn test_duplicate_images_share_a_mapping() {
        let (rewriter, _) = rewriter_with(options());
        let out = rewriter
            .rewrite(br#"<img src="/a.png"><img src="https://news.example/a.png">"#, &base())
            .unwrap();

        assert_eq!(out.mappings.len(), 1);
        assert_eq!(out.rewritten, 2);
    }
}
