//! Response values handed to the HTTP layer.

/// Content type of every HTML response.
pub const HTML_CONTENT_TYPE: &str = "text/html; charset=utf-8";

/// Page served for any token failure. Identical for every cause.
pub const INVALID_TOKEN_HTML: &str = "<!doctype html><html><head><meta charset=\"utf-8\"><title>Unavailable</title></head><body><p>This content is unavailable or the link has expired.</p></body></html>";

/// Page served when the origin document exceeds the HTML size limit.
pub const CONTENT_TOO_LARGE_HTML: &str = "<!doctype html><html><head><meta charset=\"utf-8\"><title>Content too large</title></head><body><p>Content too large</p></body></html>";

/// Page served when the origin page cannot be fetched or processed.
pub const ORIGIN_UNAVAILABLE_HTML: &str = "<!doctype html><html><head><meta charset=\"utf-8\"><title>Unavailable</title></head><body><p>This content could not be loaded.</p></body></html>";

/// HTML document ready to be returned to the browser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HtmlResult {
    /// Document body.
    pub html: String,
    /// Value of the `Content-Type` header.
    pub content_type: String,
    /// Whether shared caches may store the response.
    pub cacheable: bool,
}

impl HtmlResult {
    /// A non-cacheable HTML page.
    pub fn page(html: impl Into<String>) -> Self {
        Self {
            html: html.into(),
            content_type: HTML_CONTENT_TYPE.to_string(),
            cacheable: false,
        }
    }

    /// The uniform token failure page.
    #[must_use]
    pub fn invalid_token() -> Self {
        Self::page(INVALID_TOKEN_HTML)
    }

    /// The oversize placeholder page.
    #[must_use]
    pub fn too_large() -> Self {
        Self::page(CONTENT_TOO_LARGE_HTML)
    }

    /// The page served when the origin fails.
    #[must_use]
    pub fn unavailable() -> Self {
        Self::page(ORIGIN_UNAVAILABLE_HTML)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_pages_are_distinct_and_uncacheable() {
        let pages = [
            HtmlResult::invalid_token(),
            HtmlResult::too_large(),
            HtmlResult::unavailable(),
        ];

        for page in &pages {
            assert_eq!(page.content_type, HTML_CONTENT_TYPE);
            assert!(!page.cacheable);
        }
        assert_ne!(pages[0], pages[2]);
        assert_ne!(pages[1], pages[2]);
    }
}
