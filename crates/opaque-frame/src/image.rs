//! Single-use image responses.
//!
//! An [`ImageCopyHandle`] carries the response metadata plus the body source:
//! either a live upstream connection or the built-in placeholder image. The
//! copy methods take the handle by value, so each body is delivered at most
//! once and the upstream connection is released on every exit path.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use opaque_frame_client::{BoundedResponse, FetchError};

use crate::error::{ProxyError, Result};

/// Content type used when the origin does not send one.
pub const DEFAULT_IMAGE_CONTENT_TYPE: &str = "application/octet-stream";

/// Content type of the placeholder image.
pub const FALLBACK_CONTENT_TYPE: &str = "image/png";

/// A 1x1 transparent PNG.
pub const FALLBACK_PNG: &[u8] = &[
    0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a, 0x00, 0x00, 0x00, 0x0d, 0x49, 0x48, 0x44, 0x52,
    0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x04, 0x00, 0x00, 0x00, 0xb5, 0x1c, 0x0c,
    0x02, 0x00, 0x00, 0x00, 0x0b, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9c, 0x63, 0x60, 0x60, 0x00, 0x00,
    0x00, 0x03, 0x00, 0x01, 0x2b, 0x09, 0x4d, 0x84, 0x00, 0x00, 0x00, 0x00, 0x49, 0x45, 0x4e, 0x44,
    0xae, 0x42, 0x60, 0x82,
];

enum Source {
    Upstream(BoundedResponse),
    Fallback,
}

/// Metadata and body of an image ready to be sent to the browser.
pub struct ImageCopyHandle {
    content_type: String,
    length: Option<u64>,
    etag: Option<String>,
    max_age: Duration,
    source: Source,
}

impl fmt::Debug for ImageCopyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageCopyHandle")
            .field("content_type", &self.content_type)
            .field("length", &self.length)
            .field("etag", &self.etag)
            .field("max_age", &self.max_age)
            .field("fallback", &self.is_fallback())
            .finish()
    }
}

impl ImageCopyHandle {
    /// Wraps an open upstream response.
    #[must_use]
    pub fn upstream(response: BoundedResponse, max_age: Duration) -> Self {
        Self {
            content_type: response
                .content_type()
                .unwrap_or(DEFAULT_IMAGE_CONTENT_TYPE)
                .to_string(),
            length: response.content_length(),
            etag: response.etag().map(String::from),
            max_age,
            source: Source::Upstream(response),
        }
    }

    /// The placeholder image.
    #[must_use]
    pub fn fallback(max_age: Duration) -> Self {
        Self {
            content_type: FALLBACK_CONTENT_TYPE.to_string(),
            length: Some(FALLBACK_PNG.len() as u64),
            etag: None,
            max_age,
            source: Source::Fallback,
        }
    }

    /// Value for the `Content-Type` header.
    #[must_use]
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Value for the `Content-Length` header, when known in advance.
    #[must_use]
    pub const fn length(&self) -> Option<u64> {
        self.length
    }

    /// The origin's `ETag`, if any.
    #[must_use]
    pub fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }

    /// Recommended cache lifetime.
    #[must_use]
    pub const fn max_age(&self) -> Duration {
        self.max_age
    }

    /// Returns `true` if this is the placeholder image.
    #[must_use]
    pub const fn is_fallback(&self) -> bool {
        matches!(self.source, Source::Fallback)
    }

    /// Writes the body into `dst`, returning the number of bytes written.
    ///
    /// # Errors
    ///
    /// - [`ProxyError::Cancelled`] if `cancel` fires before the copy finishes
    /// - [`ProxyError::SizeExceeded`] if an undeclared-length body passes the
    ///   image size limit; the bytes already written are all within the limit
    /// - [`ProxyError::FetchFailed`] for connection or write failures
    pub async fn copy_to<W>(self, dst: &mut W, cancel: &CancellationToken) -> Result<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let response = match self.source {
            Source::Fallback => {
                dst.write_all(FALLBACK_PNG).await.map_err(FetchError::from)?;
                dst.flush().await.map_err(FetchError::from)?;
                return Ok(FALLBACK_PNG.len() as u64);
            }
            Source::Upstream(response) => response,
        };

        let url = response.url().clone();
        info!(url = %url, length = ?self.length, "Streaming image");

        match response.copy_to(dst, cancel).await {
            Ok(total) => {
                info!(url = %url, total, "Finished streaming image");
                Ok(total)
            }
            Err(FetchError::Cancelled) => {
                warn!(url = %url, "Client cancelled image stream");
                Err(ProxyError::Cancelled)
            }
            Err(err @ FetchError::SizeExceeded { .. }) => {
                warn!(url = %url, error = %err, "Image passed size limit while streaming");
                Err(err.into())
            }
            Err(err) => {
                error!(url = %url, error = %err, "Image stream failed");
                Err(err.into())
            }
        }
    }

    /// Converts the body into a stream for HTTP frameworks that take one.
    ///
    /// An oversize body ends with a [`ProxyError::SizeExceeded`] item; the
    /// stream never yields more bytes than the limit.
    #[must_use]
    pub fn into_stream(self) -> BoxStream<'static, Result<Bytes>> {
        match self.source {
            Source::Fallback => {
                stream::once(async { Ok::<_, ProxyError>(Bytes::from_static(FALLBACK_PNG)) }).boxed()
            }
            Source::Upstream(response) => response
                .into_stream()
                .map(|chunk| chunk.map_err(ProxyError::from))
                .boxed(),
        }
    }
}
