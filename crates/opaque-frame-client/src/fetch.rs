//! Header-first GET requests with a hard cap on body size.
//!
//! [`OriginClient::fetch_bounded`] returns as soon as the response headers
//! arrive. A declared `Content-Length` above the limit is rejected at that
//! point, before the body is touched. Every body byte handed out afterwards
//! passes through a [`BoundedStream`], which counts bytes and stops with
//! [`FetchError::SizeExceeded`] the moment the running total passes the limit.
//!
//! Redirects are followed here rather than by `reqwest`, so every hop's host
//! goes through the caller's allowlist before it is requested.
//!
//! The upstream connection is owned by exactly one value at a time
//! (`BoundedResponse`, then `BoundedStream`) and is released when that value
//! finishes, fails, hits the limit or is dropped, whichever comes first.

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use log::{debug, info, warn};
use reqwest::header::{
    ACCEPT, CONTENT_TYPE, ETAG, HeaderMap, HeaderName, HeaderValue, LOCATION,
};
use reqwest::redirect::Policy;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use url::Url;

use opaque_frame_common::FetchOptions;

use crate::error::{FetchError, Result};

/// User-Agent sent when none is configured.
pub const DEFAULT_USER_AGENT: &str = concat!("opaque-frame/", env!("CARGO_PKG_VERSION"));

/// Redirect hops followed before giving up.
pub const MAX_REDIRECTS: usize = 10;

/// Upper bound on the buffer preallocated by [`BoundedResponse::read_to_bytes`].
const INITIAL_BUFFER_BYTES: u64 = 128 * 1024;

type BodyStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

/// HTTP client for origin servers.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct OriginClient {
    client: reqwest::Client,
}

impl OriginClient {
    /// Creates a client with the configured timeout and User-Agent.
    ///
    /// Requests carry `Accept: */*` and are never retried.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(options: &FetchOptions) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("*/*"));

        let user_agent = options
            .user_agent
            .clone()
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string());

        Self::from_builder(
            reqwest::Client::builder()
                .timeout(options.timeout())
                .user_agent(user_agent)
                .default_headers(headers),
        )
    }

    /// Builds a client from a caller-configured `reqwest` builder.
    ///
    /// Automatic redirects are always turned off; [`Self::fetch_bounded_within`]
    /// follows them itself so every hop passes the host check.
    ///
    /// [`fetch_bounded_within`]: Self::fetch_bounded_within
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn from_builder(builder: reqwest::ClientBuilder) -> Result<Self> {
        let client = builder.redirect(Policy::none()).build()?;
        Ok(Self { client })
    }

    /// Issues a GET to any http(s) host and returns once the response
    /// headers are available.
    ///
    /// # Errors
    ///
    /// See [`fetch_bounded_within`](Self::fetch_bounded_within).
    pub async fn fetch_bounded(&self, url: &Url, max_bytes: u64) -> Result<BoundedResponse> {
        self.fetch_bounded_within(url, max_bytes, |_| true).await
    }

    /// Issues a GET and returns once the response headers are available.
    ///
    /// `allow_host` is checked for the initial URL and for every redirect
    /// target before it is requested. At most [`MAX_REDIRECTS`] hops are
    /// followed.
    ///
    /// # Errors
    ///
    /// - [`FetchError::InvalidUrl`] for non-http(s) URLs
    /// - [`FetchError::HostNotAllowed`] when the URL or a redirect target
    ///   fails `allow_host`; nothing is requested from that host
    /// - [`FetchError::TooManyRedirects`] past the hop limit
    /// - [`FetchError::Status`] for any other non-2xx response
    /// - [`FetchError::SizeExceeded`] when the declared length is above
    ///   `max_bytes`; no body bytes have been read in that case
    /// - [`FetchError::Timeout`] or [`FetchError::Network`] for transport
    ///   failures
    pub async fn fetch_bounded_within<F>(
        &self,
        url: &Url,
        max_bytes: u64,
        allow_host: F,
    ) -> Result<BoundedResponse>
    where
        F: Fn(&str) -> bool + Sync,
    {
        let mut current = url.clone();
        let mut hops = 0usize;

        let response = loop {
            check_target(&current, &allow_host)?;
            let response = self.client.get(current.clone()).send().await?;

            if !response.status().is_redirection() {
                break response;
            }
            let Some(next) = redirect_target(&current, &response) else {
                break response;
            };

            hops += 1;
            if hops > MAX_REDIRECTS {
                warn!("Gave up on {url} after {MAX_REDIRECTS} redirects");
                return Err(FetchError::TooManyRedirects(MAX_REDIRECTS));
            }
            debug!("Following redirect from {current} to {next}");
            current = next;
        };

        let status = response.status();
        if !status.is_success() {
            debug!("Origin {current} returned status {}", status.as_u16());
            return Err(FetchError::Status(status.as_u16()));
        }

        let content_length = response.content_length();
        if let Some(declared) = content_length.filter(|len| *len > max_bytes) {
            warn!("Declared length {declared} exceeds limit {max_bytes} for {current}");
            return Err(FetchError::SizeExceeded {
                limit: max_bytes,
                observed: declared,
            });
        }

        let header = |name: HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(String::from)
        };
        let content_type = header(CONTENT_TYPE);
        let etag = header(ETAG);

        Ok(BoundedResponse {
            url: current,
            content_type,
            content_length,
            etag,
            limit: max_bytes,
            response,
        })
    }
}

fn check_target<F>(url: &Url, allow_host: &F) -> Result<()>
where
    F: Fn(&str) -> bool,
{
    if !matches!(url.scheme(), "http" | "https") {
        return Err(FetchError::InvalidUrl(url.to_string()));
    }

    let host = url.host_str().unwrap_or_default();
    if !allow_host(host) {
        warn!("Refusing to fetch {url}: host not allowed");
        return Err(FetchError::HostNotAllowed(host.to_string()));
    }

    Ok(())
}

fn redirect_target(current: &Url, response: &reqwest::Response) -> Option<Url> {
    let location = response.headers().get(LOCATION)?.to_str().ok()?;
    current.join(location).ok()
}

/// An open origin response whose body has not been read yet.
pub struct BoundedResponse {
    url: Url,
    content_type: Option<String>,
    content_length: Option<u64>,
    etag: Option<String>,
    limit: u64,
    response: reqwest::Response,
}

impl fmt::Debug for BoundedResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedResponse")
            .field("url", &self.url.as_str())
            .field("content_type", &self.content_type)
            .field("content_length", &self.content_length)
            .field("etag", &self.etag)
            .field("limit", &self.limit)
            .finish_non_exhaustive()
    }
}

impl BoundedResponse {
    /// The fetched URL.
    #[must_use]
    pub const fn url(&self) -> &Url {
        &self.url
    }

    /// The `Content-Type` header, if any.
    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// The declared body length, if any. Always within the limit.
    #[must_use]
    pub const fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// The `ETag` header, if any.
    #[must_use]
    pub fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }

    /// The maximum number of body bytes that will be handed out.
    #[must_use]
    pub const fn limit(&self) -> u64 {
        self.limit
    }

    /// Turns the response into a byte-counting body stream.
    #[must_use]
    pub fn into_stream(self) -> BoundedStream {
        BoundedStream {
            inner: Some(Box::pin(self.response.bytes_stream())),
            url: self.url,
            limit: self.limit,
            total: 0,
        }
    }

    /// Buffers the whole body.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::SizeExceeded`] if the body passes the limit, or a
    /// transport error if the connection fails mid-body.
    pub async fn read_to_bytes(self) -> Result<Bytes> {
        let capacity = self
            .content_length
            .unwrap_or(0)
            .min(self.limit)
            .min(INITIAL_BUFFER_BYTES);
        let mut buf = BytesMut::with_capacity(usize::try_from(capacity).unwrap_or(0));

        let mut stream = self.into_stream();
        while let Some(chunk) = stream.next().await {
            buf.extend_from_slice(&chunk?);
        }

        Ok(buf.freeze())
    }

    /// Streams the body into `dst`, returning the number of bytes written.
    ///
    /// No chunk that would take the total past the limit is written.
    /// Cancelling `cancel` stops the copy between or during writes.
    ///
    /// # Errors
    ///
    /// - [`FetchError::Cancelled`] if `cancel` fires first
    /// - [`FetchError::SizeExceeded`] if the body passes the limit
    /// - [`FetchError::Io`] if writing to `dst` fails
    pub async fn copy_to<W>(self, dst: &mut W, cancel: &CancellationToken) -> Result<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let url = self.url.clone();
        let mut stream = self.into_stream();

        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(FetchError::Cancelled),
            result = pump(&mut stream, dst) => result,
        };

        match &result {
            Ok(total) => info!("Copied {total} bytes from {url}"),
            Err(FetchError::Cancelled) => {
                warn!("Copy from {url} cancelled after {} bytes", stream.bytes_read());
            }
            Err(_) => {}
        }

        result
    }
}

async fn pump<W>(stream: &mut BoundedStream, dst: &mut W) -> Result<u64>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    while let Some(chunk) = stream.next().await {
        dst.write_all(&chunk?).await?;
    }
    dst.flush().await?;
    Ok(stream.bytes_read())
}

/// Response body that never yields more than its limit.
///
/// Once the limit is passed the stream yields a single
/// [`FetchError::SizeExceeded`] and then ends. The connection is released the
/// first time the stream completes, fails or is dropped.
pub struct BoundedStream {
    inner: Option<BodyStream>,
    url: Url,
    limit: u64,
    total: u64,
}

impl fmt::Debug for BoundedStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedStream")
            .field("url", &self.url.as_str())
            .field("limit", &self.limit)
            .field("total", &self.total)
            .field("released", &self.inner.is_none())
            .finish()
    }
}

impl BoundedStream {
    /// Bytes counted so far, including an oversize final chunk.
    #[must_use]
    pub const fn bytes_read(&self) -> u64 {
        self.total
    }

    /// Returns `true` once the upstream connection has been released.
    #[must_use]
    pub const fn is_released(&self) -> bool {
        self.inner.is_none()
    }

    fn release(&mut self, reason: &str) {
        if self.inner.take().is_some() {
            debug!(
                "Released connection to {} ({reason}, {} bytes)",
                self.url, self.total
            );
        }
    }
}

impl Stream for BoundedStream {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(None);
        };

        match inner.poll_next_unpin(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(None) => {
                this.release("complete");
                Poll::Ready(None)
            }
            Poll::Ready(Some(Err(err))) => {
                this.release("error");
                Poll::Ready(Some(Err(err.into())))
            }
            Poll::Ready(Some(Ok(chunk))) => {
                let total = this.total.saturating_add(chunk.len() as u64);
                this.total = total;

                if total > this.limit {
                    warn!(
                        "Body of {} passed limit {} while streaming ({total} bytes)",
                        this.url, this.limit
                    );
                    this.release("size limit");
                    return Poll::Ready(Some(Err(FetchError::SizeExceeded {
                        limit: this.limit,
                        observed: total,
                    })));
                }

                Poll::Ready(Some(Ok(chunk)))
            }
        }
    }
}

impl Drop for BoundedStream {
    fn drop(&mut self) {
        self.release("dropped");
    }
}
