//! # opaque-frame-client
//!
//! Outbound HTTP for the opaque iframe proxy. Every fetch is bounded: bodies
//! larger than the caller's limit are refused at the header stage when the
//! origin declares its length, and cut off mid-stream when it does not.
//!
//! ## Example
//!
//! ```no_run
//! use opaque_frame_client::OriginClient;
//! use opaque_frame_common::FetchOptions;
//! use url::Url;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = OriginClient::new(&FetchOptions::default())?;
//! let url = Url::parse("https://news.example/a")?;
//!
//! let page = client.fetch_bounded(&url, 2 * 1024 * 1024).await?;
//! let html = page.read_to_bytes().await?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod fetch;

pub use error::{FetchError, Result};
pub use fetch::{BoundedResponse, BoundedStream, DEFAULT_USER_AGENT, MAX_REDIRECTS, OriginClient};
