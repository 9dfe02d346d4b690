//! # opaque-frame
//!
//! Core of the opaque iframe proxy. A page on an allowlisted origin is
//! embedded through a sealed token that hides its URL; every image on the
//! page is re-pointed at a keyed slug so the browser never learns the image
//! origins either.
//!
//! ## Components
//!
//! - [`TokenCodec`]: seals and validates page tokens through a [`Protector`]
//! - [`SlugKey`] and [`MappingStore`]: slug derivation and slug → URL storage
//! - [`HtmlRewriter`]: `<img src>` rewriting with host and count limits
//! - [`ImageCopyHandle`]: single-use, size-bounded image bodies
//! - [`ProxyService`]: ties the above to an [`OriginClient`]
//!
//! ## Example
//!
//! ```no_run
//! use opaque_frame::ProxyService;
//! use opaque_frame_common::OpaqueFrameConfig;
//!
//! # async fn example(toml: &str) -> anyhow::Result<()> {
//! let config = OpaqueFrameConfig::from_toml_str(toml)?;
//! let service = ProxyService::from_config(&config)?;
//!
//! let iframe_src = service.issue_url("https://news.example/a", None, None)?;
//! # Ok(())
//! # }
//! ```
//!
//! [`OriginClient`]: opaque_frame_client::OriginClient

pub mod error;
pub mod image;
pub mod protect;
pub mod rewrite;
pub mod service;
pub mod slug;
pub mod store;
pub mod token;

pub use error::{ProxyError, Result};
pub use image::ImageCopyHandle;
pub use protect::{AeadProtector, Protector};
pub use rewrite::{HtmlRewriter, RewrittenHtml};
pub use service::ProxyService;
pub use slug::{SlugKey, is_valid_slug};
pub use store::{FileMappingStore, MappingStore, MemoryMappingStore};
pub use token::{DecodedToken, TokenCodec, TokenEncoding};
