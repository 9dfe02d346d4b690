//! # opaque-frame-common
//!
//! Shared configuration and value types for the opaque iframe proxy.
//!
//! - [`config`]: TOML configuration, validation and route templates
//! - [`token`]: the claims carried inside an HTML token
//! - [`content`]: HTML responses handed back to the HTTP layer
//!
//! ## Example
//!
//! ```
//! use opaque_frame_common::ProxyOptions;
//!
//! let options = ProxyOptions::builder()
//!     .allowed_html_hosts(vec!["news.example".to_string()])
//!     .allowed_image_hosts(vec!["cdn.news.example".to_string()])
//!     .build();
//!
//! options.validate().unwrap();
//! assert_eq!(options.image_path("ab12"), "/proxy/img/s/ab12");
//! ```

pub mod config;
pub mod content;
pub mod error;
pub mod token;

pub use config::{
    FetchOptions, MapOptions, OpaqueFrameConfig, ProtectionOptions, ProxyOptions, RouteOptions,
    decode_key_material,
};
pub use content::HtmlResult;
pub use error::{ConfigError, Result};
pub use token::{TOKEN_VERSION, TokenPayload};
