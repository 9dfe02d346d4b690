//! Configuration file discovery.
//!
//! Without `--config`, the file is read from
//! `~/.config/opaque-frame/config.toml` (or the platform equivalent).
//!
//! ## Example Configuration
//!
//! ```toml
//! [proxy]
//! allowed_html_hosts = ["news.example"]
//! allowed_image_hosts = ["news.example", "cdn.news.example"]
//! base_path = "proxy"
//!
//! [map]
//! map_root = "data/img-map"
//! slug_secret = "change-me-to-something-long"
//!
//! [protection]
//! key = "<32 bytes, base64url>"
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use opaque_frame_common::OpaqueFrameConfig;

/// Returns the default configuration file path.
///
/// # Errors
///
/// Returns an error if the platform config directory cannot be determined.
pub fn config_path() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .context("Failed to determine config directory")?
        .join("opaque-frame");

    Ok(config_dir.join("config.toml"))
}

/// Loads and validates the configuration at `path`, or at the default
/// location when `path` is `None`.
pub fn load(path: Option<&Path>) -> Result<OpaqueFrameConfig> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => config_path()?,
    };

    if !path.exists() {
        bail!("Configuration file not found: {}", path.display());
    }

    OpaqueFrameConfig::from_path(&path)
        .with_context(|| format!("Failed to load config from {}", path.display()))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::fs;

    use tempfile::TempDir;

    use super::*;

    const VALID: &str = r#"
[proxy]
allowed_html_hosts = ["news.example"]
allowed_image_hosts = ["news.example"]

[map]
slug_secret = "cli-config-test-secret!"

[protection]
key = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA"
"#;

    #[test]
    fn test_default_path_ends_in_app_dir() {
        if let Ok(path) = config_path() {
            assert!(path.ends_with("opaque-frame/config.toml"));
        }
    }

    #[test]
    fn test_load_explicit_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, VALID).unwrap();

        let config = load(Some(&path)).unwrap();
        assert_eq!(config.proxy.allowed_html_hosts, vec!["news.example"]);
    }

    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        let err = load(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_invalid_file_names_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[proxy]\nallowed_html_hosts = []\n").unwrap();

        let err = load(Some(&path)).unwrap_err();
        assert!(err.to_string().contains("config.toml"));
    }
}
