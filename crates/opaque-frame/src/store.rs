//! Slug to URL mapping storage.
//!
//! Mappings are write-once in practice: a slug is a keyed hash of its URL, so
//! persisting the same slug twice writes the same value. Nothing here ever
//! expires or collects old entries.
//!
//! ## File Layout
//!
//! ```text
//! <map_root>/
//! ├── 3f1c...e9a0.bin      (UTF-8 origin URL)
//! └── 9b27...41dd.bin
//! ```

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::{ProxyError, Result};
use crate::slug::is_valid_slug;

/// Persistent slug to URL associations.
#[async_trait]
pub trait MappingStore: Send + Sync {
    /// Records that `slug` stands for `url`. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Storage`] if the mapping cannot be written.
    async fn persist(&self, slug: &str, url: &str) -> Result<()>;

    /// Returns the URL stored for `slug`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Storage`] if the store cannot be read.
    async fn lookup(&self, slug: &str) -> Result<Option<String>>;
}

/// One file per slug under a root directory.
#[derive(Debug, Clone)]
pub struct FileMappingStore {
    root: Arc<PathBuf>,
}

impl FileMappingStore {
    /// Creates a store rooted at `root`. The directory is created on first
    /// write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Arc::new(root.into()),
        }
    }

    /// The mapping directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, slug: &str) -> Result<PathBuf> {
        if !is_valid_slug(slug) {
            return Err(ProxyError::InvalidArgument(format!("malformed slug: {slug}")));
        }
        Ok(self.root.join(format!("{slug}.bin")))
    }

    fn write_mapping(root: &Path, path: &Path, url: &str) -> Result<bool> {
        match fs::read_to_string(path) {
            Ok(existing) if existing == url => return Ok(false),
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        fs::create_dir_all(root)?;

        // Atomic write: write to temp file, then rename
        let temp_path = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
        fs::write(&temp_path, url)?;
        if let Err(e) = fs::rename(&temp_path, path) {
            let _ = fs::remove_file(&temp_path);
            return Err(e.into());
        }

        Ok(true)
    }

    fn read_mapping(path: &Path) -> Result<Option<String>> {
        match fs::read_to_string(path) {
            Ok(url) => Ok(Some(url.trim().to_string())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl MappingStore for FileMappingStore {
    #[instrument(skip(self, url), fields(slug = %slug))]
    async fn persist(&self, slug: &str, url: &str) -> Result<()> {
        let path = self.path_for(slug)?;
        let root = Arc::clone(&self.root);
        let url = url.to_string();

        let written = tokio::task::spawn_blocking(move || Self::write_mapping(&root, &path, &url))
            .await
            .map_err(|e| ProxyError::Storage(format!("Task join error: {e}")))??;

        if written {
            debug!(slug, "Saved mapping");
        }
        Ok(())
    }

    async fn lookup(&self, slug: &str) -> Result<Option<String>> {
        let Ok(path) = self.path_for(slug) else {
            return Ok(None);
        };

        tokio::task::spawn_blocking(move || Self::read_mapping(&path))
            .await
            .map_err(|e| ProxyError::Storage(format!("Task join error: {e}")))?
    }
}

/// Process-local store, for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct MemoryMappingStore {
    map: DashMap<String, String>,
}

impl MemoryMappingStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored mappings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns `true` if nothing has been stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[async_trait]
impl MappingStore for MemoryMappingStore {
    async fn persist(&self, slug: &str, url: &str) -> Result<()> {
        self.map.insert(slug.to_string(), url.to_string());
        Ok(())
    }

    async fn lookup(&self, slug: &str) -> Result<Option<String>> {
        Ok(self.map.get(slug).map(|entry| entry.value().clone()))
    }
}
