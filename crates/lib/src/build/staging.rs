//! Staging storage for published build contexts.
//!
//! Archives are addressed by `build-context/{parser_id}/{content_hash}/context.tar.gz`,
//! so an existence check on the key is a dedup lookup for identical content.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::consts::CONTEXT_ARCHIVE_NAME;
use crate::util::hash::ContentHash;

#[derive(Debug, Error)]
pub enum StagingError {
  #[error("failed to write {key}: {source}")]
  Write {
    key: String,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to read {key}: {source}")]
  Read {
    key: String,
    #[source]
    source: std::io::Error,
  },

  #[error("invalid staging key: {0}")]
  InvalidKey(String),

  #[error("staging store unavailable: {0}")]
  Unavailable(String),
}

/// Staging key for a build context.
pub fn context_key(parser_id: &str, hash: &ContentHash) -> String {
  format!("build-context/{}/{}/{}", parser_id, hash, CONTEXT_ARCHIVE_NAME)
}

/// Object storage for build context archives.
#[async_trait]
pub trait StagingStore: Send + Sync {
  async fn exists(&self, key: &str) -> Result<bool, StagingError>;

  async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StagingError>;

  /// Locator an external builder can use to read the object at `key`.
  fn locate(&self, key: &str) -> String;
}

/// Filesystem-backed staging rooted at a directory.
#[derive(Debug, Clone)]
pub struct FsStagingStore {
  root: PathBuf,
}

impl FsStagingStore {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  fn path_for(&self, key: &str) -> Result<PathBuf, StagingError> {
    let relative = Path::new(key);
    let escapes = relative
      .components()
      .any(|c| !matches!(c, std::path::Component::Normal(_)));
    if key.is_empty() || escapes {
      return Err(StagingError::InvalidKey(key.to_string()));
    }
    Ok(self.root.join(relative))
  }
}

#[async_trait]
impl StagingStore for FsStagingStore {
  async fn exists(&self, key: &str) -> Result<bool, StagingError> {
    let path = self.path_for(key)?;
    tokio::fs::try_exists(&path).await.map_err(|source| StagingError::Read {
      key: key.to_string(),
      source,
    })
  }

  /// Uses atomic write (write to temp, then rename) so readers never see a
  /// partial archive.
  async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StagingError> {
    let path = self.path_for(key)?;
    let write_err = |source| StagingError::Write {
      key: key.to_string(),
      source,
    };

    if let Some(parent) = path.parent() {
      tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
    }
    // Unique per write: concurrent publishes of one key must not share it.
    let temp_path = path.with_extension(format!("gz.{}.tmp", Uuid::new_v4().simple()));
    tokio::fs::write(&temp_path, &bytes).await.map_err(write_err)?;
    if let Err(e) = tokio::fs::rename(&temp_path, &path).await {
      let _ = tokio::fs::remove_file(&temp_path).await;
      return Err(write_err(e));
    }

    debug!(path = %path.display(), size = bytes.len(), "staged build context");
    Ok(())
  }

  fn locate(&self, key: &str) -> String {
    self.root.join(key).display().to_string()
  }
}

/// In-process staging, for tests and single-node setups.
#[derive(Debug, Default)]
pub struct MemoryStagingStore {
  objects: RwLock<HashMap<String, Vec<u8>>>,
  puts: AtomicUsize,
}

impl MemoryStagingStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn get(&self, key: &str) -> Option<Vec<u8>> {
    self.objects.read().ok()?.get(key).cloned()
  }

  /// Number of successful `put` calls.
  pub fn put_count(&self) -> usize {
    self.puts.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl StagingStore for MemoryStagingStore {
  async fn exists(&self, key: &str) -> Result<bool, StagingError> {
    let objects = self
      .objects
      .read()
      .map_err(|_| StagingError::Unavailable("lock poisoned".to_string()))?;
    Ok(objects.contains_key(key))
  }

  async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StagingError> {
    let mut objects = self
      .objects
      .write()
      .map_err(|_| StagingError::Unavailable("lock poisoned".to_string()))?;
    objects.insert(key.to_string(), bytes);
    self.puts.fetch_add(1, Ordering::SeqCst);
    Ok(())
  }

  fn locate(&self, key: &str) -> String {
    format!("memory://{}", key)
  }
}
