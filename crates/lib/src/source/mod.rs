//! Parser source storage.
//!
//! Source bytes are addressed by `parser_id`. A missing source is terminal for
//! the event that asked for it; an unreachable store is not.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::RwLock;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum SourceError {
  #[error("source not found for parser {0}")]
  NotFound(String),

  #[error("access denied to source for parser {0}")]
  AccessDenied(String),

  #[error("source store unavailable: {0}")]
  Unavailable(String),
}

#[async_trait]
pub trait SourceStore: Send + Sync {
  async fn fetch(&self, parser_id: &str) -> Result<Vec<u8>, SourceError>;
}

/// Reads `{root}/{parser_id}` from the local filesystem.
#[derive(Debug, Clone)]
pub struct FsSourceStore {
  root: PathBuf,
}

impl FsSourceStore {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }
}

#[async_trait]
impl SourceStore for FsSourceStore {
  async fn fetch(&self, parser_id: &str) -> Result<Vec<u8>, SourceError> {
    if parser_id.is_empty() || parser_id.contains(['/', '\\']) || parser_id.starts_with('.') {
      return Err(SourceError::AccessDenied(parser_id.to_string()));
    }

    let path = self.root.join(parser_id);
    debug!(path = %path.display(), "fetching parser source");

    tokio::fs::read(&path).await.map_err(|e| match e.kind() {
      ErrorKind::NotFound => SourceError::NotFound(parser_id.to_string()),
      ErrorKind::PermissionDenied => SourceError::AccessDenied(parser_id.to_string()),
      _ => SourceError::Unavailable(format!("{}: {}", path.display(), e)),
    })
  }
}

/// In-process source store.
#[derive(Debug, Default)]
pub struct MemorySourceStore {
  sources: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemorySourceStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn insert(&self, parser_id: &str, source: impl Into<Vec<u8>>) {
    if let Ok(mut sources) = self.sources.write() {
      sources.insert(parser_id.to_string(), source.into());
    }
  }
}

#[async_trait]
impl SourceStore for MemorySourceStore {
  async fn fetch(&self, parser_id: &str) -> Result<Vec<u8>, SourceError> {
    let sources = self
      .sources
      .read()
      .map_err(|_| SourceError::Unavailable("lock poisoned".to_string()))?;
    sources
      .get(parser_id)
      .cloned()
      .ok_or_else(|| SourceError::NotFound(parser_id.to_string()))
  }
}

#[cfg(test)]
mod tests {
  use tempfile::TempDir;

  use super::*;

  #[tokio::test]
  async fn fs_store_reads_source() {
    let temp = TempDir::new().unwrap();
    std::fs::write(temp.path().join("p1"), "def handler(): pass").unwrap();
    let store = FsSourceStore::new(temp.path());
    assert_eq!(store.fetch("p1").await.unwrap(), b"def handler(): pass");
  }

  #[tokio::test]
  async fn fs_store_missing_source_is_not_found() {
    let temp = TempDir::new().unwrap();
    let store = FsSourceStore::new(temp.path());
    assert!(matches!(store.fetch("p1").await, Err(SourceError::NotFound(id)) if id == "p1"));
  }

  #[tokio::test]
  async fn fs_store_refuses_path_traversal() {
    let temp = TempDir::new().unwrap();
    let store = FsSourceStore::new(temp.path());
    assert!(matches!(store.fetch("../etc/passwd").await, Err(SourceError::AccessDenied(_))));
    assert!(matches!(store.fetch("..").await, Err(SourceError::AccessDenied(_))));
  }

  #[tokio::test]
  async fn memory_store_round_trip() {
    let store = MemorySourceStore::new();
    store.insert("p1", "console.log('hi')");
    assert_eq!(store.fetch("p1").await.unwrap(), b"console.log('hi')");
    assert!(matches!(store.fetch("p2").await, Err(SourceError::NotFound(_))));
  }
}
