//! The runtime platform the provisioner writes to.
//!
//! Every stored resource carries a `resource_version`. Updates must present
//! the version they read; a stale version is a [`PlatformError::Conflict`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use super::types::{Descriptor, ResourceKind};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlatformError {
  #[error("{kind} {name} not found")]
  NotFound { kind: ResourceKind, name: String },

  #[error("{kind} {name} already exists")]
  AlreadyExists { kind: ResourceKind, name: String },

  #[error("{kind} {name} was modified concurrently")]
  Conflict { kind: ResourceKind, name: String },

  #[error("platform unavailable: {0}")]
  Unavailable(String),

  #[error("platform rejected the request: {0}")]
  Rejected(String),
}

impl PlatformError {
  /// Whether a re-read and retry may resolve the error.
  pub fn is_conflict(&self) -> bool {
    matches!(self, PlatformError::Conflict { .. } | PlatformError::AlreadyExists { .. })
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredResource {
  pub descriptor: Descriptor,
  pub resource_version: u64,
}

#[async_trait]
pub trait RuntimePlatform: Send + Sync {
  async fn get(&self, kind: ResourceKind, name: &str) -> Result<Option<StoredResource>, PlatformError>;

  /// Create a resource. Fails with `AlreadyExists` if the name is taken.
  async fn create(&self, descriptor: &Descriptor) -> Result<StoredResource, PlatformError>;

  /// Replace a resource last read at `resource_version`.
  async fn update(&self, descriptor: &Descriptor, resource_version: u64) -> Result<StoredResource, PlatformError>;

  /// Delete a resource. Fails with `NotFound` if it does not exist.
  async fn delete(&self, kind: ResourceKind, name: &str) -> Result<(), PlatformError>;
}

/// In-process platform.
#[derive(Default)]
pub struct MemoryPlatform {
  resources: Mutex<BTreeMap<(ResourceKind, String), StoredResource>>,
}

impl MemoryPlatform {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn resource(&self, kind: ResourceKind, name: &str) -> Option<StoredResource> {
    let resources = self.resources.lock().unwrap_or_else(PoisonError::into_inner);
    resources.get(&(kind, name.to_string())).cloned()
  }

  pub fn len(&self) -> usize {
    self.resources.lock().unwrap_or_else(PoisonError::into_inner).len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

#[async_trait]
impl RuntimePlatform for MemoryPlatform {
  async fn get(&self, kind: ResourceKind, name: &str) -> Result<Option<StoredResource>, PlatformError> {
    Ok(self.resource(kind, name))
  }

  async fn create(&self, descriptor: &Descriptor) -> Result<StoredResource, PlatformError> {
    let mut resources = self.resources.lock().unwrap_or_else(PoisonError::into_inner);
    let key = (descriptor.kind(), descriptor.name().to_string());
    if resources.contains_key(&key) {
      return Err(PlatformError::AlreadyExists {
        kind: key.0,
        name: key.1,
      });
    }
    let stored = StoredResource {
      descriptor: descriptor.clone(),
      resource_version: 1,
    };
    resources.insert(key, stored.clone());
    Ok(stored)
  }

  async fn update(&self, descriptor: &Descriptor, resource_version: u64) -> Result<StoredResource, PlatformError> {
    let mut resources = self.resources.lock().unwrap_or_else(PoisonError::into_inner);
    let kind = descriptor.kind();
    let name = descriptor.name().to_string();
    let current = resources
      .get_mut(&(kind, name.clone()))
      .ok_or_else(|| PlatformError::NotFound {
        kind,
        name: name.clone(),
      })?;
    if current.resource_version != resource_version {
      return Err(PlatformError::Conflict { kind, name });
    }
    current.descriptor = descriptor.clone();
    current.resource_version += 1;
    Ok(current.clone())
  }

  async fn delete(&self, kind: ResourceKind, name: &str) -> Result<(), PlatformError> {
    let mut resources = self.resources.lock().unwrap_or_else(PoisonError::into_inner);
    resources
      .remove(&(kind, name.to_string()))
      .map(|_| ())
      .ok_or_else(|| PlatformError::NotFound {
        kind,
        name: name.to_string(),
      })
  }
}

/// Platform that keeps each resource as `{root}/{kind}/{name}.json`.
///
/// Files are replaced atomically. A single writer lock serializes the
/// read-check-write of create, update and delete.
pub struct DirPlatform {
  root: PathBuf,
  write_lock: tokio::sync::Mutex<()>,
}

impl DirPlatform {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self {
      root: root.into(),
      write_lock: tokio::sync::Mutex::new(()),
    }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  fn path_for(&self, kind: ResourceKind, name: &str) -> Result<PathBuf, PlatformError> {
    if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
      return Err(PlatformError::Rejected(format!("invalid object name: {}", name)));
    }
    Ok(self.root.join(kind.as_str()).join(format!("{}.json", name)))
  }

  async fn read(&self, path: &Path) -> Result<Option<StoredResource>, PlatformError> {
    match tokio::fs::read(path).await {
      Ok(bytes) => serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| PlatformError::Unavailable(format!("corrupt resource {}: {}", path.display(), e))),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
      Err(e) => Err(io_error(path, e)),
    }
  }

  async fn write(&self, path: &Path, stored: &StoredResource) -> Result<(), PlatformError> {
    if let Some(parent) = path.parent() {
      tokio::fs::create_dir_all(parent).await.map_err(|e| io_error(parent, e))?;
    }
    let bytes = serde_json::to_vec_pretty(stored).map_err(|e| PlatformError::Rejected(e.to_string()))?;
    let tmp = path.with_extension(format!("json.{}.tmp", Uuid::new_v4().simple()));
    tokio::fs::write(&tmp, bytes).await.map_err(|e| io_error(&tmp, e))?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
      let _ = tokio::fs::remove_file(&tmp).await;
      return Err(io_error(path, e));
    }
    debug!(path = %path.display(), version = stored.resource_version, "resource written");
    Ok(())
  }
}

fn io_error(path: &Path, e: std::io::Error) -> PlatformError {
  PlatformError::Unavailable(format!("{}: {}", path.display(), e))
}

#[async_trait]
impl RuntimePlatform for DirPlatform {
  async fn get(&self, kind: ResourceKind, name: &str) -> Result<Option<StoredResource>, PlatformError> {
    let path = self.path_for(kind, name)?;
    self.read(&path).await
  }

  async fn create(&self, descriptor: &Descriptor) -> Result<StoredResource, PlatformError> {
    let kind = descriptor.kind();
    let path = self.path_for(kind, descriptor.name())?;
    let _guard = self.write_lock.lock().await;

    if self.read(&path).await?.is_some() {
      return Err(PlatformError::AlreadyExists {
        kind,
        name: descriptor.name().to_string(),
      });
    }
    let stored = StoredResource {
      descriptor: descriptor.clone(),
      resource_version: 1,
    };
    self.write(&path, &stored).await?;
    Ok(stored)
  }

  async fn update(&self, descriptor: &Descriptor, resource_version: u64) -> Result<StoredResource, PlatformError> {
    let kind = descriptor.kind();
    let name = descriptor.name().to_string();
    let path = self.path_for(kind, &name)?;
    let _guard = self.write_lock.lock().await;

    let current = self
      .read(&path)
      .await?
      .ok_or_else(|| PlatformError::NotFound {
        kind,
        name: name.clone(),
      })?;
    if current.resource_version != resource_version {
      return Err(PlatformError::Conflict { kind, name });
    }
    let stored = StoredResource {
      descriptor: descriptor.clone(),
      resource_version: current.resource_version + 1,
    };
    self.write(&path, &stored).await?;
    Ok(stored)
  }

  async fn delete(&self, kind: ResourceKind, name: &str) -> Result<(), PlatformError> {
    let path = self.path_for(kind, name)?;
    let _guard = self.write_lock.lock().await;
    match tokio::fs::remove_file(&path).await {
      Ok(()) => Ok(()),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(PlatformError::NotFound {
        kind,
        name: name.to_string(),
      }),
      Err(e) => Err(io_error(&path, e)),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::provision::types::{IdentityDescriptor, Labels, ResourceName};

  fn identity(label: &str) -> Descriptor {
    Descriptor::Identity(IdentityDescriptor {
      name: ResourceName::derive("tp", "p1"),
      labels: Labels::from([("team".to_string(), label.to_string())]),
    })
  }

  async fn exercise(platform: &dyn RuntimePlatform) {
    let created = platform.create(&identity("a")).await.unwrap();
    assert_eq!(created.resource_version, 1);

    assert!(matches!(
      platform.create(&identity("a")).await,
      Err(PlatformError::AlreadyExists { .. })
    ));

    let updated = platform.update(&identity("b"), 1).await.unwrap();
    assert_eq!(updated.resource_version, 2);

    assert!(matches!(
      platform.update(&identity("c"), 1).await,
      Err(PlatformError::Conflict { .. })
    ));

    let fetched = platform
      .get(ResourceKind::Identity, "lambda-tp-p1")
      .await
      .unwrap()
      .unwrap();
    assert_eq!(fetched.descriptor, identity("b"));

    platform.delete(ResourceKind::Identity, "lambda-tp-p1").await.unwrap();
    assert!(matches!(
      platform.delete(ResourceKind::Identity, "lambda-tp-p1").await,
      Err(PlatformError::NotFound { .. })
    ));
    assert!(platform.get(ResourceKind::Identity, "lambda-tp-p1").await.unwrap().is_none());
  }

  #[tokio::test]
  async fn memory_platform_versions_writes() {
    exercise(&MemoryPlatform::new()).await;
  }

  #[tokio::test]
  async fn dir_platform_versions_writes() {
    let temp = tempfile::TempDir::new().unwrap();
    exercise(&DirPlatform::new(temp.path())).await;
  }

  #[tokio::test]
  async fn dir_platform_writes_json_per_kind() {
    let temp = tempfile::TempDir::new().unwrap();
    let platform = DirPlatform::new(temp.path());
    platform.create(&identity("a")).await.unwrap();

    let path = temp.path().join("identity").join("lambda-tp-p1.json");
    let stored: StoredResource = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(stored.resource_version, 1);
    assert_eq!(std::fs::read_dir(path.parent().unwrap()).unwrap().count(), 1);
  }

  #[tokio::test]
  async fn dir_platform_rejects_path_traversal() {
    let temp = tempfile::TempDir::new().unwrap();
    let platform = DirPlatform::new(temp.path());
    assert!(matches!(
      platform.get(ResourceKind::Service, "../escape").await,
      Err(PlatformError::Rejected(_))
    ));
  }
}
