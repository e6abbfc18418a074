//! Hashing utilities for content-addressed build contexts.
//!
//! This module provides:
//! - `ContentHash`: A full 64-character SHA-256 fingerprint
//! - `ContentHasher`: Incremental hashing over framed parts
//! - `hash_bytes()`: Arbitrary byte hashing

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::consts::IMAGE_TAG_LEN;

/// A full 64-character SHA-256 hash identifying build content.
///
/// # Format
///
/// The hash is a lowercase hexadecimal string (64 characters).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub String);

impl ContentHash {
  /// The truncated prefix used as an image tag.
  pub fn image_tag(&self) -> &str {
    let len = self.0.len().min(IMAGE_TAG_LEN);
    &self.0[..len]
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl std::fmt::Display for ContentHash {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Incremental hasher over a sequence of byte parts.
///
/// Each part is length-prefixed before it is fed to SHA-256, so moving bytes
/// across a part boundary always changes the result.
#[derive(Default)]
pub struct ContentHasher {
  inner: Sha256,
}

impl ContentHasher {
  pub fn new() -> Self {
    Self::default()
  }

  /// Append one framed part.
  pub fn part(mut self, data: &[u8]) -> Self {
    self.inner.update((data.len() as u64).to_le_bytes());
    self.inner.update(data);
    self
  }

  pub fn finish(self) -> ContentHash {
    ContentHash(format!("{:x}", self.inner.finalize()))
  }
}

/// Hash arbitrary bytes.
///
/// Returns the full 64-character SHA256 hash.
pub fn hash_bytes(data: &[u8]) -> ContentHash {
  let mut hasher = Sha256::new();
  hasher.update(data);
  ContentHash(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn hash_is_deterministic() {
    let a = ContentHasher::new().part(b"source").part(b"recipe").finish();
    let b = ContentHasher::new().part(b"source").part(b"recipe").finish();
    assert_eq!(a, b);
    assert_eq!(a.0.len(), 64);
  }

  #[test]
  fn hash_changes_with_any_byte() {
    let base = ContentHasher::new().part(b"print('hi')").part(b"FROM x").finish();
    let changed = ContentHasher::new().part(b"print('hi!')").part(b"FROM x").finish();
    assert_ne!(base, changed);
  }

  #[test]
  fn part_boundaries_are_significant() {
    let a = ContentHasher::new().part(b"ab").part(b"c").finish();
    let b = ContentHasher::new().part(b"a").part(b"bc").finish();
    assert_ne!(a, b);
  }

  #[test]
  fn image_tag_is_truncated_prefix() {
    let hash = hash_bytes(b"hello world");
    assert_eq!(hash.image_tag().len(), IMAGE_TAG_LEN);
    assert!(hash.0.starts_with(hash.image_tag()));
  }

  #[test]
  fn hash_bytes_matches_known_digest() {
    assert_eq!(
      hash_bytes(b"").0,
      "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
    );
  }
}
