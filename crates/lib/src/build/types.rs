use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::build::staging::StagingError;
use crate::provision::ResourceName;
use crate::util::hash::ContentHash;

/// Language runtime a parser is written for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Runtime {
  #[default]
  #[serde(alias = "node", alias = "javascript")]
  NodeJs,
  Python,
  #[serde(alias = "golang")]
  Go,
}

impl Runtime {
  pub const ALL: [Runtime; 3] = [Runtime::NodeJs, Runtime::Python, Runtime::Go];

  pub fn as_str(&self) -> &'static str {
    match self {
      Runtime::NodeJs => "nodejs",
      Runtime::Python => "python",
      Runtime::Go => "go",
    }
  }
}

impl std::fmt::Display for Runtime {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unsupported runtime: {0} (expected nodejs, python or go)")]
pub struct UnknownRuntime(pub String);

impl FromStr for Runtime {
  type Err = UnknownRuntime;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "nodejs" | "node" | "javascript" => Ok(Runtime::NodeJs),
      "python" => Ok(Runtime::Python),
      "go" | "golang" => Ok(Runtime::Go),
      _ => Err(UnknownRuntime(s.to_string())),
    }
  }
}

/// A normalized request to build one parser.
///
/// `content_hash` is unset until the assembler fingerprints the fetched
/// source together with the rendered recipe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRequest {
  pub third_party_id: String,
  pub parser_id: String,
  pub runtime: Runtime,
  #[serde(default)]
  pub environment: BTreeMap<String, String>,
  #[serde(default)]
  pub build_args: BTreeMap<String, String>,
  #[serde(default)]
  pub content_hash: Option<ContentHash>,
}

impl BuildRequest {
  pub fn new(third_party_id: &str, parser_id: &str, runtime: Runtime) -> Self {
    Self {
      third_party_id: third_party_id.to_string(),
      parser_id: parser_id.to_string(),
      runtime,
      environment: BTreeMap::new(),
      build_args: BTreeMap::new(),
      content_hash: None,
    }
  }

  pub fn with_env(mut self, key: &str, value: &str) -> Self {
    self.environment.insert(key.to_string(), value.to_string());
    self
  }

  pub fn with_build_arg(mut self, key: &str, value: &str) -> Self {
    self.build_args.insert(key.to_string(), value.to_string());
    self
  }

  /// The deterministic name every runtime resource for this parser shares.
  pub fn resource_name(&self) -> ResourceName {
    ResourceName::derive(&self.third_party_id, &self.parser_id)
  }
}

/// A published, content-addressed build context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildContextRef {
  pub third_party_id: String,
  pub parser_id: String,
  pub runtime: Runtime,
  pub content_hash: ContentHash,
  /// Staging key the archive was published under.
  pub key: String,
  /// Locator the build executor can read the archive from.
  pub uri: String,
  /// True when identical content was already staged and publishing was skipped.
  pub reused: bool,
  pub size: u64,
}

/// Failures while assembling a build context.
///
/// Source and recipe failures are terminal for the event. Staging and
/// packaging failures may succeed on redelivery.
#[derive(Debug, Error)]
pub enum AssembleError {
  #[error("source not found for parser {0}")]
  SourceNotFound(String),

  #[error("access denied reading source for parser {0}")]
  AccessDenied(String),

  #[error("source store unavailable: {0}")]
  SourceUnavailable(String),

  #[error("recipe generation failed: {0}")]
  RecipeGenerationFailed(String),

  #[error("packaging failed: {0}")]
  PackagingFailed(#[from] ArchiveError),

  #[error("publish failed: {0}")]
  PublishFailed(#[from] StagingError),
}

impl AssembleError {
  /// Whether retrying the whole event may succeed without intervention.
  pub fn is_retryable(&self) -> bool {
    matches!(
      self,
      AssembleError::SourceUnavailable(_) | AssembleError::PackagingFailed(_) | AssembleError::PublishFailed(_)
    )
  }
}

#[derive(Debug, Error)]
pub enum ArchiveError {
  #[error("failed to write archive: {0}")]
  Io(#[from] std::io::Error),

  #[error("duplicate archive entry: {0}")]
  DuplicatePath(String),
}
