//! The boundary to the external image builder.
//!
//! A build is started with [`BuildExecutor::submit`], observed with
//! [`BuildExecutor::poll`] and may be stopped with [`BuildExecutor::abort`].
//! The builder itself is opaque.

mod command;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::build::BuildContextRef;
use crate::dispatch::JobId;

pub use command::CommandExecutor;

/// Opaque reference to a build running in the executor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionHandle(pub String);

impl std::fmt::Display for ExecutionHandle {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// What the executor is asked to build.
#[derive(Debug, Clone)]
pub struct BuildSpec {
  pub job_id: JobId,
  pub context: BuildContextRef,
  /// Image reference to push the result to.
  pub target_image: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionStatus {
  Running,
  Succeeded { image_reference: String },
  /// `retryable` marks failures such as a registry push timeout that may
  /// pass on another attempt.
  Failed { reason: String, retryable: bool },
  Cancelled,
}

impl ExecutionStatus {
  pub fn is_terminal(&self) -> bool {
    !matches!(self, ExecutionStatus::Running)
  }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecutorError {
  #[error("executor temporarily unavailable: {0}")]
  Transient(String),

  #[error("executor error: {0}")]
  Permanent(String),

  #[error("unknown execution handle: {0}")]
  UnknownHandle(ExecutionHandle),
}

impl ExecutorError {
  pub fn is_transient(&self) -> bool {
    matches!(self, ExecutorError::Transient(_))
  }
}

#[async_trait]
pub trait BuildExecutor: Send + Sync {
  async fn submit(&self, spec: &BuildSpec) -> Result<ExecutionHandle, ExecutorError>;

  async fn poll(&self, handle: &ExecutionHandle) -> Result<ExecutionStatus, ExecutorError>;

  /// Request termination. Returns `false` when the executor cannot abort.
  async fn abort(&self, handle: &ExecutionHandle) -> Result<bool, ExecutorError>;

  /// Log lines produced since the previous call.
  async fn drain_logs(&self, _handle: &ExecutionHandle) -> Vec<String> {
    Vec::new()
  }
}
