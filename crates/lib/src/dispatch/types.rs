use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::build::{BuildContextRef, Runtime};
use crate::provision::ResourceName;
use crate::util::hash::ContentHash;
use crate::util::retry::Backoff;

/// Identifier of a build job.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
  pub fn generate() -> Self {
    JobId(format!("build-{}", Uuid::new_v4()))
  }
}

impl std::fmt::Display for JobId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Lifecycle of a build job.
///
/// `Pending -> Running -> {Succeeded, Failed, Cancelled}`, plus
/// `Pending -> Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
  Pending,
  Running,
  Succeeded,
  Failed,
  Cancelled,
}

impl JobStatus {
  pub fn is_terminal(self) -> bool {
    matches!(self, JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled)
  }

  pub fn can_transition_to(self, next: JobStatus) -> bool {
    matches!(
      (self, next),
      (JobStatus::Pending, JobStatus::Running)
        | (JobStatus::Pending, JobStatus::Cancelled)
        | (JobStatus::Running, JobStatus::Succeeded)
        | (JobStatus::Running, JobStatus::Failed)
        | (JobStatus::Running, JobStatus::Cancelled)
    )
  }

  pub fn as_str(self) -> &'static str {
    match self {
      JobStatus::Pending => "pending",
      JobStatus::Running => "running",
      JobStatus::Succeeded => "succeeded",
      JobStatus::Failed => "failed",
      JobStatus::Cancelled => "cancelled",
    }
  }
}

impl std::fmt::Display for JobStatus {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for JobStatus {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "pending" => Ok(JobStatus::Pending),
      "running" => Ok(JobStatus::Running),
      "succeeded" => Ok(JobStatus::Succeeded),
      "failed" => Ok(JobStatus::Failed),
      "cancelled" | "canceled" => Ok(JobStatus::Cancelled),
      other => Err(format!("unknown job status: {}", other)),
    }
  }
}

/// The tracked unit of build execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildJob {
  pub id: JobId,
  pub third_party_id: String,
  pub parser_id: String,
  pub runtime: Runtime,
  pub content_hash: ContentHash,
  pub resource_name: ResourceName,
  pub status: JobStatus,
  pub created_at: DateTime<Utc>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub started_at: Option<DateTime<Utc>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub completed_at: Option<DateTime<Utc>>,
  /// Image the executor is asked to produce.
  pub target_image: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub image_reference: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  /// Executor attempts made so far.
  pub attempts: u32,
  pub cancel_requested: bool,
  pub context: BuildContextRef,
}

/// Filter for listing jobs. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFilter {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub tenant: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub parser: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub status: Option<JobStatus>,
}

impl JobFilter {
  pub fn matches(&self, job: &BuildJob) -> bool {
    self.tenant.as_ref().is_none_or(|t| *t == job.third_party_id)
      && self.parser.as_ref().is_none_or(|p| *p == job.parser_id)
      && self.status.is_none_or(|s| s == job.status)
  }
}

/// Worker pool statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
  pub workers: usize,
  pub queue_depth: usize,
  pub queue_capacity: usize,
}

/// Dispatcher tuning.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
  pub workers: usize,
  pub queue_capacity: usize,
  /// Retries of transient executor failures.
  pub backoff: Backoff,
  pub poll_interval: Duration,
  /// How long a cancelled build may take to confirm before it is forced.
  pub cancel_grace: Duration,
  /// Running builds exceeding this are aborted and failed.
  pub build_timeout: Duration,
  pub log_tail_lines: usize,
  /// Finished jobs kept for inspection; the oldest are evicted first.
  pub retained_jobs: usize,
}

impl Default for DispatchConfig {
  fn default() -> Self {
    Self {
      workers: 4,
      queue_capacity: 64,
      backoff: Backoff::default(),
      poll_interval: Duration::from_secs(1),
      cancel_grace: Duration::from_secs(30),
      build_timeout: Duration::from_secs(30 * 60),
      log_tail_lines: 100,
      retained_jobs: 1000,
    }
  }
}

/// Where built images are pushed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageNaming {
  pub registry: String,
  pub namespace: String,
}

impl ImageNaming {
  pub fn new(registry: &str, namespace: &str) -> Self {
    Self {
      registry: registry.trim_end_matches('/').to_string(),
      namespace: namespace.trim_matches('/').to_string(),
    }
  }

  /// `{registry}/{namespace}/{name}:{tag}`
  pub fn image_for(&self, name: &ResourceName, hash: &ContentHash) -> String {
    format!("{}/{}/{}:{}", self.registry, self.namespace, name, hash.image_tag())
  }
}

impl Default for ImageNaming {
  fn default() -> Self {
    Self::new("localhost:5000", "lambdas")
  }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
  #[error("build queue is full ({capacity} jobs pending)")]
  QueueFull { capacity: usize },

  #[error("dispatcher is shut down")]
  ShuttingDown,

  #[error("build job not found: {0}")]
  NotFound(JobId),

  #[error("build job {id} is {status} and cannot be cancelled")]
  InvalidState { id: JobId, status: JobStatus },
}
