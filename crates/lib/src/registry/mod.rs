//! Operator view of build state.
//!
//! Reads come straight from the dispatcher's job store; cancellation is
//! delegated to [`Dispatcher::cancel`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dispatch::{BuildJob, DispatchError, Dispatcher, JobFilter, JobId, PoolStats};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
  #[error("build not found: {0}")]
  NotFound(JobId),

  #[error("{0}")]
  InvalidState(String),

  #[error("invalid argument: {0}")]
  InvalidArgument(String),

  #[error("unavailable: {0}")]
  Unavailable(String),
}

impl RegistryError {
  /// Stable machine-readable code.
  pub fn code(&self) -> &'static str {
    match self {
      RegistryError::NotFound(_) => "not_found",
      RegistryError::InvalidState(_) => "invalid_state",
      RegistryError::InvalidArgument(_) => "invalid_argument",
      RegistryError::Unavailable(_) => "unavailable",
    }
  }

  /// HTTP status code for this error.
  pub fn status(&self) -> u16 {
    match self {
      RegistryError::NotFound(_) => 404,
      RegistryError::InvalidState(_) => 409,
      RegistryError::InvalidArgument(_) => 400,
      RegistryError::Unavailable(_) => 503,
    }
  }
}

impl From<DispatchError> for RegistryError {
  fn from(err: DispatchError) -> Self {
    match err {
      DispatchError::NotFound(id) => RegistryError::NotFound(id),
      e @ DispatchError::InvalidState { .. } => RegistryError::InvalidState(e.to_string()),
      e @ (DispatchError::QueueFull { .. } | DispatchError::ShuttingDown) => RegistryError::Unavailable(e.to_string()),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLimits {
  pub default_size: usize,
  pub max_size: usize,
}

impl Default for PageLimits {
  fn default() -> Self {
    Self {
      default_size: 20,
      max_size: 100,
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListQuery {
  pub filter: JobFilter,
  pub page_size: Option<usize>,
  pub page_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
  pub items: Vec<BuildJob>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub next_page_token: Option<String>,
}

/// A job together with its retained log tail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildDetail {
  #[serde(flatten)]
  pub job: BuildJob,
  pub logs: Vec<String>,
}

pub struct BuildRegistry {
  dispatcher: Arc<Dispatcher>,
  limits: PageLimits,
}

impl BuildRegistry {
  pub fn new(dispatcher: Arc<Dispatcher>, limits: PageLimits) -> Self {
    Self { dispatcher, limits }
  }

  /// One page of matching jobs, newest first.
  ///
  /// Page tokens are offsets into the ordered listing. The page size is
  /// clamped to `1..=max_size`.
  pub fn list(&self, query: &ListQuery) -> Result<Page, RegistryError> {
    let size = query
      .page_size
      .unwrap_or(self.limits.default_size)
      .clamp(1, self.limits.max_size.max(1));
    let offset = match &query.page_token {
      None => 0,
      Some(token) => token
        .parse::<usize>()
        .map_err(|_| RegistryError::InvalidArgument(format!("invalid page token: {}", token)))?,
    };

    let jobs = self.dispatcher.list(&query.filter);
    let items: Vec<BuildJob> = jobs.iter().skip(offset).take(size).cloned().collect();
    let end = offset.saturating_add(items.len());
    let next_page_token = (end < jobs.len()).then(|| end.to_string());
    Ok(Page { items, next_page_token })
  }

  pub fn get(&self, id: &JobId) -> Result<BuildDetail, RegistryError> {
    let job = self
      .dispatcher
      .get(id)
      .ok_or_else(|| RegistryError::NotFound(id.clone()))?;
    let logs = self.dispatcher.logs(id).unwrap_or_default();
    Ok(BuildDetail { job, logs })
  }

  pub fn cancel(&self, id: &JobId) -> Result<BuildJob, RegistryError> {
    Ok(self.dispatcher.cancel(id)?)
  }

  pub fn stats(&self) -> PoolStats {
    self.dispatcher.stats()
  }
}
