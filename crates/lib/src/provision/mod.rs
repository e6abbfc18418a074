//! Turning a successful build into reachable runtime resources.
//!
//! [`Provisioner::provision`] applies identity and config first, then the
//! service and its route concurrently. A failure on one side of that pair
//! leaves the other side in place and is reported as
//! [`ProvisionError::PartialFailure`]. Re-applying is cheap: resources that
//! already match are left untouched, so a retry only writes the side that
//! failed.
//!
//! [`Provisioner::deprovision`] removes resources in the reverse order, route
//! first, so traffic is never routed to a missing service.

mod platform;
mod types;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::dispatch::{BuildJob, JobId, JobStatus};
use crate::util::hash::ContentHash;

pub use platform::{DirPlatform, MemoryPlatform, PlatformError, RuntimePlatform, StoredResource};
pub use types::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplyAction {
  Created,
  Updated,
  Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionReport {
  pub name: ResourceName,
  pub image_reference: String,
  pub identity: ApplyAction,
  pub config: ApplyAction,
  pub service: ApplyAction,
  pub route: ApplyAction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionOutcome {
  Applied(ProvisionReport),
  /// A newer build has already been applied under this name.
  Superseded { name: ResourceName, current: ContentHash },
}

#[derive(Debug, Error)]
pub enum ProvisionError {
  #[error(transparent)]
  Invalid(#[from] DescriptorError),

  #[error("build job {id} is {status}; only succeeded jobs are provisioned")]
  NotSucceeded { id: JobId, status: JobStatus },

  #[error("failed to apply {kind} {name}: {source}")]
  Prerequisite {
    kind: ResourceKind,
    name: String,
    source: PlatformError,
  },

  #[error("{failed} for {name} failed while {succeeded} was applied: {source}")]
  PartialFailure {
    name: ResourceName,
    failed: ResourceKind,
    succeeded: ResourceKind,
    source: PlatformError,
  },

  #[error("service and route for {name} both failed: service: {service}; route: {route}")]
  FullFailure {
    name: ResourceName,
    service: PlatformError,
    route: PlatformError,
  },
}

impl ProvisionError {
  /// Whether provisioning the same job again may succeed.
  pub fn is_retryable(&self) -> bool {
    !matches!(self, ProvisionError::Invalid(_) | ProvisionError::NotSucceeded { .. })
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeprovisionReport {
  pub name: ResourceName,
  /// Kinds that were deleted, in deletion order.
  pub removed: Vec<ResourceKind>,
  /// Kinds that did not exist.
  pub absent: Vec<ResourceKind>,
}

#[derive(Debug, Error)]
pub enum DeprovisionError {
  #[error("no resources found for {0}")]
  NotFound(ResourceName),

  #[error("failed to delete {failed} for {name}: {source}")]
  PartialFailure {
    name: ResourceName,
    removed: Vec<ResourceKind>,
    failed: ResourceKind,
    source: PlatformError,
  },
}

/// Deletion order. Routes go before the service they point at.
const TEARDOWN_ORDER: [ResourceKind; 4] = [
  ResourceKind::Route,
  ResourceKind::Service,
  ResourceKind::Config,
  ResourceKind::Identity,
];

/// Ordering key of the newest job applied under a name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct AppliedMark {
  completed_at: DateTime<Utc>,
  content_hash: ContentHash,
}

pub struct Provisioner {
  platform: Arc<dyn RuntimePlatform>,
  applied: Mutex<HashMap<ResourceName, AppliedMark>>,
}

impl Provisioner {
  pub fn new(platform: Arc<dyn RuntimePlatform>) -> Self {
    Self {
      platform,
      applied: Mutex::new(HashMap::new()),
    }
  }

  /// Create or update every resource for a succeeded job.
  pub async fn provision(&self, job: &BuildJob) -> Result<ProvisionOutcome, ProvisionError> {
    let image = match (&job.status, &job.image_reference) {
      (JobStatus::Succeeded, Some(image)) => image.clone(),
      _ => {
        return Err(ProvisionError::NotSucceeded {
          id: job.id.clone(),
          status: job.status,
        });
      }
    };
    let name = job.resource_name.clone();

    let set = ResourceSet::for_job(job, &image);
    set.validate()?;

    if let Some(current) = self.claim(job) {
      info!(job = %job.id, name = %name, current = %current.image_tag(), "newer build already applied, skipping");
      return Ok(ProvisionOutcome::Superseded { name, current });
    }

    let identity = self.prerequisite(&set.identity).await?;
    let config = self.prerequisite(&set.config).await?;

    let (service, route) = tokio::join!(self.apply(&set.service), self.apply(&set.route));

    match (service, route) {
      (Ok(service), Ok(route)) => {
        info!(job = %job.id, name = %name, image = %image, "resources provisioned");
        Ok(ProvisionOutcome::Applied(ProvisionReport {
          name,
          image_reference: image,
          identity,
          config,
          service,
          route,
        }))
      }
      (Ok(_), Err(source)) => {
        warn!(job = %job.id, name = %name, error = %source, "route failed, service applied");
        Err(ProvisionError::PartialFailure {
          name,
          failed: ResourceKind::Route,
          succeeded: ResourceKind::Service,
          source,
        })
      }
      (Err(source), Ok(_)) => {
        warn!(job = %job.id, name = %name, error = %source, "service failed, route applied");
        Err(ProvisionError::PartialFailure {
          name,
          failed: ResourceKind::Service,
          succeeded: ResourceKind::Route,
          source,
        })
      }
      (Err(service), Err(route)) => {
        warn!(job = %job.id, name = %name, "service and route both failed");
        Err(ProvisionError::FullFailure { name, service, route })
      }
    }
  }

  /// Remove every resource of a deployment, route first.
  ///
  /// Stops at the first failed deletion so that a service is never deleted
  /// while its route still exists.
  pub async fn deprovision(&self, name: &ResourceName) -> Result<DeprovisionReport, DeprovisionError> {
    let mut removed = Vec::new();
    let mut absent = Vec::new();

    for kind in TEARDOWN_ORDER {
      match self.platform.delete(kind, &name.object_name(kind)).await {
        Ok(()) => {
          debug!(name = %name, kind = %kind, "resource deleted");
          removed.push(kind);
        }
        Err(PlatformError::NotFound { .. }) => absent.push(kind),
        Err(source) => {
          warn!(name = %name, kind = %kind, error = %source, "deprovision stopped");
          return Err(DeprovisionError::PartialFailure {
            name: name.clone(),
            removed,
            failed: kind,
            source,
          });
        }
      }
    }

    self.applied.lock().unwrap_or_else(PoisonError::into_inner).remove(name);

    if removed.is_empty() {
      return Err(DeprovisionError::NotFound(name.clone()));
    }
    info!(name = %name, removed = removed.len(), "resources deprovisioned");
    Ok(DeprovisionReport {
      name: name.clone(),
      removed,
      absent,
    })
  }

  /// Record `job` as the newest applied under its name, or return the hash
  /// of the newer job already recorded.
  fn claim(&self, job: &BuildJob) -> Option<ContentHash> {
    let mark = AppliedMark {
      completed_at: job.completed_at.unwrap_or(job.created_at),
      content_hash: job.content_hash.clone(),
    };
    let mut applied = self.applied.lock().unwrap_or_else(PoisonError::into_inner);
    match applied.get(&job.resource_name) {
      Some(current) if *current > mark => Some(current.content_hash.clone()),
      _ => {
        applied.insert(job.resource_name.clone(), mark);
        None
      }
    }
  }

  async fn prerequisite(&self, descriptor: &Descriptor) -> Result<ApplyAction, ProvisionError> {
    self
      .apply(descriptor)
      .await
      .map_err(|source| ProvisionError::Prerequisite {
        kind: descriptor.kind(),
        name: descriptor.name().to_string(),
        source,
      })
  }

  /// Create or update one resource, re-reading once on a write conflict.
  async fn apply(&self, descriptor: &Descriptor) -> Result<ApplyAction, PlatformError> {
    match self.try_apply(descriptor).await {
      Err(e) if e.is_conflict() => {
        debug!(kind = %descriptor.kind(), name = descriptor.name(), "write conflict, re-reading");
        self.try_apply(descriptor).await
      }
      other => other,
    }
  }

  async fn try_apply(&self, descriptor: &Descriptor) -> Result<ApplyAction, PlatformError> {
    match self.platform.get(descriptor.kind(), descriptor.name()).await? {
      None => {
        self.platform.create(descriptor).await?;
        Ok(ApplyAction::Created)
      }
      Some(existing) if existing.descriptor == *descriptor => Ok(ApplyAction::Unchanged),
      Some(existing) => {
        self.platform.update(descriptor, existing.resource_version).await?;
        Ok(ApplyAction::Updated)
      }
    }
  }
}
