//! Shared build-job state.
//!
//! Every mutation goes through [`JobStore::transition`] or
//! [`JobStore::request_cancel`], which check the state machine under the
//! write lock. Readers always get snapshots.

use std::collections::{HashMap, VecDeque};
use std::sync::{PoisonError, RwLock};

use chrono::Utc;
use tokio::sync::watch;
use tracing::debug;

use super::types::{BuildJob, DispatchError, JobFilter, JobId, JobStatus};

struct JobEntry {
  job: BuildJob,
  logs: VecDeque<String>,
  cancel: watch::Sender<bool>,
}

/// Result of a cancel request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelRequest {
  /// The job was pending and is now cancelled.
  Cancelled(BuildJob),
  /// The job is running; its worker has been signalled.
  Signalled(BuildJob),
}

impl CancelRequest {
  pub fn job(&self) -> &BuildJob {
    match self {
      CancelRequest::Cancelled(job) | CancelRequest::Signalled(job) => job,
    }
  }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TransitionError {
  #[error("build job not found: {0}")]
  NotFound(JobId),

  #[error("invalid transition for {id}: {from} -> {to}")]
  Invalid { id: JobId, from: JobStatus, to: JobStatus },
}

pub struct JobStore {
  jobs: RwLock<HashMap<JobId, JobEntry>>,
  log_tail: usize,
  retained: usize,
}

impl JobStore {
  pub fn new(log_tail: usize, retained: usize) -> Self {
    Self {
      jobs: RwLock::new(HashMap::new()),
      log_tail,
      retained,
    }
  }

  pub fn insert(&self, job: BuildJob) {
    let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
    self.insert_locked(&mut jobs, job);
  }

  /// Insert `job` unless another job already covers its content.
  ///
  /// A pending or running job with the same name and content hash is
  /// returned instead, unless it is being cancelled. So is the newest
  /// succeeded job under the name when its hash matches; an older success
  /// is not returned, since applying it again would roll the service back
  /// behind a newer image.
  pub fn insert_unless_built(&self, job: BuildJob) -> Option<BuildJob> {
    let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);

    let mut active = None;
    let mut newest_success: Option<&BuildJob> = None;
    for existing in jobs.values().map(|entry| &entry.job) {
      if existing.resource_name != job.resource_name {
        continue;
      }
      match existing.status {
        JobStatus::Pending | JobStatus::Running
          if existing.content_hash == job.content_hash && !existing.cancel_requested =>
        {
          active = Some(existing);
          break;
        }
        JobStatus::Succeeded if newest_success.is_none_or(|n| existing.completed_at > n.completed_at) => {
          newest_success = Some(existing);
        }
        _ => {}
      }
    }
    let covering = active
      .or_else(|| newest_success.filter(|n| n.content_hash == job.content_hash))
      .cloned();

    if covering.is_none() {
      self.insert_locked(&mut jobs, job);
    }
    covering
  }

  fn insert_locked(&self, jobs: &mut HashMap<JobId, JobEntry>, job: BuildJob) {
    let (cancel, _) = watch::channel(false);
    jobs.insert(
      job.id.clone(),
      JobEntry {
        job,
        logs: VecDeque::new(),
        cancel,
      },
    );
    self.evict_finished(jobs);
  }

  /// Drop the oldest finished jobs beyond the retention limit.
  fn evict_finished(&self, jobs: &mut HashMap<JobId, JobEntry>) {
    let mut finished: Vec<_> = jobs
      .values()
      .filter(|entry| entry.job.status.is_terminal())
      .map(|entry| (entry.job.completed_at, entry.job.id.clone()))
      .collect();
    if finished.len() <= self.retained {
      return;
    }
    finished.sort();
    let excess = finished.len() - self.retained;
    for (_, id) in finished.into_iter().take(excess) {
      jobs.remove(&id);
    }
    debug!(evicted = excess, "finished build jobs evicted");
  }

  pub fn remove(&self, id: &JobId) -> Option<BuildJob> {
    let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
    jobs.remove(id).map(|entry| entry.job)
  }

  pub fn get(&self, id: &JobId) -> Option<BuildJob> {
    let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
    jobs.get(id).map(|entry| entry.job.clone())
  }

  /// Jobs matching `filter`, newest first.
  pub fn list(&self, filter: &JobFilter) -> Vec<BuildJob> {
    let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
    let mut matching: Vec<BuildJob> = jobs
      .values()
      .filter(|entry| filter.matches(&entry.job))
      .map(|entry| entry.job.clone())
      .collect();
    matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
    matching
  }

  /// The retained log tail, oldest line first.
  pub fn logs(&self, id: &JobId) -> Option<Vec<String>> {
    let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
    jobs.get(id).map(|entry| entry.logs.iter().cloned().collect())
  }

  pub fn append_logs<I>(&self, id: &JobId, lines: I)
  where
    I: IntoIterator<Item = String>,
  {
    if self.log_tail == 0 {
      return;
    }
    let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
    if let Some(entry) = jobs.get_mut(id) {
      for line in lines {
        if entry.logs.len() >= self.log_tail {
          entry.logs.pop_front();
        }
        entry.logs.push_back(line);
      }
    }
  }

  /// Update fields that do not affect the lifecycle.
  pub fn modify<F>(&self, id: &JobId, update: F)
  where
    F: FnOnce(&mut BuildJob),
  {
    let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
    if let Some(entry) = jobs.get_mut(id) {
      let status = entry.job.status;
      update(&mut entry.job);
      entry.job.status = status;
    }
  }

  /// Receiver that flips to `true` when cancellation is requested.
  pub fn cancel_signal(&self, id: &JobId) -> Option<watch::Receiver<bool>> {
    let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
    jobs.get(id).map(|entry| entry.cancel.subscribe())
  }

  /// Move a job to `to`, then apply `update` to it under the same lock.
  ///
  /// Timestamps for `Running` and terminal states are set here.
  pub fn transition<F>(&self, id: &JobId, to: JobStatus, update: F) -> Result<BuildJob, TransitionError>
  where
    F: FnOnce(&mut BuildJob),
  {
    let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
    let entry = jobs.get_mut(id).ok_or_else(|| TransitionError::NotFound(id.clone()))?;
    apply_transition(&mut entry.job, to, update)
  }

  /// Record a finished build as `Succeeded`, or as `Cancelled` when a
  /// cancel request landed before the result did.
  pub fn succeed_unless_cancelled(&self, id: &JobId, image: String) -> Result<BuildJob, TransitionError> {
    let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
    let entry = jobs.get_mut(id).ok_or_else(|| TransitionError::NotFound(id.clone()))?;
    if entry.job.cancel_requested {
      return apply_transition(&mut entry.job, JobStatus::Cancelled, |_| {});
    }
    apply_transition(&mut entry.job, JobStatus::Succeeded, |job| {
      job.image_reference = Some(image);
    })
  }

  /// Apply a cancel request.
  ///
  /// Pending jobs are cancelled immediately. Running jobs are flagged and
  /// their worker is signalled. Terminal jobs are an `InvalidState`.
  pub fn request_cancel(&self, id: &JobId) -> Result<CancelRequest, DispatchError> {
    let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
    let entry = jobs.get_mut(id).ok_or_else(|| DispatchError::NotFound(id.clone()))?;

    match entry.job.status {
      JobStatus::Pending => {
        entry.job.status = JobStatus::Cancelled;
        entry.job.cancel_requested = true;
        entry.job.completed_at = Some(Utc::now());
        entry.cancel.send_replace(true);
        Ok(CancelRequest::Cancelled(entry.job.clone()))
      }
      JobStatus::Running => {
        entry.job.cancel_requested = true;
        entry.cancel.send_replace(true);
        Ok(CancelRequest::Signalled(entry.job.clone()))
      }
      status => Err(DispatchError::InvalidState { id: id.clone(), status }),
    }
  }
}

fn apply_transition<F>(job: &mut BuildJob, to: JobStatus, update: F) -> Result<BuildJob, TransitionError>
where
  F: FnOnce(&mut BuildJob),
{
  let from = job.status;
  if !from.can_transition_to(to) {
    return Err(TransitionError::Invalid {
      id: job.id.clone(),
      from,
      to,
    });
  }

  job.status = to;
  let now = Utc::now();
  if to == JobStatus::Running {
    job.started_at = Some(now);
  }
  if to.is_terminal() {
    job.completed_at = Some(now);
  }
  update(job);
  Ok(job.clone())
}
