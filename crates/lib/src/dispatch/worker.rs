//! Execution of a single build job on a worker.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::state::JobStore;
use super::types::{BuildJob, DispatchConfig, JobId, JobStatus};
use crate::executor::{BuildExecutor, BuildSpec, ExecutionHandle, ExecutionStatus};

enum Attempt {
  Succeeded(String),
  Failed { reason: String, retryable: bool },
  Cancelled,
}

/// Resolves once cancellation is requested; never resolves if the job is gone.
async fn cancelled(signal: &mut watch::Receiver<bool>) {
  if signal.wait_for(|requested| *requested).await.is_err() {
    std::future::pending::<()>().await;
  }
}

pub(super) struct Worker {
  pub store: Arc<JobStore>,
  pub executor: Arc<dyn BuildExecutor>,
  pub config: DispatchConfig,
  pub completions: mpsc::UnboundedSender<BuildJob>,
}

impl Worker {
  pub async fn run(&self, id: JobId) {
    let Some(mut cancel) = self.store.cancel_signal(&id) else {
      return;
    };

    // A job cancelled while queued never reaches the executor.
    let job = match self.store.transition(&id, JobStatus::Running, |_| {}) {
      Ok(job) => job,
      Err(e) => {
        debug!(job = %id, error = %e, "skipping job");
        return;
      }
    };
    info!(job = %id, parser = %job.parser_id, hash = %job.content_hash.image_tag(), "build started");

    let spec = BuildSpec {
      job_id: id.clone(),
      context: job.context.clone(),
      target_image: job.target_image.clone(),
    };
    let deadline = Instant::now() + self.config.build_timeout;
    let mut retries = 0;

    loop {
      match self.attempt(&spec, &mut cancel, deadline).await {
        Attempt::Failed { reason, retryable: true } if self.config.backoff.allows(retries) => {
          let delay = self.config.backoff.delay_for_attempt(retries);
          retries += 1;
          warn!(job = %id, retry = retries, delay = ?delay, reason = %reason, "transient build failure, retrying");
          self.store.append_logs(&id, [format!("attempt failed: {}; retrying", reason)]);

          tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancelled(&mut cancel) => return self.finish_cancelled(&id),
          }
        }
        Attempt::Failed { reason, .. } => return self.finish_failed(&id, reason),
        Attempt::Succeeded(image) => return self.finish_succeeded(&id, image),
        Attempt::Cancelled => return self.finish_cancelled(&id),
      }
    }
  }

  async fn attempt(&self, spec: &BuildSpec, cancel: &mut watch::Receiver<bool>, deadline: Instant) -> Attempt {
    if *cancel.borrow() {
      return Attempt::Cancelled;
    }
    self.store.modify(&spec.job_id, |job| job.attempts += 1);

    let handle = match self.executor.submit(spec).await {
      Ok(handle) => handle,
      Err(e) => {
        return Attempt::Failed {
          reason: e.to_string(),
          retryable: e.is_transient(),
        };
      }
    };
    debug!(job = %spec.job_id, handle = %handle, "build submitted to executor");

    loop {
      let now = Instant::now();
      if now >= deadline {
        if let Err(e) = self.executor.abort(&handle).await {
          warn!(job = %spec.job_id, error = %e, "failed to abort timed out build");
        }
        self.collect_logs(&spec.job_id, &handle).await;
        return Attempt::Failed {
          reason: format!("timeout: build exceeded {}s", self.config.build_timeout.as_secs()),
          retryable: false,
        };
      }

      tokio::select! {
        _ = cancelled(cancel) => {
          self.abort_with_grace(&spec.job_id, &handle).await;
          return Attempt::Cancelled;
        }
        _ = tokio::time::sleep(self.config.poll_interval.min(deadline - now)) => {}
      }

      let status = self.executor.poll(&handle).await;
      self.collect_logs(&spec.job_id, &handle).await;

      match status {
        Ok(ExecutionStatus::Running) => {}
        Ok(ExecutionStatus::Succeeded { image_reference }) => return Attempt::Succeeded(image_reference),
        Ok(ExecutionStatus::Failed { reason, retryable }) => return Attempt::Failed { reason, retryable },
        Ok(ExecutionStatus::Cancelled) => return Attempt::Cancelled,
        Err(e) if e.is_transient() => {
          warn!(job = %spec.job_id, error = %e, "transient poll failure");
        }
        Err(e) => {
          return Attempt::Failed {
            reason: e.to_string(),
            retryable: false,
          };
        }
      }
    }
  }

  /// Ask the executor to stop, then wait up to the grace period for it to
  /// confirm. The job is cancelled either way.
  async fn abort_with_grace(&self, id: &JobId, handle: &ExecutionHandle) {
    match self.executor.abort(handle).await {
      Ok(true) => debug!(job = %id, "abort requested"),
      Ok(false) => info!(job = %id, "executor cannot abort, waiting for grace period"),
      Err(e) => warn!(job = %id, error = %e, "abort request failed"),
    }

    let confirmed = tokio::time::timeout(self.config.cancel_grace, async {
      loop {
        match self.executor.poll(handle).await {
          Ok(status) if status.is_terminal() => break,
          Err(e) if !e.is_transient() => break,
          _ => tokio::time::sleep(self.config.poll_interval).await,
        }
      }
    })
    .await
    .is_ok();

    if !confirmed {
      warn!(job = %id, "cancellation not confirmed within grace period, forcing");
    }
    self.collect_logs(id, handle).await;
  }

  async fn collect_logs(&self, id: &JobId, handle: &ExecutionHandle) {
    let lines = self.executor.drain_logs(handle).await;
    if !lines.is_empty() {
      self.store.append_logs(id, lines);
    }
  }

  fn finish_succeeded(&self, id: &JobId, image: String) {
    match self.store.succeed_unless_cancelled(id, image) {
      Ok(job) if job.status == JobStatus::Cancelled => {
        info!(job = %id, "build finished after cancellation was requested, not provisioning");
      }
      Ok(job) => {
        info!(job = %id, image = ?job.image_reference, "build succeeded");
        if self.completions.send(job).is_err() {
          warn!(job = %id, "no completion listener, provisioning skipped");
        }
      }
      Err(e) => warn!(job = %id, error = %e, "could not record build success"),
    }
  }

  fn finish_failed(&self, id: &JobId, reason: String) {
    self.store.append_logs(id, [format!("build failed: {}", reason)]);
    match self.store.transition(id, JobStatus::Failed, |job| {
      job.error = Some(reason);
    }) {
      Ok(job) => warn!(job = %id, error = ?job.error, "build failed"),
      Err(e) => warn!(job = %id, error = %e, "could not record build failure"),
    }
  }

  fn finish_cancelled(&self, id: &JobId) {
    match self.store.transition(id, JobStatus::Cancelled, |_| {}) {
      Ok(_) => info!(job = %id, "build cancelled"),
      Err(e) => debug!(job = %id, error = %e, "job already settled"),
    }
  }
}
