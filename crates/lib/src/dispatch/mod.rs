//! Bounded build queue and worker pool.
//!
//! Jobs enter through [`Dispatcher::submit`] as `Pending`, are claimed by
//! one of a fixed number of workers, and end in exactly one terminal state.
//! Successful jobs are sent on the completion channel for provisioning.

mod state;
mod types;
mod worker;

use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::build::BuildContextRef;
use crate::executor::BuildExecutor;
use crate::provision::ResourceName;

pub use state::{CancelRequest, JobStore, TransitionError};
pub use types::*;
use worker::Worker;

/// How [`Dispatcher::submit_unless_built`] handled a context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
  Queued(JobId),
  /// A pending or running job is already building this content.
  InProgress(BuildJob),
  /// This content was already built.
  Built(BuildJob),
}

pub struct Dispatcher {
  store: Arc<JobStore>,
  /// Dropped on shutdown so the completion channel can close.
  completions: StdMutex<Option<mpsc::UnboundedSender<BuildJob>>>,
  queue: mpsc::Sender<JobId>,
  workers: Mutex<JoinSet<()>>,
  worker_count: usize,
  naming: ImageNaming,
  accepting: AtomicBool,
}

impl Dispatcher {
  /// Spawn the worker pool. Must be called inside a Tokio runtime.
  pub fn start(
    config: DispatchConfig,
    naming: ImageNaming,
    executor: Arc<dyn BuildExecutor>,
    completions: mpsc::UnboundedSender<BuildJob>,
  ) -> Self {
    let store = Arc::new(JobStore::new(config.log_tail_lines, config.retained_jobs));
    let capacity = config.queue_capacity.max(1);
    let worker_count = config.workers.max(1);
    let (queue, receiver) = mpsc::channel::<JobId>(capacity);
    let receiver = Arc::new(Mutex::new(receiver));

    let worker = Arc::new(Worker {
      store: store.clone(),
      executor,
      config,
      completions: completions.clone(),
    });

    let mut workers = JoinSet::new();
    for index in 0..worker_count {
      let receiver = receiver.clone();
      let worker = worker.clone();
      workers.spawn(async move {
        loop {
          let next = receiver.lock().await.recv().await;
          let Some(id) = next else {
            break;
          };
          worker.run(id).await;
        }
        debug!(worker = index, "worker stopped");
      });
    }
    info!(workers = worker_count, capacity, "dispatcher started");

    Self {
      store,
      completions: StdMutex::new(Some(completions)),
      queue,
      workers: Mutex::new(workers),
      worker_count,
      naming,
      accepting: AtomicBool::new(true),
    }
  }

  /// Enqueue a build for a published context.
  ///
  /// Fails with [`DispatchError::QueueFull`] instead of blocking.
  pub fn submit(&self, context: BuildContextRef) -> Result<JobId, DispatchError> {
    let job = self.new_job(context)?;
    self.store.insert(job.clone());
    self.enqueue(&job)
  }

  /// Enqueue a build unless a job already covers the same content.
  ///
  /// A covering job that already succeeded is sent for provisioning again,
  /// so a deployment removed since then comes back.
  pub fn submit_unless_built(&self, context: BuildContextRef) -> Result<Submission, DispatchError> {
    let job = self.new_job(context)?;
    let Some(existing) = self.store.insert_unless_built(job.clone()) else {
      return self.enqueue(&job).map(Submission::Queued);
    };

    if existing.status == JobStatus::Succeeded {
      info!(job = %existing.id, hash = %existing.content_hash.image_tag(), "content already built, reprovisioning");
      let completions = self.completions.lock().unwrap_or_else(PoisonError::into_inner);
      let sent = completions.as_ref().is_some_and(|tx| tx.send(existing.clone()).is_ok());
      if !sent {
        warn!(job = %existing.id, "no completion listener, provisioning skipped");
      }
      Ok(Submission::Built(existing))
    } else {
      info!(job = %existing.id, hash = %existing.content_hash.image_tag(), "content already building");
      Ok(Submission::InProgress(existing))
    }
  }

  fn new_job(&self, context: BuildContextRef) -> Result<BuildJob, DispatchError> {
    if !self.accepting.load(Ordering::SeqCst) {
      return Err(DispatchError::ShuttingDown);
    }

    let resource_name = ResourceName::derive(&context.third_party_id, &context.parser_id);
    Ok(BuildJob {
      id: JobId::generate(),
      third_party_id: context.third_party_id.clone(),
      parser_id: context.parser_id.clone(),
      runtime: context.runtime,
      content_hash: context.content_hash.clone(),
      target_image: self.naming.image_for(&resource_name, &context.content_hash),
      resource_name,
      status: JobStatus::Pending,
      created_at: Utc::now(),
      started_at: None,
      completed_at: None,
      image_reference: None,
      error: None,
      attempts: 0,
      cancel_requested: false,
      context,
    })
  }

  /// Hand a stored pending job to the workers, forgetting it on failure.
  fn enqueue(&self, job: &BuildJob) -> Result<JobId, DispatchError> {
    match self.queue.try_send(job.id.clone()) {
      Ok(()) => {
        info!(job = %job.id, parser = %job.parser_id, "build queued");
        Ok(job.id.clone())
      }
      Err(mpsc::error::TrySendError::Full(_)) => {
        self.store.remove(&job.id);
        let capacity = self.queue.max_capacity();
        warn!(parser = %job.parser_id, capacity, "build queue full");
        Err(DispatchError::QueueFull { capacity })
      }
      Err(mpsc::error::TrySendError::Closed(_)) => {
        self.store.remove(&job.id);
        Err(DispatchError::ShuttingDown)
      }
    }
  }

  pub fn get(&self, id: &JobId) -> Option<BuildJob> {
    self.store.get(id)
  }

  pub fn logs(&self, id: &JobId) -> Option<Vec<String>> {
    self.store.logs(id)
  }

  pub fn list(&self, filter: &JobFilter) -> Vec<BuildJob> {
    self.store.list(filter)
  }

  /// Cancel a job. Pending jobs are cancelled at once; running jobs are
  /// signalled and settle asynchronously.
  pub fn cancel(&self, id: &JobId) -> Result<BuildJob, DispatchError> {
    let request = self.store.request_cancel(id)?;
    match &request {
      CancelRequest::Cancelled(job) => info!(job = %job.id, "pending build cancelled"),
      CancelRequest::Signalled(job) => info!(job = %job.id, "running build signalled to cancel"),
    }
    Ok(request.job().clone())
  }

  pub fn stats(&self) -> PoolStats {
    let queue_capacity = self.queue.max_capacity();
    PoolStats {
      workers: self.worker_count,
      queue_depth: queue_capacity - self.queue.capacity(),
      queue_capacity,
    }
  }

  /// Stop accepting jobs and stop the workers. Running builds are dropped.
  pub async fn shutdown(&self) {
    self.accepting.store(false, Ordering::SeqCst);
    self.completions.lock().unwrap_or_else(PoisonError::into_inner).take();
    let mut workers = self.workers.lock().await;
    workers.shutdown().await;
    info!("dispatcher stopped");
  }
}
