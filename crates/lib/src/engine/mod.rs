//! The event-driven build pipeline.
//!
//! [`Engine::process`] takes one inbound event through validation,
//! deduplication, context assembly and dispatch. Completed builds flow from
//! the dispatcher to a background completion loop that provisions them.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::build::{AssembleError, BuildContextAssembler, RecipeSet, StagingStore};
use crate::dispatch::{
  BuildJob, DispatchConfig, DispatchError, Dispatcher, ImageNaming, JobFilter, JobId, JobStatus, Submission,
};
use crate::event::{BuildStartData, Event, EventKind, TargetData};
use crate::executor::BuildExecutor;
use crate::idempotency::{Admission, IdempotencyGuard, IdempotencyStore, SweeperHandle};
use crate::provision::{
  DeprovisionError, DeprovisionReport, ProvisionOutcome, Provisioner, ResourceKind, ResourceName, RuntimePlatform,
};
use crate::registry::{BuildRegistry, PageLimits};
use crate::source::SourceStore;
use crate::util::hash::ContentHash;
use crate::util::retry::Backoff;

/// What was done for an accepted event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Accepted {
  BuildQueued {
    job_id: JobId,
    content_hash: ContentHash,
    /// The context was already staged.
    reused: bool,
  },
  /// A job already covers this content; no new build was queued.
  BuildReused {
    job_id: JobId,
    content_hash: ContentHash,
    status: JobStatus,
  },
  BuildsCancelled {
    job_ids: Vec<JobId>,
  },
  ServiceDeleted {
    name: ResourceName,
    removed: Vec<ResourceKind>,
  },
}

/// Result of processing one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
  Accepted(Accepted),
  SkippedDuplicate,
  /// The event can never succeed as sent.
  RejectedInvalid(String),
  /// A transient failure; the event should be redelivered.
  RejectedError(String),
}

impl ProcessOutcome {
  /// Whether the event should be acknowledged to its sender.
  pub fn acknowledge(&self) -> bool {
    !matches!(self, ProcessOutcome::RejectedError(_))
  }

  pub fn label(&self) -> &'static str {
    match self {
      ProcessOutcome::Accepted(_) => "accepted",
      ProcessOutcome::SkippedDuplicate => "skipped-duplicate",
      ProcessOutcome::RejectedInvalid(_) => "rejected-invalid",
      ProcessOutcome::RejectedError(_) => "rejected-error",
    }
  }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
  pub dispatch: DispatchConfig,
  pub naming: ImageNaming,
  pub recipes: RecipeSet,
  pub page_limits: PageLimits,
  pub idempotency_ttl: Duration,
  pub sweep_interval: Duration,
  /// Retries of failed provisioning.
  pub provision_backoff: Backoff,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      dispatch: DispatchConfig::default(),
      naming: ImageNaming::default(),
      recipes: RecipeSet::default(),
      page_limits: PageLimits::default(),
      idempotency_ttl: Duration::from_secs(24 * 60 * 60),
      sweep_interval: Duration::from_secs(5 * 60),
      provision_backoff: Backoff::default(),
    }
  }
}

/// External systems the engine talks to.
pub struct Backends {
  pub sources: Arc<dyn SourceStore>,
  pub staging: Arc<dyn StagingStore>,
  pub executor: Arc<dyn BuildExecutor>,
  pub platform: Arc<dyn RuntimePlatform>,
  pub idempotency: Arc<dyn IdempotencyStore>,
}

pub struct Engine {
  guard: IdempotencyGuard,
  assembler: BuildContextAssembler,
  dispatcher: Arc<Dispatcher>,
  provisioner: Arc<Provisioner>,
  registry: BuildRegistry,
  sweeper: Mutex<Option<SweeperHandle>>,
  completions: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
  /// Wire the components together and start background tasks.
  ///
  /// Must be called inside a Tokio runtime.
  pub fn start(config: EngineConfig, backends: Backends) -> Self {
    let guard = IdempotencyGuard::new(backends.idempotency, config.idempotency_ttl);
    let sweeper = guard.start_sweeper(config.sweep_interval);

    let (completion_tx, completion_rx) = mpsc::unbounded_channel();
    let dispatcher = Arc::new(Dispatcher::start(
      config.dispatch,
      config.naming,
      backends.executor,
      completion_tx,
    ));
    let provisioner = Arc::new(Provisioner::new(backends.platform));
    let completions = tokio::spawn(run_completions(
      provisioner.clone(),
      config.provision_backoff,
      completion_rx,
    ));

    Self {
      guard,
      assembler: BuildContextAssembler::new(backends.sources, backends.staging, config.recipes),
      registry: BuildRegistry::new(dispatcher.clone(), config.page_limits),
      dispatcher,
      provisioner,
      sweeper: Mutex::new(Some(sweeper)),
      completions: Mutex::new(Some(completions)),
    }
  }

  pub fn registry(&self) -> &BuildRegistry {
    &self.registry
  }

  pub fn guard(&self) -> &IdempotencyGuard {
    &self.guard
  }

  /// Process one inbound event.
  ///
  /// The idempotency record is released on every outcome other than
  /// `Accepted`, so a corrected or redelivered event is admitted again.
  pub async fn process(&self, event: &Event) -> ProcessOutcome {
    let kind = match event.kind() {
      Ok(kind) => kind,
      Err(e) => {
        warn!(event = %event.id, event_type = %event.event_type, error = %e, "invalid event rejected");
        return ProcessOutcome::RejectedInvalid(e.to_string());
      }
    };

    if self.guard.admit(&event.id).await == Admission::Duplicate {
      return ProcessOutcome::SkippedDuplicate;
    }

    let outcome = match kind {
      EventKind::BuildStart(data) => self.start_build(data).await,
      EventKind::BuildCancel(target) => self.cancel_builds(&target),
      EventKind::ServiceDelete(target) => self.delete_service(&target).await,
    };

    match &outcome {
      ProcessOutcome::Accepted(accepted) => info!(event = %event.id, accepted = ?accepted, "event accepted"),
      ProcessOutcome::RejectedInvalid(reason) | ProcessOutcome::RejectedError(reason) => {
        warn!(event = %event.id, outcome = outcome.label(), reason = %reason, "event rejected");
        self.guard.release(&event.id).await;
      }
      ProcessOutcome::SkippedDuplicate => {}
    }
    outcome
  }

  /// Delete the deployment named `name`.
  pub async fn deprovision(&self, name: &ResourceName) -> Result<DeprovisionReport, DeprovisionError> {
    self.provisioner.deprovision(name).await
  }

  /// Stop background tasks and the worker pool.
  ///
  /// Completions already handed over are provisioned before this returns.
  pub async fn shutdown(&self) {
    let sweeper = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner).take();
    if let Some(sweeper) = sweeper {
      sweeper.stop().await;
    }

    self.dispatcher.shutdown().await;

    let completions = self.completions.lock().unwrap_or_else(PoisonError::into_inner).take();
    if let Some(task) = completions
      && let Err(e) = task.await
    {
      warn!(error = %e, "completion loop ended abnormally");
    }
    info!("engine stopped");
  }

  async fn start_build(&self, data: BuildStartData) -> ProcessOutcome {
    let mut request = data.into_request();

    let context = match self.assembler.assemble(&mut request).await {
      Ok(context) => context,
      Err(e) => return assemble_outcome(&request.parser_id, e),
    };

    let content_hash = context.content_hash.clone();
    let reused = context.reused;
    match self.dispatcher.submit_unless_built(context) {
      Ok(Submission::Queued(job_id)) => ProcessOutcome::Accepted(Accepted::BuildQueued {
        job_id,
        content_hash,
        reused,
      }),
      Ok(Submission::InProgress(job) | Submission::Built(job)) => ProcessOutcome::Accepted(Accepted::BuildReused {
        job_id: job.id,
        content_hash,
        status: job.status,
      }),
      Err(e @ (DispatchError::QueueFull { .. } | DispatchError::ShuttingDown)) => {
        ProcessOutcome::RejectedError(e.to_string())
      }
      Err(e) => ProcessOutcome::RejectedInvalid(e.to_string()),
    }
  }

  /// Cancel every pending or running job for the event's parser.
  fn cancel_builds(&self, target: &TargetData) -> ProcessOutcome {
    let mut job_ids = Vec::new();
    for status in [JobStatus::Pending, JobStatus::Running] {
      let filter = JobFilter {
        tenant: Some(target.third_party_id.clone()),
        parser: Some(target.parser_id.clone()),
        status: Some(status),
      };
      for job in self.dispatcher.list(&filter) {
        match self.dispatcher.cancel(&job.id) {
          Ok(_) => job_ids.push(job.id),
          // The job finished between listing and cancelling.
          Err(DispatchError::InvalidState { .. }) => {}
          Err(e) => warn!(job = %job.id, error = %e, "cancel failed"),
        }
      }
    }
    if let Some(reason) = &target.reason {
      info!(parser = %target.parser_id, cancelled = job_ids.len(), reason = %reason, "builds cancelled");
    }
    ProcessOutcome::Accepted(Accepted::BuildsCancelled { job_ids })
  }

  async fn delete_service(&self, target: &TargetData) -> ProcessOutcome {
    let name = match target.resource_name() {
      Ok(name) => name,
      Err(e) => return ProcessOutcome::RejectedInvalid(e.to_string()),
    };

    match self.provisioner.deprovision(&name).await {
      Ok(report) => ProcessOutcome::Accepted(Accepted::ServiceDeleted {
        name,
        removed: report.removed,
      }),
      Err(DeprovisionError::NotFound(_)) => {
        info!(name = %name, "nothing to deprovision");
        ProcessOutcome::Accepted(Accepted::ServiceDeleted {
          name,
          removed: Vec::new(),
        })
      }
      Err(e) => ProcessOutcome::RejectedError(e.to_string()),
    }
  }
}

fn assemble_outcome(parser_id: &str, err: AssembleError) -> ProcessOutcome {
  if err.is_retryable() {
    warn!(parser = %parser_id, error = %err, "build context assembly failed, will retry on redelivery");
    ProcessOutcome::RejectedError(err.to_string())
  } else {
    warn!(parser = %parser_id, error = %err, "build context assembly failed");
    ProcessOutcome::RejectedInvalid(err.to_string())
  }
}

/// Provision completed builds in completion order.
async fn run_completions(
  provisioner: Arc<Provisioner>,
  backoff: Backoff,
  mut completions: mpsc::UnboundedReceiver<BuildJob>,
) {
  while let Some(job) = completions.recv().await {
    provision_with_retry(&provisioner, &backoff, &job).await;
  }
}

async fn provision_with_retry(provisioner: &Provisioner, backoff: &Backoff, job: &BuildJob) {
  let mut retries = 0;
  loop {
    match provisioner.provision(job).await {
      Ok(ProvisionOutcome::Applied(report)) => {
        info!(job = %job.id, name = %report.name, retries, "build provisioned");
        return;
      }
      Ok(ProvisionOutcome::Superseded { .. }) => return,
      Err(e) if e.is_retryable() && backoff.allows(retries) => {
        let delay = backoff.delay_for_attempt(retries);
        retries += 1;
        warn!(job = %job.id, error = %e, retry = retries, delay = ?delay, "provisioning failed, retrying");
        tokio::time::sleep(delay).await;
      }
      Err(e) => {
        error!(job = %job.id, error = %e, "provisioning failed");
        return;
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;
  use crate::build::MemoryStagingStore;
  use crate::consts::{EVENT_TYPE_BUILD_CANCEL, EVENT_TYPE_BUILD_START, EVENT_TYPE_SERVICE_DELETE};
  use crate::idempotency::MemoryIdempotencyStore;
  use crate::provision::PlatformError;
  use crate::source::MemorySourceStore;
  use crate::util::testutil::{FlakyPlatform, Script, ScriptedExecutor};

  struct Harness {
    engine: Engine,
    sources: Arc<MemorySourceStore>,
    platform: Arc<FlakyPlatform>,
    executor: Arc<ScriptedExecutor>,
  }

  fn harness(script: Script) -> Harness {
    let sources = Arc::new(MemorySourceStore::new());
    let platform = Arc::new(FlakyPlatform::new());
    let executor = Arc::new(ScriptedExecutor::new(script));
    let config = EngineConfig {
      dispatch: DispatchConfig {
        workers: 2,
        queue_capacity: 8,
        poll_interval: Duration::from_millis(5),
        cancel_grace: Duration::from_millis(50),
        backoff: Backoff::new(2, Duration::from_millis(5)),
        ..Default::default()
      },
      provision_backoff: Backoff::new(3, Duration::from_millis(5)),
      ..Default::default()
    };
    let engine = Engine::start(
      config,
      Backends {
        sources: sources.clone(),
        staging: Arc::new(MemoryStagingStore::new()),
        executor: executor.clone(),
        platform: platform.clone(),
        idempotency: Arc::new(MemoryIdempotencyStore::new()),
      },
    );
    Harness {
      engine,
      sources,
      platform,
      executor,
    }
  }

  fn build_event(id: &str, parser_id: &str) -> Event {
    Event::new(
      id,
      EVENT_TYPE_BUILD_START,
      "network.notifi.parsers",
      json!({ "third_party_id": "acme", "parser_id": parser_id, "runtime": "nodejs" }),
    )
  }

  fn queued_job(outcome: &ProcessOutcome) -> JobId {
    match outcome {
      ProcessOutcome::Accepted(Accepted::BuildQueued { job_id, .. }) => job_id.clone(),
      other => panic!("expected a queued build, got {:?}", other),
    }
  }

  async fn wait_for<F>(mut check: F)
  where
    F: FnMut() -> bool,
  {
    for _ in 0..400 {
      if check() {
        return;
      }
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
  }

  mod ingress {
    use super::*;

    #[tokio::test]
    async fn duplicate_event_is_skipped() {
      let h = harness(Script::Succeed { polls: 0 });
      h.sources.insert("p1", "module.exports = () => 1;");

      let first = h.engine.process(&build_event("evt-1", "p1")).await;
      queued_job(&first);
      let second = h.engine.process(&build_event("evt-1", "p1")).await;
      assert_eq!(second, ProcessOutcome::SkippedDuplicate);
      assert!(second.acknowledge());
    }

    #[tokio::test]
    async fn missing_source_is_rejected_and_released() {
      let h = harness(Script::Succeed { polls: 0 });

      let outcome = h.engine.process(&build_event("evt-2", "p1")).await;
      assert!(matches!(outcome, ProcessOutcome::RejectedInvalid(ref m) if m.contains("source not found")));
      assert!(outcome.acknowledge());
      assert!(!h.engine.guard().exists("evt-2").await);
      assert_eq!(h.executor.submits(), 0);
    }

    #[tokio::test]
    async fn invalid_payload_is_rejected() {
      let h = harness(Script::Succeed { polls: 0 });
      let event = Event::new(
        "evt-3",
        EVENT_TYPE_BUILD_START,
        "network.notifi.parsers",
        json!({ "third_party_id": "acme" }),
      );
      assert!(matches!(
        h.engine.process(&event).await,
        ProcessOutcome::RejectedInvalid(_)
      ));
    }

    #[tokio::test]
    async fn unknown_event_type_is_rejected() {
      let h = harness(Script::Succeed { polls: 0 });
      let event = Event::new("evt-4", "com.example.other", "x", json!({}));
      assert_eq!(h.engine.process(&event).await.label(), "rejected-invalid");
    }

    #[tokio::test]
    async fn same_content_is_built_once() {
      let h = harness(Script::Hang);
      h.sources.insert("p1", "module.exports = () => 1;");

      let first = queued_job(&h.engine.process(&build_event("evt-a", "p1")).await);
      let registry = h.engine.registry();
      wait_for(|| registry.get(&first).unwrap().job.status == JobStatus::Running).await;
      let second = h.engine.process(&build_event("evt-b", "p1")).await;

      assert!(matches!(
        second,
        ProcessOutcome::Accepted(Accepted::BuildReused { ref job_id, status: JobStatus::Running, .. }) if *job_id == first
      ));
      tokio::time::sleep(Duration::from_millis(20)).await;
      assert_eq!(h.executor.submits(), 1);
    }

    #[tokio::test]
    async fn full_queue_asks_for_redelivery() {
      let h = harness(Script::Hang);
      for i in 0..12 {
        h.sources.insert(&format!("p{}", i), format!("source {}", i));
      }

      let mut last = None;
      for i in 0..12 {
        let outcome = h.engine.process(&build_event(&format!("evt-{}", i), &format!("p{}", i))).await;
        if let ProcessOutcome::RejectedError(_) = outcome {
          last = Some(i);
          break;
        }
      }
      let rejected = last.expect("queue never filled");
      assert!(!h.engine.guard().exists(&format!("evt-{}", rejected)).await);
    }
  }

  mod pipeline {
    use super::*;

    #[tokio::test]
    async fn successful_build_is_provisioned() {
      let h = harness(Script::Succeed { polls: 1 });
      h.sources.insert("p1", "module.exports = () => 1;");

      let job_id = queued_job(&h.engine.process(&build_event("evt-1", "p1")).await);
      let platform = h.platform.clone();
      wait_for(|| platform.inner().len() == 4).await;

      let detail = h.engine.registry().get(&job_id).unwrap();
      assert_eq!(detail.job.status, JobStatus::Succeeded);
      assert!(h.platform.inner().resource(ResourceKind::Route, "lambda-acme-p1").is_some());
    }

    #[tokio::test]
    async fn failed_route_is_retried() {
      let h = harness(Script::Succeed { polls: 0 });
      h.sources.insert("p1", "module.exports = () => 1;");
      h.platform
        .fail(ResourceKind::Route, 1, PlatformError::Unavailable("503".to_string()));

      h.engine.process(&build_event("evt-1", "p1")).await;
      let platform = h.platform.clone();
      wait_for(|| platform.inner().resource(ResourceKind::Route, "lambda-acme-p1").is_some()).await;

      let service = h
        .platform
        .inner()
        .resource(ResourceKind::Service, "lambda-acme-p1")
        .unwrap();
      assert_eq!(service.resource_version, 1);
    }

    #[tokio::test]
    async fn cancel_event_stops_active_builds() {
      let h = harness(Script::Hang);
      h.sources.insert("p1", "module.exports = () => 1;");
      let job_id = queued_job(&h.engine.process(&build_event("evt-1", "p1")).await);

      let cancel = Event::new(
        "evt-2",
        EVENT_TYPE_BUILD_CANCEL,
        "network.notifi.parsers",
        json!({ "third_party_id": "acme", "parser_id": "p1", "reason": "superseded" }),
      );
      let outcome = h.engine.process(&cancel).await;
      assert_eq!(
        outcome,
        ProcessOutcome::Accepted(Accepted::BuildsCancelled {
          job_ids: vec![job_id.clone()]
        })
      );

      let registry = h.engine.registry();
      wait_for(|| registry.get(&job_id).unwrap().job.status == JobStatus::Cancelled).await;
      assert!(h.platform.inner().is_empty());
    }

    #[tokio::test]
    async fn delete_event_deprovisions() {
      let h = harness(Script::Succeed { polls: 0 });
      h.sources.insert("p1", "module.exports = () => 1;");
      h.engine.process(&build_event("evt-1", "p1")).await;
      let platform = h.platform.clone();
      wait_for(|| platform.inner().len() == 4).await;

      let delete = Event::new(
        "evt-2",
        EVENT_TYPE_SERVICE_DELETE,
        "network.notifi.parsers",
        json!({ "third_party_id": "acme", "parser_id": "p1" }),
      );
      let outcome = h.engine.process(&delete).await;
      assert!(matches!(
        outcome,
        ProcessOutcome::Accepted(Accepted::ServiceDeleted { ref removed, .. }) if removed.len() == 4
      ));
      assert!(h.platform.inner().is_empty());
    }

    #[tokio::test]
    async fn rebuilt_content_redeploys_after_delete() {
      let h = harness(Script::Succeed { polls: 0 });
      h.sources.insert("p1", "module.exports = () => 1;");
      let built = queued_job(&h.engine.process(&build_event("evt-1", "p1")).await);
      let platform = h.platform.clone();
      wait_for(|| platform.inner().len() == 4).await;

      let name = ResourceName::derive("acme", "p1");
      h.engine.deprovision(&name).await.unwrap();
      assert!(h.platform.inner().is_empty());

      let outcome = h.engine.process(&build_event("evt-2", "p1")).await;
      assert!(matches!(
        outcome,
        ProcessOutcome::Accepted(Accepted::BuildReused { ref job_id, status: JobStatus::Succeeded, .. }) if *job_id == built
      ));
      wait_for(|| platform.inner().len() == 4).await;
      assert_eq!(h.executor.submits(), 1);
    }

    #[tokio::test]
    async fn shutdown_stops_background_tasks() {
      let h = harness(Script::Succeed { polls: 0 });
      h.engine.shutdown().await;
      h.sources.insert("p1", "x");
      assert_eq!(
        h.engine.process(&build_event("evt-9", "p1")).await.label(),
        "rejected-error"
      );
    }
  }
}
