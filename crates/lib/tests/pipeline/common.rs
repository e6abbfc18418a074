//! Shared harness for pipeline tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use lamina_lib::build::MemoryStagingStore;
use lamina_lib::consts::EVENT_TYPE_BUILD_START;
use lamina_lib::dispatch::{DispatchConfig, JobId};
use lamina_lib::engine::{Accepted, Backends, Engine, EngineConfig, ProcessOutcome};
use lamina_lib::event::Event;
use lamina_lib::executor::{BuildExecutor, BuildSpec, ExecutionHandle, ExecutionStatus, ExecutorError};
use lamina_lib::idempotency::MemoryIdempotencyStore;
use lamina_lib::provision::{Descriptor, MemoryPlatform, PlatformError, ResourceKind, RuntimePlatform, StoredResource};
use lamina_lib::source::MemorySourceStore;
use lamina_lib::util::retry::Backoff;
use serde_json::json;

/// How a submitted build behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
  Succeed,
  Fail,
  Hang,
}

/// Builder that resolves each build on its first poll.
pub struct FakeBuilder {
  outcome: Outcome,
  runs: Mutex<HashMap<ExecutionHandle, (String, bool)>>,
  next: Mutex<u64>,
}

impl FakeBuilder {
  pub fn new(outcome: Outcome) -> Self {
    Self {
      outcome,
      runs: Mutex::new(HashMap::new()),
      next: Mutex::new(0),
    }
  }
}

#[async_trait]
impl BuildExecutor for FakeBuilder {
  async fn submit(&self, spec: &BuildSpec) -> Result<ExecutionHandle, ExecutorError> {
    let mut next = self.next.lock().unwrap();
    *next += 1;
    let handle = ExecutionHandle(format!("fake-{}", next));
    self
      .runs
      .lock()
      .unwrap()
      .insert(handle.clone(), (spec.target_image.clone(), false));
    Ok(handle)
  }

  async fn poll(&self, handle: &ExecutionHandle) -> Result<ExecutionStatus, ExecutorError> {
    let runs = self.runs.lock().unwrap();
    let (image, aborted) = runs
      .get(handle)
      .ok_or_else(|| ExecutorError::UnknownHandle(handle.clone()))?;
    Ok(match self.outcome {
      Outcome::Succeed => ExecutionStatus::Succeeded {
        image_reference: image.clone(),
      },
      Outcome::Fail => ExecutionStatus::Failed {
        reason: "compile error".to_string(),
        retryable: false,
      },
      Outcome::Hang if *aborted => ExecutionStatus::Cancelled,
      Outcome::Hang => ExecutionStatus::Running,
    })
  }

  async fn abort(&self, handle: &ExecutionHandle) -> Result<bool, ExecutorError> {
    if let Some(run) = self.runs.lock().unwrap().get_mut(handle) {
      run.1 = true;
    }
    Ok(true)
  }

  async fn drain_logs(&self, _handle: &ExecutionHandle) -> Vec<String> {
    Vec::new()
  }
}

/// Memory platform that fails route writes a set number of times.
#[derive(Default)]
pub struct RoutePlatform {
  pub inner: MemoryPlatform,
  route_failures: Mutex<VecDeque<PlatformError>>,
}

impl RoutePlatform {
  pub fn failing_routes(times: usize) -> Self {
    let platform = Self::default();
    platform
      .route_failures
      .lock()
      .unwrap()
      .extend((0..times).map(|_| PlatformError::Unavailable("broker unavailable".to_string())));
    platform
  }

  fn check(&self, kind: ResourceKind) -> Result<(), PlatformError> {
    if kind != ResourceKind::Route {
      return Ok(());
    }
    match self.route_failures.lock().unwrap().pop_front() {
      Some(error) => Err(error),
      None => Ok(()),
    }
  }
}

#[async_trait]
impl RuntimePlatform for RoutePlatform {
  async fn get(&self, kind: ResourceKind, name: &str) -> Result<Option<StoredResource>, PlatformError> {
    self.inner.get(kind, name).await
  }

  async fn create(&self, descriptor: &Descriptor) -> Result<StoredResource, PlatformError> {
    self.check(descriptor.kind())?;
    self.inner.create(descriptor).await
  }

  async fn update(&self, descriptor: &Descriptor, resource_version: u64) -> Result<StoredResource, PlatformError> {
    self.check(descriptor.kind())?;
    self.inner.update(descriptor, resource_version).await
  }

  async fn delete(&self, kind: ResourceKind, name: &str) -> Result<(), PlatformError> {
    self.inner.delete(kind, name).await
  }
}

pub struct TestPipeline {
  pub engine: Engine,
  pub sources: Arc<MemorySourceStore>,
  pub staging: Arc<MemoryStagingStore>,
  pub platform: Arc<RoutePlatform>,
}

impl TestPipeline {
  pub fn new(outcome: Outcome, platform: RoutePlatform) -> Self {
    let sources = Arc::new(MemorySourceStore::new());
    let staging = Arc::new(MemoryStagingStore::new());
    let platform = Arc::new(platform);
    let config = EngineConfig {
      dispatch: DispatchConfig {
        workers: 2,
        queue_capacity: 8,
        poll_interval: Duration::from_millis(5),
        cancel_grace: Duration::from_millis(50),
        ..Default::default()
      },
      provision_backoff: Backoff::new(3, Duration::from_millis(5)),
      ..Default::default()
    };
    let engine = Engine::start(
      config,
      Backends {
        sources: sources.clone(),
        staging: staging.clone(),
        executor: Arc::new(FakeBuilder::new(outcome)),
        platform: platform.clone(),
        idempotency: Arc::new(MemoryIdempotencyStore::new()),
      },
    );
    Self {
      engine,
      sources,
      staging,
      platform,
    }
  }
}

pub fn build_event(id: &str, third_party_id: &str, parser_id: &str) -> Event {
  Event::new(
    id,
    EVENT_TYPE_BUILD_START,
    "network.notifi.parsers",
    json!({ "third_party_id": third_party_id, "parser_id": parser_id, "runtime": "nodejs" }),
  )
}

pub fn queued(outcome: &ProcessOutcome) -> (JobId, String) {
  match outcome {
    ProcessOutcome::Accepted(Accepted::BuildQueued {
      job_id, content_hash, ..
    }) => (job_id.clone(), content_hash.0.clone()),
    other => panic!("expected a queued build, got {:?}", other),
  }
}

/// Poll `check` until it holds, panicking after two seconds.
pub async fn eventually<F>(mut check: F)
where
  F: FnMut() -> bool,
{
  for _ in 0..400 {
    if check() {
      return;
    }
    tokio::time::sleep(Duration::from_millis(5)).await;
  }
  panic!("condition not reached in time");
}
