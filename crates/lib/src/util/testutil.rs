//! Fixtures and fakes shared by unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;

use crate::build::{BuildContextRef, Runtime};
use crate::dispatch::{BuildJob, ImageNaming, JobId, JobStatus};
use crate::executor::{BuildExecutor, BuildSpec, ExecutionHandle, ExecutionStatus, ExecutorError};
use crate::provision::{
  Descriptor, MemoryPlatform, PlatformError, ResourceKind, ResourceName, RuntimePlatform, StoredResource,
};
use crate::util::hash::{ContentHash, hash_bytes};

pub fn sample_context(third_party_id: &str, parser_id: &str) -> BuildContextRef {
  let content_hash = hash_bytes(format!("{}/{}", third_party_id, parser_id).as_bytes());
  BuildContextRef {
    third_party_id: third_party_id.to_string(),
    parser_id: parser_id.to_string(),
    runtime: Runtime::NodeJs,
    key: format!("build-context/{}/{}/context.tar.gz", parser_id, content_hash),
    uri: format!("/staging/build-context/{}/{}/context.tar.gz", parser_id, content_hash),
    content_hash,
    reused: false,
    size: 128,
  }
}

/// A pending job as the dispatcher would create it.
pub fn sample_job(third_party_id: &str, parser_id: &str) -> BuildJob {
  let context = sample_context(third_party_id, parser_id);
  let resource_name = ResourceName::derive(third_party_id, parser_id);
  BuildJob {
    id: JobId::generate(),
    third_party_id: third_party_id.to_string(),
    parser_id: parser_id.to_string(),
    runtime: context.runtime,
    content_hash: context.content_hash.clone(),
    target_image: ImageNaming::default().image_for(&resource_name, &context.content_hash),
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
  }
}

/// A succeeded job whose content hash is `hash`.
pub fn succeeded_job(third_party_id: &str, parser_id: &str, hash: &str) -> BuildJob {
  let mut job = sample_job(third_party_id, parser_id);
  let now = Utc::now();
  job.content_hash = ContentHash(hash.to_string());
  job.target_image = ImageNaming::default().image_for(&job.resource_name, &job.content_hash);
  job.image_reference = Some(job.target_image.clone());
  job.status = JobStatus::Succeeded;
  job.started_at = Some(now);
  job.completed_at = Some(now);
  job.attempts = 1;
  job
}

/// Behaviour of one scripted execution.
#[derive(Debug, Clone)]
pub enum Script {
  /// Succeeds after reporting `Running` for `polls` polls.
  Succeed { polls: usize },
  Fail { reason: &'static str, retryable: bool },
  /// `submit` itself fails.
  Reject(ExecutorError),
  /// Runs until aborted.
  Hang,
  /// Runs forever; aborts are ignored.
  Stubborn,
}

struct Run {
  script: Script,
  polls: usize,
  aborted: bool,
  target_image: String,
  logs: Vec<String>,
}

/// Executor that plays back scripts in submission order, then `fallback`.
pub struct ScriptedExecutor {
  scripts: Mutex<VecDeque<Script>>,
  fallback: Script,
  runs: Mutex<HashMap<ExecutionHandle, Run>>,
  submits: AtomicUsize,
  aborts: AtomicUsize,
  can_abort: bool,
}

impl ScriptedExecutor {
  pub fn new(fallback: Script) -> Self {
    Self {
      scripts: Mutex::new(VecDeque::new()),
      fallback,
      runs: Mutex::new(HashMap::new()),
      submits: AtomicUsize::new(0),
      aborts: AtomicUsize::new(0),
      can_abort: true,
    }
  }

  /// Queue a script ahead of the fallback.
  pub fn then(self, script: Script) -> Self {
    self.scripts.lock().unwrap().push_back(script);
    self
  }

  pub fn without_abort(mut self) -> Self {
    self.can_abort = false;
    self
  }

  pub fn submits(&self) -> usize {
    self.submits.load(Ordering::SeqCst)
  }

  pub fn aborts(&self) -> usize {
    self.aborts.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl BuildExecutor for ScriptedExecutor {
  async fn submit(&self, spec: &BuildSpec) -> Result<ExecutionHandle, ExecutorError> {
    let n = self.submits.fetch_add(1, Ordering::SeqCst);
    let script = self
      .scripts
      .lock()
      .unwrap()
      .pop_front()
      .unwrap_or_else(|| self.fallback.clone());
    if let Script::Reject(err) = script {
      return Err(err);
    }

    let handle = ExecutionHandle(format!("run-{}", n));
    self.runs.lock().unwrap().insert(
      handle.clone(),
      Run {
        script,
        polls: 0,
        aborted: false,
        target_image: spec.target_image.clone(),
        logs: vec![format!("building {}", spec.target_image)],
      },
    );
    Ok(handle)
  }

  async fn poll(&self, handle: &ExecutionHandle) -> Result<ExecutionStatus, ExecutorError> {
    let mut runs = self.runs.lock().unwrap();
    let run = runs
      .get_mut(handle)
      .ok_or_else(|| ExecutorError::UnknownHandle(handle.clone()))?;

    Ok(match &run.script {
      Script::Succeed { polls } if run.polls >= *polls => ExecutionStatus::Succeeded {
        image_reference: run.target_image.clone(),
      },
      Script::Succeed { .. } => {
        run.polls += 1;
        ExecutionStatus::Running
      }
      Script::Fail { reason, retryable } => {
        run.logs.push(format!("error: {}", reason));
        ExecutionStatus::Failed {
          reason: reason.to_string(),
          retryable: *retryable,
        }
      }
      Script::Hang if run.aborted => ExecutionStatus::Cancelled,
      Script::Hang | Script::Stubborn | Script::Reject(_) => ExecutionStatus::Running,
    })
  }

  async fn abort(&self, handle: &ExecutionHandle) -> Result<bool, ExecutorError> {
    self.aborts.fetch_add(1, Ordering::SeqCst);
    if !self.can_abort {
      return Ok(false);
    }
    if let Some(run) = self.runs.lock().unwrap().get_mut(handle) {
      run.aborted = true;
    }
    Ok(true)
  }

  async fn drain_logs(&self, handle: &ExecutionHandle) -> Vec<String> {
    self
      .runs
      .lock()
      .unwrap()
      .get_mut(handle)
      .map(|run| std::mem::take(&mut run.logs))
      .unwrap_or_default()
  }
}

/// Memory platform whose mutations of a kind can be made to fail.
#[derive(Default)]
pub struct FlakyPlatform {
  inner: MemoryPlatform,
  failures: Mutex<HashMap<ResourceKind, VecDeque<PlatformError>>>,
}

impl FlakyPlatform {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn inner(&self) -> &MemoryPlatform {
    &self.inner
  }

  /// Fail the next `times` writes or deletes of `kind` with `error`.
  pub fn fail(&self, kind: ResourceKind, times: usize, error: PlatformError) {
    let mut failures = self.failures.lock().unwrap();
    let queue = failures.entry(kind).or_default();
    queue.extend(std::iter::repeat_n(error, times));
  }

  fn injected(&self, kind: ResourceKind) -> Result<(), PlatformError> {
    match self.failures.lock().unwrap().get_mut(&kind).and_then(VecDeque::pop_front) {
      Some(error) => Err(error),
      None => Ok(()),
    }
  }
}

#[async_trait]
impl RuntimePlatform for FlakyPlatform {
  async fn get(&self, kind: ResourceKind, name: &str) -> Result<Option<StoredResource>, PlatformError> {
    self.inner.get(kind, name).await
  }

  async fn create(&self, descriptor: &Descriptor) -> Result<StoredResource, PlatformError> {
    self.injected(descriptor.kind())?;
    self.inner.create(descriptor).await
  }

  async fn update(&self, descriptor: &Descriptor, resource_version: u64) -> Result<StoredResource, PlatformError> {
    self.injected(descriptor.kind())?;
    self.inner.update(descriptor, resource_version).await
  }

  async fn delete(&self, kind: ResourceKind, name: &str) -> Result<(), PlatformError> {
    self.injected(kind)?;
    self.inner.delete(kind, name).await
  }
}
