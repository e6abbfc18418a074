//! Executor that runs a configured shell command per build.
//!
//! The command receives the build through environment variables:
//! - `LAMINA_CONTEXT`: locator of the staged context archive
//! - `LAMINA_IMAGE`: image reference to push
//! - `LAMINA_CONTENT_HASH`: full content hash
//! - `LAMINA_JOB_ID`: the job id
//!
//! Exit code 0 is success. `EX_TEMPFAIL` (75) and `EX_UNAVAILABLE` (69) are
//! retryable failures; every other exit code is terminal.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{BuildExecutor, BuildSpec, ExecutionHandle, ExecutionStatus, ExecutorError};
use crate::consts::ARCHIVE_MTIME;

const EX_UNAVAILABLE: i32 = 69;
const EX_TEMPFAIL: i32 = 75;

/// How long output readers may run after the process exits. A background
/// process holding the pipes open would otherwise stall the poll.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

struct RunningBuild {
  child: Child,
  target_image: String,
  lines: Arc<StdMutex<Vec<String>>>,
  readers: Vec<JoinHandle<()>>,
  aborted: bool,
  /// A terminal status was reported; the entry goes on the next drain.
  finished: bool,
}

pub struct CommandExecutor {
  command: String,
  shell: String,
  runs: Mutex<HashMap<ExecutionHandle, RunningBuild>>,
}

impl CommandExecutor {
  pub fn new(command: &str) -> Self {
    Self {
      command: command.to_string(),
      shell: default_shell().to_string(),
      runs: Mutex::new(HashMap::new()),
    }
  }

  /// Use a shell other than `/bin/sh`. It must accept `-c <script>`.
  pub fn with_shell(mut self, shell: &str) -> Self {
    self.shell = shell.to_string();
    self
  }
}

#[cfg(unix)]
fn default_shell() -> &'static str {
  "/bin/sh"
}

#[cfg(windows)]
fn default_shell() -> &'static str {
  "sh"
}

fn collect_lines<R>(reader: R, lines: Arc<StdMutex<Vec<String>>>) -> JoinHandle<()>
where
  R: AsyncRead + Unpin + Send + 'static,
{
  tokio::spawn(async move {
    let mut reader = BufReader::new(reader).lines();
    while let Ok(Some(line)) = reader.next_line().await {
      if let Ok(mut lines) = lines.lock() {
        lines.push(line);
      }
    }
  })
}

#[async_trait]
impl BuildExecutor for CommandExecutor {
  async fn submit(&self, spec: &BuildSpec) -> Result<ExecutionHandle, ExecutorError> {
    info!(job = %spec.job_id, image = %spec.target_image, "starting build command");

    let mut command = Command::new(&self.shell);
    command
      .arg("-c")
      .arg(&self.command)
      .env("LAMINA_CONTEXT", &spec.context.uri)
      .env("LAMINA_IMAGE", &spec.target_image)
      .env("LAMINA_CONTENT_HASH", spec.context.content_hash.as_str())
      .env("LAMINA_JOB_ID", &spec.job_id.0)
      .env("SOURCE_DATE_EPOCH", ARCHIVE_MTIME.to_string())
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .kill_on_drop(true);

    let mut child = command.spawn().map_err(|e| match e.kind() {
      std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
        ExecutorError::Permanent(format!("cannot spawn {}: {}", self.shell, e))
      }
      _ => ExecutorError::Transient(format!("cannot spawn {}: {}", self.shell, e)),
    })?;

    let lines = Arc::new(StdMutex::new(Vec::new()));
    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
      readers.push(collect_lines(stdout, lines.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
      readers.push(collect_lines(stderr, lines.clone()));
    }

    let handle = ExecutionHandle(format!("{}-{}", spec.job_id, child.id().unwrap_or_default()));
    debug!(handle = %handle, "build command spawned");

    self.runs.lock().await.insert(
      handle.clone(),
      RunningBuild {
        child,
        target_image: spec.target_image.clone(),
        lines,
        readers,
        aborted: false,
        finished: false,
      },
    );
    Ok(handle)
  }

  async fn poll(&self, handle: &ExecutionHandle) -> Result<ExecutionStatus, ExecutorError> {
    let mut runs = self.runs.lock().await;
    let run = runs
      .get_mut(handle)
      .ok_or_else(|| ExecutorError::UnknownHandle(handle.clone()))?;

    let exit = run
      .child
      .try_wait()
      .map_err(|e| ExecutorError::Transient(format!("cannot query build process: {}", e)))?;

    let status = match exit {
      None => return Ok(ExecutionStatus::Running),
      Some(_) if run.aborted => ExecutionStatus::Cancelled,
      Some(exit) if exit.success() => ExecutionStatus::Succeeded {
        image_reference: run.target_image.clone(),
      },
      Some(exit) => match exit.code() {
        Some(code @ (EX_TEMPFAIL | EX_UNAVAILABLE)) => ExecutionStatus::Failed {
          reason: format!("build command exited with code {} (temporary failure)", code),
          retryable: true,
        },
        Some(code) => ExecutionStatus::Failed {
          reason: format!("build command exited with code {}", code),
          retryable: false,
        },
        None => ExecutionStatus::Failed {
          reason: "build command terminated by signal".to_string(),
          retryable: false,
        },
      },
    };

    // Output still buffered in the pipes belongs to this status.
    run.finished = true;
    let readers = std::mem::take(&mut run.readers);
    drop(runs);
    if !readers.is_empty() {
      let drained = tokio::time::timeout(READER_DRAIN_TIMEOUT, async {
        for reader in readers {
          let _ = reader.await;
        }
      })
      .await;
      if drained.is_err() {
        warn!(handle = %handle, "build output still open after exit, some lines may be missing");
      }
    }
    Ok(status)
  }

  async fn abort(&self, handle: &ExecutionHandle) -> Result<bool, ExecutorError> {
    let mut runs = self.runs.lock().await;
    let run = runs
      .get_mut(handle)
      .ok_or_else(|| ExecutorError::UnknownHandle(handle.clone()))?;

    run.aborted = true;
    if let Err(e) = run.child.start_kill() {
      warn!(handle = %handle, error = %e, "failed to kill build command");
      return Err(ExecutorError::Transient(e.to_string()));
    }
    info!(handle = %handle, "build command killed");
    Ok(true)
  }

  async fn drain_logs(&self, handle: &ExecutionHandle) -> Vec<String> {
    let mut runs = self.runs.lock().await;
    let Some(run) = runs.get_mut(handle) else {
      return Vec::new();
    };

    let drained = match run.lines.lock() {
      Ok(mut lines) => std::mem::take(&mut *lines),
      Err(_) => Vec::new(),
    };

    // Killed commands are reaped by the runtime once the child is dropped.
    if run.finished || run.aborted {
      runs.remove(handle);
      debug!(handle = %handle, "build command released");
    }
    drained
  }
}
