//! Event deduplication by event id.
//!
//! [`IdempotencyGuard::admit`] decides whether an event is seen for the first
//! time. Records live for a fixed TTL; a background sweeper owned through a
//! [`SweeperHandle`] purges expired ones.
//!
//! The guard fails open: if the store cannot answer, the event is admitted
//! and a warning is logged. Processing an event twice is recoverable, dropping
//! it is not.
//!
//! Admission is only as atomic as the store. [`MemoryIdempotencyStore`] is
//! atomic within one process; replicas need a shared store.

mod store;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use store::*;

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
  First,
  Duplicate,
}

/// Deduplicates events by id for a bounded lifetime.
pub struct IdempotencyGuard {
  store: Arc<dyn IdempotencyStore>,
  ttl: TimeDelta,
}

impl IdempotencyGuard {
  pub fn new(store: Arc<dyn IdempotencyStore>, ttl: Duration) -> Self {
    let ttl = TimeDelta::from_std(ttl).unwrap_or(TimeDelta::days(1));
    Self { store, ttl }
  }

  /// Guard backed by a fresh [`MemoryIdempotencyStore`].
  pub fn in_memory(ttl: Duration) -> Self {
    Self::new(Arc::new(MemoryIdempotencyStore::new()), ttl)
  }

  /// Atomically record `event_id` if it has no live record.
  pub async fn admit(&self, event_id: &str) -> Admission {
    let now = Utc::now();
    let record = IdempotencyRecord {
      event_id: event_id.to_string(),
      processed_at: now,
      expires_at: now.checked_add_signed(self.ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
    };

    match self.store.insert_if_absent(record, now).await {
      Ok(InsertOutcome::Inserted) => {
        debug!(event = %event_id, "event admitted");
        Admission::First
      }
      Ok(InsertOutcome::Present) => {
        info!(event = %event_id, "duplicate event skipped");
        Admission::Duplicate
      }
      Err(e) => {
        warn!(event = %event_id, error = %e, "idempotency check failed, failing open");
        Admission::First
      }
    }
  }

  /// Forget `event_id` so a redelivery is admitted again.
  pub async fn release(&self, event_id: &str) {
    match self.store.remove(event_id).await {
      Ok(true) => debug!(event = %event_id, "idempotency record released"),
      Ok(false) => {}
      Err(e) => warn!(event = %event_id, error = %e, "failed to release idempotency record"),
    }
  }

  /// Whether `event_id` has a live record.
  pub async fn exists(&self, event_id: &str) -> bool {
    match self.store.get(event_id).await {
      Ok(Some(record)) => !record.is_expired(Utc::now()),
      Ok(None) => false,
      Err(e) => {
        warn!(event = %event_id, error = %e, "idempotency lookup failed");
        false
      }
    }
  }

  /// Purge expired records once.
  pub async fn sweep(&self) -> Result<usize, IdempotencyStoreError> {
    self.store.purge_expired(Utc::now()).await
  }

  /// Start the periodic sweeper.
  ///
  /// The sweeper runs until [`SweeperHandle::stop`] is awaited or the handle
  /// is dropped.
  pub fn start_sweeper(&self, interval: Duration) -> SweeperHandle {
    let store = self.store.clone();
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

    let task = tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      // The first tick completes immediately.
      ticker.tick().await;
      loop {
        tokio::select! {
          _ = &mut stop_rx => break,
          _ = ticker.tick() => {
            match store.purge_expired(Utc::now()).await {
              Ok(0) => {}
              Ok(purged) => debug!(purged, "expired idempotency records purged"),
              Err(e) => warn!(error = %e, "idempotency sweep failed, retrying next cycle"),
            }
          }
        }
      }
      debug!("idempotency sweeper stopped");
    });

    SweeperHandle {
      stop: Some(stop_tx),
      task: Some(task),
    }
  }
}

/// Owner of the background sweep task.
pub struct SweeperHandle {
  stop: Option<oneshot::Sender<()>>,
  task: Option<JoinHandle<()>>,
}

impl SweeperHandle {
  /// Signal the sweeper and wait for it to exit.
  pub async fn stop(mut self) {
    if let Some(stop) = self.stop.take() {
      let _ = stop.send(());
    }
    if let Some(task) = self.task.take() {
      let _ = task.await;
    }
  }

  pub fn is_running(&self) -> bool {
    self.task.as_ref().is_some_and(|t| !t.is_finished())
  }
}

impl Drop for SweeperHandle {
  fn drop(&mut self) {
    if let Some(task) = self.task.take() {
      task.abort();
    }
  }
}
