//! Record storage for the idempotency guard.
//!
//! The store is the unit of atomicity: `insert_if_absent` must be a single
//! compare-and-insert, never a read followed by a write. The in-memory store
//! gives that guarantee within one process; a shared key-value store with
//! conditional writes gives it across replicas.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// One admitted event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyRecord {
  pub event_id: String,
  pub processed_at: DateTime<Utc>,
  pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
  pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
    now >= self.expires_at
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
  /// No live record existed; this record is now stored.
  Inserted,
  /// A live record already exists; nothing was changed.
  Present,
}

#[derive(Debug, Error)]
pub enum IdempotencyStoreError {
  #[error("idempotency store unavailable: {0}")]
  Unavailable(String),

  #[error("idempotency store lock poisoned")]
  Poisoned,
}

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
  /// Insert `record` unless a live record for the same event exists.
  ///
  /// An expired record counts as absent and is replaced.
  async fn insert_if_absent(
    &self,
    record: IdempotencyRecord,
    now: DateTime<Utc>,
  ) -> Result<InsertOutcome, IdempotencyStoreError>;

  /// Returns whether a record was removed.
  async fn remove(&self, event_id: &str) -> Result<bool, IdempotencyStoreError>;

  async fn get(&self, event_id: &str) -> Result<Option<IdempotencyRecord>, IdempotencyStoreError>;

  /// Remove every record expired at `now`. Returns how many were removed.
  async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, IdempotencyStoreError>;
}

/// Process-local store guarded by a mutex.
#[derive(Debug, Default)]
pub struct MemoryIdempotencyStore {
  records: Mutex<HashMap<String, IdempotencyRecord>>,
}

impl MemoryIdempotencyStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn len(&self) -> usize {
    self.records.lock().map(|r| r.len()).unwrap_or(0)
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

#[async_trait]
impl IdempotencyStore for MemoryIdempotencyStore {
  async fn insert_if_absent(
    &self,
    record: IdempotencyRecord,
    now: DateTime<Utc>,
  ) -> Result<InsertOutcome, IdempotencyStoreError> {
    let mut records = self.records.lock().map_err(|_| IdempotencyStoreError::Poisoned)?;
    if let Some(existing) = records.get(&record.event_id)
      && !existing.is_expired(now)
    {
      return Ok(InsertOutcome::Present);
    }
    records.insert(record.event_id.clone(), record);
    Ok(InsertOutcome::Inserted)
  }

  async fn remove(&self, event_id: &str) -> Result<bool, IdempotencyStoreError> {
    let mut records = self.records.lock().map_err(|_| IdempotencyStoreError::Poisoned)?;
    Ok(records.remove(event_id).is_some())
  }

  async fn get(&self, event_id: &str) -> Result<Option<IdempotencyRecord>, IdempotencyStoreError> {
    let records = self.records.lock().map_err(|_| IdempotencyStoreError::Poisoned)?;
    Ok(records.get(event_id).cloned())
  }

  async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, IdempotencyStoreError> {
    let mut records = self.records.lock().map_err(|_| IdempotencyStoreError::Poisoned)?;
    let before = records.len();
    records.retain(|_, record| !record.is_expired(now));
    Ok(before - records.len())
  }
}
