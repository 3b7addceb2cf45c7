//! The durable job store boundary.
//!
//! Persistence is an external collaborator: the engine only consumes this
//! trait and treats every call as potentially slow and fallible. A store
//! outage must never crash the dispatcher or an executor; writes go through
//! [`save_with_retry`], and on ultimate failure the in-memory state remains
//! the source of truth until the store recovers.

use crate::error::StoreError;
use crate::job::{Job, JobId};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::warn;

/// Persistence attempts per write before giving up and logging.
const SAVE_ATTEMPTS: u32 = 3;
/// Base delay between persistence attempts; doubles per attempt.
const SAVE_RETRY_BASE: Duration = Duration::from_millis(50);

/// Durable record of job definitions and their run state.
#[async_trait]
pub trait JobStore: Send + Sync {
  /// Loads a single job, `Ok(None)` when unknown.
  async fn load(&self, id: JobId) -> Result<Option<Job>, StoreError>;

  /// Loads all persisted jobs.
  async fn list(&self) -> Result<Vec<Job>, StoreError>;

  /// Creates or replaces a job record.
  async fn save(&self, job: &Job) -> Result<(), StoreError>;

  /// Deletes a job record. Deleting an unknown id is not an error.
  async fn delete(&self, id: JobId) -> Result<(), StoreError>;
}

/// In-memory store. The default collaborator for tests and embedded use.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
  jobs: RwLock<HashMap<JobId, Job>>,
}

impl MemoryJobStore {
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl JobStore for MemoryJobStore {
  async fn load(&self, id: JobId) -> Result<Option<Job>, StoreError> {
    Ok(self.jobs.read().await.get(&id).cloned())
  }

  async fn list(&self) -> Result<Vec<Job>, StoreError> {
    Ok(self.jobs.read().await.values().cloned().collect())
  }

  async fn save(&self, job: &Job) -> Result<(), StoreError> {
    self.jobs.write().await.insert(job.id, job.clone());
    Ok(())
  }

  async fn delete(&self, id: JobId) -> Result<(), StoreError> {
    self.jobs.write().await.remove(&id);
    Ok(())
  }
}

/// Writes `job` to the store, retrying transient failures with exponential
/// backoff. Returns whether the write ultimately landed; a `false` is logged
/// and the caller carries on with the in-memory state as fallback truth.
pub(crate) async fn save_with_retry(store: &Arc<dyn JobStore>, job: &Job) -> bool {
  let mut delay = SAVE_RETRY_BASE;
  for attempt in 1..=SAVE_ATTEMPTS {
    match store.save(job).await {
      Ok(()) => return true,
      Err(StoreError::Unavailable(reason)) => {
        warn!(
          job_id = %job.id,
          attempt,
          %reason,
          "Job store write failed."
        );
        if attempt < SAVE_ATTEMPTS {
          tokio::time::sleep(delay).await;
          delay *= 2;
        }
      }
    }
  }
  warn!(
    job_id = %job.id,
    attempts = SAVE_ATTEMPTS,
    "Job store write abandoned; in-memory state remains authoritative until the store recovers."
  );
  false
}
