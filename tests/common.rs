//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tickwheel::job::{Job, JobAction, JobId};
use tickwheel::store::{JobStore, MemoryJobStore};
use tickwheel::{StoreError, TickWheel};
use tokio::sync::Notify;

/// Initializes tracing for tests, respecting `RUST_LOG`. Safe to call from
/// every test; only the first call installs the subscriber.
pub fn setup_tracing() {
  use std::sync::Once;
  static INIT: Once = Once::new();
  INIT.call_once(|| {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
      .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
      .with_env_filter(filter)
      .with_test_writer()
      .init();
  });
}

/// Builds an engine on a fresh in-memory store.
pub fn build_engine(max_workers: usize) -> (Arc<TickWheel>, Arc<MemoryJobStore>) {
  setup_tracing();
  let store = Arc::new(MemoryJobStore::new());
  let engine = TickWheel::builder()
    .max_workers(max_workers)
    .store(store.clone())
    .build()
    .expect("engine should build");
  (Arc::new(engine), store)
}

/// An action that increments a counter and succeeds.
pub fn counting_action(counter: Arc<AtomicUsize>) -> JobAction {
  JobAction::func(move || {
    let counter = counter.clone();
    Box::pin(async move {
      counter.fetch_add(1, Ordering::SeqCst);
      Ok(())
    })
  })
}

/// An action that fails its first `failures` invocations, then succeeds.
/// Every invocation increments `attempts`.
pub fn flaky_action(attempts: Arc<AtomicUsize>, failures: usize) -> JobAction {
  JobAction::func(move || {
    let attempts = attempts.clone();
    Box::pin(async move {
      let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
      if attempt <= failures {
        Err(format!("induced failure on attempt {attempt}"))
      } else {
        Ok(())
      }
    })
  })
}

/// An action that signals `started`, then blocks until `release` is
/// notified, then sets `finished`.
pub fn blocking_action(
  started: Arc<Notify>,
  release: Arc<Notify>,
  finished: Arc<AtomicBool>,
) -> JobAction {
  JobAction::func(move || {
    let started = started.clone();
    let release = release.clone();
    let finished = finished.clone();
    Box::pin(async move {
      started.notify_one();
      release.notified().await;
      finished.store(true, Ordering::SeqCst);
      Ok(())
    })
  })
}

/// Polls `cond` until it returns true or `deadline` elapses.
pub async fn wait_until<F>(deadline: Duration, mut cond: F) -> bool
where
  F: FnMut() -> bool,
{
  let start = tokio::time::Instant::now();
  while start.elapsed() < deadline {
    if cond() {
      return true;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
  }
  cond()
}

/// Async variant of [`wait_until`] for conditions that need to query the
/// engine.
pub async fn wait_until_async<F, Fut>(deadline: Duration, mut cond: F) -> bool
where
  F: FnMut() -> Fut,
  Fut: std::future::Future<Output = bool>,
{
  let start = tokio::time::Instant::now();
  while start.elapsed() < deadline {
    if cond().await {
      return true;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
  }
  cond().await
}

/// A store that rejects every write, for outage testing. Reads delegate to
/// an inner in-memory store.
#[derive(Default)]
pub struct DownStore {
  inner: MemoryJobStore,
}

#[async_trait]
impl JobStore for DownStore {
  async fn load(&self, id: JobId) -> Result<Option<Job>, StoreError> {
    self.inner.load(id).await
  }

  async fn list(&self) -> Result<Vec<Job>, StoreError> {
    self.inner.list().await
  }

  async fn save(&self, _job: &Job) -> Result<(), StoreError> {
    Err(StoreError::Unavailable("induced outage".into()))
  }

  async fn delete(&self, id: JobId) -> Result<(), StoreError> {
    self.inner.delete(id).await
  }
}

/// A store whose saves block until `release` is notified, for backpressure
/// testing. Reads delegate to an inner in-memory store.
pub struct StallingStore {
  inner: MemoryJobStore,
  release: Arc<Notify>,
  stalled: AtomicBool,
}

impl StallingStore {
  pub fn new(release: Arc<Notify>) -> Self {
    Self {
      inner: MemoryJobStore::new(),
      release,
      stalled: AtomicBool::new(false),
    }
  }
}

#[async_trait]
impl JobStore for StallingStore {
  async fn load(&self, id: JobId) -> Result<Option<Job>, StoreError> {
    self.inner.load(id).await
  }

  async fn list(&self) -> Result<Vec<Job>, StoreError> {
    self.inner.list().await
  }

  async fn save(&self, job: &Job) -> Result<(), StoreError> {
    // Only the first save stalls; later writes go straight through.
    if !self.stalled.swap(true, Ordering::SeqCst) {
      self.release.notified().await;
    }
    self.inner.save(job).await
  }

  async fn delete(&self, id: JobId) -> Result<(), StoreError> {
    self.inner.delete(id).await
  }
}
