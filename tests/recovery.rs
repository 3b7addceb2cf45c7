//! Startup recovery from the store, and store-outage resilience.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::*;
use tickwheel::job::Job;
use tickwheel::store::{JobStore, MemoryJobStore};
use tickwheel::{JobState, JobRequest, RunOutcome, TickWheel};

fn stored_job(name: &str, state: JobState, enabled: bool) -> Job {
  let now = Utc::now();
  Job {
    id: uuid::Uuid::new_v4(),
    name: name.to_owned(),
    schedule: "0 0 * * *".to_owned(),
    state,
    enabled,
    last_run: None,
    next_run: None,
    last_result: None,
    consecutive_failures: 0,
    max_retries: 3,
    timeout: Duration::from_secs(30),
    created_at: now,
    updated_at: now,
  }
}

#[tokio::test]
async fn recover_restages_stored_jobs() {
  setup_tracing();
  let store = Arc::new(MemoryJobStore::new());

  // A live job whose stored fire time has already passed.
  let mut overdue = stored_job("overdue", JobState::Scheduled, true);
  overdue.next_run = Some(Utc::now() - chrono::Duration::minutes(5));
  // A job that was mid-run when the process died.
  let crashed = stored_job("crashed", JobState::Running, true);
  // A disabled job stays parked.
  let parked = stored_job("parked", JobState::Disabled, false);
  // A job the resolver no longer knows.
  let orphan = stored_job("orphan", JobState::Scheduled, true);

  for job in [&overdue, &crashed, &parked, &orphan] {
    store.save(job).await.unwrap();
  }

  let engine = TickWheel::builder()
    .max_workers(2)
    .store(store.clone())
    .build()
    .unwrap();

  let counter = Arc::new(AtomicUsize::new(0));
  let counter_for_resolver = counter.clone();
  let recovered = engine
    .recover(move |job| match job.name.as_str() {
      "orphan" => None,
      _ => Some(counting_action(counter_for_resolver.clone())),
    })
    .await
    .unwrap();
  assert_eq!(recovered, 3);

  // Past and missing fire times both mean "run as soon as possible".
  assert!(
    wait_until(Duration::from_secs(3), || counter.load(Ordering::SeqCst) >= 2).await,
    "overdue and crashed jobs should run promptly after recovery"
  );

  let listed = engine.list_jobs().await.unwrap();
  assert_eq!(listed.len(), 3);
  let parked_details = engine.get_job(parked.id).await.unwrap();
  assert_eq!(parked_details.state, JobState::Disabled);
  assert_eq!(parked_details.next_run, None);

  let crashed_details = engine.get_job(crashed.id).await.unwrap();
  assert_ne!(crashed_details.state, JobState::Running);

  engine.shutdown_graceful(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn store_outage_does_not_stop_the_engine() {
  setup_tracing();
  let store = Arc::new(DownStore::default());
  let engine = TickWheel::builder()
    .max_workers(1)
    .store(store)
    .build()
    .unwrap();

  let counter = Arc::new(AtomicUsize::new(0));
  let job_id = engine
    .submit(
      JobRequest::new("unsaved", "* * * * *").first_run_at(Utc::now()),
      counting_action(counter.clone()),
    )
    .await
    .unwrap();

  // Every write fails with retries exhausted, yet the job runs and the
  // in-memory record stays authoritative.
  assert!(
    wait_until(Duration::from_secs(5), || counter.load(Ordering::SeqCst) >= 1).await,
    "job should execute despite the store outage"
  );

  let settled = wait_until_async(Duration::from_secs(5), || async {
    let details = engine.get_job(job_id).await.unwrap();
    details.state == JobState::Scheduled && details.last_result == Some(RunOutcome::Succeeded)
  })
  .await;
  assert!(settled, "in-memory lifecycle should progress normally");

  let metrics = engine.metrics_snapshot().await.unwrap();
  assert!(metrics.store_writes_abandoned >= 1);
  assert!(metrics.runs_succeeded >= 1);

  engine.shutdown_graceful(Duration::from_secs(10)).await.unwrap();
}
