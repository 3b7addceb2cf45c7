//! Failure handling: backoff retries, terminal exhaustion, reset, timeouts.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::*;
use tickwheel::{JobAction, JobRequest, JobState, QueryError, RunOutcome};

#[tokio::test]
async fn retryable_failure_backs_off_then_succeeds() {
  let (engine, _store) = build_engine(1);

  let attempts = Arc::new(AtomicUsize::new(0));
  let job_id = engine
    .submit(
      JobRequest::new("flaky", "0 0 * * *")
        .first_run_at(Utc::now())
        .max_retries(3),
      flaky_action(attempts.clone(), 1),
    )
    .await
    .unwrap();

  // First attempt fails immediately.
  assert!(wait_until(Duration::from_secs(2), || attempts.load(Ordering::SeqCst) >= 1).await);

  // The retry lands after the first backoff step (2s), not immediately.
  tokio::time::sleep(Duration::from_millis(500)).await;
  assert_eq!(attempts.load(Ordering::SeqCst), 1, "retry must wait out the backoff");
  let details = engine.get_job(job_id).await.unwrap();
  assert_eq!(details.consecutive_failures, 1);
  assert!(matches!(details.last_result, Some(RunOutcome::Failed(_))));

  assert!(
    wait_until(Duration::from_secs(5), || attempts.load(Ordering::SeqCst) >= 2).await,
    "retry never fired"
  );

  let recovered = wait_until_async(Duration::from_secs(2), || async {
    let details = engine.get_job(job_id).await.unwrap();
    details.last_result == Some(RunOutcome::Succeeded) && details.consecutive_failures == 0
  })
  .await;
  assert!(recovered, "success should clear the failure streak");

  let metrics = engine.metrics_snapshot().await.unwrap();
  assert!(metrics.jobs_retried >= 1);
  assert_eq!(metrics.jobs_failed_terminal, 0);

  engine.shutdown_graceful(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn exhausted_retry_budget_goes_terminal_until_reset() {
  let (engine, _store) = build_engine(1);

  let attempts = Arc::new(AtomicUsize::new(0));
  // Always fails; budget of 1 means two attempts total.
  let job_id = engine
    .submit(
      JobRequest::new("hopeless", "0 0 * * *")
        .first_run_at(Utc::now())
        .max_retries(1),
      flaky_action(attempts.clone(), usize::MAX),
    )
    .await
    .unwrap();

  let terminal = wait_until_async(Duration::from_secs(8), || async {
    engine.get_job(job_id).await.unwrap().state == JobState::FailedTerminal
  })
  .await;
  assert!(terminal, "job should park terminally after exhausting retries");

  assert_eq!(attempts.load(Ordering::SeqCst), 2);
  let details = engine.get_job(job_id).await.unwrap();
  assert_eq!(details.next_run, None, "terminal jobs leave the due set");
  assert_eq!(details.consecutive_failures, 2);

  // Only an explicit reset brings it back.
  engine.reset(job_id).await.unwrap();
  let details = engine.get_job(job_id).await.unwrap();
  assert_eq!(details.state, JobState::Scheduled);
  assert_eq!(details.consecutive_failures, 0);
  assert!(details.next_run.is_some());

  // Resetting a non-terminal job is rejected.
  assert!(matches!(
    engine.reset(job_id).await.unwrap_err(),
    QueryError::InvalidTransition { .. }
  ));

  let metrics = engine.metrics_snapshot().await.unwrap();
  assert_eq!(metrics.jobs_failed_terminal, 1);
  assert_eq!(metrics.runs_failed, 2);

  engine.shutdown_graceful(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn overrunning_execution_times_out_and_counts_as_failure() {
  let (engine, _store) = build_engine(1);

  let action = JobAction::func(|| {
    Box::pin(async {
      tokio::time::sleep(Duration::from_secs(60)).await;
      Ok(())
    })
  });

  // Budget of zero: the first failure is already terminal.
  let job_id = engine
    .submit(
      JobRequest::new("sleeper", "0 0 * * *")
        .first_run_at(Utc::now())
        .timeout(Duration::from_millis(200))
        .max_retries(0),
      action,
    )
    .await
    .unwrap();

  let terminal = wait_until_async(Duration::from_secs(3), || async {
    engine.get_job(job_id).await.unwrap().state == JobState::FailedTerminal
  })
  .await;
  assert!(terminal);

  let details = engine.get_job(job_id).await.unwrap();
  assert_eq!(details.last_result, Some(RunOutcome::TimedOut));

  let metrics = engine.metrics_snapshot().await.unwrap();
  assert_eq!(metrics.runs_timed_out, 1);

  engine.shutdown_graceful(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn timed_out_action_is_stopped_before_the_retry_starts() {
  let (engine, _store) = build_engine(2);

  // Decrements on drop, so an aborted task releases its slot too.
  struct InFlightGuard(Arc<AtomicUsize>);
  impl Drop for InFlightGuard {
    fn drop(&mut self) {
      self.0.fetch_sub(1, Ordering::SeqCst);
    }
  }

  let in_flight = Arc::new(AtomicUsize::new(0));
  let peak = Arc::new(AtomicUsize::new(0));
  let in_flight_action = in_flight.clone();
  let peak_action = peak.clone();
  let action = JobAction::func(move || {
    let in_flight = in_flight_action.clone();
    let peak = peak_action.clone();
    Box::pin(async move {
      let current = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
      peak.fetch_max(current, Ordering::SeqCst);
      let _guard = InFlightGuard(in_flight);
      tokio::time::sleep(Duration::from_secs(60)).await;
      Ok(())
    })
  });

  // Overruns every attempt; backoff retries follow each timeout. If the
  // timed-out task were left running, the retry would overlap it.
  let job_id = engine
    .submit(
      JobRequest::new("overrunner", "0 0 * * *")
        .first_run_at(Utc::now())
        .timeout(Duration::from_millis(100))
        .max_retries(5),
      action,
    )
    .await
    .unwrap();

  let retried = wait_until_async(Duration::from_secs(8), || async {
    engine.metrics_snapshot().await.unwrap().runs_timed_out >= 2
  })
  .await;
  assert!(retried, "expected at least one retry after a timeout");

  assert_eq!(
    peak.load(Ordering::SeqCst),
    1,
    "a timed-out run must be stopped before its retry executes"
  );

  let details = engine.get_job(job_id).await.unwrap();
  assert_eq!(details.last_result, Some(RunOutcome::TimedOut));

  engine.shutdown_graceful(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn panicking_action_is_contained_as_a_failure() {
  let (engine, _store) = build_engine(1);

  let action = JobAction::func(|| {
    Box::pin(async {
      if std::hint::black_box(true) {
        panic!("boom");
      }
      Ok(())
    })
  });

  let job_id = engine
    .submit(
      JobRequest::new("panicker", "0 0 * * *")
        .first_run_at(Utc::now())
        .max_retries(0),
      action,
    )
    .await
    .unwrap();

  let terminal = wait_until_async(Duration::from_secs(3), || async {
    engine.get_job(job_id).await.unwrap().state == JobState::FailedTerminal
  })
  .await;
  assert!(terminal, "a panic should fail the run, not the worker");

  let details = engine.get_job(job_id).await.unwrap();
  match details.last_result {
    Some(RunOutcome::Failed(ref detail)) => assert!(detail.contains("panicked")),
    other => panic!("expected a failed outcome, got {other:?}"),
  }

  // The worker pool survived: another job still runs.
  let counter = Arc::new(AtomicUsize::new(0));
  engine
    .submit(
      JobRequest::new("survivor", "* * * * *").first_run_at(Utc::now()),
      counting_action(counter.clone()),
    )
    .await
    .unwrap();
  assert!(wait_until(Duration::from_secs(2), || counter.load(Ordering::SeqCst) >= 1).await);

  engine.shutdown_graceful(Duration::from_secs(5)).await.unwrap();
}
