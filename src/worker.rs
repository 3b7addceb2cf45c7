use crate::command::{Dispatch, RunReport, ShutdownMode};
use crate::job::{retry_backoff, JobAction, JobDefinition, JobId, JobState, RunOutcome, WorkerId};
use crate::metrics::EngineMetrics;
use crate::store::{save_with_retry, JobStore};

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, error, info, instrument, trace, warn, Instrument};

/// A worker task that executes dispatched jobs.
///
/// All workers share one MPMC dispatch channel, so any idle worker can pick
/// up the next due job. The worker owns the execution attempt end to end:
/// running the action under its timeout, persisting the run fields, and
/// reporting the retry decision back to the coordinator.
pub(crate) struct Worker {
  pub id: WorkerId,
  pub dispatch_rx: async_channel::Receiver<Dispatch>,
  pub report_tx: mpsc::Sender<RunReport>,
  pub shutdown_rx: watch::Receiver<Option<ShutdownMode>>,
  pub definitions: Arc<RwLock<HashMap<JobId, JobDefinition>>>,
  pub store: Arc<dyn JobStore>,
  pub metrics: EngineMetrics,
  pub active_workers: Arc<AtomicUsize>,
}

impl Worker {
  /// Runs the worker loop until shutdown or dispatch-channel closure.
  #[instrument(skip(self), fields(worker_id = self.id))]
  pub async fn run(&mut self) {
    info!("Worker started.");

    loop {
      tokio::select! {
          biased;

          Ok(()) = self.shutdown_rx.changed() => {
              match *self.shutdown_rx.borrow() {
                  Some(ShutdownMode::Force) => {
                      info!("Worker received force shutdown signal.");
                      break;
                  }
                  // Graceful: keep draining already-dispatched work.
                  // The coordinator closes the channel when it exits.
                  Some(ShutdownMode::Graceful) | None => {}
              }
          },

          dispatch = self.dispatch_rx.recv() => {
              match dispatch {
                  Ok((job_id, fire_time)) => {
                      self.handle_dispatch(job_id, fire_time).await;
                      let prev = self.active_workers.fetch_sub(1, AtomicOrdering::Relaxed);
                      self.metrics.workers_active_current.store(
                          prev.saturating_sub(1),
                          AtomicOrdering::Relaxed,
                      );
                  }
                  Err(_) => {
                      info!("Dispatch channel closed. Worker exiting.");
                      break;
                  }
              }
          }
      }
    }

    info!("Worker finished.");
  }

  /// Executes one dispatched job and reports what should happen next.
  async fn handle_dispatch(&self, job_id: JobId, fire_time: DateTime<Utc>) {
    let span = tracing::info_span!("job_run", %job_id);
    self.execute(job_id, fire_time).instrument(span).await;
  }

  async fn execute(&self, job_id: JobId, fire_time: DateTime<Utc>) {
    // Snapshot timeout and action; the definition can change while we run.
    let (action, timeout, job_name) = {
      let definitions = self.definitions.read().await;
      match definitions.get(&job_id) {
        Some(def) => (
          Arc::clone(&def.action),
          def.job.timeout,
          def.job.name.clone(),
        ),
        None => {
          warn!("Dispatched job no longer exists, discarding run.");
          self.send_report(RunReport::Discarded { job_id }).await;
          return;
        }
      }
    };

    let queue_wait = Utc::now().signed_duration_since(fire_time);
    debug!(job_name = %job_name, queue_wait_ms = queue_wait.num_milliseconds(), "Executing job.");

    let started_at = Utc::now();
    let outcome = run_action(action, timeout).await;
    let finished_at = Utc::now();

    let elapsed = (finished_at - started_at)
      .to_std()
      .unwrap_or(Duration::ZERO);
    self.metrics.job_execution_duration.record(elapsed);
    match &outcome {
      RunOutcome::Succeeded => {
        self
          .metrics
          .runs_succeeded
          .fetch_add(1, AtomicOrdering::Relaxed);
        debug!(elapsed_ms = elapsed.as_millis() as u64, "Job run succeeded.");
      }
      RunOutcome::TimedOut => {
        self
          .metrics
          .runs_timed_out
          .fetch_add(1, AtomicOrdering::Relaxed);
        warn!(timeout_ms = timeout.as_millis() as u64, "Job run timed out.");
      }
      RunOutcome::Failed(detail) => {
        self
          .metrics
          .runs_failed
          .fetch_add(1, AtomicOrdering::Relaxed);
        warn!(%detail, "Job run failed.");
      }
      RunOutcome::Cancelled => {
        self
          .metrics
          .runs_failed
          .fetch_add(1, AtomicOrdering::Relaxed);
        warn!("Job run task was cancelled.");
      }
    }

    // Re-read the definition after the run: disable, cancel, and schedule
    // updates issued mid-run must shape what happens next.
    let (job_snapshot, report) = {
      let mut definitions = self.definitions.write().await;
      match definitions.get_mut(&job_id) {
        None => {
          debug!("Job removed while running, discarding outcome.");
          (None, RunReport::Discarded { job_id })
        }
        Some(def) => {
          def.job.last_run = Some(started_at);
          def.job.last_result = Some(outcome.clone());
          def.job.consecutive_failures = if outcome.is_success() {
            0
          } else {
            def.job.consecutive_failures.saturating_add(1)
          };
          def.job.updated_at = finished_at;

          let report = if !def.job.enabled || def.job.state == JobState::Disabled {
            debug!("Job disabled while running, discarding reschedule.");
            RunReport::Discarded { job_id }
          } else if outcome.is_success() {
            match def.expr.next_fire_time(finished_at) {
              Ok(next_run) => RunReport::Reschedule { job_id, next_run },
              Err(e) => {
                // A schedule that stops matching (leap-day jobs past their
                // horizon) parks the job; reset restores it.
                error!(error = %e, "No reachable fire time after success, going terminal.");
                RunReport::FailedTerminal { job_id }
              }
            }
          } else {
            let failures = def.job.consecutive_failures;
            if failures <= def.job.max_retries {
              let backoff = retry_backoff(failures);
              let next_run = finished_at
                + chrono::Duration::from_std(backoff).unwrap_or(chrono::Duration::seconds(300));
              self
                .metrics
                .jobs_retried
                .fetch_add(1, AtomicOrdering::Relaxed);
              info!(
                attempt = failures,
                max_retries = def.job.max_retries,
                backoff_secs = backoff.as_secs(),
                "Scheduling retry."
              );
              RunReport::Reschedule { job_id, next_run }
            } else {
              RunReport::FailedTerminal { job_id }
            }
          };

          (Some(def.job.clone()), report)
        }
      }
    };

    // Persist the run fields before reporting, so a crash between the two
    // loses at most the lifecycle transition, not the outcome.
    if let Some(job) = job_snapshot {
      if !save_with_retry(&self.store, &job).await {
        self
          .metrics
          .store_writes_abandoned
          .fetch_add(1, AtomicOrdering::Relaxed);
      }
    }

    self.send_report(report).await;
  }

  async fn send_report(&self, report: RunReport) {
    if self.report_tx.send(report).await.is_err() {
      trace!("Coordinator gone, dropping run report.");
    }
  }
}

/// Runs an action under its timeout, on its own task so panics surface as
/// failures instead of tearing down the worker.
async fn run_action(action: Arc<JobAction>, timeout: Duration) -> RunOutcome {
  let mut handle = tokio::spawn(async move {
    match &*action {
      JobAction::Shell { program, args } => run_shell(program, args).await,
      JobAction::Func(exec_fn) => exec_fn().await,
    }
  });

  match tokio::time::timeout(timeout, &mut handle).await {
    Err(_elapsed) => {
      // The deadline only cancels the join. The task itself must be stopped
      // too, or a backoff retry would overlap the still-running action.
      handle.abort();
      RunOutcome::TimedOut
    }
    Ok(Err(join_err)) => {
      if join_err.is_panic() {
        RunOutcome::Failed(format!("action panicked: {join_err}"))
      } else {
        RunOutcome::Cancelled
      }
    }
    Ok(Ok(Ok(()))) => RunOutcome::Succeeded,
    Ok(Ok(Err(detail))) => RunOutcome::Failed(detail),
  }
}

/// Spawns an external command and maps its exit status to an outcome.
async fn run_shell(program: &str, args: &[String]) -> Result<(), String> {
  let output = tokio::process::Command::new(program)
    .args(args)
    .stdin(Stdio::null())
    .output()
    .await
    .map_err(|e| format!("failed to spawn {program}: {e}"))?;

  if output.status.success() {
    Ok(())
  } else {
    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(format!(
      "{program} exited with {}: {}",
      output.status,
      stderr.trim()
    ))
  }
}
