use crate::command::{Dispatch, EngineCommand, RunReport, ShutdownMode};
use crate::due_set::DueSet;
use crate::error::QueryError;
use crate::job::{Job, JobDefinition, JobId, JobState};
use crate::metrics::EngineMetrics;
use crate::store::{save_with_retry, JobStore};

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::sleep;
use tracing::{debug, error, info, trace, warn};

/// Sleep used while draining a graceful shutdown, so the active-worker count
/// is re-checked promptly.
const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

/// Internal state shared and managed by the coordinator task.
pub(crate) struct CoordinatorState {
  // Receivers
  pub staging_rx: mpsc::Receiver<JobDefinition>,
  pub cmd_rx: mpsc::Receiver<EngineCommand>,
  pub shutdown_rx: watch::Receiver<Option<ShutdownMode>>,
  pub report_rx: mpsc::Receiver<RunReport>,
  // Sender
  pub dispatch_tx: async_channel::Sender<Dispatch>,
  // Shared data structures
  pub definitions: Arc<RwLock<HashMap<JobId, JobDefinition>>>,
  pub store: Arc<dyn JobStore>,
  // Metrics & counters
  pub metrics: EngineMetrics,
  pub active_workers: Arc<AtomicUsize>,
  pub max_workers: usize,
  /// Upper bound on the dispatcher's idle wait; a liveness backstop, not a
  /// correctness-critical timeout.
  pub max_poll_interval: Duration,
}

/// The central coordinator task.
///
/// Owns the due-set index outright: every insert/remove/pop is funneled
/// through this task's message loop, which is what serializes API-driven
/// mutations against the dispatch path.
pub(crate) struct Coordinator {
  state: CoordinatorState,
  due: DueSet,
  shutting_down: Option<ShutdownMode>,
  cmd_closed: bool,
  reports_closed: bool,
}

impl Coordinator {
  pub fn new(state: CoordinatorState) -> Self {
    Self {
      state,
      due: DueSet::new(),
      shutting_down: None,
      cmd_closed: false,
      reports_closed: false,
    }
  }

  /// Runs the main event loop: idle-wait, wake, drain-due, repeat.
  pub async fn run(&mut self) {
    info!("Coordinator started.");

    loop {
      self
        .state
        .metrics
        .due_set_size
        .store(self.due.len(), AtomicOrdering::Relaxed);

      let sleep_duration = self.next_sleep();

      tokio::select! {
          biased; // Prioritize the shutdown signal.

          Ok(()) = self.state.shutdown_rx.changed() => {
              let mode = *self.state.shutdown_rx.borrow();
              if mode != self.shutting_down {
                  if let Some(mode_val) = mode {
                      self.shutting_down = Some(mode_val);
                      info!(mode = ?mode_val, "Coordinator received shutdown signal.");
                      self.state.staging_rx.close();
                      if mode_val == ShutdownMode::Force {
                          break;
                      }
                  }
              }
          },

          maybe_def = self.state.staging_rx.recv(), if self.shutting_down.is_none() => {
              match maybe_def {
                  Some(def) => self.handle_new_job(def).await,
                  None => {
                      // Handle dropped without a shutdown call.
                      warn!("Staging channel closed. Initiating graceful shutdown.");
                      self.shutting_down = Some(ShutdownMode::Graceful);
                  }
              }
          },

          // Commands are served even during a graceful drain.
          maybe_cmd = self.state.cmd_rx.recv(), if !self.cmd_closed => {
              match maybe_cmd {
                  Some(cmd) => self.handle_command(cmd).await,
                  None => {
                      self.cmd_closed = true;
                      if self.shutting_down.is_none() {
                          warn!("Command channel closed unexpectedly. Initiating graceful shutdown.");
                          self.shutting_down = Some(ShutdownMode::Graceful);
                          self.state.staging_rx.close();
                      }
                  }
              }
          },

          maybe_report = self.state.report_rx.recv(), if !self.reports_closed => {
              match maybe_report {
                  Some(report) => {
                      trace!(?report, "Received run report.");
                      self.handle_report(report).await;
                  }
                  None => {
                      warn!("Report channel closed; all workers have exited.");
                      self.reports_closed = true;
                  }
              }
          },

          _ = sleep(sleep_duration) => {
              if self.shutting_down.is_none() {
                  self.dispatch_due().await;
              }
          }
      }

      if self.shutting_down == Some(ShutdownMode::Graceful) {
        let active = self.state.active_workers.load(AtomicOrdering::Relaxed);
        if active == 0 {
          info!("Graceful shutdown: all workers idle. Coordinator exiting.");
          break;
        }
        trace!(active_workers = active, "Graceful shutdown: waiting for in-flight jobs.");
      }
    }

    info!("Coordinator task shutting down.");
    // Signals idle workers that no more dispatches are coming.
    self.state.dispatch_tx.close();
  }

  /// Sizes the idle wait: time to the earliest due entry, bounded above by
  /// the poll interval. Channel activity always interrupts the wait, so a
  /// newly inserted earlier fire time shortens it rather than queueing.
  fn next_sleep(&self) -> Duration {
    if self.shutting_down.is_some() {
      return SHUTDOWN_POLL;
    }
    let active = self.state.active_workers.load(AtomicOrdering::Relaxed);
    if active >= self.state.max_workers {
      // No capacity; a worker's report wakes the loop.
      return self.state.max_poll_interval;
    }
    match self.due.peek_earliest() {
      None => self.state.max_poll_interval,
      Some(earliest) => {
        let now = Utc::now();
        if earliest <= now {
          Duration::ZERO
        } else {
          (earliest - now)
            .to_std()
            .map(|d| d.min(self.state.max_poll_interval))
            .unwrap_or(Duration::ZERO)
        }
      }
    }
  }

  async fn persist(&self, job: &Job) {
    if !save_with_retry(&self.state.store, job).await {
      self
        .state
        .metrics
        .store_writes_abandoned
        .fetch_add(1, AtomicOrdering::Relaxed);
    }
  }

  /// Registers a job received from the staging channel (submission or
  /// startup recovery) and gives it a due entry when it is live.
  async fn handle_new_job(&mut self, def: JobDefinition) {
    self
      .state
      .metrics
      .jobs_submitted
      .fetch_add(1, AtomicOrdering::Relaxed);
    let job_id = def.job.id;
    debug!(
        job_name = %def.job.name,
        %job_id,
        next_run = ?def.job.next_run,
        "Processing job from staging."
    );

    self.persist(&def.job).await;

    if def.job.enabled && def.job.state == JobState::Scheduled {
      match def.job.next_run {
        Some(next_run) => self.due.insert(job_id, next_run),
        None => warn!(%job_id, "Scheduled job arrived without a fire time, leaving it out of the due set."),
      }
    }

    self.state.definitions.write().await.insert(job_id, def);
  }

  /// Drains due entries and hands them to workers, ascending by
  /// `(fire_time, job_id)`. Entries beyond the worker capacity stay queued.
  async fn dispatch_due(&mut self) {
    let now = Utc::now();
    for entry in self.due.pop_due(now) {
      let active = self.state.active_workers.load(AtomicOrdering::Relaxed);
      if active >= self.state.max_workers {
        trace!(
          active,
          max_workers = self.state.max_workers,
          "Dispatch check: all workers busy, entry stays queued."
        );
        self.due.insert(entry.job_id, entry.fire_time);
        continue;
      }

      // Scheduled -> Running. Holding Running exclusively until the worker
      // reports back is what prevents a second concurrent dispatch.
      let job_snapshot = {
        let mut definitions = self.state.definitions.write().await;
        match definitions.get_mut(&entry.job_id) {
          None => {
            warn!(job_id = %entry.job_id, "Due entry for unknown job, discarding.");
            continue;
          }
          Some(def) => {
            if !def.job.enabled || !def.job.state.can_transition(JobState::Running) {
              trace!(
                  job_id = %entry.job_id,
                  state = ?def.job.state,
                  "Due entry no longer runnable, discarding."
              );
              continue;
            }
            def.job.state = JobState::Running;
            def.job.next_run = None;
            def.job.updated_at = now;
            def.job.clone()
          }
        }
      };
      self.persist(&job_snapshot).await;

      let prev = self
        .state
        .active_workers
        .fetch_add(1, AtomicOrdering::Relaxed);
      self
        .state
        .metrics
        .workers_active_current
        .store(prev + 1, AtomicOrdering::Relaxed);
      self
        .state
        .metrics
        .jobs_dispatched
        .fetch_add(1, AtomicOrdering::Relaxed);

      trace!(job_id = %entry.job_id, fire_time = %entry.fire_time, "Dispatching due job.");
      if let Err(e) = self
        .state
        .dispatch_tx
        .send((entry.job_id, entry.fire_time))
        .await
      {
        error!(
            job_id = %entry.job_id,
            "Failed to send dispatch, channel closed? {:?}.", e
        );
        let prev = self
          .state
          .active_workers
          .fetch_sub(1, AtomicOrdering::Relaxed);
        self
          .state
          .metrics
          .workers_active_current
          .store(prev.saturating_sub(1), AtomicOrdering::Relaxed);
        self.rollback_dispatch(entry.job_id, entry.fire_time).await;
        break;
      }
    }
  }

  /// Puts a job back to Scheduled after a failed dispatch send, so it is not
  /// stuck in Running with no worker attached.
  async fn rollback_dispatch(&mut self, job_id: JobId, fire_time: chrono::DateTime<Utc>) {
    let snapshot = {
      let mut definitions = self.state.definitions.write().await;
      definitions.get_mut(&job_id).map(|def| {
        def.job.state = JobState::Scheduled;
        def.job.next_run = Some(fire_time);
        def.job.updated_at = Utc::now();
        def.job.clone()
      })
    };
    if let Some(job) = snapshot {
      self.due.insert(job_id, fire_time);
      self.persist(&job).await;
    }
  }

  /// Applies a worker's run report: re-insert, go terminal, or drop.
  async fn handle_report(&mut self, report: RunReport) {
    match report {
      RunReport::Reschedule { job_id, next_run } => {
        let snapshot = {
          let mut definitions = self.state.definitions.write().await;
          let Some(def) = definitions.get_mut(&job_id) else {
            warn!(%job_id, "Reschedule report for unknown job (cancelled mid-run?).");
            return;
          };
          if !def.job.enabled || def.job.state == JobState::Disabled {
            // Disabled while running: the in-flight run finished, but the
            // lifecycle suppresses the re-insertion.
            debug!(%job_id, "Suppressing re-insertion of disabled job.");
            if def.job.state == JobState::Running {
              def.job.state = JobState::Disabled;
            }
            def.job.next_run = None;
            def.job.updated_at = Utc::now();
            (def.job.clone(), false)
          } else {
            def.job.state = JobState::Scheduled;
            def.job.next_run = Some(next_run);
            def.job.updated_at = Utc::now();
            (def.job.clone(), true)
          }
        };
        let (job, reinsert) = snapshot;
        if reinsert {
          self.due.insert(job_id, next_run);
          info!(%job_id, %next_run, "Rescheduled job.");
        }
        self.persist(&job).await;
      }
      RunReport::FailedTerminal { job_id } => {
        let snapshot = {
          let mut definitions = self.state.definitions.write().await;
          let Some(def) = definitions.get_mut(&job_id) else {
            warn!(%job_id, "Terminal report for unknown job (cancelled mid-run?).");
            return;
          };
          // A disable issued mid-run wins over the terminal verdict.
          let went_terminal = if !def.job.enabled {
            def.job.state = JobState::Disabled;
            false
          } else if def.job.state != JobState::Disabled {
            def.job.state = JobState::FailedTerminal;
            true
          } else {
            false
          };
          def.job.next_run = None;
          def.job.updated_at = Utc::now();
          (def.job.clone(), went_terminal)
        };
        let (job, went_terminal) = snapshot;
        if went_terminal {
          self
            .state
            .metrics
            .jobs_failed_terminal
            .fetch_add(1, AtomicOrdering::Relaxed);
          error!(%job_id, "Job moved to terminal failure; manual reset required.");
        }
        self.persist(&job).await;
      }
      RunReport::Discarded { job_id } => {
        // Finalize the Running marker a mid-run disable left in place.
        let snapshot = {
          let mut definitions = self.state.definitions.write().await;
          definitions.get_mut(&job_id).and_then(|def| {
            if def.job.state == JobState::Running {
              def.job.state = JobState::Disabled;
              def.job.next_run = None;
              def.job.updated_at = Utc::now();
              Some(def.job.clone())
            } else {
              None
            }
          })
        };
        if let Some(job) = snapshot {
          self.persist(&job).await;
        }
        trace!(%job_id, "Run discarded (job disabled or removed mid-run).");
      }
    }
  }

  /// Handles commands from the `TickWheel` handle.
  async fn handle_command(&mut self, cmd: EngineCommand) {
    match cmd {
      EngineCommand::GetJob { job_id, responder } => {
        let definitions = self.state.definitions.read().await;
        let result = definitions
          .get(&job_id)
          .map(|def| def.job.details())
          .ok_or(QueryError::JobNotFound(job_id));
        let _ = responder.send(result);
      }
      EngineCommand::ListJobs { responder } => {
        let definitions = self.state.definitions.read().await;
        let summaries = definitions.values().map(|def| def.job.summary()).collect();
        let _ = responder.send(summaries);
      }
      EngineCommand::MetricsSnapshot { responder } => {
        let _ = responder.send(self.state.metrics.snapshot());
      }
      EngineCommand::Cancel { job_id, responder } => {
        let removed = self.state.definitions.write().await.remove(&job_id);
        let response = if removed.is_some() {
          self.due.remove(job_id);
          self
            .state
            .metrics
            .jobs_cancelled
            .fetch_add(1, AtomicOrdering::Relaxed);
          // Best effort: a missed delete leaves a stale store row behind,
          // which recovery skips if it cannot be resolved to an action.
          if let Err(e) = self.state.store.delete(job_id).await {
            warn!(%job_id, error = %e, "Failed to delete job from store.");
          }
          info!(%job_id, "Cancelled job.");
          Ok(())
        } else {
          Err(QueryError::JobNotFound(job_id))
        };
        let _ = responder.send(response);
      }
      EngineCommand::Disable { job_id, responder } => {
        let snapshot = {
          let mut definitions = self.state.definitions.write().await;
          definitions.get_mut(&job_id).map(|def| {
            def.job.enabled = false;
            // A running job keeps its Running marker until the run report
            // arrives; releasing it here would let an enable re-insert a
            // due entry while the run is still in flight.
            if def.job.state != JobState::Running {
              def.job.state = JobState::Disabled;
            }
            def.job.next_run = None;
            def.job.updated_at = Utc::now();
            def.job.clone()
          })
        };
        let response = match snapshot {
          Some(job) => {
            self.due.remove(job_id);
            info!(%job_id, "Disabled job.");
            self.persist(&job).await;
            Ok(())
          }
          None => Err(QueryError::JobNotFound(job_id)),
        };
        let _ = responder.send(response);
      }
      EngineCommand::Enable { job_id, responder } => {
        let response = self.enable_job(job_id).await;
        let _ = responder.send(response);
      }
      EngineCommand::Reset { job_id, responder } => {
        let response = self.reset_job(job_id).await;
        let _ = responder.send(response);
      }
      EngineCommand::UpdateSchedule {
        job_id,
        schedule,
        expr,
        responder,
      } => {
        let response = self.update_schedule(job_id, schedule, expr).await;
        let _ = responder.send(response);
      }
      EngineCommand::TriggerNow { job_id, responder } => {
        let response = self.trigger_now(job_id).await;
        let _ = responder.send(response);
      }
    }
  }

  async fn enable_job(&mut self, job_id: JobId) -> Result<(), QueryError> {
    let now = Utc::now();
    let snapshot = {
      let mut definitions = self.state.definitions.write().await;
      let def = definitions
        .get_mut(&job_id)
        .ok_or(QueryError::JobNotFound(job_id))?;
      if def.job.enabled {
        return Ok(()); // Idempotent.
      }
      if def.job.state == JobState::Running {
        // Disabled and re-enabled while the run is still in flight: flip
        // the flag back and let the run report drive the reschedule. A due
        // entry here would overlap the running execution.
        def.job.enabled = true;
        def.job.updated_at = now;
        (def.job.clone(), None)
      } else {
        // Recompute from now, never from the stale pre-disable value.
        let next_run = def.expr.next_fire_time(now)?;
        def.job.enabled = true;
        def.job.state = JobState::Scheduled;
        def.job.next_run = Some(next_run);
        def.job.updated_at = now;
        (def.job.clone(), Some(next_run))
      }
    };
    let (job, next_run) = snapshot;
    match next_run {
      Some(next_run) => {
        self.due.insert(job_id, next_run);
        info!(%job_id, %next_run, "Enabled job.");
      }
      None => info!(%job_id, "Enabled job; the in-flight run will drive the reschedule."),
    }
    self.persist(&job).await;
    Ok(())
  }

  async fn reset_job(&mut self, job_id: JobId) -> Result<(), QueryError> {
    let now = Utc::now();
    let snapshot = {
      let mut definitions = self.state.definitions.write().await;
      let def = definitions
        .get_mut(&job_id)
        .ok_or(QueryError::JobNotFound(job_id))?;
      if def.job.state != JobState::FailedTerminal {
        return Err(QueryError::InvalidTransition {
          job_id,
          state: def.job.state,
        });
      }
      let next_run = def.expr.next_fire_time(now)?;
      def.job.state = JobState::Scheduled;
      def.job.enabled = true;
      def.job.consecutive_failures = 0;
      def.job.next_run = Some(next_run);
      def.job.updated_at = now;
      (def.job.clone(), next_run)
    };
    let (job, next_run) = snapshot;
    self.due.insert(job_id, next_run);
    info!(%job_id, %next_run, "Reset terminally failed job.");
    self.persist(&job).await;
    Ok(())
  }

  async fn update_schedule(
    &mut self,
    job_id: JobId,
    schedule: String,
    expr: crate::schedule::ScheduleExpr,
  ) -> Result<(), QueryError> {
    let now = Utc::now();
    let snapshot = {
      let mut definitions = self.state.definitions.write().await;
      let def = definitions
        .get_mut(&job_id)
        .ok_or(QueryError::JobNotFound(job_id))?;
      // Reject before mutating anything if the new expression cannot fire.
      let next_run = expr.next_fire_time(now)?;
      def.expr = expr;
      def.job.schedule = schedule;
      def.job.updated_at = now;
      let live = def.job.enabled && def.job.state == JobState::Scheduled;
      if live {
        def.job.next_run = Some(next_run);
      }
      // A Running job keeps the new expression for its post-run reschedule.
      (def.job.clone(), live.then_some(next_run))
    };
    let (job, reinsert) = snapshot;
    if let Some(next_run) = reinsert {
      self.due.insert(job_id, next_run);
      info!(%job_id, %next_run, "Updated schedule and superseded due entry.");
    } else {
      info!(%job_id, "Updated schedule.");
    }
    self.persist(&job).await;
    Ok(())
  }

  async fn trigger_now(&mut self, job_id: JobId) -> Result<(), QueryError> {
    let now = Utc::now();
    let snapshot = {
      let mut definitions = self.state.definitions.write().await;
      let def = definitions
        .get_mut(&job_id)
        .ok_or(QueryError::JobNotFound(job_id))?;
      if !def.job.enabled || def.job.state != JobState::Scheduled {
        return Err(QueryError::InvalidTransition {
          job_id,
          state: def.job.state,
        });
      }
      def.job.next_run = Some(now);
      def.job.updated_at = now;
      def.job.clone()
    };
    if self.due.contains(job_id) {
      trace!(%job_id, "Superseding existing due entry with an immediate one.");
    }
    self.due.insert(job_id, now);
    info!(%job_id, "Triggered job to run now.");
    self.persist(&snapshot).await;
    Ok(())
  }
}
