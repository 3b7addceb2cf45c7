use crate::command::{Dispatch, EngineCommand, RunReport, ShutdownMode};
use crate::coordinator::{Coordinator, CoordinatorState};
use crate::error::{BuildError, QueryError, RecoverError, ShutdownError, SubmitError};
use crate::job::{Job, JobAction, JobDefinition, JobDetails, JobId, JobRequest, JobState, JobSummary};
use crate::metrics::{EngineMetrics, MetricsSnapshot};
use crate::schedule::ScheduleExpr;
use crate::store::JobStore;
use crate::worker::Worker;

use std::collections::HashMap;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::try_join_all;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

const DEFAULT_STAGING_BUFFER: usize = 100;
const DEFAULT_COMMAND_BUFFER: usize = 32;
const DEFAULT_MAX_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Builder for configuring and starting a [`TickWheel`] engine.
#[derive(Default)]
pub struct SchedulerBuilder {
  max_workers: Option<usize>,
  store: Option<Arc<dyn JobStore>>,
  staging_buffer_size: usize,
  command_buffer_size: usize,
  max_poll_interval: Option<Duration>,
}

impl SchedulerBuilder {
  pub fn new() -> Self {
    Self {
      max_workers: None,
      store: None,
      staging_buffer_size: DEFAULT_STAGING_BUFFER,
      command_buffer_size: DEFAULT_COMMAND_BUFFER,
      max_poll_interval: None,
    }
  }

  /// Sets the number of worker tasks, which is also the concurrent-execution
  /// cap. Required, must be > 0.
  pub fn max_workers(mut self, count: usize) -> Self {
    self.max_workers = Some(count);
    self
  }

  /// Sets the durable job store. Required; use
  /// [`crate::store::MemoryJobStore`] for embedded or test setups.
  pub fn store(mut self, store: Arc<dyn JobStore>) -> Self {
    self.store = Some(store);
    self
  }

  /// Capacity of the submission staging buffer. When full, `try_submit`
  /// rejects and `submit` awaits.
  pub fn staging_buffer_size(mut self, size: usize) -> Self {
    self.staging_buffer_size = size.max(1);
    self
  }

  pub fn command_buffer_size(mut self, size: usize) -> Self {
    self.command_buffer_size = size.max(1);
    self
  }

  /// Upper bound on the dispatcher's idle wait between due-set polls.
  pub fn max_poll_interval(mut self, interval: Duration) -> Self {
    self.max_poll_interval = Some(interval);
    self
  }

  /// Validates the configuration, spawns the coordinator and worker tasks,
  /// and returns the engine handle.
  pub fn build(self) -> Result<TickWheel, BuildError> {
    let max_workers = match self.max_workers {
      Some(n) if n > 0 => n,
      _ => return Err(BuildError::MissingOrZeroMaxWorkers),
    };
    let store = self.store.ok_or(BuildError::MissingStore)?;
    let max_poll_interval = self.max_poll_interval.unwrap_or(DEFAULT_MAX_POLL_INTERVAL);

    info!(
      max_workers,
      staging_buffer = self.staging_buffer_size,
      ?max_poll_interval,
      "Building scheduler engine."
    );

    let (staging_tx, staging_rx) = mpsc::channel::<JobDefinition>(self.staging_buffer_size);
    let (cmd_tx, cmd_rx) = mpsc::channel::<EngineCommand>(self.command_buffer_size);
    let (shutdown_tx, shutdown_rx) = watch::channel::<Option<ShutdownMode>>(None);
    let (report_tx, report_rx) = mpsc::channel::<RunReport>(max_workers * 2 + 8);
    // Capacity gating in the coordinator keeps this channel shallow; a
    // bounded buffer means a dispatch is either picked up or pending receipt.
    let (dispatch_tx, dispatch_rx) = async_channel::bounded::<Dispatch>(max_workers);

    let definitions = Arc::new(RwLock::new(HashMap::new()));
    let metrics = EngineMetrics::new();
    let active_workers = Arc::new(AtomicUsize::new(0));

    let mut join_handles = Vec::with_capacity(max_workers + 1);

    let coordinator_state = CoordinatorState {
      staging_rx,
      cmd_rx,
      shutdown_rx: shutdown_rx.clone(),
      report_rx,
      dispatch_tx,
      definitions: Arc::clone(&definitions),
      store: Arc::clone(&store),
      metrics: metrics.clone(),
      active_workers: Arc::clone(&active_workers),
      max_workers,
      max_poll_interval,
    };
    join_handles.push(tokio::spawn(async move {
      Coordinator::new(coordinator_state).run().await;
    }));

    for id in 0..max_workers {
      let mut worker = Worker {
        id,
        dispatch_rx: dispatch_rx.clone(),
        report_tx: report_tx.clone(),
        shutdown_rx: shutdown_rx.clone(),
        definitions: Arc::clone(&definitions),
        store: Arc::clone(&store),
        metrics: metrics.clone(),
        active_workers: Arc::clone(&active_workers),
      };
      join_handles.push(tokio::spawn(async move {
        worker.run().await;
      }));
    }

    Ok(TickWheel {
      staging_tx,
      cmd_tx,
      shutdown_tx,
      store,
      metrics,
      join_handles: Mutex::new(Some(join_handles)),
    })
  }
}

/// Handle to a running scheduler engine.
///
/// All mutations flow through channels to the coordinator task, which owns
/// the due-set index; the handle itself never touches scheduling state.
pub struct TickWheel {
  staging_tx: mpsc::Sender<JobDefinition>,
  cmd_tx: mpsc::Sender<EngineCommand>,
  shutdown_tx: watch::Sender<Option<ShutdownMode>>,
  store: Arc<dyn JobStore>,
  metrics: EngineMetrics,
  join_handles: Mutex<Option<Vec<JoinHandle<()>>>>,
}

impl TickWheel {
  pub fn builder() -> SchedulerBuilder {
    SchedulerBuilder::new()
  }

  /// Submits a new job, awaiting staging-buffer space if necessary.
  ///
  /// The schedule is parsed and its reachability checked before anything is
  /// enqueued, so a malformed or never-firing expression is rejected here.
  pub async fn submit(
    &self,
    request: JobRequest,
    action: JobAction,
  ) -> Result<JobId, SubmitError> {
    let def = self.make_definition(request, action)?;
    let job_id = def.job.id;
    self
      .staging_tx
      .send(def)
      .await
      .map_err(|_| SubmitError::ChannelClosed)?;
    Ok(job_id)
  }

  /// Non-blocking submission: rejects with [`SubmitError::StagingFull`] when
  /// the staging buffer has no space, leaving backpressure to the caller.
  pub fn try_submit(&self, request: JobRequest, action: JobAction) -> Result<JobId, SubmitError> {
    let def = self.make_definition(request, action)?;
    let job_id = def.job.id;
    match self.staging_tx.try_send(def) {
      Ok(()) => Ok(job_id),
      Err(mpsc::error::TrySendError::Full(_)) => {
        self
          .metrics
          .staging_rejected_full
          .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Err(SubmitError::StagingFull)
      }
      Err(mpsc::error::TrySendError::Closed(_)) => Err(SubmitError::ChannelClosed),
    }
  }

  fn make_definition(
    &self,
    request: JobRequest,
    action: JobAction,
  ) -> Result<JobDefinition, SubmitError> {
    self
      .metrics
      .staging_submitted_total
      .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

    if request.name.trim().is_empty() {
      return Err(SubmitError::InvalidName);
    }
    let expr = ScheduleExpr::parse(&request.schedule)?;

    let now = Utc::now();
    let (state, next_run) = if request.enabled {
      let computed = expr.next_fire_time(now)?;
      (
        JobState::Scheduled,
        Some(request.first_run_at.unwrap_or(computed)),
      )
    } else {
      (JobState::Disabled, None)
    };

    let job = Job {
      id: Uuid::new_v4(),
      name: request.name,
      schedule: request.schedule,
      state,
      enabled: request.enabled,
      last_run: None,
      next_run,
      last_result: None,
      consecutive_failures: 0,
      max_retries: request.max_retries,
      timeout: request.timeout,
      created_at: now,
      updated_at: now,
    };
    debug!(job_id = %job.id, job_name = %job.name, ?next_run, "Staging job submission.");

    Ok(JobDefinition {
      job,
      expr,
      action: Arc::new(action),
    })
  }

  /// Reloads persisted jobs into the engine at startup.
  ///
  /// Actions are not persisted, so the caller supplies a resolver mapping
  /// each stored record back to its executable action; records the resolver
  /// declines (or whose stored schedule no longer parses) are skipped with a
  /// warning. Returns the number of jobs re-staged.
  ///
  /// Jobs found in `Running` state crashed mid-run and are recovered as
  /// `Scheduled`; a past or missing fire time makes a live job immediately
  /// due rather than waiting a full period.
  pub async fn recover<F>(&self, resolver: F) -> Result<usize, RecoverError>
  where
    F: Fn(&Job) -> Option<JobAction>,
  {
    let jobs = self.store.list().await?;
    let total = jobs.len();
    let mut recovered = 0usize;
    let now = Utc::now();

    for mut job in jobs {
      let Some(action) = resolver(&job) else {
        warn!(job_id = %job.id, job_name = %job.name, "No action resolved for stored job, skipping.");
        continue;
      };
      let expr = match ScheduleExpr::parse(&job.schedule) {
        Ok(expr) => expr,
        Err(e) => {
          warn!(job_id = %job.id, schedule = %job.schedule, error = %e, "Stored schedule no longer parses, skipping.");
          continue;
        }
      };

      if job.state == JobState::Running {
        debug!(job_id = %job.id, "Job was mid-run at shutdown, recovering as scheduled.");
        job.state = JobState::Scheduled;
        job.next_run = None;
      }
      if job.enabled && job.state == JobState::Scheduled && job.next_run.is_none() {
        // No stored fire time; run as soon as a worker is free.
        job.next_run = Some(now);
      }

      self
        .staging_tx
        .send(JobDefinition {
          job,
          expr,
          action: Arc::new(action),
        })
        .await
        .map_err(|_| RecoverError::ChannelClosed)?;
      recovered += 1;
    }

    info!(recovered, total, "Recovery staging complete.");
    Ok(recovered)
  }

  /// Requests detailed information about a specific job.
  pub async fn get_job(&self, job_id: JobId) -> Result<JobDetails, QueryError> {
    let (tx, rx) = oneshot::channel();
    self
      .send_command(EngineCommand::GetJob {
        job_id,
        responder: tx,
      })
      .await?;
    rx.await.map_err(|_| QueryError::ResponseFailed)?
  }

  /// Lists summaries of every known job, in no particular order.
  pub async fn list_jobs(&self) -> Result<Vec<JobSummary>, QueryError> {
    let (tx, rx) = oneshot::channel();
    self
      .send_command(EngineCommand::ListJobs { responder: tx })
      .await?;
    rx.await.map_err(|_| QueryError::ResponseFailed)
  }

  /// Requests a point-in-time snapshot of the engine metrics.
  pub async fn metrics_snapshot(&self) -> Result<MetricsSnapshot, QueryError> {
    let (tx, rx) = oneshot::channel();
    self
      .send_command(EngineCommand::MetricsSnapshot { responder: tx })
      .await?;
    rx.await.map_err(|_| QueryError::ResponseFailed)
  }

  /// Removes a job entirely: due entry, definition, and store record.
  /// An in-flight run finishes but its outcome is discarded.
  pub async fn cancel(&self, job_id: JobId) -> Result<(), QueryError> {
    self.simple_command(|tx| EngineCommand::Cancel { job_id, responder: tx }).await
  }

  /// Stops a job from firing without removing it. Legal from any state.
  pub async fn disable(&self, job_id: JobId) -> Result<(), QueryError> {
    self.simple_command(|tx| EngineCommand::Disable { job_id, responder: tx }).await
  }

  /// Brings a disabled job back, recomputing its fire time from now.
  pub async fn enable(&self, job_id: JobId) -> Result<(), QueryError> {
    self.simple_command(|tx| EngineCommand::Enable { job_id, responder: tx }).await
  }

  /// Returns a terminally failed job to service with a fresh retry budget.
  pub async fn reset(&self, job_id: JobId) -> Result<(), QueryError> {
    self.simple_command(|tx| EngineCommand::Reset { job_id, responder: tx }).await
  }

  /// Replaces a job's cron expression. The next fire time is recomputed from
  /// now under the new schedule, superseding any existing due entry.
  pub async fn update_schedule(&self, job_id: JobId, schedule: &str) -> Result<(), QueryError> {
    // Parse on the caller's side so malformed input fails fast.
    let expr = ScheduleExpr::parse(schedule)?;
    let schedule = schedule.to_owned();
    self
      .simple_command(|tx| EngineCommand::UpdateSchedule {
        job_id,
        schedule,
        expr,
        responder: tx,
      })
      .await
  }

  /// Pulls a scheduled job's fire time forward to now.
  pub async fn trigger_now(&self, job_id: JobId) -> Result<(), QueryError> {
    self.simple_command(|tx| EngineCommand::TriggerNow { job_id, responder: tx }).await
  }

  async fn simple_command<F>(&self, build: F) -> Result<(), QueryError>
  where
    F: FnOnce(oneshot::Sender<Result<(), QueryError>>) -> EngineCommand,
  {
    let (tx, rx) = oneshot::channel();
    self.send_command(build(tx)).await?;
    rx.await.map_err(|_| QueryError::ResponseFailed)?
  }

  async fn send_command(&self, cmd: EngineCommand) -> Result<(), QueryError> {
    self
      .cmd_tx
      .send(cmd)
      .await
      .map_err(|_| QueryError::SchedulerShutdown)
  }

  /// Signals a graceful shutdown and waits for the coordinator and workers
  /// to finish, up to `timeout`. In-flight executions are allowed to
  /// complete; undispatched due entries are dropped (recovery re-derives
  /// them from the store on the next start).
  pub async fn shutdown_graceful(&self, timeout: Duration) -> Result<(), ShutdownError> {
    self.shutdown(ShutdownMode::Graceful, timeout).await
  }

  /// Signals a force shutdown: tasks stop at their next await point and
  /// in-flight executions may be interrupted.
  pub async fn shutdown_force(&self, timeout: Duration) -> Result<(), ShutdownError> {
    self.shutdown(ShutdownMode::Force, timeout).await
  }

  async fn shutdown(&self, mode: ShutdownMode, timeout: Duration) -> Result<(), ShutdownError> {
    let handles = self
      .join_handles
      .lock()
      .take()
      .ok_or(ShutdownError::SignalFailed)?;

    info!(?mode, ?timeout, "Initiating scheduler shutdown.");
    self
      .shutdown_tx
      .send(Some(mode))
      .map_err(|_| ShutdownError::SignalFailed)?;

    match tokio::time::timeout(timeout, try_join_all(handles)).await {
      Ok(Ok(_)) => {
        info!("Scheduler shutdown complete.");
        Ok(())
      }
      Ok(Err(join_err)) => {
        warn!(error = %join_err, "Scheduler task panicked during shutdown.");
        Err(ShutdownError::TaskPanic)
      }
      Err(_) => {
        warn!("Timed out waiting for scheduler tasks to finish.");
        Err(ShutdownError::Timeout)
      }
    }
  }
}

impl std::fmt::Debug for TickWheel {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("TickWheel")
      .field("shut_down", &self.join_handles.lock().is_none())
      .finish()
  }
}
