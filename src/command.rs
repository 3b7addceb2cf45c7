use crate::error::QueryError;
use crate::job::{JobDetails, JobId, JobSummary};
use crate::metrics::MetricsSnapshot;
use crate::schedule::ScheduleExpr;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;

/// Commands sent from the `TickWheel` handle to the coordinator task.
///
/// Each command carries a `oneshot::Sender` the coordinator answers on.
/// Schedule strings are parsed in the handle before a command is built, so
/// `ParseError` surfaces synchronously to the caller and malformed
/// expressions never reach the coordinator.
#[derive(Debug)]
pub(crate) enum EngineCommand {
  /// Request detailed information about a specific job.
  GetJob {
    job_id: JobId,
    responder: oneshot::Sender<Result<JobDetails, QueryError>>,
  },
  /// Request summaries for all known jobs.
  ListJobs {
    responder: oneshot::Sender<Vec<JobSummary>>,
  },
  /// Request a snapshot of the current engine metrics.
  MetricsSnapshot {
    responder: oneshot::Sender<MetricsSnapshot>,
  },
  /// Remove a job entirely: due entry, definition, and store record.
  Cancel {
    job_id: JobId,
    responder: oneshot::Sender<Result<(), QueryError>>,
  },
  /// Stop a job from firing. Legal from any state; an in-flight run is
  /// allowed to finish but its re-insertion is suppressed.
  Disable {
    job_id: JobId,
    responder: oneshot::Sender<Result<(), QueryError>>,
  },
  /// Bring a disabled job back. Recomputes the next fire time from now.
  Enable {
    job_id: JobId,
    responder: oneshot::Sender<Result<(), QueryError>>,
  },
  /// Bring a terminally failed job back to Scheduled with a zeroed failure
  /// count.
  Reset {
    job_id: JobId,
    responder: oneshot::Sender<Result<(), QueryError>>,
  },
  /// Replace a job's schedule. Forces recomputation of the next fire time
  /// from now and supersedes any live due entry.
  UpdateSchedule {
    job_id: JobId,
    schedule: String,
    expr: ScheduleExpr,
    responder: oneshot::Sender<Result<(), QueryError>>,
  },
  /// Pull a scheduled job's fire time forward to now.
  TriggerNow {
    job_id: JobId,
    responder: oneshot::Sender<Result<(), QueryError>>,
  },
}

/// Requested shutdown mode, sent via a `watch` channel.
/// `None` on the channel means the engine is running normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
  /// Stop dispatching, let in-flight executions finish, then stop.
  Graceful,
  /// Stop all tasks as soon as possible; in-flight work may be interrupted.
  Force,
}

/// Message sent from a worker back to the coordinator after an execution
/// attempt. The worker has already persisted the run outcome and updated the
/// job's run fields; the coordinator owns the lifecycle transition and the
/// due-set mutation.
#[derive(Debug)]
pub(crate) enum RunReport {
  /// The job should fire again: regular cron fire time after success, or a
  /// backoff retry time after a retryable failure.
  Reschedule {
    job_id: JobId,
    next_run: DateTime<Utc>,
  },
  /// The job exhausted its retry budget (or its schedule has no reachable
  /// fire time) and must not be re-inserted.
  FailedTerminal { job_id: JobId },
  /// The job was disabled or removed while running; nothing to reschedule.
  Discarded { job_id: JobId },
}

/// Dispatched unit of work: the job to run plus the fire time its due entry
/// carried, for queue-wait accounting.
pub(crate) type Dispatch = (JobId, DateTime<Utc>);
