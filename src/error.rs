use crate::job::{JobId, JobState};

use thiserror::Error;

/// Identifies which cron field a parse error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CronField {
  Minute,
  Hour,
  DayOfMonth,
  Month,
  DayOfWeek,
}

impl std::fmt::Display for CronField {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let name = match self {
      CronField::Minute => "minute",
      CronField::Hour => "hour",
      CronField::DayOfMonth => "day-of-month",
      CronField::Month => "month",
      CronField::DayOfWeek => "day-of-week",
    };
    f.write_str(name)
  }
}

/// Errors produced by the schedule parser and fire-time computation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
  #[error("invalid {field} field: {reason}")]
  Parse { field: CronField, reason: String },
  #[error("expected 5 space-separated cron fields, got {0}")]
  FieldCount(usize),
  #[error("schedule has no fire time within the search horizon")]
  Unreachable,
}

/// Errors that can occur while building the scheduler via `SchedulerBuilder`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
  #[error("Maximum worker count (`max_workers`) must be specified and greater than zero")]
  MissingOrZeroMaxWorkers,
  #[error("A job store must be provided via `SchedulerBuilder::store`")]
  MissingStore,
}

/// Errors related to submitting jobs via `submit` or `try_submit`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
  #[error("Job name must be a non-empty string")]
  InvalidName,
  #[error(transparent)]
  Schedule(#[from] ScheduleError),
  #[error("Staging buffer is full, job rejected. Caller may retry.")]
  StagingFull,
  #[error("Scheduler's staging channel is closed (likely shut down or panicked).")]
  ChannelClosed,
}

/// Errors related to commands against existing jobs
/// (`get_job`, `cancel`, `disable`, `enable`, `reset`, `update_schedule`, `trigger_now`).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
  #[error("Scheduler command channel is closed (likely shut down or panicked).")]
  SchedulerShutdown,
  #[error("Scheduler did not respond to the command (coordinator task may have panicked).")]
  ResponseFailed,
  #[error("Job {0} not found.")]
  JobNotFound(JobId),
  #[error("Job {job_id} cannot perform this operation from state {state:?}.")]
  InvalidTransition { job_id: JobId, state: JobState },
  #[error(transparent)]
  Schedule(#[from] ScheduleError),
}

/// Errors surfaced by the job store collaborator. The engine treats the store
/// as potentially slow and fallible; `Unavailable` is always retryable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
  #[error("job store unavailable: {0}")]
  Unavailable(String),
}

/// Errors produced while recovering persisted jobs at startup.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecoverError {
  #[error(transparent)]
  Store(#[from] StoreError),
  #[error("Scheduler's staging channel is closed (likely shut down or panicked).")]
  ChannelClosed,
}

/// Errors related to the scheduler shutdown process.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShutdownError {
  #[error("Failed to send shutdown signal (scheduler already shut down or watch channel error).")]
  SignalFailed,
  #[error("Timed out waiting for scheduler tasks (coordinator, workers) to complete shutdown.")]
  Timeout,
  #[error("A worker or coordinator task panicked during the shutdown process.")]
  TaskPanic,
}
