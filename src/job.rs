use crate::schedule::ScheduleExpr;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

// --- Public Type Aliases ---

/// Unique identifier of a job definition. Uses UUID v4; immutable after creation.
pub type JobId = Uuid;

/// Type alias for the simple numeric ID assigned to worker tasks for logging.
pub(crate) type WorkerId = usize;

/// The function type behind [`JobAction::Func`].
///
/// The function must be asynchronous, `Send + Sync + 'static`, and return a
/// `Future` resolving to `Result<(), String>`:
/// - `Ok(())` indicates logical success of the job's operation.
/// - `Err(detail)` indicates logical failure; the detail lands in `last_result`.
/// Panics within the function are caught by the worker and treated as failures.
pub type BoxedExecFn = Box<
  dyn Fn() -> Pin<Box<dyn Future<Output = Result<(), String>> + Send + 'static>>
    + Send
    + Sync
    + 'static,
>;

/// Default execution timeout applied when a request does not set one.
pub const DEFAULT_TIMEOUT: StdDuration = StdDuration::from_secs(30);

/// Default retry budget applied when a request does not set one.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Upper bound on the exponential retry backoff, in seconds.
const MAX_BACKOFF_SECS: u64 = 300;

/// Delay before retry attempt `n` (1-based): `min(2^n, 300)` seconds.
pub(crate) fn retry_backoff(attempt: u32) -> StdDuration {
  let secs = 1u64
    .checked_shl(attempt.min(32))
    .unwrap_or(u64::MAX)
    .min(MAX_BACKOFF_SECS);
  StdDuration::from_secs(secs)
}

// --- Actions ---

/// What a job actually runs, as a capability-typed variant.
///
/// Each variant is executed under the job's timeout and reports a uniform
/// outcome; dispatch is a plain `match` in the worker.
#[derive(Clone)]
pub enum JobAction {
  /// Spawn an external command via `tokio::process` and treat a non-zero exit
  /// status as failure.
  Shell { program: String, args: Vec<String> },
  /// Run a boxed async closure in-process.
  Func(Arc<BoxedExecFn>),
}

impl JobAction {
  /// Builds a shell-command action.
  pub fn shell(program: impl Into<String>, args: Vec<String>) -> Self {
    JobAction::Shell {
      program: program.into(),
      args,
    }
  }

  /// Builds an in-process function action from an async closure.
  pub fn func<F>(exec_fn: F) -> Self
  where
    F: Fn() -> Pin<Box<dyn Future<Output = Result<(), String>> + Send + 'static>>
      + Send
      + Sync
      + 'static,
  {
    JobAction::Func(Arc::new(Box::new(exec_fn)))
  }
}

// Manual Debug: BoxedExecFn has no useful representation.
impl fmt::Debug for JobAction {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      JobAction::Shell { program, args } => f
        .debug_struct("Shell")
        .field("program", program)
        .field("args", args)
        .finish(),
      JobAction::Func(_) => f.write_str("Func(<exec fn>)"),
    }
  }
}

// --- Lifecycle ---

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum JobState {
  /// Has a live due entry (or is waiting for worker capacity) and will be
  /// dispatched at its next fire time.
  Scheduled,
  /// Currently executing. A running job has no due entry; the exclusively
  /// held Running state is what prevents concurrent runs of the same job.
  Running,
  /// Exhausted its retry budget. Leaves the due set until explicitly reset.
  FailedTerminal,
  /// Administratively stopped. Leaves the due set until explicitly enabled.
  Disabled,
}

impl JobState {
  /// Whether moving from `self` to `next` is a legal lifecycle transition.
  pub fn can_transition(self, next: JobState) -> bool {
    use JobState::*;
    match (self, next) {
      // Dispatcher pulls a due entry.
      (Scheduled, Running) => true,
      // Executor completed: success or retryable failure.
      (Running, Scheduled) => true,
      // Executor failure exceeding the retry budget.
      (Running, FailedTerminal) => true,
      // Explicit disable from any state.
      (_, Disabled) => true,
      // Explicit enable / reset commands.
      (Disabled, Scheduled) => true,
      (FailedTerminal, Scheduled) => true,
      _ => false,
    }
  }
}

// --- Run outcomes ---

/// The terminal result of one execution attempt.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RunOutcome {
  Succeeded,
  Failed(String),
  TimedOut,
  Cancelled,
}

impl RunOutcome {
  pub fn is_success(&self) -> bool {
    matches!(self, RunOutcome::Succeeded)
  }
}

/// Record of one executor invocation. Only `last_run`/`last_result` survive
/// on the job itself; the full record is for logging and reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRecord {
  pub started_at: DateTime<Utc>,
  pub finished_at: DateTime<Utc>,
  pub outcome: RunOutcome,
}

// --- Job model ---

/// Configuration for a new job, passed to `TickWheel::submit`.
#[derive(Debug, Clone)]
pub struct JobRequest {
  /// A descriptive name for the job (must be non-empty).
  pub name: String,
  /// Five-field cron expression, validated at submission.
  pub schedule: String,
  /// Maximum consecutive failures before the job goes terminal.
  pub max_retries: u32,
  /// Per-execution timeout; an overrun counts as a failure.
  pub timeout: StdDuration,
  /// Whether the job starts live. A job created disabled gets no due entry.
  pub enabled: bool,
  /// Optional override for the first fire time, bypassing the cron
  /// computation once. Useful for one-off kicks and tests.
  pub first_run_at: Option<DateTime<Utc>>,
}

impl JobRequest {
  pub fn new(name: impl Into<String>, schedule: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      schedule: schedule.into(),
      max_retries: DEFAULT_MAX_RETRIES,
      timeout: DEFAULT_TIMEOUT,
      enabled: true,
      first_run_at: None,
    }
  }

  pub fn max_retries(mut self, max_retries: u32) -> Self {
    self.max_retries = max_retries;
    self
  }

  pub fn timeout(mut self, timeout: StdDuration) -> Self {
    self.timeout = timeout;
    self
  }

  pub fn disabled(mut self) -> Self {
    self.enabled = false;
    self
  }

  /// Sets a specific first fire time instead of computing it from the cron
  /// expression. Subsequent runs are always cron-computed.
  pub fn first_run_at(mut self, run_at: DateTime<Utc>) -> Self {
    self.first_run_at = Some(run_at);
    self
  }
}

/// The persistent job record, as held by the [`crate::store::JobStore`].
///
/// The executable action is deliberately not part of this record; see
/// `DESIGN.md` on payload supply. `next_run` is `Some` exactly when the job
/// is scheduled (live due entry or awaiting worker capacity).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
  pub id: JobId,
  pub name: String,
  /// Raw cron expression as submitted.
  pub schedule: String,
  pub state: JobState,
  pub enabled: bool,
  pub last_run: Option<DateTime<Utc>>,
  pub next_run: Option<DateTime<Utc>>,
  pub last_result: Option<RunOutcome>,
  pub consecutive_failures: u32,
  pub max_retries: u32,
  pub timeout: StdDuration,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

/// Internal struct holding the full definition and live state of a job.
/// Lives in the shared definitions map; not exposed in the public API.
pub(crate) struct JobDefinition {
  pub job: Job,
  /// Parsed schedule; recomputed whenever the raw string changes.
  pub expr: ScheduleExpr,
  /// Execution payload, shared cheaply with workers.
  pub action: Arc<JobAction>,
}

impl fmt::Debug for JobDefinition {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("JobDefinition")
      .field("job", &self.job)
      .field("expr", &self.expr)
      .field("action", &self.action)
      .finish()
  }
}

// --- Public snapshot structs for querying ---

/// A summary of a job's state, suitable for listing multiple jobs.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct JobSummary {
  pub id: JobId,
  pub name: String,
  pub state: JobState,
  pub enabled: bool,
  pub next_run: Option<DateTime<Utc>>,
  pub consecutive_failures: u32,
}

/// Detailed information about a specific job retrieved via query.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct JobDetails {
  pub id: JobId,
  pub name: String,
  pub schedule: String,
  pub state: JobState,
  pub enabled: bool,
  pub last_run: Option<DateTime<Utc>>,
  pub next_run: Option<DateTime<Utc>>,
  pub last_result: Option<RunOutcome>,
  pub consecutive_failures: u32,
  pub max_retries: u32,
  pub timeout: StdDuration,
}

impl Job {
  pub(crate) fn details(&self) -> JobDetails {
    JobDetails {
      id: self.id,
      name: self.name.clone(),
      schedule: self.schedule.clone(),
      state: self.state,
      enabled: self.enabled,
      last_run: self.last_run,
      next_run: self.next_run,
      last_result: self.last_result.clone(),
      consecutive_failures: self.consecutive_failures,
      max_retries: self.max_retries,
      timeout: self.timeout,
    }
  }

  pub(crate) fn summary(&self) -> JobSummary {
    JobSummary {
      id: self.id,
      name: self.name.clone(),
      state: self.state,
      enabled: self.enabled,
      next_run: self.next_run,
      consecutive_failures: self.consecutive_failures,
    }
  }
}
