use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// --- Simple Histogram Implementation ---

/// A basic concurrent histogram storing count and sum.
///
/// Suitable for simple latency tracking without detailed percentile
/// information. Uses `Relaxed` ordering; strict inter-metric consistency is
/// not required here.
#[derive(Debug, Default)]
pub struct SimpleHistogram {
  count: AtomicUsize,
  sum_micros: AtomicUsize,
}

impl SimpleHistogram {
  /// Records a duration observation in the histogram.
  pub fn record(&self, duration: Duration) {
    self.count.fetch_add(1, Ordering::Relaxed);
    self.sum_micros.fetch_add(
      duration.as_micros().try_into().unwrap_or(usize::MAX),
      Ordering::Relaxed,
    );
  }

  pub fn get_count(&self) -> usize {
    self.count.load(Ordering::Relaxed)
  }

  pub fn get_sum_micros(&self) -> usize {
    self.sum_micros.load(Ordering::Relaxed)
  }
}

// --- Main Metrics Struct (Internal State) ---

/// Internal state for tracking engine metrics using atomic counters.
///
/// Cloned and shared between the coordinator and workers; cloning only clones
/// the `Arc`s.
#[derive(Debug, Clone)]
pub struct EngineMetrics {
  // --- Counters (monotonically increasing) ---
  /// Jobs accepted from the staging buffer.
  pub jobs_submitted: Arc<AtomicUsize>,
  /// Due entries handed to workers.
  pub jobs_dispatched: Arc<AtomicUsize>,
  /// Executions that completed successfully.
  pub runs_succeeded: Arc<AtomicUsize>,
  /// Executions that failed logically (including caught panics).
  pub runs_failed: Arc<AtomicUsize>,
  /// Executions cut off by the per-job timeout.
  pub runs_timed_out: Arc<AtomicUsize>,
  /// Retry attempts scheduled via backoff.
  pub jobs_retried: Arc<AtomicUsize>,
  /// Jobs that went terminal after exhausting their retry budget.
  pub jobs_failed_terminal: Arc<AtomicUsize>,
  /// Jobs removed entirely via `cancel`.
  pub jobs_cancelled: Arc<AtomicUsize>,
  /// Job store writes that failed after all retry attempts.
  pub store_writes_abandoned: Arc<AtomicUsize>,
  /// Submissions attempted via `submit`/`try_submit`.
  pub staging_submitted_total: Arc<AtomicUsize>,
  /// Submissions rejected by `try_submit` because the staging buffer was full.
  pub staging_rejected_full: Arc<AtomicUsize>,

  // --- Gauges (current state values) ---
  /// Entries currently in the due-set index.
  pub due_set_size: Arc<AtomicUsize>,
  /// Workers currently executing a job.
  pub workers_active_current: Arc<AtomicUsize>,

  // --- Histograms ---
  /// Execution duration of jobs.
  pub job_execution_duration: Arc<SimpleHistogram>,
}

impl EngineMetrics {
  pub fn new() -> Self {
    Self {
      jobs_submitted: Default::default(),
      jobs_dispatched: Default::default(),
      runs_succeeded: Default::default(),
      runs_failed: Default::default(),
      runs_timed_out: Default::default(),
      jobs_retried: Default::default(),
      jobs_failed_terminal: Default::default(),
      jobs_cancelled: Default::default(),
      store_writes_abandoned: Default::default(),
      staging_submitted_total: Default::default(),
      staging_rejected_full: Default::default(),
      due_set_size: Default::default(),
      workers_active_current: Default::default(),
      job_execution_duration: Arc::new(SimpleHistogram::default()),
    }
  }

  /// Creates a point-in-time snapshot of the current metric values.
  pub fn snapshot(&self) -> MetricsSnapshot {
    let order = Ordering::Relaxed;

    MetricsSnapshot {
      jobs_submitted: self.jobs_submitted.load(order),
      jobs_dispatched: self.jobs_dispatched.load(order),
      runs_succeeded: self.runs_succeeded.load(order),
      runs_failed: self.runs_failed.load(order),
      runs_timed_out: self.runs_timed_out.load(order),
      jobs_retried: self.jobs_retried.load(order),
      jobs_failed_terminal: self.jobs_failed_terminal.load(order),
      jobs_cancelled: self.jobs_cancelled.load(order),
      store_writes_abandoned: self.store_writes_abandoned.load(order),
      staging_submitted_total: self.staging_submitted_total.load(order),
      staging_rejected_full: self.staging_rejected_full.load(order),
      due_set_size: self.due_set_size.load(order),
      workers_active_current: self.workers_active_current.load(order),
      job_execution_duration_count: self.job_execution_duration.get_count(),
      job_execution_duration_sum_micros: self.job_execution_duration.get_sum_micros(),
    }
  }
}

impl Default for EngineMetrics {
  fn default() -> Self {
    Self::new()
  }
}

// --- Metrics Snapshot Struct (Public Data) ---

/// A snapshot of the engine's metrics at a specific point in time.
#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct MetricsSnapshot {
  // Counters
  pub jobs_submitted: usize,
  pub jobs_dispatched: usize,
  pub runs_succeeded: usize,
  pub runs_failed: usize,
  pub runs_timed_out: usize,
  pub jobs_retried: usize,
  pub jobs_failed_terminal: usize,
  pub jobs_cancelled: usize,
  pub store_writes_abandoned: usize,
  pub staging_submitted_total: usize,
  pub staging_rejected_full: usize,
  // Gauges
  pub due_set_size: usize,
  pub workers_active_current: usize,
  // Histogram data
  pub job_execution_duration_count: usize,
  pub job_execution_duration_sum_micros: usize,
}

impl MetricsSnapshot {
  /// Mean job execution duration in microseconds, `None` before the first
  /// completed run.
  pub fn mean_execution_duration_micros(&self) -> Option<f64> {
    if self.job_execution_duration_count == 0 {
      None
    } else {
      Some(self.job_execution_duration_sum_micros as f64 / self.job_execution_duration_count as f64)
    }
  }

  pub fn mean_execution_duration(&self) -> Option<Duration> {
    self
      .mean_execution_duration_micros()
      .map(|micros| Duration::from_micros(micros as u64))
  }
}
