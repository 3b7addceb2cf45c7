//! # TickWheel
//!
//! An asynchronous, in-process job scheduling and execution engine built on
//! Tokio.
//!
//! Jobs are submitted with a five-field cron expression and an executable
//! action (an async closure or a shell command). A central coordinator task
//! owns the due-set index, a priority queue keyed by next fire time, and
//! hands due jobs to a pool of worker tasks over a shared MPMC channel.
//! Executions run under a per-job timeout, failures retry with capped
//! exponential backoff, and a job that exhausts its retry budget parks in a
//! terminal state until explicitly reset.
//!
//! ## Core Concepts
//!
//! *   **[`TickWheel`]:** The engine handle, created via [`SchedulerBuilder`].
//!     All mutations (submit, cancel, disable, schedule updates) flow through
//!     it to the coordinator, which serializes them against dispatch.
//! *   **[`JobRequest`] / [`JobAction`]:** What to run and when. The cron
//!     expression is validated at submission; a schedule with no reachable
//!     fire time is rejected up front.
//! *   **Lifecycle:** `Scheduled -> Running -> Scheduled` on success or
//!     retryable failure, `Running -> FailedTerminal` past the retry budget,
//!     `Disabled` reachable from anywhere. See [`job::JobState`].
//! *   **[`store::JobStore`]:** The durable persistence boundary. Job records
//!     survive restarts; [`TickWheel::recover`] re-stages them with
//!     caller-resolved actions. A store outage never stops the engine.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tickwheel::{job_fn, JobRequest, TickWheel};
//! use tickwheel::store::MemoryJobStore;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = TickWheel::builder()
//!         .max_workers(4)
//!         .store(Arc::new(MemoryJobStore::new()))
//!         .build()?;
//!
//!     let request = JobRequest::new("heartbeat", "*/5 * * * *")
//!         .max_retries(2)
//!         .timeout(Duration::from_secs(10));
//!
//!     let job_id = engine.submit(request, job_fn! {
//!         {
//!             tracing::info!("heartbeat fired");
//!             Ok(())
//!         }
//!     }).await?;
//!
//!     println!("scheduled job {job_id}");
//!
//!     // ... later ...
//!     engine.shutdown_graceful(Duration::from_secs(30)).await?;
//!     Ok(())
//! }
//! ```

// Internal modules
mod coordinator;
mod due_set;
mod worker;

// Public modules
pub mod command;
pub mod error;
pub mod job;
pub mod macros;
pub mod metrics;
pub mod schedule;
pub mod scheduler;
pub mod store;

// Re-export core public API types
pub use command::ShutdownMode;
pub use error::{
  BuildError, QueryError, RecoverError, ScheduleError, ShutdownError, StoreError, SubmitError,
};
pub use job::{JobAction, JobDetails, JobId, JobRequest, JobState, JobSummary, RunOutcome};
pub use metrics::MetricsSnapshot;
pub use schedule::ScheduleExpr;
pub use scheduler::{SchedulerBuilder, TickWheel};
