//! Durable job engine: store, claim, staged execution, retry, reaping.
//!
//! ## Design
//!
//! - The job row is the single source of truth for status; every component
//!   other than claim, pipeline, retry, reaper and admin reset only reads it
//! - Claims are atomic: a row is leased to exactly one worker at a time
//! - Stages commit one at a time, so a retried or reclaimed job resumes at the
//!   stage that failed instead of redoing committed side effects
//! - Jobs that run out of attempts (or fail fatally) end in `error` and get a
//!   dead-letter entry
//!
//! ## Components
//!
//! - `Job` / `JobStatus`: row model and closed state machine
//! - `JobStore`: persistence (in-memory or Postgres)
//! - `Enqueuer`: trigger event → run bookkeeping → job row
//! - `StagePipeline`: ordered, resumable stage execution
//! - `RetryController`: retry vs. terminal failure, backoff scheduling
//! - `Worker`: claim loop with graceful drain
//! - `Reaper`: reclaims abandoned leases
//! - `DeadLetterSink`, `StatusProjection`, `JobAdmin`: visibility and repair

pub mod admin;
pub mod clock;
pub mod dead_letter;
pub mod document;
pub mod enqueue;
pub mod handlers;
pub mod pipeline;
pub mod postgres;
pub mod reaper;
pub mod retry;
pub mod status;
pub mod store;
pub mod types;
pub mod worker;

pub use admin::{JobAdmin, ResetFilter, ResetReport};
pub use clock::Clock;
pub use dead_letter::{
    DeadLetterEntry, DeadLetterError, DeadLetterSink, InMemoryDeadLetterSink, PostgresDeadLetterSink,
};
pub use document::{JobContext, JobPayload, StageOutput};
pub use enqueue::{EnqueueError, EnqueueOutcome, Enqueuer, RewardProgram};
pub use pipeline::{PipelineOutcome, StageError, StageHandler, StageInput, StagePipeline};
pub use postgres::PostgresJobStore;
pub use reaper::{ReapReport, Reaper, ReaperHandle};
pub use retry::{BackoffStrategy, FailureClass, FailureOutcome, RetryController, RetryPolicy};
pub use status::{JobView, StatusProjection, StatusReport, StatusSummary};
pub use store::{InMemoryJobStore, JobStore, JobStoreError, Placement, StatusCounts};
pub use types::{Job, JobId, JobStatus, NewJob, Stage, StatusKind, TransitionError};
pub use worker::{TickReport, Worker, WorkerConfig, WorkerHandle, WorkerStats};
