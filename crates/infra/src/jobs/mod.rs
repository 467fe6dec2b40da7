//! Durable sync job queue and its dispatcher.
//!
//! ## Lifecycle
//!
//! ```text
//! pending ──claim──▶ processing ──▶ completed
//!    ▲                  │  │
//!    │ release / stale  │  └──▶ error (budget spent, or non-retryable)
//!    └──────────────────┤
//!    ▲                  ▼
//!    └── reset_failed ─ failed (attempts < max, waits for retry_at)
//! ```
//!
//! ## Components
//!
//! - `Job`, `JobType`, `JobStatus`: the queued unit of work
//! - `JobStore`: persistence (in-memory or Postgres)
//! - `Dispatcher`: claims batches, leases entities, runs a `JobHandler`

pub mod dispatcher;
pub mod postgres;
pub mod store;
pub mod types;

pub use dispatcher::{
    CycleReport, DispatchError, Dispatcher, DispatcherConfig, DispatcherHandle, DispatcherStats,
    JobHandler, JobOutcome, SweepReport,
};
pub use postgres::PostgresJobStore;
pub use store::{InMemoryJobStore, JobStore, JobStoreError};
pub use types::{Job, JobId, JobStats, JobStatus, JobType};
