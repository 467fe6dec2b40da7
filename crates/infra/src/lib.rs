//! Infrastructure layer: job queue, leases, correlation records, the
//! provider API client, configuration, and their Postgres adapters.

pub mod client;
pub mod clock;
pub mod config;
pub mod correlation;
pub mod credentials;
pub mod db;
pub mod jobs;
pub mod locks;
pub mod retry;
pub mod sync_log;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, SyncConfig};
pub use retry::{BackoffStrategy, Failure, RetryMachine, RetryPolicy, RetryState};
