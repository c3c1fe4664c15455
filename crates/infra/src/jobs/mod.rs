//! Durable job queue with retry, backoff, and dead-letter handling.
//!
//! ## Design
//!
//! - One table is the coordination point; workers claim rows with
//!   `FOR UPDATE SKIP LOCKED`, so at most one worker holds a job
//! - Failed attempts back off exponentially (`next_attempt_at`)
//! - Jobs that exhaust `max_attempts` move to the dead-letter queue
//! - Stale heartbeats are reaped back into the queue
//!
//! ## Components
//!
//! - `Job` / `NewJob`: job rows and enqueue requests
//! - `JobStore`: persistence (in-memory or PostgreSQL)
//! - `BackoffPolicy`: retry delay curve
//! - `HandlerRegistry`: `job_type` to handler dispatch

pub mod backoff;
pub mod postgres;
pub mod registry;
pub mod store;
pub mod types;

pub use backoff::BackoffPolicy;
pub use postgres::PostgresJobStore;
pub use registry::{HandlerRegistry, JobContext, JobHandler};
pub use store::{InMemoryJobStore, JobStore, JobStoreError};
pub use types::{
    ClaimFilter, DeadLetterEntry, FailOutcome, Job, JobStats, JobStatus, NewJob, PriorityCounts,
    ReapReport, DEFAULT_MAX_ATTEMPTS,
};
