//! Background workers: the queue worker loop, the tiered scheduler and the
//! stale-job reaper.

pub mod queue_worker;
pub mod reaper;
pub mod scheduler;

pub use queue_worker::{
    current_worker_id, JobOutcome, QueueWorker, WorkerConfig, WorkerControl, WorkerExit,
    WorkerReport,
};
pub use reaper::{ReaperTotals, StaleJobReaper, STALE_HEARTBEAT_FACTOR};
pub use scheduler::{BatchReport, PriorityScheduler, SchedulerConfig};
