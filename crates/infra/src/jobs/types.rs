//! Core job types.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use jobsync_core::{DomainError, JobId, PriorityTier, WorkerId};

/// Default ceiling on execution attempts before a job is dead-lettered.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

/// Lifecycle state of a live job row.
///
/// Dead-lettered jobs are removed from the live table, so there is no
/// `DeadLettered` variant here; see [`DeadLetterEntry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting to be claimed
    Pending,
    /// Claimed by a worker
    Processing,
    /// Finished successfully; kept for audit
    Completed,
}

impl JobStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A job row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Dispatch key, resolved through the handler registry
    pub job_type: String,
    /// Handler input, opaque to the queue
    pub payload: serde_json::Value,
    /// Higher = more urgent
    pub priority: i16,
    pub status: JobStatus,
    /// Execution attempts so far
    pub attempts: i32,
    pub max_attempts: i32,
    pub worker_id: Option<WorkerId>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Not claimable before this instant (retry backoff or delayed start)
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Handler result, stored on completion
    pub result: Option<serde_json::Value>,
}

impl Job {
    /// Whether the job may be claimed at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.next_attempt_at.is_none_or(|at| at <= now)
    }

    /// Attempt number the next execution will count as (1-indexed).
    pub fn current_attempt(&self) -> i32 {
        self.attempts + 1
    }

    /// Whether one more failure moves the job to the dead-letter queue.
    pub fn is_last_attempt(&self) -> bool {
        self.attempts + 1 >= self.max_attempts
    }

    pub fn tier(&self) -> PriorityTier {
        PriorityTier::for_priority(self.priority)
    }
}

/// Request to enqueue a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub job_type: String,
    pub payload: serde_json::Value,
    pub priority: i16,
    pub max_attempts: i32,
    /// Delay the first attempt until this instant.
    pub run_at: Option<DateTime<Utc>>,
}

impl NewJob {
    pub fn new(job_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            job_type: job_type.into(),
            payload,
            priority: PriorityTier::Normal.job_priority(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            run_at: None,
        }
    }

    pub fn with_priority(mut self, priority: i16) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_tier(mut self, tier: PriorityTier) -> Self {
        self.priority = tier.job_priority();
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.run_at = Some(at);
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.run_at = Some(Utc::now() + to_chrono(delay));
        self
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        if self.job_type.trim().is_empty() {
            return Err(DomainError::validation("job_type must not be empty"));
        }
        if self.max_attempts < 1 {
            return Err(DomainError::validation(format!(
                "max_attempts must be at least 1, got {}",
                self.max_attempts
            )));
        }
        Ok(())
    }
}

/// Restricts which pending jobs a claim may pick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClaimFilter {
    /// Inclusive lower priority bound
    pub min_priority: Option<i16>,
    /// Inclusive upper priority bound
    pub max_priority: Option<i16>,
    /// Only jobs that failed before and whose backoff has elapsed
    pub retries_only: bool,
}

impl ClaimFilter {
    /// Any eligible job.
    pub fn any() -> Self {
        Self::default()
    }

    pub fn tier(tier: PriorityTier) -> Self {
        let (min_priority, max_priority) = tier.priority_band();
        Self {
            min_priority,
            max_priority,
            retries_only: false,
        }
    }

    pub fn retries() -> Self {
        Self {
            retries_only: true,
            ..Self::default()
        }
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.min_priority.is_none_or(|min| job.priority >= min)
            && self.max_priority.is_none_or(|max| job.priority <= max)
            && (!self.retries_only || (job.attempts > 0 && job.next_attempt_at.is_some()))
    }
}

/// What happened to a job after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    /// Back to `pending`, claimable again at `next_attempt_at`.
    Retrying {
        attempts: i32,
        delay: Duration,
        next_attempt_at: DateTime<Utc>,
    },
    /// Moved to the dead-letter queue and removed from the live table.
    DeadLettered { attempts: i32 },
}

impl FailOutcome {
    pub fn is_dead_lettered(&self) -> bool {
        matches!(self, Self::DeadLettered { .. })
    }

    /// Backoff before the job becomes claimable again, if it was retried.
    pub fn retry_delay(&self) -> Option<Duration> {
        match self {
            Self::Retrying { delay, .. } => Some(*delay),
            Self::DeadLettered { .. } => None,
        }
    }
}

/// Terminal record of a job that exhausted its retry budget. Immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: i64,
    /// Identity of the original job
    pub job_id: JobId,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub priority: i16,
    pub last_error: String,
    pub attempts: i32,
    /// When the original job was enqueued
    pub created_at: DateTime<Utc>,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Queue statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub dead_lettered: u64,
    /// Pending jobs currently held back by `next_attempt_at`
    pub waiting_on_backoff: u64,
    /// Live (pending + processing) jobs per priority
    pub by_priority: BTreeMap<i16, PriorityCounts>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PriorityCounts {
    pub pending: u64,
    pub processing: u64,
}

/// Result of a stale-heartbeat sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReapReport {
    pub requeued: Vec<JobId>,
    pub dead_lettered: Vec<JobId>,
}

impl ReapReport {
    pub fn total(&self) -> usize {
        self.requeued.len() + self.dead_lettered.len()
    }
}

/// Convert a std duration to chrono, saturating on overflow.
pub(crate) fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}
