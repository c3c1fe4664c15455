//! Tiered batch scheduler for notification-style jobs.
//!
//! Each invocation drains at most a fixed number of jobs per priority tier,
//! most urgent tier first, so a flood of low-priority work cannot starve
//! urgent jobs. Retries are swept separately, independent of tier.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::info;

use jobsync_core::PriorityTier;

use crate::jobs::{ClaimFilter, JobStore, JobStoreError};

use super::queue_worker::{JobOutcome, QueueWorker};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    batch_limits: BTreeMap<PriorityTier, usize>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_limits: BTreeMap::from([
                (PriorityTier::Urgent, 100),
                (PriorityTier::High, 50),
                (PriorityTier::Normal, 25),
                (PriorityTier::Low, 10),
            ]),
        }
    }
}

impl SchedulerConfig {
    pub fn with_batch_limit(mut self, tier: PriorityTier, limit: usize) -> Self {
        self.batch_limits.insert(tier, limit);
        self
    }

    pub fn batch_limit(&self, tier: PriorityTier) -> usize {
        self.batch_limits.get(&tier).copied().unwrap_or(0)
    }
}

/// Counters for one scheduler invocation. Observational only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    /// `None` for a retry sweep
    pub tier: Option<PriorityTier>,
    pub processed: u64,
    pub succeeded: u64,
    /// Handler failures (`retried + dead_lettered`)
    pub failed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
}

impl BatchReport {
    fn for_tier(tier: Option<PriorityTier>) -> Self {
        Self {
            tier,
            ..Self::default()
        }
    }

    fn record(&mut self, outcome: &JobOutcome) {
        self.processed += 1;
        match outcome {
            JobOutcome::Completed => self.succeeded += 1,
            JobOutcome::Retrying { .. } => {
                self.failed += 1;
                self.retried += 1;
            }
            JobOutcome::DeadLettered { .. } => {
                self.failed += 1;
                self.dead_lettered += 1;
            }
            JobOutcome::Lost => {}
        }
    }
}

/// Runs tier batches on top of a [`QueueWorker`], reusing its handlers,
/// heartbeat and failure handling.
pub struct PriorityScheduler<S: JobStore> {
    worker: QueueWorker<S>,
    config: SchedulerConfig,
}

impl<S: JobStore> PriorityScheduler<S> {
    pub fn new(worker: QueueWorker<S>, config: SchedulerConfig) -> Self {
        Self { worker, config }
    }

    pub fn worker(&self) -> &QueueWorker<S> {
        &self.worker
    }

    /// Process up to the tier's batch limit from that tier's priority band.
    pub async fn run_tier(&self, tier: PriorityTier) -> Result<BatchReport, JobStoreError> {
        let report = self
            .drain(Some(tier), &ClaimFilter::tier(tier), self.config.batch_limit(tier))
            .await?;
        info!(
            tier = %tier,
            processed = report.processed,
            succeeded = report.succeeded,
            failed = report.failed,
            "tier batch finished"
        );
        Ok(report)
    }

    /// Run every tier, urgent first, each with its own batch limit.
    pub async fn run_all_tiers(&self) -> Result<Vec<BatchReport>, JobStoreError> {
        let mut reports = Vec::with_capacity(PriorityTier::ALL.len());
        for tier in PriorityTier::ALL {
            if self.worker.control().is_shutdown_requested() {
                break;
            }
            reports.push(self.run_tier(tier).await?);
        }
        Ok(reports)
    }

    /// Re-run up to `limit` previously failed jobs whose backoff has elapsed.
    pub async fn retry_sweep(&self, limit: usize) -> Result<BatchReport, JobStoreError> {
        let report = self.drain(None, &ClaimFilter::retries(), limit).await?;
        info!(
            processed = report.processed,
            succeeded = report.succeeded,
            retried = report.retried,
            dead_lettered = report.dead_lettered,
            "retry sweep finished"
        );
        Ok(report)
    }

    async fn drain(
        &self,
        tier: Option<PriorityTier>,
        filter: &ClaimFilter,
        limit: usize,
    ) -> Result<BatchReport, JobStoreError> {
        let mut report = BatchReport::for_tier(tier);
        for _ in 0..limit {
            if self.worker.control().is_shutdown_requested() {
                break;
            }
            match self.worker.claim_and_process(filter).await? {
                Some(outcome) => report.record(&outcome),
                None => break,
            }
        }
        Ok(report)
    }
}
