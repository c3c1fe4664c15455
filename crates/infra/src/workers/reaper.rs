//! Stale heartbeat reaper.
//!
//! A worker that dies mid-job leaves its row in `processing` forever. The
//! reaper fails such rows exactly as the worker would have: one attempt is
//! consumed, then the job is retried with backoff or dead-lettered.

use std::time::Duration;

use tracing::{info, warn};

use crate::jobs::{BackoffPolicy, JobStore, JobStoreError, ReapReport};

use super::queue_worker::WorkerControl;

/// How many missed heartbeats make a job stale.
pub const STALE_HEARTBEAT_FACTOR: u32 = 5;

/// Running counts over the life of [`StaleJobReaper::run`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReaperTotals {
    pub sweeps: u64,
    pub failed_sweeps: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
}

impl ReaperTotals {
    fn record(&mut self, report: &ReapReport) {
        self.sweeps += 1;
        self.requeued += report.requeued.len() as u64;
        self.dead_lettered += report.dead_lettered.len() as u64;
    }
}

pub struct StaleJobReaper<S: JobStore> {
    store: S,
    threshold: Duration,
    backoff: BackoffPolicy,
}

impl<S: JobStore> StaleJobReaper<S> {
    pub fn new(store: S, threshold: Duration, backoff: BackoffPolicy) -> Self {
        Self {
            store,
            threshold,
            backoff,
        }
    }

    /// Reaper whose threshold is [`STALE_HEARTBEAT_FACTOR`] heartbeat intervals.
    pub fn for_heartbeat(store: S, heartbeat_interval: Duration, backoff: BackoffPolicy) -> Self {
        Self::new(store, heartbeat_interval * STALE_HEARTBEAT_FACTOR, backoff)
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// One sweep over `processing` jobs.
    pub async fn run_once(&self) -> Result<ReapReport, JobStoreError> {
        let report = self.store.reap_stale(self.threshold, &self.backoff).await?;
        if report.total() > 0 {
            warn!(
                requeued = ?report.requeued,
                dead_lettered = ?report.dead_lettered,
                threshold_secs = self.threshold.as_secs_f64(),
                "reaped jobs with stale heartbeats"
            );
        }
        Ok(report)
    }

    /// Sweep every `interval` until shutdown. Store errors are logged and the
    /// next sweep runs on schedule.
    pub async fn run(&self, control: &WorkerControl, interval: Duration) -> ReaperTotals {
        let mut totals = ReaperTotals::default();
        loop {
            match self.run_once().await {
                Ok(report) => totals.record(&report),
                Err(err) => {
                    totals.failed_sweeps += 1;
                    warn!(error = %err, "reaper sweep failed");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = control.cancelled() => break,
            }
        }
        info!(
            sweeps = totals.sweeps,
            requeued = totals.requeued,
            dead_lettered = totals.dead_lettered,
            "reaper stopped"
        );
        totals
    }
}
