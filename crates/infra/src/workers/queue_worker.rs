//! Long-running queue worker.
//!
//! One worker runs one job at a time: claim, heartbeat, dispatch to the
//! registered handler, then complete or fail the job. Throughput scales by
//! running more worker processes against the same table.

use std::any::Any;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use jobsync_core::{JobId, WorkerId};

use crate::jobs::{
    BackoffPolicy, ClaimFilter, FailOutcome, HandlerRegistry, Job, JobContext, JobStore,
    JobStoreError,
};

/// Shortest heartbeat period the worker will tick at.
const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(10);

/// Identity of this process, `<hostname>:<pid>`.
pub fn current_worker_id() -> WorkerId {
    let hostname = gethostname::gethostname();
    WorkerId::from_parts(&hostname.to_string_lossy(), std::process::id())
}

/// Queue worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Sleep between claims when the queue is empty
    pub poll_interval: Duration,
    /// Random extra idle sleep, so a fleet of workers does not poll in lockstep
    pub poll_jitter: Duration,
    /// How often a running job's heartbeat is refreshed
    pub heartbeat_interval: Duration,
    /// Sleep after a failed store call (claim/complete/fail)
    pub infra_backoff: Duration,
    pub backoff: BackoffPolicy,
    /// Sleep for a failed job's backoff before the next claim
    pub pause_after_failure: bool,
    /// Exit after processing this many jobs
    pub max_jobs: Option<u64>,
    /// Return as soon as a claim comes back empty
    pub exit_when_idle: bool,
    /// Which jobs this worker may claim
    pub filter: ClaimFilter,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            poll_jitter: Duration::from_millis(500),
            heartbeat_interval: Duration::from_secs(30),
            infra_backoff: Duration::from_secs(10),
            backoff: BackoffPolicy::default(),
            pause_after_failure: false,
            max_jobs: None,
            exit_when_idle: false,
            filter: ClaimFilter::any(),
        }
    }
}

impl WorkerConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_poll_jitter(mut self, jitter: Duration) -> Self {
        self.poll_jitter = jitter;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_infra_backoff(mut self, backoff: Duration) -> Self {
        self.infra_backoff = backoff;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_pause_after_failure(mut self, pause: bool) -> Self {
        self.pause_after_failure = pause;
        self
    }

    pub fn with_max_jobs(mut self, max_jobs: u64) -> Self {
        self.max_jobs = Some(max_jobs);
        self
    }

    pub fn with_exit_when_idle(mut self, exit: bool) -> Self {
        self.exit_when_idle = exit;
        self
    }

    pub fn with_filter(mut self, filter: ClaimFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Idle sleep: `poll_interval` plus up to `poll_jitter`.
    fn idle_delay(&self) -> Duration {
        let jitter_ms = u64::try_from(self.poll_jitter.as_millis()).unwrap_or(u64::MAX);
        if jitter_ms == 0 {
            return self.poll_interval;
        }
        self.poll_interval + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    }
}

/// Shutdown flag and in-flight job, shared between a worker and whoever
/// stops it (signal listener, tests).
#[derive(Debug, Clone, Default)]
pub struct WorkerControl {
    inner: Arc<ControlInner>,
}

#[derive(Debug, Default)]
struct ControlInner {
    shutdown: CancellationToken,
    in_flight: Mutex<InFlight>,
}

#[derive(Debug, Default)]
struct InFlight {
    current: Option<JobId>,
    at_shutdown: Option<JobId>,
}

impl WorkerControl {
    pub fn new() -> Self {
        Self::default()
    }

    fn in_flight(&self) -> MutexGuard<'_, InFlight> {
        self.inner.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stop claiming new work. A job already running is allowed to finish.
    pub fn request_shutdown(&self) {
        {
            let mut in_flight = self.in_flight();
            if !self.inner.shutdown.is_cancelled() {
                in_flight.at_shutdown = in_flight.current;
            }
        }
        self.inner.shutdown.cancel();
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Resolves once shutdown has been requested.
    pub async fn cancelled(&self) {
        self.inner.shutdown.cancelled().await;
    }

    /// Job currently executing, if any.
    pub fn current_job(&self) -> Option<JobId> {
        self.in_flight().current
    }

    /// Job that was executing when shutdown was requested.
    pub fn in_flight_at_shutdown(&self) -> Option<JobId> {
        self.in_flight().at_shutdown
    }

    fn begin_job(&self, id: JobId) -> InFlightGuard<'_> {
        self.in_flight().current = Some(id);
        InFlightGuard { control: self }
    }
}

struct InFlightGuard<'a> {
    control: &'a WorkerControl,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.control.in_flight().current = None;
    }
}

/// Result of processing one claimed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Retrying { attempts: i32, delay: Duration },
    DeadLettered { attempts: i32 },
    /// The job was taken away (reaped) while running; its result was discarded.
    Lost,
}

impl JobOutcome {
    pub fn retry_delay(&self) -> Option<Duration> {
        match self {
            Self::Retrying { delay, .. } => Some(*delay),
            _ => None,
        }
    }
}

impl From<FailOutcome> for JobOutcome {
    fn from(outcome: FailOutcome) -> Self {
        match outcome {
            FailOutcome::Retrying { attempts, delay, .. } => Self::Retrying { attempts, delay },
            FailOutcome::DeadLettered { attempts } => Self::DeadLettered { attempts },
        }
    }
}

/// Why [`QueueWorker::run`] returned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerExit {
    #[default]
    Shutdown,
    Idle,
    MaxJobs,
}

/// Counters for one worker run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerReport {
    pub processed: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub lost: u64,
    pub infra_errors: u64,
    pub in_flight_at_shutdown: Option<JobId>,
    pub exit: WorkerExit,
}

impl WorkerReport {
    pub fn record(&mut self, outcome: &JobOutcome) {
        self.processed += 1;
        match outcome {
            JobOutcome::Completed => self.succeeded += 1,
            JobOutcome::Retrying { .. } => self.retried += 1,
            JobOutcome::DeadLettered { .. } => self.dead_lettered += 1,
            JobOutcome::Lost => self.lost += 1,
        }
    }
}

/// Sequential claim/execute loop over a [`JobStore`].
pub struct QueueWorker<S: JobStore> {
    store: S,
    registry: Arc<HandlerRegistry>,
    config: WorkerConfig,
    worker_id: WorkerId,
    control: WorkerControl,
}

impl<S: JobStore> QueueWorker<S> {
    pub fn new(store: S, registry: impl Into<Arc<HandlerRegistry>>, config: WorkerConfig) -> Self {
        Self {
            store,
            registry: registry.into(),
            config,
            worker_id: current_worker_id(),
            control: WorkerControl::new(),
        }
    }

    pub fn with_worker_id(mut self, worker_id: WorkerId) -> Self {
        self.worker_id = worker_id;
        self
    }

    pub fn with_control(mut self, control: WorkerControl) -> Self {
        self.control = control;
        self
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    pub fn control(&self) -> &WorkerControl {
        &self.control
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Run until shutdown is requested, the queue drains (`exit_when_idle`),
    /// or `max_jobs` jobs have been processed.
    ///
    /// Store failures never end the loop; they are logged and followed by
    /// `infra_backoff`.
    pub async fn run(&self) -> WorkerReport {
        info!(
            worker_id = %self.worker_id,
            handlers = ?self.registry.patterns(),
            "queue worker started"
        );

        let mut report = WorkerReport::default();
        let exit = loop {
            if self.control.is_shutdown_requested() {
                break WorkerExit::Shutdown;
            }
            if self.config.max_jobs.is_some_and(|max| report.processed >= max) {
                info!(worker_id = %self.worker_id, processed = report.processed, "job limit reached");
                break WorkerExit::MaxJobs;
            }

            match self.claim_and_process(&self.config.filter).await {
                Ok(Some(outcome)) => {
                    report.record(&outcome);
                    if self.config.pause_after_failure {
                        if let Some(delay) = outcome.retry_delay() {
                            if self.sleep_or_shutdown(delay).await {
                                break WorkerExit::Shutdown;
                            }
                        }
                    }
                }
                Ok(None) => {
                    if self.config.exit_when_idle {
                        break WorkerExit::Idle;
                    }
                    if self.sleep_or_shutdown(self.config.idle_delay()).await {
                        break WorkerExit::Shutdown;
                    }
                }
                Err(err) => {
                    report.infra_errors += 1;
                    error!(
                        worker_id = %self.worker_id,
                        error = %err,
                        backoff_secs = self.config.infra_backoff.as_secs_f64(),
                        "queue store error"
                    );
                    if self.sleep_or_shutdown(self.config.infra_backoff).await {
                        break WorkerExit::Shutdown;
                    }
                }
            }
        };

        report.exit = exit;
        report.in_flight_at_shutdown = self.control.in_flight_at_shutdown();
        info!(
            worker_id = %self.worker_id,
            exit = ?report.exit,
            processed = report.processed,
            succeeded = report.succeeded,
            retried = report.retried,
            dead_lettered = report.dead_lettered,
            "queue worker stopped"
        );
        report
    }

    /// Claim and process a single job using the configured filter.
    pub async fn run_once(&self) -> Result<Option<JobOutcome>, JobStoreError> {
        self.claim_and_process(&self.config.filter).await
    }

    /// Claim one job matching `filter` and process it. `None` when nothing is eligible.
    pub async fn claim_and_process(&self, filter: &ClaimFilter) -> Result<Option<JobOutcome>, JobStoreError> {
        match self.store.claim(&self.worker_id, filter).await? {
            Some(job) => self.process(job).await.map(Some),
            None => Ok(None),
        }
    }

    /// Execute a claimed job and record its outcome.
    pub async fn process(&self, job: Job) -> Result<JobOutcome, JobStoreError> {
        let span = info_span!(
            "job",
            job_id = %job.id,
            job_type = %job.job_type,
            tier = %job.tier(),
            attempt = job.current_attempt(),
            worker_id = %self.worker_id,
        );
        self.process_inner(job).instrument(span).await
    }

    async fn process_inner(&self, job: Job) -> Result<JobOutcome, JobStoreError> {
        let _in_flight = self.control.begin_job(job.id);
        debug!("job started");

        if let Err(err) = self.store.heartbeat(job.id, &self.worker_id).await {
            warn!(error = %err, "initial heartbeat failed");
        }

        match self.execute(&job).await {
            Ok(result) => match self.store.complete(job.id, &self.worker_id, result).await {
                Ok(()) => {
                    info!("job completed");
                    Ok(JobOutcome::Completed)
                }
                Err(JobStoreError::NotHeld(_)) | Err(JobStoreError::NotFound(_)) => {
                    warn!("job was reclaimed while running; result discarded");
                    Ok(JobOutcome::Lost)
                }
                Err(err) => Err(err),
            },
            Err(message) => {
                match self
                    .store
                    .fail(job.id, &self.worker_id, &message, &self.config.backoff)
                    .await
                {
                    Ok(outcome) => {
                        match &outcome {
                            FailOutcome::Retrying { attempts, delay, .. } => warn!(
                                attempts,
                                max_attempts = job.max_attempts,
                                retry_in_ms = delay.as_millis() as u64,
                                error = %message,
                                "job failed, will retry"
                            ),
                            FailOutcome::DeadLettered { attempts } => error!(
                                attempts,
                                error = %message,
                                "job failed permanently, moved to dead-letter queue"
                            ),
                        }
                        Ok(outcome.into())
                    }
                    Err(JobStoreError::NotHeld(_)) | Err(JobStoreError::NotFound(_)) => {
                        warn!(error = %message, "job was reclaimed while running; failure not recorded");
                        Ok(JobOutcome::Lost)
                    }
                    Err(err) => Err(err),
                }
            }
        }
    }

    /// Run the handler on its own task, refreshing the heartbeat until it finishes.
    async fn execute(&self, job: &Job) -> Result<Value, String> {
        let Some(handler) = self.registry.resolve(&job.job_type) else {
            return Err(format!("no handler registered for job type '{}'", job.job_type));
        };

        let ctx = JobContext::for_job(job, &self.worker_id);
        let payload = job.payload.clone();
        let mut task = tokio::spawn(async move { handler.handle(&payload, &ctx).await });

        let period = self.config.heartbeat_interval.max(MIN_HEARTBEAT_INTERVAL);
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                joined = &mut task => {
                    return match joined {
                        Ok(Ok(result)) => Ok(result),
                        Ok(Err(err)) => Err(format!("{err:#}")),
                        Err(join_err) if join_err.is_panic() => {
                            Err(format!("handler panicked: {}", panic_message(join_err.into_panic())))
                        }
                        Err(join_err) => Err(format!("handler task aborted: {join_err}")),
                    };
                }
                _ = heartbeat.tick() => {
                    if let Err(err) = self.store.heartbeat(job.id, &self.worker_id).await {
                        warn!(error = %err, "heartbeat failed");
                    }
                }
            }
        }
    }

    /// Sleep for `duration`; returns `true` if shutdown was requested meanwhile.
    async fn sleep_or_shutdown(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = self.control.cancelled() => true,
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{InMemoryJobStore, JobStatus, NewJob};
    use serde_json::json;
    use tokio::sync::Notify;

    fn fast_config() -> WorkerConfig {
        WorkerConfig::default()
            .with_poll_interval(Duration::from_millis(10))
            .with_poll_jitter(Duration::ZERO)
            .with_infra_backoff(Duration::from_millis(10))
            .with_backoff(BackoffPolicy::immediate())
    }

    fn worker(
        store: Arc<InMemoryJobStore>,
        registry: HandlerRegistry,
        config: WorkerConfig,
    ) -> QueueWorker<Arc<InMemoryJobStore>> {
        QueueWorker::new(store, registry, config).with_worker_id(WorkerId::named("test-worker"))
    }

    #[test]
    fn worker_id_is_host_colon_pid() {
        let id = current_worker_id();
        assert!(id.as_str().ends_with(&format!(":{}", std::process::id())));
    }

    #[tokio::test]
    async fn successful_job_is_completed_with_result() {
        let store = InMemoryJobStore::arc();
        let registry = HandlerRegistry::new().with_fn("email.send", |payload, _ctx| async move {
            Ok::<_, anyhow::Error>(json!({ "sent_to": payload["to"] }))
        });
        let id = store
            .enqueue(NewJob::new("email.send", json!({"to": "ops@example.com"})))
            .await
            .unwrap();

        let w = worker(store.clone(), registry, fast_config());
        assert_eq!(w.run_once().await.unwrap(), Some(JobOutcome::Completed));

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result, Some(json!({"sent_to": "ops@example.com"})));
        assert_eq!(w.control().current_job(), None);
    }

    #[tokio::test]
    async fn empty_queue_returns_none() {
        let w = worker(InMemoryJobStore::arc(), HandlerRegistry::new(), fast_config());
        assert_eq!(w.run_once().await.unwrap(), None);
    }

    #[tokio::test]
    async fn unknown_job_type_consumes_an_attempt() {
        let store = InMemoryJobStore::arc();
        let id = store.enqueue(NewJob::new("mystery", json!({}))).await.unwrap();

        let w = worker(store.clone(), HandlerRegistry::new(), fast_config());
        let outcome = w.run_once().await.unwrap().unwrap();
        assert_eq!(
            outcome,
            JobOutcome::Retrying {
                attempts: 1,
                delay: Duration::ZERO
            }
        );

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.last_error.unwrap().contains("no handler"));
    }

    #[tokio::test]
    async fn handler_panic_is_a_job_failure() {
        let store = InMemoryJobStore::arc();
        let registry = HandlerRegistry::new().with_fn("boom", |_payload, _ctx| async move {
            if true {
                panic!("kaboom");
            }
            Ok::<_, anyhow::Error>(json!(null))
        });
        let id = store
            .enqueue(NewJob::new("boom", json!({})).with_max_attempts(1))
            .await
            .unwrap();

        let w = worker(store.clone(), registry, fast_config());
        assert_eq!(
            w.run_once().await.unwrap(),
            Some(JobOutcome::DeadLettered { attempts: 1 })
        );

        assert!(store.get(id).await.unwrap().is_none());
        let dead = store.list_dead_letters(1).await.unwrap();
        assert!(dead[0].last_error.contains("kaboom"));
    }

    #[tokio::test]
    async fn always_failing_handler_dead_letters_every_job() {
        let store = InMemoryJobStore::arc();
        for priority in [1, 1, 4, 4, 2] {
            store
                .enqueue(NewJob::new("notify", json!({})).with_priority(priority).with_max_attempts(3))
                .await
                .unwrap();
        }
        let registry = HandlerRegistry::new().with_fn("notify", |_payload, _ctx| async move {
            Err::<Value, _>(anyhow::anyhow!("gateway unavailable"))
        });

        let w = worker(store.clone(), registry, fast_config().with_exit_when_idle(true));
        let report = w.run().await;

        assert_eq!(report.exit, WorkerExit::Idle);
        assert_eq!(report.processed, 15);
        assert_eq!(report.retried, 10);
        assert_eq!(report.dead_lettered, 5);
        assert!(store.jobs().is_empty());

        let dead = store.list_dead_letters(10).await.unwrap();
        assert_eq!(dead.len(), 5);
        assert!(dead.iter().all(|e| e.attempts == 3 && e.last_error == "gateway unavailable"));
    }

    #[tokio::test]
    async fn stops_after_max_jobs() {
        let store = InMemoryJobStore::arc();
        for _ in 0..5 {
            store.enqueue(NewJob::new("noop", json!({}))).await.unwrap();
        }
        let registry =
            HandlerRegistry::new().with_fn("noop", |_p, _c| async { Ok::<_, anyhow::Error>(json!(null)) });

        let w = worker(store.clone(), registry, fast_config().with_max_jobs(2));
        let report = w.run().await;

        assert_eq!(report.exit, WorkerExit::MaxJobs);
        assert_eq!(report.processed, 2);
        assert_eq!(store.stats().await.unwrap().pending, 3);
    }

    #[tokio::test]
    async fn heartbeat_is_refreshed_while_handler_runs() {
        let store = InMemoryJobStore::arc();
        let id = store.enqueue(NewJob::new("slow", json!({}))).await.unwrap();
        let registry = HandlerRegistry::new().with_fn("slow", |_p, _c| async {
            tokio::time::sleep(Duration::from_millis(120)).await;
            Ok::<_, anyhow::Error>(json!("done"))
        });

        let w = worker(
            store.clone(),
            registry,
            fast_config().with_heartbeat_interval(Duration::from_millis(20)),
        );
        w.run_once().await.unwrap();

        let job = store.get(id).await.unwrap().unwrap();
        assert!(job.heartbeat_at.unwrap() > job.started_at.unwrap());
    }

    #[tokio::test]
    async fn shutdown_lets_in_flight_job_finish_and_claims_nothing_else() {
        let store = InMemoryJobStore::arc();
        let first = store
            .enqueue(NewJob::new("gate", json!({})).with_priority(4))
            .await
            .unwrap();
        let second = store.enqueue(NewJob::new("gate", json!({}))).await.unwrap();

        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let registry = {
            let started = started.clone();
            let release = release.clone();
            HandlerRegistry::new().with_fn("gate", move |_p, _c| {
                let started = started.clone();
                let release = release.clone();
                async move {
                    started.notify_one();
                    release.notified().await;
                    Ok::<_, anyhow::Error>(json!("finished"))
                }
            })
        };

        let control = WorkerControl::new();
        let w = worker(store.clone(), registry, fast_config()).with_control(control.clone());
        let running = tokio::spawn(async move { w.run().await });

        started.notified().await;
        assert_eq!(control.current_job(), Some(first));
        control.request_shutdown();
        release.notify_one();

        let report = running.await.unwrap();
        assert_eq!(report.exit, WorkerExit::Shutdown);
        assert_eq!(report.in_flight_at_shutdown, Some(first));
        assert_eq!(report.succeeded, 1);

        assert_eq!(store.get(first).await.unwrap().unwrap().status, JobStatus::Completed);
        assert_eq!(store.get(second).await.unwrap().unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn shutdown_interrupts_idle_sleep() {
        let control = WorkerControl::new();
        let w = worker(
            InMemoryJobStore::arc(),
            HandlerRegistry::new(),
            fast_config().with_poll_interval(Duration::from_secs(3600)),
        )
        .with_control(control.clone());

        let running = tokio::spawn(async move { w.run().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        control.request_shutdown();

        let report = tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.exit, WorkerExit::Shutdown);
        assert_eq!(report.in_flight_at_shutdown, None);
    }

    #[tokio::test]
    async fn reclaimed_job_is_reported_lost() {
        let store = InMemoryJobStore::arc();
        let id = store.enqueue(NewJob::new("stuck", json!({}))).await.unwrap();

        // The handler simulates a reaper pass that runs while it is still working.
        let reaper_store = store.clone();
        let registry = HandlerRegistry::new().with_fn("stuck", move |_p, _c| {
            let store = reaper_store.clone();
            async move {
                store.set_heartbeat(id, chrono::Utc::now() - chrono::Duration::hours(1))?;
                store.reap_stale(Duration::from_secs(60), &BackoffPolicy::immediate()).await?;
                Ok::<_, anyhow::Error>(json!("late"))
            }
        });

        let w = worker(store.clone(), registry, fast_config());
        assert_eq!(w.run_once().await.unwrap(), Some(JobOutcome::Lost));

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 1);
    }
}
