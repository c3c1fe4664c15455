use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use sqlx::PgPool;
use tracing::{info, warn};

use jobsync_infra::config::QueueSettings;
use jobsync_infra::db;
use jobsync_infra::jobs::{HandlerRegistry, JobStore, NewJob, PostgresJobStore};
use jobsync_infra::sync::{HttpExternalApi, IncrementalPoller, PollerConfig, PostgresSyncStore};
use jobsync_infra::workers::{
    PriorityScheduler, QueueWorker, SchedulerConfig, StaleJobReaper, WorkerConfig, WorkerControl,
};

use crate::cli::{Cli, Command};
use crate::handlers;
use crate::signals;

type HttpPoller = IncrementalPoller<HttpExternalApi, PostgresSyncStore>;

pub async fn execute(cli: Cli) -> Result<()> {
    let settings = QueueSettings::from_lookup(|var| cli.overrides.lookup(var))
        .context("invalid configuration")?;
    let pool = db::connect(&settings)
        .await
        .context("cannot connect to the database")?;

    match cli.command {
        Command::Migrate => {
            db::migrate(&pool).await.context("migration failed")?;
            print_json(&json!({ "migrated": true }))
        }
        Command::Run {
            max_jobs,
            pause_after_failure,
            no_reaper,
        } => {
            let mut config = settings
                .worker_config()
                .with_pause_after_failure(pause_after_failure);
            if let Some(max_jobs) = max_jobs {
                config = config.with_max_jobs(max_jobs);
            }
            run_worker(&settings, &pool, config, !no_reaper).await
        }
        Command::Once => {
            let config = settings
                .worker_config()
                .with_max_jobs(1)
                .with_exit_when_idle(true);
            run_worker(&settings, &pool, config, false).await
        }
        Command::Drain => {
            let config = settings.worker_config().with_exit_when_idle(true);
            run_worker(&settings, &pool, config, false).await
        }
        Command::Tier { tier } => {
            let scheduler = scheduler(&settings, &pool);
            print_json(&scheduler.run_tier(tier).await?)
        }
        Command::Tiers => {
            let scheduler = scheduler(&settings, &pool);
            print_json(&scheduler.run_all_tiers().await?)
        }
        Command::RetrySweep { limit } => {
            let scheduler = scheduler(&settings, &pool);
            print_json(&scheduler.retry_sweep(limit).await?)
        }
        Command::Reap => {
            let reaper = StaleJobReaper::for_heartbeat(
                PostgresJobStore::new(pool),
                settings.heartbeat_interval,
                settings.backoff,
            );
            print_json(&reaper.run_once().await?)
        }
        Command::Stats => {
            let store = PostgresJobStore::new(pool);
            print_json(&store.stats().await?)
        }
        Command::DeadLetters { limit } => {
            let store = PostgresJobStore::new(pool);
            print_json(&store.list_dead_letters(limit).await?)
        }
        Command::Requeue { dead_letter_id } => {
            let store = PostgresJobStore::new(pool);
            let job_id = store.requeue_dead_letter(dead_letter_id).await?;
            info!(dead_letter_id, %job_id, "dead letter requeued");
            print_json(&json!({ "dead_letter_id": dead_letter_id, "job_id": job_id }))
        }
        Command::Prune { older_than_days } => {
            let store = PostgresJobStore::new(pool);
            let cutoff = Utc::now() - chrono::Duration::days(i64::from(older_than_days));
            let deleted = store.prune_completed(cutoff).await?;
            info!(deleted, %cutoff, "pruned completed jobs");
            print_json(&json!({ "deleted": deleted, "cutoff": cutoff }))
        }
        Command::Enqueue {
            job_type,
            payload,
            priority,
            max_attempts,
            delay_secs,
        } => {
            let mut job = NewJob::new(job_type, payload);
            if let Some(priority) = priority {
                job = job.with_priority(priority);
            }
            if let Some(max_attempts) = max_attempts {
                job = job.with_max_attempts(max_attempts);
            }
            if let Some(secs) = delay_secs {
                job = job.delayed(Duration::from_secs(secs));
            }
            let store = PostgresJobStore::new(pool);
            let job_id = store.enqueue(job).await?;
            print_json(&json!({ "job_id": job_id }))
        }
        Command::Poll {
            stream,
            page_size,
            full_resync,
        } => {
            let poller = http_poller(&settings, &pool)?;
            let page_size = page_size.unwrap_or(settings.sync_page_size);
            print_json(&poller.poll(&stream, page_size, full_resync).await?)
        }
    }
}

async fn run_worker(
    settings: &QueueSettings,
    pool: &PgPool,
    config: WorkerConfig,
    with_reaper: bool,
) -> Result<()> {
    let control = WorkerControl::new();
    signals::spawn_shutdown_listener(control.clone());

    let worker = QueueWorker::new(PostgresJobStore::new(pool.clone()), registry(settings, pool), config)
        .with_control(control.clone());

    let report = if with_reaper {
        let reaper = StaleJobReaper::for_heartbeat(
            PostgresJobStore::new(pool.clone()),
            settings.heartbeat_interval,
            settings.backoff,
        );
        let worker_run = async {
            let report = worker.run().await;
            // Stop the reaper once the worker is done for any reason.
            control.request_shutdown();
            report
        };
        let (report, _reaped) = tokio::join!(worker_run, reaper.run(&control, reaper.threshold()));
        report
    } else {
        worker.run().await
    };

    if let Some(job_id) = report.in_flight_at_shutdown {
        info!(%job_id, "job in flight at shutdown was allowed to finish");
    }
    print_json(&report)
}

fn scheduler(settings: &QueueSettings, pool: &PgPool) -> PriorityScheduler<PostgresJobStore> {
    let control = WorkerControl::new();
    signals::spawn_shutdown_listener(control.clone());
    let worker = QueueWorker::new(
        PostgresJobStore::new(pool.clone()),
        registry(settings, pool),
        settings.worker_config(),
    )
    .with_control(control);
    PriorityScheduler::new(worker, SchedulerConfig::default())
}

fn registry(settings: &QueueSettings, pool: &PgPool) -> HandlerRegistry {
    let poller = match http_poller(settings, pool) {
        Ok(poller) => Some(Arc::new(poller)),
        Err(err) => {
            warn!(error = %format!("{err:#}"), "sync.poll jobs disabled");
            None
        }
    };
    handlers::registry(poller)
}

fn http_poller(settings: &QueueSettings, pool: &PgPool) -> Result<HttpPoller> {
    let api_config = settings.api_config()?;
    let api = HttpExternalApi::new(api_config).context("cannot build external API client")?;
    Ok(IncrementalPoller::new(
        api,
        PostgresSyncStore::new(pool.clone()),
        PollerConfig::default().with_page_size(settings.sync_page_size),
    ))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
