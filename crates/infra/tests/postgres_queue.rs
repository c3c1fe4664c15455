//! PostgreSQL integration tests.
//!
//! Skipped unless `DATABASE_URL` points at a database the tests may create
//! schemas in. Every test migrates into its own schema.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};

use jobsync_core::{JobId, StreamId, WorkerId};
use jobsync_infra::db;
use jobsync_infra::jobs::{
    BackoffPolicy, ClaimFilter, JobStatus, JobStore, JobStoreError, NewJob, PostgresJobStore,
};
use jobsync_infra::sync::{CursorStore, PostgresCursorStore, PostgresSyncStore, RemoteRecord, SyncStore};

static SCHEMA_SEQ: AtomicU32 = AtomicU32::new(0);

async fn test_pool(label: &str) -> Option<PgPool> {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL not set; skipping {label}");
        return None;
    };
    let schema = format!(
        "jobsync_test_{label}_{}_{}",
        std::process::id(),
        SCHEMA_SEQ.fetch_add(1, Ordering::SeqCst)
    );

    let admin = PgPool::connect(&url).await.unwrap();
    admin
        .execute(format!("DROP SCHEMA IF EXISTS {schema} CASCADE; CREATE SCHEMA {schema}").as_str())
        .await
        .unwrap();
    admin.close().await;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .after_connect(move |conn, _meta| {
            let schema = schema.clone();
            Box::pin(async move {
                conn.execute(format!("SET search_path TO {schema}").as_str())
                    .await?;
                Ok(())
            })
        })
        .connect(&url)
        .await
        .unwrap();
    db::migrate(&pool).await.unwrap();
    Some(pool)
}

fn worker(name: &str) -> WorkerId {
    WorkerId::named(name)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_workers_never_claim_the_same_job() {
    let Some(pool) = test_pool("claims").await else { return };
    let store = PostgresJobStore::new(pool);
    for i in 0..60 {
        store.enqueue(NewJob::new("bulk", json!({ "i": i }))).await.unwrap();
    }

    let mut handles = Vec::new();
    for n in 0..6 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let w = worker(&format!("w{n}"));
            let mut mine = Vec::new();
            while let Some(job) = store.claim(&w, &ClaimFilter::any()).await.unwrap() {
                assert_eq!(job.worker_id.as_ref(), Some(&w));
                mine.push(job.id);
            }
            mine
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }
    let unique: HashSet<JobId> = all.iter().copied().collect();
    assert_eq!(all.len(), 60);
    assert_eq!(unique.len(), 60);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_job_many_claimants_yields_one_winner() {
    let Some(pool) = test_pool("one_winner").await else { return };
    let store = PostgresJobStore::new(pool);
    let id = store.enqueue(NewJob::new("contested", json!({}))).await.unwrap();

    let mut handles = Vec::new();
    for n in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store.claim(&worker(&format!("w{n}")), &ClaimFilter::any()).await.unwrap()
        }));
    }

    let mut claimed = Vec::new();
    for handle in handles {
        claimed.extend(handle.await.unwrap());
    }
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, id);
}

#[tokio::test]
async fn claims_follow_priority_then_id() {
    let Some(pool) = test_pool("order").await else { return };
    let store = PostgresJobStore::new(pool);
    let low = store.enqueue(NewJob::new("a", json!({})).with_priority(1)).await.unwrap();
    let urgent_1 = store.enqueue(NewJob::new("b", json!({})).with_priority(4)).await.unwrap();
    let urgent_2 = store.enqueue(NewJob::new("c", json!({})).with_priority(4)).await.unwrap();

    let w = worker("w1");
    let mut order = Vec::new();
    while let Some(job) = store.claim(&w, &ClaimFilter::any()).await.unwrap() {
        order.push(job.id);
    }
    assert_eq!(order, vec![urgent_1, urgent_2, low]);
}

#[tokio::test]
async fn always_failing_jobs_end_in_dead_letter_queue() {
    let Some(pool) = test_pool("exhaust").await else { return };
    let store = PostgresJobStore::new(pool);
    for priority in [1, 1, 4, 4, 2] {
        store
            .enqueue(NewJob::new("notify", json!({})).with_priority(priority).with_max_attempts(3))
            .await
            .unwrap();
    }

    let w = worker("w1");
    for _pass in 0..3 {
        for _ in 0..5 {
            let job = store.claim(&w, &ClaimFilter::any()).await.unwrap().unwrap();
            store
                .fail(job.id, &w, "downstream 500", &BackoffPolicy::immediate())
                .await
                .unwrap();
        }
    }

    assert!(store.claim(&w, &ClaimFilter::any()).await.unwrap().is_none());
    let stats = store.stats().await.unwrap();
    assert_eq!(stats.pending + stats.processing + stats.completed, 0);
    assert_eq!(stats.dead_lettered, 5);

    let dead = store.list_dead_letters(10).await.unwrap();
    assert_eq!(dead.len(), 5);
    assert!(dead.iter().all(|e| e.attempts == 3 && e.last_error == "downstream 500"));
    for entry in &dead {
        assert!(store.get(entry.job_id).await.unwrap().is_none());
    }
}

#[tokio::test]
async fn failed_job_waits_for_its_backoff() {
    let Some(pool) = test_pool("backoff").await else { return };
    let store = PostgresJobStore::new(pool);
    let id = store.enqueue(NewJob::new("sync.push", json!({}))).await.unwrap();
    let w = worker("w1");

    store.claim(&w, &ClaimFilter::any()).await.unwrap().unwrap();
    let backoff = BackoffPolicy::new(Duration::from_secs(60), Duration::from_secs(60)).with_jitter(0.0);
    let outcome = store.fail(id, &w, "timeout", &backoff).await.unwrap();

    assert!(!outcome.is_dead_lettered());
    assert!(store.claim(&w, &ClaimFilter::any()).await.unwrap().is_none());
    let job = store.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.last_error.as_deref(), Some("timeout"));
}

#[tokio::test]
async fn completion_requires_the_claiming_worker() {
    let Some(pool) = test_pool("holder").await else { return };
    let store = PostgresJobStore::new(pool);
    let id = store.enqueue(NewJob::new("x", json!({}))).await.unwrap();
    store.claim(&worker("owner"), &ClaimFilter::any()).await.unwrap();

    let err = store.complete(id, &worker("intruder"), json!({})).await.unwrap_err();
    assert!(matches!(err, JobStoreError::NotHeld(_)));

    store.complete(id, &worker("owner"), json!({"ok": true})).await.unwrap();
    let job = store.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.result, Some(json!({"ok": true})));
}

#[tokio::test]
async fn stale_heartbeat_is_reaped() {
    let Some(pool) = test_pool("reap").await else { return };
    let store = PostgresJobStore::new(pool.clone());
    let retry = store.enqueue(NewJob::new("a", json!({})).with_max_attempts(3)).await.unwrap();
    let last = store.enqueue(NewJob::new("b", json!({})).with_max_attempts(1)).await.unwrap();
    let w = worker("crashed");
    store.claim(&w, &ClaimFilter::any()).await.unwrap();
    store.claim(&w, &ClaimFilter::any()).await.unwrap();

    sqlx::query("UPDATE jobs SET heartbeat_at = now() - interval '1 hour'")
        .execute(&pool)
        .await
        .unwrap();

    let report = store
        .reap_stale(Duration::from_secs(150), &BackoffPolicy::immediate())
        .await
        .unwrap();
    assert_eq!(report.requeued, vec![retry]);
    assert_eq!(report.dead_lettered, vec![last]);

    let job = store.get(retry).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 1);
}

#[tokio::test]
async fn dead_letter_can_be_requeued() {
    let Some(pool) = test_pool("requeue").await else { return };
    let store = PostgresJobStore::new(pool);
    let id = store
        .enqueue(NewJob::new("email.send", json!({"to": "a@b"})).with_max_attempts(1))
        .await
        .unwrap();
    let w = worker("w1");
    store.claim(&w, &ClaimFilter::any()).await.unwrap();
    store.fail(id, &w, "smtp down", &BackoffPolicy::immediate()).await.unwrap();

    let entry = store.list_dead_letters(1).await.unwrap().remove(0);
    let copy = store.requeue_dead_letter(entry.id).await.unwrap();
    assert_ne!(copy, id);

    let job = store.get(copy).await.unwrap().unwrap();
    assert_eq!(job.payload, json!({"to": "a@b"}));
    assert_eq!(job.attempts, 0);
    assert_eq!(store.list_dead_letters(10).await.unwrap().len(), 1);

    let missing = store.requeue_dead_letter(entry.id + 1000).await.unwrap_err();
    assert!(matches!(missing, JobStoreError::DeadLetterNotFound(_)));
}

#[tokio::test]
async fn sync_commit_is_idempotent_and_monotonic() {
    let Some(pool) = test_pool("sync").await else { return };
    let store = PostgresSyncStore::new(pool);
    let stream = StreamId::new("consignments").unwrap();

    let page = vec![
        RemoteRecord::new(10, json!({"id": 10, "status": "OPEN"})),
        RemoteRecord::new(11, json!({"id": 11, "status": "OPEN"})),
    ];
    let (summary, cursor) = store.commit_page(&stream, &page, 11).await.unwrap();
    assert_eq!((summary.inserted, summary.updated), (2, 0));
    assert_eq!(cursor.last_processed_id, 11);

    let replay = vec![RemoteRecord::new(10, json!({"id": 10, "status": "SENT"}))];
    let (summary, cursor) = store.commit_page(&stream, &replay, 10).await.unwrap();
    assert_eq!((summary.inserted, summary.updated), (0, 1));
    assert_eq!(cursor.last_processed_id, 11);

    let record = store.mirror_record(&stream, 10).await.unwrap().unwrap();
    assert_eq!(record.payload["status"], "SENT");

    store.reset_cursor(&stream).await.unwrap();
    assert_eq!(store.cursor(&stream).await.unwrap().unwrap().last_processed_id, 0);
}

#[tokio::test]
async fn cursor_store_only_moves_forward() {
    let Some(pool) = test_pool("cursor").await else { return };
    let cursors = PostgresCursorStore::new(pool);
    let stream = StreamId::new("products").unwrap();

    assert_eq!(cursors.position(&stream).await.unwrap(), 0);
    assert_eq!(cursors.advance(&stream, 40).await.unwrap().last_processed_id, 40);
    assert_eq!(cursors.advance(&stream, 25).await.unwrap().last_processed_id, 40);

    cursors.reset(&stream).await.unwrap();
    assert_eq!(cursors.position(&stream).await.unwrap(), 0);
}
