//! Local mirror of remote records.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, Row};

use jobsync_core::StreamId;

use super::store::{map_sqlx_error, SyncStoreError};

/// A record as returned by the external system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    /// External identifier; streams are ordered by it
    pub id: i64,
    /// All mutable fields of the record
    pub payload: serde_json::Value,
}

impl RemoteRecord {
    pub fn new(id: i64, payload: serde_json::Value) -> Self {
        Self { id, payload }
    }
}

/// Local copy of a remote record, keyed by `(stream_id, external_id)`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MirrorRecord {
    pub stream_id: StreamId,
    pub external_id: i64,
    pub payload: serde_json::Value,
    pub first_synced_at: DateTime<Utc>,
    pub last_synced_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertSummary {
    pub inserted: u64,
    pub updated: u64,
}

impl UpsertSummary {
    pub fn total(&self) -> u64 {
        self.inserted + self.updated
    }
}

/// In-memory mirror table for tests/dev.
#[derive(Debug, Default, Clone)]
pub struct InMemoryMirror {
    records: Arc<Mutex<BTreeMap<(StreamId, i64), MirrorRecord>>>,
}

impl InMemoryMirror {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> MutexGuard<'_, BTreeMap<(StreamId, i64), MirrorRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Idempotent upsert: replaying the same records only refreshes payloads.
    pub fn upsert(&self, stream: &StreamId, records: &[RemoteRecord]) -> UpsertSummary {
        let mut table = self.records();
        let now = Utc::now();
        let mut summary = UpsertSummary::default();

        for record in records {
            match table.get_mut(&(stream.clone(), record.id)) {
                Some(existing) => {
                    existing.payload = record.payload.clone();
                    existing.last_synced_at = now;
                    summary.updated += 1;
                }
                None => {
                    table.insert(
                        (stream.clone(), record.id),
                        MirrorRecord {
                            stream_id: stream.clone(),
                            external_id: record.id,
                            payload: record.payload.clone(),
                            first_synced_at: now,
                            last_synced_at: now,
                        },
                    );
                    summary.inserted += 1;
                }
            }
        }
        summary
    }

    pub fn get(&self, stream: &StreamId, external_id: i64) -> Option<MirrorRecord> {
        self.records().get(&(stream.clone(), external_id)).cloned()
    }

    /// Mirrored records of a stream, ordered by external id.
    pub fn list(&self, stream: &StreamId) -> Vec<MirrorRecord> {
        self.records()
            .values()
            .filter(|r| &r.stream_id == stream)
            .cloned()
            .collect()
    }
}

/// Upsert a page into `sync_mirror_records` on an open connection or transaction.
pub(crate) async fn upsert_records(
    conn: &mut PgConnection,
    stream: &StreamId,
    records: &[RemoteRecord],
) -> Result<UpsertSummary, SyncStoreError> {
    let mut summary = UpsertSummary::default();

    for record in records {
        // `xmax = 0` only for rows created by this statement.
        let row = sqlx::query(
            r#"
            INSERT INTO sync_mirror_records (stream_id, external_id, payload, first_synced_at, last_synced_at)
            VALUES ($1, $2, $3, now(), now())
            ON CONFLICT (stream_id, external_id)
            DO UPDATE SET
                payload = EXCLUDED.payload,
                last_synced_at = now()
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(stream.as_str())
        .bind(record.id)
        .bind(&record.payload)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("upsert_mirror_record", e))?;

        let inserted: bool = row
            .try_get("inserted")
            .map_err(|e| map_sqlx_error("upsert_mirror_record", e))?;
        if inserted {
            summary.inserted += 1;
        } else {
            summary.updated += 1;
        }
    }

    Ok(summary)
}

pub(crate) async fn load_record(
    conn: &mut PgConnection,
    stream: &StreamId,
    external_id: i64,
) -> Result<Option<MirrorRecord>, SyncStoreError> {
    let row = sqlx::query(
        r#"
        SELECT external_id, payload, first_synced_at, last_synced_at
        FROM sync_mirror_records
        WHERE stream_id = $1 AND external_id = $2
        "#,
    )
    .bind(stream.as_str())
    .bind(external_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("load_mirror_record", e))?;

    let Some(row) = row else {
        return Ok(None);
    };
    let decode = |e| map_sqlx_error("load_mirror_record", e);
    Ok(Some(MirrorRecord {
        stream_id: stream.clone(),
        external_id: row.try_get("external_id").map_err(decode)?,
        payload: row.try_get("payload").map_err(decode)?,
        first_synced_at: row.try_get("first_synced_at").map_err(decode)?,
        last_synced_at: row.try_get("last_synced_at").map_err(decode)?,
    }))
}
