//! Sync cursor persistence.
//!
//! A cursor records the highest external id that has been durably mirrored
//! for a stream. It only moves forward; the single exception is an explicit
//! reset back to the origin for a full resync.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};

use jobsync_core::StreamId;

use super::store::{map_sqlx_error, SyncStoreError};

/// Cursor value before anything has been synced. Remote ids are positive.
pub const CURSOR_ORIGIN: i64 = 0;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Cursor {
    pub stream_id: StreamId,
    pub last_processed_id: i64,
    pub last_processed_at: DateTime<Utc>,
}

#[async_trait]
pub trait CursorStore: Send + Sync {
    /// Current cursor, `None` if the stream has never committed a page.
    async fn load(&self, stream: &StreamId) -> Result<Option<Cursor>, SyncStoreError>;

    /// Move the cursor forward to `last_processed_id`. A lower value leaves the
    /// stored cursor unchanged. Returns the cursor as stored.
    async fn advance(&self, stream: &StreamId, last_processed_id: i64) -> Result<Cursor, SyncStoreError>;

    /// Reset the cursor to [`CURSOR_ORIGIN`].
    async fn reset(&self, stream: &StreamId) -> Result<(), SyncStoreError>;

    /// Cursor id, or the origin for a stream that has never synced.
    async fn position(&self, stream: &StreamId) -> Result<i64, SyncStoreError> {
        Ok(self
            .load(stream)
            .await?
            .map_or(CURSOR_ORIGIN, |c| c.last_processed_id))
    }
}

/// In-memory cursor store for tests/dev.
#[derive(Debug, Default, Clone)]
pub struct InMemoryCursorStore {
    cursors: Arc<Mutex<HashMap<StreamId, Cursor>>>,
}

impl InMemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn cursors(&self) -> MutexGuard<'_, HashMap<StreamId, Cursor>> {
        self.cursors.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl CursorStore for InMemoryCursorStore {
    async fn load(&self, stream: &StreamId) -> Result<Option<Cursor>, SyncStoreError> {
        Ok(self.cursors().get(stream).cloned())
    }

    async fn advance(&self, stream: &StreamId, last_processed_id: i64) -> Result<Cursor, SyncStoreError> {
        let mut cursors = self.cursors();
        let now = Utc::now();
        let cursor = cursors.entry(stream.clone()).or_insert_with(|| Cursor {
            stream_id: stream.clone(),
            last_processed_id: CURSOR_ORIGIN,
            last_processed_at: now,
        });
        if last_processed_id > cursor.last_processed_id {
            cursor.last_processed_id = last_processed_id;
            cursor.last_processed_at = now;
        }
        Ok(cursor.clone())
    }

    async fn reset(&self, stream: &StreamId) -> Result<(), SyncStoreError> {
        self.cursors().insert(
            stream.clone(),
            Cursor {
                stream_id: stream.clone(),
                last_processed_id: CURSOR_ORIGIN,
                last_processed_at: Utc::now(),
            },
        );
        Ok(())
    }
}

/// Postgres-backed cursor store (`sync_cursors`).
#[derive(Debug, Clone)]
pub struct PostgresCursorStore {
    pool: Arc<PgPool>,
}

impl PostgresCursorStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl CursorStore for PostgresCursorStore {
    async fn load(&self, stream: &StreamId) -> Result<Option<Cursor>, SyncStoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("load_cursor", e))?;
        load_cursor(&mut conn, stream).await
    }

    async fn advance(&self, stream: &StreamId, last_processed_id: i64) -> Result<Cursor, SyncStoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("advance_cursor", e))?;
        advance_cursor(&mut conn, stream, last_processed_id).await
    }

    async fn reset(&self, stream: &StreamId) -> Result<(), SyncStoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("reset_cursor", e))?;
        reset_cursor(&mut conn, stream).await
    }
}

pub(crate) async fn load_cursor(
    conn: &mut PgConnection,
    stream: &StreamId,
) -> Result<Option<Cursor>, SyncStoreError> {
    let row = sqlx::query(
        r#"
        SELECT stream_id, last_processed_id, last_processed_at
        FROM sync_cursors
        WHERE stream_id = $1
        "#,
    )
    .bind(stream.as_str())
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("load_cursor", e))?;

    row.map(|r| cursor_from_row(&r, stream)).transpose()
}

pub(crate) async fn advance_cursor(
    conn: &mut PgConnection,
    stream: &StreamId,
    last_processed_id: i64,
) -> Result<Cursor, SyncStoreError> {
    // A lower id never overwrites a higher one.
    let row = sqlx::query(
        r#"
        INSERT INTO sync_cursors (stream_id, last_processed_id, last_processed_at)
        VALUES ($1, $2, now())
        ON CONFLICT (stream_id)
        DO UPDATE SET
            last_processed_id = GREATEST(sync_cursors.last_processed_id, EXCLUDED.last_processed_id),
            last_processed_at = now()
        RETURNING stream_id, last_processed_id, last_processed_at
        "#,
    )
    .bind(stream.as_str())
    .bind(last_processed_id)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("advance_cursor", e))?;

    cursor_from_row(&row, stream)
}

pub(crate) async fn reset_cursor(conn: &mut PgConnection, stream: &StreamId) -> Result<(), SyncStoreError> {
    sqlx::query(
        r#"
        INSERT INTO sync_cursors (stream_id, last_processed_id, last_processed_at)
        VALUES ($1, 0, now())
        ON CONFLICT (stream_id)
        DO UPDATE SET last_processed_id = 0, last_processed_at = now()
        "#,
    )
    .bind(stream.as_str())
    .execute(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("reset_cursor", e))?;
    Ok(())
}

fn cursor_from_row(row: &PgRow, stream: &StreamId) -> Result<Cursor, SyncStoreError> {
    Ok(Cursor {
        stream_id: stream.clone(),
        last_processed_id: row
            .try_get("last_processed_id")
            .map_err(|e| map_sqlx_error("decode_cursor", e))?,
        last_processed_at: row
            .try_get("last_processed_at")
            .map_err(|e| map_sqlx_error("decode_cursor", e))?,
    })
}
