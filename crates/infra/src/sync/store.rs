//! Storage for the incremental poller: mirror rows plus the stream cursor.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::instrument;

use jobsync_core::StreamId;

use super::cursor_store::{self, Cursor, CursorStore, InMemoryCursorStore};
use super::mirror::{self, InMemoryMirror, MirrorRecord, RemoteRecord, UpsertSummary};

#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncStoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Everything the poller persists.
#[async_trait]
pub trait SyncStore: Send + Sync {
    async fn cursor(&self, stream: &StreamId) -> Result<Option<Cursor>, SyncStoreError>;

    /// Upsert one page of records and advance the cursor to `new_cursor`.
    ///
    /// After an error the cursor is never ahead of the mirrored data.
    async fn commit_page(
        &self,
        stream: &StreamId,
        records: &[RemoteRecord],
        new_cursor: i64,
    ) -> Result<(UpsertSummary, Cursor), SyncStoreError>;

    async fn reset_cursor(&self, stream: &StreamId) -> Result<(), SyncStoreError>;

    async fn mirror_record(
        &self,
        stream: &StreamId,
        external_id: i64,
    ) -> Result<Option<MirrorRecord>, SyncStoreError>;
}

#[async_trait]
impl<T: SyncStore + ?Sized> SyncStore for Arc<T> {
    async fn cursor(&self, stream: &StreamId) -> Result<Option<Cursor>, SyncStoreError> {
        (**self).cursor(stream).await
    }

    async fn commit_page(
        &self,
        stream: &StreamId,
        records: &[RemoteRecord],
        new_cursor: i64,
    ) -> Result<(UpsertSummary, Cursor), SyncStoreError> {
        (**self).commit_page(stream, records, new_cursor).await
    }

    async fn reset_cursor(&self, stream: &StreamId) -> Result<(), SyncStoreError> {
        (**self).reset_cursor(stream).await
    }

    async fn mirror_record(
        &self,
        stream: &StreamId,
        external_id: i64,
    ) -> Result<Option<MirrorRecord>, SyncStoreError> {
        (**self).mirror_record(stream, external_id).await
    }
}

/// In-memory sync store for tests/dev.
///
/// Commits in two steps (upsert, then cursor), like a non-transactional
/// store would, and can be told to fail cursor writes to simulate a crash
/// between the two.
#[derive(Debug, Default)]
pub struct InMemorySyncStore {
    pub cursors: InMemoryCursorStore,
    pub mirror: InMemoryMirror,
    failing_cursor_writes: AtomicU32,
}

impl InMemorySyncStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` cursor writes fail after the records were upserted.
    pub fn fail_cursor_writes(&self, count: u32) {
        self.failing_cursor_writes.store(count, Ordering::SeqCst);
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_cursor_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl SyncStore for InMemorySyncStore {
    async fn cursor(&self, stream: &StreamId) -> Result<Option<Cursor>, SyncStoreError> {
        self.cursors.load(stream).await
    }

    async fn commit_page(
        &self,
        stream: &StreamId,
        records: &[RemoteRecord],
        new_cursor: i64,
    ) -> Result<(UpsertSummary, Cursor), SyncStoreError> {
        let summary = self.mirror.upsert(stream, records);
        if self.take_injected_failure() {
            return Err(SyncStoreError::Storage(format!(
                "injected cursor write failure for stream {stream}"
            )));
        }
        let cursor = self.cursors.advance(stream, new_cursor).await?;
        Ok((summary, cursor))
    }

    async fn reset_cursor(&self, stream: &StreamId) -> Result<(), SyncStoreError> {
        self.cursors.reset(stream).await
    }

    async fn mirror_record(
        &self,
        stream: &StreamId,
        external_id: i64,
    ) -> Result<Option<MirrorRecord>, SyncStoreError> {
        Ok(self.mirror.get(stream, external_id))
    }
}

/// Postgres-backed sync store. A page and its cursor commit in one transaction.
#[derive(Debug, Clone)]
pub struct PostgresSyncStore {
    pool: Arc<PgPool>,
}

impl PostgresSyncStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl SyncStore for PostgresSyncStore {
    async fn cursor(&self, stream: &StreamId) -> Result<Option<Cursor>, SyncStoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("cursor", e))?;
        cursor_store::load_cursor(&mut conn, stream).await
    }

    #[instrument(skip(self, stream, records), fields(stream = %stream, records = records.len()), err)]
    async fn commit_page(
        &self,
        stream: &StreamId,
        records: &[RemoteRecord],
        new_cursor: i64,
    ) -> Result<(UpsertSummary, Cursor), SyncStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("commit_page", e))?;

        let summary = mirror::upsert_records(&mut tx, stream, records).await?;
        let cursor = cursor_store::advance_cursor(&mut tx, stream, new_cursor).await?;

        tx.commit().await.map_err(|e| map_sqlx_error("commit_page", e))?;
        Ok((summary, cursor))
    }

    #[instrument(skip(self, stream), fields(stream = %stream), err)]
    async fn reset_cursor(&self, stream: &StreamId) -> Result<(), SyncStoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("reset_cursor", e))?;
        cursor_store::reset_cursor(&mut conn, stream).await
    }

    async fn mirror_record(
        &self,
        stream: &StreamId,
        external_id: i64,
    ) -> Result<Option<MirrorRecord>, SyncStoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("mirror_record", e))?;
        mirror::load_record(&mut conn, stream, external_id).await
    }
}

pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> SyncStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            SyncStoreError::Database(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::ColumnNotFound(_) | sqlx::Error::Decode(_) => {
            SyncStoreError::Storage(format!("failed to decode row in {}: {}", operation, err))
        }
        sqlx::Error::PoolClosed => {
            SyncStoreError::Database(format!("connection pool closed in {}", operation))
        }
        _ => SyncStoreError::Database(format!("sqlx error in {}: {}", operation, err)),
    }
}
