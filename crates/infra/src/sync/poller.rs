//! Incremental cursor-based poller.
//!
//! Pulls an ordered remote stream page by page, mirrors each page locally and
//! advances the stream cursor only after the page is stored. A crash at any
//! point leaves the cursor at the last fully committed page; replaying a page
//! is harmless because the mirror upsert is idempotent.

use std::collections::HashMap;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use jobsync_core::StreamId;

use super::client::{ApiError, ExternalApi, PageRequest};
use super::cursor_store::CURSOR_ORIGIN;
use super::store::{SyncStore, SyncStoreError};

pub const DEFAULT_PAGE_SIZE: u32 = 200;

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub page_size: u32,
    /// API path per stream; streams without an entry use their own name.
    pub paths: HashMap<StreamId, String>,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            paths: HashMap::new(),
        }
    }
}

impl PollerConfig {
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_path(mut self, stream: StreamId, path: impl Into<String>) -> Self {
        self.paths.insert(stream, path.into());
        self
    }

    pub fn path_for<'a>(&'a self, stream: &'a StreamId) -> &'a str {
        self.paths
            .get(stream)
            .map(String::as_str)
            .unwrap_or_else(|| stream.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PollReport {
    pub pages_fetched: u32,
    pub records_seen: u64,
    pub inserted: u64,
    pub updated: u64,
    /// Records at or below the cursor that the API returned anyway.
    pub skipped: u64,
    pub cursor_before: i64,
    pub cursor_after: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error("external API error: {0}")]
    Api(#[from] ApiError),
    #[error("sync store error: {0}")]
    Store(#[from] SyncStoreError),
    #[error("page size must be positive")]
    InvalidPageSize,
}

pub struct IncrementalPoller<A: ExternalApi, S: SyncStore> {
    api: A,
    store: S,
    config: PollerConfig,
}

impl<A: ExternalApi, S: SyncStore> IncrementalPoller<A, S> {
    pub fn new(api: A, store: S, config: PollerConfig) -> Self {
        Self { api, store, config }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &PollerConfig {
        &self.config
    }

    /// Poll with the configured page size.
    pub async fn poll_stream(&self, stream: &StreamId, full_resync: bool) -> Result<PollReport, PollError> {
        self.poll(stream, self.config.page_size, full_resync).await
    }

    /// Sync `stream` from its cursor until the API reports no more records.
    #[instrument(skip(self, stream), fields(stream = %stream), err)]
    pub async fn poll(
        &self,
        stream: &StreamId,
        page_size: u32,
        full_resync: bool,
    ) -> Result<PollReport, PollError> {
        if page_size == 0 {
            return Err(PollError::InvalidPageSize);
        }
        if full_resync {
            info!("full resync requested, resetting cursor");
            self.store.reset_cursor(stream).await?;
        }

        let mut cursor = self
            .store
            .cursor(stream)
            .await?
            .map_or(CURSOR_ORIGIN, |c| c.last_processed_id);
        let mut report = PollReport {
            cursor_before: cursor,
            cursor_after: cursor,
            ..PollReport::default()
        };
        let path = self.config.path_for(stream);

        loop {
            let page = self
                .api
                .get(path, PageRequest { after: cursor, page_size })
                .await?;
            report.pages_fetched += 1;
            report.records_seen += page.records.len() as u64;

            if page.records.is_empty() {
                debug!(cursor, "empty page");
                break;
            }

            let (fresh, stale): (Vec<_>, Vec<_>) =
                page.records.into_iter().partition(|r| r.id > cursor);
            if !stale.is_empty() {
                warn!(
                    cursor,
                    skipped = stale.len(),
                    "API returned records at or below the cursor; ignoring them"
                );
                report.skipped += stale.len() as u64;
            }

            if let Some(page_max) = fresh.iter().map(|r| r.id).max() {
                let (summary, stored) = self.store.commit_page(stream, &fresh, page_max).await?;
                report.inserted += summary.inserted;
                report.updated += summary.updated;
                cursor = stored.last_processed_id;
                report.cursor_after = cursor;
                debug!(
                    cursor,
                    inserted = summary.inserted,
                    updated = summary.updated,
                    "page committed"
                );
            } else if page.has_more {
                // Nothing above the cursor and the API claims more: it is not
                // honouring `after`, so stop instead of refetching forever.
                warn!(cursor, "page contained no new records, stopping");
                break;
            }

            if !page.has_more {
                break;
            }
        }

        info!(
            pages = report.pages_fetched,
            inserted = report.inserted,
            updated = report.updated,
            skipped = report.skipped,
            cursor_before = report.cursor_before,
            cursor_after = report.cursor_after,
            "poll finished"
        );
        Ok(report)
    }
}
