//! Incremental sync of external record streams into a local mirror.

pub mod client;
pub mod cursor_store;
pub mod mirror;
pub mod poller;
pub mod store;

pub use client::{ApiError, ExternalApi, HttpApiConfig, HttpExternalApi, Page, PageRequest};
pub use cursor_store::{Cursor, CursorStore, InMemoryCursorStore, PostgresCursorStore, CURSOR_ORIGIN};
pub use mirror::{InMemoryMirror, MirrorRecord, RemoteRecord, UpsertSummary};
pub use poller::{IncrementalPoller, PollError, PollReport, PollerConfig, DEFAULT_PAGE_SIZE};
pub use store::{InMemorySyncStore, PostgresSyncStore, SyncStore, SyncStoreError};
