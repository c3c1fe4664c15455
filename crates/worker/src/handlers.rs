//! Job handlers built into the `jobsync` binary.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use jobsync_core::StreamId;
use jobsync_infra::jobs::{HandlerRegistry, JobContext, JobHandler};
use jobsync_infra::sync::{ExternalApi, IncrementalPoller, SyncStore};

pub const SYNC_POLL_JOB: &str = "sync.poll";

#[derive(Debug, Deserialize)]
struct SyncPollPayload {
    stream: StreamId,
    #[serde(default)]
    full_resync: bool,
    page_size: Option<u32>,
}

/// Runs the incremental poller for the stream named in the payload.
///
/// Payload: `{"stream": "consignments", "full_resync": false, "page_size": 200}`.
/// Re-running it is safe; the mirror upsert is idempotent.
pub struct SyncPollHandler<A: ExternalApi, S: SyncStore> {
    poller: Arc<IncrementalPoller<A, S>>,
}

impl<A: ExternalApi, S: SyncStore> SyncPollHandler<A, S> {
    pub fn new(poller: Arc<IncrementalPoller<A, S>>) -> Self {
        Self { poller }
    }
}

#[async_trait]
impl<A, S> JobHandler for SyncPollHandler<A, S>
where
    A: ExternalApi + 'static,
    S: SyncStore + 'static,
{
    async fn handle(&self, payload: &Value, ctx: &JobContext) -> anyhow::Result<Value> {
        let request: SyncPollPayload = serde_json::from_value(payload.clone())
            .with_context(|| format!("invalid {SYNC_POLL_JOB} payload for job {}", ctx.job_id))?;
        let page_size = request
            .page_size
            .unwrap_or(self.poller.config().page_size);

        let report = self
            .poller
            .poll(&request.stream, page_size, request.full_resync)
            .await?;
        Ok(serde_json::to_value(report)?)
    }
}

/// Registry used by the worker commands. `sync.poll` is only available when
/// a poller could be built from the configuration.
pub fn registry<A, S>(poller: Option<Arc<IncrementalPoller<A, S>>>) -> HandlerRegistry
where
    A: ExternalApi + 'static,
    S: SyncStore + 'static,
{
    let mut registry = HandlerRegistry::new();
    if let Some(poller) = poller {
        registry.register(SYNC_POLL_JOB, SyncPollHandler::new(poller));
    }
    registry
}
