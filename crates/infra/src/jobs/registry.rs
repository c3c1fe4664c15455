//! Job handler registry.
//!
//! Maps `job_type` strings to handlers. Lookup order: exact name, then the
//! longest matching `prefix.*` pattern (e.g. `"email.*"` matches
//! `"email.send"`), then the `"*"` fallback. A miss is a job-level failure,
//! decided by the worker.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use jobsync_core::{JobId, WorkerId};

use super::types::Job;

/// What a handler knows about the attempt it is running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobContext {
    pub job_id: JobId,
    pub job_type: String,
    /// 1-indexed attempt number of this execution
    pub attempt: i32,
    pub max_attempts: i32,
    pub worker_id: WorkerId,
}

impl JobContext {
    pub fn for_job(job: &Job, worker_id: &WorkerId) -> Self {
        Self {
            job_id: job.id,
            job_type: job.job_type.clone(),
            attempt: job.current_attempt(),
            max_attempts: job.max_attempts,
            worker_id: worker_id.clone(),
        }
    }

    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Business logic for one family of job types.
///
/// Delivery is at-least-once: a job whose worker died mid-run is executed
/// again, so handlers must tolerate re-invocation with the same payload.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run the job. `Ok` carries the result payload stored on the job row.
    async fn handle(&self, payload: &Value, ctx: &JobContext) -> anyhow::Result<Value>;
}

/// Adapter turning an async closure into a [`JobHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(Value, JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    async fn handle(&self, payload: &Value, ctx: &JobContext) -> anyhow::Result<Value> {
        (self.0)(payload.clone(), ctx.clone()).await
    }
}

#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under an exact name, a `prefix.*` pattern or `*`.
    pub fn register(&mut self, pattern: impl Into<String>, handler: impl JobHandler + 'static) {
        self.handlers.insert(pattern.into(), Arc::new(handler));
    }

    pub fn register_fn<F, Fut>(&mut self, pattern: impl Into<String>, handler: F)
    where
        F: Fn(Value, JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.register(pattern, FnHandler(handler));
    }

    pub fn with_fn<F, Fut>(mut self, pattern: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Value, JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.register_fn(pattern, handler);
        self
    }

    /// Resolve the handler for a job type.
    pub fn resolve(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        if let Some(h) = self.handlers.get(job_type) {
            return Some(h.clone());
        }

        let category = self
            .handlers
            .iter()
            .filter_map(|(pattern, handler)| {
                let prefix = pattern.strip_suffix(".*")?;
                let rest = job_type.strip_prefix(prefix)?;
                rest.starts_with('.').then_some((prefix.len(), handler))
            })
            .max_by_key(|(len, _)| *len);
        if let Some((_, handler)) = category {
            return Some(handler.clone());
        }

        self.handlers.get("*").cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Registered patterns, sorted.
    pub fn patterns(&self) -> Vec<&str> {
        let mut patterns: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        patterns.sort_unstable();
        patterns
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("patterns", &self.patterns())
            .finish()
    }
}
