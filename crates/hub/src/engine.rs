//! Durable-ish delayed task substrate: one-shot tasks with tag-based
//! cancellation, at-least-once dispatch, and bounded retry with doubling
//! backoff.
//!
//! Cancellation only removes tasks still waiting to fire (or waiting
//! between retries); a body that has started runs to completion.  The
//! engine itself is in-process — restart durability comes from the caller
//! re-arming every active schedule at boot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cycle::TaskPayload;

pub type TaskId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Done,
    /// Run again after backoff, up to the engine's attempt limit.
    Retry,
}

#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// `attempt` starts at 1; `last_attempt` is true when the engine will
    /// not retry again regardless of the outcome.
    async fn run(&self, payload: &TaskPayload, attempt: u32, last_attempt: bool) -> TaskOutcome;
}

pub trait WorkEngine: Send + Sync {
    fn enqueue(&self, delay: Duration, tag: &str, payload: TaskPayload) -> TaskId;
    fn cancel_by_tag(&self, tag: &str);
}

// ---------------------------------------------------------------------------
// Tokio timer implementation
// ---------------------------------------------------------------------------

pub struct TimerEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    handler: OnceLock<Arc<dyn TaskHandler>>,
    tags: Mutex<HashMap<String, Vec<(TaskId, CancellationToken)>>>,
    next_id: AtomicU64,
    max_attempts: u32,
    retry_base: Duration,
}

impl TimerEngine {
    pub fn new(max_attempts: u32, retry_base: Duration) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                handler: OnceLock::new(),
                tags: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                max_attempts: max_attempts.max(1),
                retry_base,
            }),
        }
    }

    /// Install the task handler.  Must happen before the first task fires;
    /// a task firing without a handler is dropped with a warning.
    pub fn set_handler(&self, handler: Arc<dyn TaskHandler>) {
        if self.inner.handler.set(handler).is_err() {
            warn!("task handler already installed");
        }
    }

    /// Number of tasks still waiting under a tag (queued or between
    /// retries).  Running bodies are not counted.
    pub fn pending_for_tag(&self, tag: &str) -> usize {
        self.inner
            .tags
            .lock()
            .map(|tags| tags.get(tag).map_or(0, Vec::len))
            .unwrap_or(0)
    }
}

impl EngineInner {
    fn register(&self, tag: &str, id: TaskId, token: CancellationToken) {
        if let Ok(mut tags) = self.tags.lock() {
            tags.entry(tag.to_string()).or_default().push((id, token));
        }
    }

    fn deregister(&self, tag: &str, id: TaskId) {
        if let Ok(mut tags) = self.tags.lock() {
            if let Some(entries) = tags.get_mut(tag) {
                entries.retain(|(task_id, _)| *task_id != id);
                if entries.is_empty() {
                    tags.remove(tag);
                }
            }
        }
    }
}

impl WorkEngine for TimerEngine {
    fn enqueue(&self, delay: Duration, tag: &str, payload: TaskPayload) -> TaskId {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        self.inner.register(tag, id, token.clone());

        debug!(task = id, %tag, delay_secs = delay.as_secs(), "task enqueued");

        let inner = Arc::clone(&self.inner);
        let tag = tag.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    inner.deregister(&tag, id);
                    debug!(task = id, %tag, "task cancelled while queued");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            let Some(handler) = inner.handler.get().cloned() else {
                inner.deregister(&tag, id);
                warn!(task = id, %tag, "task fired with no handler installed");
                return;
            };

            let mut attempt: u32 = 1;
            loop {
                // The body is never interrupted; the task only leaves the
                // cancellable set while it runs.
                inner.deregister(&tag, id);
                let last_attempt = attempt >= inner.max_attempts;

                match handler.run(&payload, attempt, last_attempt).await {
                    TaskOutcome::Done => return,
                    TaskOutcome::Retry if last_attempt => {
                        warn!(task = id, %tag, attempt, "task exhausted retries");
                        return;
                    }
                    TaskOutcome::Retry => {
                        let backoff = inner.retry_base * 2u32.saturating_pow(attempt - 1);
                        debug!(
                            task = id, %tag, attempt,
                            backoff_secs = backoff.as_secs(),
                            "task will retry"
                        );
                        // Between retries the task is cancellable again.
                        inner.register(&tag, id, token.clone());
                        tokio::select! {
                            _ = token.cancelled() => {
                                inner.deregister(&tag, id);
                                debug!(task = id, %tag, "task cancelled between retries");
                                return;
                            }
                            _ = tokio::time::sleep(backoff) => {}
                        }
                        attempt += 1;
                    }
                }
            }
        });

        id
    }

    fn cancel_by_tag(&self, tag: &str) {
        let entries = match self.inner.tags.lock() {
            Ok(mut tags) => tags.remove(tag),
            Err(_) => None,
        };
        if let Some(entries) = entries {
            debug!(%tag, count = entries.len(), "cancelling queued tasks");
            for (_, token) in entries {
                token.cancel();
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
