//! Prioritized request queue with a persistent redis backend, an in-memory
//! secondary for outages, and background reconciliation.
//!
//! Two backends implement one [`QueueBackend`] contract. [`RedisQueue`] is
//! the production backend: a sorted set ordered by a composite
//! priority/timestamp score plus `response:{id}` strings with a TTL. When
//! redis stays unreachable through the retry budget the queue degrades to
//! its [`MemoryQueue`] secondary and a reconciliation task drains the
//! secondary back once redis recovers. [`MemoryQueue`] doubles as the
//! standalone backend when redis is already down at startup.

mod error;
mod memory;
mod redis_queue;
pub mod score;

use std::{sync::Arc, time::Duration};

use tracing::{info, warn};

pub use {
    error::{QueueError, Result},
    memory::MemoryQueue,
    redis_queue::RedisQueue,
};

use switchyard_common::{ChatRequest, QueuedRequest, ResponseEnvelope};

/// The queue contract consumed by the gateway and the dispatcher.
///
/// `store_response` is first-write-wins: the first terminal envelope stored
/// for an id is the one observed, later stores are no-ops.
#[async_trait::async_trait]
pub trait QueueBackend: Send + Sync {
    /// Add a fresh submission; returns the generated request id.
    async fn enqueue(&self, request: ChatRequest, priority: u8) -> Result<String>;

    /// Re-queue an existing item into the retry band, ahead of all fresh
    /// submissions.
    async fn priority_enqueue(&self, item: QueuedRequest) -> Result<()>;

    /// Pop the head of the total order, or `None` when empty. Bounded to
    /// roughly two seconds even while the backend is failing.
    async fn dequeue(&self) -> Result<Option<QueuedRequest>>;

    /// Number of queued items.
    async fn len(&self) -> Result<usize>;

    /// Publish the terminal envelope for `request_id` (idempotent).
    async fn store_response(&self, request_id: &str, envelope: &ResponseEnvelope) -> Result<()>;

    /// Fetch the terminal envelope, or `None` while pending or after TTL
    /// expiry. Bounded to roughly three seconds.
    async fn get_response(&self, request_id: &str) -> Result<Option<ResponseEnvelope>>;
}

/// Connect the production backend, falling back to a pure in-memory queue
/// when redis is unreachable at startup.
pub async fn connect(
    redis_url: &str,
    queue_key: &str,
    response_expiry: Duration,
) -> Arc<dyn QueueBackend> {
    match RedisQueue::connect(redis_url, queue_key, response_expiry).await {
        Ok(queue) => {
            info!(url = redis_url, "connected to redis queue backend");
            Arc::new(queue)
        }
        Err(err) => {
            warn!(%err, "redis unreachable at startup, using in-memory queue");
            Arc::new(MemoryQueue::new(response_expiry))
        }
    }
}
