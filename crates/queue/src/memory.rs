//! In-memory queue backend.
//!
//! Serves two roles: the standalone backend when redis is unreachable at
//! startup, and the secondary that [`crate::RedisQueue`] degrades to during
//! an outage. Keeps the same total order as the sorted set: score band
//! first, then enqueue time, then arrival sequence.

use std::{
    collections::{BTreeMap, HashMap, hash_map::Entry},
    sync::{
        Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use tracing::debug;

use switchyard_common::{ChatRequest, QueuedRequest, ResponseEnvelope};

use crate::{QueueBackend, Result, score};

struct StoredResponse {
    envelope: ResponseEnvelope,
    stored_at: Instant,
}

pub struct MemoryQueue {
    /// Items keyed by `(score, arrival sequence)`; the sequence breaks ties
    /// between same-millisecond submissions.
    items: Mutex<BTreeMap<(u64, u64), QueuedRequest>>,
    seq: AtomicU64,
    responses: Mutex<HashMap<String, StoredResponse>>,
    response_expiry: Duration,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryQueue {
    #[must_use]
    pub fn new(response_expiry: Duration) -> Self {
        Self {
            items: Mutex::new(BTreeMap::new()),
            seq: AtomicU64::new(0),
            responses: Mutex::new(HashMap::new()),
            response_expiry,
        }
    }

    /// Insert an existing item with a precomputed score, preserving its id.
    /// Used when a redis write degrades mid-flight.
    pub(crate) fn insert_scored(&self, score: u64, item: QueuedRequest) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        lock(&self.items).insert((score, seq), item);
    }

    /// Pop the head of the total order without going through the async
    /// trait; the reconciliation drain uses this.
    pub(crate) fn pop_next(&self) -> Option<QueuedRequest> {
        lock(&self.items).pop_first().map(|(_, item)| item)
    }

    pub(crate) fn queued_len(&self) -> usize {
        lock(&self.items).len()
    }

    /// Look up a response without consuming it, evicting it when expired.
    pub(crate) fn response(&self, request_id: &str) -> Option<ResponseEnvelope> {
        let mut responses = lock(&self.responses);
        match responses.get(request_id) {
            Some(stored) if stored.stored_at.elapsed() < self.response_expiry => {
                Some(stored.envelope.clone())
            }
            Some(_) => {
                responses.remove(request_id);
                None
            }
            None => None,
        }
    }
}

#[async_trait::async_trait]
impl QueueBackend for MemoryQueue {
    async fn enqueue(&self, request: ChatRequest, priority: u8) -> Result<String> {
        let item = QueuedRequest::new(request, priority);
        let id = item.id.clone();
        self.insert_scored(score::fresh(item.priority, item.enqueued_at_ms), item);
        debug!(id, "queued request in memory");
        Ok(id)
    }

    async fn priority_enqueue(&self, item: QueuedRequest) -> Result<()> {
        debug!(id = item.id, "requeued request into memory retry band");
        self.insert_scored(score::retry(item.enqueued_at_ms), item);
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<QueuedRequest>> {
        Ok(self.pop_next())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.queued_len())
    }

    async fn store_response(&self, request_id: &str, envelope: &ResponseEnvelope) -> Result<()> {
        let mut responses = lock(&self.responses);
        if let Entry::Vacant(entry) = responses.entry(request_id.to_string()) {
            entry.insert(StoredResponse {
                envelope: envelope.clone(),
                stored_at: Instant::now(),
            });
        }
        Ok(())
    }

    async fn get_response(&self, request_id: &str) -> Result<Option<ResponseEnvelope>> {
        Ok(self.response(request_id))
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use switchyard_common::Message;

    fn request(model: &str) -> ChatRequest {
        ChatRequest {
            model: model.into(),
            messages: vec![Message::new("user", "hi")],
            temperature: None,
            max_tokens: None,
            top_p: None,
            response_format: None,
        }
    }

    fn queue() -> MemoryQueue {
        MemoryQueue::new(Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn dequeues_in_priority_then_fifo_order() {
        let q = queue();
        let low = q.enqueue(request("low"), 50).await.unwrap();
        let first = q.enqueue(request("first"), 10).await.unwrap();
        let second = q.enqueue(request("second"), 10).await.unwrap();

        let order: Vec<String> = [
            q.dequeue().await.unwrap().unwrap().id,
            q.dequeue().await.unwrap().unwrap().id,
            q.dequeue().await.unwrap().unwrap().id,
        ]
        .into();
        assert_eq!(order, vec![first, second, low]);
        assert!(q.dequeue().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn retry_band_precedes_fresh_items() {
        let q = queue();
        q.enqueue(request("fresh"), 0).await.unwrap();

        let mut retry = QueuedRequest::new(request("retry"), 10);
        retry.retry_count = 1;
        let retry_id = retry.id.clone();
        q.priority_enqueue(retry).await.unwrap();

        assert_eq!(q.dequeue().await.unwrap().unwrap().id, retry_id);
    }

    #[tokio::test]
    async fn retries_stay_fifo_by_enqueue_time() {
        let q = queue();
        let mut older = QueuedRequest::new(request("older"), 10);
        older.enqueued_at_ms -= 5_000;
        let older_id = older.id.clone();
        let newer = QueuedRequest::new(request("newer"), 10);

        q.priority_enqueue(newer).await.unwrap();
        q.priority_enqueue(older).await.unwrap();

        assert_eq!(q.dequeue().await.unwrap().unwrap().id, older_id);
    }

    #[tokio::test]
    async fn length_tracks_queued_items() {
        let q = queue();
        assert_eq!(q.len().await.unwrap(), 0);
        q.enqueue(request("a"), 10).await.unwrap();
        q.enqueue(request("b"), 10).await.unwrap();
        assert_eq!(q.len().await.unwrap(), 2);
        q.dequeue().await.unwrap();
        assert_eq!(q.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn first_stored_response_wins() {
        let q = queue();
        let winner = ResponseEnvelope::completed("grok", "grok-3-mini");
        let loser = ResponseEnvelope::timeout_error("late publish");

        q.store_response("req_1", &winner).await.unwrap();
        q.store_response("req_1", &loser).await.unwrap();

        let seen = q.get_response("req_1").await.unwrap().unwrap();
        assert!(seen.is_completed());
    }

    #[tokio::test]
    async fn responses_expire_after_the_ttl() {
        let q = MemoryQueue::new(Duration::ZERO);
        let envelope = ResponseEnvelope::completed("grok", "grok-3-mini");
        q.store_response("req_1", &envelope).await.unwrap();
        assert!(q.get_response("req_1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_response_is_pending() {
        let q = queue();
        assert!(q.get_response("req_missing").await.unwrap().is_none());
    }
}
