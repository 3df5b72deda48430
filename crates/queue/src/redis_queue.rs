//! Redis-backed queue with outage degradation and reconciliation.
//!
//! Every operation follows the same discipline: check the connection with a
//! ping, run the command, and retry up to [`OP_ATTEMPTS`] times with a
//! growing backoff, reconnecting between attempts. Connection failures that
//! survive the retry budget flip the queue into degraded mode: operations
//! route to the in-memory secondary and a background task keeps pinging
//! redis until it can drain the secondary back.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use {
    redis::{ErrorKind, aio::MultiplexedConnection},
    tokio::time::{sleep, timeout},
    tracing::{debug, error, info, warn},
};

use switchyard_common::{ChatRequest, QueuedRequest, ResponseEnvelope, unix_ms};

use crate::{MemoryQueue, QueueBackend, QueueError, Result, score};

/// Attempts per operation before degrading or propagating.
const OP_ATTEMPTS: u32 = 3;
/// Base backoff between attempts; multiplied by the attempt number.
const OP_BACKOFF: Duration = Duration::from_millis(500);
/// Budget for establishing or checking a connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
/// `dequeue` must come back within this bound even mid-outage.
const DEQUEUE_DEADLINE: Duration = Duration::from_secs(2);
/// `get_response` ceiling.
const RESPONSE_DEADLINE: Duration = Duration::from_secs(3);
/// Reconciliation ping backoff bounds.
const RECONCILE_BACKOFF_START: Duration = Duration::from_secs(1);
const RECONCILE_BACKOFF_CAP: Duration = Duration::from_secs(10);

const RESPONSE_PREFIX: &str = "response:";

pub struct RedisQueue {
    client: redis::Client,
    conn: Arc<tokio::sync::Mutex<Option<MultiplexedConnection>>>,
    queue_key: String,
    response_expiry: Duration,
    /// Always-allocated secondary. While `degraded` is set, operations route
    /// here; afterwards its responses stay readable for the rest of the
    /// process lifetime (outage-era responses are not migrated).
    secondary: Arc<MemoryQueue>,
    degraded: Arc<AtomicBool>,
    reconciling: Arc<AtomicBool>,
}

/// Outcome of a redis command after the retry budget.
enum RunError {
    /// Connection failures exhausted the budget; the caller should route
    /// the operation to the secondary.
    Degraded,
    /// A non-connection backend error (auth, wrong type, bad input).
    Fatal(QueueError),
}

fn is_connection_error(err: &redis::RedisError) -> bool {
    err.is_connection_refusal() || err.is_connection_dropped() || err.is_io_error() || err.is_timeout()
}

/// Errors that retrying cannot fix: propagate them to the caller.
fn propagates_immediately(err: &redis::RedisError) -> bool {
    matches!(
        err.kind(),
        ErrorKind::AuthenticationFailed | ErrorKind::TypeError | ErrorKind::ResponseError
    )
}

impl RedisQueue {
    /// Connect and verify the backend with a ping.
    pub async fn connect(
        redis_url: &str,
        queue_key: &str,
        response_expiry: Duration,
    ) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let mut conn = timeout(CONNECT_TIMEOUT, client.get_multiplexed_async_connection())
            .await
            .map_err(|_| timeout_error("redis connect timed out"))??;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;

        Ok(Self {
            client,
            conn: Arc::new(tokio::sync::Mutex::new(Some(conn))),
            queue_key: queue_key.to_string(),
            response_expiry,
            secondary: Arc::new(MemoryQueue::new(response_expiry)),
            degraded: Arc::new(AtomicBool::new(false)),
            reconciling: Arc::new(AtomicBool::new(false)),
        })
    }

    fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// A pinged connection, reconnecting if the cached one is gone or dead.
    async fn live_connection(&self) -> std::result::Result<MultiplexedConnection, redis::RedisError> {
        let cached = self.conn.lock().await.clone();
        if let Some(mut conn) = cached {
            let ping: std::result::Result<String, _> = timeout(
                CONNECT_TIMEOUT,
                redis::cmd("PING").query_async(&mut conn),
            )
            .await
            .unwrap_or_else(|_| Err(timeout_error("redis ping timed out")));
            if ping.is_ok() {
                return Ok(conn);
            }
            warn!("redis ping failed, reconnecting");
        }

        let mut conn = timeout(CONNECT_TIMEOUT, self.client.get_multiplexed_async_connection())
            .await
            .map_err(|_| timeout_error("redis reconnect timed out"))??;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        *self.conn.lock().await = Some(conn.clone());
        Ok(conn)
    }

    async fn drop_connection(&self) {
        *self.conn.lock().await = None;
    }

    /// Run one command under the retry/reconnect/degrade discipline.
    async fn run<T: redis::FromRedisValue>(
        &self,
        cmd: &redis::Cmd,
    ) -> std::result::Result<T, RunError> {
        let mut last_err: Option<redis::RedisError> = None;
        for attempt in 1..=OP_ATTEMPTS {
            if attempt > 1 {
                sleep(OP_BACKOFF * (attempt - 1)).await;
            }
            let mut conn = match self.live_connection().await {
                Ok(conn) => conn,
                Err(err) => {
                    warn!(%err, attempt, "redis connection attempt failed");
                    last_err = Some(err);
                    continue;
                }
            };
            let outcome: redis::RedisResult<T> = cmd.query_async(&mut conn).await;
            match outcome {
                Ok(value) => return Ok(value),
                Err(err) if propagates_immediately(&err) => {
                    return Err(RunError::Fatal(err.into()));
                }
                Err(err) => {
                    warn!(%err, attempt, "redis operation failed");
                    if is_connection_error(&err) {
                        self.drop_connection().await;
                    }
                    last_err = Some(err);
                }
            }
        }

        match last_err {
            Some(err) if is_connection_error(&err) => Err(self.degrade(&err)),
            Some(err) => Err(RunError::Fatal(err.into())),
            None => Err(RunError::Degraded),
        }
    }

    /// Flip to the memory secondary and make sure a reconciliation task is
    /// running.
    fn degrade(&self, err: &redis::RedisError) -> RunError {
        self.degraded.store(true, Ordering::SeqCst);
        error!(%err, "redis retry budget exhausted, degrading to memory queue");

        if !self.reconciling.swap(true, Ordering::SeqCst) {
            let worker = ReconcileWorker {
                client: self.client.clone(),
                conn: Arc::clone(&self.conn),
                queue_key: self.queue_key.clone(),
                secondary: Arc::clone(&self.secondary),
                degraded: Arc::clone(&self.degraded),
                reconciling: Arc::clone(&self.reconciling),
            };
            tokio::spawn(worker.run());
        }
        RunError::Degraded
    }

    fn zadd(&self, score: u64, payload: &str) -> redis::Cmd {
        let mut cmd = redis::cmd("ZADD");
        cmd.arg(&self.queue_key).arg(score).arg(payload);
        cmd
    }

    fn response_key(&self, request_id: &str) -> String {
        format!("{RESPONSE_PREFIX}{request_id}")
    }
}

fn timeout_error(message: &str) -> redis::RedisError {
    redis::RedisError::from((ErrorKind::IoError, "timeout", message.to_string()))
}

#[async_trait::async_trait]
impl QueueBackend for RedisQueue {
    async fn enqueue(&self, request: ChatRequest, priority: u8) -> Result<String> {
        if self.is_degraded() {
            return self.secondary.enqueue(request, priority).await;
        }

        let item = QueuedRequest::new(request, priority);
        let id = item.id.clone();
        let item_score = score::fresh(item.priority, item.enqueued_at_ms);
        let payload = serde_json::to_string(&item)?;

        match self.run::<i64>(&self.zadd(item_score, &payload)).await {
            Ok(_) => {
                debug!(id, "queued request in redis");
                Ok(id)
            }
            Err(RunError::Degraded) => {
                self.secondary.insert_scored(item_score, item);
                Ok(id)
            }
            Err(RunError::Fatal(err)) => Err(err),
        }
    }

    async fn priority_enqueue(&self, item: QueuedRequest) -> Result<()> {
        if self.is_degraded() {
            return self.secondary.priority_enqueue(item).await;
        }

        let item_score = score::retry(item.enqueued_at_ms);
        let payload = serde_json::to_string(&item)?;

        match self.run::<i64>(&self.zadd(item_score, &payload)).await {
            Ok(_) => {
                debug!(id = item.id, "requeued request into redis retry band");
                Ok(())
            }
            Err(RunError::Degraded) => {
                self.secondary.insert_scored(item_score, item);
                Ok(())
            }
            Err(RunError::Fatal(err)) => Err(err),
        }
    }

    async fn dequeue(&self) -> Result<Option<QueuedRequest>> {
        if self.is_degraded() {
            return self.secondary.dequeue().await;
        }

        let mut cmd = redis::cmd("ZPOPMIN");
        cmd.arg(&self.queue_key).arg(1);

        let popped = match timeout(DEQUEUE_DEADLINE, self.run::<Vec<(String, f64)>>(&cmd)).await {
            // A slow backend is treated as an empty queue for this tick.
            Err(_) => {
                warn!("redis dequeue timed out");
                return Ok(None);
            }
            Ok(Err(RunError::Degraded)) => return self.secondary.dequeue().await,
            Ok(Err(RunError::Fatal(err))) => return Err(err),
            Ok(Ok(popped)) => popped,
        };

        match popped.into_iter().next() {
            Some((payload, _)) => {
                let item: QueuedRequest = serde_json::from_str(&payload)?;
                debug!(id = item.id, "dequeued request from redis");
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }

    async fn len(&self) -> Result<usize> {
        if self.is_degraded() {
            return self.secondary.len().await;
        }

        let mut cmd = redis::cmd("ZCARD");
        cmd.arg(&self.queue_key);
        match self.run::<i64>(&cmd).await {
            Ok(count) => Ok(count.max(0) as usize),
            Err(RunError::Degraded) => self.secondary.len().await,
            Err(RunError::Fatal(err)) => Err(err),
        }
    }

    async fn store_response(&self, request_id: &str, envelope: &ResponseEnvelope) -> Result<()> {
        if self.is_degraded() {
            return self.secondary.store_response(request_id, envelope).await;
        }

        let payload = serde_json::to_string(envelope)?;
        // NX keeps the first published envelope; a second publish is a no-op.
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.response_key(request_id))
            .arg(&payload)
            .arg("NX")
            .arg("EX")
            .arg(self.response_expiry.as_secs().max(1));

        match self.run::<Option<String>>(&cmd).await {
            Ok(_) => {
                debug!(request_id, "stored response in redis");
                Ok(())
            }
            Err(RunError::Degraded) => self.secondary.store_response(request_id, envelope).await,
            Err(RunError::Fatal(err)) => Err(err),
        }
    }

    async fn get_response(&self, request_id: &str) -> Result<Option<ResponseEnvelope>> {
        if self.is_degraded() {
            return self.secondary.get_response(request_id).await;
        }

        let mut cmd = redis::cmd("GET");
        cmd.arg(self.response_key(request_id));

        let fetched = match timeout(RESPONSE_DEADLINE, self.run::<Option<String>>(&cmd)).await {
            Err(_) => {
                warn!(request_id, "fetching response timed out");
                return Ok(None);
            }
            Ok(Err(RunError::Degraded)) => return self.secondary.get_response(request_id).await,
            Ok(Err(RunError::Fatal(err))) => return Err(err),
            Ok(Ok(fetched)) => fetched,
        };

        match fetched {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            // Responses published during an outage live only in the
            // secondary; check it before reporting the request as pending.
            None => Ok(self.secondary.response(request_id)),
        }
    }
}

// ── Reconciliation ───────────────────────────────────────────────────────────

/// Background task that pings redis on an exponential backoff and, once it
/// answers, routes new traffic back to redis and drains the memory
/// secondary into the reconcile score band.
struct ReconcileWorker {
    client: redis::Client,
    conn: Arc<tokio::sync::Mutex<Option<MultiplexedConnection>>>,
    queue_key: String,
    secondary: Arc<MemoryQueue>,
    degraded: Arc<AtomicBool>,
    reconciling: Arc<AtomicBool>,
}

impl ReconcileWorker {
    async fn run(self) {
        // Give in-flight operations a moment to settle into the secondary.
        sleep(Duration::from_secs(1)).await;
        info!("queue reconciliation task started");

        let mut backoff = RECONCILE_BACKOFF_START;
        loop {
            match self.try_restore().await {
                Ok(drained) => {
                    info!(drained, "memory secondary drained back to redis");
                    self.reconciling.store(false, Ordering::SeqCst);
                    return;
                }
                Err(err) => {
                    warn!(%err, backoff_secs = backoff.as_secs(), "redis still down");
                    sleep(backoff).await;
                    backoff = (backoff * 2).min(RECONCILE_BACKOFF_CAP);
                }
            }
        }
    }

    async fn try_restore(&self) -> std::result::Result<u64, redis::RedisError> {
        let mut conn = timeout(CONNECT_TIMEOUT, self.client.get_multiplexed_async_connection())
            .await
            .map_err(|_| timeout_error("redis reconnect timed out"))??;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;

        // Route new traffic to redis before draining, so the secondary only
        // quiesces. Stragglers that raced the flip are caught below because
        // the drain keeps popping until the secondary stays empty.
        self.degraded.store(false, Ordering::SeqCst);
        *self.conn.lock().await = Some(conn.clone());

        let mut drained = 0u64;
        while let Some(item) = self.secondary.pop_next() {
            let item_score = score::reconciled(unix_ms());
            let payload = match serde_json::to_string(&item) {
                Ok(payload) => payload,
                Err(err) => {
                    error!(id = item.id, %err, "dropping undecodable drained item");
                    continue;
                }
            };
            let mut cmd = redis::cmd("ZADD");
            cmd.arg(&self.queue_key).arg(item_score).arg(&payload);
            let written: redis::RedisResult<i64> = cmd.query_async(&mut conn).await;
            if let Err(err) = written {
                // Redis went away again mid-drain: keep the item, flip back
                // to degraded and resume the backoff loop.
                self.secondary.insert_scored(score::retry(item.enqueued_at_ms), item);
                self.degraded.store(true, Ordering::SeqCst);
                return Err(err);
            }
            drained += 1;
        }

        Ok(drained)
    }
}

#[cfg(test)]
impl RedisQueue {
    /// Build a queue around an existing client without the startup ping,
    /// so tests can point at a dead address.
    fn with_client(client: redis::Client, queue_key: &str, response_expiry: Duration) -> Self {
        Self {
            client,
            conn: Arc::new(tokio::sync::Mutex::new(None)),
            queue_key: queue_key.to_string(),
            response_expiry,
            secondary: Arc::new(MemoryQueue::new(response_expiry)),
            degraded: Arc::new(AtomicBool::new(false)),
            reconciling: Arc::new(AtomicBool::new(false)),
        }
    }
}
