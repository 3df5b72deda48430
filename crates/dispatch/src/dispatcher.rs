//! The top-level dispatch loop.
//!
//! Each tick: take a rate-limit token, pop the queue head, and process it
//! in a spawned task bounded by a thirty-second ceiling. Processing binds
//! the failover manager's current provider (rebinding retried items to an
//! untried one), rewrites the model when the provider changed, runs the
//! metrics-wrapped invoke policy, and ends in exactly one of: a completed
//! envelope, a retry-band requeue, or a terminal error envelope.

use std::{sync::Arc, time::Duration};

use {
    tokio::{
        task::JoinHandle,
        time::{Instant, sleep, timeout},
    },
    tokio_util::{sync::CancellationToken, task::TaskTracker},
    tracing::{debug, error, info, warn},
};

use {
    switchyard_common::{QueuedRequest, ResponseEnvelope},
    switchyard_failover::FailoverManager,
    switchyard_metrics::MetricsSink,
    switchyard_providers::{CostTable, KeyManager, ProviderRegistry, RetryPolicy, invoke_with_policy},
    switchyard_queue::QueueBackend,
};

use crate::RateLimiter;

const TOKEN_DEADLINE: Duration = Duration::from_secs(2);
const TOKEN_BACKOFF: Duration = Duration::from_millis(200);
const DEQUEUE_DEADLINE: Duration = Duration::from_secs(2);
const IDLE_SLEEP: Duration = Duration::from_millis(100);
const ITEM_DEADLINE: Duration = Duration::from_secs(30);
const RETRY_DELAY: Duration = Duration::from_secs(1);
const LOOP_ERROR_SLEEP: Duration = Duration::from_secs(1);
const MAX_CONSECUTIVE_ERRORS: u32 = 10;
const ERROR_PAUSE: Duration = Duration::from_secs(5);

/// Wiring for the dispatcher, assembled at startup.
pub struct DispatcherConfig {
    pub queue: Arc<dyn QueueBackend>,
    pub limiter: Arc<RateLimiter>,
    pub failover: Arc<FailoverManager>,
    pub registry: Arc<ProviderRegistry>,
    pub keys: Arc<KeyManager>,
    pub metrics: Arc<MetricsSink>,
    pub cost: CostTable,
    pub retry_policy: RetryPolicy,
    /// `backups + 1`: one attempt per configured provider.
    pub max_retries: u32,
}

pub struct Dispatcher {
    queue: Arc<dyn QueueBackend>,
    limiter: Arc<RateLimiter>,
    failover: Arc<FailoverManager>,
    registry: Arc<ProviderRegistry>,
    keys: Arc<KeyManager>,
    metrics: Arc<MetricsSink>,
    cost: CostTable,
    retry_policy: RetryPolicy,
    max_retries: u32,
    cancel: CancellationToken,
    in_flight: TaskTracker,
}

impl Dispatcher {
    #[must_use]
    pub fn new(config: DispatcherConfig) -> Arc<Self> {
        Arc::new(Self {
            queue: config.queue,
            limiter: config.limiter,
            failover: config.failover,
            registry: config.registry,
            keys: config.keys,
            metrics: config.metrics,
            cost: config.cost,
            retry_policy: config.retry_policy,
            max_retries: config.max_retries,
            cancel: CancellationToken::new(),
            in_flight: TaskTracker::new(),
        })
    }

    /// Spawn the dispatch loop.
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    /// Stop the loop and wait for in-flight items (each already bounded by
    /// the thirty-second ceiling) to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.in_flight.close();
        self.in_flight.wait().await;
        info!("dispatcher drained");
    }

    /// Cancellable sleep; reports whether shutdown was requested.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            () = self.cancel.cancelled() => true,
            () = sleep(duration) => false,
        }
    }

    async fn run(self: Arc<Self>) {
        info!("dispatcher started");
        let mut consecutive_errors = 0u32;

        while !self.cancel.is_cancelled() {
            let token = tokio::select! {
                () = self.cancel.cancelled() => break,
                token = self.limiter.acquire_with_deadline(TOKEN_DEADLINE) => token,
            };
            if !token {
                if self.pause(TOKEN_BACKOFF).await {
                    break;
                }
                continue;
            }

            let item = match timeout(DEQUEUE_DEADLINE, self.queue.dequeue()).await {
                Err(_) => {
                    warn!("dequeue deadline elapsed, skipping tick");
                    if self.pause(TOKEN_BACKOFF).await {
                        break;
                    }
                    continue;
                }
                Ok(Err(err)) => {
                    consecutive_errors += 1;
                    error!(
                        %err,
                        consecutive_errors,
                        "dispatch loop error while dequeuing"
                    );
                    if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                        error!("too many consecutive dispatch errors, pausing");
                        if self.pause(ERROR_PAUSE).await {
                            break;
                        }
                        consecutive_errors = 0;
                    } else if self.pause(LOOP_ERROR_SLEEP).await {
                        break;
                    }
                    continue;
                }
                Ok(Ok(None)) => {
                    consecutive_errors = 0;
                    if self.pause(IDLE_SLEEP).await {
                        break;
                    }
                    continue;
                }
                Ok(Ok(Some(item))) => {
                    consecutive_errors = 0;
                    item
                }
            };

            let worker = Arc::clone(&self);
            self.in_flight.spawn(async move {
                worker.process_with_deadline(item).await;
            });
        }

        info!("dispatcher loop exited");
    }

    /// Run one item under the processing ceiling; on elapse, publish the
    /// timeout envelope so the client sees a terminal instead of waiting
    /// out the response TTL.
    async fn process_with_deadline(&self, item: QueuedRequest) {
        let request_id = item.id.clone();
        if timeout(ITEM_DEADLINE, self.process_one(item)).await.is_err() {
            error!(request_id, "request processing exceeded its deadline");
            let envelope = ResponseEnvelope::timeout_error("request processing timed out");
            if let Err(err) = self.queue.store_response(&request_id, &envelope).await {
                error!(request_id, %err, "failed to store timeout response");
            }
        }
    }

    async fn process_one(&self, mut item: QueuedRequest) {
        // Bind the current provider; a retried item that already saw it is
        // rebound to the first untried available provider instead.
        let Some(mut adapter) = self.failover.current_adapter(&self.registry).await else {
            error!(id = item.id, "no provider adapter available");
            let envelope = ResponseEnvelope::service_error(
                "no provider adapter available",
                item.tried_providers.clone(),
            );
            self.publish(&item.id, &envelope).await;
            return;
        };
        let mut provider = adapter.name().to_string();

        if item.tried_providers.contains(&provider) && item.retry_count < self.max_retries
            && let Some(untried) = self
                .failover
                .first_available_excluding(&item.tried_providers)
                .await
            && let Some(rebound) = self.registry.get(&untried)
        {
            debug!(id = item.id, from = provider, to = untried, "rebinding retried item");
            adapter = rebound;
            provider = untried;
        }

        if item.original_provider.is_none() {
            item.original_provider = Some(provider.clone());
        }

        // Requests are model-agnostic across providers: when the provider
        // changed, the model follows the new provider's default.
        if item.original_provider.as_deref() != Some(provider.as_str()) {
            let default_model = adapter.default_model();
            if item.data.model != default_model {
                info!(
                    id = item.id,
                    provider,
                    from = item.data.model,
                    to = default_model,
                    "rewriting model for the rebound provider"
                );
                item.data.model = default_model.to_string();
            }
        }

        item.tried_providers.push(provider.clone());
        info!(
            id = item.id,
            provider,
            retry = item.retry_count,
            max_retries = self.max_retries,
            "processing request"
        );

        self.metrics.record_request(
            &provider,
            &item.id,
            &item.data.model,
            item.data.messages.len(),
        );
        let started = Instant::now();
        let outcome =
            invoke_with_policy(adapter.as_ref(), &self.keys, &self.retry_policy, &item.data).await;
        let duration = started.elapsed();

        match outcome {
            Ok(envelope) => {
                let usage = envelope.usage;
                self.metrics.record_response(
                    &provider,
                    &item.id,
                    true,
                    duration,
                    usage.map(|u| u.prompt_tokens),
                    usage.map(|u| u.completion_tokens),
                    usage.map(|u| self.cost.cost(&provider, &u)),
                );
                self.failover.report_success(&provider).await;
                self.publish(&item.id, &envelope).await;
                info!(id = item.id, provider, "request completed");
            }
            Err(err) => {
                self.metrics
                    .record_response(&provider, &item.id, false, duration, None, None, None);
                warn!(id = item.id, provider, %err, "provider call failed");
                self.failover.report_failure(&provider).await;

                if item.retry_count < self.max_retries
                    && self
                        .failover
                        .first_available_excluding(&item.tried_providers)
                        .await
                        .is_some()
                {
                    item.retry_count += 1;
                    info!(
                        id = item.id,
                        retry = item.retry_count,
                        tried = ?item.tried_providers,
                        "requeueing for another provider"
                    );
                    sleep(RETRY_DELAY).await;
                    match self.queue.priority_enqueue(item.clone()).await {
                        Ok(()) => return,
                        Err(queue_err) => {
                            error!(%queue_err, "requeue failed, publishing terminal error");
                        }
                    }
                }

                let envelope = ResponseEnvelope::service_error(
                    format!("all available LLM providers failed: {err}"),
                    item.tried_providers.clone(),
                );
                self.publish(&item.id, &envelope).await;
            }
        }
    }

    async fn publish(&self, request_id: &str, envelope: &ResponseEnvelope) {
        if let Err(err) = self.queue.store_response(request_id, envelope).await {
            error!(request_id, %err, "failed to store response");
        }
    }
}
