//! Periodic provider health checking.
//!
//! On startup the checker sweeps every provider once (primary first) and
//! rotates away from a dead primary. In steady state it wakes every half
//! interval and probes providers that are marked unavailable or have not
//! been checked within a full interval. A probe prefers a configured HTTP
//! health endpoint and otherwise does the adapter's minimal round-trip.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use {
    tokio::{task::JoinHandle, time::sleep},
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use switchyard_providers::ProviderRegistry;

use crate::manager::FailoverManager;

const ENDPOINT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

struct CheckerTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// The probing half of the checker; cheap to clone into the loop task.
#[derive(Clone)]
struct Prober {
    manager: Arc<FailoverManager>,
    registry: Arc<ProviderRegistry>,
    interval: Duration,
    /// Optional provider-specific HTTP probes, preferred over adapter
    /// round-trips when configured.
    endpoints: HashMap<String, String>,
    client: reqwest::Client,
}

pub struct HealthChecker {
    prober: Prober,
    task: Mutex<Option<CheckerTask>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl HealthChecker {
    #[must_use]
    pub fn new(
        manager: Arc<FailoverManager>,
        registry: Arc<ProviderRegistry>,
        interval: Duration,
        endpoints: HashMap<String, String>,
    ) -> Self {
        Self {
            prober: Prober {
                manager,
                registry,
                interval,
                endpoints,
                client: reqwest::Client::new(),
            },
            task: Mutex::new(None),
        }
    }

    /// Run the initial sweep, then start the periodic loop. A second call
    /// while running is a no-op.
    pub async fn start(&self) {
        if lock(&self.task).is_some() {
            warn!("health checker already running");
            return;
        }

        self.prober.initial_sweep().await;

        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let prober = self.prober.clone();
        let handle = tokio::spawn(async move { prober.run_loop(task_cancel).await });
        *lock(&self.task) = Some(CheckerTask { cancel, handle });
        info!(
            interval_secs = self.prober.interval.as_secs(),
            "health checker started"
        );
    }

    /// Cancel the loop and wait for it to exit.
    pub async fn stop(&self) {
        let task = lock(&self.task).take();
        if let Some(task) = task {
            task.cancel.cancel();
            if task.handle.await.is_err() {
                warn!("health checker did not shut down cleanly");
            }
            info!("health checker stopped");
        }
    }
}

impl Prober {
    /// One-shot full sweep over all providers, primary first.
    async fn initial_sweep(&self) {
        info!("running initial health sweep");
        for provider in self.manager.all_providers() {
            let healthy = self.probe(&provider).await;
            if healthy {
                info!(provider, "initial health check passed");
            } else {
                warn!(provider, "initial health check failed");
            }
            self.manager.apply_sweep_result(&provider, healthy).await;
        }
        self.manager.rotate_if_primary_unavailable().await;
    }

    async fn run_loop(&self, cancel: CancellationToken) {
        let half_interval = self.interval / 2;
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("health check loop cancelled");
                    return;
                }
                () = sleep(half_interval) => {}
            }

            for target in self.manager.probe_snapshot().await {
                if !target.available || target.since_last_check > self.interval {
                    let healthy = self.probe(&target.provider).await;
                    debug!(provider = target.provider, healthy, "periodic health probe");
                    self.manager
                        .apply_probe_result(&target.provider, healthy)
                        .await;
                }
            }
        }
    }

    async fn probe(&self, provider: &str) -> bool {
        if let Some(endpoint) = self.endpoints.get(provider) {
            return match self
                .client
                .get(endpoint)
                .timeout(ENDPOINT_PROBE_TIMEOUT)
                .send()
                .await
            {
                Ok(response) => response.status().is_success(),
                Err(err) => {
                    warn!(provider, %err, "health endpoint probe failed");
                    false
                }
            };
        }

        match self.registry.get(provider) {
            Some(adapter) => adapter.health_check().await,
            None => {
                warn!(provider, "no adapter registered for health probe");
                false
            }
        }
    }
}
