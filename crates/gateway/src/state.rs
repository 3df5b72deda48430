use std::sync::Arc;

use {
    switchyard_config::Settings,
    switchyard_failover::FailoverManager,
    switchyard_metrics::MetricsSink,
    switchyard_providers::{KeyManager, ProviderRegistry},
    switchyard_queue::QueueBackend,
};

/// Explicit handles to every process-scoped component, passed to handlers
/// through axum state. Nothing here is global.
pub struct AppState {
    pub settings: Arc<Settings>,
    pub queue: Arc<dyn QueueBackend>,
    pub keys: Arc<KeyManager>,
    pub failover: Arc<FailoverManager>,
    pub metrics: Arc<MetricsSink>,
    pub registry: Arc<ProviderRegistry>,
}
