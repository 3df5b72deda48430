//! Route handlers.

use std::{collections::HashMap, sync::Arc, time::Duration};

use {
    axum::{
        Json,
        extract::{Path, Query, State},
        response::{IntoResponse, Response},
    },
    serde::{Deserialize, Serialize},
    tracing::info,
};

use {
    switchyard_common::ChatRequest,
    switchyard_failover::{FailoverStatus, ForceSwitchOutcome, ProviderStatus},
    switchyard_metrics::{MetricsReport, UsageStats},
    switchyard_providers::KeyStats,
};

use crate::{error::ApiError, state::AppState};

const DEFAULT_PRIORITY: u8 = 10;
const STATUS_METRICS_WINDOW: Duration = Duration::from_secs(3600);

#[derive(Debug, Deserialize)]
pub struct ProviderQuery {
    pub provider: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct QueuedResponse {
    pub request_id: String,
    pub status: &'static str,
    pub queue_position: usize,
    pub estimated_time: String,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub usage_stats: UsageStats,
    pub current_queue_length: usize,
    pub api_keys: HashMap<String, KeyStats>,
}

#[derive(Debug, Serialize)]
pub struct QueueStatus {
    pub current_length: usize,
}

#[derive(Debug, Serialize)]
pub struct SystemStatus {
    pub queue_status: QueueStatus,
    pub llm_stats: UsageStats,
    pub failover_status: FailoverStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsReport>,
}

#[derive(Debug, Serialize)]
pub struct ForceFailoverResponse {
    pub success: bool,
    #[serde(flatten)]
    pub outcome: ForceSwitchOutcome,
}

#[derive(Debug, Serialize)]
pub struct ResetProviderResponse {
    pub success: bool,
    pub provider_status: ProviderStatus,
}

#[derive(Debug, Serialize)]
pub struct ProviderInfo {
    pub name: String,
    pub default_model: String,
    pub models: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ProvidersResponse {
    pub providers: Vec<ProviderInfo>,
    pub current_provider: String,
    pub primary_provider: String,
}

/// Queue a chat request and reply immediately with the polling handle.
pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Json(mut request): Json<ChatRequest>,
) -> Result<Json<QueuedResponse>, ApiError> {
    if request.model.trim().is_empty() {
        request.model = state
            .settings
            .default_model_for(&state.settings.llm_provider)
            .to_string();
    }
    info!(
        model = request.model,
        messages = request.messages.len(),
        "accepted chat request"
    );

    let request_id = state.queue.enqueue(request, DEFAULT_PRIORITY).await?;
    let queue_position = state.queue.len().await?;
    let estimated_seconds =
        (queue_position as u64 / u64::from(state.settings.rate_limit_rps)).max(1);

    Ok(Json(QueuedResponse {
        request_id,
        status: "queued",
        queue_position,
        estimated_time: format!("{estimated_seconds}s"),
    }))
}

/// Poll one request: the stored envelope, or a pending marker.
pub async fn request_status(
    State(state): State<Arc<AppState>>,
    Path(request_id): Path<String>,
) -> Result<Response, ApiError> {
    match state.queue.get_response(&request_id).await? {
        Some(envelope) => Ok(Json(envelope).into_response()),
        None => Ok(Json(serde_json::json!({
            "request_id": request_id,
            "status": "pending",
            "message": "request is still being processed or does not exist",
        }))
        .into_response()),
    }
}

/// Usage statistics plus queue depth and masked key stats.
pub async fn stats(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ProviderQuery>,
) -> Result<Json<StatsResponse>, ApiError> {
    let provider = query.provider.as_deref();
    Ok(Json(StatsResponse {
        usage_stats: state.metrics.usage_stats(provider),
        current_queue_length: state.queue.len().await?,
        api_keys: state.keys.stats(provider).await,
    }))
}

/// Full system view: queue, usage, failover state and, when enabled, the
/// last hour of metrics.
pub async fn system_status(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ProviderQuery>,
) -> Result<Json<SystemStatus>, ApiError> {
    let provider = query.provider.as_deref();
    let metrics = state
        .settings
        .enable_metrics
        .then(|| state.metrics.report(provider, Some(STATUS_METRICS_WINDOW)));

    Ok(Json(SystemStatus {
        queue_status: QueueStatus {
            current_length: state.queue.len().await?,
        },
        llm_stats: state.metrics.usage_stats(provider),
        failover_status: state.failover.status().await,
        metrics,
    }))
}

/// Manually pin the current provider.
pub async fn force_failover(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
) -> Result<Json<ForceFailoverResponse>, ApiError> {
    let outcome = state.failover.force_switch(&provider).await?;
    Ok(Json(ForceFailoverResponse {
        success: true,
        outcome,
    }))
}

/// Clear a provider's failure state.
pub async fn reset_provider(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
) -> Result<Json<ResetProviderResponse>, ApiError> {
    let provider_status = state.failover.reset_provider(&provider).await?;
    Ok(Json(ResetProviderResponse {
        success: true,
        provider_status,
    }))
}

/// All registered providers with their model catalogs, plus the current
/// and primary ones.
pub async fn providers(State(state): State<Arc<AppState>>) -> Json<ProvidersResponse> {
    let providers = state
        .registry
        .adapters()
        .iter()
        .map(|adapter| ProviderInfo {
            name: adapter.name().to_string(),
            default_model: adapter.default_model().to_string(),
            models: adapter.models(),
        })
        .collect();

    Json(ProvidersResponse {
        providers,
        current_provider: state.failover.current_provider(),
        primary_provider: state.failover.primary().to_string(),
    })
}
