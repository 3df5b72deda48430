//! Router assembly and the serve loop.

use std::{future::Future, net::SocketAddr, sync::Arc};

use {
    axum::{
        Router, middleware,
        routing::{get, post},
    },
    tower_http::{
        cors::CorsLayer,
        request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
        trace::TraceLayer,
    },
    tracing::info,
};

use crate::{auth, routes, state::AppState};

/// Build the `/v1` router with auth and the observability layer stack.
pub fn build_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/chat/completions", post(routes::chat_completions))
        .route("/requests/{id}", get(routes::request_status))
        .route("/stats", get(routes::stats))
        .route("/system/status", get(routes::system_status))
        .route(
            "/system/force-failover/{provider}",
            post(routes::force_failover),
        )
        .route(
            "/system/reset-provider/{provider}",
            post(routes::reset_provider),
        )
        .route("/providers", get(routes::providers))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::require_bearer,
        ))
        .with_state(state);

    Router::new()
        .nest("/v1", api)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(CorsLayer::permissive())
}

/// Serve until `shutdown` resolves.
pub async fn serve(
    state: Arc<AppState>,
    addr: SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "gateway listening");
    axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;
    Ok(())
}
