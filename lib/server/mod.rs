pub mod monitoring;
use crate::state::AppState;
use prometheus_client::encoding::text::encode;

use axum::{extract::State, http::StatusCode, routing::get, Router};
use monitoring::HARVEST_METRICS;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

// Healthy as long as the store answers.
async fn health_handler(state: State<Arc<AppState>>) -> (StatusCode, String) {
    match state.store.count_items().await {
        Ok(_) => (StatusCode::OK, "Healthy".to_string()),
        Err(err) => (StatusCode::SERVICE_UNAVAILABLE, format!("Unhealthy: {err}")),
    }
}

async fn expose_metrics(state: State<Arc<AppState>>) -> (StatusCode, String) {
    let mut buffer = String::new();
    let registry = state.registry.read().await;
    match encode(&mut buffer, &registry) {
        Ok(()) => (StatusCode::OK, buffer),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {err}"),
        ),
    }
}

/// Registers the harvest metrics and build info in the shared registry.
///
/// Workers record through `HARVEST_METRICS` whether or not the HTTP endpoint is served.
pub async fn register_metrics(state: &AppState) {
    let mut registry = state.registry.write().await;

    HARVEST_METRICS
        .get_or_init(|| async { monitoring::HarvestMetrics::register(&mut registry, "harvest") })
        .await;

    monitoring::register_build_info_metric(&mut registry, "harvester");
}

/// Starts the health/metrics HTTP server on the supplied socket address.
pub async fn setup_server_with_addr(
    state: Arc<AppState>,
    addr: SocketAddr,
) -> Result<tokio::task::JoinHandle<()>, std::io::Error> {
    let listener = TcpListener::bind(addr).await?;
    Ok(setup_server_with_listener(state, listener))
}

/// Serves on an already bound listener until the state's shutdown token is cancelled.
pub fn setup_server_with_listener(
    state: Arc<AppState>,
    listener: TcpListener,
) -> tokio::task::JoinHandle<()> {
    let shutdown_token = state.shutdown_token.clone();
    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(expose_metrics))
        .with_state(state);

    tokio::spawn(async move {
        let served = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            shutdown_token.cancelled().await;
        })
        .await;
        if let Err(err) = served {
            tracing::error!(
                event = "metrics_server_failed",
                error = %err,
                "metrics server stopped"
            );
        }
    })
}
