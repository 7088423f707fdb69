//! HTTP server for Prometheus metrics and registry health
//!
//! # Endpoints
//!
//! - `GET /metrics` - Prometheus metrics
//! - `GET /health` - registry state and registered providers (JSON)

use crate::registry::{ProviderRegistry, RegistryState};
use axum::extract::State;
use axum::{Json, Router, http::StatusCode, response::IntoResponse, routing::get};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shared state for the metrics server
#[derive(Clone)]
struct AppState {
    registry: Option<Arc<ProviderRegistry>>,
}

/// Metrics HTTP server
pub struct MetricsServer;

impl MetricsServer {
    /// Start the metrics server on `addr`
    ///
    /// Returns a JoinHandle that can be used to abort the server.
    pub fn start(addr: SocketAddr, registry: Option<Arc<ProviderRegistry>>) -> JoinHandle<()> {
        let app = router(AppState { registry });

        tokio::spawn(async move {
            info!(%addr, "Metrics server starting");

            let listener = match tokio::net::TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(e) => {
                    error!(error = %e, %addr, "Failed to bind metrics server");
                    return;
                }
            };

            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "Metrics server error");
            }
        })
    }
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Handler for /metrics endpoint
async fn metrics_handler() -> impl IntoResponse {
    let body = crate::metrics::gather();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

#[derive(serde::Serialize)]
struct HealthSummary {
    status: &'static str,
    registry: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    providers: Vec<String>,
}

/// Handler for /health endpoint
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let Some(registry) = state.registry else {
        return (StatusCode::OK, Json(serde_json::json!({"status": "ok"}))).into_response();
    };

    let (status, registry_state, error) = match registry.state() {
        RegistryState::Ready => ("healthy", "ready", None),
        RegistryState::Initializing => ("starting", "initializing", None),
        RegistryState::Uninitialized => ("starting", "uninitialized", None),
        RegistryState::Failed(e) => ("unhealthy", "failed", Some(e.to_string())),
    };

    let summary = HealthSummary {
        status,
        registry: registry_state,
        error,
        providers: registry.provider_names(),
    };

    let code = match status {
        "unhealthy" => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };

    (code, Json(summary)).into_response()
}
