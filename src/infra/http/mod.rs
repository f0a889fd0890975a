//! HTTP surface: entity reads, command ingest, status, health, metrics,
//! and the WebSocket upgrade.

mod auth;
mod commands;
mod entities;
mod error;
mod health;
mod ws;

pub use auth::{from_token_map, Authenticator, DevAuthenticator, StaticTokenAuthenticator};
pub use entities::{CACHE_STATUS_HEADER, IDEMPOTENCY_KEY_HEADER};
pub use error::{codes, ApiError};
pub use health::{
    DatabaseCheck, DependencyCheck, EventLogCheck, HealthRegistry, HealthReport, SubstrateCheck,
};

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;

use crate::application::entities::EntityReadService;
use crate::application::ingress::CommandIngress;
use crate::realtime::Hub;

/// Shared state injected into every handler.
#[derive(Clone)]
pub struct AppState {
    pub reads: Arc<EntityReadService>,
    pub ingress: Arc<CommandIngress>,
    pub hub: Arc<Hub>,
    pub authenticator: Arc<dyn Authenticator>,
    pub health: Arc<HealthRegistry>,
    pub metrics: Option<PrometheusHandle>,
}

/// Assemble the public router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/v1/entities",
            get(entities::list_entities).post(entities::create_entity),
        )
        .route(
            "/v1/entities/:id",
            get(entities::get_entity)
                .patch(entities::patch_entity)
                .delete(entities::delete_entity),
        )
        .route("/v1/commands/:id", get(commands::get_command))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}

/// `GET /health` — dependency aggregate; degraded answers 503 so load
/// balancers rotate the instance out.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.health.report().await;
    let status = if report.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

/// `GET /metrics` — Prometheus text exposition.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => (StatusCode::OK, handle.render()).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            "metrics recorder not installed".to_string(),
        )
            .into_response(),
    }
}
