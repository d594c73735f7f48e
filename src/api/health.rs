use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::exchange::ConnectionStatus;
use crate::logging::LogEntry;
use crate::services::{HealthState, HealthStatus};
use crate::AppState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    connection: ConnectionStatus,
    checks: Vec<HealthStatus>,
    connected_clients: usize,
    recent_logs: Vec<LogEntry>,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let checks = state.monitoring.health();
    let degraded = checks.iter().any(|c| c.state != HealthState::Healthy);

    Json(HealthResponse {
        status: if degraded { "degraded" } else { "ok" },
        version: env!("CARGO_PKG_VERSION"),
        connection: state.connection.status(),
        checks,
        connected_clients: state.room_manager.client_count(),
        recent_logs: state.log.recent(50),
    })
}

pub fn router() -> Router<AppState> {
    Router::new().route("/api/health", get(health))
}
