use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use super::ApiError;
use crate::error::EngineError;
use crate::types::{Position, RiskAlert, RiskMetrics};
use crate::AppState;

async fn metrics(State(state): State<AppState>) -> Json<RiskMetrics> {
    Json(state.risk.metrics())
}

/// Recompute metrics and enforce limits (may suspend trading).
async fn check_limits(State(state): State<AppState>) -> Json<RiskMetrics> {
    Json(state.risk.check_risk_limits())
}

async fn positions(State(state): State<AppState>) -> Json<Vec<Position>> {
    Json(state.risk.positions())
}

async fn alerts(State(state): State<AppState>) -> Json<Vec<RiskAlert>> {
    Json(state.monitoring.alerts())
}

async fn acknowledge_alert(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if state.monitoring.acknowledge_alert(&id) {
        Ok(Json(json!({ "acknowledged": true })))
    } else {
        Err(ApiError(EngineError::TradingOperation(format!(
            "alert not found: {}",
            id
        ))))
    }
}

async fn resolve_alert(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if state.monitoring.resolve_alert(&id) {
        Ok(Json(json!({ "resolved": true })))
    } else {
        Err(ApiError(EngineError::TradingOperation(format!(
            "alert not found: {}",
            id
        ))))
    }
}

async fn trading_status(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "suspended": state.risk.is_trading_suspended(),
    }))
}

/// Operator resume — the only path out of suspension.
async fn resume_trading(State(state): State<AppState>) -> Json<Value> {
    state.risk.resume_trading();
    Json(json!({ "suspended": false }))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/risk/metrics", get(metrics))
        .route("/api/risk/check", post(check_limits))
        .route("/api/risk/positions", get(positions))
        .route("/api/risk/alerts", get(alerts))
        .route("/api/risk/alerts/:id/acknowledge", post(acknowledge_alert))
        .route("/api/risk/alerts/:id/resolve", post(resolve_alert))
        .route("/api/risk/status", get(trading_status))
        .route("/api/risk/resume", post(resume_trading))
}
