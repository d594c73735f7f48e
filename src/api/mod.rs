mod health;
mod market;
mod risk;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json, Router,
};
use serde_json::json;

use crate::error::EngineError;
use crate::AppState;

/// Compose all API routes.
pub fn router() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .merge(market::router())
        .merge(risk::router())
}

/// HTTP-facing error wrapper.
pub struct ApiError(pub EngineError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::Validation(_) => StatusCode::BAD_REQUEST,
            EngineError::Authentication(_) => StatusCode::UNAUTHORIZED,
            EngineError::RateLimited { .. } | EngineError::QueueFull { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            EngineError::TradingOperation(_) => StatusCode::NOT_FOUND,
            EngineError::Risk(_) => StatusCode::CONFLICT,
            EngineError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            EngineError::Network(_) | EngineError::Api { .. } | EngineError::CircuitOpen { .. } => {
                StatusCode::BAD_GATEWAY
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({
            "error": self.0.to_string(),
            "kind": self.0.kind(),
            "status": status.as_u16(),
        }));

        (status, body).into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self(err)
    }
}
