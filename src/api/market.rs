use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};

use super::ApiError;
use crate::error::EngineError;
use crate::types::MarketData;
use crate::AppState;

async fn all_market_data(State(state): State<AppState>) -> Json<Vec<MarketData>> {
    Json(state.market_data.market_data_array())
}

async fn market_data_for(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
) -> Result<Json<MarketData>, ApiError> {
    state
        .market_data
        .get_market_data(&symbol.to_uppercase())
        .map(Json)
        .ok_or_else(|| {
            ApiError(EngineError::TradingOperation(format!(
                "no market data for {}",
                symbol
            )))
        })
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/market", get(all_market_data))
        .route("/api/market/:symbol", get(market_data_for))
}
