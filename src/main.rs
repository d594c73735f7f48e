use std::sync::Arc;

use axum::{routing::get, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use riptide::config::Config;
use riptide::exchange::{ConnectionManager, RestClient};
use riptide::logging::LogBuffer;
use riptide::services::{
    CircuitBreaker, MarketDataService, MonitoringSystem, RateLimiter, RetryHandler, RiskManager,
};
use riptide::websocket::{ws_handler, RoomManager};
use riptide::{api, AppState};

/// Portfolio value used until account data arrives.
const DEFAULT_PORTFOLIO_VALUE: f64 = 100_000.0;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "riptide=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Arc::new(Config::from_env());
    info!("Starting riptide server on {}:{}", config.host, config.port);

    let log = Arc::new(LogBuffer::default());
    let monitoring = MonitoringSystem::new(config.monitoring.clone());

    // Resilience stack for the REST path
    let rate_limiter = RateLimiter::new(config.rate_limit.clone());
    let retry = RetryHandler::new(config.retry.clone());
    let breaker = CircuitBreaker::new("exchange-rest", config.breaker.clone());
    let rest = RestClient::new(
        config.exchange.clone(),
        config.rest.clone(),
        Some(rate_limiter),
        retry,
        breaker,
        log.clone(),
    );

    // Realtime feed
    let connection = ConnectionManager::new(
        config.exchange.clone(),
        config.connection.clone(),
        log.clone(),
    );

    // Risk engine over the live data
    let risk = RiskManager::new(
        config.risk.clone(),
        monitoring.clone(),
        DEFAULT_PORTFOLIO_VALUE,
    );

    let market_data = MarketDataService::new(
        connection.clone(),
        rest,
        risk.clone(),
        monitoring.clone(),
        config.symbols.clone(),
    );
    market_data.start();
    monitoring.start();

    if let Err(e) = market_data.connect() {
        // REST and synthetic fallbacks keep the dashboards fed
        tracing::error!("Exchange feed connect failed: {}", e);
    }

    // Periodic risk limit enforcement
    let risk_loop = risk.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(10));
        loop {
            tick.tick().await;
            risk_loop.check_risk_limits();
        }
    });

    let room_manager = RoomManager::new();
    let state = AppState {
        config: config.clone(),
        connection,
        market_data,
        risk,
        monitoring,
        room_manager,
        log,
    };

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .merge(api::router())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Listening on {}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}
