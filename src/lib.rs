//! Riptide - real-time market data streaming and risk management server
//! for crypto trading dashboards.

pub mod api;
pub mod config;
pub mod error;
pub mod exchange;
pub mod logging;
pub mod services;
pub mod types;
pub mod websocket;

use std::sync::Arc;

use config::Config;
use exchange::ConnectionManager;
use logging::LogBuffer;
use services::{MarketDataService, MonitoringSystem, RiskManager};
use websocket::RoomManager;

// Re-export commonly used types
pub use error::{EngineError, Result, TracedError};
pub use types::*;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub connection: ConnectionManager,
    pub market_data: MarketDataService,
    pub risk: RiskManager,
    pub monitoring: MonitoringSystem,
    pub room_manager: Arc<RoomManager>,
    pub log: Arc<LogBuffer>,
}
