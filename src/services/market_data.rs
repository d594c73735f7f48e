//! Market data facade consumed by the dashboard layer.
//!
//! Wires the feed paths together: the exchange WebSocket is primary, the
//! REST poller takes over while the socket is down, and the synthetic
//! fallback feed is the last resort. Every tick lands in one cache, drives
//! the risk engine, and is republished to dashboard subscribers.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::exchange::{ConnectionManager, ExchangeEvent, RestClient};
use crate::services::{FallbackFeed, MonitoringSystem, RiskManager};
use crate::types::{AlertKind, AlertSeverity, ChannelSpec, DataSource, MarketData};

const UPDATE_CHANNEL_CAPACITY: usize = 1024;
const FALLBACK_POLL_INTERVAL: Duration = Duration::from_secs(10);
/// Market data older than this fails the freshness health check.
const FRESHNESS_WINDOW_MS: i64 = 60_000;

/// Facade over the live feed, REST fallback, and synthetic fallback.
#[derive(Clone)]
pub struct MarketDataService {
    cache: Arc<DashMap<String, MarketData>>,
    connection: ConnectionManager,
    rest: RestClient,
    risk: RiskManager,
    fallback: Arc<FallbackFeed>,
    monitoring: MonitoringSystem,
    symbols: Arc<Vec<String>>,
    update_tx: broadcast::Sender<MarketData>,
}

impl MarketDataService {
    pub fn new(
        connection: ConnectionManager,
        rest: RestClient,
        risk: RiskManager,
        monitoring: MonitoringSystem,
        symbols: Vec<String>,
    ) -> Self {
        let (update_tx, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            cache: Arc::new(DashMap::new()),
            connection,
            rest,
            risk,
            fallback: Arc::new(FallbackFeed::new()),
            monitoring,
            symbols: Arc::new(symbols),
            update_tx,
        }
    }

    /// Spawn the event consumer and the fallback poller, and register the
    /// service's health checks.
    pub fn start(&self) {
        let service = self.clone();
        tokio::spawn(async move {
            service.consume_events().await;
        });

        let service = self.clone();
        tokio::spawn(async move {
            service.fallback_poll_loop().await;
        });

        self.register_health_checks();
    }

    /// Connect the exchange socket and subscribe the configured symbols.
    pub fn connect(&self) -> Result<(), EngineError> {
        self.connection.subscribe(vec![ChannelSpec::with_symbols(
            "v2/ticker",
            self.symbols.as_ref().clone(),
        )])?;
        self.connection.connect()
    }

    /// Disconnect the exchange socket.
    pub fn disconnect(&self) {
        self.connection.disconnect();
    }

    /// Whether the realtime feed is up.
    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Subscribe additional exchange channels.
    pub fn subscribe(&self, channels: Vec<ChannelSpec>) -> Result<(), EngineError> {
        self.connection.subscribe(channels)
    }

    /// Latest snapshot for one symbol.
    pub fn get_market_data(&self, symbol: &str) -> Option<MarketData> {
        self.cache.get(symbol).map(|d| d.clone())
    }

    /// Latest snapshot for every known symbol.
    pub fn market_data_array(&self) -> Vec<MarketData> {
        let mut data: Vec<MarketData> = self.cache.iter().map(|d| d.clone()).collect();
        data.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        data
    }

    /// Subscribe to republished ticks.
    pub fn subscribe_updates(&self) -> broadcast::Receiver<MarketData> {
        self.update_tx.subscribe()
    }

    /// Ingest one snapshot: cache it, drive the risk engine (live data
    /// only — synthetic prices must not fire stops), republish.
    pub fn ingest(&self, data: MarketData) {
        if data.source == DataSource::Live {
            let closed = self.risk.update_symbol_price(&data.symbol, data.price);
            for position in &closed {
                info!(
                    "Auto-closed {} position on {} ({:?})",
                    position.position.strategy, position.position.symbol, position.reason
                );
            }
        }

        self.monitoring.record_metric("market.updates", 1.0);
        self.cache.insert(data.symbol.clone(), data.clone());
        let _ = self.update_tx.send(data);
    }

    async fn consume_events(&self) {
        let mut events = self.connection.subscribe_events();
        loop {
            match events.recv().await {
                Ok(ExchangeEvent::Ticker(data)) => self.ingest(data),
                Ok(ExchangeEvent::OrderBook(book)) => {
                    debug!("Order book update for {}", book.symbol);
                }
                Ok(ExchangeEvent::Disconnected(category)) => {
                    self.monitoring.create_alert(
                        AlertKind::Connection,
                        AlertSeverity::Warning,
                        format!("exchange feed disconnected: {}", category.describe()),
                        0.0,
                        0.0,
                    );
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Event consumer lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// While the socket is down, poll REST; when REST fails too, emit
    /// synthetic data.
    async fn fallback_poll_loop(&self) {
        let mut tick = tokio::time::interval(FALLBACK_POLL_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            if self.connection.is_connected() {
                continue;
            }

            match self.rest.get_tickers(Some(self.symbols.as_ref())).await {
                Ok(tickers) => {
                    debug!("REST fallback delivered {} tickers", tickers.len());
                    for ticker in tickers {
                        if let Some(data) = ticker.to_market_data() {
                            self.ingest(data);
                        }
                    }
                }
                Err(err) => {
                    warn!(
                        "REST fallback failed ({}), serving synthetic data",
                        err.error
                    );
                    for symbol in self.symbols.iter() {
                        self.ingest(self.fallback.next(symbol));
                    }
                }
            }
        }
    }

    fn register_health_checks(&self) {
        let connection = self.connection.clone();
        self.monitoring.register_check(
            "exchange_feed",
            Arc::new(move || {
                let connection = connection.clone();
                Box::pin(async move {
                    if connection.is_connected() {
                        Ok(())
                    } else {
                        Err(format!("feed is {}", connection.phase()))
                    }
                })
            }),
        );

        let cache = self.cache.clone();
        self.monitoring.register_check(
            "market_data_freshness",
            Arc::new(move || {
                let cache = cache.clone();
                Box::pin(async move {
                    if cache.is_empty() {
                        return Err("no market data received yet".to_string());
                    }
                    let now = chrono::Utc::now().timestamp_millis();
                    let newest = cache.iter().map(|d| d.timestamp).max().unwrap_or(0);
                    if now - newest > FRESHNESS_WINDOW_MS {
                        Err(format!("newest data is {}ms old", now - newest))
                    } else {
                        Ok(())
                    }
                })
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        BreakerConfig, ConnectionConfig, ExchangeConfig, RestConfig, RetryConfig, RiskConfig,
    };
    use crate::logging::LogBuffer;
    use crate::services::{CircuitBreaker, RetryHandler};

    fn service() -> MarketDataService {
        let log = Arc::new(LogBuffer::default());
        let exchange = ExchangeConfig {
            rest_url: "https://api.india.delta.exchange".to_string(),
            ws_url: "wss://socket.india.delta.exchange".to_string(),
            api_key: None,
            api_secret: None,
        };
        let connection =
            ConnectionManager::new(exchange.clone(), ConnectionConfig::default(), log.clone());
        let rest = RestClient::new(
            exchange,
            RestConfig::default(),
            None,
            RetryHandler::new(RetryConfig::default()),
            CircuitBreaker::new("rest", BreakerConfig::default()),
            log,
        );
        let monitoring = MonitoringSystem::default();
        let risk = RiskManager::new(RiskConfig::default(), monitoring.clone(), 100_000.0);
        MarketDataService::new(
            connection,
            rest,
            risk,
            monitoring,
            vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
        )
    }

    fn live_snapshot(symbol: &str, price: f64) -> MarketData {
        MarketData::new(
            symbol.to_string(),
            price,
            price,
            price,
            price,
            10.0,
            None,
            DataSource::Live,
        )
    }

    #[tokio::test]
    async fn test_ingest_updates_cache_and_republishes() {
        let service = service();
        let mut updates = service.subscribe_updates();

        service.ingest(live_snapshot("BTCUSDT", 50_000.0));

        let cached = service.get_market_data("BTCUSDT").unwrap();
        assert_eq!(cached.price, 50_000.0);

        let published = updates.try_recv().unwrap();
        assert_eq!(published.symbol, "BTCUSDT");
    }

    #[tokio::test]
    async fn test_market_data_array_sorted() {
        let service = service();
        service.ingest(live_snapshot("ETHUSDT", 3_000.0));
        service.ingest(live_snapshot("BTCUSDT", 50_000.0));

        let all = service.market_data_array();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].symbol, "BTCUSDT");
        assert_eq!(all[1].symbol, "ETHUSDT");
    }

    #[tokio::test]
    async fn test_latest_snapshot_wins() {
        let service = service();
        service.ingest(live_snapshot("BTCUSDT", 50_000.0));
        service.ingest(live_snapshot("BTCUSDT", 50_500.0));

        assert_eq!(service.get_market_data("BTCUSDT").unwrap().price, 50_500.0);
        assert_eq!(service.market_data_array().len(), 1);
    }

    #[tokio::test]
    async fn test_fallback_data_does_not_drive_risk() {
        let service = service();

        // a synthetic tick must leave the risk return history untouched
        let synthetic = MarketData::new(
            "BTCUSDT".to_string(),
            48_000.0,
            48_000.0,
            48_000.0,
            48_000.0,
            0.0,
            None,
            DataSource::Fallback,
        );
        service.ingest(synthetic.clone());
        service.ingest(live_snapshot("BTCUSDT", 50_000.0));
        service.ingest(live_snapshot("BTCUSDT", 51_000.0));

        // cache still serves the latest snapshot regardless of source
        assert_eq!(service.get_market_data("BTCUSDT").unwrap().price, 51_000.0);
        // live ticks were observed: one return sample exists
        assert!(service.risk.volatility("BTCUSDT") == 0.0);
        service.ingest(live_snapshot("BTCUSDT", 49_000.0));
        // two live returns now: volatility becomes measurable
        assert!(service.risk.volatility("BTCUSDT") > 0.0);
    }

    #[tokio::test]
    async fn test_unknown_symbol_returns_none() {
        let service = service();
        assert!(service.get_market_data("NOPE").is_none());
    }
}
