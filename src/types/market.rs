use serde::{Deserialize, Serialize};

/// Where a piece of market data came from.
///
/// Downstream consumers never branch on "is this mock" — they read this tag.
/// `Fallback` marks synthetic data produced when both the realtime feed and
/// the REST path are unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    Live,
    Fallback,
}

impl DataSource {
    /// Whether this data reflects the real market.
    pub fn is_live(&self) -> bool {
        matches!(self, DataSource::Live)
    }
}

/// Dashboard-facing ticker snapshot for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketData {
    /// Trading symbol (e.g., "BTCUSDT").
    pub symbol: String,
    /// Last trade price.
    pub price: f64,
    /// Price 24 hours ago (session open).
    pub open_24h: f64,
    /// 24h high.
    pub high_24h: f64,
    /// 24h low.
    pub low_24h: f64,
    /// Percent change versus the session open.
    pub change_percent: f64,
    /// 24h traded volume.
    pub volume: f64,
    /// Mark price, when the feed provides one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mark_price: Option<f64>,
    /// Unix timestamp (ms).
    pub timestamp: i64,
    /// Live feed or synthetic fallback.
    pub source: DataSource,
    /// Convenience flag for UI degradation banners.
    pub is_live_data: bool,
}

impl MarketData {
    /// Build a snapshot, deriving `change_percent` from close/open.
    pub fn new(
        symbol: String,
        price: f64,
        open_24h: f64,
        high_24h: f64,
        low_24h: f64,
        volume: f64,
        mark_price: Option<f64>,
        source: DataSource,
    ) -> Self {
        Self {
            symbol,
            price,
            open_24h,
            high_24h,
            low_24h,
            change_percent: change_percent(price, open_24h),
            volume,
            mark_price,
            timestamp: chrono::Utc::now().timestamp_millis(),
            source,
            is_live_data: source.is_live(),
        }
    }
}

/// Percent change of `close` versus `open`. Zero when open is not positive.
pub fn change_percent(close: f64, open: f64) -> f64 {
    if open > 0.0 {
        (close - open) / open * 100.0
    } else {
        0.0
    }
}

/// One side level of an order book.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBookLevel {
    pub price: f64,
    pub size: f64,
}

/// Aggregated order book snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderBook {
    pub symbol: String,
    /// Bids, best first.
    pub bids: Vec<OrderBookLevel>,
    /// Asks, best first.
    pub asks: Vec<OrderBookLevel>,
    pub timestamp: i64,
}

impl OrderBook {
    /// Best bid price, if any depth exists.
    pub fn best_bid(&self) -> Option<f64> {
        self.bids.first().map(|l| l.price)
    }

    /// Best ask price, if any depth exists.
    pub fn best_ask(&self) -> Option<f64> {
        self.asks.first().map(|l| l.price)
    }

    /// Mid price between best bid and ask.
    pub fn mid_price(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some((bid + ask) / 2.0),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_percent_positive() {
        // 49,000 -> 50,000 is just over +2.04%
        let change = change_percent(50_000.0, 49_000.0);
        assert!((change - 2.0408).abs() < 0.001);
    }

    #[test]
    fn test_change_percent_negative() {
        let change = change_percent(38_000.0, 40_000.0);
        assert!((change + 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_change_percent_zero_open() {
        assert_eq!(change_percent(100.0, 0.0), 0.0);
    }

    #[test]
    fn test_market_data_live_flag() {
        let live = MarketData::new(
            "BTCUSDT".to_string(),
            50_000.0,
            49_000.0,
            50_500.0,
            48_800.0,
            1234.5,
            None,
            DataSource::Live,
        );
        assert!(live.is_live_data);
        assert!((live.change_percent - 2.0408).abs() < 0.001);

        let fallback = MarketData::new(
            "BTCUSDT".to_string(),
            50_000.0,
            49_000.0,
            50_500.0,
            48_800.0,
            1234.5,
            None,
            DataSource::Fallback,
        );
        assert!(!fallback.is_live_data);
    }

    #[test]
    fn test_data_source_serialization() {
        assert_eq!(serde_json::to_string(&DataSource::Live).unwrap(), "\"live\"");
        assert_eq!(
            serde_json::to_string(&DataSource::Fallback).unwrap(),
            "\"fallback\""
        );
    }

    #[test]
    fn test_order_book_mid_price() {
        let book = OrderBook {
            symbol: "BTCUSDT".to_string(),
            bids: vec![OrderBookLevel {
                price: 49_990.0,
                size: 1.0,
            }],
            asks: vec![OrderBookLevel {
                price: 50_010.0,
                size: 2.0,
            }],
            timestamp: 0,
        };
        assert_eq!(book.mid_price(), Some(50_000.0));

        let empty = OrderBook {
            symbol: "BTCUSDT".to_string(),
            bids: vec![],
            asks: vec![],
            timestamp: 0,
        };
        assert_eq!(empty.mid_price(), None);
    }
}
