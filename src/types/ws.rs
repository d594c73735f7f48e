//! Wire types for the exchange feed and the dashboard socket.
//!
//! Exchange frames demultiplex through [`ExchangeMessage`], a closed tagged
//! enum with an explicit `Unknown` fallback — unrecognized frame types are
//! logged and dropped, never an error that kills the connection.

use serde::{Deserialize, Serialize};

use crate::types::{DataSource, MarketData, OrderBook, OrderBookLevel, RiskAlert};

/// Wildcard symbol accepted by broadcast-style channels.
pub const ALL_SYMBOLS: &str = "all";

/// Channels that accept the `"all"` wildcard.
pub fn supports_wildcard(channel: &str) -> bool {
    matches!(
        channel,
        "v2/ticker" | "ticker" | "l1_orderbook" | "all_trades" | "funding_rate" | "mark_price"
    )
}

/// Channels that cap the number of symbols per subscription.
pub fn symbol_capped(channel: &str) -> bool {
    matches!(channel, "l2_orderbook" | "l2_updates")
}

/// A channel plus the symbols it covers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSpec {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbols: Option<Vec<String>>,
}

impl ChannelSpec {
    /// Channel covering specific symbols.
    pub fn with_symbols(name: impl Into<String>, symbols: Vec<String>) -> Self {
        Self {
            name: name.into(),
            symbols: Some(symbols),
        }
    }

    /// Channel with no symbol list (wildcard semantics where supported).
    pub fn all(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            symbols: None,
        }
    }
}

// =============================================================================
// Outgoing exchange frames
// =============================================================================

/// Authentication frame sent after the socket opens.
#[derive(Debug, Serialize)]
pub struct AuthFrame {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub api_key: String,
    pub signature: String,
    pub timestamp: String,
}

/// Subscribe/unsubscribe frame.
#[derive(Debug, Serialize)]
pub struct SubscribeFrame {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub payload: SubscribePayload,
}

#[derive(Debug, Serialize)]
pub struct SubscribePayload {
    pub channels: Vec<ChannelSpec>,
}

impl SubscribeFrame {
    pub fn subscribe(channels: Vec<ChannelSpec>) -> Self {
        Self {
            msg_type: "subscribe".to_string(),
            payload: SubscribePayload { channels },
        }
    }

    pub fn unsubscribe(channels: Vec<ChannelSpec>) -> Self {
        Self {
            msg_type: "unsubscribe".to_string(),
            payload: SubscribePayload { channels },
        }
    }
}

/// Asks the server to emit periodic heartbeats.
#[derive(Debug, Serialize)]
pub struct EnableHeartbeatFrame {
    #[serde(rename = "type")]
    pub msg_type: String,
}

impl Default for EnableHeartbeatFrame {
    fn default() -> Self {
        Self {
            msg_type: "enable_heartbeat".to_string(),
        }
    }
}

// =============================================================================
// Incoming exchange frames
// =============================================================================

/// A numeric field the feed may encode as a number or a string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PriceField {
    Num(f64),
    Str(String),
}

impl PriceField {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PriceField::Num(n) => Some(*n),
            PriceField::Str(s) => s.parse().ok(),
        }
    }
}

fn parse_field(field: &Option<PriceField>) -> Option<f64> {
    field.as_ref().and_then(|f| f.as_f64())
}

/// One order book level as the feed encodes it.
#[derive(Debug, Clone, Deserialize)]
pub struct WireLevel {
    pub limit_price: PriceField,
    pub size: PriceField,
}

/// Incoming exchange frames, discriminated by `type`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ExchangeMessage {
    /// Ticker update.
    #[serde(rename = "v2/ticker", alias = "v2_ticker", alias = "ticker")]
    Ticker {
        symbol: String,
        close: Option<PriceField>,
        open: Option<PriceField>,
        high: Option<PriceField>,
        low: Option<PriceField>,
        volume: Option<PriceField>,
        mark_price: Option<PriceField>,
    },

    /// Level-2 order book snapshot.
    #[serde(rename = "l2_orderbook")]
    L2Orderbook {
        symbol: String,
        #[serde(default)]
        buy: Vec<WireLevel>,
        #[serde(default)]
        sell: Vec<WireLevel>,
    },

    /// Position update on the authenticated feed.
    #[serde(rename = "positions")]
    Positions {
        symbol: String,
        size: Option<PriceField>,
        entry_price: Option<PriceField>,
        liquidation_price: Option<PriceField>,
    },

    /// Margin update on the authenticated feed.
    #[serde(rename = "margins")]
    Margins {
        asset_symbol: Option<String>,
        available_balance: Option<PriceField>,
        blocked_margin: Option<PriceField>,
    },

    /// Server heartbeat.
    #[serde(rename = "heartbeat")]
    Heartbeat {
        #[serde(default)]
        ts: Option<i64>,
    },

    /// Subscription acknowledgement.
    #[serde(rename = "subscriptions")]
    Subscriptions {
        #[serde(default)]
        channels: Vec<ChannelSpec>,
    },

    /// Generic success response (authentication acknowledgement).
    #[serde(rename = "success")]
    Success {
        #[serde(default)]
        message: Option<String>,
    },

    /// Server-reported error.
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        code: Option<i64>,
    },

    /// Any frame type we do not handle.
    #[serde(other)]
    Unknown,
}

impl ExchangeMessage {
    /// Convert a ticker frame into a dashboard snapshot.
    ///
    /// Returns `None` for non-ticker frames or tickers without a close price.
    pub fn to_market_data(&self) -> Option<MarketData> {
        match self {
            ExchangeMessage::Ticker {
                symbol,
                close,
                open,
                high,
                low,
                volume,
                mark_price,
            } => {
                let price = parse_field(close)?;
                Some(MarketData::new(
                    symbol.clone(),
                    price,
                    parse_field(open).unwrap_or(price),
                    parse_field(high).unwrap_or(price),
                    parse_field(low).unwrap_or(price),
                    parse_field(volume).unwrap_or(0.0),
                    parse_field(mark_price),
                    DataSource::Live,
                ))
            }
            _ => None,
        }
    }

    /// Convert an L2 frame into an order book snapshot.
    pub fn to_order_book(&self) -> Option<OrderBook> {
        match self {
            ExchangeMessage::L2Orderbook { symbol, buy, sell } => {
                let convert = |levels: &[WireLevel]| {
                    levels
                        .iter()
                        .filter_map(|l| {
                            Some(OrderBookLevel {
                                price: l.limit_price.as_f64()?,
                                size: l.size.as_f64()?,
                            })
                        })
                        .collect()
                };
                Some(OrderBook {
                    symbol: symbol.clone(),
                    bids: convert(buy),
                    asks: convert(sell),
                    timestamp: chrono::Utc::now().timestamp_millis(),
                })
            }
            _ => None,
        }
    }
}

// =============================================================================
// Dashboard socket messages
// =============================================================================

/// Messages dashboard clients send us.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe { symbols: Vec<String> },
    Unsubscribe { symbols: Vec<String> },
    SubscribeAlerts,
    UnsubscribeAlerts,
}

/// Messages we push to dashboard clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    MarketUpdate { data: MarketData },
    RiskAlert { data: RiskAlert },
    ConnectionStatus { connected: bool, phase: String },
    Subscribed { symbols: Vec<String> },
    Unsubscribed { symbols: Vec<String> },
    AlertsSubscribed,
    AlertsUnsubscribed,
    Error { error: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticker_deserialization_string_fields() {
        let json = r#"{
            "type": "v2_ticker",
            "symbol": "BTCUSDT",
            "close": "50000",
            "open": "49000",
            "high": "50500",
            "low": "48800",
            "volume": "1234.5"
        }"#;

        let msg: ExchangeMessage = serde_json::from_str(json).unwrap();
        let data = msg.to_market_data().unwrap();
        assert_eq!(data.symbol, "BTCUSDT");
        assert_eq!(data.price, 50_000.0);
        assert!((data.change_percent - 2.0408).abs() < 0.001);
        assert!(data.is_live_data);
    }

    #[test]
    fn test_ticker_deserialization_numeric_fields() {
        let json = r#"{
            "type": "v2/ticker",
            "symbol": "ETHUSDT",
            "close": 3000.5,
            "open": 2950.0
        }"#;

        let msg: ExchangeMessage = serde_json::from_str(json).unwrap();
        let data = msg.to_market_data().unwrap();
        assert_eq!(data.price, 3_000.5);
        // missing high/low/volume fall back to the close price and zero
        assert_eq!(data.high_24h, 3_000.5);
        assert_eq!(data.volume, 0.0);
    }

    #[test]
    fn test_unknown_frame_falls_through() {
        let json = r#"{"type": "candlestick_1m", "symbol": "BTCUSDT"}"#;
        let msg: ExchangeMessage = serde_json::from_str(json).unwrap();
        assert!(matches!(msg, ExchangeMessage::Unknown));
        assert!(msg.to_market_data().is_none());
    }

    #[test]
    fn test_l2_orderbook_conversion() {
        let json = r#"{
            "type": "l2_orderbook",
            "symbol": "BTCUSDT",
            "buy": [{"limit_price": "49990", "size": 10}],
            "sell": [{"limit_price": "50010", "size": 5}]
        }"#;

        let msg: ExchangeMessage = serde_json::from_str(json).unwrap();
        let book = msg.to_order_book().unwrap();
        assert_eq!(book.best_bid(), Some(49_990.0));
        assert_eq!(book.best_ask(), Some(50_010.0));
        assert_eq!(book.mid_price(), Some(50_000.0));
    }

    #[test]
    fn test_heartbeat_frame() {
        let json = r#"{"type": "heartbeat", "ts": 1700000000000}"#;
        let msg: ExchangeMessage = serde_json::from_str(json).unwrap();
        assert!(matches!(msg, ExchangeMessage::Heartbeat { ts: Some(_) }));
    }

    #[test]
    fn test_subscribe_frame_serialization() {
        let frame = SubscribeFrame::subscribe(vec![
            ChannelSpec::with_symbols("v2/ticker", vec!["BTCUSDT".to_string()]),
            ChannelSpec::all("funding_rate"),
        ]);

        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"type\":\"subscribe\""));
        assert!(json.contains("\"channels\""));
        assert!(json.contains("\"BTCUSDT\""));
        // wildcard channel omits the symbols key entirely
        assert!(!json.contains("\"funding_rate\",\"symbols\":null"));
    }

    #[test]
    fn test_auth_frame_serialization() {
        let frame = AuthFrame {
            msg_type: "auth".to_string(),
            api_key: "key".to_string(),
            signature: "sig".to_string(),
            timestamp: "1700000000".to_string(),
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"type\":\"auth\""));
        assert!(json.contains("\"api_key\":\"key\""));
    }

    #[test]
    fn test_wildcard_channel_classification() {
        assert!(supports_wildcard("v2/ticker"));
        assert!(supports_wildcard("funding_rate"));
        assert!(!supports_wildcard("l2_orderbook"));

        assert!(symbol_capped("l2_orderbook"));
        assert!(symbol_capped("l2_updates"));
        assert!(!symbol_capped("ticker"));
    }

    #[test]
    fn test_client_message_parsing() {
        let json = r#"{"type": "subscribe", "symbols": ["BTCUSDT", "ETHUSDT"]}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        assert!(matches!(msg, ClientMessage::Subscribe { symbols } if symbols.len() == 2));

        let json = r#"{"type": "subscribe_alerts"}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        assert!(matches!(msg, ClientMessage::SubscribeAlerts));
    }
}
