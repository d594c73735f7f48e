//! Integration tests for the wire protocol:
//! exchange frame parsing, subscription rules, close classification, and the
//! dashboard message surface.

use riptide::exchange::{CloseCategory, ConnectionManager, ConnectionPhase, ExchangeEvent};
use riptide::config::{ConnectionConfig, ExchangeConfig};
use riptide::logging::LogBuffer;
use riptide::types::{
    supports_wildcard, symbol_capped, ChannelSpec, ClientMessage, ExchangeMessage, ServerMessage,
};
use std::sync::Arc;

fn manager() -> ConnectionManager {
    ConnectionManager::new(
        ExchangeConfig {
            rest_url: "https://api.india.delta.exchange".to_string(),
            ws_url: "wss://socket.india.delta.exchange".to_string(),
            api_key: None,
            api_secret: None,
        },
        ConnectionConfig::default(),
        Arc::new(LogBuffer::default()),
    )
}

// =============================================================================
// Exchange frames
// =============================================================================

#[test]
fn ticker_frame_derives_change_percent() {
    // close 50,000 over open 49,000 is just over +2.04%
    let json = r#"{"type":"v2_ticker","symbol":"BTCUSDT","close":"50000","open":"49000"}"#;
    let msg: ExchangeMessage = serde_json::from_str(json).unwrap();
    let data = msg.to_market_data().unwrap();

    assert_eq!(data.symbol, "BTCUSDT");
    assert!((data.change_percent - 2.0408).abs() < 0.001);
    assert!(data.is_live_data);
}

#[test]
fn frames_with_unknown_types_are_not_errors() {
    for json in [
        r#"{"type":"candlestick_1m","symbol":"BTCUSDT"}"#,
        r#"{"type":"mystery"}"#,
        r#"{"type":"trading_notifications","payload":{"reason":"adl"}}"#,
    ] {
        let msg: ExchangeMessage = serde_json::from_str(json).unwrap();
        assert!(matches!(msg, ExchangeMessage::Unknown));
    }
}

#[test]
fn private_frames_parse() {
    let json = r#"{"type":"positions","symbol":"BTCUSDT","size":2,"entry_price":"48000"}"#;
    let msg: ExchangeMessage = serde_json::from_str(json).unwrap();
    assert!(matches!(msg, ExchangeMessage::Positions { .. }));

    let json = r#"{"type":"margins","asset_symbol":"USDT","available_balance":"12345.6"}"#;
    let msg: ExchangeMessage = serde_json::from_str(json).unwrap();
    assert!(matches!(msg, ExchangeMessage::Margins { .. }));
}

// =============================================================================
// Subscription rules
// =============================================================================

#[test]
fn wildcard_is_limited_to_broadcast_channels() {
    for channel in ["v2/ticker", "ticker", "l1_orderbook", "all_trades", "funding_rate", "mark_price"] {
        assert!(supports_wildcard(channel), "{} should accept the wildcard", channel);
    }
    for channel in ["l2_orderbook", "l2_updates"] {
        assert!(!supports_wildcard(channel));
        assert!(symbol_capped(channel));
    }
}

#[test]
fn depth_channel_rejects_oversized_subscription() {
    let manager = manager();
    let too_many: Vec<String> = (0..25).map(|i| format!("S{}USDT", i)).collect();

    let result = manager.subscribe(vec![ChannelSpec::with_symbols("l2_orderbook", too_many)]);
    assert!(result.is_err());

    // state unchanged after the rejection
    assert!(manager.status().subscriptions.is_empty());
}

#[test]
fn subscription_set_is_remembered_for_reconnect() {
    let manager = manager();
    manager
        .subscribe(vec![
            ChannelSpec::with_symbols("v2/ticker", vec!["BTCUSDT".to_string()]),
            ChannelSpec::all("funding_rate"),
        ])
        .unwrap();
    manager
        .subscribe(vec![ChannelSpec::with_symbols(
            "v2/ticker",
            vec!["ETHUSDT".to_string()],
        )])
        .unwrap();

    let subscriptions = manager.status().subscriptions;
    assert_eq!(subscriptions.len(), 2);
    assert_eq!(subscriptions[0].name, "v2/ticker");
    assert_eq!(
        subscriptions[0].symbols.as_deref(),
        Some(&["BTCUSDT".to_string(), "ETHUSDT".to_string()][..])
    );
    assert_eq!(subscriptions[1].name, "funding_rate");

    // unsubscribing something that was never subscribed changes nothing
    manager.unsubscribe(vec![ChannelSpec::with_symbols(
        "mark_price",
        vec!["BTCUSDT".to_string()],
    )]);
    assert_eq!(manager.status().subscriptions.len(), 2);
}

// =============================================================================
// Connection surface
// =============================================================================

#[tokio::test]
async fn connect_validates_the_feed_url_first() {
    let bad = ConnectionManager::new(
        ExchangeConfig {
            rest_url: "https://api.test".to_string(),
            ws_url: "wss://example.com/ws".to_string(),
            api_key: None,
            api_secret: None,
        },
        ConnectionConfig::default(),
        Arc::new(LogBuffer::default()),
    );

    assert!(bad.connect().is_err());
    assert_eq!(bad.phase(), ConnectionPhase::Disconnected);
}

#[test]
fn close_codes_classify_for_operators() {
    let cases = [
        (1000, CloseCategory::Normal, "clean close"),
        (1002, CloseCategory::ProtocolError, "protocol error"),
        (1006, CloseCategory::AbnormalClosure, "abnormal closure"),
        (1011, CloseCategory::ServerError, "server error"),
    ];
    for (code, expected, description) in cases {
        let category = CloseCategory::from_close_code(code);
        assert_eq!(category, expected);
        assert_eq!(category.describe(), description);
    }
}

#[test]
fn ticker_frames_accept_mixed_field_encodings() {
    // the feed mixes numeric and string encodings for the same fields
    let frame = r#"{"type":"v2/ticker","symbol":"ETHUSDT","close":3000.5,"open":"2950.0","volume":"812.3"}"#;
    let data = serde_json::from_str::<ExchangeMessage>(frame)
        .unwrap()
        .to_market_data()
        .unwrap();

    assert_eq!(data.price, 3_000.5);
    assert_eq!(data.volume, 812.3);

    let event = ExchangeEvent::Ticker(data);
    assert!(matches!(event, ExchangeEvent::Ticker(_)));
}

// =============================================================================
// Dashboard surface
// =============================================================================

#[test]
fn dashboard_messages_round_trip() {
    let msg: ClientMessage =
        serde_json::from_str(r#"{"type":"subscribe","symbols":["BTCUSDT"]}"#).unwrap();
    assert!(matches!(msg, ClientMessage::Subscribe { .. }));

    let out = ServerMessage::Subscribed {
        symbols: vec!["BTCUSDT".to_string()],
    };
    let json = serde_json::to_string(&out).unwrap();
    assert!(json.contains("\"type\":\"subscribed\""));

    let err = ServerMessage::Error {
        error: "invalid message".to_string(),
    };
    let json = serde_json::to_string(&err).unwrap();
    assert!(json.contains("\"type\":\"error\""));
}
