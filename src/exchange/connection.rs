//! Exchange WebSocket connection manager.
//!
//! Maintains one live, authenticated socket to the exchange realtime feed:
//! - phase machine: Disconnected -> Connecting -> Connected -> Authenticating
//!   -> Authenticated, any phase -> Disconnected on close or error
//! - automatic reconnection with capped exponential backoff and jitter
//! - reference-counted subscription registry that survives reconnects
//! - heartbeat staleness detection
//! - typed fan-out of incoming frames over a broadcast channel
//!
//! WebSocket failures never crash the process; they degrade the manager to
//! Disconnected and schedule a reconnect.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Notify};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::config::{ConnectionConfig, ExchangeConfig};
use crate::error::EngineError;
use crate::exchange::auth::sign_request;
use crate::logging::{LogBuffer, LogLevel};
use crate::types::{
    supports_wildcard, symbol_capped, AuthFrame, ChannelSpec, EnableHeartbeatFrame,
    ExchangeMessage, MarketData, OrderBook, SubscribeFrame, ALL_SYMBOLS,
};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

const EVENT_CHANNEL_CAPACITY: usize = 1024;
const MAX_RECENT_ERRORS: usize = 10;

/// Connection lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPhase {
    Disconnected,
    Connecting,
    Connected,
    Authenticating,
    Authenticated,
}

impl std::fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionPhase::Disconnected => "disconnected",
            ConnectionPhase::Connecting => "connecting",
            ConnectionPhase::Connected => "connected",
            ConnectionPhase::Authenticating => "authenticating",
            ConnectionPhase::Authenticated => "authenticated",
        };
        write!(f, "{}", s)
    }
}

/// Operator-facing classification of why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseCategory {
    Normal,
    GoingAway,
    ProtocolError,
    AbnormalClosure,
    PolicyViolation,
    ServerError,
    Timeout,
    Unknown,
}

impl CloseCategory {
    /// Classify a WebSocket close code.
    pub fn from_close_code(code: u16) -> Self {
        match code {
            1000 => CloseCategory::Normal,
            1001 => CloseCategory::GoingAway,
            1002 | 1003 | 1007 => CloseCategory::ProtocolError,
            1006 => CloseCategory::AbnormalClosure,
            1008 => CloseCategory::PolicyViolation,
            1011..=1014 => CloseCategory::ServerError,
            _ => CloseCategory::Unknown,
        }
    }

    fn from_close_frame(frame: Option<CloseFrame<'_>>) -> Self {
        match frame {
            Some(f) => Self::from_close_code(f.code.into()),
            None => CloseCategory::AbnormalClosure,
        }
    }

    fn from_error(err: &EngineError) -> Self {
        match err {
            EngineError::Timeout(_) => CloseCategory::Timeout,
            _ => CloseCategory::AbnormalClosure,
        }
    }

    /// Human-readable description for diagnostics.
    pub fn describe(&self) -> &'static str {
        match self {
            CloseCategory::Normal => "clean close",
            CloseCategory::GoingAway => "server going away",
            CloseCategory::ProtocolError => "protocol error",
            CloseCategory::AbnormalClosure => "abnormal closure",
            CloseCategory::PolicyViolation => "policy violation",
            CloseCategory::ServerError => "server error",
            CloseCategory::Timeout => "timeout",
            CloseCategory::Unknown => "unknown close reason",
        }
    }
}

/// Typed events fanned out to subscribers.
#[derive(Debug, Clone)]
pub enum ExchangeEvent {
    Ticker(MarketData),
    OrderBook(OrderBook),
    PositionUpdate {
        symbol: String,
        size: f64,
        entry_price: f64,
    },
    MarginUpdate {
        asset: String,
        available: f64,
    },
    PhaseChanged(ConnectionPhase),
    Disconnected(CloseCategory),
}

/// Snapshot of connection state for diagnostics endpoints.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub phase: ConnectionPhase,
    pub is_connected: bool,
    pub is_authenticated: bool,
    pub reconnect_attempts: u32,
    pub subscriptions: Vec<ChannelSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<i64>,
    pub recent_errors: Vec<String>,
}

/// Validate a feed URL before dialing.
///
/// Accepts `wss://` anywhere and `ws://` only for local endpoints; rejects
/// empty and placeholder hosts.
pub(crate) fn validate_ws_url(url: &str) -> Result<(), EngineError> {
    let rest = if let Some(rest) = url.strip_prefix("wss://") {
        rest
    } else if let Some(rest) = url.strip_prefix("ws://") {
        let host = host_of(rest);
        if !matches!(host, "localhost" | "127.0.0.1" | "0.0.0.0") {
            return Err(EngineError::Validation(format!(
                "insecure ws:// scheme is only allowed for local endpoints, got host '{}'",
                host
            )));
        }
        rest
    } else {
        return Err(EngineError::Validation(format!(
            "WebSocket URL must use wss:// (or ws:// for localhost): {}",
            url
        )));
    };

    let host = host_of(rest);
    if host.is_empty() {
        return Err(EngineError::Validation(format!("empty host in URL: {}", url)));
    }
    if host == "example.com"
        || host.ends_with(".example.com")
        || host.contains("your-")
        || host.contains("placeholder")
    {
        return Err(EngineError::Validation(format!(
            "placeholder host in URL: {}",
            host
        )));
    }
    Ok(())
}

fn host_of(after_scheme: &str) -> &str {
    let end = after_scheme
        .find(['/', ':', '?'])
        .unwrap_or(after_scheme.len());
    &after_scheme[..end]
}

// =============================================================================
// Subscription registry
// =============================================================================

/// Reference-counted, ordered record of what should be subscribed.
///
/// This is the single source of truth consulted on every reconnect;
/// registration order is preserved so re-subscription is deterministic.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    channels: Vec<ChannelState>,
}

struct ChannelState {
    name: String,
    wildcard_refs: u32,
    /// Symbol -> refcount, in first-registration order.
    symbols: Vec<(String, u32)>,
}

impl SubscriptionRegistry {
    /// Merge requested channels into the registry.
    ///
    /// Returns the specs that newly require a wire subscription. Rejects
    /// wildcard requests on channels that do not support them and symbol
    /// lists that would push a capped channel past `max_symbols`.
    pub(crate) fn subscribe(
        &mut self,
        requests: &[ChannelSpec],
        max_symbols: usize,
    ) -> Result<Vec<ChannelSpec>, EngineError> {
        // Validate everything first so a rejected request changes nothing.
        for req in requests {
            let wildcard = is_wildcard_request(req);
            if wildcard && !supports_wildcard(&req.name) {
                return Err(EngineError::Validation(format!(
                    "channel '{}' does not support the '{}' wildcard",
                    req.name, ALL_SYMBOLS
                )));
            }
            if symbol_capped(&req.name) {
                let requested: usize = req.symbols.as_ref().map(|s| s.len()).unwrap_or(0);
                let existing = self
                    .channels
                    .iter()
                    .find(|c| c.name == req.name)
                    .map(|c| c.symbols.len())
                    .unwrap_or(0);
                if existing + requested > max_symbols {
                    return Err(EngineError::Validation(format!(
                        "channel '{}' allows at most {} symbols per subscription",
                        req.name, max_symbols
                    )));
                }
            }
        }

        let mut new_specs = Vec::new();
        for req in requests {
            let idx = match self.channels.iter().position(|c| c.name == req.name) {
                Some(idx) => idx,
                None => {
                    self.channels.push(ChannelState {
                        name: req.name.clone(),
                        wildcard_refs: 0,
                        symbols: Vec::new(),
                    });
                    self.channels.len() - 1
                }
            };
            let state = &mut self.channels[idx];

            if is_wildcard_request(req) {
                state.wildcard_refs += 1;
                if state.wildcard_refs == 1 {
                    new_specs.push(ChannelSpec::all(&req.name));
                }
                continue;
            }

            let mut fresh = Vec::new();
            for symbol in req.symbols.as_deref().unwrap_or_default() {
                match state.symbols.iter_mut().find(|(s, _)| s == symbol) {
                    Some((_, refs)) => *refs += 1,
                    None => {
                        state.symbols.push((symbol.clone(), 1));
                        fresh.push(symbol.clone());
                    }
                }
            }
            if !fresh.is_empty() {
                new_specs.push(ChannelSpec::with_symbols(&req.name, fresh));
            }
        }
        Ok(new_specs)
    }

    /// Drop references; returns the specs whose last reference went away and
    /// therefore need a wire unsubscribe. Unsubscribing an absent channel or
    /// symbol is a no-op.
    pub(crate) fn unsubscribe(&mut self, requests: &[ChannelSpec]) -> Vec<ChannelSpec> {
        let mut removed_specs = Vec::new();
        for req in requests {
            let Some(idx) = self.channels.iter().position(|c| c.name == req.name) else {
                continue;
            };
            let state = &mut self.channels[idx];

            if is_wildcard_request(req) {
                if state.wildcard_refs > 0 {
                    state.wildcard_refs -= 1;
                    if state.wildcard_refs == 0 {
                        removed_specs.push(ChannelSpec::all(&req.name));
                    }
                }
            } else {
                let mut dropped = Vec::new();
                for symbol in req.symbols.as_deref().unwrap_or_default() {
                    if let Some(pos) = state.symbols.iter().position(|(s, _)| s == symbol) {
                        state.symbols[pos].1 -= 1;
                        if state.symbols[pos].1 == 0 {
                            state.symbols.remove(pos);
                            dropped.push(symbol.clone());
                        }
                    }
                }
                if !dropped.is_empty() {
                    removed_specs.push(ChannelSpec::with_symbols(&req.name, dropped));
                }
            }

            if self.channels[idx].wildcard_refs == 0 && self.channels[idx].symbols.is_empty() {
                self.channels.remove(idx);
            }
        }
        removed_specs
    }

    /// Full remembered set, in registration order.
    pub(crate) fn snapshot(&self) -> Vec<ChannelSpec> {
        self.channels
            .iter()
            .map(|c| {
                if c.wildcard_refs > 0 {
                    ChannelSpec::all(&c.name)
                } else {
                    ChannelSpec::with_symbols(
                        &c.name,
                        c.symbols.iter().map(|(s, _)| s.clone()).collect(),
                    )
                }
            })
            .collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

fn is_wildcard_request(spec: &ChannelSpec) -> bool {
    match &spec.symbols {
        None => true,
        Some(symbols) => symbols.iter().any(|s| s == ALL_SYMBOLS),
    }
}

// =============================================================================
// Connection manager
// =============================================================================

enum PendingOp {
    Subscribe(Vec<ChannelSpec>),
    Unsubscribe(Vec<ChannelSpec>),
}

struct Inner {
    exchange: ExchangeConfig,
    config: ConnectionConfig,
    log: Arc<LogBuffer>,
    phase: RwLock<ConnectionPhase>,
    reconnect_attempts: AtomicU32,
    registry: Mutex<SubscriptionRegistry>,
    pending: Mutex<VecDeque<PendingOp>>,
    last_heartbeat: Mutex<Option<(Instant, i64)>>,
    recent_errors: Mutex<VecDeque<String>>,
    events: broadcast::Sender<ExchangeEvent>,
    shutdown: AtomicBool,
    shutdown_notify: Notify,
    running: AtomicBool,
}

/// Shared, auto-reconnecting exchange feed connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Create a new (disconnected) manager.
    pub fn new(exchange: ExchangeConfig, config: ConnectionConfig, log: Arc<LogBuffer>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                exchange,
                config,
                log,
                phase: RwLock::new(ConnectionPhase::Disconnected),
                reconnect_attempts: AtomicU32::new(0),
                registry: Mutex::new(SubscriptionRegistry::default()),
                pending: Mutex::new(VecDeque::new()),
                last_heartbeat: Mutex::new(None),
                recent_errors: Mutex::new(VecDeque::new()),
                events,
                shutdown: AtomicBool::new(false),
                shutdown_notify: Notify::new(),
                running: AtomicBool::new(false),
            }),
        }
    }

    /// Subscribe to typed feed events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ExchangeEvent> {
        self.inner.events.subscribe()
    }

    /// Current phase.
    pub fn phase(&self) -> ConnectionPhase {
        *self.inner.phase.read().expect("phase lock poisoned")
    }

    /// Whether the socket is usable (connected, possibly pre-auth).
    pub fn is_connected(&self) -> bool {
        matches!(
            self.phase(),
            ConnectionPhase::Connected
                | ConnectionPhase::Authenticating
                | ConnectionPhase::Authenticated
        )
    }

    /// Whether private channels are available.
    pub fn is_authenticated(&self) -> bool {
        self.phase() == ConnectionPhase::Authenticated
    }

    /// Diagnostic snapshot.
    pub fn status(&self) -> ConnectionStatus {
        let phase = self.phase();
        ConnectionStatus {
            phase,
            is_connected: self.is_connected(),
            is_authenticated: phase == ConnectionPhase::Authenticated,
            reconnect_attempts: self.inner.reconnect_attempts.load(Ordering::Relaxed),
            subscriptions: self
                .inner
                .registry
                .lock()
                .map(|r| r.snapshot())
                .unwrap_or_default(),
            last_heartbeat: self
                .inner
                .last_heartbeat
                .lock()
                .ok()
                .and_then(|hb| (*hb).map(|(_, ts)| ts)),
            recent_errors: self
                .inner
                .recent_errors
                .lock()
                .map(|e| e.iter().cloned().collect())
                .unwrap_or_default(),
        }
    }

    /// Start the connection loop. No-op when already connected or connecting.
    ///
    /// Validates the feed URL before dialing; a connect that does not
    /// establish within the configured timeout fails and is retried on the
    /// reconnect schedule.
    pub fn connect(&self) -> Result<(), EngineError> {
        validate_ws_url(&self.inner.exchange.ws_url)?;

        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.shutdown.store(false, Ordering::SeqCst);
        self.inner.reconnect_attempts.store(0, Ordering::Relaxed);

        let manager = self.clone();
        tokio::spawn(async move {
            manager.run().await;
            manager.inner.running.store(false, Ordering::SeqCst);
        });
        Ok(())
    }

    /// Close the socket, cancel reconnection, and reset state.
    ///
    /// The subscription registry is kept so a later `connect()` restores the
    /// remembered set.
    pub fn disconnect(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.shutdown_notify.notify_waiters();
        self.inner.reconnect_attempts.store(0, Ordering::Relaxed);
        if let Ok(mut hb) = self.inner.last_heartbeat.lock() {
            *hb = None;
        }
        if let Ok(mut errors) = self.inner.recent_errors.lock() {
            errors.clear();
        }
    }

    /// Merge channels into the subscription set.
    ///
    /// New channels/symbols are sent on the wire immediately when connected;
    /// either way the registry remembers them for the next (re)connect.
    pub fn subscribe(&self, channels: Vec<ChannelSpec>) -> Result<(), EngineError> {
        let new_specs = self
            .inner
            .registry
            .lock()
            .expect("registry lock poisoned")
            .subscribe(&channels, self.inner.config.max_symbols_per_subscription)?;

        if !new_specs.is_empty() {
            if let Ok(mut pending) = self.inner.pending.lock() {
                pending.push_back(PendingOp::Subscribe(new_specs));
            }
        }
        Ok(())
    }

    /// Drop channel references. Unsubscribing something that was never
    /// subscribed is a no-op.
    pub fn unsubscribe(&self, channels: Vec<ChannelSpec>) {
        let removed = self
            .inner
            .registry
            .lock()
            .expect("registry lock poisoned")
            .unsubscribe(&channels);

        if !removed.is_empty() {
            if let Ok(mut pending) = self.inner.pending.lock() {
                pending.push_back(PendingOp::Unsubscribe(removed));
            }
        }
    }

    // -------------------------------------------------------------------------
    // Connection loop
    // -------------------------------------------------------------------------

    async fn run(&self) {
        loop {
            if self.inner.shutdown.load(Ordering::SeqCst) {
                break;
            }

            let mut established = false;
            let outcome = self.run_session(&mut established).await;
            let category = match outcome {
                Ok(category) => {
                    self.inner.log.log(
                        LogLevel::Info,
                        "connection",
                        None,
                        format!("feed connection closed: {}", category.describe()),
                    );
                    category
                }
                Err(err) => {
                    let category = CloseCategory::from_error(&err);
                    self.record_error(format!("{} ({})", err, category.describe()));
                    category
                }
            };

            self.set_phase(ConnectionPhase::Disconnected);
            let _ = self.inner.events.send(ExchangeEvent::Disconnected(category));

            if self.inner.shutdown.load(Ordering::SeqCst) || category == CloseCategory::Normal {
                break;
            }

            if established {
                self.inner.reconnect_attempts.store(0, Ordering::Relaxed);
            }
            let attempt = self.inner.reconnect_attempts.fetch_add(1, Ordering::Relaxed) + 1;
            if attempt > self.inner.config.max_reconnect_attempts {
                self.inner.log.log(
                    LogLevel::Error,
                    "connection",
                    None,
                    format!(
                        "giving up after {} reconnect attempts",
                        self.inner.config.max_reconnect_attempts
                    ),
                );
                break;
            }

            let delay = self.reconnect_delay(attempt);
            info!(
                "Reconnecting to feed in {:?} (attempt {}/{})",
                delay, attempt, self.inner.config.max_reconnect_attempts
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.inner.shutdown_notify.notified() => break,
            }
        }
    }

    /// One connection session, from dial to close.
    async fn run_session(&self, established: &mut bool) -> Result<CloseCategory, EngineError> {
        self.set_phase(ConnectionPhase::Connecting);

        let connect_timeout = Duration::from_millis(self.inner.config.connect_timeout_ms);
        let dial = connect_async(self.inner.exchange.ws_url.as_str());
        let (stream, _) = tokio::time::timeout(connect_timeout, dial)
            .await
            .map_err(|_| EngineError::Timeout(self.inner.config.connect_timeout_ms))??;

        *established = true;
        self.touch_heartbeat();
        self.set_phase(ConnectionPhase::Connected);
        info!("Connected to exchange feed");

        let (mut write, mut read) = stream.split();

        send_json(&mut write, &EnableHeartbeatFrame::default()).await?;

        if self.inner.exchange.has_credentials() {
            self.set_phase(ConnectionPhase::Authenticating);
            self.send_auth(&mut write).await?;
        }

        // Re-issue the full remembered subscription set, in registration
        // order. Deltas queued while disconnected are superseded by it.
        let snapshot = {
            let registry = self.inner.registry.lock().expect("registry lock poisoned");
            registry.snapshot()
        };
        if let Ok(mut pending) = self.inner.pending.lock() {
            pending.clear();
        }
        if !snapshot.is_empty() {
            send_json(&mut write, &SubscribeFrame::subscribe(snapshot)).await?;
        }

        let heartbeat_timeout = Duration::from_millis(self.inner.config.heartbeat_timeout_ms);
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.handle_frame(&text),
                    Some(Ok(Message::Ping(data))) => {
                        write.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        return Ok(CloseCategory::from_close_frame(frame));
                    }
                    Some(Err(err)) => return Err(err.into()),
                    None => return Ok(CloseCategory::AbnormalClosure),
                    _ => {}
                },
                _ = tick.tick() => {
                    if self.inner.shutdown.load(Ordering::SeqCst) {
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(CloseCategory::Normal);
                    }

                    self.drain_pending(&mut write).await?;

                    let stale = self
                        .inner
                        .last_heartbeat
                        .lock()
                        .ok()
                        .and_then(|hb| (*hb).map(|(at, _)| at.elapsed() > heartbeat_timeout))
                        .unwrap_or(false);
                    if stale {
                        warn!("No heartbeat for {:?}, recycling connection", heartbeat_timeout);
                        return Err(EngineError::Timeout(self.inner.config.heartbeat_timeout_ms));
                    }
                }
            }
        }
    }

    async fn send_auth(&self, write: &mut WsSink) -> Result<(), EngineError> {
        let api_key = self.inner.exchange.api_key.clone().unwrap_or_default();
        let secret = self.inner.exchange.api_secret.clone().unwrap_or_default();
        let timestamp = chrono::Utc::now().timestamp().to_string();
        let signature = sign_request(&secret, "GET", &timestamp, "/ws");

        let frame = AuthFrame {
            msg_type: "auth".to_string(),
            api_key,
            signature,
            timestamp,
        };
        send_json(write, &frame).await
    }

    async fn drain_pending(&self, write: &mut WsSink) -> Result<(), EngineError> {
        loop {
            let op = match self.inner.pending.lock() {
                Ok(mut pending) => pending.pop_front(),
                Err(_) => None,
            };
            let Some(op) = op else { break };

            let frame = match op {
                PendingOp::Subscribe(specs) => SubscribeFrame::subscribe(specs),
                PendingOp::Unsubscribe(specs) => SubscribeFrame::unsubscribe(specs),
            };
            send_json(write, &frame).await?;
        }
        Ok(())
    }

    /// Demultiplex one incoming frame. Malformed JSON is logged and dropped.
    fn handle_frame(&self, text: &str) {
        let msg: ExchangeMessage = match serde_json::from_str(text) {
            Ok(msg) => msg,
            Err(err) => {
                self.inner.log.log(
                    LogLevel::Warn,
                    "connection",
                    None,
                    format!("dropping malformed frame: {}", err),
                );
                return;
            }
        };

        // Any inbound traffic proves the connection is alive.
        self.touch_heartbeat();

        match &msg {
            ExchangeMessage::Ticker { .. } => {
                if let Some(data) = msg.to_market_data() {
                    let _ = self.inner.events.send(ExchangeEvent::Ticker(data));
                }
            }
            ExchangeMessage::L2Orderbook { .. } => {
                if let Some(book) = msg.to_order_book() {
                    let _ = self.inner.events.send(ExchangeEvent::OrderBook(book));
                }
            }
            ExchangeMessage::Positions {
                symbol,
                size,
                entry_price,
                ..
            } => {
                let _ = self.inner.events.send(ExchangeEvent::PositionUpdate {
                    symbol: symbol.clone(),
                    size: size.as_ref().and_then(|f| f.as_f64()).unwrap_or(0.0),
                    entry_price: entry_price.as_ref().and_then(|f| f.as_f64()).unwrap_or(0.0),
                });
            }
            ExchangeMessage::Margins {
                asset_symbol,
                available_balance,
                ..
            } => {
                let _ = self.inner.events.send(ExchangeEvent::MarginUpdate {
                    asset: asset_symbol.clone().unwrap_or_default(),
                    available: available_balance
                        .as_ref()
                        .and_then(|f| f.as_f64())
                        .unwrap_or(0.0),
                });
            }
            ExchangeMessage::Heartbeat { .. } => {}
            ExchangeMessage::Subscriptions { channels } => {
                debug!("Subscription ack for {} channels", channels.len());
            }
            ExchangeMessage::Success { message } => {
                if self.phase() == ConnectionPhase::Authenticating {
                    self.set_phase(ConnectionPhase::Authenticated);
                    info!("Feed authentication succeeded");
                } else {
                    debug!("Server success: {:?}", message);
                }
            }
            ExchangeMessage::Error { message, code } => {
                let detail = message.clone().unwrap_or_else(|| "unspecified".to_string());
                if self.phase() == ConnectionPhase::Authenticating {
                    // Private channels stay unavailable; public data keeps flowing.
                    self.set_phase(ConnectionPhase::Connected);
                    self.record_error(format!("authentication failed: {}", detail));
                    self.inner.log.log(
                        LogLevel::Error,
                        "connection",
                        None,
                        format!("feed authentication failed: {}", detail),
                    );
                } else {
                    self.record_error(format!("server error {:?}: {}", code, detail));
                }
            }
            ExchangeMessage::Unknown => {
                debug!("Unhandled frame type");
            }
        }
    }

    fn set_phase(&self, phase: ConnectionPhase) {
        {
            let mut current = self.inner.phase.write().expect("phase lock poisoned");
            if *current == phase {
                return;
            }
            *current = phase;
        }
        debug!("Connection phase -> {}", phase);
        let _ = self.inner.events.send(ExchangeEvent::PhaseChanged(phase));
    }

    fn touch_heartbeat(&self) {
        if let Ok(mut hb) = self.inner.last_heartbeat.lock() {
            *hb = Some((Instant::now(), chrono::Utc::now().timestamp_millis()));
        }
    }

    fn record_error(&self, message: String) {
        warn!("Feed error: {}", message);
        if let Ok(mut errors) = self.inner.recent_errors.lock() {
            if errors.len() >= MAX_RECENT_ERRORS {
                errors.pop_front();
            }
            errors.push_back(message);
        }
    }

    fn reconnect_delay(&self, attempt: u32) -> Duration {
        let base = self.inner.config.reconnect_base_delay_ms;
        let max = self.inner.config.reconnect_max_delay_ms;
        let exp = base.saturating_mul(1u64 << (attempt.saturating_sub(1)).min(16));
        let capped = exp.min(max);
        let jitter = rand::thread_rng().gen_range(0..=capped / 4);
        Duration::from_millis(capped + jitter)
    }
}

async fn send_json<T: Serialize>(write: &mut WsSink, frame: &T) -> Result<(), EngineError> {
    let json = serde_json::to_string(frame)?;
    write.send(Message::Text(json)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange_config(ws_url: &str) -> ExchangeConfig {
        ExchangeConfig {
            rest_url: "https://api.test".to_string(),
            ws_url: ws_url.to_string(),
            api_key: None,
            api_secret: None,
        }
    }

    fn manager(ws_url: &str) -> ConnectionManager {
        ConnectionManager::new(
            exchange_config(ws_url),
            ConnectionConfig::default(),
            Arc::new(LogBuffer::default()),
        )
    }

    // =========================================================================
    // URL validation
    // =========================================================================

    #[test]
    fn test_validate_secure_url() {
        assert!(validate_ws_url("wss://socket.india.delta.exchange").is_ok());
        assert!(validate_ws_url("wss://socket.india.delta.exchange/ws").is_ok());
    }

    #[test]
    fn test_validate_local_insecure_url() {
        assert!(validate_ws_url("ws://localhost:9001").is_ok());
        assert!(validate_ws_url("ws://127.0.0.1/feed").is_ok());
        assert!(validate_ws_url("ws://api.example.org").is_err());
    }

    #[test]
    fn test_validate_rejects_bad_schemes_and_hosts() {
        assert!(validate_ws_url("http://socket.exchange").is_err());
        assert!(validate_ws_url("wss://").is_err());
        assert!(validate_ws_url("wss://example.com/ws").is_err());
        assert!(validate_ws_url("wss://your-exchange.com").is_err());
        assert!(validate_ws_url("wss://feed.example.com").is_err());
    }

    // =========================================================================
    // Close classification
    // =========================================================================

    #[test]
    fn test_close_code_classification() {
        assert_eq!(CloseCategory::from_close_code(1000), CloseCategory::Normal);
        assert_eq!(CloseCategory::from_close_code(1001), CloseCategory::GoingAway);
        assert_eq!(CloseCategory::from_close_code(1002), CloseCategory::ProtocolError);
        assert_eq!(CloseCategory::from_close_code(1006), CloseCategory::AbnormalClosure);
        assert_eq!(CloseCategory::from_close_code(1008), CloseCategory::PolicyViolation);
        assert_eq!(CloseCategory::from_close_code(1011), CloseCategory::ServerError);
        assert_eq!(CloseCategory::from_close_code(4000), CloseCategory::Unknown);
    }

    #[test]
    fn test_error_classification() {
        assert_eq!(
            CloseCategory::from_error(&EngineError::Timeout(10_000)),
            CloseCategory::Timeout
        );
        assert_eq!(
            CloseCategory::from_error(&EngineError::WebSocket("reset".to_string())),
            CloseCategory::AbnormalClosure
        );
    }

    // =========================================================================
    // Subscription registry
    // =========================================================================

    #[test]
    fn test_registry_merges_and_refcounts() {
        let mut registry = SubscriptionRegistry::default();

        let first = registry
            .subscribe(
                &[ChannelSpec::with_symbols(
                    "v2/ticker",
                    vec!["BTCUSDT".to_string()],
                )],
                20,
            )
            .unwrap();
        assert_eq!(first.len(), 1);

        // second consumer of the same symbol shares the wire subscription
        let second = registry
            .subscribe(
                &[ChannelSpec::with_symbols(
                    "v2/ticker",
                    vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
                )],
                20,
            )
            .unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].symbols.as_deref(), Some(&["ETHUSDT".to_string()][..]));

        // first unsubscribe drops one reference, keeps the wire subscription
        let removed = registry.unsubscribe(&[ChannelSpec::with_symbols(
            "v2/ticker",
            vec!["BTCUSDT".to_string()],
        )]);
        assert!(removed.is_empty());

        // last reference gone: wire unsubscribe emitted
        let removed = registry.unsubscribe(&[ChannelSpec::with_symbols(
            "v2/ticker",
            vec!["BTCUSDT".to_string()],
        )]);
        assert_eq!(removed.len(), 1);
    }

    #[test]
    fn test_registry_unsubscribe_absent_is_noop() {
        let mut registry = SubscriptionRegistry::default();
        let removed = registry.unsubscribe(&[ChannelSpec::with_symbols(
            "v2/ticker",
            vec!["BTCUSDT".to_string()],
        )]);
        assert!(removed.is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_registry_wildcard_rules() {
        let mut registry = SubscriptionRegistry::default();

        // wildcard allowed on broadcast channels
        assert!(registry
            .subscribe(&[ChannelSpec::all("funding_rate")], 20)
            .is_ok());

        // rejected on depth channels
        let result = registry.subscribe(&[ChannelSpec::all("l2_orderbook")], 20);
        assert!(matches!(result, Err(EngineError::Validation(_))));

        // explicit "all" symbol is treated as a wildcard request too
        let result = registry.subscribe(
            &[ChannelSpec::with_symbols(
                "l2_updates",
                vec![ALL_SYMBOLS.to_string()],
            )],
            20,
        );
        assert!(matches!(result, Err(EngineError::Validation(_))));
    }

    #[test]
    fn test_registry_symbol_cap() {
        let mut registry = SubscriptionRegistry::default();
        let many: Vec<String> = (0..21).map(|i| format!("SYM{}USDT", i)).collect();

        let result = registry.subscribe(&[ChannelSpec::with_symbols("l2_orderbook", many)], 20);
        assert!(matches!(result, Err(EngineError::Validation(_))));

        // a rejected request must not leave partial state behind
        assert!(registry.is_empty());

        let twenty: Vec<String> = (0..20).map(|i| format!("SYM{}USDT", i)).collect();
        assert!(registry
            .subscribe(&[ChannelSpec::with_symbols("l2_orderbook", twenty)], 20)
            .is_ok());

        // one more symbol would exceed the cap across calls
        let result = registry.subscribe(
            &[ChannelSpec::with_symbols(
                "l2_orderbook",
                vec!["EXTRAUSDT".to_string()],
            )],
            20,
        );
        assert!(matches!(result, Err(EngineError::Validation(_))));
    }

    #[test]
    fn test_registry_snapshot_preserves_order() {
        let mut registry = SubscriptionRegistry::default();
        registry
            .subscribe(
                &[ChannelSpec::with_symbols("v2/ticker", vec!["BTCUSDT".to_string()])],
                20,
            )
            .unwrap();
        registry
            .subscribe(&[ChannelSpec::all("funding_rate")], 20)
            .unwrap();
        registry
            .subscribe(
                &[ChannelSpec::with_symbols("v2/ticker", vec!["ETHUSDT".to_string()])],
                20,
            )
            .unwrap();

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].name, "v2/ticker");
        assert_eq!(
            snapshot[0].symbols.as_deref(),
            Some(&["BTCUSDT".to_string(), "ETHUSDT".to_string()][..])
        );
        assert_eq!(snapshot[1].name, "funding_rate");
        assert_eq!(snapshot[1].symbols, None);
    }

    // =========================================================================
    // Manager surface
    // =========================================================================

    #[test]
    fn test_connect_rejects_placeholder_url() {
        let manager = manager("wss://example.com/ws");
        assert!(matches!(
            manager.connect(),
            Err(EngineError::Validation(_))
        ));
        assert_eq!(manager.phase(), ConnectionPhase::Disconnected);
    }

    #[test]
    fn test_initial_status() {
        let manager = manager("wss://socket.india.delta.exchange");
        let status = manager.status();
        assert_eq!(status.phase, ConnectionPhase::Disconnected);
        assert!(!status.is_connected);
        assert!(!status.is_authenticated);
        assert_eq!(status.reconnect_attempts, 0);
        assert!(status.subscriptions.is_empty());
        assert!(status.last_heartbeat.is_none());
    }

    #[test]
    fn test_subscriptions_survive_while_disconnected() {
        let manager = manager("wss://socket.india.delta.exchange");
        manager
            .subscribe(vec![ChannelSpec::with_symbols(
                "v2/ticker",
                vec!["BTCUSDT".to_string()],
            )])
            .unwrap();

        let status = manager.status();
        assert_eq!(status.subscriptions.len(), 1);

        // repeated unsubscribe of an absent channel is a no-op
        manager.unsubscribe(vec![ChannelSpec::with_symbols(
            "mark_price",
            vec!["BTCUSDT".to_string()],
        )]);
        assert_eq!(manager.status().subscriptions.len(), 1);
    }

    #[test]
    fn test_handle_frame_malformed_json_is_dropped() {
        let manager = manager("wss://socket.india.delta.exchange");
        // must not panic, must not change phase
        manager.handle_frame("{this is not json");
        manager.handle_frame("");
        assert_eq!(manager.phase(), ConnectionPhase::Disconnected);
    }

    #[test]
    fn test_handle_frame_dispatches_ticker() {
        let manager = manager("wss://socket.india.delta.exchange");
        let mut events = manager.subscribe_events();

        manager.handle_frame(
            r#"{"type":"v2_ticker","symbol":"BTCUSDT","close":"50000","open":"49000"}"#,
        );

        match events.try_recv() {
            Ok(ExchangeEvent::Ticker(data)) => {
                assert_eq!(data.symbol, "BTCUSDT");
                assert!((data.change_percent - 2.0408).abs() < 0.001);
            }
            other => panic!("expected ticker event, got {:?}", other),
        }
    }

    #[test]
    fn test_reconnect_delay_bounded() {
        let manager = manager("wss://socket.india.delta.exchange");
        let max = Duration::from_millis(
            ConnectionConfig::default().reconnect_max_delay_ms
                + ConnectionConfig::default().reconnect_max_delay_ms / 4,
        );
        for attempt in 1..=30 {
            let delay = manager.reconnect_delay(attempt);
            assert!(delay <= max, "attempt {} delay {:?} over cap", attempt, delay);
            assert!(delay >= Duration::from_millis(1));
        }
    }
}
