use std::env;

/// Exchange endpoint and credential configuration.
#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    /// REST base URL.
    pub rest_url: String,
    /// WebSocket feed URL.
    pub ws_url: String,
    /// API key for authenticated endpoints (optional, public data works without).
    pub api_key: Option<String>,
    /// API secret for request signing.
    pub api_secret: Option<String>,
}

impl ExchangeConfig {
    /// Whether credentials are present for authenticated channels.
    pub fn has_credentials(&self) -> bool {
        self.api_key.is_some() && self.api_secret.is_some()
    }
}

/// Rate limiter tunables.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Base ceiling per rolling second.
    pub requests_per_second: u32,
    /// Ceiling per rolling minute.
    pub requests_per_minute: u32,
    /// Ceiling per rolling hour.
    pub requests_per_hour: u32,
    /// Maximum queued requests before synchronous rejection.
    pub queue_capacity: usize,
    /// Calls faster than this count as "fast" for adaptive loosening (ms).
    pub fast_call_threshold_ms: u64,
    /// Calls slower than this count as "slow" for adaptive tightening (ms).
    pub slow_call_threshold_ms: u64,
    /// Multiplier applied when loosening.
    pub adaptive_increase: f64,
    /// Multiplier applied when tightening.
    pub adaptive_decrease: f64,
    /// Lower bound on the adaptive multiplier.
    pub adaptive_floor: f64,
    /// Upper bound on the adaptive multiplier.
    pub adaptive_ceiling: f64,
    /// Minimum interval between adaptive adjustments (ms).
    pub adjustment_cooldown_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 10,
            requests_per_minute: 300,
            requests_per_hour: 10_000,
            queue_capacity: 256,
            fast_call_threshold_ms: 200,
            slow_call_threshold_ms: 2_000,
            adaptive_increase: 1.1,
            adaptive_decrease: 0.8,
            adaptive_floor: 0.25,
            adaptive_ceiling: 2.0,
            adjustment_cooldown_ms: 5_000,
        }
    }
}

/// Retry policy tunables.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt (ms).
    pub base_delay_ms: u64,
    /// Ceiling on any single delay (ms).
    pub max_delay_ms: u64,
    /// Exponential growth factor.
    pub multiplier: f64,
    /// Maximum random jitter added to each delay (ms).
    pub jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 10_000,
            multiplier: 2.0,
            jitter_ms: 250,
        }
    }
}

/// Circuit breaker tunables.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// How long the circuit stays open before a half-open probe (ms).
    pub recovery_timeout_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 30_000,
        }
    }
}

/// WebSocket connection tunables.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Connection establishment timeout (ms).
    pub connect_timeout_ms: u64,
    /// Reconnect after this long without a server heartbeat (ms).
    pub heartbeat_timeout_ms: u64,
    /// Give up reconnecting after this many consecutive failures.
    pub max_reconnect_attempts: u32,
    /// First reconnect delay (ms); doubles per attempt.
    pub reconnect_base_delay_ms: u64,
    /// Ceiling on the reconnect delay (ms).
    pub reconnect_max_delay_ms: u64,
    /// Maximum symbols per subscription on depth channels.
    pub max_symbols_per_subscription: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            heartbeat_timeout_ms: 35_000,
            max_reconnect_attempts: 10,
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 30_000,
            max_symbols_per_subscription: 20,
        }
    }
}

/// REST client tunables.
#[derive(Debug, Clone)]
pub struct RestConfig {
    /// Default per-request timeout (ms).
    pub timeout_ms: u64,
    /// TTL for cached GET responses (ms).
    pub cache_ttl_ms: u64,
    /// Route requests through the rate limiter.
    pub use_rate_limiter: bool,
    /// Wrap requests in the retry handler.
    pub use_retry: bool,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            cache_ttl_ms: 5_000,
            use_rate_limiter: true,
            use_retry: true,
        }
    }
}

/// Risk management limits.
#[derive(Debug, Clone)]
pub struct RiskConfig {
    /// Maximum single-position value as a fraction of portfolio value.
    pub max_position_size: f64,
    /// Maximum simultaneous open positions.
    pub max_open_positions: usize,
    /// Drawdown fraction that suspends trading.
    pub max_drawdown: f64,
    /// Daily loss fraction that suspends trading.
    pub max_daily_loss: f64,
    /// Maximum allowed correlation with existing holdings.
    pub max_correlation: f64,
    /// Ceiling on volatility-weighted portfolio risk.
    pub max_portfolio_risk: f64,
    /// Fixed stop-loss distance (fraction of entry).
    pub stop_loss_pct: f64,
    /// Fixed take-profit distance (fraction of entry).
    pub take_profit_pct: f64,
    /// Rolling return samples kept per symbol for volatility/correlation.
    pub return_window: usize,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_position_size: 0.05,
            max_open_positions: 10,
            max_drawdown: 0.10,
            max_daily_loss: 0.05,
            max_correlation: 0.7,
            max_portfolio_risk: 0.5,
            stop_loss_pct: 0.02,
            take_profit_pct: 0.04,
            return_window: 120,
        }
    }
}

/// Monitoring tunables.
#[derive(Debug, Clone)]
pub struct MonitoringConfig {
    /// Health check interval (ms).
    pub health_check_interval_ms: u64,
    /// Per-probe timeout (ms).
    pub health_check_timeout_ms: u64,
    /// Metric sample retention window (ms).
    pub metric_retention_ms: u64,
    /// Maximum retained alerts.
    pub max_alerts: usize,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            health_check_interval_ms: 30_000,
            health_check_timeout_ms: 10_000,
            metric_retention_ms: 3_600_000,
            max_alerts: 500,
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host address.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Symbols streamed to dashboards by default.
    pub symbols: Vec<String>,
    /// Exchange endpoints and credentials.
    pub exchange: ExchangeConfig,
    /// Rate limiter tunables.
    pub rate_limit: RateLimitConfig,
    /// Retry policy.
    pub retry: RetryConfig,
    /// Circuit breaker.
    pub breaker: BreakerConfig,
    /// WebSocket connection.
    pub connection: ConnectionConfig,
    /// REST client.
    pub rest: RestConfig,
    /// Risk limits.
    pub risk: RiskConfig,
    /// Monitoring.
    pub monitoring: MonitoringConfig,
}

const PRODUCTION_REST_URL: &str = "https://api.india.delta.exchange";
const PRODUCTION_WS_URL: &str = "wss://socket.india.delta.exchange";
const TESTNET_REST_URL: &str = "https://cdn-ind.testnet.deltaex.org";
const TESTNET_WS_URL: &str = "wss://socket-ind.testnet.deltaex.org";

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .map(|v| v == "true" || v == "1")
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let testnet = env_flag("EXCHANGE_TESTNET", false);
        let (default_rest, default_ws) = if testnet {
            (TESTNET_REST_URL, TESTNET_WS_URL)
        } else {
            (PRODUCTION_REST_URL, PRODUCTION_WS_URL)
        };

        let symbols = env::var("STREAM_SYMBOLS")
            .ok()
            .map(|s| {
                s.split(',')
                    .map(|sym| sym.trim().to_uppercase())
                    .filter(|sym| !sym.is_empty())
                    .collect()
            })
            .unwrap_or_else(|| {
                vec![
                    "BTCUSDT".to_string(),
                    "ETHUSDT".to_string(),
                    "SOLUSDT".to_string(),
                ]
            });

        Self {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env_parse("PORT", 3001),
            symbols,
            exchange: ExchangeConfig {
                rest_url: env::var("EXCHANGE_REST_URL")
                    .unwrap_or_else(|_| default_rest.to_string()),
                ws_url: env::var("EXCHANGE_WS_URL").unwrap_or_else(|_| default_ws.to_string()),
                api_key: env::var("EXCHANGE_API_KEY").ok(),
                api_secret: env::var("EXCHANGE_API_SECRET").ok(),
            },
            rate_limit: RateLimitConfig {
                requests_per_second: env_parse("RATE_LIMIT_PER_SECOND", 10),
                requests_per_minute: env_parse("RATE_LIMIT_PER_MINUTE", 300),
                requests_per_hour: env_parse("RATE_LIMIT_PER_HOUR", 10_000),
                queue_capacity: env_parse("RATE_LIMIT_QUEUE_CAPACITY", 256),
                ..RateLimitConfig::default()
            },
            retry: RetryConfig {
                max_attempts: env_parse("RETRY_MAX_ATTEMPTS", 3),
                base_delay_ms: env_parse("RETRY_BASE_DELAY_MS", 500),
                ..RetryConfig::default()
            },
            breaker: BreakerConfig {
                failure_threshold: env_parse("BREAKER_FAILURE_THRESHOLD", 5),
                recovery_timeout_ms: env_parse("BREAKER_RECOVERY_TIMEOUT_MS", 30_000),
            },
            connection: ConnectionConfig {
                connect_timeout_ms: env_parse("WS_CONNECT_TIMEOUT_MS", 10_000),
                heartbeat_timeout_ms: env_parse("WS_HEARTBEAT_TIMEOUT_MS", 35_000),
                max_reconnect_attempts: env_parse("WS_MAX_RECONNECT_ATTEMPTS", 10),
                ..ConnectionConfig::default()
            },
            rest: RestConfig {
                timeout_ms: env_parse("REST_TIMEOUT_MS", 10_000),
                cache_ttl_ms: env_parse("REST_CACHE_TTL_MS", 5_000),
                use_rate_limiter: env_flag("REST_USE_RATE_LIMITER", true),
                use_retry: env_flag("REST_USE_RETRY", true),
            },
            risk: RiskConfig {
                max_position_size: env_parse("RISK_MAX_POSITION_SIZE", 0.05),
                max_open_positions: env_parse("RISK_MAX_OPEN_POSITIONS", 10),
                max_drawdown: env_parse("RISK_MAX_DRAWDOWN", 0.10),
                max_daily_loss: env_parse("RISK_MAX_DAILY_LOSS", 0.05),
                ..RiskConfig::default()
            },
            monitoring: MonitoringConfig {
                health_check_interval_ms: env_parse("HEALTH_CHECK_INTERVAL_MS", 30_000),
                ..MonitoringConfig::default()
            },
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}
