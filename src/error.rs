use thiserror::Error;

/// Engine error taxonomy.
///
/// Retryability is an explicit property of each variant so the retry handler
/// and circuit breaker never have to guess from message text.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Rate limit exceeded")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Trading operation failed: {0}")]
    TradingOperation(String),

    #[error("Risk limit violated: {0}")]
    Risk(String),

    #[error("Request timed out after {0}ms")]
    Timeout(u64),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Circuit breaker open for {service}")]
    CircuitOpen { service: String },

    #[error("Request queue full ({pending} pending)")]
    QueueFull { pending: usize },
}

impl EngineError {
    /// Whether a retry could plausibly succeed.
    ///
    /// API errors are retryable only for server faults (5xx) and rate
    /// limiting (429). Validation, authentication, trading, and risk errors
    /// are never retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Network(_)
            | EngineError::RateLimited { .. }
            | EngineError::Timeout(_)
            | EngineError::WebSocket(_) => true,
            EngineError::Api { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Server-specified wait before the next attempt, if any.
    ///
    /// Only rate-limit errors carry one; the retry handler honors it
    /// verbatim instead of its exponential schedule.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            EngineError::RateLimited { retry_after_ms } => *retry_after_ms,
            _ => None,
        }
    }

    /// Errors that must surface immediately at CRITICAL severity.
    pub fn is_critical(&self) -> bool {
        matches!(self, EngineError::Authentication(_))
    }

    /// Short stable label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Network(_) => "network",
            EngineError::Api { .. } => "api",
            EngineError::Validation(_) => "validation",
            EngineError::RateLimited { .. } => "rate_limited",
            EngineError::Authentication(_) => "authentication",
            EngineError::TradingOperation(_) => "trading_operation",
            EngineError::Risk(_) => "risk",
            EngineError::Timeout(_) => "timeout",
            EngineError::WebSocket(_) => "websocket",
            EngineError::Parse(_) => "parse",
            EngineError::CircuitOpen { .. } => "circuit_open",
            EngineError::QueueFull { .. } => "queue_full",
        }
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            EngineError::Timeout(0)
        } else if err.is_connect() || err.is_request() {
            EngineError::Network(err.to_string())
        } else if let Some(status) = err.status() {
            EngineError::Api {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            EngineError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Parse(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for EngineError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        EngineError::WebSocket(err.to_string())
    }
}

/// An engine error tagged with the correlation id and timestamp of the
/// request that produced it, so failures are traceable across logs and
/// retries.
#[derive(Error, Debug, Clone)]
#[error("{error} [correlation: {correlation_id}]")]
pub struct TracedError {
    pub error: EngineError,
    pub correlation_id: String,
    pub timestamp: i64,
}

impl TracedError {
    /// Tag an error with its originating correlation id.
    pub fn new(error: EngineError, correlation_id: impl Into<String>) -> Self {
        Self {
            error,
            correlation_id: correlation_id.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
