use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Alert severity, ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

/// What kind of condition raised an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Drawdown,
    DailyLoss,
    RiskUtilization,
    PositionLimit,
    Correlation,
    StopTriggered,
    HealthCheck,
    Connection,
}

/// A threshold-breach alert.
///
/// Immutable after creation; only acknowledged/resolved through the
/// monitoring system.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskAlert {
    /// Unique alert ID.
    pub id: String,
    /// Condition category.
    pub kind: AlertKind,
    /// Severity.
    pub severity: AlertSeverity,
    /// Operator-facing message.
    pub message: String,
    /// Observed value at trigger time.
    pub value: f64,
    /// The threshold that was breached.
    pub threshold: f64,
    /// When the alert fired (ms).
    pub timestamp: i64,
    /// Whether an operator has acknowledged it.
    pub acknowledged: bool,
    /// When the alert was resolved (ms), if it has been.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<i64>,
}

impl RiskAlert {
    /// Create a new unacknowledged, unresolved alert.
    pub fn new(
        kind: AlertKind,
        severity: AlertSeverity,
        message: impl Into<String>,
        value: f64,
        threshold: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            severity,
            message: message.into(),
            value,
            threshold,
            timestamp: chrono::Utc::now().timestamp_millis(),
            acknowledged: false,
            resolved_at: None,
        }
    }
}

/// Derived portfolio risk snapshot.
///
/// Always recomputed from the position ledger and portfolio value; never
/// stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskMetrics {
    /// Current equity (portfolio value plus unrealized P&L).
    pub portfolio_value: f64,
    /// Sum of absolute position notionals.
    pub total_exposure: f64,
    /// Total unrealized P&L across open positions.
    pub unrealized_pnl: f64,
    /// Accumulated realized P&L.
    pub realized_pnl: f64,
    /// Equity change since the daily baseline.
    pub daily_pnl: f64,
    /// Current peak-to-trough decline, as a fraction of the peak.
    pub current_drawdown: f64,
    /// Worst drawdown observed.
    pub max_drawdown: f64,
    /// Exposure-weighted return volatility of open symbols.
    pub volatility: f64,
    /// 95% one-day value at risk.
    pub var_95: f64,
    /// Portfolio risk as a fraction of the configured ceiling.
    pub risk_utilization: f64,
    /// Number of open positions.
    pub open_positions: usize,
}
