//! Risk management engine.
//!
//! Authoritative decision point for whether a prospective trade is allowed,
//! and continuous monitor of open-position risk:
//! - position ledger, owned exclusively here and mutated only through these
//!   operations
//! - trade validation with downward quantity clamping for size violations
//! - volatility-scaled stop-loss / take-profit placement and unconditional
//!   trigger evaluation on every price tick
//! - drawdown and daily-loss limits that suspend trading (sticky until an
//!   explicit operator resume), risk-utilization warnings
//! - return-history volatility and Pearson correlation; no placeholder
//!   values
//!
//! Trading status: ACTIVE -> SUSPENDED on breach; SUSPENDED -> ACTIVE only
//! via `resume_trading()` — never automatic.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::NaiveDate;
use dashmap::DashMap;
use tracing::{info, warn};

use crate::config::RiskConfig;
use crate::error::EngineError;
use crate::services::MonitoringSystem;
use crate::types::{
    AlertKind, AlertSeverity, CloseReason, ClosedPosition, Position, PositionSide, RiskMetrics,
    TradeDecision,
};

/// Risk-utilization fraction that raises a warning (no suspension).
const UTILIZATION_WARNING_LEVEL: f64 = 0.8;
/// Minimum aligned return samples before a correlation is trusted.
const MIN_CORRELATION_SAMPLES: usize = 10;
/// 95% one-tailed normal quantile, for VaR.
const VAR_95_FACTOR: f64 = 1.65;
/// Closed positions kept for audit.
const MAX_CLOSED_HISTORY: usize = 256;

struct PriceTrack {
    last_price: f64,
    returns: VecDeque<f64>,
}

struct PortfolioState {
    /// Capital base; realized P&L folds in on close.
    base_value: f64,
    peak_equity: f64,
    max_drawdown: f64,
    realized_pnl: f64,
    daily_date: NaiveDate,
    daily_baseline: f64,
}

/// Risk manager. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct RiskManager {
    config: Arc<RiskConfig>,
    positions: Arc<DashMap<String, Position>>,
    history: Arc<DashMap<String, PriceTrack>>,
    closed: Arc<Mutex<VecDeque<ClosedPosition>>>,
    state: Arc<RwLock<PortfolioState>>,
    suspended: Arc<AtomicBool>,
    monitoring: MonitoringSystem,
}

impl RiskManager {
    /// Create a manager over an initial portfolio value.
    pub fn new(config: RiskConfig, monitoring: MonitoringSystem, portfolio_value: f64) -> Self {
        let today = chrono::Utc::now().date_naive();
        Self {
            config: Arc::new(config),
            positions: Arc::new(DashMap::new()),
            history: Arc::new(DashMap::new()),
            closed: Arc::new(Mutex::new(VecDeque::new())),
            state: Arc::new(RwLock::new(PortfolioState {
                base_value: portfolio_value,
                peak_equity: portfolio_value,
                max_drawdown: 0.0,
                realized_pnl: 0.0,
                daily_date: today,
                daily_baseline: portfolio_value,
            })),
            suspended: Arc::new(AtomicBool::new(false)),
            monitoring,
        }
    }

    // -------------------------------------------------------------------------
    // Trade validation
    // -------------------------------------------------------------------------

    /// Decide whether a prospective trade is allowed.
    ///
    /// Rejects outright when trading is suspended, when the position count is
    /// at its limit, when correlation with existing holdings exceeds the
    /// threshold, or when volatility-weighted portfolio risk would exceed its
    /// ceiling. When the only violation is the per-position size cap, the
    /// quantity is clamped down (never up) and the trade stays approved:
    /// `adjusted = floor(portfolio_value * max_position_size / price)`.
    pub fn validate_trade(
        &self,
        symbol: &str,
        _side: PositionSide,
        quantity: f64,
        price: f64,
        _strategy: &str,
    ) -> Result<TradeDecision, EngineError> {
        if quantity <= 0.0 {
            return Err(EngineError::Validation(format!(
                "quantity must be positive, got {}",
                quantity
            )));
        }
        if price <= 0.0 {
            return Err(EngineError::Validation(format!(
                "price must be positive, got {}",
                price
            )));
        }

        if self.is_trading_suspended() {
            return Ok(TradeDecision::rejected("trading is suspended"));
        }

        if self.positions.len() >= self.config.max_open_positions {
            return Ok(TradeDecision::rejected(format!(
                "maximum open positions reached ({})",
                self.config.max_open_positions
            )));
        }

        // Correlation against existing holdings in other symbols.
        for entry in self.positions.iter() {
            if entry.symbol == symbol {
                continue;
            }
            if let Some(corr) = self.correlation(symbol, &entry.symbol) {
                if corr.abs() > self.config.max_correlation {
                    return Ok(TradeDecision::rejected(format!(
                        "correlation with {} position is {:.2}, above the {:.2} limit",
                        entry.symbol, corr, self.config.max_correlation
                    )));
                }
            }
        }

        let equity = self.equity();
        if equity <= 0.0 {
            return Ok(TradeDecision::rejected("portfolio value is not positive"));
        }

        // Aggregate volatility-weighted risk including the prospective trade.
        let mut weighted_risk: f64 = self
            .positions
            .iter()
            .map(|p| p.notional_value().abs() * self.volatility(&p.symbol))
            .sum();
        weighted_risk += quantity * price * self.volatility(symbol);
        if weighted_risk / equity > self.config.max_portfolio_risk {
            return Ok(TradeDecision::rejected(format!(
                "portfolio risk {:.3} would exceed the {:.3} ceiling",
                weighted_risk / equity,
                self.config.max_portfolio_risk
            )));
        }

        let trade_value = quantity * price;
        let max_value = equity * self.config.max_position_size;
        if trade_value > max_value {
            let adjusted = (max_value / price).floor();
            return Ok(TradeDecision::adjusted(
                adjusted,
                format!(
                    "trade value {:.2} exceeds the {:.2} position cap, quantity clamped to {}",
                    trade_value, max_value, adjusted
                ),
            ));
        }

        Ok(TradeDecision::approved())
    }

    /// Validate and open a position.
    ///
    /// Stop and target distances scale with observed volatility:
    /// stop at `entry * (1 -/+ max(stop_pct, 2*vol))`, target at
    /// `entry * (1 +/- max(target_pct, 3*vol))`, signs by side.
    pub fn open_position(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: f64,
        price: f64,
        strategy: &str,
    ) -> Result<Position, EngineError> {
        let decision = self.validate_trade(symbol, side, quantity, price, strategy)?;
        if !decision.approved {
            return Err(EngineError::Risk(
                decision.reason.unwrap_or_else(|| "trade rejected".to_string()),
            ));
        }
        let quantity = decision.adjusted_quantity.unwrap_or(quantity);
        if quantity <= 0.0 {
            return Err(EngineError::Risk(
                "position size clamps to zero under the current limits".to_string(),
            ));
        }

        let vol = self.volatility(symbol);
        let stop_distance = self.config.stop_loss_pct.max(2.0 * vol);
        let target_distance = self.config.take_profit_pct.max(3.0 * vol);

        let mut position = Position::new(
            symbol.to_string(),
            side,
            quantity,
            price,
            strategy.to_string(),
        );
        match side {
            PositionSide::Long => {
                position.stop_loss = Some(price * (1.0 - stop_distance));
                position.take_profit = Some(price * (1.0 + target_distance));
            }
            PositionSide::Short => {
                position.stop_loss = Some(price * (1.0 + stop_distance));
                position.take_profit = Some(price * (1.0 - target_distance));
            }
        }

        info!(
            "Opened {:?} {} x{} @ {} (stop {:?}, target {:?})",
            side, symbol, quantity, price, position.stop_loss, position.take_profit
        );
        self.positions.insert(position.id.clone(), position.clone());
        Ok(position)
    }

    // -------------------------------------------------------------------------
    // Price updates and closing
    // -------------------------------------------------------------------------

    /// Apply a price tick to one position and evaluate its triggers.
    ///
    /// A triggered close is unconditional (no re-validation) and records the
    /// reason for audit.
    pub fn update_position_price(
        &self,
        id: &str,
        price: f64,
    ) -> Result<Option<ClosedPosition>, EngineError> {
        let triggered = {
            let mut entry = self.positions.get_mut(id).ok_or_else(|| {
                EngineError::TradingOperation(format!("position not found: {}", id))
            })?;
            entry.update_price(price);
            entry.triggered_close(price)
        };

        match triggered {
            Some(reason) => self.close_position(id, price, reason).map(Some),
            None => Ok(None),
        }
    }

    /// Apply a market tick to every position on `symbol`, and record the
    /// return sample for volatility/correlation tracking.
    pub fn update_symbol_price(&self, symbol: &str, price: f64) -> Vec<ClosedPosition> {
        self.observe_price(symbol, price);

        let ids: Vec<String> = self
            .positions
            .iter()
            .filter(|p| p.symbol == symbol)
            .map(|p| p.id.clone())
            .collect();

        let mut closed = Vec::new();
        for id in ids {
            if let Ok(Some(position)) = self.update_position_price(&id, price) {
                closed.push(position);
            }
        }
        closed
    }

    /// Close a position at `price`, realizing its P&L.
    pub fn close_position(
        &self,
        id: &str,
        price: f64,
        reason: CloseReason,
    ) -> Result<ClosedPosition, EngineError> {
        let (_, mut position) = self.positions.remove(id).ok_or_else(|| {
            EngineError::TradingOperation(format!("position not found: {}", id))
        })?;
        position.update_price(price);

        let realized =
            (price - position.entry_price) * position.quantity * position.side.direction();
        {
            let mut state = self.state.write().expect("state lock poisoned");
            state.base_value += realized;
            state.realized_pnl += realized;
        }

        let closed = ClosedPosition {
            position: position.clone(),
            close_price: price,
            realized_pnl: realized,
            reason,
            closed_at: chrono::Utc::now().timestamp_millis(),
        };

        match reason {
            CloseReason::StopLoss => {
                self.monitoring.create_alert(
                    AlertKind::StopTriggered,
                    AlertSeverity::Warning,
                    format!(
                        "stop-loss closed {} {} x{} at {} (P&L {:.2})",
                        match position.side {
                            PositionSide::Long => "long",
                            PositionSide::Short => "short",
                        },
                        position.symbol,
                        position.quantity,
                        price,
                        realized
                    ),
                    price,
                    position.stop_loss.unwrap_or(price),
                );
            }
            CloseReason::TakeProfit => {
                self.monitoring.create_alert(
                    AlertKind::StopTriggered,
                    AlertSeverity::Info,
                    format!(
                        "take-profit closed {} at {} (P&L {:.2})",
                        position.symbol, price, realized
                    ),
                    price,
                    position.take_profit.unwrap_or(price),
                );
            }
            CloseReason::Manual => {
                info!("Closed {} at {} (P&L {:.2})", position.symbol, price, realized);
            }
        }

        if let Ok(mut journal) = self.closed.lock() {
            if journal.len() >= MAX_CLOSED_HISTORY {
                journal.pop_front();
            }
            journal.push_back(closed.clone());
        }
        Ok(closed)
    }

    // -------------------------------------------------------------------------
    // Limits and metrics
    // -------------------------------------------------------------------------

    /// Recompute metrics and enforce limits.
    ///
    /// Drawdown or daily loss beyond their configured maxima emit a CRITICAL
    /// alert and suspend trading (sticky); risk utilization above 80% emits a
    /// WARNING only.
    pub fn check_risk_limits(&self) -> RiskMetrics {
        let metrics = self.metrics();

        if metrics.current_drawdown > self.config.max_drawdown {
            self.monitoring.create_alert(
                AlertKind::Drawdown,
                AlertSeverity::Critical,
                format!(
                    "drawdown {:.1}% exceeds the {:.1}% limit, trading suspended",
                    metrics.current_drawdown * 100.0,
                    self.config.max_drawdown * 100.0
                ),
                metrics.current_drawdown,
                self.config.max_drawdown,
            );
            self.suspend_trading();
        }

        let baseline = self
            .state
            .read()
            .map(|s| s.daily_baseline)
            .unwrap_or(0.0);
        if baseline > 0.0 && metrics.daily_pnl < 0.0 {
            let daily_loss = -metrics.daily_pnl / baseline;
            if daily_loss > self.config.max_daily_loss {
                self.monitoring.create_alert(
                    AlertKind::DailyLoss,
                    AlertSeverity::Critical,
                    format!(
                        "daily loss {:.1}% exceeds the {:.1}% limit, trading suspended",
                        daily_loss * 100.0,
                        self.config.max_daily_loss * 100.0
                    ),
                    daily_loss,
                    self.config.max_daily_loss,
                );
                self.suspend_trading();
            }
        }

        if metrics.risk_utilization > UTILIZATION_WARNING_LEVEL {
            self.monitoring.create_alert(
                AlertKind::RiskUtilization,
                AlertSeverity::Warning,
                format!(
                    "risk utilization at {:.0}%",
                    metrics.risk_utilization * 100.0
                ),
                metrics.risk_utilization,
                UTILIZATION_WARNING_LEVEL,
            );
        }

        metrics
    }

    /// Current risk snapshot, recomputed from the ledger.
    pub fn metrics(&self) -> RiskMetrics {
        let mut unrealized = 0.0;
        let mut exposure = 0.0;
        let mut weighted_risk = 0.0;
        let open_positions = self.positions.len();

        for position in self.positions.iter() {
            unrealized += position.unrealized_pnl;
            let notional = position.notional_value().abs();
            exposure += notional;
            weighted_risk += notional * self.volatility(&position.symbol);
        }

        let mut state = self.state.write().expect("state lock poisoned");
        let equity = state.base_value + unrealized;

        // Daily baseline rolls at UTC midnight.
        let today = chrono::Utc::now().date_naive();
        if today != state.daily_date {
            state.daily_date = today;
            state.daily_baseline = equity;
        }

        if equity > state.peak_equity {
            state.peak_equity = equity;
        }
        let current_drawdown = if state.peak_equity > 0.0 {
            ((state.peak_equity - equity) / state.peak_equity).max(0.0)
        } else {
            0.0
        };
        if current_drawdown > state.max_drawdown {
            state.max_drawdown = current_drawdown;
        }

        let volatility = if exposure > 0.0 {
            weighted_risk / exposure
        } else {
            0.0
        };
        let portfolio_risk = if equity > 0.0 { weighted_risk / equity } else { 0.0 };

        RiskMetrics {
            portfolio_value: equity,
            total_exposure: exposure,
            unrealized_pnl: unrealized,
            realized_pnl: state.realized_pnl,
            daily_pnl: equity - state.daily_baseline,
            current_drawdown,
            max_drawdown: state.max_drawdown,
            volatility,
            var_95: VAR_95_FACTOR * volatility * equity,
            risk_utilization: if self.config.max_portfolio_risk > 0.0 {
                portfolio_risk / self.config.max_portfolio_risk
            } else {
                0.0
            },
            open_positions,
        }
    }

    // -------------------------------------------------------------------------
    // Trading status
    // -------------------------------------------------------------------------

    /// Whether trading is currently suspended.
    pub fn is_trading_suspended(&self) -> bool {
        self.suspended.load(Ordering::Relaxed)
    }

    /// Operator resume. The only way out of suspension.
    pub fn resume_trading(&self) {
        if self.suspended.swap(false, Ordering::SeqCst) {
            info!("Trading resumed by operator");
        }
    }

    fn suspend_trading(&self) {
        if !self.suspended.swap(true, Ordering::SeqCst) {
            warn!("Trading suspended");
        }
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    /// All open positions.
    pub fn positions(&self) -> Vec<Position> {
        self.positions.iter().map(|p| p.clone()).collect()
    }

    /// One open position.
    pub fn position(&self, id: &str) -> Option<Position> {
        self.positions.get(id).map(|p| p.clone())
    }

    /// Closed-position journal, oldest first.
    pub fn closed_positions(&self) -> Vec<ClosedPosition> {
        self.closed
            .lock()
            .map(|j| j.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Replace the externally supplied capital base.
    pub fn set_portfolio_value(&self, value: f64) {
        let mut state = self.state.write().expect("state lock poisoned");
        state.base_value = value;
        if value > state.peak_equity {
            state.peak_equity = value;
        }
    }

    fn equity(&self) -> f64 {
        let unrealized: f64 = self.positions.iter().map(|p| p.unrealized_pnl).sum();
        let state = self.state.read().expect("state lock poisoned");
        state.base_value + unrealized
    }

    // -------------------------------------------------------------------------
    // Volatility and correlation
    // -------------------------------------------------------------------------

    /// Record a price sample for a symbol's return history.
    pub fn observe_price(&self, symbol: &str, price: f64) {
        if price <= 0.0 {
            return;
        }
        let mut track = self.history.entry(symbol.to_string()).or_insert(PriceTrack {
            last_price: 0.0,
            returns: VecDeque::new(),
        });
        if track.last_price > 0.0 {
            let ret = (price - track.last_price) / track.last_price;
            if track.returns.len() >= self.config.return_window {
                track.returns.pop_front();
            }
            track.returns.push_back(ret);
        }
        track.last_price = price;
    }

    /// Standard deviation of a symbol's observed returns (0 without history).
    pub fn volatility(&self, symbol: &str) -> f64 {
        let Some(track) = self.history.get(symbol) else {
            return 0.0;
        };
        let n = track.returns.len();
        if n < 2 {
            return 0.0;
        }
        let mean: f64 = track.returns.iter().sum::<f64>() / n as f64;
        let variance: f64 = track
            .returns
            .iter()
            .map(|r| (r - mean) * (r - mean))
            .sum::<f64>()
            / (n - 1) as f64;
        variance.sqrt()
    }

    /// Pearson correlation between two symbols' aligned return tails.
    ///
    /// `None` with fewer than `MIN_CORRELATION_SAMPLES` aligned samples —
    /// treated as uncorrelated by the caller.
    pub fn correlation(&self, a: &str, b: &str) -> Option<f64> {
        let ta = self.history.get(a)?;
        let tb = self.history.get(b)?;

        let n = ta.returns.len().min(tb.returns.len());
        if n < MIN_CORRELATION_SAMPLES {
            return None;
        }
        let xs: Vec<f64> = ta.returns.iter().rev().take(n).rev().copied().collect();
        let ys: Vec<f64> = tb.returns.iter().rev().take(n).rev().copied().collect();

        let mean_x = xs.iter().sum::<f64>() / n as f64;
        let mean_y = ys.iter().sum::<f64>() / n as f64;

        let mut cov = 0.0;
        let mut var_x = 0.0;
        let mut var_y = 0.0;
        for i in 0..n {
            let dx = xs[i] - mean_x;
            let dy = ys[i] - mean_y;
            cov += dx * dy;
            var_x += dx * dx;
            var_y += dy * dy;
        }

        if var_x <= f64::EPSILON || var_y <= f64::EPSILON {
            return None;
        }
        Some(cov / (var_x.sqrt() * var_y.sqrt()))
    }
}
