use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Long or short.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// PnL sign: +1 for long, -1 for short.
    pub fn direction(&self) -> f64 {
        match self {
            PositionSide::Long => 1.0,
            PositionSide::Short => -1.0,
        }
    }
}

/// Why a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    StopLoss,
    TakeProfit,
    Manual,
}

/// An open position in the risk ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    /// Unique position ID.
    pub id: String,
    /// Symbol (e.g., "BTCUSDT").
    pub symbol: String,
    /// Long or short.
    pub side: PositionSide,
    /// Quantity held.
    pub quantity: f64,
    /// Entry price.
    pub entry_price: f64,
    /// Current market price.
    pub current_price: f64,
    /// Stop-loss price.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<f64>,
    /// Take-profit price.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<f64>,
    /// Unrealized P&L at the current price.
    pub unrealized_pnl: f64,
    /// P&L realized on partial closes.
    pub realized_pnl: f64,
    /// Strategy that opened the position.
    pub strategy: String,
    /// When the position was opened (ms).
    pub opened_at: i64,
    /// When the position last changed (ms).
    pub updated_at: i64,
}

impl Position {
    /// Open a new position at `entry_price`.
    pub fn new(
        symbol: String,
        side: PositionSide,
        quantity: f64,
        entry_price: f64,
        strategy: String,
    ) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            id: Uuid::new_v4().to_string(),
            symbol,
            side,
            quantity,
            entry_price,
            current_price: entry_price,
            stop_loss: None,
            take_profit: None,
            unrealized_pnl: 0.0,
            realized_pnl: 0.0,
            strategy,
            opened_at: now,
            updated_at: now,
        }
    }

    /// Apply a new market price, recomputing unrealized P&L.
    pub fn update_price(&mut self, price: f64) {
        self.current_price = price;
        self.unrealized_pnl =
            (price - self.entry_price) * self.quantity * self.side.direction();
        self.updated_at = chrono::Utc::now().timestamp_millis();
    }

    /// Current position value.
    pub fn notional_value(&self) -> f64 {
        self.quantity * self.current_price
    }

    /// Whether the stop-loss or take-profit fires at `price`.
    ///
    /// A long closes at price <= stop or price >= target; a short is
    /// mirrored.
    pub fn triggered_close(&self, price: f64) -> Option<CloseReason> {
        match self.side {
            PositionSide::Long => {
                if self.stop_loss.is_some_and(|stop| price <= stop) {
                    Some(CloseReason::StopLoss)
                } else if self.take_profit.is_some_and(|target| price >= target) {
                    Some(CloseReason::TakeProfit)
                } else {
                    None
                }
            }
            PositionSide::Short => {
                if self.stop_loss.is_some_and(|stop| price >= stop) {
                    Some(CloseReason::StopLoss)
                } else if self.take_profit.is_some_and(|target| price <= target) {
                    Some(CloseReason::TakeProfit)
                } else {
                    None
                }
            }
        }
    }
}

/// A closed position kept in the audit journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosedPosition {
    /// The position as it stood at close.
    pub position: Position,
    /// Close price.
    pub close_price: f64,
    /// P&L realized on close.
    pub realized_pnl: f64,
    /// What triggered the close.
    pub reason: CloseReason,
    /// When the close happened (ms).
    pub closed_at: i64,
}

/// Outcome of trade validation.
///
/// A size-only violation clamps quantity down and stays approved; structural
/// violations (position count, correlation, portfolio risk) reject outright.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeDecision {
    /// Whether the trade may proceed.
    pub approved: bool,
    /// Clamped quantity, when the size cap forced an adjustment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adjusted_quantity: Option<f64>,
    /// Why the trade was adjusted or rejected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl TradeDecision {
    /// Unconditional approval.
    pub fn approved() -> Self {
        Self {
            approved: true,
            adjusted_quantity: None,
            reason: None,
        }
    }

    /// Approval with a clamped quantity.
    pub fn adjusted(quantity: f64, reason: impl Into<String>) -> Self {
        Self {
            approved: true,
            adjusted_quantity: Some(quantity),
            reason: Some(reason.into()),
        }
    }

    /// Outright rejection.
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            adjusted_quantity: None,
            reason: Some(reason.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unrealized_pnl_long() {
        let mut position = Position::new(
            "BTCUSDT".to_string(),
            PositionSide::Long,
            1.0,
            40_000.0,
            "momentum".to_string(),
        );
        position.update_price(38_000.0);
        assert_eq!(position.unrealized_pnl, -2_000.0);

        position.update_price(43_000.0);
        assert_eq!(position.unrealized_pnl, 3_000.0);
    }

    #[test]
    fn test_unrealized_pnl_short() {
        let mut position = Position::new(
            "ETHUSDT".to_string(),
            PositionSide::Short,
            10.0,
            3_000.0,
            "mean-reversion".to_string(),
        );
        position.update_price(2_900.0);
        assert_eq!(position.unrealized_pnl, 1_000.0);

        position.update_price(3_100.0);
        assert_eq!(position.unrealized_pnl, -1_000.0);
    }

    #[test]
    fn test_pnl_invariant_over_price_sequence() {
        let mut position = Position::new(
            "BTCUSDT".to_string(),
            PositionSide::Long,
            0.5,
            50_000.0,
            "s1".to_string(),
        );

        for price in [49_000.0, 51_250.0, 48_300.0, 50_000.0, 52_725.5] {
            position.update_price(price);
            let expected = (price - 50_000.0) * 0.5;
            assert!((position.unrealized_pnl - expected).abs() < 1e-9);
        }
    }

    #[test]
    fn test_long_triggers() {
        let mut position = Position::new(
            "BTCUSDT".to_string(),
            PositionSide::Long,
            1.0,
            50_000.0,
            "s1".to_string(),
        );
        position.stop_loss = Some(49_000.0);
        position.take_profit = Some(52_000.0);

        assert_eq!(position.triggered_close(50_500.0), None);
        assert_eq!(position.triggered_close(49_000.0), Some(CloseReason::StopLoss));
        assert_eq!(position.triggered_close(48_000.0), Some(CloseReason::StopLoss));
        assert_eq!(position.triggered_close(52_000.0), Some(CloseReason::TakeProfit));
    }

    #[test]
    fn test_short_triggers_mirrored() {
        let mut position = Position::new(
            "BTCUSDT".to_string(),
            PositionSide::Short,
            1.0,
            50_000.0,
            "s1".to_string(),
        );
        position.stop_loss = Some(51_000.0);
        position.take_profit = Some(48_000.0);

        assert_eq!(position.triggered_close(50_500.0), None);
        assert_eq!(position.triggered_close(51_200.0), Some(CloseReason::StopLoss));
        assert_eq!(position.triggered_close(47_900.0), Some(CloseReason::TakeProfit));
    }

    #[test]
    fn test_side_serialization() {
        assert_eq!(serde_json::to_string(&PositionSide::Long).unwrap(), "\"long\"");
        assert_eq!(serde_json::to_string(&PositionSide::Short).unwrap(), "\"short\"");
        assert_eq!(
            serde_json::to_string(&CloseReason::StopLoss).unwrap(),
            "\"stop_loss\""
        );
    }

    #[test]
    fn test_trade_decision_constructors() {
        let ok = TradeDecision::approved();
        assert!(ok.approved);
        assert!(ok.adjusted_quantity.is_none());

        let clamped = TradeDecision::adjusted(0.0, "position size clamped");
        assert!(clamped.approved);
        assert_eq!(clamped.adjusted_quantity, Some(0.0));

        let no = TradeDecision::rejected("too many open positions");
        assert!(!no.approved);
    }
}
