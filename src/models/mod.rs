use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One OHLCV price bar. Sequences are ordered oldest first and immutable
/// once fetched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Derived indicator values for the latest bar of a window. Recomputed in
/// full every cycle; deterministic for the same bars and parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct IndicatorSnapshot {
    pub last_close: f64,
    pub fast_ema: f64,
    pub slow_ema: f64,
    pub trend_ema: f64,
    pub prev_fast_ema: f64,
    pub prev_slow_ema: f64,
    pub atr: f64,
    /// Donchian extremes over the window *excluding* the current bar.
    pub donchian_high: f64,
    pub donchian_low: f64,
    pub breakout_above: bool,
    pub breakout_below: bool,
    pub cross_up: bool,
    pub cross_down: bool,
}

/// Per-symbol order constraints supplied by the venue. Read-only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MarketConstraints {
    pub min_amount: f64,
    pub min_notional: f64,
    pub amount_precision: u32,
    pub price_precision: u32,
}

/// Direction of an open (or intended) position.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// Order side that opens a position in this direction.
    pub fn entry_side(self) -> OrderSide {
        match self {
            Direction::Long => OrderSide::Buy,
            Direction::Short => OrderSide::Sell,
        }
    }

    /// Order side that closes a position in this direction.
    pub fn exit_side(self) -> OrderSide {
        match self {
            Direction::Long => OrderSide::Sell,
            Direction::Short => OrderSide::Buy,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderType {
    Market,
    Limit,
    /// Stop order, fires at `trigger_price`.
    Stop,
}

/// Value object handed to the exchange gateway. The core never keeps venue
/// order objects, only the returned id and status.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderIntent {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub amount: f64,
    pub price: Option<f64>,
    pub trigger_price: Option<f64>,
    pub reduce_only: bool,
    /// Post-only flag for maker-mode limit entries.
    pub post_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Pending,
    Filled,
    Canceled,
}

/// Acknowledgment returned by the gateway on submission.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderAck {
    pub order_id: String,
    pub fill_price: Option<f64>,
    pub status: OrderStatus,
}

/// Point-in-time order state from a status poll.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrderSnapshot {
    pub status: OrderStatus,
    /// Volume-weighted average fill price, once the venue reports one.
    pub avg_fill_price: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Canceled,
    /// The venue no longer knows the order (already filled or canceled).
    NotFound,
}

/// Why a position was (or should be) closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    TakeProfit,
    StopLoss,
    /// Stop breach after the stop had ratcheted at least once.
    Trail,
    ReverseCross,
}

impl ExitReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ExitReason::TakeProfit => "TP",
            ExitReason::StopLoss => "SL",
            ExitReason::Trail => "TRAIL",
            ExitReason::ReverseCross => "REVERSE",
        }
    }
}

/// The central mutable entity: one per symbol, owned by the lifecycle
/// manager, reset to flat on exit fill or fail-safe reset.
#[derive(Debug, Clone, Default)]
pub struct PositionState {
    pub symbol: String,
    pub side: Option<Direction>,
    pub entry_price: f64,
    pub amount: f64,
    pub stop_price: f64,
    pub take_profit_price: Option<f64>,
    pub best_price_since_entry: f64,
    /// True once the stop has been ratcheted past its initial level.
    pub trail_active: bool,
    pub open_order_id: Option<String>,
    pub open_order_side: Option<OrderSide>,
    pub open_order_placed_at: Option<DateTime<Utc>>,
    /// Price the open entry order was placed at (fill price for limit fills).
    pub open_order_price: Option<f64>,
    /// Venue id of the live protective stop order, if one is resting.
    pub stop_order_id: Option<String>,
}

impl PositionState {
    pub fn flat(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            ..Default::default()
        }
    }

    pub fn is_flat(&self) -> bool {
        self.side.is_none()
    }
}

/// Split "XBT/USD" into ("XBT", "USD").
pub fn split_symbol(symbol: &str) -> Option<(&str, &str)> {
    let mut parts = symbol.splitn(2, '/');
    match (parts.next(), parts.next()) {
        (Some(base), Some(quote)) if !base.is_empty() && !quote.is_empty() => Some((base, quote)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_sides() {
        assert_eq!(Direction::Long.entry_side(), OrderSide::Buy);
        assert_eq!(Direction::Long.exit_side(), OrderSide::Sell);
        assert_eq!(Direction::Short.entry_side(), OrderSide::Sell);
        assert_eq!(Direction::Short.exit_side(), OrderSide::Buy);
    }

    #[test]
    fn test_split_symbol() {
        assert_eq!(split_symbol("XBT/USD"), Some(("XBT", "USD")));
        assert_eq!(split_symbol("ETH/USD"), Some(("ETH", "USD")));
        assert_eq!(split_symbol("XBTUSD"), None);
        assert_eq!(split_symbol("/USD"), None);
    }

    #[test]
    fn test_flat_state() {
        let state = PositionState::flat("XBT/USD");
        assert!(state.is_flat());
        assert_eq!(state.symbol, "XBT/USD");
        assert!(state.open_order_id.is_none());
    }
}
