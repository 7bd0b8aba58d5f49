// Position sizing module
//
// Converts a target notional into a base-asset amount under venue precision
// and minimum constraints, optionally capped by a maximum acceptable loss.

use crate::error::{BotError, Result};
use crate::models::MarketConstraints;

/// Maximum loss the position may realize at its protective stop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RiskCap {
    /// Max acceptable loss in quote currency.
    pub max_loss: f64,
    /// Expected per-unit loss if the stop fires (entry-to-stop distance).
    pub risk_distance: f64,
}

/// Round down to `precision` decimal places.
pub fn round_down(value: f64, precision: u32) -> f64 {
    let scale = 10f64.powi(precision as i32);
    (value * scale).floor() / scale
}

/// Round up to `precision` decimal places. A small slack keeps values that
/// already sit on a step from being bumped a full step by representation
/// error.
fn round_up(value: f64, precision: u32) -> f64 {
    let scale = 10f64.powi(precision as i32);
    (value * scale - 1e-9).ceil() / scale
}

/// Size an order for `notional_target` quote currency at `price`.
///
/// The target and the risk cap round down to the amount precision;
/// minimum-driven raises round up, so a raised amount still clears the
/// minimum after rounding. Minimums are enforced before the risk cap, so
/// the cap can shrink the amount back below a minimum-driven raise; if the
/// two conflict the result rounds to zero and the entry is aborted with
/// `ZeroSize`.
pub fn size_order(
    symbol: &str,
    notional_target: f64,
    price: f64,
    constraints: &MarketConstraints,
    risk_cap: Option<RiskCap>,
) -> Result<f64> {
    if price <= 0.0 {
        return Err(BotError::ZeroSize {
            symbol: symbol.to_string(),
            notional: notional_target,
        });
    }

    let mut amount = round_down(notional_target / price, constraints.amount_precision);

    if amount * price < constraints.min_notional {
        amount = round_up(constraints.min_notional / price, constraints.amount_precision);
    }
    if amount < constraints.min_amount {
        amount = round_up(constraints.min_amount, constraints.amount_precision);
    }

    if let Some(cap) = risk_cap {
        if cap.risk_distance > 0.0 && amount * cap.risk_distance > cap.max_loss {
            amount = round_down(cap.max_loss / cap.risk_distance, constraints.amount_precision);
        }
    }

    if amount <= 0.0 {
        return Err(BotError::ZeroSize {
            symbol: symbol.to_string(),
            notional: notional_target,
        });
    }

    Ok(amount)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constraints() -> MarketConstraints {
        MarketConstraints {
            min_amount: 0.0001,
            min_notional: 10.0,
            amount_precision: 4,
            price_precision: 1,
        }
    }

    #[test]
    fn test_basic_sizing() {
        // 50 USD at 10000 with 4 decimals -> exactly 0.005, all minimums met.
        let amount = size_order("XBT/USD", 50.0, 10000.0, &constraints(), None).unwrap();
        assert_eq!(amount, 0.005);
    }

    #[test]
    fn test_rounds_down_to_precision() {
        let amount = size_order("XBT/USD", 33.333, 10000.0, &constraints(), None).unwrap();
        assert_eq!(amount, 0.0033);
    }

    #[test]
    fn test_min_notional_raises_amount() {
        // 5 USD target is below the 10 USD floor; amount is lifted to match.
        let amount = size_order("XBT/USD", 5.0, 10000.0, &constraints(), None).unwrap();
        assert!(amount * 10000.0 >= 10.0 - 1e-9);
    }

    #[test]
    fn test_min_notional_raise_survives_rounding() {
        // 10 / 3333.3 does not land on a 4-decimal step; flooring the raise
        // would give 0.0030 (notional 9.9999, below the floor). The raise
        // rounds up instead.
        let amount = size_order("XBT/USD", 5.0, 3333.3, &constraints(), None).unwrap();
        assert_eq!(amount, 0.0031);
        assert!(amount * 3333.3 >= constraints().min_notional);
    }

    #[test]
    fn test_min_amount_raises_amount() {
        let tight = MarketConstraints {
            min_amount: 0.01,
            min_notional: 0.0,
            amount_precision: 4,
            price_precision: 1,
        };
        let amount = size_order("ETH/USD", 1.0, 1000.0, &tight, None).unwrap();
        assert_eq!(amount, 0.01);
    }

    #[test]
    fn test_risk_cap_shrinks_amount() {
        // 0.005 XBT with 100 USD stop distance risks 0.5 USD; cap at 0.2 USD
        // shrinks to 0.002.
        let cap = RiskCap {
            max_loss: 0.2,
            risk_distance: 100.0,
        };
        let amount = size_order("XBT/USD", 50.0, 10000.0, &constraints(), Some(cap)).unwrap();
        assert_eq!(amount, 0.002);
    }

    #[test]
    fn test_risk_cap_can_undercut_minimums() {
        // 5 USD target is first raised to the 10 USD notional floor
        // (0.001 XBT), then the cap shrinks it to 0.0005, below the floor.
        let cap = RiskCap {
            max_loss: 0.05,
            risk_distance: 100.0,
        };
        let amount = size_order("XBT/USD", 5.0, 10000.0, &constraints(), Some(cap)).unwrap();
        assert_eq!(amount, 0.0005);
        assert!(amount * 10000.0 < constraints().min_notional);
    }

    #[test]
    fn test_conflicting_constraints_zero_size() {
        // Risk cap shrinks below anything representable at this precision.
        let cap = RiskCap {
            max_loss: 0.0001,
            risk_distance: 100.0,
        };
        let err = size_order("XBT/USD", 50.0, 10000.0, &constraints(), Some(cap)).unwrap_err();
        assert!(matches!(err, BotError::ZeroSize { .. }));
    }

    #[test]
    fn test_zero_price_is_zero_size() {
        let err = size_order("XBT/USD", 50.0, 0.0, &constraints(), None).unwrap_err();
        assert!(matches!(err, BotError::ZeroSize { .. }));
    }
}
