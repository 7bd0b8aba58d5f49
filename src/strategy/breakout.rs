use super::{protective_exit, Decision, SignalPolicy};
use crate::models::{Direction, IndicatorSnapshot, PositionState};

/// Breakout + trend-filter policy
///
/// Enters long when the close prints strictly above the highest high of the
/// prior window (current bar excluded) while the fast EMA sits above the
/// slow EMA. Exits are purely protective; the trailing stop does the work
/// of following a breakout that keeps running.
#[derive(Debug, Clone)]
pub struct BreakoutPolicy {
    slow_period: usize,
    donchian_window: usize,
}

impl BreakoutPolicy {
    pub fn new(slow_period: usize, donchian_window: usize) -> Self {
        Self {
            slow_period,
            donchian_window,
        }
    }
}

impl SignalPolicy for BreakoutPolicy {
    fn evaluate(&self, snapshot: &IndicatorSnapshot, position: &PositionState) -> Decision {
        if !position.is_flat() {
            if let Some(reason) = protective_exit(snapshot, position) {
                return Decision::Exit(reason);
            }
            return Decision::Hold;
        }

        let trend_ok = snapshot.fast_ema > snapshot.slow_ema;
        if snapshot.breakout_above && trend_ok {
            return Decision::Enter(Direction::Long);
        }

        Decision::Hold
    }

    fn name(&self) -> &'static str {
        "breakout"
    }

    fn min_bars(&self) -> usize {
        (self.slow_period + 2).max(self.donchian_window + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ExitReason;
    use crate::strategy::test_support::snapshot;

    fn policy() -> BreakoutPolicy {
        BreakoutPolicy::new(26, 20)
    }

    #[test]
    fn test_enter_on_breakout_with_trend() {
        let mut snap = snapshot(11.0);
        snap.breakout_above = true;
        snap.fast_ema = 10.5;
        snap.slow_ema = 10.2;
        let decision = policy().evaluate(&snap, &PositionState::flat("XBT/USD"));
        assert_eq!(decision, Decision::Enter(Direction::Long));
    }

    #[test]
    fn test_breakout_without_trend_is_hold() {
        let mut snap = snapshot(11.0);
        snap.breakout_above = true;
        snap.fast_ema = 10.0;
        snap.slow_ema = 10.2;
        let decision = policy().evaluate(&snap, &PositionState::flat("XBT/USD"));
        assert_eq!(decision, Decision::Hold);
    }

    #[test]
    fn test_protective_exit_in_position() {
        let pos = PositionState {
            side: Some(Direction::Long),
            entry_price: 100.0,
            amount: 1.0,
            stop_price: 99.0,
            best_price_since_entry: 100.0,
            ..PositionState::flat("XBT/USD")
        };
        let snap = snapshot(98.0);
        let decision = policy().evaluate(&snap, &pos);
        assert_eq!(decision, Decision::Exit(ExitReason::StopLoss));
    }

    #[test]
    fn test_min_bars_covers_window() {
        assert_eq!(policy().min_bars(), 28);
        assert_eq!(BreakoutPolicy::new(5, 50).min_bars(), 51);
    }
}
