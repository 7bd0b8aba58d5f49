use super::{protective_exit, Decision, SignalPolicy};
use crate::models::{Direction, ExitReason, IndicatorSnapshot, PositionState};

/// EMA crossover policy
///
/// Enters long when the fast EMA crosses above the slow EMA on the latest
/// two bars, optionally gated on close > trend EMA. Exits on the reverse
/// cross or any protective level (TP, fixed stop, trailing stop).
#[derive(Debug, Clone)]
pub struct EmaCrossPolicy {
    slow_period: usize,
    trend_period: usize,
    trend_filter: bool,
}

impl EmaCrossPolicy {
    pub fn new(slow_period: usize, trend_period: usize, trend_filter: bool) -> Self {
        Self {
            slow_period,
            trend_period,
            trend_filter,
        }
    }
}

impl SignalPolicy for EmaCrossPolicy {
    fn evaluate(&self, snapshot: &IndicatorSnapshot, position: &PositionState) -> Decision {
        if !position.is_flat() {
            if let Some(reason) = protective_exit(snapshot, position) {
                return Decision::Exit(reason);
            }
            let reverse = match position.side {
                Some(Direction::Long) => snapshot.cross_down,
                Some(Direction::Short) => snapshot.cross_up,
                None => false,
            };
            if reverse {
                return Decision::Exit(ExitReason::ReverseCross);
            }
            return Decision::Hold;
        }

        let trend_ok = !self.trend_filter || snapshot.last_close > snapshot.trend_ema;
        if snapshot.cross_up && trend_ok {
            return Decision::Enter(Direction::Long);
        }

        Decision::Hold
    }

    fn name(&self) -> &'static str {
        "ema-cross"
    }

    fn min_bars(&self) -> usize {
        let base = self.slow_period + 2;
        if self.trend_filter {
            base.max(self.trend_period)
        } else {
            base
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::test_support::snapshot;

    fn policy() -> EmaCrossPolicy {
        EmaCrossPolicy::new(26, 200, false)
    }

    fn long_position() -> PositionState {
        PositionState {
            side: Some(Direction::Long),
            entry_price: 100.0,
            amount: 1.0,
            stop_price: 90.0,
            best_price_since_entry: 100.0,
            ..PositionState::flat("XBT/USD")
        }
    }

    #[test]
    fn test_enter_on_cross_up() {
        let mut snap = snapshot(100.0);
        snap.cross_up = true;
        let decision = policy().evaluate(&snap, &PositionState::flat("XBT/USD"));
        assert_eq!(decision, Decision::Enter(Direction::Long));
    }

    #[test]
    fn test_trend_filter_blocks_entry() {
        let mut snap = snapshot(100.0);
        snap.cross_up = true;
        snap.trend_ema = 105.0; // close below trend EMA
        let gated = EmaCrossPolicy::new(26, 200, true);
        assert_eq!(
            gated.evaluate(&snap, &PositionState::flat("XBT/USD")),
            Decision::Hold
        );
    }

    #[test]
    fn test_exit_on_reverse_cross() {
        let mut snap = snapshot(100.0);
        snap.cross_down = true;
        let decision = policy().evaluate(&snap, &long_position());
        assert_eq!(decision, Decision::Exit(ExitReason::ReverseCross));
    }

    #[test]
    fn test_exit_wins_over_entry_signal() {
        // Stop breach and a fresh cross-up in the same cycle: exit fires,
        // entry is deferred.
        let mut snap = snapshot(89.0);
        snap.cross_up = true;
        let decision = policy().evaluate(&snap, &long_position());
        assert_eq!(decision, Decision::Exit(ExitReason::StopLoss));
    }

    #[test]
    fn test_hold_when_no_signal() {
        let snap = snapshot(100.0);
        assert_eq!(
            policy().evaluate(&snap, &PositionState::flat("XBT/USD")),
            Decision::Hold
        );
        assert_eq!(policy().evaluate(&snap, &long_position()), Decision::Hold);
    }
}
