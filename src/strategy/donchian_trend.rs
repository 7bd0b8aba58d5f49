use super::{protective_exit, Decision, SignalPolicy};
use crate::models::{Direction, IndicatorSnapshot, PositionState};

/// Donchian + ATR-trend policy
///
/// Long on a close above the prior Donchian high with the close above the
/// trend EMA. Short, when enabled, on a close below the prior Donchian low
/// with the close below the trend EMA. Exits are protective on both sides.
#[derive(Debug, Clone)]
pub struct DonchianTrendPolicy {
    donchian_window: usize,
    trend_period: usize,
    allow_short: bool,
}

impl DonchianTrendPolicy {
    pub fn new(donchian_window: usize, trend_period: usize, allow_short: bool) -> Self {
        Self {
            donchian_window,
            trend_period,
            allow_short,
        }
    }
}

impl SignalPolicy for DonchianTrendPolicy {
    fn evaluate(&self, snapshot: &IndicatorSnapshot, position: &PositionState) -> Decision {
        if !position.is_flat() {
            if let Some(reason) = protective_exit(snapshot, position) {
                return Decision::Exit(reason);
            }
            return Decision::Hold;
        }

        if snapshot.breakout_above && snapshot.last_close > snapshot.trend_ema {
            return Decision::Enter(Direction::Long);
        }

        if self.allow_short && snapshot.breakout_below && snapshot.last_close < snapshot.trend_ema {
            return Decision::Enter(Direction::Short);
        }

        Decision::Hold
    }

    fn name(&self) -> &'static str {
        "donchian-trend"
    }

    fn min_bars(&self) -> usize {
        (self.donchian_window + 1).max(self.trend_period)
    }
}
