// Signal evaluation module
//
// Stateless policies over the indicator snapshot and the current position.
// Exactly one of enter/exit/hold comes back per call; an exit always wins
// over a fresh entry, so the engine never flips direction within one cycle.

pub mod breakout;
pub mod donchian_trend;
pub mod ema_cross;

pub use breakout::BreakoutPolicy;
pub use donchian_trend::DonchianTrendPolicy;
pub use ema_cross::EmaCrossPolicy;

use crate::config::{BotConfig, StrategyKind};
use crate::models::{Direction, ExitReason, IndicatorSnapshot, PositionState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Enter(Direction),
    Exit(ExitReason),
    Hold,
}

/// Entry/exit policy, swappable per deployment.
pub trait SignalPolicy: Send + Sync {
    /// Evaluate the latest snapshot against the current position.
    fn evaluate(&self, snapshot: &IndicatorSnapshot, position: &PositionState) -> Decision;

    fn name(&self) -> &'static str;

    /// Fewest bars this policy needs to produce a meaningful signal.
    fn min_bars(&self) -> usize;
}

/// Shared protective exits: fixed stop, trailing stop and take-profit are
/// price levels on the position, checked against the latest close. The stop
/// check runs first so a bar that pierces both levels exits at the stop.
pub(crate) fn protective_exit(
    snapshot: &IndicatorSnapshot,
    position: &PositionState,
) -> Option<ExitReason> {
    let side = position.side?;
    let close = snapshot.last_close;

    let stop_hit = match side {
        Direction::Long => close <= position.stop_price,
        Direction::Short => close >= position.stop_price,
    };
    if stop_hit {
        return Some(if position.trail_active {
            ExitReason::Trail
        } else {
            ExitReason::StopLoss
        });
    }

    if let Some(tp) = position.take_profit_price {
        let tp_hit = match side {
            Direction::Long => close >= tp,
            Direction::Short => close <= tp,
        };
        if tp_hit {
            return Some(ExitReason::TakeProfit);
        }
    }

    None
}

/// Build the configured policy.
pub fn build_policy(config: &BotConfig) -> Box<dyn SignalPolicy> {
    match config.strategy {
        StrategyKind::EmaCross => Box::new(EmaCrossPolicy::new(
            config.indicators.slow_period,
            config.indicators.trend_period,
            config.trend_filter,
        )),
        StrategyKind::Breakout => Box::new(BreakoutPolicy::new(
            config.indicators.slow_period,
            config.indicators.donchian_window,
        )),
        StrategyKind::DonchianTrend => Box::new(DonchianTrendPolicy::new(
            config.indicators.donchian_window,
            config.indicators.trend_period,
            config.allow_short,
        )),
    }
}
