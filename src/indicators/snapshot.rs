// Snapshot computation
//
// Recomputes every indicator from the full bar window each cycle. No
// incremental state is kept, so the snapshot is deterministic for the same
// bars and parameters.

use crate::error::{BotError, Result};
use crate::indicators::{atr, breakout_above, breakout_below, donchian, ema};
use crate::models::{Bar, IndicatorSnapshot};

#[derive(Debug, Clone, PartialEq)]
pub struct IndicatorParams {
    pub fast_period: usize,
    pub slow_period: usize,
    pub trend_period: usize,
    pub atr_period: usize,
    pub donchian_window: usize,
}

impl Default for IndicatorParams {
    fn default() -> Self {
        Self {
            fast_period: 12,
            slow_period: 26,
            trend_period: 200,
            atr_period: 14,
            donchian_window: 20,
        }
    }
}

impl IndicatorParams {
    /// Fewest bars for which every snapshot field is defined. The Donchian
    /// window excludes the current bar, hence the +1.
    pub fn min_bars(&self) -> usize {
        (self.atr_period + 1).max(self.donchian_window + 1).max(2)
    }
}

/// Compute the full indicator snapshot for the latest bar.
pub fn compute_snapshot(bars: &[Bar], params: &IndicatorParams) -> Result<IndicatorSnapshot> {
    if bars.len() < params.min_bars() {
        return Err(BotError::InsufficientData(format!(
            "snapshot: {} bars, need {}",
            bars.len(),
            params.min_bars()
        )));
    }

    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let highs: Vec<f64> = bars.iter().map(|b| b.high).collect();
    let lows: Vec<f64> = bars.iter().map(|b| b.low).collect();

    let fast = ema(&closes, params.fast_period)?;
    let slow = ema(&closes, params.slow_period)?;
    let trend = ema(&closes, params.trend_period)?;
    let atr_series = atr(&highs, &lows, &closes, params.atr_period)?;

    // Channel over the window immediately before the current bar.
    let prior_highs = &highs[..highs.len() - 1];
    let prior_lows = &lows[..lows.len() - 1];
    let (donchian_high, donchian_low) = donchian(prior_highs, prior_lows, params.donchian_window)?;

    let last = closes.len() - 1;
    let last_close = closes[last];

    Ok(IndicatorSnapshot {
        last_close,
        fast_ema: fast[last],
        slow_ema: slow[last],
        trend_ema: trend[last],
        prev_fast_ema: fast[last - 1],
        prev_slow_ema: slow[last - 1],
        atr: atr_series[last],
        donchian_high,
        donchian_low,
        breakout_above: breakout_above(last_close, donchian_high),
        breakout_below: breakout_below(last_close, donchian_low),
        cross_up: fast[last] > slow[last] && fast[last - 1] <= slow[last - 1],
        cross_down: fast[last] < slow[last] && fast[last - 1] >= slow[last - 1],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn bars_from_closes(closes: &[f64]) -> Vec<Bar> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Bar {
                timestamp: Utc::now() + Duration::minutes(15 * i as i64),
                open: c,
                high: c,
                low: c,
                close: c,
                volume: 1000.0,
            })
            .collect()
    }

    fn small_params() -> IndicatorParams {
        IndicatorParams {
            fast_period: 3,
            slow_period: 6,
            trend_period: 10,
            atr_period: 3,
            donchian_window: 5,
        }
    }

    #[test]
    fn test_snapshot_insufficient_bars() {
        let bars = bars_from_closes(&[10.0, 10.0, 10.0]);
        let err = compute_snapshot(&bars, &small_params()).unwrap_err();
        assert!(matches!(err, BotError::InsufficientData(_)));
    }

    #[test]
    fn test_snapshot_deterministic() {
        let closes: Vec<f64> = (0..30).map(|i| 100.0 + (i % 7) as f64).collect();
        let bars = bars_from_closes(&closes);
        let a = compute_snapshot(&bars, &small_params()).unwrap();
        let b = compute_snapshot(&bars, &small_params()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_breakout_excludes_current_bar() {
        // 20 flat bars at 10, final close 11. The prior-window high is 10,
        // so the 11 print is a breakout.
        let mut closes = vec![10.0; 20];
        closes.push(11.0);
        let bars = bars_from_closes(&closes);
        let params = IndicatorParams {
            donchian_window: 20,
            ..small_params()
        };
        let snap = compute_snapshot(&bars, &params).unwrap();
        assert_eq!(snap.donchian_high, 10.0);
        assert!(snap.breakout_above);
        assert!(!snap.breakout_below);
    }

    #[test]
    fn test_cross_up_flag() {
        // Falling then sharply rising closes force the fast EMA across the
        // slow EMA from below.
        let mut closes: Vec<f64> = (0..20).map(|i| 110.0 - i as f64).collect();
        closes.extend((0..10).map(|i| 91.0 + 4.0 * i as f64));
        let bars = bars_from_closes(&closes);
        let params = small_params();

        let mut saw_cross_up = false;
        for end in params.min_bars()..=bars.len() {
            let snap = compute_snapshot(&bars[..end], &params).unwrap();
            if snap.cross_up {
                saw_cross_up = true;
                assert!(snap.fast_ema > snap.slow_ema);
            }
        }
        assert!(saw_cross_up);
    }
}
