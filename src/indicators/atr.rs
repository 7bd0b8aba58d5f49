// Average True Range
//
// True range per bar is the greatest of high-low, |high - prevClose| and
// |low - prevClose|. ATR is the exponential moving average of the true-range
// series, so it shares the EMA seed/smoothing contract.

use crate::error::{BotError, Result};
use crate::indicators::ema;

/// True range per bar. The first bar has no previous close, so its own close
/// is used, which reduces its true range to high - low.
pub fn true_ranges(highs: &[f64], lows: &[f64], closes: &[f64]) -> Vec<f64> {
    let mut out = Vec::with_capacity(highs.len());
    for i in 0..highs.len() {
        let prev_close = if i == 0 { closes[0] } else { closes[i - 1] };
        let tr = (highs[i] - lows[i])
            .max((highs[i] - prev_close).abs())
            .max((lows[i] - prev_close).abs());
        out.push(tr);
    }
    out
}

/// ATR series aligned with the input bars.
///
/// Fails with `InsufficientData` when fewer than `period + 1` bars are given.
pub fn atr(highs: &[f64], lows: &[f64], closes: &[f64], period: usize) -> Result<Vec<f64>> {
    if highs.len() != lows.len() || highs.len() != closes.len() {
        return Err(BotError::InsufficientData(
            "atr: high/low/close length mismatch".to_string(),
        ));
    }
    if highs.len() < period + 1 {
        return Err(BotError::InsufficientData(format!(
            "atr: {} bars, need {}",
            highs.len(),
            period + 1
        )));
    }

    let tr = true_ranges(highs, lows, closes);
    ema(&tr, period)
}
