// Donchian channel and breakout tests
//
// The caller supplies the exact window: the breakout strategies pass slices
// that exclude the current bar to avoid look-ahead bias.

use crate::error::{BotError, Result};

/// Highest high and lowest low over the last `n` elements of the supplied
/// slices. Fails with `InsufficientData` when fewer than `n` values exist
/// or `n` is zero.
pub fn donchian(highs: &[f64], lows: &[f64], n: usize) -> Result<(f64, f64)> {
    if n == 0 || highs.len() < n || lows.len() < n {
        return Err(BotError::InsufficientData(format!(
            "donchian: {} highs / {} lows, need {}",
            highs.len(),
            lows.len(),
            n.max(1)
        )));
    }

    let high = highs[highs.len() - n..]
        .iter()
        .fold(f64::MIN, |acc, &x| acc.max(x));
    let low = lows[lows.len() - n..]
        .iter()
        .fold(f64::MAX, |acc, &x| acc.min(x));

    Ok((high, low))
}

/// Strictly above the prior extreme.
pub fn breakout_above(last_close: f64, prior_high: f64) -> bool {
    last_close > prior_high
}

/// Strictly below the prior extreme.
pub fn breakout_below(last_close: f64, prior_low: f64) -> bool {
    last_close < prior_low
}
