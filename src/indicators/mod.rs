// Technical indicators module
// Pure functions over bar sequences: EMA, ATR, Donchian channel, breakouts.
// Everything here is deterministic for identical input.

pub mod atr;
pub mod donchian;
pub mod ema;
pub mod snapshot;

pub use atr::{atr, true_ranges};
pub use donchian::{breakout_above, breakout_below, donchian};
pub use ema::ema;
pub use snapshot::{compute_snapshot, IndicatorParams};
