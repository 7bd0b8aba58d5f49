// Error taxonomy
//
// Every failure the engine can see is classified here so the scheduler can
// decide per symbol whether to skip, abort a transition, or force-reset.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BotError {
    /// Too few bars for an indicator or signal. Skip the symbol this cycle.
    #[error("insufficient data: {0}")]
    InsufficientData(String),

    /// Network / auth / venue failure. Log, skip the symbol, continue the loop.
    #[error("venue unavailable: {0}")]
    VenueUnavailable(String),

    /// Order sizing collapsed to a non-positive amount. Abort the entry.
    #[error("order size for {symbol} rounded to zero (notional {notional})")]
    ZeroSize { symbol: String, notional: f64 },

    /// The venue refused an order. The state machine stays in its prior state.
    #[error("venue rejected order: {0}")]
    VenueRejected(String),

    /// Position state failed a sanity check; the symbol is force-reset to flat.
    #[error("position state corrupted for {symbol}: {detail}")]
    StateCorruption { symbol: String, detail: String },

    /// Invalid or missing configuration. Fatal, detected before the loop starts.
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<reqwest::Error> for BotError {
    fn from(e: reqwest::Error) -> Self {
        BotError::VenueUnavailable(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BotError>;
