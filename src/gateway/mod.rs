// Exchange gateway module
//
// The one seam between the engine and the venue. Everything network-shaped
// (auth, rate limiting, timeouts, payload formats) lives behind this trait;
// the core only ever sees domain types and BotError variants.

pub mod dry_run;
pub mod kraken;

pub use dry_run::DryRunGateway;
pub use kraken::KrakenGateway;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{
    Bar, CancelOutcome, MarketConstraints, OrderAck, OrderIntent, OrderSnapshot,
};

/// Best bid / best ask at the top of the book.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TopOfBook {
    pub best_bid: f64,
    pub best_ask: f64,
}

/// Venue collaborator contract consumed by the core.
///
/// Every call is expected to return within the gateway's own bounded
/// timeout; a timeout surfaces as `VenueUnavailable` and is treated as
/// transient by the caller.
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    async fn load_markets(&self) -> Result<HashMap<String, MarketConstraints>>;

    /// Ordered bar sequence, oldest first.
    async fn fetch_bars(&self, symbol: &str, timeframe: &str, limit: usize) -> Result<Vec<Bar>>;

    async fn fetch_last_price(&self, symbol: &str) -> Result<f64>;

    async fn fetch_order_book(&self, symbol: &str, depth: usize) -> Result<TopOfBook>;

    async fn submit_order(&self, intent: &OrderIntent) -> Result<OrderAck>;

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> Result<CancelOutcome>;

    /// Current status of an order, with the average fill price when the
    /// venue has recorded any execution.
    async fn fetch_order_status(&self, order_id: &str, symbol: &str) -> Result<OrderSnapshot>;

    /// Free balance of `asset`, used for startup reconciliation and exit
    /// sizing when the venue does not track the position amount.
    async fn fetch_free_balance(&self, asset: &str) -> Result<f64>;
}
