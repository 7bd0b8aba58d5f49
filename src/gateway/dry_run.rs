// Dry-run gateway
//
// Wraps a real gateway: market data passes through untouched, while every
// order-shaped call is answered synthetically without touching the venue.
// The state machine runs identically in both modes; this wrapper is the
// whole of dry-run support.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use crate::error::Result;
use crate::gateway::{ExchangeGateway, TopOfBook};
use crate::models::{
    Bar, CancelOutcome, MarketConstraints, OrderAck, OrderIntent, OrderSnapshot, OrderStatus,
    OrderType,
};

pub struct DryRunGateway<G> {
    inner: G,
    next_id: AtomicU64,
}

impl<G> DryRunGateway<G> {
    pub fn new(inner: G) -> Self {
        Self {
            inner,
            next_id: AtomicU64::new(1),
        }
    }

    fn make_order_id(&self) -> String {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        format!("dry-{n}")
    }
}

#[async_trait]
impl<G: ExchangeGateway> ExchangeGateway for DryRunGateway<G> {
    async fn load_markets(&self) -> Result<HashMap<String, MarketConstraints>> {
        self.inner.load_markets().await
    }

    async fn fetch_bars(&self, symbol: &str, timeframe: &str, limit: usize) -> Result<Vec<Bar>> {
        self.inner.fetch_bars(symbol, timeframe, limit).await
    }

    async fn fetch_last_price(&self, symbol: &str) -> Result<f64> {
        self.inner.fetch_last_price(symbol).await
    }

    async fn fetch_order_book(&self, symbol: &str, depth: usize) -> Result<TopOfBook> {
        self.inner.fetch_order_book(symbol, depth).await
    }

    /// Immediate synthetic fill. Stop orders are acknowledged but never
    /// submitted; the engine's price polling drives the stop in this mode.
    async fn submit_order(&self, intent: &OrderIntent) -> Result<OrderAck> {
        let fill_price = match (intent.price, intent.trigger_price) {
            (Some(p), _) => p,
            (None, Some(t)) => t,
            (None, None) => self.inner.fetch_last_price(&intent.symbol).await?,
        };

        tracing::info!(
            "[DRY] {} {} {:.8} {} @ {:.6}",
            intent.side.as_str(),
            match intent.order_type {
                OrderType::Market => "market",
                OrderType::Limit => "limit",
                OrderType::Stop => "stop",
            },
            intent.amount,
            intent.symbol,
            fill_price
        );

        Ok(OrderAck {
            order_id: self.make_order_id(),
            fill_price: Some(fill_price),
            status: OrderStatus::Filled,
        })
    }

    async fn cancel_order(&self, _order_id: &str, _symbol: &str) -> Result<CancelOutcome> {
        Ok(CancelOutcome::Canceled)
    }

    async fn fetch_order_status(&self, _order_id: &str, _symbol: &str) -> Result<OrderSnapshot> {
        Ok(OrderSnapshot {
            status: OrderStatus::Filled,
            avg_fill_price: None,
        })
    }

    /// The synthetic venue holds nothing, which also makes startup
    /// reconciliation a no-op in dry-run mode.
    async fn fetch_free_balance(&self, _asset: &str) -> Result<f64> {
        Ok(0.0)
    }
}
