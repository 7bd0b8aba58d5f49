// Per-symbol order lifecycle state machine
//
// Flat -> EntryPending -> InPosition -> ExitPending -> Flat. The manager owns
// every PositionState; the scheduler only owns cooldown timers. Within one
// cycle the trailing stop is ratcheted before exit conditions are evaluated,
// so a favorable tick extends the stop before it can be declared breached.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;

use crate::config::{BotConfig, OrderMode, TrailMode};
use crate::error::{BotError, Result};
use crate::gateway::ExchangeGateway;
use crate::indicators::compute_snapshot;
use crate::models::{
    split_symbol, CancelOutcome, Direction, ExitReason, IndicatorSnapshot, MarketConstraints,
    OrderIntent, OrderSide, OrderStatus, OrderType, PositionState,
};
use crate::sizing::{round_down, size_order, RiskCap};
use crate::strategy::{Decision, SignalPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Flat,
    EntryPending,
    InPosition,
    ExitPending,
}

/// What a cycle did, from the scheduler's point of view. `Entered` starts
/// the symbol's cooldown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleEvent {
    Idle,
    Entered,
    Exited(ExitReason),
}

struct SymbolState {
    phase: Phase,
    position: PositionState,
    constraints: MarketConstraints,
    /// Direction of the entry order while it is pending.
    pending_entry: Option<Direction>,
    /// Reason recorded when the exit order was submitted.
    pending_exit: Option<ExitReason>,
}

pub struct LifecycleManager {
    gateway: Arc<dyn ExchangeGateway>,
    policy: Box<dyn SignalPolicy>,
    config: BotConfig,
    states: HashMap<String, SymbolState>,
}

fn round_price(value: f64, precision: u32) -> f64 {
    let scale = 10f64.powi(precision as i32);
    (value * scale).round() / scale
}

/// Distance between entry and the initial stop, also used as the per-unit
/// risk for the sizing cap.
fn stop_distance(config: &BotConfig, price: f64, atr: f64) -> f64 {
    match config.trail_mode {
        TrailMode::Percent => price * config.sl_pct / 100.0,
        TrailMode::Chandelier => config.atr_mult * atr,
    }
}

fn initial_stop(config: &BotConfig, direction: Direction, entry_price: f64, atr: f64) -> f64 {
    let distance = stop_distance(config, entry_price, atr);
    match direction {
        Direction::Long => entry_price - distance,
        Direction::Short => entry_price + distance,
    }
}

fn trailing_candidate(config: &BotConfig, direction: Direction, best: f64, atr: f64) -> f64 {
    match (config.trail_mode, direction) {
        (TrailMode::Percent, Direction::Long) => best * (1.0 - config.trail_pct / 100.0),
        (TrailMode::Percent, Direction::Short) => best * (1.0 + config.trail_pct / 100.0),
        (TrailMode::Chandelier, Direction::Long) => best - config.atr_mult * atr,
        (TrailMode::Chandelier, Direction::Short) => best + config.atr_mult * atr,
    }
}

fn stop_intent(symbol: &str, direction: Direction, amount: f64, trigger: f64) -> OrderIntent {
    OrderIntent {
        symbol: symbol.to_string(),
        side: direction.exit_side(),
        order_type: OrderType::Stop,
        amount,
        price: None,
        trigger_price: Some(trigger),
        reduce_only: true,
        post_only: false,
    }
}

impl LifecycleManager {
    pub fn new(
        gateway: Arc<dyn ExchangeGateway>,
        policy: Box<dyn SignalPolicy>,
        config: BotConfig,
    ) -> Self {
        Self {
            gateway,
            policy,
            config,
            states: HashMap::new(),
        }
    }

    pub fn register_symbol(&mut self, symbol: &str, constraints: MarketConstraints) {
        self.states.insert(
            symbol.to_string(),
            SymbolState {
                phase: Phase::Flat,
                position: PositionState::flat(symbol),
                constraints,
                pending_entry: None,
                pending_exit: None,
            },
        );
    }

    pub fn symbols(&self) -> Vec<String> {
        self.states.keys().cloned().collect()
    }

    pub fn phase(&self, symbol: &str) -> Option<Phase> {
        self.states.get(symbol).map(|s| s.phase)
    }

    pub fn position(&self, symbol: &str) -> Option<&PositionState> {
        self.states.get(symbol).map(|s| &s.position)
    }

    fn state_mut(&mut self, symbol: &str) -> Result<&mut SymbolState> {
        self.states
            .get_mut(symbol)
            .ok_or_else(|| BotError::StateCorruption {
                symbol: symbol.to_string(),
                detail: "symbol not registered".to_string(),
            })
    }

    fn state(&self, symbol: &str) -> Result<&SymbolState> {
        self.states
            .get(symbol)
            .ok_or_else(|| BotError::StateCorruption {
                symbol: symbol.to_string(),
                detail: "symbol not registered".to_string(),
            })
    }

    fn reset_to_flat(&mut self, symbol: &str) {
        if let Some(state) = self.states.get_mut(symbol) {
            state.position = PositionState::flat(symbol);
            state.pending_entry = None;
            state.pending_exit = None;
            state.phase = Phase::Flat;
        }
    }

    /// Reconcile in-memory state against the live venue before the first
    /// cycle. A leftover base-asset balance above the venue minimum is
    /// adopted as a long position at the current price with a fresh stop.
    /// Dry-run mode holds nothing at the venue, so this is a no-op there.
    pub async fn reconcile(&mut self) -> Result<()> {
        if self.config.dry_run {
            tracing::info!("Dry-run mode: skipping venue reconciliation");
            return Ok(());
        }

        let gateway = self.gateway.clone();
        for symbol in self.symbols() {
            let Some((base, _quote)) = split_symbol(&symbol) else {
                continue;
            };
            let base = base.to_string();

            let (min_amount, amount_precision, price_precision) = {
                let state = self.state(&symbol)?;
                (
                    state.constraints.min_amount,
                    state.constraints.amount_precision,
                    state.constraints.price_precision,
                )
            };

            let balance = match gateway.fetch_free_balance(&base).await {
                Ok(b) => b,
                Err(e) => {
                    tracing::warn!("Reconcile {symbol}: balance fetch failed: {e}");
                    continue;
                }
            };
            let amount = round_down(balance, amount_precision);
            if amount <= 0.0 || amount < min_amount {
                continue;
            }

            let last_price = match gateway.fetch_last_price(&symbol).await {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!("Reconcile {symbol}: price fetch failed: {e}");
                    continue;
                }
            };
            let atr = match self.current_atr(&symbol).await {
                Ok(atr) => atr,
                Err(e) => {
                    tracing::warn!("Reconcile {symbol}: cannot compute stop ({e}), skipping");
                    continue;
                }
            };

            let stop = round_price(
                initial_stop(&self.config, Direction::Long, last_price, atr),
                price_precision,
            );
            let state = self.state_mut(&symbol)?;
            state.position = PositionState {
                symbol: symbol.clone(),
                side: Some(Direction::Long),
                entry_price: last_price,
                amount,
                stop_price: stop,
                take_profit_price: None,
                best_price_since_entry: last_price,
                ..PositionState::flat(&symbol)
            };
            state.phase = Phase::InPosition;
            tracing::warn!(
                "Reconcile {symbol}: adopted existing balance {amount} {base} as long \
                 @ {last_price} (stop {stop})"
            );
        }
        Ok(())
    }

    async fn current_atr(&self, symbol: &str) -> Result<f64> {
        let bars = self
            .gateway
            .fetch_bars(symbol, &self.config.timeframe, self.config.bar_limit)
            .await?;
        let snapshot = compute_snapshot(&bars, &self.config.indicators)?;
        Ok(snapshot.atr)
    }

    /// Run one cycle for one symbol. Failures leave the machine in its prior
    /// state; the next scheduled cycle is the retry mechanism.
    pub async fn run_cycle(&mut self, symbol: &str) -> Result<CycleEvent> {
        let gateway = self.gateway.clone();

        let bars = gateway
            .fetch_bars(symbol, &self.config.timeframe, self.config.bar_limit)
            .await?;
        let needed = self
            .policy
            .min_bars()
            .max(self.config.indicators.min_bars());
        if bars.len() < needed {
            return Err(BotError::InsufficientData(format!(
                "{symbol}: {} bars, need {needed}",
                bars.len()
            )));
        }
        let snapshot = compute_snapshot(&bars, &self.config.indicators)?;
        let last_price = gateway.fetch_last_price(symbol).await?;

        match self.state(symbol)?.phase {
            Phase::Flat => self.handle_flat(symbol, &snapshot, last_price).await,
            Phase::EntryPending => {
                self.handle_entry_pending(symbol, &snapshot, last_price)
                    .await
            }
            Phase::InPosition => self.handle_in_position(symbol, &snapshot, last_price).await,
            Phase::ExitPending => self.handle_exit_pending(symbol).await,
        }
    }

    // ------------------------------------------------------------------
    // Flat
    // ------------------------------------------------------------------

    async fn handle_flat(
        &mut self,
        symbol: &str,
        snapshot: &IndicatorSnapshot,
        last_price: f64,
    ) -> Result<CycleEvent> {
        let decision = self.policy.evaluate(snapshot, &self.state(symbol)?.position);

        let direction = match decision {
            Decision::Enter(direction) => direction,
            _ => return Ok(CycleEvent::Idle),
        };
        if direction == Direction::Short && !self.config.allow_short {
            return Ok(CycleEvent::Idle);
        }

        let constraints = self.state(symbol)?.constraints.clone();
        let risk_distance = stop_distance(&self.config, last_price, snapshot.atr);
        let risk_cap = self.config.max_loss_usd.map(|max_loss| RiskCap {
            max_loss,
            risk_distance,
        });
        let amount = size_order(
            symbol,
            self.config.notional_usd,
            last_price,
            &constraints,
            risk_cap,
        )?;

        let (order_type, price, post_only) = match self.config.order_mode {
            OrderMode::Market => (OrderType::Market, None, false),
            OrderMode::Maker => {
                let offset = self.config.limit_offset_pct / 100.0;
                let raw = match direction.entry_side() {
                    OrderSide::Buy => last_price * (1.0 - offset),
                    OrderSide::Sell => last_price * (1.0 + offset),
                };
                (
                    OrderType::Limit,
                    Some(round_price(raw, constraints.price_precision)),
                    true,
                )
            }
        };

        let intent = OrderIntent {
            symbol: symbol.to_string(),
            side: direction.entry_side(),
            order_type,
            amount,
            price,
            trigger_price: None,
            reduce_only: false,
            post_only,
        };

        let ack = self.gateway.clone().submit_order(&intent).await?;
        tracing::info!(
            "ENTRY {:?} {amount} {symbol} @ {} (order {})",
            direction,
            price.unwrap_or(last_price),
            ack.order_id
        );

        {
            let state = self.state_mut(symbol)?;
            state.position.amount = amount;
            state.position.open_order_id = Some(ack.order_id);
            state.position.open_order_side = Some(intent.side);
            state.position.open_order_placed_at = Some(Utc::now());
            state.position.open_order_price = Some(price.unwrap_or(last_price));
            state.pending_entry = Some(direction);
            state.phase = Phase::EntryPending;
        }

        if ack.status == OrderStatus::Filled {
            let fill_price = ack.fill_price.unwrap_or(last_price);
            self.open_position(symbol, direction, fill_price, amount, snapshot)
                .await?;
        }

        Ok(CycleEvent::Entered)
    }

    // ------------------------------------------------------------------
    // EntryPending
    // ------------------------------------------------------------------

    async fn handle_entry_pending(
        &mut self,
        symbol: &str,
        snapshot: &IndicatorSnapshot,
        last_price: f64,
    ) -> Result<CycleEvent> {
        let (order_id, direction, amount, placed_at, order_price) = {
            let state = self.state(symbol)?;
            let Some(order_id) = state.position.open_order_id.clone() else {
                self.reset_to_flat(symbol);
                return Err(BotError::StateCorruption {
                    symbol: symbol.to_string(),
                    detail: "entry pending without open order".to_string(),
                });
            };
            (
                order_id,
                state.pending_entry,
                state.position.amount,
                state.position.open_order_placed_at,
                state.position.open_order_price,
            )
        };
        let Some(direction) = direction else {
            self.reset_to_flat(symbol);
            return Err(BotError::StateCorruption {
                symbol: symbol.to_string(),
                detail: "entry pending without direction".to_string(),
            });
        };
        if amount <= 0.0 {
            self.reset_to_flat(symbol);
            return Err(BotError::StateCorruption {
                symbol: symbol.to_string(),
                detail: "entry pending without recorded amount".to_string(),
            });
        }

        let order = self
            .gateway
            .clone()
            .fetch_order_status(&order_id, symbol)
            .await?;

        match order.status {
            OrderStatus::Filled => {
                // Prefer the venue's average fill price; the placement
                // price is the fallback for venues that omit it.
                let fill_price = order
                    .avg_fill_price
                    .or(order_price)
                    .unwrap_or(last_price);
                self.open_position(symbol, direction, fill_price, amount, snapshot)
                    .await?;
                Ok(CycleEvent::Idle)
            }
            OrderStatus::Canceled => {
                tracing::warn!("Entry order {order_id} for {symbol} canceled externally");
                self.reset_to_flat(symbol);
                Ok(CycleEvent::Idle)
            }
            OrderStatus::Pending => {
                self.maybe_refresh_entry(symbol, direction, amount, placed_at, &order_id)
                    .await?;
                Ok(CycleEvent::Idle)
            }
        }
    }

    /// Maker-mode refresh: an unfilled entry past the refresh interval is
    /// canceled and re-priced at the current top of book.
    async fn maybe_refresh_entry(
        &mut self,
        symbol: &str,
        direction: Direction,
        amount: f64,
        placed_at: Option<chrono::DateTime<Utc>>,
        order_id: &str,
    ) -> Result<()> {
        if self.config.order_mode != OrderMode::Maker {
            return Ok(());
        }
        let stale = placed_at
            .map(|t| (Utc::now() - t).num_seconds() >= self.config.refresh_secs as i64)
            .unwrap_or(true);
        if !stale {
            return Ok(());
        }

        let gateway = self.gateway.clone();
        match gateway.cancel_order(order_id, symbol).await {
            Ok(CancelOutcome::Canceled) => {}
            Ok(CancelOutcome::NotFound) => {
                // Lost the race: the order likely filled. The next poll
                // picks the fill up.
                tracing::info!("Refresh {symbol}: order {order_id} already gone");
                return Ok(());
            }
            Err(e) => {
                tracing::warn!("Refresh {symbol}: cancel failed ({e}), retrying next cycle");
                return Ok(());
            }
        }

        let book = gateway.fetch_order_book(symbol, 1).await?;
        let price_precision = self.state(symbol)?.constraints.price_precision;
        let offset = self.config.limit_offset_pct / 100.0;
        let raw = match direction.entry_side() {
            OrderSide::Buy => book.best_bid * (1.0 - offset),
            OrderSide::Sell => book.best_ask * (1.0 + offset),
        };
        let price = round_price(raw, price_precision);

        let intent = OrderIntent {
            symbol: symbol.to_string(),
            side: direction.entry_side(),
            order_type: OrderType::Limit,
            amount,
            price: Some(price),
            trigger_price: None,
            reduce_only: false,
            post_only: true,
        };
        let ack = gateway.submit_order(&intent).await?;
        tracing::info!(
            "Refresh {symbol}: repriced entry to {price} (order {})",
            ack.order_id
        );

        let state = self.state_mut(symbol)?;
        state.position.open_order_id = Some(ack.order_id);
        state.position.open_order_placed_at = Some(Utc::now());
        state.position.open_order_price = Some(price);
        Ok(())
    }

    // ------------------------------------------------------------------
    // InPosition
    // ------------------------------------------------------------------

    async fn handle_in_position(
        &mut self,
        symbol: &str,
        snapshot: &IndicatorSnapshot,
        last_price: f64,
    ) -> Result<CycleEvent> {
        // Fail-safe: never operate on a position with no entry price.
        let corrupted = {
            let position = &self.state(symbol)?.position;
            position.entry_price <= 0.0 || position.amount <= 0.0
        };
        if corrupted {
            let stop_order = self.state(symbol)?.position.stop_order_id.clone();
            self.reset_to_flat(symbol);
            if let Some(id) = stop_order {
                let _ = self.gateway.clone().cancel_order(&id, symbol).await;
            }
            return Err(BotError::StateCorruption {
                symbol: symbol.to_string(),
                detail: "in position with missing entry price or amount".to_string(),
            });
        }

        // 1. Ratchet the trailing stop before anything can exit.
        self.update_trailing_stop(symbol, snapshot, last_price)
            .await?;

        // 2. Evaluate exits. The policy sees the ratcheted stop; the live
        //    price is additionally checked against the stop as approximate
        //    fill detection (no order-fill feed exists).
        let decision = self.policy.evaluate(snapshot, &self.state(symbol)?.position);
        let (stop_price, trail_active, side) = {
            let position = &self.state(symbol)?.position;
            (position.stop_price, position.trail_active, position.side)
        };

        let mut exit_reason = match decision {
            Decision::Exit(reason) => Some(reason),
            _ => None,
        };
        if exit_reason.is_none() {
            let breached = match side {
                Some(Direction::Long) => last_price <= stop_price,
                Some(Direction::Short) => last_price >= stop_price,
                None => false,
            };
            if breached {
                exit_reason = Some(if trail_active {
                    ExitReason::Trail
                } else {
                    ExitReason::StopLoss
                });
            }
        }

        match exit_reason {
            Some(reason) => self.submit_exit(symbol, reason).await,
            None => Ok(CycleEvent::Idle),
        }
    }

    /// Update the high-water mark and ratchet the stop if the candidate
    /// improves it. The stop never moves against the position.
    async fn update_trailing_stop(
        &mut self,
        symbol: &str,
        snapshot: &IndicatorSnapshot,
        last_price: f64,
    ) -> Result<()> {
        let config = self.config.clone();
        let (direction, new_stop, needs_order, amount, old_order) = {
            let state = self
                .states
                .get_mut(symbol)
                .ok_or_else(|| BotError::StateCorruption {
                    symbol: symbol.to_string(),
                    detail: "symbol not registered".to_string(),
                })?;
            let Some(direction) = state.position.side else {
                return Ok(());
            };

            let position = &mut state.position;
            position.best_price_since_entry = match direction {
                Direction::Long => position.best_price_since_entry.max(last_price),
                Direction::Short => position.best_price_since_entry.min(last_price),
            };

            let candidate = round_price(
                trailing_candidate(
                    &config,
                    direction,
                    position.best_price_since_entry,
                    snapshot.atr,
                ),
                state.constraints.price_precision,
            );
            let improved = match direction {
                Direction::Long => candidate > position.stop_price,
                Direction::Short => candidate < position.stop_price,
            };
            if improved {
                tracing::info!("TRAIL {symbol}: stop {} -> {candidate}", position.stop_price);
                position.stop_price = candidate;
                position.trail_active = true;
            }
            // Also re-place when a previous stop submission failed and no
            // order is resting.
            let needs_order = improved || position.stop_order_id.is_none();
            (
                direction,
                position.stop_price,
                needs_order,
                position.amount,
                position.stop_order_id.clone(),
            )
        };

        if !needs_order {
            return Ok(());
        }

        // Cancel/replace the resting stop. Failures are logged and
        // swallowed; the next cycle recomputes and retries, and the stop
        // level still protects via price polling in the meantime.
        let gateway = self.gateway.clone();
        if let Some(id) = old_order {
            if let Err(e) = gateway.cancel_order(&id, symbol).await {
                tracing::warn!("{symbol}: stop cancel failed ({e})");
            }
        }

        match gateway
            .submit_order(&stop_intent(symbol, direction, amount, new_stop))
            .await
        {
            Ok(ack) => {
                self.state_mut(symbol)?.position.stop_order_id = Some(ack.order_id);
            }
            Err(e) => {
                tracing::warn!("{symbol}: stop replace failed ({e}), retrying next cycle");
                self.state_mut(symbol)?.position.stop_order_id = None;
            }
        }
        Ok(())
    }

    async fn open_position(
        &mut self,
        symbol: &str,
        direction: Direction,
        fill_price: f64,
        amount: f64,
        snapshot: &IndicatorSnapshot,
    ) -> Result<()> {
        let price_precision = self.state(symbol)?.constraints.price_precision;
        let stop = round_price(
            initial_stop(&self.config, direction, fill_price, snapshot.atr),
            price_precision,
        );
        let take_profit = self.config.tp_pct.map(|tp| {
            let raw = match direction {
                Direction::Long => fill_price * (1.0 + tp / 100.0),
                Direction::Short => fill_price * (1.0 - tp / 100.0),
            };
            round_price(raw, price_precision)
        });

        {
            let state = self.state_mut(symbol)?;
            state.position = PositionState {
                symbol: symbol.to_string(),
                side: Some(direction),
                entry_price: fill_price,
                amount,
                stop_price: stop,
                take_profit_price: take_profit,
                best_price_since_entry: fill_price,
                ..PositionState::flat(symbol)
            };
            state.pending_entry = None;
            state.phase = Phase::InPosition;
        }
        tracing::info!(
            "FILLED {:?} {amount} {symbol} @ {fill_price} | stop={stop} tp={:?}",
            direction,
            take_profit
        );

        // Attach the protective stop at the venue. A refusal leaves the
        // software stop in charge until the next cycle retries.
        match self
            .gateway
            .clone()
            .submit_order(&stop_intent(symbol, direction, amount, stop))
            .await
        {
            Ok(ack) => {
                self.state_mut(symbol)?.position.stop_order_id = Some(ack.order_id);
            }
            Err(e) => {
                tracing::warn!("{symbol}: initial stop placement failed ({e})");
            }
        }
        Ok(())
    }

    async fn submit_exit(&mut self, symbol: &str, reason: ExitReason) -> Result<CycleEvent> {
        let (direction, amount, stop_order) = {
            let state = self.state(symbol)?;
            let Some(direction) = state.position.side else {
                return Ok(CycleEvent::Idle);
            };
            (
                direction,
                state.position.amount,
                state.position.stop_order_id.clone(),
            )
        };

        let gateway = self.gateway.clone();

        // Pull the resting stop first so only one live order can exist.
        if let Some(id) = stop_order {
            if let Err(e) = gateway.cancel_order(&id, symbol).await {
                tracing::warn!("{symbol}: stop cancel before exit failed ({e})");
            }
            self.state_mut(symbol)?.position.stop_order_id = None;
        }

        let intent = OrderIntent {
            symbol: symbol.to_string(),
            side: direction.exit_side(),
            order_type: OrderType::Market,
            amount,
            price: None,
            trigger_price: None,
            reduce_only: true,
            post_only: false,
        };
        let ack = gateway.submit_order(&intent).await?;
        tracing::info!(
            "EXIT {amount} {symbol} ({}) order {}",
            reason.as_str(),
            ack.order_id
        );

        {
            let state = self.state_mut(symbol)?;
            state.position.open_order_id = Some(ack.order_id);
            state.position.open_order_side = Some(intent.side);
            state.position.open_order_placed_at = Some(Utc::now());
            state.pending_exit = Some(reason);
            state.phase = Phase::ExitPending;
        }

        if ack.status == OrderStatus::Filled {
            return self.finalize_exit(symbol).await;
        }
        Ok(CycleEvent::Idle)
    }

    async fn handle_exit_pending(&mut self, symbol: &str) -> Result<CycleEvent> {
        let order_id = self.state(symbol)?.position.open_order_id.clone();
        let Some(order_id) = order_id else {
            return self.finalize_exit(symbol).await;
        };

        let order = self
            .gateway
            .clone()
            .fetch_order_status(&order_id, symbol)
            .await?;
        match order.status {
            OrderStatus::Filled => self.finalize_exit(symbol).await,
            OrderStatus::Canceled => {
                // Exit order removed out-of-band: still in the market.
                tracing::warn!("{symbol}: exit order {order_id} canceled, back to InPosition");
                let state = self.state_mut(symbol)?;
                state.position.open_order_id = None;
                state.position.open_order_side = None;
                state.position.open_order_placed_at = None;
                state.pending_exit = None;
                state.phase = Phase::InPosition;
                Ok(CycleEvent::Idle)
            }
            OrderStatus::Pending => Ok(CycleEvent::Idle),
        }
    }

    async fn finalize_exit(&mut self, symbol: &str) -> Result<CycleEvent> {
        let state = self.state_mut(symbol)?;
        let reason = state.pending_exit.unwrap_or(ExitReason::StopLoss);
        tracing::info!(
            "CLOSED {symbol} ({}) entry={} amount={}",
            reason.as_str(),
            state.position.entry_price,
            state.position.amount
        );
        self.reset_to_flat(symbol);
        Ok(CycleEvent::Exited(reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::config::PairSelection;
    use crate::gateway::{DryRunGateway, TopOfBook};
    use crate::indicators::IndicatorParams;
    use crate::models::{Bar, OrderAck, OrderSnapshot};
    use crate::strategy::test_support::snapshot;
    use crate::strategy::{protective_exit, Decision};

    const SYM: &str = "XBT/USD";

    struct StubShared {
        bars: Mutex<Vec<Bar>>,
        last_price: Mutex<f64>,
        submissions: Mutex<Vec<OrderIntent>>,
        /// "submit" / "cancel" markers in call order.
        events: Mutex<Vec<&'static str>>,
        poll_status: Mutex<OrderStatus>,
        poll_fill_price: Mutex<Option<f64>>,
        next_id: AtomicU64,
    }

    #[derive(Clone)]
    struct StubGateway {
        shared: Arc<StubShared>,
        fill_on_submit: bool,
    }

    impl StubGateway {
        fn new(price: f64) -> Self {
            Self {
                shared: Arc::new(StubShared {
                    bars: Mutex::new(Vec::new()),
                    last_price: Mutex::new(price),
                    submissions: Mutex::new(Vec::new()),
                    events: Mutex::new(Vec::new()),
                    poll_status: Mutex::new(OrderStatus::Pending),
                    poll_fill_price: Mutex::new(None),
                    next_id: AtomicU64::new(1),
                }),
                fill_on_submit: true,
            }
        }

        fn set_price(&self, price: f64) {
            *self.shared.last_price.lock().unwrap() = price;
        }

        fn submissions(&self) -> Vec<OrderIntent> {
            self.shared.submissions.lock().unwrap().clone()
        }

        fn events(&self) -> Vec<&'static str> {
            self.shared.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ExchangeGateway for StubGateway {
        async fn load_markets(&self) -> Result<HashMap<String, MarketConstraints>> {
            Ok(HashMap::new())
        }

        async fn fetch_bars(
            &self,
            _symbol: &str,
            _timeframe: &str,
            _limit: usize,
        ) -> Result<Vec<Bar>> {
            Ok(self.shared.bars.lock().unwrap().clone())
        }

        async fn fetch_last_price(&self, _symbol: &str) -> Result<f64> {
            Ok(*self.shared.last_price.lock().unwrap())
        }

        async fn fetch_order_book(&self, _symbol: &str, _depth: usize) -> Result<TopOfBook> {
            let price = *self.shared.last_price.lock().unwrap();
            Ok(TopOfBook {
                best_bid: price - 0.5,
                best_ask: price + 0.5,
            })
        }

        async fn submit_order(&self, intent: &OrderIntent) -> Result<OrderAck> {
            self.shared.submissions.lock().unwrap().push(intent.clone());
            self.shared.events.lock().unwrap().push("submit");
            let n = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
            if self.fill_on_submit {
                let price = *self.shared.last_price.lock().unwrap();
                Ok(OrderAck {
                    order_id: format!("stub-{n}"),
                    fill_price: Some(intent.price.unwrap_or(price)),
                    status: OrderStatus::Filled,
                })
            } else {
                Ok(OrderAck {
                    order_id: format!("stub-{n}"),
                    fill_price: None,
                    status: OrderStatus::Pending,
                })
            }
        }

        async fn cancel_order(&self, _order_id: &str, _symbol: &str) -> Result<CancelOutcome> {
            self.shared.events.lock().unwrap().push("cancel");
            Ok(CancelOutcome::Canceled)
        }

        async fn fetch_order_status(&self, _order_id: &str, _symbol: &str) -> Result<OrderSnapshot> {
            Ok(OrderSnapshot {
                status: *self.shared.poll_status.lock().unwrap(),
                avg_fill_price: *self.shared.poll_fill_price.lock().unwrap(),
            })
        }

        async fn fetch_free_balance(&self, _asset: &str) -> Result<f64> {
            Ok(0.0)
        }
    }

    /// Enters long whenever flat; in position only the protective levels
    /// can exit.
    struct AlwaysEnterLong;

    impl SignalPolicy for AlwaysEnterLong {
        fn evaluate(&self, snapshot: &IndicatorSnapshot, position: &PositionState) -> Decision {
            if let Some(reason) = protective_exit(snapshot, position) {
                return Decision::Exit(reason);
            }
            if position.is_flat() {
                Decision::Enter(Direction::Long)
            } else {
                Decision::Hold
            }
        }

        fn name(&self) -> &'static str {
            "always-long"
        }

        fn min_bars(&self) -> usize {
            0
        }
    }

    fn test_config() -> BotConfig {
        BotConfig {
            pairs: PairSelection::List(vec![SYM.to_string()]),
            timeframe: "15m".to_string(),
            indicators: IndicatorParams::default(),
            strategy: crate::config::StrategyKind::Breakout,
            trend_filter: false,
            allow_short: false,
            tp_pct: None,
            sl_pct: 1.0,
            trail_pct: 0.5,
            trail_mode: TrailMode::Percent,
            atr_mult: 3.0,
            order_mode: OrderMode::Market,
            limit_offset_pct: 0.03,
            refresh_secs: 0,
            notional_usd: 50.0,
            max_loss_usd: None,
            cooldown_secs: 0,
            cycle_secs: 1,
            bar_limit: 250,
            dry_run: true,
            api_key: None,
            api_secret: None,
        }
    }

    fn constraints() -> MarketConstraints {
        MarketConstraints {
            min_amount: 0.0001,
            min_notional: 1.0,
            amount_precision: 4,
            price_precision: 3,
        }
    }

    fn manager(gateway: Arc<dyn ExchangeGateway>, config: BotConfig) -> LifecycleManager {
        let mut manager = LifecycleManager::new(gateway, Box::new(AlwaysEnterLong), config);
        manager.register_symbol(SYM, constraints());
        manager
    }

    fn flat_bars(n: usize, close: f64) -> Vec<Bar> {
        let now = Utc::now();
        (0..n)
            .map(|i| Bar {
                timestamp: now - chrono::Duration::minutes(15 * (n - i) as i64),
                open: close,
                high: close,
                low: close,
                close,
                volume: 1.0,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_trailing_stop_ratchets_and_exits_as_trail() {
        let stub = StubGateway::new(100.0);
        let mut manager = manager(Arc::new(stub.clone()), test_config());

        manager
            .open_position(SYM, Direction::Long, 100.0, 0.5, &snapshot(100.0))
            .await
            .unwrap();
        assert_eq!(manager.phase(SYM), Some(Phase::InPosition));
        let position = manager.position(SYM).unwrap();
        assert!((position.stop_price - 99.0).abs() < 1e-9);
        assert!(!position.trail_active);

        // Favorable tick: stop ratchets to 105 * (1 - 0.5%).
        let event = manager
            .handle_in_position(SYM, &snapshot(105.0), 105.0)
            .await
            .unwrap();
        assert_eq!(event, CycleEvent::Idle);
        let position = manager.position(SYM).unwrap();
        assert!((position.stop_price - 104.475).abs() < 1e-9);
        assert!(position.trail_active);

        // Pullback above the stop: the stop must not move down.
        let event = manager
            .handle_in_position(SYM, &snapshot(104.8), 104.8)
            .await
            .unwrap();
        assert_eq!(event, CycleEvent::Idle);
        let position = manager.position(SYM).unwrap();
        assert!((position.stop_price - 104.475).abs() < 1e-9);

        // Breach exits as TRAIL, not SL, and with the entry amount.
        let event = manager
            .handle_in_position(SYM, &snapshot(103.0), 103.0)
            .await
            .unwrap();
        assert_eq!(event, CycleEvent::Exited(ExitReason::Trail));
        assert_eq!(manager.phase(SYM), Some(Phase::Flat));

        let submissions = stub.submissions();
        let exit = submissions.last().unwrap();
        assert_eq!(exit.side, OrderSide::Sell);
        assert_eq!(exit.order_type, OrderType::Market);
        assert!(exit.reduce_only);
        assert!((exit.amount - 0.5).abs() < 1e-12);

        // Every stop replacement tightened the level.
        let stops: Vec<f64> = submissions
            .iter()
            .filter(|i| i.order_type == OrderType::Stop)
            .filter_map(|i| i.trigger_price)
            .collect();
        assert!(stops.windows(2).all(|w| w[1] > w[0]));
    }

    #[tokio::test]
    async fn test_maker_refresh_cancels_before_repricing() {
        let mut stub = StubGateway::new(100.0);
        stub.fill_on_submit = false;
        let mut config = test_config();
        config.order_mode = OrderMode::Maker;
        let mut manager = manager(Arc::new(stub.clone()), config);

        let event = manager
            .handle_flat(SYM, &snapshot(100.0), 100.0)
            .await
            .unwrap();
        assert_eq!(event, CycleEvent::Entered);
        assert_eq!(manager.phase(SYM), Some(Phase::EntryPending));
        let first_order = manager.position(SYM).unwrap().open_order_id.clone();

        // Still unfilled past the refresh interval: cancel, then reprice
        // from the book. Never two live orders.
        let event = manager
            .handle_entry_pending(SYM, &snapshot(100.0), 100.0)
            .await
            .unwrap();
        assert_eq!(event, CycleEvent::Idle);
        assert_eq!(stub.events(), vec!["submit", "cancel", "submit"]);

        let position = manager.position(SYM).unwrap();
        assert_ne!(position.open_order_id, first_order);
        // Repriced off best bid 99.5 with the configured offset.
        let expected: f64 = 99.5 * (1.0 - 0.0003);
        let repriced = position.open_order_price.unwrap();
        assert!((repriced - (expected * 1000.0).round() / 1000.0).abs() < 1e-9);
        assert_eq!(manager.phase(SYM), Some(Phase::EntryPending));
    }

    #[tokio::test]
    async fn test_entry_fill_is_picked_up_by_polling() {
        let mut stub = StubGateway::new(100.0);
        stub.fill_on_submit = false;
        let mut manager = manager(Arc::new(stub.clone()), test_config());

        manager
            .handle_flat(SYM, &snapshot(100.0), 100.0)
            .await
            .unwrap();
        assert_eq!(manager.phase(SYM), Some(Phase::EntryPending));

        *stub.shared.poll_status.lock().unwrap() = OrderStatus::Filled;
        manager
            .handle_entry_pending(SYM, &snapshot(100.0), 100.0)
            .await
            .unwrap();
        assert_eq!(manager.phase(SYM), Some(Phase::InPosition));
        let position = manager.position(SYM).unwrap();
        assert_eq!(position.side, Some(Direction::Long));
        assert!((position.entry_price - 100.0).abs() < 1e-9);
        assert!((position.stop_price - 99.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_polled_fill_uses_venue_average_price() {
        let mut stub = StubGateway::new(100.0);
        stub.fill_on_submit = false;
        let mut manager = manager(Arc::new(stub.clone()), test_config());

        manager
            .handle_flat(SYM, &snapshot(100.0), 100.0)
            .await
            .unwrap();

        // The market entry slips: the venue reports an average fill price
        // above the placement price, and the position carries the former.
        *stub.shared.poll_status.lock().unwrap() = OrderStatus::Filled;
        *stub.shared.poll_fill_price.lock().unwrap() = Some(100.25);
        manager
            .handle_entry_pending(SYM, &snapshot(100.0), 100.0)
            .await
            .unwrap();

        let position = manager.position(SYM).unwrap();
        assert!((position.entry_price - 100.25).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_externally_canceled_entry_resets_to_flat() {
        let mut stub = StubGateway::new(100.0);
        stub.fill_on_submit = false;
        let mut manager = manager(Arc::new(stub.clone()), test_config());

        manager
            .handle_flat(SYM, &snapshot(100.0), 100.0)
            .await
            .unwrap();
        *stub.shared.poll_status.lock().unwrap() = OrderStatus::Canceled;
        let event = manager
            .handle_entry_pending(SYM, &snapshot(100.0), 100.0)
            .await
            .unwrap();
        assert_eq!(event, CycleEvent::Idle);
        assert_eq!(manager.phase(SYM), Some(Phase::Flat));
        assert!(manager.position(SYM).unwrap().is_flat());
    }

    #[tokio::test]
    async fn test_position_without_entry_price_fails_safe() {
        let stub = StubGateway::new(100.0);
        let mut manager = manager(Arc::new(stub.clone()), test_config());
        {
            let state = manager.state_mut(SYM).unwrap();
            state.phase = Phase::InPosition;
            state.position.side = Some(Direction::Long);
            state.position.amount = 1.0;
        }

        let err = manager
            .handle_in_position(SYM, &snapshot(100.0), 100.0)
            .await
            .unwrap_err();
        assert!(matches!(err, BotError::StateCorruption { .. }));
        assert_eq!(manager.phase(SYM), Some(Phase::Flat));
    }

    #[tokio::test]
    async fn test_dry_run_cycle_never_reaches_the_venue() {
        let stub = StubGateway::new(100.0);
        *stub.shared.bars.lock().unwrap() = flat_bars(40, 100.0);
        let gateway = Arc::new(DryRunGateway::new(stub.clone()));
        let mut manager = manager(gateway, test_config());

        let event = manager.run_cycle(SYM).await.unwrap();
        assert_eq!(event, CycleEvent::Entered);
        assert_eq!(manager.phase(SYM), Some(Phase::InPosition));

        // Adverse move through the stop closes the position, still without
        // a single real submission.
        stub.set_price(95.0);
        let event = manager.run_cycle(SYM).await.unwrap();
        assert!(matches!(event, CycleEvent::Exited(_)));
        assert_eq!(manager.phase(SYM), Some(Phase::Flat));
        assert!(stub.submissions().is_empty());
        assert!(stub.events().is_empty());
    }
}
