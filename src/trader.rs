// Trading scheduler
//
// Resolves the symbol universe, reconciles against the venue once, then
// walks every symbol on a fixed interval. Symbols are isolated: one symbol
// failing its cycle never stops the loop or touches another symbol's state.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::time::{interval, Duration, Instant, MissedTickBehavior};

use crate::config::{BotConfig, PairSelection};
use crate::error::{BotError, Result};
use crate::execution::{CycleEvent, LifecycleManager, Phase};
use crate::gateway::ExchangeGateway;
use crate::models::MarketConstraints;
use crate::strategy::build_policy;

pub struct Trader {
    manager: LifecycleManager,
    cycle_secs: u64,
    cooldown: Duration,
    /// Entry-submission timestamps; entries are suppressed per symbol until
    /// the cooldown has elapsed.
    last_entry: HashMap<String, Instant>,
}

impl Trader {
    pub async fn new(gateway: Arc<dyn ExchangeGateway>, config: BotConfig) -> Result<Self> {
        let markets = gateway.load_markets().await?;
        let symbols = resolve_symbols(&config.pairs, &markets)?;

        let policy = build_policy(&config);
        tracing::info!(
            "Trading {} pair(s) with '{}' every {}s (timeframe {})",
            symbols.len(),
            policy.name(),
            config.cycle_secs,
            config.timeframe
        );

        let cycle_secs = config.cycle_secs;
        let cooldown = Duration::from_secs(config.cooldown_secs);
        let mut manager = LifecycleManager::new(gateway, policy, config);
        for symbol in &symbols {
            manager.register_symbol(symbol, markets[symbol].clone());
        }

        Ok(Self {
            manager,
            cycle_secs,
            cooldown,
            last_entry: HashMap::new(),
        })
    }

    /// Reconcile once, then cycle forever.
    pub async fn run(mut self) -> Result<()> {
        self.manager.reconcile().await?;

        let mut ticker = interval(Duration::from_secs(self.cycle_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.tick().await;
        }
    }

    /// One pass over every symbol.
    pub async fn tick(&mut self) {
        let mut symbols = self.manager.symbols();
        symbols.sort();

        for symbol in symbols {
            if self.in_cooldown(&symbol) {
                continue;
            }
            match self.manager.run_cycle(&symbol).await {
                Ok(CycleEvent::Entered) => {
                    self.last_entry.insert(symbol, Instant::now());
                }
                Ok(CycleEvent::Exited(reason)) => {
                    tracing::info!("{symbol}: position closed ({})", reason.as_str());
                }
                Ok(CycleEvent::Idle) => {}
                Err(BotError::InsufficientData(detail)) => {
                    tracing::debug!("{symbol}: skipped, {detail}");
                }
                Err(err @ BotError::VenueUnavailable(_)) => {
                    tracing::warn!("{symbol}: {err}, retrying next cycle");
                }
                Err(err @ BotError::VenueRejected(_)) => {
                    tracing::warn!("{symbol}: {err}");
                }
                Err(err @ BotError::ZeroSize { .. }) => {
                    tracing::info!("{symbol}: entry aborted, {err}");
                }
                Err(err @ BotError::StateCorruption { .. }) => {
                    tracing::error!("{symbol}: {err}, forced flat");
                }
                Err(err) => {
                    tracing::error!("{symbol}: cycle failed: {err}");
                }
            }
        }
    }

    /// Cooldown only gates fresh entries; pending and open positions are
    /// always cycled.
    fn in_cooldown(&self, symbol: &str) -> bool {
        if self.manager.phase(symbol) != Some(Phase::Flat) {
            return false;
        }
        self.last_entry
            .get(symbol)
            .is_some_and(|t| t.elapsed() < self.cooldown)
    }
}

/// Turn the configured pair selection into concrete venue symbols. Unknown
/// pairs in an explicit list are warned about and skipped; an empty result
/// is fatal.
fn resolve_symbols(
    selection: &PairSelection,
    markets: &HashMap<String, MarketConstraints>,
) -> Result<Vec<String>> {
    let mut symbols: Vec<String> = match selection {
        PairSelection::AllUsd => markets
            .keys()
            .filter(|s| s.ends_with("/USD"))
            .cloned()
            .collect(),
        PairSelection::List(list) => list
            .iter()
            .filter(|pair| {
                let known = markets.contains_key(*pair);
                if !known {
                    tracing::warn!("Pair '{pair}' not listed on the venue, skipping");
                }
                known
            })
            .cloned()
            .collect(),
    };
    symbols.sort();

    if symbols.is_empty() {
        return Err(BotError::Config(
            "no tradable pairs after resolving PAIR against the venue".to_string(),
        ));
    }
    Ok(symbols)
}
