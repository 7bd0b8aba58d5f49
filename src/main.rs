use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use trendbot::config::{BotConfig, PairSelection};
use trendbot::gateway::{DryRunGateway, ExchangeGateway, KrakenGateway};
use trendbot::trader::Trader;

#[derive(Parser, Debug)]
#[command(name = "trendbot", about = "Trend-following spot bot for Kraken")]
struct Cli {
    /// Force dry-run regardless of the DRY_RUN environment variable.
    #[arg(long)]
    dry_run: bool,

    /// Comma-separated pair list overriding PAIR (e.g. "XBT/USD,ETH/USD").
    #[arg(long)]
    pairs: Option<String>,
}

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "trendbot=info".into()),
        )
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let cli = Cli::parse();
    let mut config = BotConfig::from_env().context("loading configuration")?;
    if cli.dry_run {
        config.dry_run = true;
    }
    if let Some(pairs) = cli.pairs {
        config.pairs = PairSelection::List(
            pairs
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        );
        config.validate().context("validating --pairs override")?;
    }

    tracing::info!("🚀 trendbot starting");
    tracing::info!(
        "  Mode: {}",
        if config.dry_run { "DRY-RUN" } else { "LIVE" }
    );
    tracing::info!("  Strategy: {:?} on {}", config.strategy, config.timeframe);
    tracing::info!(
        "  Risk: SL {}% | trail {}% ({:?}) | TP {:?}%",
        config.sl_pct,
        config.trail_pct,
        config.trail_mode,
        config.tp_pct
    );
    tracing::info!(
        "  Sizing: ${} per entry, max loss {:?}",
        config.notional_usd,
        config.max_loss_usd
    );

    let kraken = KrakenGateway::new(config.api_key.clone(), config.api_secret.clone())
        .context("building Kraken client")?;
    let gateway: Arc<dyn ExchangeGateway> = if config.dry_run {
        Arc::new(DryRunGateway::new(kraken))
    } else {
        Arc::new(kraken)
    };

    let trader = Trader::new(gateway, config)
        .await
        .context("initializing trader")?;

    let trading_task = tokio::spawn(trader.run());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("⚠️  Received Ctrl+C, shutting down...");
        }
        result = trading_task => {
            match result {
                Ok(Err(e)) => tracing::error!("Trading loop exited with error: {e}"),
                Ok(Ok(())) => tracing::error!("Trading loop exited unexpectedly"),
                Err(e) => tracing::error!("Trading task panicked: {e}"),
            }
        }
    }

    tracing::info!("👋 trendbot stopped");
    Ok(())
}
