// Configuration
//
// Typed, validated once at startup from environment variables (dotenvy loads
// a .env file first). Invalid or missing values are fatal before the trading
// loop starts; nothing downstream re-reads the environment.

use std::env;
use std::str::FromStr;

use crate::error::{BotError, Result};
use crate::indicators::IndicatorParams;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairSelection {
    /// Every active USD-quoted pair on the venue.
    AllUsd,
    List(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    EmaCross,
    Breakout,
    DonchianTrend,
}

impl FromStr for StrategyKind {
    type Err = BotError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ema-cross" | "ema_cross" | "cross" => Ok(StrategyKind::EmaCross),
            "breakout" => Ok(StrategyKind::Breakout),
            "donchian-trend" | "donchian_trend" | "donchian" => Ok(StrategyKind::DonchianTrend),
            other => Err(BotError::Config(format!("unknown STRATEGY '{other}'"))),
        }
    }
}

/// How the trailing stop distance is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrailMode {
    /// Fixed percentage below/above the best price since entry.
    Percent,
    /// Chandelier: an ATR multiple below/above the best price since entry.
    Chandelier,
}

impl FromStr for TrailMode {
    type Err = BotError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "percent" | "pct" => Ok(TrailMode::Percent),
            "chandelier" | "atr" => Ok(TrailMode::Chandelier),
            other => Err(BotError::Config(format!("unknown TRAIL_MODE '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderMode {
    Market,
    /// Post-only limit entries, repriced when unfilled past the refresh
    /// interval.
    Maker,
}

impl FromStr for OrderMode {
    type Err = BotError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "market" => Ok(OrderMode::Market),
            "limit" | "maker" => Ok(OrderMode::Maker),
            other => Err(BotError::Config(format!("unknown ORDER_TYPE '{other}'"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BotConfig {
    pub pairs: PairSelection,
    pub timeframe: String,
    pub indicators: IndicatorParams,
    pub strategy: StrategyKind,
    pub trend_filter: bool,
    pub allow_short: bool,

    /// Take-profit percent from entry; None disables the TP level.
    pub tp_pct: Option<f64>,
    pub sl_pct: f64,
    pub trail_pct: f64,
    pub trail_mode: TrailMode,
    pub atr_mult: f64,

    pub order_mode: OrderMode,
    pub limit_offset_pct: f64,
    pub refresh_secs: u64,

    pub notional_usd: f64,
    /// Max acceptable loss per position in quote currency; None disables
    /// the risk cap.
    pub max_loss_usd: Option<f64>,

    pub cooldown_secs: u64,
    pub cycle_secs: u64,
    pub bar_limit: usize,

    pub dry_run: bool,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_or(key: &str, default: &str) -> String {
    env_opt(key).unwrap_or_else(|| default.to_string())
}

fn env_parse<T: FromStr>(key: &str, default: &str) -> Result<T> {
    let raw = env_or(key, default);
    raw.parse()
        .map_err(|_| BotError::Config(format!("invalid value '{raw}' for {key}")))
}

/// Truthy strings accepted for boolean options, matching common env usage.
fn env_flag(key: &str, default: bool) -> bool {
    match env_opt(key) {
        Some(v) => matches!(
            v.to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "y" | "on"
        ),
        None => default,
    }
}

impl BotConfig {
    pub fn from_env() -> Result<Self> {
        let pairs = match env_or("PAIR", "all").trim() {
            p if p.eq_ignore_ascii_case("all") => PairSelection::AllUsd,
            p => PairSelection::List(
                p.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            ),
        };

        let indicators = IndicatorParams {
            fast_period: env_parse("EMA_FAST", "12")?,
            slow_period: env_parse("EMA_SLOW", "26")?,
            trend_period: env_parse("EMA_TREND", "200")?,
            atr_period: env_parse("ATR_PERIOD", "14")?,
            donchian_window: env_parse("DONCHIAN_WINDOW", "20")?,
        };

        let tp_pct: f64 = env_parse("TP_PCT", "1.5")?;

        let config = Self {
            pairs,
            timeframe: env_or("TIMEFRAME", "15m"),
            indicators,
            strategy: env_parse("STRATEGY", "breakout")?,
            trend_filter: env_flag("TREND_FILTER", true),
            allow_short: env_flag("ALLOW_SHORT", false),
            tp_pct: (tp_pct > 0.0).then_some(tp_pct),
            sl_pct: env_parse("SL_PCT", "0.7")?,
            trail_pct: env_parse("TRAIL_PCT", "0.3")?,
            trail_mode: env_parse("TRAIL_MODE", "percent")?,
            atr_mult: env_parse("ATR_MULT", "3.0")?,
            order_mode: env_parse("ORDER_TYPE", "limit")?,
            limit_offset_pct: env_parse("LIMIT_OFFSET_PCT", "0.03")?,
            refresh_secs: env_parse("ORDER_REFRESH_S", "90")?,
            notional_usd: env_parse("BASE_SIZE_USD", "50")?,
            max_loss_usd: env_opt("MAX_LOSS_USD")
                .map(|v| {
                    v.parse::<f64>()
                        .map_err(|_| BotError::Config(format!("invalid MAX_LOSS_USD '{v}'")))
                })
                .transpose()?,
            cooldown_secs: env_parse("COOLDOWN_S", "60")?,
            cycle_secs: env_parse("CYCLE_S", "3")?,
            bar_limit: env_parse("BAR_LIMIT", "250")?,
            dry_run: env_flag("DRY_RUN", true),
            api_key: env_opt("KRAKEN_API_KEY"),
            api_secret: env_opt("KRAKEN_API_SECRET"),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let ind = &self.indicators;
        if ind.fast_period == 0 || ind.slow_period == 0 || ind.trend_period == 0 {
            return Err(BotError::Config("EMA periods must be >= 1".to_string()));
        }
        if ind.fast_period >= ind.slow_period {
            return Err(BotError::Config(format!(
                "EMA_FAST ({}) must be below EMA_SLOW ({})",
                ind.fast_period, ind.slow_period
            )));
        }
        if ind.atr_period == 0 || ind.donchian_window == 0 {
            return Err(BotError::Config(
                "ATR_PERIOD and DONCHIAN_WINDOW must be >= 1".to_string(),
            ));
        }
        if self.sl_pct <= 0.0 || self.trail_pct <= 0.0 {
            return Err(BotError::Config(
                "SL_PCT and TRAIL_PCT must be positive".to_string(),
            ));
        }
        if let Some(tp) = self.tp_pct {
            if tp <= 0.0 {
                return Err(BotError::Config("TP_PCT must be positive".to_string()));
            }
        }
        if self.atr_mult <= 0.0 {
            return Err(BotError::Config("ATR_MULT must be positive".to_string()));
        }
        if self.limit_offset_pct < 0.0 {
            return Err(BotError::Config(
                "LIMIT_OFFSET_PCT must not be negative".to_string(),
            ));
        }
        if self.notional_usd <= 0.0 {
            return Err(BotError::Config("BASE_SIZE_USD must be positive".to_string()));
        }
        if let Some(cap) = self.max_loss_usd {
            if cap <= 0.0 {
                return Err(BotError::Config("MAX_LOSS_USD must be positive".to_string()));
            }
        }
        if self.cycle_secs == 0 {
            return Err(BotError::Config("CYCLE_S must be >= 1".to_string()));
        }
        if self.bar_limit < ind.min_bars() {
            return Err(BotError::Config(format!(
                "BAR_LIMIT ({}) below indicator minimum ({})",
                self.bar_limit,
                ind.min_bars()
            )));
        }
        if let PairSelection::List(list) = &self.pairs {
            if list.is_empty() {
                return Err(BotError::Config("PAIR list is empty".to_string()));
            }
        }
        if !self.dry_run && (self.api_key.is_none() || self.api_secret.is_none()) {
            return Err(BotError::Config(
                "KRAKEN_API_KEY / KRAKEN_API_SECRET required unless DRY_RUN".to_string(),
            ));
        }
        Ok(())
    }

    /// Bar timeframe as venue OHLC interval minutes.
    pub fn timeframe_minutes(&self) -> Result<u32> {
        parse_timeframe(&self.timeframe)
    }
}

pub fn parse_timeframe(tf: &str) -> Result<u32> {
    let tf = tf.trim().to_ascii_lowercase();
    let (num, unit) = tf.split_at(tf.len().saturating_sub(1));
    let n: u32 = num
        .parse()
        .map_err(|_| BotError::Config(format!("invalid TIMEFRAME '{tf}'")))?;
    match unit {
        "m" => Ok(n),
        "h" => Ok(n * 60),
        "d" => Ok(n * 1440),
        "w" => Ok(n * 10080),
        _ => Err(BotError::Config(format!("invalid TIMEFRAME '{tf}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> BotConfig {
        BotConfig {
            pairs: PairSelection::AllUsd,
            timeframe: "15m".to_string(),
            indicators: IndicatorParams::default(),
            strategy: StrategyKind::Breakout,
            trend_filter: true,
            allow_short: false,
            tp_pct: Some(1.5),
            sl_pct: 0.7,
            trail_pct: 0.3,
            trail_mode: TrailMode::Percent,
            atr_mult: 3.0,
            order_mode: OrderMode::Maker,
            limit_offset_pct: 0.03,
            refresh_secs: 90,
            notional_usd: 50.0,
            max_loss_usd: None,
            cooldown_secs: 60,
            cycle_secs: 3,
            bar_limit: 250,
            dry_run: true,
            api_key: None,
            api_secret: None,
        }
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn test_live_mode_requires_credentials() {
        let mut config = base_config();
        config.dry_run = false;
        assert!(matches!(config.validate(), Err(BotError::Config(_))));

        config.api_key = Some("key".to_string());
        config.api_secret = Some("secret".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_fast_must_be_below_slow() {
        let mut config = base_config();
        config.indicators.fast_period = 30;
        assert!(matches!(config.validate(), Err(BotError::Config(_))));
    }

    #[test]
    fn test_negative_trail_rejected() {
        let mut config = base_config();
        config.trail_pct = -0.5;
        assert!(matches!(config.validate(), Err(BotError::Config(_))));
    }

    #[test]
    fn test_bar_limit_must_cover_indicators() {
        let mut config = base_config();
        config.bar_limit = 5;
        assert!(matches!(config.validate(), Err(BotError::Config(_))));
    }

    #[test]
    fn test_parse_timeframe() {
        assert_eq!(parse_timeframe("15m").unwrap(), 15);
        assert_eq!(parse_timeframe("1h").unwrap(), 60);
        assert_eq!(parse_timeframe("1d").unwrap(), 1440);
        assert!(parse_timeframe("fifteen").is_err());
    }

    #[test]
    fn test_strategy_kind_parsing() {
        assert_eq!(
            "ema-cross".parse::<StrategyKind>().unwrap(),
            StrategyKind::EmaCross
        );
        assert_eq!(
            "donchian".parse::<StrategyKind>().unwrap(),
            StrategyKind::DonchianTrend
        );
        assert!("martingale".parse::<StrategyKind>().is_err());
    }
}
