// Core modules
pub mod config;
pub mod error;
pub mod execution;
pub mod gateway;
pub mod indicators;
pub mod models;
pub mod sizing;
pub mod strategy;
pub mod trader;

// Re-export commonly used types
pub use config::BotConfig;
pub use error::{BotError, Result};
pub use gateway::{DryRunGateway, ExchangeGateway, KrakenGateway};
pub use models::*;
pub use strategy::SignalPolicy;
pub use trader::Trader;
