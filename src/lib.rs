//! Binance Futures Trading Bot Library
//!
//! A USDⓈ-M futures trading bot for Binance with regime-aware strategy
//! selection, volatility-adaptive stop sizing and backtesting support.

pub mod account;
pub mod backtester;
pub mod binance;
pub mod config;
pub mod indicators;
pub mod regime;
pub mod stops;
pub mod strategy;
pub mod volatility;

// Re-export commonly used types
pub use account::{AccountTier, AccountTiers};
pub use backtester::{BacktestConfig, BacktestResults, Backtester};
pub use config::Config;
pub use indicators::Signal;
pub use regime::{MarketRegime, StrategyProfile};
pub use stops::StopSizer;
pub use strategy::{FuturesStrategy, Position};
pub use volatility::{VolatilityAnalyzer, VolatilityLevel};
