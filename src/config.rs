use crate::account::AccountTier;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub binance: BinanceConfig,
    pub trading: TradingConfig,
    pub risk: RiskConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BinanceConfig {
    pub api_key: String,
    pub secret_key: String,
    pub testnet: bool,
    pub base_url: String,
    pub recv_window: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TradingConfig {
    pub symbol: String,
    pub timeframe: String,        // Base signal timeframe
    pub higher_timeframe: String, // Trend filter timeframe
    pub poll_interval_secs: u64,
    pub step_size: Decimal,        // Quantity rounding step for the symbol
    pub min_volume: Decimal,       // Minimum 24h quote volume to trade
    pub spread_threshold: Decimal, // Max bid/ask spread percent to enter
    pub cooldown_period: u64,      // Seconds between entries
    pub max_consecutive_losses: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RiskConfig {
    pub safety_factor: Decimal,       // Base multiplier on weighted volatility
    pub default_pair_buffer: Decimal, // Stop buffer for symbols not listed below
    pub pair_buffers: HashMap<String, Decimal>,
    pub min_stop_pct: Decimal, // Stop-loss clamp, in percent of entry price
    pub max_stop_pct: Decimal,
    pub min_target_pct: Decimal, // Take-profit clamp
    pub max_target_pct: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tiers: Option<Vec<AccountTier>>, // Overrides the built-in tier table
}

impl Default for Config {
    fn default() -> Self {
        let mut pair_buffers = HashMap::new();
        pair_buffers.insert("BTCUSDT".to_string(), Decimal::from_str_exact("0.05").unwrap());
        pair_buffers.insert("ETHUSDT".to_string(), Decimal::from_str_exact("0.10").unwrap());

        Self {
            binance: BinanceConfig {
                api_key: String::new(),
                secret_key: String::new(),
                testnet: true,
                base_url: "https://testnet.binancefuture.com".to_string(),
                recv_window: 5000,
            },
            trading: TradingConfig {
                symbol: "BTCUSDT".to_string(),
                timeframe: "5m".to_string(),
                higher_timeframe: "1h".to_string(),
                poll_interval_secs: 10,
                step_size: Decimal::from_str_exact("0.001").unwrap(),
                min_volume: Decimal::from(50_000_000), // $50M daily futures volume
                spread_threshold: Decimal::from_str_exact("0.05").unwrap(), // 0.05%
                cooldown_period: 300, // One base candle between entries
                max_consecutive_losses: 4,
            },
            risk: RiskConfig {
                safety_factor: Decimal::ONE,
                default_pair_buffer: Decimal::from_str_exact("0.20").unwrap(),
                pair_buffers,
                min_stop_pct: Decimal::from_str_exact("0.5").unwrap(), // 0.5% of entry
                max_stop_pct: Decimal::from(5),
                min_target_pct: Decimal::from_str_exact("0.8").unwrap(),
                max_target_pct: Decimal::from(10),
                tiers: None,
            },
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_str = std::fs::read_to_string("config.toml").unwrap_or_else(|_| {
            log::warn!("Config file not found, using default configuration");
            String::new()
        });

        if config_str.is_empty() {
            let default_config = Self::default();
            let toml_str = toml::to_string_pretty(&default_config)?;
            std::fs::write("config.toml", toml_str)?;
            Ok(default_config)
        } else {
            Ok(toml::from_str(&config_str)?)
        }
    }

    /// Stop buffer for a symbol, falling back to the default for unlisted pairs.
    pub fn pair_buffer(&self, symbol: &str) -> Decimal {
        self.risk
            .pair_buffers
            .get(symbol)
            .copied()
            .unwrap_or(self.risk.default_pair_buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_default_config_round_trips_through_toml() {
        let config = Config::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();

        assert_eq!(parsed.trading.symbol, "BTCUSDT");
        assert_eq!(parsed.trading.timeframe, "5m");
        assert_eq!(parsed.risk.max_stop_pct, Decimal::from(5));
    }

    #[test]
    fn test_pair_buffer_falls_back_to_default() {
        let config = Config::default();

        assert_eq!(
            config.pair_buffer("BTCUSDT"),
            Decimal::from_str("0.05").unwrap()
        );
        assert_eq!(
            config.pair_buffer("DOGEUSDT"),
            config.risk.default_pair_buffer
        );
    }
}
