use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Coarse market condition label driving strategy selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketRegime {
    /// Directional market, ADX above the trend threshold
    Trending,
    /// Sideways market with ordinary volatility
    Ranging,
    /// Elevated ATR% or stretched Bollinger bands, no reliable direction
    Volatile,
    /// ATR% below the activity floor, spreads eat most edges
    Quiet,
}

impl MarketRegime {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketRegime::Trending => "trending",
            MarketRegime::Ranging => "ranging",
            MarketRegime::Volatile => "volatile",
            MarketRegime::Quiet => "quiet",
        }
    }
}

/// Classification thresholds. Volatility outranks trend: a market can print a
/// high ADX while whipsawing, and the volatile profile is the safer of the two.
#[derive(Debug, Clone)]
pub struct RegimeThresholds {
    pub adx_trending: Decimal,
    pub atr_pct_volatile: Decimal,
    pub band_width_volatile: Decimal,
    pub atr_pct_quiet: Decimal,
}

impl Default for RegimeThresholds {
    fn default() -> Self {
        Self {
            adx_trending: Decimal::from(25),
            atr_pct_volatile: Decimal::from_str("2.5").unwrap(),
            band_width_volatile: Decimal::from_str("0.08").unwrap(),
            atr_pct_quiet: Decimal::from_str("0.25").unwrap(),
        }
    }
}

/// Classify from the three regime inputs. Returns None while any input is
/// still warming up, so callers fall back to the conservative profile.
pub fn detect_regime(
    adx: Option<Decimal>,
    atr_pct: Option<Decimal>,
    band_width: Option<Decimal>,
    thresholds: &RegimeThresholds,
) -> Option<MarketRegime> {
    let adx = adx?;
    let atr_pct = atr_pct?;
    let band_width = band_width?;

    let regime = if atr_pct >= thresholds.atr_pct_volatile
        || band_width >= thresholds.band_width_volatile
    {
        MarketRegime::Volatile
    } else if adx >= thresholds.adx_trending {
        MarketRegime::Trending
    } else if atr_pct <= thresholds.atr_pct_quiet {
        MarketRegime::Quiet
    } else {
        MarketRegime::Ranging
    };

    Some(regime)
}

/// Per-regime strategy parameters: how much each indicator family counts in
/// the entry vote, how strict the entry is, and how stops and sizing stretch.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyProfile {
    pub name: &'static str,
    pub trend_weight: Decimal,
    pub reversion_weight: Decimal,
    pub momentum_weight: Decimal,
    pub entry_threshold: Decimal, // Minimum weighted vote score to enter
    pub stop_buffer: Decimal,     // Strategy term in the stop-loss formula
    pub reward_ratio: Decimal,    // Take-profit distance as a multiple of the stop
    pub size_multiplier: Decimal, // Scales the tier position size
}

fn profile(
    name: &'static str,
    trend: &str,
    reversion: &str,
    momentum: &str,
    threshold: &str,
    stop_buffer: &str,
    reward: &str,
    size: &str,
) -> StrategyProfile {
    let d = |s: &str| Decimal::from_str(s).unwrap();
    StrategyProfile {
        name,
        trend_weight: d(trend),
        reversion_weight: d(reversion),
        momentum_weight: d(momentum),
        entry_threshold: d(threshold),
        stop_buffer: d(stop_buffer),
        reward_ratio: d(reward),
        size_multiplier: d(size),
    }
}

/// The single strategy table keyed by regime.
pub fn profile_for(regime: MarketRegime) -> StrategyProfile {
    match regime {
        // Ride EMA/MACD, give the position room, aim for a long target
        MarketRegime::Trending => {
            profile("trend-following", "1.0", "0.2", "0.7", "2.0", "0.30", "2.0", "1.0")
        }
        // Fade band touches and RSI extremes, tight stops, modest targets
        MarketRegime::Ranging => {
            profile("mean-reversion", "0.2", "1.0", "0.4", "1.8", "0.10", "1.5", "0.8")
        }
        // Only the strongest confluence trades, half size, wide stops
        MarketRegime::Volatile => {
            profile("breakout", "0.6", "0.2", "0.8", "2.6", "0.50", "2.5", "0.5")
        }
        // Barely trade at all; whatever fires gets a small, tight position
        MarketRegime::Quiet => {
            profile("scalp", "0.4", "0.6", "0.4", "2.4", "0.00", "1.2", "0.5")
        }
    }
}

/// Used before the indicators are warm enough to classify the market.
pub fn fallback_profile() -> StrategyProfile {
    profile("warmup", "0.4", "0.4", "0.4", "2.5", "0.20", "1.5", "0.5")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn test_cold_inputs_yield_no_regime() {
        let thresholds = RegimeThresholds::default();
        assert_eq!(
            detect_regime(None, Some(dec("1")), Some(dec("0.02")), &thresholds),
            None
        );
        assert_eq!(
            detect_regime(Some(dec("30")), None, Some(dec("0.02")), &thresholds),
            None
        );
    }

    #[test]
    fn test_trending_classification() {
        let thresholds = RegimeThresholds::default();
        let regime = detect_regime(Some(dec("32")), Some(dec("1.0")), Some(dec("0.03")), &thresholds);
        assert_eq!(regime, Some(MarketRegime::Trending));
    }

    #[test]
    fn test_volatile_outranks_trending() {
        let thresholds = RegimeThresholds::default();

        // High ADX but ATR% past the volatile bar -> volatile wins
        let by_atr = detect_regime(Some(dec("40")), Some(dec("3.0")), Some(dec("0.03")), &thresholds);
        assert_eq!(by_atr, Some(MarketRegime::Volatile));

        // Stretched bands alone are enough
        let by_width = detect_regime(Some(dec("10")), Some(dec("1.0")), Some(dec("0.09")), &thresholds);
        assert_eq!(by_width, Some(MarketRegime::Volatile));
    }

    #[test]
    fn test_quiet_and_ranging_split() {
        let thresholds = RegimeThresholds::default();

        let quiet = detect_regime(Some(dec("12")), Some(dec("0.2")), Some(dec("0.01")), &thresholds);
        assert_eq!(quiet, Some(MarketRegime::Quiet));

        let ranging = detect_regime(Some(dec("15")), Some(dec("0.8")), Some(dec("0.03")), &thresholds);
        assert_eq!(ranging, Some(MarketRegime::Ranging));
    }

    #[test]
    fn test_profiles_cut_size_when_conditions_degrade() {
        let trending = profile_for(MarketRegime::Trending);
        let volatile = profile_for(MarketRegime::Volatile);
        let quiet = profile_for(MarketRegime::Quiet);

        assert!(volatile.size_multiplier < trending.size_multiplier);
        assert!(quiet.size_multiplier < trending.size_multiplier);
        // Stricter entries outside calm trends
        assert!(volatile.entry_threshold > trending.entry_threshold);
        // Wider stops where the noise is
        assert!(volatile.stop_buffer > profile_for(MarketRegime::Ranging).stop_buffer);
    }

    #[test]
    fn test_fallback_profile_is_conservative() {
        let fallback = fallback_profile();
        assert!(fallback.size_multiplier <= dec("0.5"));
        assert!(fallback.entry_threshold >= profile_for(MarketRegime::Trending).entry_threshold);
    }
}
