use crate::indicators::ATR;
use rust_decimal::Decimal;
use std::str::FromStr;

/// Coarse volatility classification of the weighted ATR% blend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolatilityLevel {
    Low,
    Normal,
    High,
    Extreme,
}

impl VolatilityLevel {
    pub fn from_atr_percent(atr_pct: Decimal) -> Self {
        if atr_pct < Decimal::from_str("0.5").unwrap() {
            VolatilityLevel::Low
        } else if atr_pct < Decimal::from_str("1.5").unwrap() {
            VolatilityLevel::Normal
        } else if atr_pct < Decimal::from(3) {
            VolatilityLevel::High
        } else {
            VolatilityLevel::Extreme
        }
    }
}

#[derive(Debug, Clone)]
struct TimeframeAtr {
    interval: String,
    weight: Decimal,
    atr: ATR,
}

/// Blends ATR% across candle timeframes into one weighted volatility figure.
/// The short timeframe dominates so stops react to current conditions, the
/// longer ones keep a floor under quiet intraday stretches.
#[derive(Debug, Clone)]
pub struct VolatilityAnalyzer {
    timeframes: Vec<TimeframeAtr>,
}

impl VolatilityAnalyzer {
    pub const DEFAULT_ATR_PERIOD: usize = 14;

    /// The fixed 5m/1h/4h blend used by live trading and backtests.
    pub fn standard() -> Self {
        Self::new(&[("5m", "0.5"), ("1h", "0.3"), ("4h", "0.2")], Self::DEFAULT_ATR_PERIOD)
    }

    pub fn new(weights: &[(&str, &str)], atr_period: usize) -> Self {
        let timeframes = weights
            .iter()
            .map(|(interval, weight)| TimeframeAtr {
                interval: interval.to_string(),
                weight: Decimal::from_str(weight).expect("weight must be a decimal literal"),
                atr: ATR::new(atr_period),
            })
            .collect();

        Self { timeframes }
    }

    pub fn intervals(&self) -> Vec<String> {
        self.timeframes.iter().map(|tf| tf.interval.clone()).collect()
    }

    /// Feed one candle for the given timeframe. Unknown intervals are ignored
    /// so callers can pipe every refreshed series through without filtering.
    pub fn update(&mut self, interval: &str, high: Decimal, low: Decimal, close: Decimal) {
        if let Some(tf) = self
            .timeframes
            .iter_mut()
            .find(|tf| tf.interval == interval)
        {
            tf.atr.update(high, low, close);
        }
    }

    /// Weighted ATR% across all warm timeframes. Cold timeframes drop out and
    /// the remaining weights are renormalized; returns None until at least one
    /// timeframe has a full ATR window.
    pub fn weighted_atr_percent(&self) -> Option<Decimal> {
        let mut weighted_sum = Decimal::ZERO;
        let mut weight_total = Decimal::ZERO;

        for tf in &self.timeframes {
            if let Some(atr_pct) = tf.atr.percent() {
                weighted_sum += atr_pct * tf.weight;
                weight_total += tf.weight;
            }
        }

        if weight_total > Decimal::ZERO {
            Some(weighted_sum / weight_total)
        } else {
            None
        }
    }

    pub fn level(&self) -> Option<VolatilityLevel> {
        self.weighted_atr_percent().map(VolatilityLevel::from_atr_percent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    /// Feed `count` identical candles so ATR% is exactly (high-low)/close*100.
    fn warm_up(analyzer: &mut VolatilityAnalyzer, interval: &str, range: Decimal, count: usize) {
        let close = dec("100");
        for _ in 0..count {
            analyzer.update(interval, close + range, close, close);
        }
    }

    #[test]
    fn test_all_cold_returns_none() {
        let analyzer = VolatilityAnalyzer::standard();
        assert_eq!(analyzer.weighted_atr_percent(), None);
        assert_eq!(analyzer.level(), None);
    }

    #[test]
    fn test_weighted_blend_with_all_timeframes_warm() {
        let mut analyzer = VolatilityAnalyzer::standard();
        warm_up(&mut analyzer, "5m", dec("1"), 20); // 1% ATR
        warm_up(&mut analyzer, "1h", dec("2"), 20); // 2% ATR
        warm_up(&mut analyzer, "4h", dec("4"), 20); // 4% ATR

        // 0.5*1 + 0.3*2 + 0.2*4 = 1.9
        let blend = analyzer.weighted_atr_percent().unwrap();
        assert!((blend - dec("1.9")).abs() < dec("0.0001"));
        assert_eq!(analyzer.level(), Some(VolatilityLevel::High));
    }

    #[test]
    fn test_cold_timeframe_renormalizes_weights() {
        let mut analyzer = VolatilityAnalyzer::standard();
        warm_up(&mut analyzer, "5m", dec("1"), 20); // 1% ATR
        warm_up(&mut analyzer, "1h", dec("2"), 20); // 2% ATR
        // 4h never warms

        // (0.5*1 + 0.3*2) / 0.8 = 1.375
        let blend = analyzer.weighted_atr_percent().unwrap();
        assert!((blend - dec("1.375")).abs() < dec("0.0001"));
    }

    #[test]
    fn test_unknown_interval_is_ignored() {
        let mut analyzer = VolatilityAnalyzer::standard();
        warm_up(&mut analyzer, "15m", dec("1"), 20);
        assert_eq!(analyzer.weighted_atr_percent(), None);
    }

    #[test]
    fn test_level_thresholds() {
        assert_eq!(
            VolatilityLevel::from_atr_percent(dec("0.2")),
            VolatilityLevel::Low
        );
        assert_eq!(
            VolatilityLevel::from_atr_percent(dec("0.5")),
            VolatilityLevel::Normal
        );
        assert_eq!(
            VolatilityLevel::from_atr_percent(dec("1.5")),
            VolatilityLevel::High
        );
        assert_eq!(
            VolatilityLevel::from_atr_percent(dec("3")),
            VolatilityLevel::Extreme
        );
    }
}
