use crate::config::RiskConfig;
use rust_decimal::Decimal;

/// Volatility-adaptive SL/TP sizing. All percentages are in percent of the
/// entry price, matching the ATR% unit produced by the volatility analyzer.
#[derive(Debug, Clone)]
pub struct StopSizer {
    safety_factor: Decimal,
    min_stop_pct: Decimal,
    max_stop_pct: Decimal,
    min_target_pct: Decimal,
    max_target_pct: Decimal,
}

impl StopSizer {
    pub fn new(risk: &RiskConfig) -> Self {
        Self {
            safety_factor: risk.safety_factor,
            min_stop_pct: risk.min_stop_pct,
            max_stop_pct: risk.max_stop_pct,
            min_target_pct: risk.min_target_pct,
            max_target_pct: risk.max_target_pct,
        }
    }

    /// Stop distance scales with the weighted volatility, widened by the
    /// strategy's buffer and the per-pair buffer, then clamped to the
    /// configured band.
    pub fn stop_loss_percent(
        &self,
        weighted_volatility: Decimal,
        strategy_buffer: Decimal,
        pair_buffer: Decimal,
    ) -> Decimal {
        let raw = weighted_volatility * (self.safety_factor + strategy_buffer + pair_buffer);
        raw.clamp(self.min_stop_pct, self.max_stop_pct)
    }

    pub fn take_profit_percent(&self, stop_loss_pct: Decimal, reward_ratio: Decimal) -> Decimal {
        (stop_loss_pct * reward_ratio).clamp(self.min_target_pct, self.max_target_pct)
    }

    /// (target, stop) prices for an entry. Longs exit above/below entry,
    /// shorts are mirrored.
    pub fn protective_prices(
        &self,
        side: &str,
        entry_price: Decimal,
        stop_loss_pct: Decimal,
        take_profit_pct: Decimal,
    ) -> (Decimal, Decimal) {
        let hundred = Decimal::from(100);
        let stop_fraction = stop_loss_pct / hundred;
        let target_fraction = take_profit_pct / hundred;

        match side {
            "BUY" => (
                entry_price * (Decimal::ONE + target_fraction),
                entry_price * (Decimal::ONE - stop_fraction),
            ),
            "SELL" => (
                entry_price * (Decimal::ONE - target_fraction),
                entry_price * (Decimal::ONE + stop_fraction),
            ),
            _ => (entry_price, entry_price),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn sizer() -> StopSizer {
        StopSizer::new(&Config::default().risk)
    }

    #[test]
    fn test_stop_scales_with_volatility_and_buffers() {
        let sizer = sizer();

        // 0.8 * (1.0 + 0.3 + 0.05) = 1.08
        let stop = sizer.stop_loss_percent(dec("0.8"), dec("0.3"), dec("0.05"));
        assert_eq!(stop, dec("1.08"));

        let wider = sizer.stop_loss_percent(dec("0.8"), dec("0.5"), dec("0.05"));
        assert!(wider > stop);
    }

    #[test]
    fn test_stop_clamps_to_configured_band() {
        let sizer = sizer();

        // Dead market: raw stop 0.1 * 1.0 = 0.1, floor is 0.5
        let floored = sizer.stop_loss_percent(dec("0.1"), Decimal::ZERO, Decimal::ZERO);
        assert_eq!(floored, dec("0.5"));

        // Crash conditions: raw stop 8 * 1.5 = 12, ceiling is 5
        let capped = sizer.stop_loss_percent(dec("8"), dec("0.3"), dec("0.2"));
        assert_eq!(capped, dec("5"));
    }

    #[test]
    fn test_take_profit_follows_reward_ratio_within_band() {
        let sizer = sizer();

        assert_eq!(sizer.take_profit_percent(dec("1.0"), dec("2")), dec("2.0"));
        // Floor kicks in for tiny stops
        assert_eq!(sizer.take_profit_percent(dec("0.5"), dec("1")), dec("0.8"));
        // Ceiling kicks in for wide stops
        assert_eq!(sizer.take_profit_percent(dec("5"), dec("3")), dec("10"));
    }

    #[test]
    fn test_protective_prices_sit_on_the_right_side() {
        let sizer = sizer();
        let entry = dec("40000");

        let (target, stop) = sizer.protective_prices("BUY", entry, dec("1"), dec("2"));
        assert_eq!(stop, dec("39600"));
        assert_eq!(target, dec("40800"));
        assert!(stop < entry && target > entry);

        let (target, stop) = sizer.protective_prices("SELL", entry, dec("1"), dec("2"));
        assert_eq!(stop, dec("40400"));
        assert_eq!(target, dec("39200"));
        assert!(stop > entry && target < entry);
    }
}
