use anyhow::Result;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// One row of the account-size parameter table. `min_equity` is the inclusive
/// lower bound of the band; the band runs until the next tier's bound.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AccountTier {
    pub min_equity: Decimal,
    pub max_leverage: u32,
    pub risk_per_trade_pct: Decimal, // Fraction of equity risked per entry
    pub max_positions: u32,
    pub margin_type: String, // "ISOLATED" or "CROSSED"
}

/// Sorted tier table with total lookup: any non-negative equity maps to a tier.
#[derive(Debug, Clone)]
pub struct AccountTiers {
    tiers: Vec<AccountTier>,
}

impl AccountTiers {
    pub fn new(tiers: Vec<AccountTier>) -> Result<Self> {
        if tiers.is_empty() {
            return Err(anyhow::anyhow!("Tier table must not be empty"));
        }

        for window in tiers.windows(2) {
            if window[1].min_equity <= window[0].min_equity {
                return Err(anyhow::anyhow!(
                    "Tier bands must be strictly ascending: {} then {}",
                    window[0].min_equity,
                    window[1].min_equity
                ));
            }
        }

        for tier in &tiers {
            if tier.max_leverage == 0 {
                return Err(anyhow::anyhow!(
                    "Tier at {} has zero leverage",
                    tier.min_equity
                ));
            }
            if tier.risk_per_trade_pct <= Decimal::ZERO || tier.risk_per_trade_pct >= Decimal::ONE {
                return Err(anyhow::anyhow!(
                    "Tier at {} has risk fraction outside (0, 1): {}",
                    tier.min_equity,
                    tier.risk_per_trade_pct
                ));
            }
            if tier.margin_type != "ISOLATED" && tier.margin_type != "CROSSED" {
                return Err(anyhow::anyhow!(
                    "Tier at {} has unknown margin type: {}",
                    tier.min_equity,
                    tier.margin_type
                ));
            }
        }

        Ok(Self { tiers })
    }

    /// Built-in table: small accounts run higher leverage and risk per trade,
    /// larger accounts step both down and spread across more positions.
    pub fn default_table() -> Self {
        let tier = |min: i64, lev: u32, risk: &str, positions: u32| AccountTier {
            min_equity: Decimal::from(min),
            max_leverage: lev,
            risk_per_trade_pct: Decimal::from_str(risk).unwrap(),
            max_positions: positions,
            margin_type: "ISOLATED".to_string(),
        };

        Self {
            tiers: vec![
                tier(0, 20, "0.05", 1),
                tier(100, 15, "0.04", 2),
                tier(500, 10, "0.03", 3),
                tier(1_000, 8, "0.025", 3),
                tier(5_000, 6, "0.02", 4),
                tier(10_000, 5, "0.015", 5),
                tier(50_000, 3, "0.01", 6),
            ],
        }
    }

    /// Last tier whose band starts at or below `equity`. Equity below the first
    /// band clamps to the smallest tier.
    pub fn tier_for(&self, equity: Decimal) -> &AccountTier {
        self.tiers
            .iter()
            .rev()
            .find(|tier| equity >= tier.min_equity)
            .unwrap_or(&self.tiers[0])
    }

    pub fn tiers(&self) -> &[AccountTier] {
        &self.tiers
    }
}

/// Quantity for a new position: notional = equity * risk * leverage, scaled by
/// the strategy's size multiplier and rounded down to the symbol step size.
pub fn position_quantity(
    equity: Decimal,
    price: Decimal,
    tier: &AccountTier,
    size_multiplier: Decimal,
    step_size: Decimal,
) -> Decimal {
    if price <= Decimal::ZERO || step_size <= Decimal::ZERO {
        return Decimal::ZERO;
    }

    let notional =
        equity * tier.risk_per_trade_pct * Decimal::from(tier.max_leverage) * size_multiplier;
    let raw_quantity = notional / price;

    (raw_quantity / step_size).floor() * step_size
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_lookup_clamps_both_ends() {
        let tiers = AccountTiers::default_table();

        // Below the first band and exactly zero both land on the smallest tier
        assert_eq!(tiers.tier_for(Decimal::ZERO).max_leverage, 20);
        assert_eq!(tiers.tier_for(Decimal::from(99)).max_leverage, 20);

        // Way above the last band clamps to the largest tier
        assert_eq!(tiers.tier_for(Decimal::from(1_000_000)).max_leverage, 3);
    }

    #[test]
    fn test_tier_lookup_band_boundaries() {
        let tiers = AccountTiers::default_table();

        assert_eq!(tiers.tier_for(Decimal::from(100)).max_leverage, 15);
        assert_eq!(tiers.tier_for(Decimal::from(499)).max_leverage, 15);
        assert_eq!(tiers.tier_for(Decimal::from(500)).max_leverage, 10);
    }

    #[test]
    fn test_default_table_steps_risk_down_as_equity_grows() {
        let tiers = AccountTiers::default_table();

        for window in tiers.tiers().windows(2) {
            assert!(window[1].max_leverage <= window[0].max_leverage);
            assert!(window[1].risk_per_trade_pct <= window[0].risk_per_trade_pct);
        }
    }

    #[test]
    fn test_new_rejects_bad_tables() {
        assert!(AccountTiers::new(vec![]).is_err());

        let mut out_of_order = AccountTiers::default_table().tiers().to_vec();
        out_of_order.swap(0, 1);
        assert!(AccountTiers::new(out_of_order).is_err());

        let mut bad_risk = AccountTiers::default_table().tiers().to_vec();
        bad_risk[0].risk_per_trade_pct = Decimal::from(2);
        assert!(AccountTiers::new(bad_risk).is_err());
    }

    #[test]
    fn test_position_quantity_rounds_down_to_step() {
        let tiers = AccountTiers::default_table();
        let tier = tiers.tier_for(Decimal::from(1_000));

        // 1000 * 0.025 * 8 = 200 notional, at price 30 -> 6.666..., step 0.01
        let quantity = position_quantity(
            Decimal::from(1_000),
            Decimal::from(30),
            tier,
            Decimal::ONE,
            Decimal::from_str("0.01").unwrap(),
        );
        assert_eq!(quantity, Decimal::from_str("6.66").unwrap());

        // Degenerate inputs produce zero instead of panicking
        assert_eq!(
            position_quantity(
                Decimal::from(1_000),
                Decimal::ZERO,
                tier,
                Decimal::ONE,
                Decimal::from_str("0.01").unwrap()
            ),
            Decimal::ZERO
        );
    }
}
