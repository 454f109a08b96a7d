use crate::account::{position_quantity, AccountTiers};
use crate::binance::{FuturesClient, Kline};
use crate::config::Config;
use crate::indicators::Signal;
use crate::strategy::{FuturesStrategy, Position};
use anyhow::Result;
use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestConfig {
    pub start_date: String, // "2024-01-01"
    pub end_date: String,   // "2024-12-31"
    pub initial_balance: Decimal,
    pub commission_rate: Decimal,    // Taker fee on notional, 0.0004 = 0.04%
    pub slippage: Decimal,           // 0.0001 = 0.01%
    pub data_interval: String,       // Base bar interval, "5m" etc.
    pub max_klines_per_request: u16, // 1000
    pub leverage: Option<u32>,       // Overrides the tier leverage when set
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            start_date: "2024-01-01".to_string(),
            end_date: "2024-01-31".to_string(),
            initial_balance: Decimal::from(1000),
            commission_rate: Decimal::from_str("0.0004").unwrap(), // Futures taker
            slippage: Decimal::from_str("0.0001").unwrap(),
            data_interval: "5m".to_string(),
            max_klines_per_request: 1000,
            leverage: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BacktestTrade {
    pub id: u64,
    pub symbol: String,
    pub side: String,
    pub entry_time: DateTime<Utc>,
    pub exit_time: Option<DateTime<Utc>>,
    pub entry_price: Decimal,
    pub exit_price: Option<Decimal>,
    pub quantity: Decimal,
    pub leverage: u32,
    pub commission: Decimal,
    pub pnl: Option<Decimal>,
    pub exit_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BacktestResults {
    pub initial_balance: Decimal,
    pub final_balance: Decimal,
    pub total_return: Decimal,
    pub total_return_pct: Decimal,
    pub total_trades: u32,
    pub winning_trades: u32,
    pub losing_trades: u32,
    pub win_rate: f64,
    pub avg_win: Decimal,
    pub avg_loss: Decimal,
    pub largest_win: Decimal,
    pub largest_loss: Decimal,
    pub max_drawdown: Decimal,
    pub max_drawdown_pct: Decimal,
    pub sharpe_ratio: f64,
    pub profit_factor: Decimal,
    pub total_commission: Decimal,
    pub trades: Vec<BacktestTrade>,
    pub equity_curve: Vec<(DateTime<Utc>, Decimal)>,
}

fn interval_ms(interval: &str) -> Result<u64> {
    let ms = match interval {
        "1m" => 60_000,
        "3m" => 180_000,
        "5m" => 300_000,
        "15m" => 900_000,
        "30m" => 1_800_000,
        "1h" => 3_600_000,
        "2h" => 7_200_000,
        "4h" => 14_400_000,
        "1d" => 86_400_000,
        _ => return Err(anyhow::anyhow!("Unsupported interval: {interval}")),
    };
    Ok(ms)
}

/// Collapse a run of base bars into one candle of the longer interval.
fn aggregate_candle(buffer: &[Kline]) -> Result<Kline> {
    let first = buffer
        .first()
        .ok_or_else(|| anyhow::anyhow!("Empty aggregation buffer"))?;
    let last = buffer
        .last()
        .ok_or_else(|| anyhow::anyhow!("Empty aggregation buffer"))?;

    let mut high = Decimal::from_str(&first.high)?;
    let mut low = Decimal::from_str(&first.low)?;
    let mut volume = Decimal::ZERO;
    let mut quote_volume = Decimal::ZERO;
    let mut trades = 0u32;
    for kline in buffer {
        high = high.max(Decimal::from_str(&kline.high)?);
        low = low.min(Decimal::from_str(&kline.low)?);
        volume += Decimal::from_str(&kline.volume)?;
        quote_volume += Decimal::from_str(&kline.quote_asset_volume)?;
        trades += kline.number_of_trades;
    }

    Ok(Kline {
        open_time: first.open_time,
        open: first.open.clone(),
        high: high.to_string(),
        low: low.to_string(),
        close: last.close.clone(),
        volume: volume.to_string(),
        close_time: last.close_time,
        quote_asset_volume: quote_volume.to_string(),
        number_of_trades: trades,
    })
}

#[derive(Debug)]
pub struct Backtester {
    client: FuturesClient,
    config: BacktestConfig,
    bot_config: Config,
    tiers: AccountTiers,
    balance: Decimal,
    equity_curve: Vec<(DateTime<Utc>, Decimal)>,
    trades: Vec<BacktestTrade>,
    open_positions: HashMap<u64, Position>,
    next_trade_id: u64,
    total_commission: Decimal,
}

impl Backtester {
    pub fn new(client: FuturesClient, config: BacktestConfig, bot_config: Config) -> Result<Self> {
        let initial_balance = config.initial_balance;
        let tiers = match &bot_config.risk.tiers {
            Some(table) => AccountTiers::new(table.clone())?,
            None => AccountTiers::default_table(),
        };

        Ok(Self {
            client,
            config,
            bot_config,
            tiers,
            balance: initial_balance,
            equity_curve: vec![(Utc::now(), initial_balance)],
            trades: Vec::new(),
            open_positions: HashMap::new(),
            next_trade_id: 1,
            total_commission: Decimal::ZERO,
        })
    }

    pub async fn run_backtest(&mut self) -> Result<BacktestResults> {
        log::info!(
            "Starting backtest from {} to {}",
            self.config.start_date,
            self.config.end_date
        );

        let klines = self.fetch_historical_data().await?;
        log::info!("Loaded {} klines for backtesting", klines.len());

        if klines.is_empty() {
            return Err(anyhow::anyhow!(
                "No historical data available for the specified period"
            ));
        }

        let mut strategy = FuturesStrategy::new(&self.bot_config);

        let base_interval = self.config.data_interval.clone();
        let base_ms = interval_ms(&base_interval)?;

        // Longer timeframes are rebuilt from base bars: the higher-TF trend
        // filter plus every volatility blend interval coarser than the base.
        let higher_tf = self.bot_config.trading.higher_timeframe.clone();
        let mut agg_intervals: Vec<String> = vec![higher_tf.clone()];
        for interval in ["5m", "1h", "4h"] {
            if interval != base_interval && !agg_intervals.contains(&interval.to_string()) {
                agg_intervals.push(interval.to_string());
            }
        }
        agg_intervals.retain(|interval| {
            interval_ms(interval).map(|ms| ms > base_ms).unwrap_or(false)
        });
        let mut buffers: HashMap<String, Vec<Kline>> = HashMap::new();

        for (i, kline) in klines.iter().enumerate() {
            self.process_kline(
                &mut strategy,
                kline,
                &base_interval,
                &agg_intervals,
                &higher_tf,
                &mut buffers,
            )?;

            if i % 1000 == 0 {
                log::info!("Processed {} / {} klines", i + 1, klines.len());
            }
        }

        if let Some(final_kline) = klines.last() {
            let final_price = Decimal::from_str(&final_kline.close)?;
            self.close_all_positions(final_price, "Backtest ended")?;
        }

        let results = self.generate_results()?;

        log::info!(
            "Backtest completed. Final balance: {:.2}",
            results.final_balance
        );
        log::info!("Total return: {:.2}%", results.total_return_pct);
        log::info!("Win rate: {:.2}%", results.win_rate);

        Ok(results)
    }

    async fn fetch_historical_data(&self) -> Result<Vec<Kline>> {
        let start_time = self.parse_date(&self.config.start_date)?;
        let end_time = self.parse_date(&self.config.end_date)?;
        let base_ms = interval_ms(&self.config.data_interval)? as i64;

        let mut all_klines = Vec::new();
        let mut current_time = start_time;

        while current_time < end_time {
            let batch_end = std::cmp::min(
                current_time
                    + chrono::Duration::milliseconds(
                        base_ms * self.config.max_klines_per_request as i64,
                    ),
                end_time,
            );

            log::debug!(
                "Fetching data from {} to {}",
                current_time.format("%Y-%m-%d %H:%M:%S"),
                batch_end.format("%Y-%m-%d %H:%M:%S")
            );

            let klines = self
                .client
                .get_klines_with_range(
                    &self.bot_config.trading.symbol,
                    &self.config.data_interval,
                    Some(current_time.timestamp_millis() as u64),
                    Some(batch_end.timestamp_millis() as u64),
                    self.config.max_klines_per_request,
                )
                .await?;

            if klines.is_empty() {
                break;
            }

            all_klines.extend(klines);
            current_time = batch_end;

            // Stay under the exchange request weight limits
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
        }

        all_klines.sort_by(|a, b| a.open_time.cmp(&b.open_time));
        all_klines.dedup_by_key(|k| k.open_time);

        Ok(all_klines)
    }

    fn process_kline(
        &mut self,
        strategy: &mut FuturesStrategy,
        kline: &Kline,
        base_interval: &str,
        agg_intervals: &[String],
        higher_tf: &str,
        buffers: &mut HashMap<String, Vec<Kline>>,
    ) -> Result<()> {
        let current_price = Decimal::from_str(&kline.close)?;
        let current_time = DateTime::from_timestamp(
            (kline.close_time / 1000) as i64,
            ((kline.close_time % 1000) * 1_000_000) as u32,
        )
        .unwrap_or_else(Utc::now);

        strategy.apply_closed_candle(kline)?;
        if ["5m", "1h", "4h"].contains(&base_interval) {
            strategy.apply_volatility_candle(base_interval, kline)?;
        }

        for interval in agg_intervals {
            let ms = interval_ms(interval)?;
            let buffer = buffers.entry(interval.clone()).or_default();
            buffer.push(kline.clone());

            if (kline.close_time + 1) % ms == 0 {
                let candle = aggregate_candle(buffer)?;
                buffer.clear();

                if interval == higher_tf {
                    strategy.apply_higher_tf_candle(&candle)?;
                }
                if ["5m", "1h", "4h"].contains(&interval.as_str()) {
                    strategy.apply_volatility_candle(interval, &candle)?;
                }
            }
        }

        self.check_exit_conditions(current_price, current_time)?;

        // Entry cooldown mirrors the live loop, driven by bar time
        let bar_secs = kline.close_time / 1000;
        let in_cooldown = strategy
            .last_signal_time
            .map(|last| bar_secs < last + strategy.cooldown_duration.as_secs())
            .unwrap_or(false);

        if !in_cooldown {
            let tier = self.tiers.tier_for(self.calculate_current_equity(current_price));
            strategy.set_max_positions(tier.max_positions);

            let signal = strategy.analyze_market()?;
            match signal {
                Signal::Buy | Signal::Sell => {
                    let side = if signal == Signal::Buy { "BUY" } else { "SELL" };
                    strategy.last_signal_time = Some(bar_secs);
                    self.execute_backtest_order(side, current_price, current_time, strategy)?;
                }
                Signal::Hold => {}
            }
        }

        let current_equity = self.calculate_current_equity(current_price);
        self.equity_curve.push((current_time, current_equity));

        Ok(())
    }

    fn execute_backtest_order(
        &mut self,
        side: &str,
        price: Decimal,
        time: DateTime<Utc>,
        strategy: &mut FuturesStrategy,
    ) -> Result<()> {
        let equity = self.calculate_current_equity(price);
        let tier = self.tiers.tier_for(equity);

        if self.open_positions.len() >= tier.max_positions as usize {
            return Ok(());
        }

        let execution_price = match side {
            "BUY" => price * (Decimal::ONE + self.config.slippage),
            "SELL" => price * (Decimal::ONE - self.config.slippage),
            _ => price,
        };

        let leverage = self.config.leverage.unwrap_or(tier.max_leverage);
        let quantity = position_quantity(
            equity,
            execution_price,
            tier,
            strategy.profile().size_multiplier,
            self.bot_config.trading.step_size,
        );
        if quantity <= Decimal::ZERO {
            return Ok(());
        }

        let notional = quantity * execution_price;
        let margin = notional / Decimal::from(leverage);
        let commission = notional * self.config.commission_rate;

        if self.balance < margin + commission {
            log::warn!(
                "Insufficient balance for trade. Required: {:.2}, Available: {:.2}",
                margin + commission,
                self.balance
            );
            return Ok(());
        }

        self.balance -= margin + commission;
        self.total_commission += commission;

        let (target_price, stop_price) = strategy.calculate_targets(execution_price, side);

        let position = Position {
            side: side.to_string(),
            quantity,
            entry_price: execution_price,
            target_price,
            stop_price,
            leverage,
            margin,
            timestamp: time.timestamp() as u64,
        };

        let trade = BacktestTrade {
            id: self.next_trade_id,
            symbol: self.bot_config.trading.symbol.clone(),
            side: side.to_string(),
            entry_time: time,
            exit_time: None,
            entry_price: execution_price,
            exit_price: None,
            quantity,
            leverage,
            commission,
            pnl: None,
            exit_reason: None,
        };

        self.open_positions.insert(self.next_trade_id, position);
        self.trades.push(trade);

        log::debug!(
            "Opened {} position #{}: {:.6} @ {:.4} ({}x), Target: {:.4}, Stop: {:.4}",
            side,
            self.next_trade_id,
            quantity,
            execution_price,
            leverage,
            target_price,
            stop_price
        );

        self.next_trade_id += 1;

        Ok(())
    }

    fn check_exit_conditions(
        &mut self,
        current_price: Decimal,
        current_time: DateTime<Utc>,
    ) -> Result<()> {
        let mut positions_to_close = Vec::new();

        for (&trade_id, position) in &self.open_positions {
            let should_exit = match position.side.as_str() {
                "BUY" => {
                    if current_price >= position.target_price {
                        Some(("Profit target", position.target_price))
                    } else if current_price <= position.stop_price {
                        Some(("Stop loss", position.stop_price))
                    } else {
                        None
                    }
                }
                "SELL" => {
                    if current_price <= position.target_price {
                        Some(("Profit target", position.target_price))
                    } else if current_price >= position.stop_price {
                        Some(("Stop loss", position.stop_price))
                    } else {
                        None
                    }
                }
                _ => None,
            };

            if let Some((reason, exit_price)) = should_exit {
                positions_to_close.push((trade_id, exit_price, reason.to_string()));
            }
        }

        for (trade_id, exit_price, reason) in positions_to_close {
            self.close_position(trade_id, exit_price, current_time, &reason)?;
        }

        Ok(())
    }

    fn close_position(
        &mut self,
        trade_id: u64,
        exit_price: Decimal,
        exit_time: DateTime<Utc>,
        exit_reason: &str,
    ) -> Result<()> {
        if let Some(position) = self.open_positions.remove(&trade_id) {
            let execution_price = match position.side.as_str() {
                "BUY" => exit_price * (Decimal::ONE - self.config.slippage), // Selling
                "SELL" => exit_price * (Decimal::ONE + self.config.slippage), // Buying back
                _ => exit_price,
            };

            let pnl = FuturesStrategy::position_pnl(&position, execution_price);
            let close_notional = position.quantity * execution_price;
            let commission = close_notional * self.config.commission_rate;
            let net_pnl = pnl - commission;

            // Margin comes back, PnL settles against the balance
            self.balance += position.margin + pnl - commission;
            self.total_commission += commission;

            if let Some(trade) = self.trades.iter_mut().find(|t| t.id == trade_id) {
                trade.exit_time = Some(exit_time);
                trade.exit_price = Some(execution_price);
                trade.pnl = Some(net_pnl);
                trade.exit_reason = Some(exit_reason.to_string());
                trade.commission += commission;
            }

            log::debug!(
                "Closed {} position #{}: P&L: {:.4} ({})",
                position.side,
                trade_id,
                net_pnl,
                exit_reason
            );
        }

        Ok(())
    }

    fn close_all_positions(&mut self, final_price: Decimal, reason: &str) -> Result<()> {
        let position_ids: Vec<u64> = self.open_positions.keys().copied().collect();
        let final_time = Utc::now();

        for trade_id in position_ids {
            self.close_position(trade_id, final_price, final_time, reason)?;
        }

        Ok(())
    }

    /// Wallet balance plus reserved margin and unrealized PnL on open
    /// positions.
    fn calculate_current_equity(&self, current_price: Decimal) -> Decimal {
        let mut equity = self.balance;

        for position in self.open_positions.values() {
            equity += position.margin + FuturesStrategy::position_pnl(position, current_price);
        }

        equity
    }

    fn generate_results(&self) -> Result<BacktestResults> {
        let final_balance = self.balance;
        let initial_balance = self.config.initial_balance;

        let total_return = final_balance - initial_balance;
        let total_return_pct = if initial_balance > Decimal::ZERO {
            (total_return / initial_balance) * Decimal::from(100)
        } else {
            Decimal::ZERO
        };

        let completed_trades: Vec<&BacktestTrade> =
            self.trades.iter().filter(|t| t.pnl.is_some()).collect();

        let total_trades = completed_trades.len() as u32;
        let mut winning_trades = 0;
        let mut losing_trades = 0;
        let mut total_wins = Decimal::ZERO;
        let mut total_losses = Decimal::ZERO;
        let mut largest_win = Decimal::ZERO;
        let mut largest_loss = Decimal::ZERO;

        for trade in &completed_trades {
            if let Some(pnl) = trade.pnl {
                if pnl > Decimal::ZERO {
                    winning_trades += 1;
                    total_wins += pnl;
                    if pnl > largest_win {
                        largest_win = pnl;
                    }
                } else {
                    losing_trades += 1;
                    total_losses += pnl.abs();
                    if pnl < largest_loss {
                        largest_loss = pnl;
                    }
                }
            }
        }

        let win_rate = if total_trades > 0 {
            (winning_trades as f64 / total_trades as f64) * 100.0
        } else {
            0.0
        };

        let avg_win = if winning_trades > 0 {
            total_wins / Decimal::from(winning_trades)
        } else {
            Decimal::ZERO
        };

        let avg_loss = if losing_trades > 0 {
            total_losses / Decimal::from(losing_trades)
        } else {
            Decimal::ZERO
        };

        let profit_factor = if total_losses > Decimal::ZERO {
            total_wins / total_losses
        } else if total_wins > Decimal::ZERO {
            Decimal::from(999) // Never lost a trade
        } else {
            Decimal::ZERO
        };

        let (max_drawdown, max_drawdown_pct) = self.calculate_max_drawdown();
        let sharpe_ratio = self.calculate_sharpe_ratio();

        Ok(BacktestResults {
            initial_balance,
            final_balance,
            total_return,
            total_return_pct,
            total_trades,
            winning_trades,
            losing_trades,
            win_rate,
            avg_win,
            avg_loss,
            largest_win,
            largest_loss,
            max_drawdown,
            max_drawdown_pct,
            sharpe_ratio,
            profit_factor,
            total_commission: self.total_commission,
            trades: self.trades.clone(),
            equity_curve: self.equity_curve.clone(),
        })
    }

    fn calculate_max_drawdown(&self) -> (Decimal, Decimal) {
        let mut max_equity = self.config.initial_balance;
        let mut max_drawdown = Decimal::ZERO;
        let mut max_drawdown_pct = Decimal::ZERO;

        for &(_, equity) in &self.equity_curve {
            if equity > max_equity {
                max_equity = equity;
            }

            let drawdown = max_equity - equity;
            if drawdown > max_drawdown {
                max_drawdown = drawdown;
                max_drawdown_pct = if max_equity > Decimal::ZERO {
                    (drawdown / max_equity) * Decimal::from(100)
                } else {
                    Decimal::ZERO
                };
            }
        }

        (max_drawdown, max_drawdown_pct)
    }

    fn calculate_sharpe_ratio(&self) -> f64 {
        if self.equity_curve.len() < 2 {
            return 0.0;
        }

        let returns: Vec<f64> = self
            .equity_curve
            .windows(2)
            .map(|window| {
                let prev = window[0].1;
                let curr = window[1].1;
                if prev > Decimal::ZERO {
                    ((curr - prev) / prev)
                        .to_string()
                        .parse::<f64>()
                        .unwrap_or(0.0)
                } else {
                    0.0
                }
            })
            .collect();

        if returns.is_empty() {
            return 0.0;
        }

        let mean_return: f64 = returns.iter().sum::<f64>() / returns.len() as f64;
        let variance: f64 = returns
            .iter()
            .map(|r| (r - mean_return).powi(2))
            .sum::<f64>()
            / returns.len() as f64;

        let std_dev = variance.sqrt();

        if std_dev > 0.0 {
            mean_return / std_dev * (365.0_f64).sqrt() // Annualized, crypto trades daily
        } else {
            0.0
        }
    }

    fn parse_date(&self, date_str: &str) -> Result<DateTime<Utc>> {
        let naive_date =
            NaiveDateTime::parse_from_str(&format!("{} 00:00:00", date_str), "%Y-%m-%d %H:%M:%S")?;
        Ok(DateTime::from_naive_utc_and_offset(naive_date, Utc))
    }
}

// Ranged historical fetch used only by the backtester
impl FuturesClient {
    pub async fn get_klines_with_range(
        &self,
        symbol: &str,
        interval: &str,
        start_time: Option<u64>,
        end_time: Option<u64>,
        limit: u16,
    ) -> Result<Vec<Kline>> {
        let mut url = format!(
            "{}/fapi/v1/klines?symbol={}&interval={}&limit={}",
            self.base_url, symbol, interval, limit
        );

        if let Some(start) = start_time {
            url.push_str(&format!("&startTime={}", start));
        }

        if let Some(end) = end_time {
            url.push_str(&format!("&endTime={}", end));
        }

        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("Kline fetch failed with {status}: {body}"));
        }

        let rows: Vec<Vec<serde_json::Value>> = response.json().await?;
        rows.iter().map(|row| Kline::from_row(row)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn test_backtester(initial_balance: Decimal) -> Backtester {
        let client = FuturesClient::new(
            String::new(),
            String::new(),
            "http://localhost".to_string(),
            5000,
        );
        let config = BacktestConfig {
            initial_balance,
            slippage: Decimal::ZERO,
            commission_rate: dec("0.0004"),
            leverage: Some(10),
            ..BacktestConfig::default()
        };
        Backtester::new(client, config, Config::default()).unwrap()
    }

    fn utc(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn test_entry_reserves_margin_and_commission() {
        let mut bt = test_backtester(dec("1000"));
        let mut strategy = FuturesStrategy::new(&Config::default());

        bt.execute_backtest_order("BUY", dec("100"), utc(0), &mut strategy)
            .unwrap();

        assert_eq!(bt.open_positions.len(), 1);
        let position = bt.open_positions.values().next().unwrap();

        // Tier at $1000: risk 2.5%, leverage 8 -> warmup profile halves size.
        // Notional = 1000 * 0.025 * 8 * 0.5 = 100 -> qty 1.0 at price 100.
        assert_eq!(position.quantity, dec("1.0"));
        // Leverage override 10x: margin = 100 / 10
        assert_eq!(position.margin, dec("10"));

        // Balance lost margin plus 0.04% commission on 100 notional
        assert_eq!(bt.balance, dec("1000") - dec("10") - dec("0.04"));
        assert_eq!(bt.total_commission, dec("0.04"));
    }

    #[test]
    fn test_close_releases_margin_and_settles_pnl() {
        let mut bt = test_backtester(dec("1000"));
        let mut strategy = FuturesStrategy::new(&Config::default());

        bt.execute_backtest_order("BUY", dec("100"), utc(0), &mut strategy)
            .unwrap();
        let balance_after_open = bt.balance;

        // Exit 2% up: pnl = 1.0 * 2 = 2, close commission = 102 * 0.0004
        bt.close_position(1, dec("102"), utc(60), "Profit target")
            .unwrap();

        assert!(bt.open_positions.is_empty());
        let expected = balance_after_open + dec("10") + dec("2") - dec("0.0408");
        assert_eq!(bt.balance, expected);

        let trade = &bt.trades[0];
        assert_eq!(trade.exit_reason.as_deref(), Some("Profit target"));
        assert_eq!(trade.pnl, Some(dec("2") - dec("0.0408")));
    }

    #[test]
    fn test_equity_includes_unrealized_pnl() {
        let mut bt = test_backtester(dec("1000"));
        let mut strategy = FuturesStrategy::new(&Config::default());

        bt.execute_backtest_order("SELL", dec("100"), utc(0), &mut strategy)
            .unwrap();

        // Short gains as price falls: unrealized = (100 - 99) * 1.0
        let equity = bt.calculate_current_equity(dec("99"));
        assert_eq!(equity, bt.balance + dec("10") + dec("1"));
    }

    #[test]
    fn test_insufficient_balance_skips_entry() {
        let mut bt = test_backtester(dec("1000"));
        let mut strategy = FuturesStrategy::new(&Config::default());

        // Drain the account: the tiny tier notional rounds the quantity
        // down to zero, so no position opens
        bt.balance = dec("0.01");
        bt.execute_backtest_order("BUY", dec("100"), utc(0), &mut strategy)
            .unwrap();

        assert!(bt.open_positions.is_empty());
        assert!(bt.trades.is_empty());
    }

    #[test]
    fn test_max_drawdown_on_crafted_curve() {
        let mut bt = test_backtester(dec("1000"));
        bt.equity_curve = vec![
            (utc(0), dec("1000")),
            (utc(1), dec("1200")),
            (utc(2), dec("900")),
            (utc(3), dec("1100")),
        ];

        let (drawdown, drawdown_pct) = bt.calculate_max_drawdown();
        assert_eq!(drawdown, dec("300"));
        assert_eq!(drawdown_pct, dec("25"));
    }

    #[test]
    fn test_aggregate_candle_merges_ohlcv() {
        let bars = vec![
            Kline {
                open_time: 0,
                open: "100".to_string(),
                high: "103".to_string(),
                low: "99".to_string(),
                close: "101".to_string(),
                volume: "10".to_string(),
                close_time: 299_999,
                quote_asset_volume: "1000".to_string(),
                number_of_trades: 5,
            },
            Kline {
                open_time: 300_000,
                open: "101".to_string(),
                high: "105".to_string(),
                low: "100".to_string(),
                close: "104".to_string(),
                volume: "20".to_string(),
                close_time: 599_999,
                quote_asset_volume: "2000".to_string(),
                number_of_trades: 7,
            },
        ];

        let candle = aggregate_candle(&bars).unwrap();
        assert_eq!(candle.open, "100");
        assert_eq!(candle.high, "105");
        assert_eq!(candle.low, "99");
        assert_eq!(candle.close, "104");
        assert_eq!(candle.volume, "30");
        assert_eq!(candle.close_time, 599_999);
        assert_eq!(candle.number_of_trades, 12);

        assert!(aggregate_candle(&[]).is_err());
    }

    #[test]
    fn test_interval_ms_rejects_unknown_intervals() {
        assert_eq!(interval_ms("5m").unwrap(), 300_000);
        assert_eq!(interval_ms("4h").unwrap(), 14_400_000);
        assert!(interval_ms("7m").is_err());
    }
}
