mod account;
mod backtester;
mod binance;
mod config;
mod indicators;
mod regime;
mod stops;
mod strategy;
mod volatility;

use account::{position_quantity, AccountTier, AccountTiers};
use anyhow::Result;
use binance::FuturesClient;
use config::Config;
use indicators::Signal;
use log::{error, info, warn};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use strategy::{FuturesStrategy, Position};
use tokio::time;

const STATS_EVERY_CYCLES: u64 = 30;

#[derive(Debug)]
struct TradingBot {
    client: FuturesClient,
    strategy: FuturesStrategy,
    config: Config,
    tiers: AccountTiers,
    applied_leverage: Option<u32>,
    is_running: bool,
}

impl TradingBot {
    pub fn new(config: Config) -> Result<Self> {
        let client = FuturesClient::new(
            config.binance.api_key.clone(),
            config.binance.secret_key.clone(),
            config.binance.base_url.clone(),
            config.binance.recv_window,
        );

        let tiers = match &config.risk.tiers {
            Some(table) => AccountTiers::new(table.clone())?,
            None => AccountTiers::default_table(),
        };

        let strategy = FuturesStrategy::new(&config);

        Ok(Self {
            client,
            strategy,
            config,
            tiers,
            applied_leverage: None,
            is_running: false,
        })
    }

    pub async fn start(&mut self) -> Result<()> {
        info!("Starting Binance Futures Bot...");

        self.verify_connection().await?;

        self.is_running = true;

        let running = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(true));
        let running_clone = running.clone();

        ctrlc::set_handler(move || {
            info!("Received Ctrl+C, shutting down gracefully...");
            running_clone.store(false, std::sync::atomic::Ordering::SeqCst);
        })?;

        let mut interval =
            time::interval(Duration::from_secs(self.config.trading.poll_interval_secs));

        // Seed every data window before the first cycle
        self.strategy.update_market_data(&self.client).await?;
        self.strategy
            .update_higher_tf_market_data(&self.client)
            .await?;
        self.strategy.update_volatility(&self.client).await?;

        // Apply the starting tier to the exchange before any order goes out
        let equity = self.fetch_equity().await?;
        self.apply_tier(equity).await?;

        let mut cycles: u64 = 0;
        while self.is_running {
            if !running.load(std::sync::atomic::Ordering::SeqCst) {
                info!("Shutting down trading service...");
                self.is_running = false;
                break;
            }
            interval.tick().await;
            cycles += 1;

            if let Err(e) = self.trading_cycle().await {
                error!("Error in trading cycle: {e}");
                // Keep the loop alive, the next cycle refetches everything
            }

            if cycles % STATS_EVERY_CYCLES == 0 {
                let (total, winning, pnl, win_rate) = self.strategy.get_performance_stats();
                let regime = self
                    .strategy
                    .regime()
                    .map(|r| r.as_str())
                    .unwrap_or("warming up");
                info!(
                    "Stats - Trades: {total}, Wins: {winning}, P&L: {pnl:.4}, Win Rate: {win_rate:.2}%, Regime: {regime}",
                );
            }
        }

        Ok(())
    }

    async fn verify_connection(&self) -> Result<()> {
        info!("Verifying API connection...");

        let account = self.client.get_account().await?;
        info!(
            "Connected successfully. Account can trade: {}",
            account.can_trade
        );

        if !account.can_trade {
            return Err(anyhow::anyhow!("Account is not allowed to trade"));
        }

        let available = Decimal::from_str(&account.available_balance)?;
        let wallet = Decimal::from_str(&account.total_wallet_balance)?;
        info!("Wallet balance: {wallet} USDT, available: {available} USDT");

        if available <= Decimal::ZERO {
            return Err(anyhow::anyhow!("No available balance to trade with"));
        }

        let ticker = self
            .client
            .get_ticker_price(&self.config.trading.symbol)
            .await?;
        info!("{} trading at {}", ticker.symbol, ticker.price);

        // Another process (or a previous run) may have left a position open;
        // this loop only manages positions it opened itself
        let positions = self
            .client
            .get_position_risk(&self.config.trading.symbol)
            .await?;
        for position in positions {
            let amount = Decimal::from_str(&position.position_amt).unwrap_or(Decimal::ZERO);
            if amount != Decimal::ZERO {
                warn!(
                    "Found existing {} position of {} on {} (entry {}), it will not be managed",
                    position.position_side, amount, position.symbol, position.entry_price
                );
            }
        }

        Ok(())
    }

    async fn fetch_equity(&self) -> Result<Decimal> {
        let account = self.client.get_account().await?;
        Ok(Decimal::from_str(&account.total_margin_balance)?)
    }

    /// Push the tier's leverage and margin type to the exchange when the
    /// equity band changes.
    async fn apply_tier(&mut self, equity: Decimal) -> Result<AccountTier> {
        let tier = self.tiers.tier_for(equity).clone();
        self.strategy.set_max_positions(tier.max_positions);

        if self.applied_leverage != Some(tier.max_leverage) {
            info!(
                "Account tier for {equity} USDT equity: {}x leverage, {} risk per trade",
                tier.max_leverage, tier.risk_per_trade_pct
            );

            self.client
                .set_leverage(&self.config.trading.symbol, tier.max_leverage)
                .await?;

            // Fails while a position is open, which is fine: the type was
            // applied when the position got opened
            if let Err(e) = self
                .client
                .set_margin_type(&self.config.trading.symbol, &tier.margin_type)
                .await
            {
                warn!("Could not set margin type: {e}");
            }

            self.applied_leverage = Some(tier.max_leverage);
        }

        Ok(tier)
    }

    async fn trading_cycle(&mut self) -> Result<()> {
        self.strategy.update_market_data(&self.client).await?;
        self.strategy
            .update_higher_tf_market_data(&self.client)
            .await?;
        self.strategy.update_volatility(&self.client).await?;

        let equity = self.fetch_equity().await?;
        let tier = self.apply_tier(equity).await?;

        let current_price = match self.get_current_price().await? {
            Some(price) => price,
            None => return Ok(()),
        };

        // Exits first so a freed slot can be reused this cycle
        let positions_to_close = self.strategy.check_exit_conditions(current_price);
        for &position_index in &positions_to_close {
            if let Some(position) = self.strategy.get_positions().get(position_index) {
                let position = position.clone();
                self.close_position(&position, current_price).await?;
            }
        }
        self.strategy.remove_positions(positions_to_close);

        let current_time = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
        let in_cooldown = self
            .strategy
            .last_signal_time
            .map(|last| current_time < last + self.strategy.cooldown_duration.as_secs())
            .unwrap_or(false);

        if in_cooldown {
            return Ok(());
        }

        match self.strategy.analyze_market()? {
            Signal::Buy => {
                info!("LONG signal at {current_price:.4}");
                self.strategy.last_signal_time = Some(current_time);
                self.execute_entry("BUY", current_price, equity, &tier).await?;
            }
            Signal::Sell => {
                info!("SHORT signal at {current_price:.4}");
                self.strategy.last_signal_time = Some(current_time);
                self.execute_entry("SELL", current_price, equity, &tier)
                    .await?;
            }
            Signal::Hold => {}
        }

        Ok(())
    }

    async fn get_current_price(&self) -> Result<Option<Decimal>> {
        let book = self
            .client
            .get_book_ticker(&self.config.trading.symbol)
            .await?;
        let bid = Decimal::from_str(&book.bid_price)?;
        let ask = Decimal::from_str(&book.ask_price)?;

        // Use mid price
        Ok(Some((bid + ask) / Decimal::from(2)))
    }

    async fn execute_entry(
        &mut self,
        side: &str,
        current_price: Decimal,
        equity: Decimal,
        tier: &AccountTier,
    ) -> Result<()> {
        let quantity = position_quantity(
            equity,
            current_price,
            tier,
            self.strategy.profile().size_multiplier,
            self.config.trading.step_size,
        );

        if quantity <= Decimal::ZERO {
            warn!("Computed quantity rounds to zero, skipping entry");
            return Ok(());
        }

        let quantity_str = quantity.normalize().to_string();
        info!(
            "Placing {} order: {} {} at ~{:.4} ({}x, {} profile)",
            side,
            quantity_str,
            self.config.trading.symbol,
            current_price,
            tier.max_leverage,
            self.strategy.profile().name
        );

        let order = self
            .client
            .place_market_order(&self.config.trading.symbol, side, &quantity_str, false)
            .await?;

        let fill_price = Decimal::from_str(&order.avg_price).unwrap_or(Decimal::ZERO);
        let entry_price = if fill_price > Decimal::ZERO {
            fill_price
        } else {
            current_price
        };

        info!(
            "{} order placed. Order ID: {}, fill price: {}",
            side, order.order_id, entry_price
        );

        let (target_price, stop_price) = self.strategy.calculate_targets(entry_price, side);
        self.place_protective_orders(side, stop_price, target_price)
            .await?;

        let executed_qty = Decimal::from_str(&order.executed_qty).unwrap_or(quantity);
        let quantity = if executed_qty > Decimal::ZERO {
            executed_qty
        } else {
            quantity
        };

        let position = Position {
            side: side.to_string(),
            quantity,
            entry_price,
            target_price,
            stop_price,
            leverage: tier.max_leverage,
            margin: entry_price * quantity / Decimal::from(tier.max_leverage),
            timestamp: SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs(),
        };

        self.strategy.add_position(position);

        info!(
            "Position added - Entry: {entry_price:.4} Target: {target_price:.4}, Stop: {stop_price:.4}",
        );

        Ok(())
    }

    /// One STOP_MARKET and one TAKE_PROFIT_MARKET, both close-position, on
    /// the opposite side of the entry.
    async fn place_protective_orders(
        &self,
        entry_side: &str,
        stop_price: Decimal,
        target_price: Decimal,
    ) -> Result<()> {
        let exit_side = match entry_side {
            "BUY" => "SELL",
            "SELL" => "BUY",
            _ => return Err(anyhow::anyhow!("Unknown entry side")),
        };

        let stop = self
            .client
            .place_close_trigger(
                &self.config.trading.symbol,
                exit_side,
                "STOP_MARKET",
                &format!("{stop_price:.2}"),
            )
            .await?;
        info!("Stop loss armed at {:.2} (order {})", stop_price, stop.order_id);

        let target = self
            .client
            .place_close_trigger(
                &self.config.trading.symbol,
                exit_side,
                "TAKE_PROFIT_MARKET",
                &format!("{target_price:.2}"),
            )
            .await?;
        info!(
            "Take profit armed at {:.2} (order {})",
            target_price, target.order_id
        );

        Ok(())
    }

    async fn close_position(&self, position: &Position, current_price: Decimal) -> Result<()> {
        let close_side = match position.side.as_str() {
            "BUY" => "SELL",
            "SELL" => "BUY",
            _ => return Err(anyhow::anyhow!("Unknown position side")),
        };

        let quantity_str = position.quantity.normalize().to_string();
        info!(
            "Closing {} position: {} {} at ~{:.4}",
            position.side, quantity_str, self.config.trading.symbol, current_price
        );

        let order = self
            .client
            .place_market_order(&self.config.trading.symbol, close_side, &quantity_str, true)
            .await?;

        info!(
            "Position closed. Order ID: {}, status: {}",
            order.order_id, order.status
        );

        // The surviving protective trigger would flatten a future position
        if let Err(e) = self
            .client
            .cancel_all_orders(&self.config.trading.symbol)
            .await
        {
            warn!("Could not cancel protective orders: {e}");
        }

        let pnl = FuturesStrategy::position_pnl(position, current_price);
        info!("P&L for this trade: {pnl:.4} USDT");

        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    info!("Initializing Binance Futures Bot");

    let config = Config::load()?;

    let mut bot = TradingBot::new(config)?;
    bot.start().await?;

    info!("Trading service stopped.");

    Ok(())
}
