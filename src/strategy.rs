use crate::binance::{BookTicker, FuturesClient, Kline, Ticker24hr};
use crate::config::{Config, TradingConfig};
use crate::indicators::*;
use crate::regime::{
    detect_regime, fallback_profile, profile_for, MarketRegime, RegimeThresholds, StrategyProfile,
};
use crate::stops::StopSizer;
use crate::volatility::VolatilityAnalyzer;
use anyhow::Result;
use log::info;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const CANDLE_WINDOW: usize = 200;

fn current_time_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone)]
pub struct Position {
    pub side: String, // "BUY" = long, "SELL" = short
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub target_price: Decimal,
    pub stop_price: Decimal,
    pub leverage: u32,
    pub margin: Decimal, // Notional / leverage, reserved at entry
    pub timestamp: u64,
}

#[derive(Debug, Clone)]
pub struct MarketData {
    pub highs: VecDeque<Decimal>,
    pub lows: VecDeque<Decimal>,
    pub closes: VecDeque<Decimal>,
    pub volumes: VecDeque<Decimal>,
    pub timestamps: VecDeque<u64>,
    pub book: Option<BookTicker>,
    pub ticker_24hr: Option<Ticker24hr>,
}

impl MarketData {
    pub fn new(max_size: usize) -> Self {
        Self {
            highs: VecDeque::with_capacity(max_size),
            lows: VecDeque::with_capacity(max_size),
            closes: VecDeque::with_capacity(max_size),
            volumes: VecDeque::with_capacity(max_size),
            timestamps: VecDeque::with_capacity(max_size),
            book: None,
            ticker_24hr: None,
        }
    }

    pub fn add_candle(
        &mut self,
        high: Decimal,
        low: Decimal,
        close: Decimal,
        volume: Decimal,
        timestamp: u64,
        max_size: usize,
    ) {
        self.highs.push_back(high);
        self.lows.push_back(low);
        self.closes.push_back(close);
        self.volumes.push_back(volume);
        self.timestamps.push_back(timestamp);

        while self.closes.len() > max_size {
            self.highs.pop_front();
            self.lows.pop_front();
            self.closes.pop_front();
            self.volumes.pop_front();
            self.timestamps.pop_front();
        }
    }

    pub fn update_book(&mut self, book: BookTicker) {
        self.book = Some(book);
    }

    pub fn update_ticker(&mut self, ticker: Ticker24hr) {
        self.ticker_24hr = Some(ticker);
    }

    pub fn get_latest_price(&self) -> Option<Decimal> {
        self.closes.back().copied()
    }

    pub fn get_spread(&self) -> Option<Decimal> {
        let book = self.book.as_ref()?;
        let bid = Decimal::from_str(&book.bid_price).ok()?;
        let ask = Decimal::from_str(&book.ask_price).ok()?;
        Some(calculate_spread_percentage(bid, ask))
    }
}

/// Regime-aware signal engine. One instance per symbol; the live service and
/// the backtester feed it the same way.
#[derive(Debug)]
pub struct FuturesStrategy {
    config: TradingConfig,
    pub market_data: MarketData,

    // Base timeframe indicators
    ema_crossover: EMACrossover,
    rsi: RSI,
    macd: MACD,
    bollinger_bands: BollingerBands,
    atr: ATR,
    adx: ADX,

    // Higher timeframe trend filter
    pub higher_tf_market_data: MarketData,
    higher_tf_ema_crossover: EMACrossover,

    // Volatility blend across 5m/1h/4h
    volatility: VolatilityAnalyzer,
    volatility_last: HashMap<String, u64>,

    sizer: StopSizer,
    pair_buffer: Decimal,
    thresholds: RegimeThresholds,
    regime: Option<MarketRegime>,
    profile: StrategyProfile,

    positions: Vec<Position>,
    max_positions: u32,

    // Performance tracking
    total_trades: u32,
    winning_trades: u32,
    total_pnl: Decimal,
    consecutive_losses: u32,

    // Cooldown between entries, enforced by the caller via these fields
    pub last_signal_time: Option<u64>,
    pub cooldown_duration: Duration,
}

impl FuturesStrategy {
    pub fn new(config: &Config) -> Self {
        let trading = config.trading.clone();

        Self {
            market_data: MarketData::new(CANDLE_WINDOW),

            ema_crossover: EMACrossover::new(8, 21),
            rsi: RSI::new(14),
            macd: MACD::new(12, 26, 9),
            bollinger_bands: BollingerBands::new(20, Decimal::from(2)),
            atr: ATR::new(14),
            adx: ADX::new(14),

            higher_tf_market_data: MarketData::new(CANDLE_WINDOW),
            higher_tf_ema_crossover: EMACrossover::new(50, 200),

            volatility: VolatilityAnalyzer::standard(),
            volatility_last: HashMap::new(),

            sizer: StopSizer::new(&config.risk),
            pair_buffer: config.pair_buffer(&trading.symbol),
            thresholds: RegimeThresholds::default(),
            regime: None,
            profile: fallback_profile(),

            positions: Vec::new(),
            max_positions: 1,

            total_trades: 0,
            winning_trades: 0,
            total_pnl: Decimal::ZERO,
            consecutive_losses: 0,

            last_signal_time: None,
            cooldown_duration: Duration::from_secs(trading.cooldown_period),
            config: trading,
        }
    }

    /// Feed one closed base-timeframe candle through every indicator.
    /// Duplicate or out-of-order candles are dropped.
    pub fn apply_closed_candle(&mut self, kline: &Kline) -> Result<()> {
        if let Some(&last) = self.market_data.timestamps.back() {
            if kline.close_time <= last {
                return Ok(());
            }
        }

        let high = Decimal::from_str(&kline.high)?;
        let low = Decimal::from_str(&kline.low)?;
        let close = Decimal::from_str(&kline.close)?;
        let volume = Decimal::from_str(&kline.volume)?;

        self.market_data
            .add_candle(high, low, close, volume, kline.close_time, CANDLE_WINDOW);

        self.ema_crossover.update(close);
        self.rsi.update(close);
        self.macd.update(close);
        self.bollinger_bands.update(close);
        self.atr.update(high, low, close);
        self.adx.update(high, low, close);

        Ok(())
    }

    /// Feed one closed higher-timeframe candle into the trend filter.
    pub fn apply_higher_tf_candle(&mut self, kline: &Kline) -> Result<()> {
        if let Some(&last) = self.higher_tf_market_data.timestamps.back() {
            if kline.close_time <= last {
                return Ok(());
            }
        }

        let high = Decimal::from_str(&kline.high)?;
        let low = Decimal::from_str(&kline.low)?;
        let close = Decimal::from_str(&kline.close)?;
        let volume = Decimal::from_str(&kline.volume)?;

        self.higher_tf_market_data
            .add_candle(high, low, close, volume, kline.close_time, CANDLE_WINDOW);
        self.higher_tf_ema_crossover.update(close);

        Ok(())
    }

    /// Feed one closed candle into the volatility blend, deduplicated per
    /// timeframe.
    pub fn apply_volatility_candle(&mut self, interval: &str, kline: &Kline) -> Result<()> {
        let last = self.volatility_last.get(interval).copied().unwrap_or(0);
        if kline.close_time <= last {
            return Ok(());
        }
        self.volatility_last
            .insert(interval.to_string(), kline.close_time);

        let high = Decimal::from_str(&kline.high)?;
        let low = Decimal::from_str(&kline.low)?;
        let close = Decimal::from_str(&kline.close)?;
        self.volatility.update(interval, high, low, close);

        Ok(())
    }

    pub async fn update_market_data(&mut self, client: &FuturesClient) -> Result<()> {
        let limit = if self.market_data.closes.is_empty() {
            info!("Fetching initial market data...");
            CANDLE_WINDOW as u16
        } else {
            3
        };

        let klines = client
            .get_klines(&self.config.symbol, &self.config.timeframe, limit)
            .await?;
        let now_ms = current_time_millis();
        for kline in &klines {
            if kline.close_time > now_ms {
                continue; // Candle still forming
            }
            self.apply_closed_candle(kline)?;
        }

        let book = client.get_book_ticker(&self.config.symbol).await?;
        self.market_data.update_book(book);

        let ticker = client.get_24hr_ticker(&self.config.symbol).await?;
        self.market_data.update_ticker(ticker);

        Ok(())
    }

    pub async fn update_higher_tf_market_data(&mut self, client: &FuturesClient) -> Result<()> {
        let limit = if self.higher_tf_market_data.closes.is_empty() {
            info!("Fetching initial higher timeframe market data...");
            CANDLE_WINDOW as u16
        } else {
            3
        };

        let klines = client
            .get_klines(&self.config.symbol, &self.config.higher_timeframe, limit)
            .await?;
        let now_ms = current_time_millis();
        for kline in &klines {
            if kline.close_time > now_ms {
                continue;
            }
            self.apply_higher_tf_candle(kline)?;
        }

        Ok(())
    }

    pub async fn update_volatility(&mut self, client: &FuturesClient) -> Result<()> {
        let now_ms = current_time_millis();

        for interval in self.volatility.intervals() {
            let limit = if self.volatility_last.contains_key(&interval) {
                3
            } else {
                50 // Enough history to warm the ATR window
            };

            let klines = client
                .get_klines(&self.config.symbol, &interval, limit)
                .await?;
            for kline in &klines {
                if kline.close_time > now_ms {
                    continue;
                }
                self.apply_volatility_candle(&interval, kline)?;
            }
        }

        Ok(())
    }

    /// Re-classify the market and swap the strategy profile when the regime
    /// changes. Falls back to the conservative warmup profile on cold data.
    pub fn refresh_profile(&mut self) {
        let detected = detect_regime(
            self.adx.current(),
            self.volatility.weighted_atr_percent(),
            self.bollinger_bands.width(),
            &self.thresholds,
        );

        match detected {
            Some(regime) => {
                if self.regime != Some(regime) {
                    let profile = profile_for(regime);
                    info!(
                        "Market regime is now {} -> {} profile",
                        regime.as_str(),
                        profile.name
                    );
                    self.regime = Some(regime);
                    self.profile = profile;
                }
            }
            None => {
                self.regime = None;
                self.profile = fallback_profile();
            }
        }
    }

    pub fn regime(&self) -> Option<MarketRegime> {
        self.regime
    }

    pub fn profile(&self) -> &StrategyProfile {
        &self.profile
    }

    pub fn set_max_positions(&mut self, max_positions: u32) {
        self.max_positions = max_positions;
    }

    pub fn weighted_volatility(&self) -> Option<Decimal> {
        self.volatility.weighted_atr_percent()
    }

    /// Weighted indicator vote under the active profile. Entry needs the
    /// winning side to clear the profile threshold and to agree with the
    /// higher-timeframe trend.
    pub fn analyze_market(&mut self) -> Result<Signal> {
        let current_price = self
            .market_data
            .get_latest_price()
            .ok_or_else(|| anyhow::anyhow!("No price data available"))?;

        self.refresh_profile();

        if !self.should_trade()? || self.positions.len() >= self.max_positions as usize {
            return Ok(Signal::Hold);
        }

        let mut buy_score = Decimal::ZERO;
        let mut sell_score = Decimal::ZERO;
        let mut tally = |signal: Signal, weight: Decimal| match signal {
            Signal::Buy => buy_score += weight,
            Signal::Sell => sell_score += weight,
            Signal::Hold => {}
        };

        // Trend family
        tally(self.ema_crossover.signal(), self.profile.trend_weight);
        tally(self.macd.signal(), self.profile.trend_weight);

        // Mean-reversion family
        tally(self.rsi.signal(), self.profile.reversion_weight);
        tally(
            self.bollinger_bands.signal(&current_price),
            self.profile.reversion_weight,
        );

        // Momentum family
        let momentum = self.calculate_momentum();
        let momentum_gate = Decimal::from_str("0.1")?;
        if momentum > momentum_gate {
            buy_score += self.profile.momentum_weight;
        } else if momentum < -momentum_gate {
            sell_score += self.profile.momentum_weight;
        }

        // Volume expansion confirms whichever side currently leads
        if self.check_volume_confirmation() {
            let confirmation = self.profile.momentum_weight / Decimal::from(2);
            if buy_score > sell_score {
                buy_score += confirmation;
            } else if sell_score > buy_score {
                sell_score += confirmation;
            }
        }

        let threshold = self.profile.entry_threshold;
        let signal = if buy_score >= threshold && buy_score > sell_score {
            self.filter_by_trend(Signal::Buy)
        } else if sell_score >= threshold && sell_score > buy_score {
            self.filter_by_trend(Signal::Sell)
        } else {
            Signal::Hold
        };

        Ok(signal)
    }

    fn should_trade(&self) -> Result<bool> {
        if let Some(spread) = self.market_data.get_spread() {
            if spread > self.config.spread_threshold {
                log::warn!("Spread too wide: {spread:.4}%");
                return Ok(false);
            }
        }

        if let Some(ref ticker) = self.market_data.ticker_24hr {
            let volume = Decimal::from_str(&ticker.quote_volume)?;
            if volume < self.config.min_volume {
                log::warn!("24h quote volume too low: {volume}");
                return Ok(false);
            }
        }

        if self.consecutive_losses >= self.config.max_consecutive_losses {
            log::warn!("Too many consecutive losses: {}", self.consecutive_losses);
            return Ok(false);
        }

        Ok(true)
    }

    fn check_volume_confirmation(&self) -> bool {
        if self.market_data.volumes.len() < 2 {
            return false;
        }

        let current_volume = match self.market_data.volumes.back() {
            Some(v) => *v,
            None => return false,
        };
        let avg_volume = self.market_data.volumes.iter().sum::<Decimal>()
            / Decimal::from(self.market_data.volumes.len());

        current_volume > avg_volume * Decimal::from_str("1.2").unwrap_or(Decimal::ONE)
    }

    fn calculate_momentum(&self) -> Decimal {
        let closes: Vec<Decimal> = self.market_data.closes.iter().copied().collect();
        calculate_price_momentum(&closes, 3)
    }

    // Returns Some("up"), Some("down"), or None if no clear trend
    pub fn get_trend(&self) -> Option<&'static str> {
        match self.higher_tf_ema_crossover.signal() {
            Signal::Buy => Some("up"),
            Signal::Sell => Some("down"),
            _ => None,
        }
    }

    /// Longs only with the higher-timeframe trend, shorts only against it.
    pub fn filter_by_trend(&self, signal: Signal) -> Signal {
        match (self.get_trend(), signal) {
            (Some("up"), Signal::Buy) => Signal::Buy,
            (Some("down"), Signal::Sell) => Signal::Sell,
            _ => {
                info!("Signal rejected by higher timeframe trend filter");
                Signal::Hold
            }
        }
    }

    /// (target, stop) prices from the volatility-adaptive sizer. Falls back
    /// to the base-timeframe ATR while the blend is warming; with no
    /// volatility at all the clamp floor applies.
    pub fn calculate_targets(&self, entry_price: Decimal, side: &str) -> (Decimal, Decimal) {
        let volatility = self
            .volatility
            .weighted_atr_percent()
            .or_else(|| self.atr.percent())
            .unwrap_or(Decimal::ZERO);

        let stop_pct =
            self.sizer
                .stop_loss_percent(volatility, self.profile.stop_buffer, self.pair_buffer);
        let target_pct = self
            .sizer
            .take_profit_percent(stop_pct, self.profile.reward_ratio);

        self.sizer
            .protective_prices(side, entry_price, stop_pct, target_pct)
    }

    pub fn add_position(&mut self, position: Position) {
        self.positions.push(position);
        self.total_trades += 1;
    }

    /// Indexes of positions whose stop or target the current price crossed.
    /// PnL and streak tracking update here; the caller removes the positions
    /// once the exchange confirms the close.
    pub fn check_exit_conditions(&mut self, current_price: Decimal) -> Vec<usize> {
        let mut positions_to_close = Vec::new();

        for (i, position) in self.positions.iter().enumerate() {
            let should_exit = match position.side.as_str() {
                "BUY" => {
                    current_price >= position.target_price || current_price <= position.stop_price
                }
                "SELL" => {
                    current_price <= position.target_price || current_price >= position.stop_price
                }
                _ => false,
            };

            if should_exit {
                positions_to_close.push(i);

                let pnl = Self::position_pnl(position, current_price);
                self.total_pnl += pnl;

                if pnl > Decimal::ZERO {
                    self.winning_trades += 1;
                    self.consecutive_losses = 0;
                } else {
                    self.consecutive_losses += 1;
                }
            }
        }

        positions_to_close
    }

    /// PnL on the full notional; leverage only changed the margin outlay.
    pub fn position_pnl(position: &Position, exit_price: Decimal) -> Decimal {
        match position.side.as_str() {
            "BUY" => (exit_price - position.entry_price) * position.quantity,
            "SELL" => (position.entry_price - exit_price) * position.quantity,
            _ => Decimal::ZERO,
        }
    }

    pub fn remove_positions(&mut self, indices: Vec<usize>) {
        let mut sorted_indices = indices;
        sorted_indices.sort_by(|a, b| b.cmp(a));

        for index in sorted_indices {
            if index < self.positions.len() {
                self.positions.remove(index);
            }
        }
    }

    pub fn get_positions(&self) -> &Vec<Position> {
        &self.positions
    }

    pub fn get_performance_stats(&self) -> (u32, u32, Decimal, f64) {
        let win_rate = if self.total_trades > 0 {
            (self.winning_trades as f64 / self.total_trades as f64) * 100.0
        } else {
            0.0
        };

        (
            self.total_trades,
            self.winning_trades,
            self.total_pnl,
            win_rate,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn test_strategy() -> FuturesStrategy {
        FuturesStrategy::new(&Config::default())
    }

    fn make_kline(close_time: u64, high: &str, low: &str, close: &str, volume: &str) -> Kline {
        Kline {
            open_time: close_time.saturating_sub(299_999),
            open: close.to_string(),
            high: high.to_string(),
            low: low.to_string(),
            close: close.to_string(),
            volume: volume.to_string(),
            close_time,
            quote_asset_volume: "1000000".to_string(),
            number_of_trades: 100,
        }
    }

    fn long_position(entry: &str, stop: &str, target: &str) -> Position {
        Position {
            side: "BUY".to_string(),
            quantity: dec("0.1"),
            entry_price: dec(entry),
            target_price: dec(target),
            stop_price: dec(stop),
            leverage: 10,
            margin: dec(entry) * dec("0.1") / Decimal::from(10),
            timestamp: 0,
        }
    }

    #[test]
    fn test_apply_closed_candle_deduplicates_by_close_time() {
        let mut strategy = test_strategy();
        let kline = make_kline(1_000, "101", "99", "100", "50");

        strategy.apply_closed_candle(&kline).unwrap();
        strategy.apply_closed_candle(&kline).unwrap();
        assert_eq!(strategy.market_data.closes.len(), 1);

        let newer = make_kline(2_000, "102", "100", "101", "60");
        strategy.apply_closed_candle(&newer).unwrap();
        assert_eq!(strategy.market_data.closes.len(), 2);

        // Stale candle is ignored
        let stale = make_kline(1_500, "102", "100", "101", "60");
        strategy.apply_closed_candle(&stale).unwrap();
        assert_eq!(strategy.market_data.closes.len(), 2);
    }

    #[test]
    fn test_exit_detection_for_longs_and_shorts() {
        let mut strategy = test_strategy();
        strategy.add_position(long_position("100", "99", "102"));

        // Price inside the bracket: no exit
        assert!(strategy.check_exit_conditions(dec("100.5")).is_empty());
        // Target touched
        assert_eq!(strategy.check_exit_conditions(dec("102")), vec![0]);
        strategy.remove_positions(vec![0]);

        let mut short = long_position("100", "101.5", "97");
        short.side = "SELL".to_string();
        strategy.add_position(short);

        assert!(strategy.check_exit_conditions(dec("100.5")).is_empty());
        // Stop crossed for a short (price moved up)
        assert_eq!(strategy.check_exit_conditions(dec("101.6")), vec![0]);
    }

    #[test]
    fn test_exit_tracking_updates_pnl_and_streaks() {
        let mut strategy = test_strategy();

        strategy.add_position(long_position("100", "99", "102"));
        strategy.check_exit_conditions(dec("102"));
        strategy.remove_positions(vec![0]);

        strategy.add_position(long_position("100", "99", "102"));
        strategy.check_exit_conditions(dec("99"));
        strategy.remove_positions(vec![0]);

        let (total, wins, pnl, win_rate) = strategy.get_performance_stats();
        assert_eq!(total, 2);
        assert_eq!(wins, 1);
        // +0.2 on the win, -0.1 on the loss
        assert_eq!(pnl, dec("0.1"));
        assert!((win_rate - 50.0).abs() < f64::EPSILON);
        assert_eq!(strategy.consecutive_losses, 1);
    }

    #[test]
    fn test_trend_filter_blocks_countertrend_entries() {
        let mut strategy = test_strategy();

        // Establish an uptrend on the higher timeframe
        for i in 0..210 {
            let close = format!("{}", 100 + i);
            let kline = make_kline((i as u64 + 1) * 3_600_000, &close, &close, &close, "50");
            strategy.apply_higher_tf_candle(&kline).unwrap();
        }
        assert_eq!(strategy.get_trend(), Some("up"));

        assert_eq!(strategy.filter_by_trend(Signal::Buy), Signal::Buy);
        assert_eq!(strategy.filter_by_trend(Signal::Sell), Signal::Hold);
    }

    #[test]
    fn test_consecutive_loss_breaker_holds_the_strategy() {
        let mut strategy = test_strategy();
        strategy.set_max_positions(5);

        // Seed one candle so analyze_market has a price
        strategy
            .apply_closed_candle(&make_kline(1_000, "101", "99", "100", "50"))
            .unwrap();

        // Burn through the loss budget
        for _ in 0..4 {
            strategy.add_position(long_position("100", "99", "102"));
            strategy.check_exit_conditions(dec("99"));
            strategy.remove_positions(vec![0]);
        }

        assert_eq!(strategy.analyze_market().unwrap(), Signal::Hold);
    }

    #[test]
    fn test_max_positions_gate() {
        let mut strategy = test_strategy();
        strategy.set_max_positions(1);
        strategy
            .apply_closed_candle(&make_kline(1_000, "101", "99", "100", "50"))
            .unwrap();

        strategy.add_position(long_position("100", "99", "102"));
        assert_eq!(strategy.analyze_market().unwrap(), Signal::Hold);
    }

    #[test]
    fn test_calculate_targets_uses_clamp_floor_when_cold() {
        let strategy = test_strategy();

        // No volatility data at all: stop collapses to the configured floor
        // (0.5%) and the warmup profile reward ratio sets the target.
        let (target, stop) = strategy.calculate_targets(dec("100"), "BUY");
        assert_eq!(stop, dec("99.5"));
        assert_eq!(target, dec("100.8"));
    }
}
