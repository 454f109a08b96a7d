use rust_decimal::Decimal;
use std::collections::VecDeque;

// Helper function to calculate the square root of Decimal
fn decimal_sqrt(value: Decimal) -> Decimal {
    if value <= Decimal::ZERO {
        return Decimal::ZERO;
    }

    // Newton's method, stop once successive estimates converge
    let mut x = value / Decimal::from(2);
    let mut prev_x = value;

    for _ in 0..20 {
        if (x - prev_x).abs() < Decimal::new(1, 8) {
            break;
        }
        prev_x = x;
        x = (x + value / x) / Decimal::from(2);
    }

    x
}

#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    Buy,
    Sell,
    Hold,
}

#[derive(Debug, Clone)]
pub struct MovingAverage {
    period: usize,
    values: VecDeque<Decimal>,
    sum: Decimal,
}

impl MovingAverage {
    pub fn new(period: usize) -> Self {
        Self {
            period,
            values: VecDeque::new(),
            sum: Decimal::ZERO,
        }
    }

    pub fn update(&mut self, value: Decimal) -> Option<Decimal> {
        self.values.push_back(value);
        self.sum += value;

        if self.values.len() > self.period {
            if let Some(old_value) = self.values.pop_front() {
                self.sum -= old_value;
            }
        }

        self.current()
    }

    pub fn current(&self) -> Option<Decimal> {
        if self.values.len() == self.period {
            Some(self.sum / Decimal::from(self.period))
        } else {
            None
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExponentialMovingAverage {
    multiplier: Decimal,
    current_value: Option<Decimal>,
}

impl ExponentialMovingAverage {
    pub fn new(period: usize) -> Self {
        let multiplier = Decimal::from(2) / (Decimal::from(period) + Decimal::ONE);
        Self {
            multiplier,
            current_value: None,
        }
    }

    pub fn update(&mut self, value: Decimal) -> Option<Decimal> {
        let next = match self.current_value {
            Some(current) => (value * self.multiplier) + (current * (Decimal::ONE - self.multiplier)),
            None => value,
        };
        self.current_value = Some(next);
        self.current_value
    }

    pub fn current(&self) -> Option<Decimal> {
        self.current_value
    }
}

#[derive(Debug, Clone)]
pub struct EMACrossover {
    fast_ema: ExponentialMovingAverage,
    slow_ema: ExponentialMovingAverage,
    crossover_signal: Option<Signal>,
}

impl EMACrossover {
    pub fn new(fast_period: usize, slow_period: usize) -> Self {
        Self {
            fast_ema: ExponentialMovingAverage::new(fast_period),
            slow_ema: ExponentialMovingAverage::new(slow_period),
            crossover_signal: None,
        }
    }

    /// Returns a signal only on the bar where the crossover happens.
    pub fn update(&mut self, close: Decimal) -> Option<Signal> {
        let fast = self.fast_ema.update(close)?;
        let slow = self.slow_ema.update(close)?;

        if fast > slow && self.crossover_signal != Some(Signal::Buy) {
            self.crossover_signal = Some(Signal::Buy);
            return Some(Signal::Buy);
        } else if fast < slow && self.crossover_signal != Some(Signal::Sell) {
            self.crossover_signal = Some(Signal::Sell);
            return Some(Signal::Sell);
        }

        None
    }

    pub fn signal(&self) -> Signal {
        self.crossover_signal.clone().unwrap_or(Signal::Hold)
    }
}

/// RSI with Wilder smoothing. The first average is a plain mean over the
/// warmup window, every later bar blends in at weight 1/period.
#[derive(Debug, Clone)]
pub struct RSI {
    period: usize,
    avg_gain: Decimal,
    avg_loss: Decimal,
    samples: usize,
    previous_close: Option<Decimal>,
}

impl RSI {
    pub fn new(period: usize) -> Self {
        Self {
            period,
            avg_gain: Decimal::ZERO,
            avg_loss: Decimal::ZERO,
            samples: 0,
            previous_close: None,
        }
    }

    pub fn update(&mut self, close: Decimal) -> Option<Decimal> {
        let prev_close = match self.previous_close.replace(close) {
            Some(prev) => prev,
            None => return None,
        };

        let change = close - prev_close;
        let gain = change.max(Decimal::ZERO);
        let loss = (-change).max(Decimal::ZERO);
        let period = Decimal::from(self.period);

        self.samples += 1;
        if self.samples < self.period {
            self.avg_gain += gain;
            self.avg_loss += loss;
            return None;
        } else if self.samples == self.period {
            self.avg_gain = (self.avg_gain + gain) / period;
            self.avg_loss = (self.avg_loss + loss) / period;
        } else {
            self.avg_gain = (self.avg_gain * (period - Decimal::ONE) + gain) / period;
            self.avg_loss = (self.avg_loss * (period - Decimal::ONE) + loss) / period;
        }

        self.current()
    }

    pub fn current(&self) -> Option<Decimal> {
        if self.samples < self.period {
            return None;
        }

        if self.avg_loss == Decimal::ZERO {
            return Some(Decimal::from(100));
        }

        let rs = self.avg_gain / self.avg_loss;
        Some(Decimal::from(100) - (Decimal::from(100) / (Decimal::ONE + rs)))
    }

    pub fn signal(&self) -> Signal {
        match self.current() {
            Some(rsi) if rsi > Decimal::from(70) => Signal::Sell,
            Some(rsi) if rsi < Decimal::from(30) => Signal::Buy,
            _ => Signal::Hold,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MACD {
    fast_ema: ExponentialMovingAverage,
    slow_ema: ExponentialMovingAverage,
    signal_ema: ExponentialMovingAverage,
    macd_line: Option<Decimal>,
}

impl MACD {
    pub fn new(fast_period: usize, slow_period: usize, signal_period: usize) -> Self {
        Self {
            fast_ema: ExponentialMovingAverage::new(fast_period),
            slow_ema: ExponentialMovingAverage::new(slow_period),
            signal_ema: ExponentialMovingAverage::new(signal_period),
            macd_line: None,
        }
    }

    pub fn update(&mut self, close: Decimal) -> Option<(Decimal, Decimal, Decimal)> {
        let fast = self.fast_ema.update(close)?;
        let slow = self.slow_ema.update(close)?;

        let macd = fast - slow;
        self.macd_line = Some(macd);
        let signal = self.signal_ema.update(macd)?;

        Some((macd, signal, macd - signal))
    }

    pub fn current(&self) -> Option<(Decimal, Decimal, Decimal)> {
        let macd = self.macd_line?;
        let signal = self.signal_ema.current()?;
        Some((macd, signal, macd - signal))
    }

    pub fn signal(&self) -> Signal {
        match self.current() {
            Some((macd, signal, histogram)) if macd > signal && histogram > Decimal::ZERO => {
                Signal::Buy
            }
            Some((macd, signal, histogram)) if macd < signal && histogram < Decimal::ZERO => {
                Signal::Sell
            }
            _ => Signal::Hold,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BollingerBands {
    sma: MovingAverage,
    values: VecDeque<Decimal>,
    period: usize,
    std_dev_multiplier: Decimal,
}

impl BollingerBands {
    pub fn new(period: usize, std_dev_multiplier: Decimal) -> Self {
        Self {
            sma: MovingAverage::new(period),
            values: VecDeque::new(),
            period,
            std_dev_multiplier,
        }
    }

    pub fn update(&mut self, close: Decimal) -> Option<(Decimal, Decimal, Decimal)> {
        self.values.push_back(close);
        if self.values.len() > self.period {
            self.values.pop_front();
        }

        self.sma.update(close)?;
        self.current()
    }

    pub fn current(&self) -> Option<(Decimal, Decimal, Decimal)> {
        if self.values.len() < self.period {
            return None;
        }

        let middle = self.sma.current()?;
        let variance = self
            .values
            .iter()
            .map(|v| (*v - middle) * (*v - middle))
            .sum::<Decimal>()
            / Decimal::from(self.period);

        let std_dev = decimal_sqrt(variance);
        let upper = middle + (std_dev * self.std_dev_multiplier);
        let lower = middle - (std_dev * self.std_dev_multiplier);

        Some((upper, middle, lower))
    }

    /// Relative band width, (upper - lower) / middle. Regime input.
    pub fn width(&self) -> Option<Decimal> {
        let (upper, middle, lower) = self.current()?;
        if middle > Decimal::ZERO {
            Some((upper - lower) / middle)
        } else {
            None
        }
    }

    pub fn signal(&self, close: &Decimal) -> Signal {
        match self.current() {
            Some((upper, _, _)) if close > &upper => Signal::Sell,
            Some((_, _, lower)) if close < &lower => Signal::Buy,
            _ => Signal::Hold,
        }
    }
}

/// ATR with Wilder smoothing over true ranges.
#[derive(Debug, Clone)]
pub struct ATR {
    period: usize,
    samples: usize,
    atr_value: Decimal,
    previous_close: Option<Decimal>,
}

impl ATR {
    pub fn new(period: usize) -> Self {
        Self {
            period,
            samples: 0,
            atr_value: Decimal::ZERO,
            previous_close: None,
        }
    }

    pub fn update(&mut self, high: Decimal, low: Decimal, close: Decimal) -> Option<Decimal> {
        let tr = match self.previous_close.replace(close) {
            Some(prev_close) => (high - low)
                .max((high - prev_close).abs())
                .max((low - prev_close).abs()),
            None => high - low,
        };

        let period = Decimal::from(self.period);
        self.samples += 1;
        if self.samples < self.period {
            self.atr_value += tr;
            return None;
        } else if self.samples == self.period {
            self.atr_value = (self.atr_value + tr) / period;
        } else {
            self.atr_value = (self.atr_value * (period - Decimal::ONE) + tr) / period;
        }

        Some(self.atr_value)
    }

    pub fn current(&self) -> Option<Decimal> {
        if self.samples >= self.period {
            Some(self.atr_value)
        } else {
            None
        }
    }

    /// ATR as a percentage of the most recent close.
    pub fn percent(&self) -> Option<Decimal> {
        let atr = self.current()?;
        match self.previous_close {
            Some(close) if close > Decimal::ZERO => Some(atr / close * Decimal::from(100)),
            _ => None,
        }
    }
}

/// ADX with Wilder-smoothed directional movement. Used as the trend-strength
/// input to regime detection rather than as a standalone entry signal.
#[derive(Debug, Clone)]
pub struct ADX {
    period: usize,
    smoothed_tr: Decimal,
    smoothed_plus_dm: Decimal,
    smoothed_minus_dm: Decimal,
    adx_value: Decimal,
    dm_samples: usize,
    dx_samples: usize,
    previous_bar: Option<(Decimal, Decimal, Decimal)>, // (high, low, close)
}

impl ADX {
    pub fn new(period: usize) -> Self {
        Self {
            period,
            smoothed_tr: Decimal::ZERO,
            smoothed_plus_dm: Decimal::ZERO,
            smoothed_minus_dm: Decimal::ZERO,
            adx_value: Decimal::ZERO,
            dm_samples: 0,
            dx_samples: 0,
            previous_bar: None,
        }
    }

    pub fn update(&mut self, high: Decimal, low: Decimal, close: Decimal) -> Option<Decimal> {
        let (prev_high, prev_low, prev_close) =
            match self.previous_bar.replace((high, low, close)) {
                Some(prev) => prev,
                None => return None,
            };

        let up_move = high - prev_high;
        let down_move = prev_low - low;
        let plus_dm = if up_move > down_move && up_move > Decimal::ZERO {
            up_move
        } else {
            Decimal::ZERO
        };
        let minus_dm = if down_move > up_move && down_move > Decimal::ZERO {
            down_move
        } else {
            Decimal::ZERO
        };
        let tr = (high - low)
            .max((high - prev_close).abs())
            .max((low - prev_close).abs());

        // Wilder accumulation: sum the first `period` bars, then decay
        self.dm_samples += 1;
        if self.dm_samples <= self.period {
            self.smoothed_tr += tr;
            self.smoothed_plus_dm += plus_dm;
            self.smoothed_minus_dm += minus_dm;
            if self.dm_samples < self.period {
                return None;
            }
        } else {
            let period = Decimal::from(self.period);
            self.smoothed_tr = self.smoothed_tr - (self.smoothed_tr / period) + tr;
            self.smoothed_plus_dm = self.smoothed_plus_dm - (self.smoothed_plus_dm / period) + plus_dm;
            self.smoothed_minus_dm =
                self.smoothed_minus_dm - (self.smoothed_minus_dm / period) + minus_dm;
        }

        if self.smoothed_tr == Decimal::ZERO {
            return None;
        }

        let hundred = Decimal::from(100);
        let plus_di = hundred * self.smoothed_plus_dm / self.smoothed_tr;
        let minus_di = hundred * self.smoothed_minus_dm / self.smoothed_tr;
        let di_sum = plus_di + minus_di;
        if di_sum == Decimal::ZERO {
            return None;
        }
        let dx = hundred * (plus_di - minus_di).abs() / di_sum;

        let period = Decimal::from(self.period);
        self.dx_samples += 1;
        if self.dx_samples < self.period {
            self.adx_value += dx;
            return None;
        } else if self.dx_samples == self.period {
            self.adx_value = (self.adx_value + dx) / period;
        } else {
            self.adx_value = (self.adx_value * (period - Decimal::ONE) + dx) / period;
        }

        Some(self.adx_value)
    }

    pub fn current(&self) -> Option<Decimal> {
        if self.dx_samples >= self.period {
            Some(self.adx_value)
        } else {
            None
        }
    }

    pub fn directional_indexes(&self) -> Option<(Decimal, Decimal)> {
        if self.dm_samples < self.period || self.smoothed_tr == Decimal::ZERO {
            return None;
        }
        let hundred = Decimal::from(100);
        Some((
            hundred * self.smoothed_plus_dm / self.smoothed_tr,
            hundred * self.smoothed_minus_dm / self.smoothed_tr,
        ))
    }
}

pub fn calculate_spread_percentage(bid: Decimal, ask: Decimal) -> Decimal {
    if bid > Decimal::ZERO {
        ((ask - bid) / bid) * Decimal::from(100)
    } else {
        Decimal::ZERO
    }
}

pub fn calculate_price_momentum(prices: &[Decimal], lookback: usize) -> Decimal {
    if prices.len() < lookback + 1 {
        return Decimal::ZERO;
    }

    let current = prices[prices.len() - 1];
    let previous = prices[prices.len() - 1 - lookback];

    if previous > Decimal::ZERO {
        ((current - previous) / previous) * Decimal::from(100)
    } else {
        Decimal::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn test_moving_average_warms_up_then_slides() {
        let mut ma = MovingAverage::new(3);
        assert_eq!(ma.update(dec("1")), None);
        assert_eq!(ma.update(dec("2")), None);
        assert_eq!(ma.update(dec("3")), Some(dec("2")));
        assert_eq!(ma.update(dec("6")), Some(Decimal::from(11) / Decimal::from(3)));
    }

    #[test]
    fn test_rsi_saturates_on_monotone_series() {
        let mut rsi = RSI::new(14);
        let mut last = None;
        for i in 0..30 {
            last = rsi.update(Decimal::from(100 + i));
        }
        // No losses at all -> RSI pegs at 100
        assert_eq!(last, Some(Decimal::from(100)));

        let mut rsi = RSI::new(14);
        let mut last = None;
        for i in 0..30 {
            last = rsi.update(Decimal::from(100 - i));
        }
        assert_eq!(last, Some(Decimal::ZERO));
    }

    #[test]
    fn test_rsi_is_neutral_on_alternating_series() {
        let mut rsi = RSI::new(14);
        let mut last = None;
        for i in 0..40 {
            let close = if i % 2 == 0 { dec("100") } else { dec("101") };
            last = rsi.update(close);
        }
        let value = last.unwrap();
        assert!(value > Decimal::from(35) && value < Decimal::from(65));
    }

    #[test]
    fn test_bollinger_width_grows_with_dispersion() {
        let mut calm = BollingerBands::new(10, Decimal::from(2));
        let mut wild = BollingerBands::new(10, Decimal::from(2));

        for i in 0..10 {
            calm.update(dec("100"));
            let swing = if i % 2 == 0 { dec("90") } else { dec("110") };
            wild.update(swing);
        }

        let calm_width = calm.width().unwrap();
        let wild_width = wild.width().unwrap();
        assert_eq!(calm_width, Decimal::ZERO);
        assert!(wild_width > calm_width);
    }

    #[test]
    fn test_atr_warmup_and_percent() {
        let mut atr = ATR::new(3);
        assert_eq!(atr.update(dec("102"), dec("98"), dec("100")), None);
        assert_eq!(atr.update(dec("103"), dec("99"), dec("101")), None);
        let value = atr.update(dec("104"), dec("100"), dec("102")).unwrap();
        assert_eq!(value, Decimal::from(4));
        // 4 / 102 * 100
        let pct = atr.percent().unwrap();
        assert!(pct > dec("3.9") && pct < dec("4.0"));
    }

    #[test]
    fn test_adx_rises_on_strong_trend() {
        let mut adx = ADX::new(14);
        let mut last = None;
        for i in 0..60 {
            let base = Decimal::from(100 + i * 2);
            last = adx.update(base + Decimal::ONE, base - Decimal::ONE, base);
        }
        // A clean one-way march should read as a strong trend
        assert!(last.unwrap() > Decimal::from(25));
    }

    #[test]
    fn test_macd_turns_positive_after_upswing() {
        let mut macd = MACD::new(12, 26, 9);
        for _ in 0..30 {
            macd.update(dec("100"));
        }
        for i in 0..15 {
            macd.update(Decimal::from(100 + i));
        }
        let (line, _, histogram) = macd.current().unwrap();
        assert!(line > Decimal::ZERO);
        assert!(histogram > Decimal::ZERO);
        assert_eq!(macd.signal(), Signal::Buy);
    }

    #[test]
    fn test_ema_crossover_fires_once_per_cross() {
        let mut cross = EMACrossover::new(3, 8);
        let mut signals = Vec::new();
        for i in 0..20 {
            if let Some(signal) = cross.update(Decimal::from(100 + i)) {
                signals.push(signal);
            }
        }
        // Rising series produces exactly one Buy crossover event
        assert_eq!(signals.iter().filter(|s| **s == Signal::Buy).count(), 1);
        assert_eq!(cross.signal(), Signal::Buy);
    }

    #[test]
    fn test_spread_and_momentum_helpers() {
        assert_eq!(
            calculate_spread_percentage(dec("100"), dec("101")),
            Decimal::ONE
        );
        assert_eq!(calculate_spread_percentage(Decimal::ZERO, dec("1")), Decimal::ZERO);

        let prices = vec![dec("100"), dec("101"), dec("102"), dec("110")];
        assert_eq!(calculate_price_momentum(&prices, 3), Decimal::from(10));
        assert_eq!(calculate_price_momentum(&prices, 10), Decimal::ZERO);
    }
}
