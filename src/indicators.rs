use crate::models::Candle;
use std::collections::VecDeque;

/// Minimum number of candles in the window before indicators are computed.
pub const MIN_HISTORY: usize = 20;
/// Rolling window capacity; the oldest candle is evicted beyond this.
pub const WINDOW_CAP: usize = 1000;

pub fn calculate_sma(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    let window = &values[values.len() - period..];
    Some(window.iter().sum::<f64>() / period as f64)
}

/// Recursive EMA seeded with the SMA of the first `period` values. Indices
/// before the seed hold the running mean of the values seen so far, so the
/// returned series always has the same length as the input.
pub fn calculate_ema_series(values: &[f64], period: usize) -> Vec<f64> {
    if values.is_empty() || period == 0 {
        return Vec::new();
    }

    let multiplier = 2.0 / (period as f64 + 1.0);
    let mut ema_values = Vec::with_capacity(values.len());
    let mut running_sum = 0.0;

    for (i, &value) in values.iter().enumerate() {
        if i < period {
            running_sum += value;
            ema_values.push(running_sum / (i + 1) as f64);
        } else {
            let prev = ema_values[i - 1];
            ema_values.push((value - prev) * multiplier + prev);
        }
    }

    ema_values
}

pub fn calculate_ema(values: &[f64], period: usize) -> Option<f64> {
    calculate_ema_series(values, period).last().copied()
}

/// RSI over simple rolling gain/loss averages of the last `period` deltas
/// (deliberately not Wilder-smoothed).
pub fn calculate_rsi(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period + 1 {
        return None;
    }

    let window = &values[values.len() - period - 1..];
    let mut sum_gain = 0.0f64;
    let mut sum_loss = 0.0f64;
    for pair in window.windows(2) {
        let delta = pair[1] - pair[0];
        if delta >= 0.0 {
            sum_gain += delta;
        } else {
            sum_loss += -delta;
        }
    }

    let avg_gain = sum_gain / period as f64;
    let avg_loss = sum_loss / period as f64;
    if avg_loss == 0.0 && avg_gain == 0.0 {
        Some(50.0)
    } else if avg_loss == 0.0 {
        Some(100.0)
    } else if avg_gain == 0.0 {
        Some(0.0)
    } else {
        let rs = avg_gain / avg_loss;
        Some(100.0 - 100.0 / (1.0 + rs))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BollingerBands {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
}

pub fn calculate_bollinger_bands(
    values: &[f64],
    period: usize,
    std_dev: f64,
) -> Option<BollingerBands> {
    if period == 0 || values.len() < period {
        return None;
    }

    let window = &values[values.len() - period..];
    let mean = window.iter().sum::<f64>() / period as f64;
    let variance = window.iter().map(|&v| (v - mean).powi(2)).sum::<f64>() / period as f64;
    let standard_deviation = variance.sqrt();

    Some(BollingerBands {
        upper: mean + std_dev * standard_deviation,
        middle: mean,
        lower: mean - std_dev * standard_deviation,
    })
}

/// MACD line (fast EMA minus slow EMA) with an EMA signal line over the MACD
/// series itself.
pub fn calculate_macd(
    values: &[f64],
    fast_period: usize,
    slow_period: usize,
    signal_period: usize,
) -> Option<(f64, f64)> {
    if values.is_empty() {
        return None;
    }

    let fast = calculate_ema_series(values, fast_period);
    let slow = calculate_ema_series(values, slow_period);
    let macd_line: Vec<f64> = fast
        .iter()
        .zip(slow.iter())
        .map(|(f, s)| f - s)
        .collect();
    let signal = calculate_ema_series(&macd_line, signal_period);

    match (macd_line.last(), signal.last()) {
        (Some(&macd), Some(&sig)) => Some((macd, sig)),
        _ => None,
    }
}

/// Annualized volatility: sample stdev of simple returns over `lookback`
/// observations, scaled by sqrt(252).
pub fn calculate_annualized_volatility(values: &[f64], lookback: usize) -> f64 {
    if lookback < 2 || values.len() < 2 {
        return 0.0;
    }

    let start = values.len().saturating_sub(lookback + 1);
    let window = &values[start..];
    let mut returns: Vec<f64> = Vec::with_capacity(window.len().saturating_sub(1));
    for pair in window.windows(2) {
        if pair[0] > 0.0 {
            returns.push((pair[1] - pair[0]) / pair[0]);
        }
    }

    if returns.len() < 2 {
        return 0.0;
    }

    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let variance = returns
        .iter()
        .map(|value| {
            let diff = value - mean;
            diff * diff
        })
        .sum::<f64>()
        / (returns.len() as f64 - 1.0);

    variance.max(0.0).sqrt() * 252.0_f64.sqrt()
}

fn true_ranges(candles: &[Candle]) -> Vec<f64> {
    let mut tr_values = Vec::with_capacity(candles.len().saturating_sub(1));
    for i in 1..candles.len() {
        let c = &candles[i];
        let prev_close = candles[i - 1].close;
        let tr = (c.high - c.low)
            .max((c.high - prev_close).abs())
            .max((c.low - prev_close).abs());
        tr_values.push(tr);
    }
    tr_values
}

/// Wilder-smoothed ATR: seed = simple mean of the first `period` true
/// ranges, then atr = (atr * (n - 1) + tr) / n.
pub fn calculate_atr(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period + 1 {
        return None;
    }

    let tr_values = true_ranges(candles);
    let mut atr = tr_values[..period].iter().sum::<f64>() / period as f64;
    for &tr in &tr_values[period..] {
        atr = (atr * (period as f64 - 1.0) + tr) / period as f64;
    }
    Some(atr)
}

/// ADX over window-smoothed directional movement. DX values are averaged
/// over the trailing window to produce the final ADX reading.
pub fn calculate_adx(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period + 1 {
        return None;
    }

    let mut tr_values = Vec::new();
    let mut dm_plus_values = Vec::new();
    let mut dm_minus_values = Vec::new();

    for i in 1..candles.len() {
        let c = &candles[i];
        let prev = &candles[i - 1];
        let tr = (c.high - c.low)
            .max((c.high - prev.close).abs())
            .max((c.low - prev.close).abs());
        tr_values.push(tr);

        let up_move = c.high - prev.high;
        let down_move = prev.low - c.low;
        dm_plus_values.push(if up_move > down_move && up_move > 0.0 {
            up_move
        } else {
            0.0
        });
        dm_minus_values.push(if down_move > up_move && down_move > 0.0 {
            down_move
        } else {
            0.0
        });
    }

    let mut dx_values = Vec::new();
    let start = period - 1;
    for i in start..tr_values.len() {
        let window_start = i + 1 - period;
        let tr_sum = tr_values[window_start..=i].iter().sum::<f64>();
        if tr_sum <= 0.0 {
            dx_values.push(0.0);
            continue;
        }
        let di_plus = dm_plus_values[window_start..=i].iter().sum::<f64>() / tr_sum * 100.0;
        let di_minus = dm_minus_values[window_start..=i].iter().sum::<f64>() / tr_sum * 100.0;
        let di_sum = di_plus + di_minus;
        let dx = if di_sum > 0.0 {
            (di_plus - di_minus).abs() / di_sum * 100.0
        } else {
            0.0
        };
        dx_values.push(dx);
    }

    if dx_values.is_empty() {
        return None;
    }
    let tail_start = dx_values.len().saturating_sub(period);
    let tail = &dx_values[tail_start..];
    Some(tail.iter().sum::<f64>() / tail.len() as f64)
}

/// Full indicator snapshot derived from one rolling window. Recomputed
/// wholesale on every candle append once the window holds enough history.
#[derive(Debug, Clone, Default)]
pub struct IndicatorSet {
    pub rsi: f64,
    pub sma20: f64,
    pub ema20: f64,
    pub ema12: f64,
    pub ema26: f64,
    pub bollinger: BollingerBands,
    pub macd: f64,
    pub macd_signal: f64,
    pub volume_sma: f64,
    pub volatility: f64,
    pub atr: f64,
    pub adx: f64,
}

impl IndicatorSet {
    pub fn compute(candles: &[Candle]) -> Option<IndicatorSet> {
        if candles.len() < MIN_HISTORY {
            return None;
        }

        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let volumes: Vec<f64> = candles.iter().map(|c| c.volume).collect();

        let rsi = calculate_rsi(&closes, 14)?;
        let sma20 = calculate_sma(&closes, 20)?;
        let ema20 = calculate_ema(&closes, 20)?;
        let ema12 = calculate_ema(&closes, 12)?;
        let ema26 = calculate_ema(&closes, 26)?;
        let bollinger = calculate_bollinger_bands(&closes, 20, 2.0)?;
        let (macd, macd_signal) = calculate_macd(&closes, 12, 26, 9)?;
        let volume_sma = calculate_sma(&volumes, 20)?;
        let volatility = calculate_annualized_volatility(&closes, 20);
        let atr = calculate_atr(candles, 14).unwrap_or(0.0);
        let adx = calculate_adx(candles, 14).unwrap_or(0.0);

        Some(IndicatorSet {
            rsi,
            sma20,
            ema20,
            ema12,
            ema26,
            bollinger,
            macd,
            macd_signal,
            volume_sma,
            volatility,
            atr,
            adx,
        })
    }

    pub fn is_trending(&self) -> bool {
        self.adx > 20.0 && self.ema12 > self.ema26
    }

    pub fn is_ranging(&self) -> bool {
        self.adx < 18.0
    }
}

/// Bounded rolling candle window with FIFO eviction, owned by exactly one
/// strategy instance.
#[derive(Debug, Clone)]
pub struct IndicatorWindow {
    candles: VecDeque<Candle>,
    capacity: usize,
    indicators: Option<IndicatorSet>,
}

impl Default for IndicatorWindow {
    fn default() -> Self {
        Self::new(WINDOW_CAP)
    }
}

impl IndicatorWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            candles: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(MIN_HISTORY),
            indicators: None,
        }
    }

    pub fn push(&mut self, candle: Candle) {
        if self.candles.len() >= self.capacity {
            self.candles.pop_front();
        }
        self.candles.push_back(candle);
        let slice = self.candles.make_contiguous();
        self.indicators = IndicatorSet::compute(slice);
    }

    pub fn indicators(&self) -> Option<&IndicatorSet> {
        self.indicators.as_ref()
    }

    pub fn candles(&self) -> &VecDeque<Candle> {
        &self.candles
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    /// Highest high over the last `lookback` candles.
    pub fn highest_high(&self, lookback: usize) -> Option<f64> {
        let len = self.candles.len();
        if len == 0 || lookback == 0 {
            return None;
        }
        let start = len.saturating_sub(lookback);
        self.candles
            .iter()
            .skip(start)
            .map(|c| c.high)
            .fold(None, |acc, v| Some(acc.map_or(v, |a: f64| a.max(v))))
    }

    /// Lowest low over the last `lookback` candles.
    pub fn lowest_low(&self, lookback: usize) -> Option<f64> {
        let len = self.candles.len();
        if len == 0 || lookback == 0 {
            return None;
        }
        let start = len.saturating_sub(lookback);
        self.candles
            .iter()
            .skip(start)
            .map(|c| c.low)
            .fold(None, |acc, v| Some(acc.map_or(v, |a: f64| a.min(v))))
    }
}
