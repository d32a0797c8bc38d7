use crate::indicators::IndicatorWindow;
use crate::models::{Candle, MarketContext, SignalDirection, TradeSignal, TrendLabel};
use crate::param_utils::{get_param_f64_clamped, get_param_usize_rounded_clamped};
use crate::strategy::{build_signal, Strategy, StrategyKind};
use chrono::{Datelike, Timelike};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

const FIB_RATIOS: [f64; 5] = [0.236, 0.382, 0.5, 0.618, 0.786];
const FEATURE_COUNT: usize = 8;
const PATTERN_HISTORY_CAP: usize = 1000;
const REWEIGHT_INTERVAL: u64 = 50;

#[derive(Debug, Clone, Copy)]
struct FibLevel {
    price: f64,
    ratio: f64,
    strength: f64,
    is_support: bool,
}

#[derive(Debug, Clone, Copy)]
struct PatternRecord {
    features: [f64; FEATURE_COUNT],
    executed: bool,
}

/// Features of emitted signals awaiting execution feedback, keyed by signal
/// id. Not every signal comes back through `on_trade` (the engine can drop a
/// signal before placement), so inserts evict the oldest entries once the
/// table is full.
#[derive(Debug, Default)]
struct PendingFeatures {
    map: HashMap<String, [f64; FEATURE_COUNT]>,
    order: VecDeque<String>,
}

impl PendingFeatures {
    fn insert(&mut self, id: String, features: [f64; FEATURE_COUNT]) {
        while self.order.len() >= PATTERN_HISTORY_CAP {
            if let Some(oldest) = self.order.pop_front() {
                self.map.remove(&oldest);
            }
        }
        self.order.push_back(id.clone());
        self.map.insert(id, features);
    }

    fn take(&mut self, id: &str) -> Option<[f64; FEATURE_COUNT]> {
        // The id lingers in the eviction queue until it ages out; removing
        // from the map alone keeps `take` O(1).
        self.map.remove(id)
    }
}

/// Fibonacci retracement trading with a linear weighted-feature heuristic
/// standing in for a trained model. Feedback from executions tunes the
/// minimum pattern strength and, periodically, the feature weights.
pub struct FibonacciAdaptiveStrategy {
    id: String,
    symbol: String,
    lookback: usize,
    touch_tolerance: f64,
    proximity: f64,
    min_pattern_strength: f64,
    weights: [f64; FEATURE_COUNT],
    history: VecDeque<PatternRecord>,
    executed_count: u64,
    pending: Mutex<PendingFeatures>,
    window: IndicatorWindow,
}

impl FibonacciAdaptiveStrategy {
    pub fn new(id: &str, symbol: &str, parameters: HashMap<String, f64>) -> Self {
        let lookback = get_param_usize_rounded_clamped(&parameters, "lookback", 100, 20, 500);
        let touch_tolerance =
            get_param_f64_clamped(&parameters, "touchTolerance", 0.003, 0.0005, 0.02);
        let proximity = get_param_f64_clamped(&parameters, "proximity", 0.01, 0.001, 0.05);
        let min_pattern_strength =
            get_param_f64_clamped(&parameters, "minPatternStrength", 0.5, 0.3, 0.8);
        Self {
            id: id.to_string(),
            symbol: symbol.to_string(),
            lookback,
            touch_tolerance,
            proximity,
            min_pattern_strength,
            // trend, volatility, volume, fibonacci, sentiment, hour, weekday, regime
            weights: [0.2, 0.1, 0.15, 0.25, 0.1, 0.05, 0.05, 0.1],
            history: VecDeque::with_capacity(PATTERN_HISTORY_CAP),
            executed_count: 0,
            pending: Mutex::new(PendingFeatures::default()),
            window: IndicatorWindow::default(),
        }
    }

    /// Retracement levels from the lookback high/low, scored by historical
    /// touches and bounces within the price tolerance.
    fn levels(&self, avg_close: f64) -> Vec<FibLevel> {
        let high = match self.window.highest_high(self.lookback) {
            Some(value) => value,
            None => return Vec::new(),
        };
        let low = match self.window.lowest_low(self.lookback) {
            Some(value) => value,
            None => return Vec::new(),
        };
        let range = high - low;
        if range <= 0.0 {
            return Vec::new();
        }

        let candles = self.window.candles();
        let start = candles.len().saturating_sub(self.lookback);
        FIB_RATIOS
            .iter()
            .map(|&ratio| {
                let price = high - range * ratio;
                let tolerance = price * self.touch_tolerance;
                let mut touches = 0usize;
                let mut bounces = 0usize;
                for candle in candles.iter().skip(start) {
                    let touched =
                        candle.low <= price + tolerance && candle.high >= price - tolerance;
                    if !touched {
                        continue;
                    }
                    touches += 1;
                    // A bounce closes clearly away from the level after
                    // touching it.
                    if (candle.close - price).abs() > tolerance {
                        bounces += 1;
                    }
                }
                let strength = (touches as f64 * 0.08 + bounces as f64 * 0.15).min(1.0);
                FibLevel {
                    price,
                    ratio,
                    strength,
                    is_support: price < avg_close,
                }
            })
            .collect()
    }

    fn feature_vector(&self, context: &MarketContext, fib_alignment: f64) -> [f64; FEATURE_COUNT] {
        let indicators = self.window.indicators();
        let (adx, volume_sma, trending, ranging) = match indicators {
            Some(set) => (set.adx, set.volume_sma, set.is_trending(), set.is_ranging()),
            None => (0.0, 0.0, false, false),
        };

        let trend_strength = (adx / 50.0).clamp(0.0, 1.0);
        let volatility = (context.volatility / 2.0).clamp(0.0, 1.0);
        let volume_ratio = if volume_sma > 0.0 {
            (context.volume / volume_sma / 3.0).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let sentiment = context.sentiment.unwrap_or(0.5).clamp(0.0, 1.0);
        let hour = hour_of_day_score(context.timestamp.hour());
        let weekday = weekday_score(context.timestamp.weekday().num_days_from_monday());
        // Level bounces are most reliable in ranging markets.
        let regime = if ranging {
            1.0
        } else if trending {
            0.35
        } else {
            0.6
        };

        [
            trend_strength,
            volatility,
            volume_ratio,
            fib_alignment,
            sentiment,
            hour,
            weekday,
            regime,
        ]
    }

    fn predict(&self, features: &[f64; FEATURE_COUNT]) -> f64 {
        let weight_sum: f64 = self.weights.iter().sum();
        if weight_sum <= 0.0 {
            return 0.0;
        }
        let dot: f64 = self
            .weights
            .iter()
            .zip(features.iter())
            .map(|(w, f)| w * f)
            .sum();
        (dot / weight_sum).clamp(0.0, 1.0)
    }

    fn record_pattern(&mut self, features: [f64; FEATURE_COUNT], executed: bool) {
        if self.history.len() >= PATTERN_HISTORY_CAP {
            self.history.pop_front();
        }
        self.history.push_back(PatternRecord { features, executed });
    }

    /// Re-derive feature weights from the executed patterns in the history
    /// buffer: features that were consistently elevated when trades went
    /// through earn more weight.
    fn reweight_features(&mut self) {
        let mut sums = [0.0f64; FEATURE_COUNT];
        let mut count = 0usize;
        for record in self.history.iter().filter(|r| r.executed) {
            for (sum, value) in sums.iter_mut().zip(record.features.iter()) {
                *sum += value;
            }
            count += 1;
        }
        if count == 0 {
            return;
        }

        let mut raw = [0.0f64; FEATURE_COUNT];
        for (slot, sum) in raw.iter_mut().zip(sums.iter()) {
            *slot = sum / count as f64 + 0.05;
        }
        let total: f64 = raw.iter().sum();
        if total <= 0.0 {
            return;
        }
        for (weight, value) in self.weights.iter_mut().zip(raw.iter()) {
            *weight = value / total;
        }
        log::debug!(
            "strategy {}: reweighted features from {} executed patterns",
            self.id,
            count
        );
    }
}

fn hour_of_day_score(hour: u32) -> f64 {
    // Favor the London/New York overlap, fade the dead hours.
    match hour {
        12..=20 => 1.0,
        7..=11 => 0.8,
        21..=23 => 0.6,
        _ => 0.4,
    }
}

fn weekday_score(days_from_monday: u32) -> f64 {
    if days_from_monday >= 5 {
        0.4
    } else {
        1.0
    }
}

impl Strategy for FibonacciAdaptiveStrategy {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::FibonacciAdaptive
    }

    fn symbol(&self) -> &str {
        &self.symbol
    }

    fn on_market_data(&mut self, candle: &Candle) {
        self.window.push(candle.clone());
    }

    fn analyze(&self, context: &MarketContext) -> Option<TradeSignal> {
        let indicators = self.window.indicators()?;
        let price = context.price;
        if price <= 0.0 {
            return None;
        }

        let candles = self.window.candles();
        let recent = candles.len().saturating_sub(10);
        let avg_close =
            candles.iter().skip(recent).map(|c| c.close).sum::<f64>() / (candles.len() - recent) as f64;

        // Strongest level within the proximity band of the current price.
        let level = self
            .levels(avg_close)
            .into_iter()
            .filter(|level| (level.price - price).abs() / price <= self.proximity)
            .max_by(|a, b| a.strength.total_cmp(&b.strength))?;

        let direction = if level.is_support && context.trend != TrendLabel::Bearish {
            SignalDirection::Buy
        } else if !level.is_support && context.trend != TrendLabel::Bullish {
            SignalDirection::Sell
        } else {
            return None;
        };

        let features = self.feature_vector(context, level.strength);
        let prediction = self.predict(&features);
        let strength = (0.6 * level.strength + 0.4 * prediction).clamp(0.0, 1.0);
        if strength < self.min_pattern_strength {
            return None;
        }

        let atr = indicators.atr.max(price * 0.002);
        let (stop_loss, take_profit) = match direction {
            SignalDirection::Buy => {
                let stop = (level.price * (1.0 - 2.0 * self.touch_tolerance)).min(price - atr);
                (stop, price + (price - stop) * 2.0)
            }
            SignalDirection::Sell => {
                let stop = (level.price * (1.0 + 2.0 * self.touch_tolerance)).max(price + atr);
                (stop, price - (stop - price) * 2.0)
            }
        };

        let mut signal = build_signal(
            &self.id,
            &self.symbol,
            direction,
            strength,
            take_profit,
            Some(stop_loss),
            Some(take_profit),
            format!(
                "{} off {:.1}% fib level {:.4} ({}, pattern {:.2}, prediction {:.2})",
                direction.as_str(),
                level.ratio * 100.0,
                level.price,
                if level.is_support {
                    "support"
                } else {
                    "resistance"
                },
                level.strength,
                prediction
            ),
        );
        signal.size_factor = (prediction * hour_of_day_score(context.timestamp.hour()))
            .clamp(0.25, 1.0);

        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(signal.id.clone(), features);
        }
        Some(signal)
    }

    fn on_trade(&mut self, signal: &TradeSignal, executed: bool) {
        let features = match self.pending.lock() {
            Ok(mut pending) => pending.take(&signal.id),
            Err(_) => None,
        };
        let Some(features) = features else {
            return;
        };

        self.record_pattern(features, executed);
        if executed {
            self.executed_count += 1;
            self.min_pattern_strength = (self.min_pattern_strength - 0.005).max(0.35);
            if self.executed_count % REWEIGHT_INTERVAL == 0 {
                self.reweight_features();
            }
        } else {
            self.min_pattern_strength = (self.min_pattern_strength + 0.02).min(0.8);
        }
    }

    fn warmup(&self) -> usize {
        crate::indicators::MIN_HISTORY.max(self.lookback / 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn feed_range(strategy: &mut FibonacciAdaptiveStrategy) {
        // Oscillate between 90 and 110 so retracement levels collect touches.
        let start = Utc.with_ymd_and_hms(2024, 3, 4, 14, 0, 0).unwrap();
        for i in 0..80 {
            let phase = (i as f64 * std::f64::consts::PI / 10.0).sin();
            let close = 100.0 + phase * 10.0;
            strategy.on_market_data(&Candle {
                symbol: "BTCUSDT".to_string(),
                timestamp: start + Duration::minutes(5 * i as i64),
                open: close,
                high: close + 0.6,
                low: close - 0.6,
                close,
                volume: 800.0,
                source: "test".to_string(),
            });
        }
    }

    #[test]
    fn levels_are_scored_and_classified() {
        let mut strategy = FibonacciAdaptiveStrategy::new("f1", "BTCUSDT", HashMap::new());
        feed_range(&mut strategy);
        let levels = strategy.levels(100.0);
        assert_eq!(levels.len(), FIB_RATIOS.len());
        assert!(levels.iter().any(|level| level.strength > 0.0));
        // The 78.6% retracement sits well below the average close.
        let deepest = levels.last().unwrap();
        assert!(deepest.is_support);
        assert!(!levels.first().unwrap().is_support);
    }

    #[test]
    fn execution_feedback_tunes_threshold_and_weights() {
        let mut strategy = FibonacciAdaptiveStrategy::new("f1", "BTCUSDT", HashMap::new());
        feed_range(&mut strategy);

        let before = strategy.min_pattern_strength;
        let features = [0.5; FEATURE_COUNT];
        for i in 0..REWEIGHT_INTERVAL {
            let signal = crate::strategy::build_signal(
                "f1",
                "BTCUSDT",
                SignalDirection::Buy,
                0.7,
                101.0,
                Some(98.0),
                Some(104.0),
                "test".to_string(),
            );
            strategy
                .pending
                .lock()
                .unwrap()
                .insert(signal.id.clone(), features);
            strategy.on_trade(&signal, true);
            assert_eq!(strategy.executed_count, i + 1);
        }

        assert!(strategy.min_pattern_strength < before);
        assert_eq!(strategy.history.len(), REWEIGHT_INTERVAL as usize);
        // Uniform features over executed trades flatten the weights.
        let first = strategy.weights[0];
        assert!(strategy
            .weights
            .iter()
            .all(|weight| (weight - first).abs() < 1e-9));

        // Failed execution raises the bar again.
        let raised_from = strategy.min_pattern_strength;
        let signal = crate::strategy::build_signal(
            "f1",
            "BTCUSDT",
            SignalDirection::Buy,
            0.7,
            101.0,
            Some(98.0),
            Some(104.0),
            "test".to_string(),
        );
        strategy
            .pending
            .lock()
            .unwrap()
            .insert(signal.id.clone(), features);
        strategy.on_trade(&signal, false);
        assert!(strategy.min_pattern_strength > raised_from);
    }

    #[test]
    fn pending_features_stay_bounded_without_feedback() {
        let strategy = FibonacciAdaptiveStrategy::new("f1", "BTCUSDT", HashMap::new());
        for i in 0..(PATTERN_HISTORY_CAP + 200) {
            strategy
                .pending
                .lock()
                .unwrap()
                .insert(format!("sig-{}", i), [0.2; FEATURE_COUNT]);
        }

        let pending = strategy.pending.lock().unwrap();
        assert_eq!(pending.map.len(), PATTERN_HISTORY_CAP);
        // Oldest entries are the ones evicted.
        assert!(!pending.map.contains_key("sig-0"));
        assert!(pending
            .map
            .contains_key(&format!("sig-{}", PATTERN_HISTORY_CAP + 199)));
    }

    #[test]
    fn history_buffer_is_bounded() {
        let mut strategy = FibonacciAdaptiveStrategy::new("f1", "BTCUSDT", HashMap::new());
        for _ in 0..(PATTERN_HISTORY_CAP + 50) {
            strategy.record_pattern([0.1; FEATURE_COUNT], false);
        }
        assert_eq!(strategy.history.len(), PATTERN_HISTORY_CAP);
    }
}
