use crate::indicators::IndicatorWindow;
use crate::models::{Candle, MarketContext, SignalDirection, TradeSignal};
use crate::param_utils::{get_param_f64_clamped, get_param_usize_rounded_clamped};
use crate::strategy::{build_signal, Strategy, StrategyKind};
use std::collections::HashMap;

pub struct BreakoutStrategy {
    id: String,
    symbol: String,
    lookback: usize,
    price_change_threshold: f64,
    volume_threshold: f64,
    stop_atr_multiplier: f64,
    target_atr_multiplier: f64,
    window: IndicatorWindow,
}

impl BreakoutStrategy {
    pub fn new(id: &str, symbol: &str, parameters: HashMap<String, f64>) -> Self {
        let lookback = get_param_usize_rounded_clamped(&parameters, "lookback", 20, 5, 200);
        let price_change_threshold =
            get_param_f64_clamped(&parameters, "priceChangeThreshold", 0.015, 0.001, 0.2);
        let volume_threshold =
            get_param_f64_clamped(&parameters, "volumeThreshold", 1.5, 1.0, 10.0);
        let stop_atr_multiplier =
            get_param_f64_clamped(&parameters, "stopAtrMultiplier", 1.5, 0.5, 10.0);
        let target_atr_multiplier =
            get_param_f64_clamped(&parameters, "targetAtrMultiplier", 3.0, 0.5, 20.0);
        Self {
            id: id.to_string(),
            symbol: symbol.to_string(),
            lookback,
            price_change_threshold,
            volume_threshold,
            stop_atr_multiplier,
            target_atr_multiplier,
            window: IndicatorWindow::default(),
        }
    }

    /// Resistance/support over the lookback candles preceding the current one.
    fn boundaries(&self) -> Option<(f64, f64)> {
        let candles = self.window.candles();
        if candles.len() < 2 {
            return None;
        }
        let end = candles.len() - 1;
        let start = end.saturating_sub(self.lookback);
        if start == end {
            return None;
        }
        let mut resistance = f64::NEG_INFINITY;
        let mut support = f64::INFINITY;
        for candle in candles.iter().skip(start).take(end - start) {
            resistance = resistance.max(candle.high);
            support = support.min(candle.low);
        }
        Some((resistance, support))
    }
}

impl Strategy for BreakoutStrategy {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::Breakout
    }

    fn symbol(&self) -> &str {
        &self.symbol
    }

    fn on_market_data(&mut self, candle: &Candle) {
        self.window.push(candle.clone());
    }

    fn analyze(&self, context: &MarketContext) -> Option<TradeSignal> {
        let indicators = self.window.indicators()?;
        if !indicators.is_trending() {
            return None;
        }

        let candles = self.window.candles();
        if candles.len() < 2 {
            return None;
        }
        let prev_close = candles[candles.len() - 2].close;
        if prev_close <= 0.0 {
            return None;
        }
        let price = context.price;
        let price_change = (price - prev_close) / prev_close;
        if price_change.abs() < self.price_change_threshold {
            return None;
        }

        if indicators.volume_sma <= 0.0 {
            return None;
        }
        let volume_ratio = context.volume / indicators.volume_sma;
        if volume_ratio < self.volume_threshold {
            return None;
        }

        let (resistance, support) = self.boundaries()?;
        let direction = if price > resistance {
            SignalDirection::Buy
        } else if price < support {
            SignalDirection::Sell
        } else {
            return None;
        };

        let price_score = ((price_change.abs() - self.price_change_threshold)
            / self.price_change_threshold)
            .clamp(0.0, 1.0);
        let volume_score =
            ((volume_ratio - self.volume_threshold) / self.volume_threshold).clamp(0.0, 1.0);
        let rsi_bias = match direction {
            SignalDirection::Buy => ((indicators.rsi - 50.0) / 50.0).clamp(0.0, 1.0),
            SignalDirection::Sell => ((50.0 - indicators.rsi) / 50.0).clamp(0.0, 1.0),
        };
        let strength = (0.45 + 0.25 * price_score + 0.2 * volume_score + 0.1 * rsi_bias)
            .clamp(0.0, 1.0);

        let atr = indicators.atr;
        let (stop_loss, take_profit) = match direction {
            SignalDirection::Buy => (
                price - atr * self.stop_atr_multiplier,
                price + atr * self.target_atr_multiplier,
            ),
            SignalDirection::Sell => (
                price + atr * self.stop_atr_multiplier,
                price - atr * self.target_atr_multiplier,
            ),
        };

        let boundary = match direction {
            SignalDirection::Buy => resistance,
            SignalDirection::Sell => support,
        };
        Some(build_signal(
            &self.id,
            &self.symbol,
            direction,
            strength,
            take_profit,
            Some(stop_loss),
            Some(take_profit),
            format!(
                "{} breakout of {:.4} (change {:.2}%, volume x{:.2}, rsi {:.1})",
                direction.as_str(),
                boundary,
                price_change * 100.0,
                volume_ratio,
                indicators.rsi
            ),
        ))
    }
}
