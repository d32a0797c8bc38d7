use crate::indicators::IndicatorWindow;
use crate::models::{Candle, MarketContext, SignalDirection, TradeSignal};
use crate::param_utils::get_param_f64_clamped;
use crate::strategy::{build_signal, Strategy, StrategyKind};
use std::collections::HashMap;

pub struct MomentumStrategy {
    id: String,
    symbol: String,
    adx_threshold: f64,
    stop_atr_multiplier: f64,
    target_atr_multiplier: f64,
    window: IndicatorWindow,
}

impl MomentumStrategy {
    pub fn new(id: &str, symbol: &str, parameters: HashMap<String, f64>) -> Self {
        let adx_threshold = get_param_f64_clamped(&parameters, "adxThreshold", 25.0, 10.0, 60.0);
        let stop_atr_multiplier =
            get_param_f64_clamped(&parameters, "stopAtrMultiplier", 2.0, 0.5, 10.0);
        let target_atr_multiplier =
            get_param_f64_clamped(&parameters, "targetAtrMultiplier", 4.0, 0.5, 20.0);
        Self {
            id: id.to_string(),
            symbol: symbol.to_string(),
            adx_threshold,
            stop_atr_multiplier,
            target_atr_multiplier,
            window: IndicatorWindow::default(),
        }
    }
}

impl Strategy for MomentumStrategy {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::Momentum
    }

    fn symbol(&self) -> &str {
        &self.symbol
    }

    fn on_market_data(&mut self, candle: &Candle) {
        self.window.push(candle.clone());
    }

    fn analyze(&self, context: &MarketContext) -> Option<TradeSignal> {
        let indicators = self.window.indicators()?;
        if indicators.adx < self.adx_threshold {
            return None;
        }

        let price = context.price;
        // Direction from EMA ordering, confirmed by price position relative
        // to the fast EMA.
        let direction = if indicators.ema12 > indicators.ema26 && price > indicators.ema12 {
            SignalDirection::Buy
        } else if indicators.ema12 < indicators.ema26 && price < indicators.ema12 {
            SignalDirection::Sell
        } else {
            return None;
        };

        let adx_excess = ((indicators.adx - self.adx_threshold) / 40.0).clamp(0.0, 1.0);
        let strength = (0.55 + 0.45 * adx_excess).clamp(0.0, 1.0);

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

        Some(build_signal(
            &self.id,
            &self.symbol,
            direction,
            strength,
            take_profit,
            Some(stop_loss),
            Some(take_profit),
            format!(
                "{} momentum (adx {:.1} >= {:.1}, ema12 {:.4} vs ema26 {:.4})",
                direction.as_str(),
                indicators.adx,
                self.adx_threshold,
                indicators.ema12,
                indicators.ema26
            ),
        ))
    }
}
