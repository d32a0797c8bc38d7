use crate::indicators::IndicatorWindow;
use crate::models::{Candle, MarketContext, SignalDirection, TradeSignal, TrendLabel};
use crate::param_utils::get_param_f64_clamped;
use crate::strategy::{build_signal, Strategy, StrategyKind};
use std::collections::HashMap;

pub struct MeanReversionStrategy {
    id: String,
    symbol: String,
    rsi_oversold: f64,
    rsi_overbought: f64,
    stop_atr_multiplier: f64,
    window: IndicatorWindow,
}

impl MeanReversionStrategy {
    pub fn new(id: &str, symbol: &str, parameters: HashMap<String, f64>) -> Self {
        let rsi_oversold = get_param_f64_clamped(&parameters, "rsiOversold", 30.0, 5.0, 45.0);
        let rsi_overbought = get_param_f64_clamped(&parameters, "rsiOverbought", 70.0, 55.0, 95.0);
        let stop_atr_multiplier =
            get_param_f64_clamped(&parameters, "stopAtrMultiplier", 1.5, 0.5, 10.0);
        Self {
            id: id.to_string(),
            symbol: symbol.to_string(),
            rsi_oversold,
            rsi_overbought,
            stop_atr_multiplier,
            window: IndicatorWindow::default(),
        }
    }
}

impl Strategy for MeanReversionStrategy {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::MeanReversion
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
        let bands = indicators.bollinger;
        let band_width = bands.upper - bands.lower;
        if band_width <= 0.0 {
            return None;
        }

        // Reversion fires at an RSI extreme plus a band breach, unless the
        // broader trend context opposes it.
        let direction = if indicators.rsi < self.rsi_oversold
            && price < bands.lower
            && context.trend != TrendLabel::Bearish
        {
            SignalDirection::Buy
        } else if indicators.rsi > self.rsi_overbought
            && price > bands.upper
            && context.trend != TrendLabel::Bullish
        {
            SignalDirection::Sell
        } else {
            return None;
        };

        let (rsi_extremity, breach) = match direction {
            SignalDirection::Buy => (
                ((self.rsi_oversold - indicators.rsi) / self.rsi_oversold).clamp(0.0, 1.0),
                ((bands.lower - price) / band_width).clamp(0.0, 1.0),
            ),
            SignalDirection::Sell => (
                ((indicators.rsi - self.rsi_overbought) / (100.0 - self.rsi_overbought))
                    .clamp(0.0, 1.0),
                ((price - bands.upper) / band_width).clamp(0.0, 1.0),
            ),
        };
        let strength = (0.5 + 0.3 * rsi_extremity + 0.2 * breach).clamp(0.0, 1.0);

        let stop_loss = match direction {
            SignalDirection::Buy => price - indicators.atr * self.stop_atr_multiplier,
            SignalDirection::Sell => price + indicators.atr * self.stop_atr_multiplier,
        };

        Some(build_signal(
            &self.id,
            &self.symbol,
            direction,
            strength,
            bands.middle,
            Some(stop_loss),
            Some(bands.middle),
            format!(
                "{} reversion toward {:.4} (rsi {:.1}, band breach {:.1}%)",
                direction.as_str(),
                bands.middle,
                indicators.rsi,
                breach * 100.0
            ),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn feed(strategy: &mut MeanReversionStrategy, closes: &[f64]) {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        for (i, &close) in closes.iter().enumerate() {
            strategy.on_market_data(&Candle {
                symbol: "SOLUSDT".to_string(),
                timestamp: start + Duration::minutes(5 * i as i64),
                open: close,
                high: close + 0.2,
                low: close - 0.2,
                close,
                volume: 300.0,
                source: "test".to_string(),
            });
        }
    }

    #[test]
    fn oversold_band_breach_targets_middle_band() {
        let mut strategy = MeanReversionStrategy::new("mr1", "SOLUSDT", HashMap::new());
        // Flat history followed by a sharp selloff drives RSI deep below 30
        // and price under the lower band.
        let mut closes = vec![100.0; 25];
        for i in 0..10 {
            closes.push(99.0 - i as f64);
        }
        feed(&mut strategy, &closes);

        let indicators = strategy.window.indicators().unwrap().clone();
        assert!(indicators.rsi < 30.0);
        let price = *closes.last().unwrap() - 0.5;
        assert!(price < indicators.bollinger.lower);

        let context = MarketContext {
            price,
            volume: 300.0,
            volatility: 0.4,
            trend: TrendLabel::Neutral,
            sentiment: None,
            timestamp: Utc::now(),
        };
        let signal = strategy.analyze(&context).expect("reversion should fire");
        assert_eq!(signal.direction, SignalDirection::Buy);
        assert!((signal.price_target - indicators.bollinger.middle).abs() < 1e-9);
        assert!(signal.strength >= 0.5);
    }

    #[test]
    fn opposing_trend_suppresses_reversion() {
        let mut strategy = MeanReversionStrategy::new("mr1", "SOLUSDT", HashMap::new());
        let mut closes = vec![100.0; 25];
        for i in 0..10 {
            closes.push(99.0 - i as f64);
        }
        feed(&mut strategy, &closes);

        let context = MarketContext {
            price: *closes.last().unwrap() - 0.5,
            volume: 300.0,
            volatility: 0.4,
            trend: TrendLabel::Bearish,
            sentiment: None,
            timestamp: Utc::now(),
        };
        assert!(strategy.analyze(&context).is_none());
    }
}
