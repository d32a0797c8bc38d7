use crate::indicators::MIN_HISTORY;
use crate::models::{generate_signal_id, Candle, MarketContext, SignalDirection, TradeSignal};
use anyhow::Result;
use std::collections::HashMap;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    Breakout,
    Momentum,
    MeanReversion,
    FibonacciAdaptive,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Breakout => "breakout",
            StrategyKind::Momentum => "momentum",
            StrategyKind::MeanReversion => "mean_reversion",
            StrategyKind::FibonacciAdaptive => "fibonacci_adaptive",
        }
    }

    /// Trend-following strategies take priority over mean reversion when
    /// both compete for the same book (rotation arbitration).
    pub fn is_trend_following(&self) -> bool {
        matches!(self, StrategyKind::Breakout | StrategyKind::Momentum)
    }
}

impl FromStr for StrategyKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "breakout" => Ok(StrategyKind::Breakout),
            "momentum" => Ok(StrategyKind::Momentum),
            "mean_reversion" | "meanreversion" => Ok(StrategyKind::MeanReversion),
            "fibonacci_adaptive" | "fibonacci" => Ok(StrategyKind::FibonacciAdaptive),
            other => Err(anyhow::anyhow!("Unknown strategy kind: {}", other)),
        }
    }
}

/// The strategy contract. `on_market_data` is the only state mutation path
/// for indicator history; `analyze` must not touch it.
pub trait Strategy: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> StrategyKind;

    /// The single symbol this instance trades.
    fn symbol(&self) -> &str;

    /// Append a candle to the rolling window and recompute indicators.
    fn on_market_data(&mut self, candle: &Candle);

    /// Evaluate the current window against the supplied market context.
    fn analyze(&self, context: &MarketContext) -> Option<TradeSignal>;

    /// Execution feedback hook; adaptive variants use it to tune themselves.
    fn on_trade(&mut self, _signal: &TradeSignal, _executed: bool) {}

    /// Minimum candles required before `analyze` can produce a signal.
    fn warmup(&self) -> usize {
        MIN_HISTORY
    }
}

pub(crate) fn build_signal(
    strategy_id: &str,
    symbol: &str,
    direction: SignalDirection,
    strength: f64,
    price_target: f64,
    stop_loss: Option<f64>,
    take_profit: Option<f64>,
    reasoning: String,
) -> TradeSignal {
    TradeSignal {
        id: generate_signal_id(),
        strategy_id: strategy_id.to_string(),
        symbol: symbol.to_string(),
        direction,
        strength: strength.clamp(0.0, 1.0),
        price_target,
        stop_loss,
        take_profit,
        reasoning,
        size_factor: 1.0,
        executed: false,
    }
}

#[path = "strategies/breakout.rs"]
pub mod breakout;

pub use breakout::BreakoutStrategy;

#[path = "strategies/momentum.rs"]
pub mod momentum;

pub use momentum::MomentumStrategy;

#[path = "strategies/mean_reversion.rs"]
pub mod mean_reversion;

pub use mean_reversion::MeanReversionStrategy;

#[path = "strategies/fibonacci.rs"]
pub mod fibonacci;

pub use fibonacci::FibonacciAdaptiveStrategy;

pub fn create_strategy(
    kind: StrategyKind,
    id: &str,
    symbol: &str,
    parameters: HashMap<String, f64>,
) -> Box<dyn Strategy> {
    match kind {
        StrategyKind::Breakout => Box::new(BreakoutStrategy::new(id, symbol, parameters)),
        StrategyKind::Momentum => Box::new(MomentumStrategy::new(id, symbol, parameters)),
        StrategyKind::MeanReversion => {
            Box::new(MeanReversionStrategy::new(id, symbol, parameters))
        }
        StrategyKind::FibonacciAdaptive => {
            Box::new(FibonacciAdaptiveStrategy::new(id, symbol, parameters))
        }
    }
}
