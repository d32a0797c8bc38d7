pub mod backtest;
pub mod broker;
pub mod engine;
pub mod error;
pub mod indicators;
pub mod models;
pub mod paper;
pub mod param_utils;
pub mod performance;
pub mod risk;
pub mod store;
pub mod strategy;

pub use backtest::{run_backtest, BacktestConfig, BacktestReport, EquityPoint};
pub use broker::{normalize_order, Broker, ConnectionState, ConnectionTracker, ReconnectPolicy};
pub use engine::{EngineConfig, EngineConfigPatch, EngineStatus, LiveEngine};
pub use error::TradingError;
pub use indicators::{IndicatorSet, IndicatorWindow};
pub use models::{
    Candle, CloseReason, MarketContext, SignalDirection, Trade, TradeSignal, TradeStatus,
    TrendLabel,
};
pub use paper::PaperBroker;
pub use performance::{PerformanceCalculator, PerformanceSummary};
pub use risk::{admit_signal, position_size, AdmissionDecision, EngineState, RiskConfig};
pub use store::{MemoryStore, Store};
pub use strategy::{create_strategy, Strategy, StrategyKind};
