use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tradekit::backtest::{run_backtest, BacktestConfig};
use tradekit::broker::Broker;
use tradekit::engine::{EngineConfig, LiveEngine};
use tradekit::models::{
    Candle, MarketContext, SignalDirection, TradeSignal, TradeStatus,
};
use tradekit::paper::PaperBroker;
use tradekit::risk::RiskConfig;
use tradekit::store::{MemoryStore, Store};
use tradekit::strategy::{create_strategy, Strategy, StrategyKind};
use chrono::{Duration as ChronoDuration, TimeZone, Utc};

/// Always-on buy strategy with fixed exit levels, used to drive the engine
/// deterministically from the outside.
struct AlwaysBuy {
    id: String,
    symbol: String,
    stop_loss: f64,
    take_profit: f64,
}

impl AlwaysBuy {
    fn new(symbol: &str, stop_loss: f64, take_profit: f64) -> Self {
        Self {
            id: format!("always-buy-{}", symbol.to_lowercase()),
            symbol: symbol.to_string(),
            stop_loss,
            take_profit,
        }
    }
}

impl Strategy for AlwaysBuy {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::Momentum
    }

    fn symbol(&self) -> &str {
        &self.symbol
    }

    fn on_market_data(&mut self, _candle: &Candle) {}

    fn analyze(&self, context: &MarketContext) -> Option<TradeSignal> {
        Some(TradeSignal {
            id: uuid::Uuid::new_v4().to_string(),
            strategy_id: self.id.clone(),
            symbol: self.symbol.clone(),
            direction: SignalDirection::Buy,
            strength: 0.9,
            price_target: context.price * 1.05,
            stop_loss: Some(self.stop_loss),
            take_profit: Some(self.take_profit),
            reasoning: "integration fixture".to_string(),
            size_factor: 1.0,
            executed: false,
        })
    }

    fn warmup(&self) -> usize {
        0
    }
}

fn paper_setup(
    risk: RiskConfig,
) -> (LiveEngine, Arc<PaperBroker>, Arc<MemoryStore>) {
    let broker = Arc::new(PaperBroker::new(10_000.0, 0.0));
    let store = Arc::new(MemoryStore::new());
    let mut brokers: HashMap<String, Arc<dyn Broker>> = HashMap::new();
    brokers.insert("paper".to_string(), broker.clone());
    let config = EngineConfig {
        symbols: vec!["BTCUSDT".to_string()],
        routing: HashMap::from([("BTCUSDT".to_string(), "paper".to_string())]),
        risk,
        ingestion_interval_secs: 1,
        monitoring_interval_secs: 1,
    };
    (LiveEngine::new(brokers, store.clone(), config), broker, store)
}

#[tokio::test(start_paused = true)]
async fn paper_pipeline_opens_monitors_and_closes() {
    let (engine, broker, store) = paper_setup(RiskConfig::default());
    broker.set_price("BTCUSDT", 100.0);
    engine
        .add_strategy(Box::new(AlwaysBuy::new("BTCUSDT", 95.0, 110.0)))
        .await;

    engine.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;

    let status = engine.get_status().await;
    assert!(status.is_running);
    assert_eq!(status.active_trades, 1);

    let open = store.load_open_trades().await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].symbol, "BTCUSDT");
    assert!(open[0].quantity > 0.0);
    // Sized within the 10% notional cap.
    assert!(open[0].quantity * open[0].entry_price <= 10_000.0 * 0.1 + 1e-6);

    // Take-profit level reached; the monitoring tick closes the position.
    broker.set_price("BTCUSDT", 111.0);
    tokio::time::sleep(Duration::from_secs(3)).await;

    let status = engine.get_status().await;
    assert_eq!(status.active_trades, 0);
    assert!(status.daily_pnl > 0.0);

    let trades = store.all_trades().await;
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].status, TradeStatus::Closed);
    assert!(trades[0].exit_price.is_some());
    assert!(trades[0].exit_time.is_some());

    engine.stop().await;
    assert!(!engine.get_status().await.is_running);
}

#[tokio::test(start_paused = true)]
async fn daily_loss_breaker_halts_reentry() {
    let risk = RiskConfig {
        max_daily_loss: 1.0,
        cooldown_secs: 0,
        ..RiskConfig::default()
    };
    let (engine, broker, store) = paper_setup(risk);
    broker.set_price("BTCUSDT", 100.0);
    engine
        .add_strategy(Box::new(AlwaysBuy::new("BTCUSDT", 95.0, 200.0)))
        .await;

    engine.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(engine.get_status().await.active_trades, 1);

    // Stop out with a loss far beyond the 1.0 daily limit.
    broker.set_price("BTCUSDT", 80.0);
    tokio::time::sleep(Duration::from_secs(3)).await;
    let status = engine.get_status().await;
    assert_eq!(status.active_trades, 0);
    assert!(status.daily_pnl < -1.0);

    // Price recovers and signals keep firing, but the breaker holds.
    broker.set_price("BTCUSDT", 100.0);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(engine.get_status().await.active_trades, 0);
    assert_eq!(store.load_open_trades().await.unwrap().len(), 0);

    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn manual_close_removes_position() {
    let risk = RiskConfig {
        cooldown_secs: 0,
        ..RiskConfig::default()
    };
    let (engine, broker, store) = paper_setup(risk);
    broker.set_price("BTCUSDT", 100.0);
    engine
        .add_strategy(Box::new(AlwaysBuy::new("BTCUSDT", 50.0, 500.0)))
        .await;

    engine.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    let open = store.load_open_trades().await.unwrap();
    assert_eq!(open.len(), 1);

    engine.stop().await;
    engine.close_position(&open[0].id).await.unwrap();
    assert_eq!(engine.get_status().await.active_trades, 0);

    let trade = store.trade(&open[0].id).await.unwrap();
    assert_eq!(trade.status, TradeStatus::Closed);
    assert_eq!(
        trade.close_reason,
        Some(tradekit::models::CloseReason::Manual)
    );
}

fn synthetic_candles(symbol: &str, count: usize) -> Vec<Candle> {
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    (0..count)
        .map(|i| {
            let drift = i as f64 * 0.02;
            let wave = (i as f64 * 0.35).sin() * 3.0;
            let close = 100.0 + drift + wave;
            Candle {
                symbol: symbol.to_string(),
                timestamp: start + ChronoDuration::minutes(5 * i as i64),
                open: close - 0.1,
                high: close + 0.8,
                low: close - 0.8,
                close,
                volume: 1_000.0 + (i as f64 * 1.1).cos().abs() * 500.0,
                source: "csv".to_string(),
            }
        })
        .collect()
}

fn backtest_config() -> BacktestConfig {
    BacktestConfig {
        start_date: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        end_date: Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
        initial_balance: 10_000.0,
        commission_pct: 0.001,
        slippage_pct: 0.0005,
        max_positions: 3,
        risk_per_trade: 0.01,
        symbols: vec!["BTCUSDT".to_string()],
    }
}

#[test]
fn backtest_is_deterministic_with_a_real_strategy() {
    let candles = synthetic_candles("BTCUSDT", 500);
    let config = backtest_config();

    let mut first = create_strategy(
        StrategyKind::MeanReversion,
        "mr-bt",
        "BTCUSDT",
        HashMap::new(),
    );
    let first_report = run_backtest(first.as_mut(), &config, &candles).unwrap();

    let mut second = create_strategy(
        StrategyKind::MeanReversion,
        "mr-bt",
        "BTCUSDT",
        HashMap::new(),
    );
    let second_report = run_backtest(second.as_mut(), &config, &candles).unwrap();

    assert_eq!(
        serde_json::to_string(&first_report.trades).unwrap(),
        serde_json::to_string(&second_report.trades).unwrap()
    );
    assert_eq!(
        serde_json::to_string(&first_report.equity).unwrap(),
        serde_json::to_string(&second_report.equity).unwrap()
    );
    assert_eq!(first_report.equity.len(), 500);
}

#[test]
fn backtest_equity_curve_is_consistent_with_trades() {
    let candles = synthetic_candles("BTCUSDT", 500);
    let config = backtest_config();
    let mut strategy = create_strategy(
        StrategyKind::Momentum,
        "mom-bt",
        "BTCUSDT",
        HashMap::new(),
    );
    let report = run_backtest(strategy.as_mut(), &config, &candles).unwrap();

    let realized: f64 = report.trades.iter().filter_map(|t| t.pnl).sum();
    let final_balance = report.equity.last().unwrap().balance;
    assert!((final_balance - (config.initial_balance + realized)).abs() < 1e-6);

    // Every closed trade carries complete exit accounting.
    for trade in &report.trades {
        assert_eq!(trade.status, TradeStatus::Closed);
        assert!(trade.exit_price.is_some());
        assert!(trade.exit_time.is_some());
        assert!(trade.pnl.is_some());
        assert!(trade.quantity > 0.0);
        assert!(trade.entry_price > 0.0);
    }
}
