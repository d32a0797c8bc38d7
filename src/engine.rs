use crate::broker::{normalize_order, Broker};
use crate::error::TradingError;
use crate::indicators::IndicatorWindow;
use crate::models::{
    generate_trade_id, Candle, CloseReason, MarketContext, OrderRequest, SignalDirection, Trade,
    TradeSignal, TradeStatus, TrendLabel,
};
use crate::risk::{admit_signal, AdmissionDecision, EngineState, RiskConfig};
use crate::store::Store;
use crate::strategy::{Strategy, StrategyKind};
use chrono::Utc;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub symbols: Vec<String>,
    /// Explicit symbol to broker routing. Symbols without a route are
    /// skipped with a warning rather than defaulting to an arbitrary broker.
    pub routing: HashMap<String, String>,
    pub risk: RiskConfig,
    pub ingestion_interval_secs: u64,
    pub monitoring_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            symbols: Vec::new(),
            routing: HashMap::new(),
            risk: RiskConfig::default(),
            ingestion_interval_secs: 5,
            monitoring_interval_secs: 10,
        }
    }
}

/// Partial config update; None leaves the current value untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfigPatch {
    pub symbols: Option<Vec<String>>,
    pub routing: Option<HashMap<String, String>>,
    pub risk: Option<RiskConfig>,
    pub ingestion_interval_secs: Option<u64>,
    pub monitoring_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub is_running: bool,
    pub active_trades: usize,
    pub active_strategies: Vec<String>,
    pub daily_pnl: f64,
    pub config: EngineConfig,
}

pub(crate) struct EngineInner {
    brokers: HashMap<String, Arc<dyn Broker>>,
    store: Arc<dyn Store>,
    strategies: RwLock<HashMap<String, Box<dyn Strategy>>>,
    state: RwLock<EngineState>,
    config: RwLock<EngineConfig>,
    /// Engine-level windows used to derive the market context handed to
    /// strategies (volatility, trend label).
    windows: Mutex<HashMap<String, IndicatorWindow>>,
    running: AtomicBool,
}

pub struct LiveEngine {
    pub(crate) inner: Arc<EngineInner>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

impl LiveEngine {
    pub fn new(
        brokers: HashMap<String, Arc<dyn Broker>>,
        store: Arc<dyn Store>,
        config: EngineConfig,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                brokers,
                store,
                strategies: RwLock::new(HashMap::new()),
                state: RwLock::new(EngineState::default()),
                config: RwLock::new(config),
                windows: Mutex::new(HashMap::new()),
                running: AtomicBool::new(false),
            }),
            handles: Mutex::new(Vec::new()),
            shutdown: Mutex::new(None),
        }
    }

    /// Load open positions from the store and start the two periodic tasks.
    /// A store failure here is fatal: the engine must not run with unknown
    /// position state.
    pub async fn start(&self) -> Result<(), TradingError> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let open = match self.inner.store.load_open_trades().await {
            Ok(trades) => trades,
            Err(err) => {
                self.inner.running.store(false, Ordering::SeqCst);
                return Err(TradingError::Startup(format!(
                    "cannot load open trades: {}",
                    err
                )));
            }
        };
        {
            let mut state = self.inner.state.write().await;
            for trade in open {
                info!(
                    "recovered open position {} {} {} @ {:.4}",
                    trade.id, trade.side, trade.symbol, trade.entry_price
                );
                state.active.insert(trade.id.clone(), trade);
            }
        }

        let (tx, rx) = watch::channel(false);
        let (ingest_every, monitor_every) = {
            let config = self.inner.config.read().await;
            (
                Duration::from_secs(config.ingestion_interval_secs.max(1)),
                Duration::from_secs(config.monitoring_interval_secs.max(1)),
            )
        };

        let mut handles = self.handles.lock().await;
        handles.push(spawn_tick(
            self.inner.clone(),
            rx.clone(),
            ingest_every,
            TickKind::Ingestion,
        ));
        handles.push(spawn_tick(
            self.inner.clone(),
            rx,
            monitor_every,
            TickKind::Monitoring,
        ));
        *self.shutdown.lock().await = Some(tx);
        info!("engine started");
        Ok(())
    }

    /// Signal both periodic tasks to stop and wait for in-flight work to
    /// finish.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(tx) = self.shutdown.lock().await.take() {
            let _ = tx.send(true);
        }
        let handles: Vec<JoinHandle<()>> = self.handles.lock().await.drain(..).collect();
        for result in futures::future::join_all(handles).await {
            if let Err(err) = result {
                error!("tick task panicked: {}", err);
            }
        }
        info!("engine stopped");
    }

    pub async fn add_strategy(&self, strategy: Box<dyn Strategy>) {
        let id = strategy.id().to_string();
        info!(
            "adding strategy {} ({}) on {}",
            id,
            strategy.kind().as_str(),
            strategy.symbol()
        );
        self.inner.strategies.write().await.insert(id, strategy);
    }

    pub async fn remove_strategy(&self, id: &str) -> bool {
        self.inner.strategies.write().await.remove(id).is_some()
    }

    pub async fn update_config(&self, patch: EngineConfigPatch) {
        let mut config = self.inner.config.write().await;
        if let Some(symbols) = patch.symbols {
            config.symbols = symbols;
        }
        if let Some(routing) = patch.routing {
            config.routing = routing;
        }
        if let Some(risk) = patch.risk {
            config.risk = risk;
        }
        if let Some(secs) = patch.ingestion_interval_secs {
            config.ingestion_interval_secs = secs;
        }
        if let Some(secs) = patch.monitoring_interval_secs {
            config.monitoring_interval_secs = secs;
        }
        info!("engine config updated");
    }

    pub async fn get_status(&self) -> EngineStatus {
        let config = self.inner.config.read().await.clone();
        let strategies = self.inner.strategies.read().await;
        let mut state = self.inner.state.write().await;
        EngineStatus {
            is_running: self.inner.running.load(Ordering::SeqCst),
            active_trades: state.active.len(),
            active_strategies: strategies.keys().cloned().collect(),
            daily_pnl: state.daily_pnl(Utc::now()),
            config,
        }
    }

    /// Manually close one open position at the current market price.
    pub async fn close_position(&self, trade_id: &str) -> Result<(), TradingError> {
        let trade = {
            let state = self.inner.state.read().await;
            state.active.get(trade_id).cloned()
        }
        .ok_or_else(|| TradingError::Validation(format!("no open trade {}", trade_id)))?;

        let broker = self.inner.route(&trade.symbol).await.ok_or_else(|| {
            TradingError::Validation(format!("no broker routed for {}", trade.symbol))
        })?;
        let price = broker.get_price(&trade.symbol).await?;
        self.inner
            .close_trade(&trade, price, CloseReason::Manual)
            .await
    }
}

enum TickKind {
    Ingestion,
    Monitoring,
}

fn spawn_tick(
    inner: Arc<EngineInner>,
    mut shutdown: watch::Receiver<bool>,
    every: Duration,
    kind: TickKind,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => match kind {
                    TickKind::Ingestion => inner.ingestion_tick().await,
                    TickKind::Monitoring => inner.monitoring_tick().await,
                },
                _ = shutdown.changed() => break,
            }
        }
    })
}

impl EngineInner {
    async fn route(&self, symbol: &str) -> Option<Arc<dyn Broker>> {
        let config = self.config.read().await;
        let name = config.routing.get(symbol)?;
        self.brokers.get(name).cloned()
    }

    /// One pass over the tracked symbols: fetch price, synthesize a candle,
    /// feed strategies, and execute admitted signals. A fault for one symbol
    /// is logged and does not stop the rest of the tick.
    pub(crate) async fn ingestion_tick(&self) {
        let symbols = self.config.read().await.symbols.clone();
        for symbol in symbols {
            if let Err(err) = self.ingest_symbol(&symbol).await {
                warn!("ingestion skipped for {}: {}", symbol, err);
            }
        }
    }

    async fn ingest_symbol(&self, symbol: &str) -> Result<(), TradingError> {
        let broker = self.route(symbol).await.ok_or_else(|| {
            TradingError::Validation(format!("no broker routed for {}", symbol))
        })?;
        let price = broker.get_price(symbol).await?;
        let now = Utc::now();

        let (candle, context) = {
            let mut windows = self.windows.lock().await;
            let window = windows.entry(symbol.to_string()).or_default();
            let open = window.candles().back().map(|c| c.close).unwrap_or(price);
            let candle = Candle {
                symbol: symbol.to_string(),
                timestamp: now,
                open,
                high: open.max(price),
                low: open.min(price),
                close: price,
                volume: 0.0,
                source: "live".to_string(),
            };
            window.push(candle.clone());

            let (volatility, trend) = match window.indicators() {
                Some(set) => {
                    let trend = if set.is_trending() {
                        if set.ema12 > set.ema26 {
                            TrendLabel::Bullish
                        } else {
                            TrendLabel::Bearish
                        }
                    } else {
                        TrendLabel::Neutral
                    };
                    (set.volatility, trend)
                }
                None => (0.0, TrendLabel::Neutral),
            };
            let context = MarketContext {
                price,
                volume: candle.volume,
                volatility,
                trend,
                sentiment: None,
                timestamp: now,
            };
            (candle, context)
        };

        if let Err(err) = self.store.append_candle(&candle).await {
            warn!("candle audit write failed for {}: {}", symbol, err);
        }

        let window_len = {
            let windows = self.windows.lock().await;
            windows.get(symbol).map(|w| w.len()).unwrap_or(0)
        };

        // Collect signals under the strategy lock, execute afterwards.
        let mut signals: Vec<(String, StrategyKind, TradeSignal)> = Vec::new();
        {
            let mut strategies = self.strategies.write().await;
            for strategy in strategies.values_mut() {
                if strategy.symbol() != symbol {
                    continue;
                }
                strategy.on_market_data(&candle);
                if window_len < strategy.warmup() {
                    continue;
                }
                if let Some(signal) = strategy.analyze(&context) {
                    debug!(
                        "strategy {} signals {} {} (strength {:.2})",
                        strategy.id(),
                        signal.direction,
                        signal.symbol,
                        signal.strength
                    );
                    signals.push((strategy.id().to_string(), strategy.kind(), signal));
                }
            }
        }

        for (strategy_id, kind, signal) in signals {
            if let Err(err) = self
                .execute_signal(&broker, &strategy_id, kind, &signal, price)
                .await
            {
                warn!("signal {} not executed: {}", signal.id, err);
            }
        }
        Ok(())
    }

    async fn execute_signal(
        &self,
        broker: &Arc<dyn Broker>,
        strategy_id: &str,
        kind: StrategyKind,
        signal: &TradeSignal,
        price: f64,
    ) -> Result<(), TradingError> {
        let now = Utc::now();
        let balances = broker.get_balances().await?;
        let balance = balances
            .iter()
            .find(|b| b.asset == "USDT")
            .or_else(|| balances.first())
            .map(|b| b.free)
            .unwrap_or(0.0);
        if balance <= 0.0 {
            return Err(TradingError::Validation("no available balance".to_string()));
        }

        let open_kinds: Vec<StrategyKind> = {
            let strategies = self.strategies.read().await;
            let state = self.state.read().await;
            state
                .active
                .values()
                .filter_map(|trade| strategies.get(&trade.strategy_id).map(|s| s.kind()))
                .collect()
        };

        let decision = {
            let config = self.config.read().await;
            let mut state = self.state.write().await;
            admit_signal(
                &config.risk, &mut state, signal, kind, &open_kinds, price, balance, now,
            )
        };
        let quantity = match decision {
            AdmissionDecision::Accept { quantity } => quantity,
            AdmissionDecision::Reject { reason } => {
                info!("signal {} rejected: {}", signal.id, reason);
                // Adaptive strategies track every emitted signal until they
                // hear back; a silent drop would leak that bookkeeping.
                self.feed_back(strategy_id, signal, false).await;
                return Ok(());
            }
        };

        let request = OrderRequest {
            symbol: signal.symbol.clone(),
            side: signal.direction,
            quantity,
            limit_price: None,
        };
        let request = match broker.get_symbol_info(&signal.symbol).await {
            Ok(info) => normalize_order(&request, &info, price)?,
            Err(err) => {
                debug!("no symbol info for {}: {}", signal.symbol, err);
                request
            }
        };

        let response = match broker.place_order(&request).await {
            Ok(response) => response,
            Err(err) => {
                warn!("order placement failed for {}: {}", signal.symbol, err);
                self.feed_back(strategy_id, signal, false).await;
                return Err(TradingError::Execution(err.to_string()));
            }
        };

        let trade = Trade {
            id: generate_trade_id(),
            strategy_id: strategy_id.to_string(),
            symbol: signal.symbol.clone(),
            side: signal.direction,
            entry_price: response.fill_price,
            quantity: response.quantity,
            stop_loss: signal.stop_loss,
            take_profit: signal.take_profit,
            status: TradeStatus::Open,
            fees: 0.0,
            entry_time: now,
            exit_price: None,
            exit_time: None,
            pnl: None,
            close_reason: None,
            broker: broker.name().to_string(),
            metadata: serde_json::json!({ "signal_id": signal.id, "reasoning": signal.reasoning }),
        };

        if let Err(err) = self.store.insert_trade(&trade).await {
            warn!("trade {} not persisted: {}", trade.id, err);
        }
        if let Err(err) = self.store.mark_signal_executed(&signal.id).await {
            warn!("signal {} not flagged executed: {}", signal.id, err);
        }

        {
            let mut state = self.state.write().await;
            state.active.insert(trade.id.clone(), trade.clone());
            state.last_trade_time = Some(now);
        }
        info!(
            "opened {} {} {:.6} @ {:.4} (trade {})",
            trade.side, trade.symbol, trade.quantity, trade.entry_price, trade.id
        );
        self.feed_back(strategy_id, signal, true).await;
        Ok(())
    }

    async fn feed_back(&self, strategy_id: &str, signal: &TradeSignal, executed: bool) {
        let mut strategies = self.strategies.write().await;
        if let Some(strategy) = strategies.get_mut(strategy_id) {
            strategy.on_trade(signal, executed);
        }
    }

    /// One pass over the open positions, exiting any whose stop-loss or
    /// take-profit level has been reached. Faults are isolated per position.
    pub(crate) async fn monitoring_tick(&self) {
        let open: Vec<Trade> = {
            let state = self.state.read().await;
            state.active.values().cloned().collect()
        };
        for trade in open {
            if let Err(err) = self.monitor_position(&trade).await {
                warn!("monitoring skipped for trade {}: {}", trade.id, err);
            }
        }
    }

    async fn monitor_position(&self, trade: &Trade) -> Result<(), TradingError> {
        let broker = self.route(&trade.symbol).await.ok_or_else(|| {
            TradingError::Validation(format!("no broker routed for {}", trade.symbol))
        })?;
        let price = broker.get_price(&trade.symbol).await?;

        let reason = match trade.side {
            SignalDirection::Buy => {
                if trade.stop_loss.is_some_and(|stop| price <= stop) {
                    Some(CloseReason::StopLoss)
                } else if trade.take_profit.is_some_and(|tp| price >= tp) {
                    Some(CloseReason::TakeProfit)
                } else {
                    None
                }
            }
            SignalDirection::Sell => {
                if trade.stop_loss.is_some_and(|stop| price >= stop) {
                    Some(CloseReason::StopLoss)
                } else if trade.take_profit.is_some_and(|tp| price <= tp) {
                    Some(CloseReason::TakeProfit)
                } else {
                    None
                }
            }
        };

        match reason {
            Some(reason) => self.close_trade(trade, price, reason).await,
            None => Ok(()),
        }
    }

    /// Place the opposite-side order, realize PnL into the daily total,
    /// persist the closed record, and drop the id from the active table.
    pub(crate) async fn close_trade(
        &self,
        trade: &Trade,
        exit_price: f64,
        reason: CloseReason,
    ) -> Result<(), TradingError> {
        let broker = self.route(&trade.symbol).await.ok_or_else(|| {
            TradingError::Validation(format!("no broker routed for {}", trade.symbol))
        })?;
        let response = broker
            .place_order(&OrderRequest {
                symbol: trade.symbol.clone(),
                side: trade.side.opposite(),
                quantity: trade.quantity,
                limit_price: None,
            })
            .await?;

        let now = Utc::now();
        let mut closed = trade.clone();
        closed.close(response.fill_price, now, reason, 0.0);
        let pnl = closed.pnl.unwrap_or(0.0);

        {
            let mut state = self.state.write().await;
            state.record_realized_pnl(now, pnl);
            state.active.remove(&trade.id);
        }
        if let Err(err) = self.store.update_trade(&closed).await {
            warn!("closed trade {} not persisted: {}", closed.id, err);
        }
        info!(
            "closed {} {} @ {:.4} ({}) pnl {:.2}",
            closed.side,
            closed.symbol,
            exit_price,
            reason.as_str(),
            pnl
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MarketContext;
    use crate::paper::PaperBroker;
    use crate::store::MemoryStore;
    use crate::strategy::build_signal;

    /// Emits one fixed signal per analyze call once armed.
    struct MockStrategy {
        id: String,
        symbol: String,
        strength: f64,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
        candles_seen: usize,
        rejections: Arc<std::sync::atomic::AtomicUsize>,
    }

    impl MockStrategy {
        fn new(strength: f64) -> Self {
            Self {
                id: "mock".to_string(),
                symbol: "BTCUSDT".to_string(),
                strength,
                stop_loss: Some(95.0),
                take_profit: Some(110.0),
                candles_seen: 0,
                rejections: Arc::new(std::sync::atomic::AtomicUsize::new(0)),
            }
        }
    }

    impl Strategy for MockStrategy {
        fn id(&self) -> &str {
            &self.id
        }

        fn kind(&self) -> StrategyKind {
            StrategyKind::Momentum
        }

        fn symbol(&self) -> &str {
            &self.symbol
        }

        fn on_market_data(&mut self, _candle: &Candle) {
            self.candles_seen += 1;
        }

        fn analyze(&self, context: &MarketContext) -> Option<TradeSignal> {
            Some(build_signal(
                &self.id,
                &self.symbol,
                SignalDirection::Buy,
                self.strength,
                context.price * 1.05,
                self.stop_loss,
                self.take_profit,
                "mock".to_string(),
            ))
        }

        fn on_trade(&mut self, _signal: &TradeSignal, executed: bool) {
            if !executed {
                self.rejections
                    .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        }

        fn warmup(&self) -> usize {
            0
        }
    }

    fn engine_with_paper() -> (LiveEngine, Arc<PaperBroker>, Arc<MemoryStore>) {
        let broker = Arc::new(PaperBroker::new(10_000.0, 0.0));
        let store = Arc::new(MemoryStore::new());
        let mut brokers: HashMap<String, Arc<dyn Broker>> = HashMap::new();
        brokers.insert("paper".to_string(), broker.clone());
        let config = EngineConfig {
            symbols: vec!["BTCUSDT".to_string()],
            routing: HashMap::from([("BTCUSDT".to_string(), "paper".to_string())]),
            risk: RiskConfig {
                cooldown_secs: 0,
                ..RiskConfig::default()
            },
            ..EngineConfig::default()
        };
        (
            LiveEngine::new(brokers, store.clone(), config),
            broker,
            store,
        )
    }

    #[tokio::test]
    async fn accepted_signal_opens_exactly_one_position() {
        let (engine, broker, store) = engine_with_paper();
        broker.set_price("BTCUSDT", 100.0);
        engine.add_strategy(Box::new(MockStrategy::new(0.9))).await;

        engine.inner.ingestion_tick().await;

        let state = engine.inner.state.read().await;
        assert_eq!(state.active.len(), 1);
        let trade = state.active.values().next().unwrap();
        assert_eq!(trade.status, TradeStatus::Open);
        assert!(trade.quantity > 0.0);
        assert!(trade.entry_price > 0.0);
        drop(state);

        let stored = store.all_trades().await;
        assert_eq!(stored.len(), 1);

        // The same tick again hits the single-position-per-symbol gate.
        engine.inner.ingestion_tick().await;
        assert_eq!(engine.inner.state.read().await.active.len(), 1);
    }

    #[tokio::test]
    async fn weak_signal_is_rejected_and_fed_back() {
        let (engine, broker, _store) = engine_with_paper();
        broker.set_price("BTCUSDT", 100.0);
        let strategy = MockStrategy::new(0.3);
        let rejections = strategy.rejections.clone();
        engine.add_strategy(Box::new(strategy)).await;

        engine.inner.ingestion_tick().await;
        assert!(engine.inner.state.read().await.active.is_empty());
        // The strategy hears about the rejection so it can release any
        // per-signal bookkeeping.
        assert_eq!(rejections.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn daily_breaker_blocks_new_trades() {
        let (engine, broker, _store) = engine_with_paper();
        broker.set_price("BTCUSDT", 100.0);
        engine.add_strategy(Box::new(MockStrategy::new(0.9))).await;
        engine
            .inner
            .state
            .write()
            .await
            .record_realized_pnl(Utc::now(), -500.0);

        engine.inner.ingestion_tick().await;
        assert!(engine.inner.state.read().await.active.is_empty());
    }

    #[tokio::test]
    async fn monitoring_closes_on_stop_loss_and_books_pnl() {
        let (engine, broker, store) = engine_with_paper();
        broker.set_price("BTCUSDT", 100.0);
        engine.add_strategy(Box::new(MockStrategy::new(0.9))).await;
        engine.inner.ingestion_tick().await;
        let trade_id = {
            let state = engine.inner.state.read().await;
            state.active.keys().next().unwrap().clone()
        };

        broker.set_price("BTCUSDT", 90.0);
        engine.inner.monitoring_tick().await;

        let mut state = engine.inner.state.write().await;
        assert!(state.active.is_empty());
        assert!(state.daily_pnl(Utc::now()) < 0.0);
        drop(state);

        let stored = store.trade(&trade_id).await.unwrap();
        assert_eq!(stored.status, TradeStatus::Closed);
        assert_eq!(stored.close_reason, Some(CloseReason::StopLoss));
        assert!(stored.exit_price.is_some());
        assert!(stored.exit_time.is_some());
    }

    #[tokio::test]
    async fn startup_recovers_open_positions_and_stop_joins_tasks() {
        let (engine, broker, store) = engine_with_paper();
        broker.set_price("BTCUSDT", 100.0);

        let trade = Trade {
            id: "t-recovered".to_string(),
            strategy_id: "mock".to_string(),
            symbol: "BTCUSDT".to_string(),
            side: SignalDirection::Buy,
            entry_price: 100.0,
            quantity: 1.0,
            stop_loss: Some(95.0),
            take_profit: Some(110.0),
            status: TradeStatus::Open,
            fees: 0.0,
            entry_time: Utc::now(),
            exit_price: None,
            exit_time: None,
            pnl: None,
            close_reason: None,
            broker: "paper".to_string(),
            metadata: serde_json::Value::Null,
        };
        store.insert_trade(&trade).await.unwrap();

        engine.start().await.unwrap();
        let status = engine.get_status().await;
        assert!(status.is_running);
        assert_eq!(status.active_trades, 1);
        engine.stop().await;
        assert!(!engine.get_status().await.is_running);
    }
}
