use crate::error::TradingError;
use crate::models::{Candle, Trade};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

/// Persistence seam for trades, signals, and candle audit records. The
/// engine loads open trades through this on startup and will not start
/// without them.
#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_trade(&self, trade: &Trade) -> Result<(), TradingError>;

    async fn update_trade(&self, trade: &Trade) -> Result<(), TradingError>;

    async fn load_open_trades(&self) -> Result<Vec<Trade>, TradingError>;

    async fn mark_signal_executed(&self, signal_id: &str) -> Result<(), TradingError>;

    /// Audit log of candles fed to strategies.
    async fn append_candle(&self, candle: &Candle) -> Result<(), TradingError>;
}

/// In-memory store used by the paper setup and tests.
#[derive(Default)]
pub struct MemoryStore {
    trades: RwLock<HashMap<String, Trade>>,
    executed_signals: RwLock<HashSet<String>>,
    candles: RwLock<Vec<Candle>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn trade(&self, id: &str) -> Option<Trade> {
        self.trades.read().await.get(id).cloned()
    }

    pub async fn all_trades(&self) -> Vec<Trade> {
        self.trades.read().await.values().cloned().collect()
    }

    pub async fn signal_executed(&self, signal_id: &str) -> bool {
        self.executed_signals.read().await.contains(signal_id)
    }

    pub async fn candle_count(&self) -> usize {
        self.candles.read().await.len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_trade(&self, trade: &Trade) -> Result<(), TradingError> {
        self.trades
            .write()
            .await
            .insert(trade.id.clone(), trade.clone());
        Ok(())
    }

    async fn update_trade(&self, trade: &Trade) -> Result<(), TradingError> {
        let mut trades = self.trades.write().await;
        if !trades.contains_key(&trade.id) {
            return Err(TradingError::Validation(format!(
                "unknown trade id {}",
                trade.id
            )));
        }
        trades.insert(trade.id.clone(), trade.clone());
        Ok(())
    }

    async fn load_open_trades(&self) -> Result<Vec<Trade>, TradingError> {
        Ok(self
            .trades
            .read()
            .await
            .values()
            .filter(|trade| trade.is_open())
            .cloned()
            .collect())
    }

    async fn mark_signal_executed(&self, signal_id: &str) -> Result<(), TradingError> {
        self.executed_signals
            .write()
            .await
            .insert(signal_id.to_string());
        Ok(())
    }

    async fn append_candle(&self, candle: &Candle) -> Result<(), TradingError> {
        self.candles.write().await.push(candle.clone());
        Ok(())
    }
}
