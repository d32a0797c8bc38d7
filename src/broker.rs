use crate::error::TradingError;
use crate::models::{Balance, OrderRequest, OrderResponse, OrderStatus, PriceUpdate, SymbolInfo};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;

/// The exchange seam. Concrete implementations own their wire protocol,
/// timeouts, and reconnect policy; the engine treats every failure here as a
/// single-operation error and retries on the next tick.
#[async_trait]
pub trait Broker: Send + Sync {
    fn name(&self) -> &str;

    async fn connect(&self) -> Result<(), TradingError>;

    async fn disconnect(&self) -> Result<(), TradingError>;

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderResponse, TradingError>;

    async fn cancel_order(&self, order_id: &str) -> Result<(), TradingError>;

    async fn get_order_status(&self, order_id: &str) -> Result<OrderStatus, TradingError>;

    async fn get_balances(&self) -> Result<Vec<Balance>, TradingError>;

    /// Net position quantity per symbol.
    async fn get_positions(&self) -> Result<HashMap<String, f64>, TradingError>;

    async fn get_price(&self, symbol: &str) -> Result<f64, TradingError>;

    /// Stream of price updates for one symbol. Dropping the receiver or
    /// calling `unsubscribe` ends the stream.
    async fn subscribe_prices(
        &self,
        symbol: &str,
    ) -> Result<mpsc::Receiver<PriceUpdate>, TradingError>;

    async fn unsubscribe(&self, symbol: &str) -> Result<(), TradingError>;

    async fn get_symbol_info(&self, symbol: &str) -> Result<SymbolInfo, TradingError>;
}

fn round_down_to_step(value: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return value;
    }
    (value / step).floor() * step
}

fn round_to_tick(value: f64, tick: f64) -> f64 {
    if tick <= 0.0 {
        return value;
    }
    (value / tick).round() * tick
}

/// Round quantity and price to exchange granularity, bumping quantity up when
/// the rounded notional falls under the exchange minimum.
pub fn normalize_order(
    request: &OrderRequest,
    info: &SymbolInfo,
    market_price: f64,
) -> Result<OrderRequest, TradingError> {
    let price = request.limit_price.unwrap_or(market_price);
    if price <= 0.0 {
        return Err(TradingError::Validation(format!(
            "no valid price for {}",
            request.symbol
        )));
    }

    let mut quantity = round_down_to_step(request.quantity, info.step_size);
    if quantity < info.min_qty {
        quantity = info.min_qty;
    }
    if quantity * price < info.min_notional {
        let needed = info.min_notional / price;
        quantity = if info.step_size > 0.0 {
            (needed / info.step_size).ceil() * info.step_size
        } else {
            needed
        };
    }
    if quantity <= 0.0 {
        return Err(TradingError::Validation(format!(
            "quantity for {} normalizes to zero",
            request.symbol
        )));
    }

    Ok(OrderRequest {
        symbol: request.symbol.clone(),
        side: request.side,
        quantity,
        limit_price: request
            .limit_price
            .map(|limit| round_to_tick(limit, info.tick_size)),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Exponential backoff for broker reconnects: `base * 2^attempts`, capped,
/// with a hard attempt ceiling. Counters reset on a successful connect.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: 10,
        }
    }
}

#[derive(Debug)]
pub struct ConnectionTracker {
    policy: ReconnectPolicy,
    state: ConnectionState,
    attempts: u32,
}

impl ConnectionTracker {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            state: ConnectionState::Disconnected,
            attempts: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn connecting(&mut self) {
        self.state = if self.attempts == 0 {
            ConnectionState::Connecting
        } else {
            ConnectionState::Reconnecting
        };
    }

    pub fn on_success(&mut self) {
        self.state = ConnectionState::Connected;
        self.attempts = 0;
    }

    /// Next backoff delay, or None when the attempt ceiling is reached and
    /// the connection should be given up as Disconnected.
    pub fn on_failure(&mut self) -> Option<Duration> {
        self.attempts += 1;
        if self.attempts > self.policy.max_attempts {
            self.state = ConnectionState::Disconnected;
            return None;
        }
        self.state = ConnectionState::Reconnecting;
        let exp = self.attempts.min(20);
        let delay = self.policy.base_delay.saturating_mul(1u32 << exp.min(31));
        Some(delay.min(self.policy.max_delay))
    }
}
