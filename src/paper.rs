use crate::broker::Broker;
use crate::error::TradingError;
use crate::models::{
    Balance, OrderRequest, OrderResponse, OrderStatus, PriceUpdate, SignalDirection, SymbolInfo,
};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, RwLock};

const QUOTE_ASSET: &str = "USDT";
const PRICE_CHANNEL_CAPACITY: usize = 64;

/// Simulated exchange: instant fills at the current table price, a single
/// quote-asset balance, and per-symbol price fan-out to subscribers.
pub struct PaperBroker {
    prices: DashMap<String, f64>,
    positions: DashMap<String, f64>,
    orders: DashMap<String, OrderResponse>,
    subscribers: DashMap<String, Vec<mpsc::Sender<PriceUpdate>>>,
    quote_balance: RwLock<f64>,
    fee_pct: f64,
    connected: AtomicBool,
}

impl PaperBroker {
    pub fn new(starting_balance: f64, fee_pct: f64) -> Self {
        Self {
            prices: DashMap::new(),
            positions: DashMap::new(),
            orders: DashMap::new(),
            subscribers: DashMap::new(),
            quote_balance: RwLock::new(starting_balance),
            fee_pct,
            connected: AtomicBool::new(false),
        }
    }

    /// Set a symbol's price and fan the update out to subscribers. Closed
    /// receivers are dropped from the subscription list.
    pub fn set_price(&self, symbol: &str, price: f64) {
        self.prices.insert(symbol.to_string(), price);
        let update = PriceUpdate {
            symbol: symbol.to_string(),
            price,
            timestamp: Utc::now(),
        };
        if let Some(mut senders) = self.subscribers.get_mut(symbol) {
            senders.retain(|sender| sender.try_send(update.clone()).is_ok());
        }
    }

    /// Nudge every tracked price by a small random percentage. Driven from
    /// the CLI loop to make paper trading move.
    pub fn step_random_walk(&self, max_step_pct: f64) {
        if max_step_pct <= 0.0 {
            return;
        }
        let mut rng = rand::thread_rng();
        let symbols: Vec<String> = self.prices.iter().map(|e| e.key().clone()).collect();
        for symbol in symbols {
            if let Some(price) = self.prices.get(&symbol).map(|e| *e.value()) {
                let drift = rng.gen_range(-max_step_pct..max_step_pct);
                self.set_price(&symbol, (price * (1.0 + drift)).max(f64::MIN_POSITIVE));
            }
        }
    }

    fn current_price(&self, symbol: &str) -> Result<f64, TradingError> {
        self.prices
            .get(symbol)
            .map(|entry| *entry.value())
            .ok_or_else(|| TradingError::Transient(format!("no price for {}", symbol)))
    }
}

#[async_trait]
impl Broker for PaperBroker {
    fn name(&self) -> &str {
        "paper"
    }

    async fn connect(&self) -> Result<(), TradingError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TradingError> {
        self.connected.store(false, Ordering::SeqCst);
        self.subscribers.clear();
        Ok(())
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderResponse, TradingError> {
        if request.quantity <= 0.0 {
            return Err(TradingError::Validation("non-positive quantity".to_string()));
        }
        let market = self.current_price(&request.symbol)?;
        let fill_price = request.limit_price.unwrap_or(market);
        let notional = fill_price * request.quantity;
        let fee = notional * self.fee_pct;

        {
            let mut balance = self.quote_balance.write().await;
            match request.side {
                SignalDirection::Buy => {
                    let cost = notional + fee;
                    if *balance < cost {
                        return Err(TradingError::Execution(format!(
                            "insufficient balance {:.2} for cost {:.2}",
                            *balance, cost
                        )));
                    }
                    *balance -= cost;
                }
                SignalDirection::Sell => {
                    *balance += notional - fee;
                }
            }
        }

        let delta = match request.side {
            SignalDirection::Buy => request.quantity,
            SignalDirection::Sell => -request.quantity,
        };
        *self
            .positions
            .entry(request.symbol.clone())
            .or_insert(0.0) += delta;

        let response = OrderResponse {
            order_id: uuid::Uuid::new_v4().to_string(),
            symbol: request.symbol.clone(),
            side: request.side,
            quantity: request.quantity,
            fill_price,
            status: OrderStatus::Filled,
        };
        self.orders
            .insert(response.order_id.clone(), response.clone());
        Ok(response)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), TradingError> {
        // Fills are instant, so there is never anything left to cancel.
        if self.orders.contains_key(order_id) {
            Ok(())
        } else {
            Err(TradingError::Validation(format!(
                "unknown order {}",
                order_id
            )))
        }
    }

    async fn get_order_status(&self, order_id: &str) -> Result<OrderStatus, TradingError> {
        self.orders
            .get(order_id)
            .map(|order| order.status)
            .ok_or_else(|| TradingError::Validation(format!("unknown order {}", order_id)))
    }

    async fn get_balances(&self) -> Result<Vec<Balance>, TradingError> {
        let free = *self.quote_balance.read().await;
        Ok(vec![Balance {
            asset: QUOTE_ASSET.to_string(),
            free,
            locked: 0.0,
            total: free,
        }])
    }

    async fn get_positions(&self) -> Result<HashMap<String, f64>, TradingError> {
        Ok(self
            .positions
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect())
    }

    async fn get_price(&self, symbol: &str) -> Result<f64, TradingError> {
        self.current_price(symbol)
    }

    async fn subscribe_prices(
        &self,
        symbol: &str,
    ) -> Result<mpsc::Receiver<PriceUpdate>, TradingError> {
        let (tx, rx) = mpsc::channel(PRICE_CHANNEL_CAPACITY);
        self.subscribers
            .entry(symbol.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn unsubscribe(&self, symbol: &str) -> Result<(), TradingError> {
        self.subscribers.remove(symbol);
        Ok(())
    }

    async fn get_symbol_info(&self, symbol: &str) -> Result<SymbolInfo, TradingError> {
        Ok(SymbolInfo {
            symbol: symbol.to_string(),
            min_qty: 0.000001,
            step_size: 0.000001,
            tick_size: 0.01,
            min_notional: 5.0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn buy_fill_debits_balance_and_books_position() {
        let broker = PaperBroker::new(10_000.0, 0.001);
        broker.set_price("BTCUSDT", 100.0);

        let response = broker
            .place_order(&OrderRequest {
                symbol: "BTCUSDT".to_string(),
                side: SignalDirection::Buy,
                quantity: 2.0,
                limit_price: None,
            })
            .await
            .unwrap();
        assert_eq!(response.status, OrderStatus::Filled);
        assert!((response.fill_price - 100.0).abs() < 1e-9);

        let balances = broker.get_balances().await.unwrap();
        // 10000 - 200 notional - 0.2 fee
        assert!((balances[0].free - 9_799.8).abs() < 1e-9);

        let positions = broker.get_positions().await.unwrap();
        assert!((positions["BTCUSDT"] - 2.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn rejects_buy_beyond_balance() {
        let broker = PaperBroker::new(100.0, 0.0);
        broker.set_price("BTCUSDT", 100.0);

        let result = broker
            .place_order(&OrderRequest {
                symbol: "BTCUSDT".to_string(),
                side: SignalDirection::Buy,
                quantity: 2.0,
                limit_price: None,
            })
            .await;
        assert!(matches!(result, Err(TradingError::Execution(_))));
    }

    #[tokio::test]
    async fn subscribers_receive_price_updates() {
        let broker = PaperBroker::new(1_000.0, 0.0);
        let mut rx = broker.subscribe_prices("ETHUSDT").await.unwrap();

        broker.set_price("ETHUSDT", 2_000.0);
        let update = rx.recv().await.unwrap();
        assert_eq!(update.symbol, "ETHUSDT");
        assert!((update.price - 2_000.0).abs() < 1e-9);

        broker.unsubscribe("ETHUSDT").await.unwrap();
        broker.set_price("ETHUSDT", 2_100.0);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn missing_price_is_a_transient_error() {
        let broker = PaperBroker::new(1_000.0, 0.0);
        assert!(matches!(
            broker.get_price("DOGEUSDT").await,
            Err(TradingError::Transient(_))
        ));
    }
}
