use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// Where the candle came from, e.g. "live", "csv", "paper".
    pub source: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SignalDirection {
    Buy,
    Sell,
}

impl SignalDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalDirection::Buy => "buy",
            SignalDirection::Sell => "sell",
        }
    }

    pub fn opposite(&self) -> SignalDirection {
        match self {
            SignalDirection::Buy => SignalDirection::Sell,
            SignalDirection::Sell => SignalDirection::Buy,
        }
    }
}

impl fmt::Display for SignalDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignalDirection {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "buy" => Ok(SignalDirection::Buy),
            "sell" => Ok(SignalDirection::Sell),
            other => Err(anyhow!("Unknown signal direction '{}'", other)),
        }
    }
}

/// A strategy's recommendation to open a position. Consumed at most once by
/// the engine; `executed` guards against re-triggering on the same object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeSignal {
    pub id: String,
    pub strategy_id: String,
    pub symbol: String,
    pub direction: SignalDirection,
    /// Confidence in [0, 1].
    pub strength: f64,
    pub price_target: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub reasoning: String,
    /// Multiplier in (0, 1] applied to the risk-derived position size.
    /// Adaptive strategies use it to scale exposure by prediction confidence.
    #[serde(default = "default_size_factor")]
    pub size_factor: f64,
    pub executed: bool,
}

fn default_size_factor() -> f64 {
    1.0
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TradeStatus {
    Open,
    Closed,
    Cancelled,
}

impl TradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::Open => "open",
            TradeStatus::Closed => "closed",
            TradeStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CloseReason {
    StopLoss,
    TakeProfit,
    Manual,
    EndOfTest,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::StopLoss => "stop_loss",
            CloseReason::TakeProfit => "take_profit",
            CloseReason::Manual => "manual",
            CloseReason::EndOfTest => "end_of_test",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: String,
    pub strategy_id: String,
    pub symbol: String,
    pub side: SignalDirection,
    pub entry_price: f64,
    pub quantity: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub status: TradeStatus,
    /// Total fees accumulated over the trade lifetime (entry + exit).
    pub fees: f64,
    pub entry_time: DateTime<Utc>,
    pub exit_price: Option<f64>,
    pub exit_time: Option<DateTime<Utc>>,
    pub pnl: Option<f64>,
    pub close_reason: Option<CloseReason>,
    /// Which broker executed the trade, e.g. "paper".
    pub broker: String,
    #[serde(default)]
    pub metadata: Value,
}

impl Trade {
    /// Realized PnL for an exit at `exit_price`, net of `total_fees`.
    /// Buy: (exit - entry) * qty - fees. Sell: (entry - exit) * qty - fees.
    pub fn realized_pnl(&self, exit_price: f64, total_fees: f64) -> f64 {
        let gross = match self.side {
            SignalDirection::Buy => (exit_price - self.entry_price) * self.quantity,
            SignalDirection::Sell => (self.entry_price - exit_price) * self.quantity,
        };
        gross - total_fees
    }

    /// Transition to Closed, setting exit fields and realized PnL.
    /// `exit_fees` is added to the accumulated fee total first.
    pub fn close(
        &mut self,
        exit_price: f64,
        exit_time: DateTime<Utc>,
        reason: CloseReason,
        exit_fees: f64,
    ) {
        self.fees += exit_fees;
        self.status = TradeStatus::Closed;
        self.exit_price = Some(exit_price);
        self.exit_time = Some(exit_time);
        self.close_reason = Some(reason);
        self.pnl = Some(self.realized_pnl(exit_price, self.fees));
    }

    pub fn is_open(&self) -> bool {
        self.status == TradeStatus::Open
    }

    pub fn notional(&self) -> f64 {
        (self.entry_price * self.quantity).abs()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TrendLabel {
    Bullish,
    Bearish,
    Neutral,
}

impl TrendLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrendLabel::Bullish => "bullish",
            TrendLabel::Bearish => "bearish",
            TrendLabel::Neutral => "neutral",
        }
    }
}

/// Externally supplied market snapshot handed to `Strategy::analyze`.
#[derive(Debug, Clone)]
pub struct MarketContext {
    pub price: f64,
    pub volume: f64,
    pub volatility: f64,
    pub trend: TrendLabel,
    pub sentiment: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: SignalDirection,
    pub quantity: f64,
    /// None places a market order.
    pub limit_price: Option<f64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderStatus {
    Pending,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResponse {
    pub order_id: String,
    pub symbol: String,
    pub side: SignalDirection,
    pub quantity: f64,
    pub fill_price: f64,
    pub status: OrderStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Balance {
    pub asset: String,
    pub free: f64,
    pub locked: f64,
    pub total: f64,
}

/// Exchange granularity constraints for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub symbol: String,
    pub min_qty: f64,
    pub step_size: f64,
    pub tick_size: f64,
    pub min_notional: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceUpdate {
    pub symbol: String,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
}

pub fn generate_signal_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn generate_trade_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
