use crate::models::{Trade, TradeSignal};
use crate::strategy::StrategyKind;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const MIN_SIGNAL_STRENGTH: f64 = 0.6;
/// Smallest notional worth placing after exposure shrinking, in quote units.
pub const MIN_VIABLE_NOTIONAL: f64 = 5.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Realized losses beyond this trip the daily breaker.
    pub max_daily_loss: f64,
    pub cooldown_secs: i64,
    pub max_concurrent_trades: usize,
    /// Fraction of balance risked per trade, e.g. 0.01.
    pub risk_per_trade: f64,
    /// Optional cap on per-symbol notional as a fraction of balance.
    pub exposure_budget_pct: Option<f64>,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_daily_loss: 100.0,
            cooldown_secs: 300,
            max_concurrent_trades: 5,
            risk_per_trade: 0.01,
            exposure_budget_pct: Some(0.25),
        }
    }
}

impl RiskConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::seconds(self.cooldown_secs.max(0))
    }
}

/// Mutable engine bookkeeping shared by the ingestion and monitoring ticks.
/// Held behind a single lock; all mutation goes through these methods.
#[derive(Debug, Default)]
pub struct EngineState {
    daily_pnl: f64,
    daily_pnl_date: Option<NaiveDate>,
    pub last_trade_time: Option<DateTime<Utc>>,
    /// Open positions keyed by trade id.
    pub active: HashMap<String, Trade>,
}

impl EngineState {
    /// Realized daily PnL, resetting when the UTC calendar date has rolled
    /// over since the last observation.
    pub fn daily_pnl(&mut self, now: DateTime<Utc>) -> f64 {
        let today = now.date_naive();
        if self.daily_pnl_date != Some(today) {
            self.daily_pnl = 0.0;
            self.daily_pnl_date = Some(today);
        }
        self.daily_pnl
    }

    pub fn record_realized_pnl(&mut self, now: DateTime<Utc>, pnl: f64) {
        // Touch first so a rollover zeroes before accumulating.
        self.daily_pnl(now);
        self.daily_pnl += pnl;
    }

    pub fn open_symbol(&self, symbol: &str) -> bool {
        self.active.values().any(|trade| trade.symbol == symbol)
    }

    pub fn symbol_exposure(&self, symbol: &str) -> f64 {
        self.active
            .values()
            .filter(|trade| trade.symbol == symbol)
            .map(|trade| trade.notional())
            .sum()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AdmissionDecision {
    Accept { quantity: f64 },
    Reject { reason: String },
}

impl AdmissionDecision {
    pub fn is_accepted(&self) -> bool {
        matches!(self, AdmissionDecision::Accept { .. })
    }

    fn reject(reason: impl Into<String>) -> Self {
        AdmissionDecision::Reject {
            reason: reason.into(),
        }
    }
}

/// Risk-based size, always capped at 10% of balance notional.
pub fn position_size(balance: f64, price: f64, stop_loss: Option<f64>, risk_per_trade: f64) -> f64 {
    if balance <= 0.0 || price <= 0.0 {
        return 0.0;
    }
    let risk_amount = balance * risk_per_trade;
    let stop = stop_loss.unwrap_or(price * 0.98);
    let mut stop_distance = (price - stop).abs();
    if stop_distance <= 0.0 {
        stop_distance = price * 0.02;
    }
    (risk_amount / stop_distance).min(balance * 0.1 / price)
}

/// The admission pipeline, applied in order before any order is placed.
/// `open_kinds` lists the strategy kinds currently holding open positions.
#[allow(clippy::too_many_arguments)]
pub fn admit_signal(
    config: &RiskConfig,
    state: &mut EngineState,
    signal: &TradeSignal,
    signal_kind: StrategyKind,
    open_kinds: &[StrategyKind],
    price: f64,
    balance: f64,
    now: DateTime<Utc>,
) -> AdmissionDecision {
    if state.daily_pnl(now) < -config.max_daily_loss {
        return AdmissionDecision::reject("daily loss breaker tripped");
    }

    if let Some(last) = state.last_trade_time {
        if now - last < config.cooldown() {
            return AdmissionDecision::reject("cooldown in effect");
        }
    }

    if signal.strength < MIN_SIGNAL_STRENGTH {
        return AdmissionDecision::reject(format!(
            "strength {:.2} below floor {:.2}",
            signal.strength, MIN_SIGNAL_STRENGTH
        ));
    }

    if state.active.len() >= config.max_concurrent_trades {
        return AdmissionDecision::reject("concurrent trade cap reached");
    }

    if state.open_symbol(&signal.symbol) {
        return AdmissionDecision::reject(format!("{} already has an open position", signal.symbol));
    }

    // Regime conflict: reversion trades stand down while a trend follower
    // holds a position.
    if signal_kind == StrategyKind::MeanReversion
        && open_kinds.iter().any(|kind| kind.is_trend_following())
    {
        return AdmissionDecision::reject("trend-following position blocks mean reversion");
    }

    let mut quantity =
        position_size(balance, price, signal.stop_loss, config.risk_per_trade) * signal.size_factor;
    if quantity <= 0.0 {
        return AdmissionDecision::reject("computed size is zero");
    }

    if let Some(budget_pct) = config.exposure_budget_pct {
        let budget = balance * budget_pct;
        let existing = state.symbol_exposure(&signal.symbol);
        let planned = quantity * price;
        if existing + planned > budget {
            let allowed = budget - existing;
            if allowed < MIN_VIABLE_NOTIONAL {
                return AdmissionDecision::reject(format!(
                    "exposure budget exhausted for {} ({:.2} left)",
                    signal.symbol, allowed
                ));
            }
            quantity = allowed / price;
        }
    }

    if quantity * price < MIN_VIABLE_NOTIONAL {
        return AdmissionDecision::reject("notional below minimum viable size");
    }

    AdmissionDecision::Accept { quantity }
}
