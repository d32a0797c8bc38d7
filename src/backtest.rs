use crate::indicators::IndicatorWindow;
use crate::models::{
    Candle, CloseReason, MarketContext, SignalDirection, Trade, TradeStatus, TrendLabel,
};
use crate::performance::{monthly_returns, PerformanceCalculator, PerformanceSummary};
use crate::risk::{position_size, MIN_SIGNAL_STRENGTH};
use crate::strategy::Strategy;
use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const MIN_TRADING_BALANCE: f64 = 100.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestConfig {
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub initial_balance: f64,
    pub commission_pct: f64,
    pub slippage_pct: f64,
    pub max_positions: usize,
    pub risk_per_trade: f64,
    pub symbols: Vec<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EquityPoint {
    pub timestamp: DateTime<Utc>,
    pub balance: f64,
    /// Peak-to-current decline as a fraction of the peak.
    pub drawdown: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BacktestReport {
    pub trades: Vec<Trade>,
    pub performance: PerformanceSummary,
    pub equity: Vec<EquityPoint>,
    pub monthly_returns: BTreeMap<String, f64>,
}

/// Fill price with slippage applied against the trader.
fn slipped(price: f64, side: SignalDirection, entering: bool, slippage_pct: f64) -> f64 {
    // Entering a buy (or exiting a sell) pays up; the mirror cases receive less.
    let adverse_up = match (side, entering) {
        (SignalDirection::Buy, true) | (SignalDirection::Sell, false) => true,
        (SignalDirection::Sell, true) | (SignalDirection::Buy, false) => false,
    };
    if adverse_up {
        price * (1.0 + slippage_pct)
    } else {
        price * (1.0 - slippage_pct)
    }
}

/// Synchronous single-pass replay of historical candles through one strategy.
/// Deterministic: identical candles and config always produce an identical
/// trade list and equity curve.
pub fn run_backtest(
    strategy: &mut dyn Strategy,
    config: &BacktestConfig,
    candles: &[Candle],
) -> Result<BacktestReport> {
    if config.initial_balance <= 0.0 {
        bail!("initial balance must be positive");
    }
    if config.end_date <= config.start_date {
        bail!("end date must be after start date");
    }

    let mut feed: Vec<Candle> = candles
        .iter()
        .filter(|c| c.timestamp >= config.start_date && c.timestamp <= config.end_date)
        .filter(|c| config.symbols.is_empty() || config.symbols.contains(&c.symbol))
        .cloned()
        .collect();
    feed.sort_by_key(|c| c.timestamp);

    let mut balance = config.initial_balance;
    let mut peak = config.initial_balance;
    let mut open: BTreeMap<String, Trade> = BTreeMap::new();
    let mut closed: Vec<Trade> = Vec::new();
    let mut equity: Vec<EquityPoint> = Vec::with_capacity(feed.len());
    let mut windows: BTreeMap<String, IndicatorWindow> = BTreeMap::new();
    let mut last_price: BTreeMap<String, (f64, DateTime<Utc>)> = BTreeMap::new();
    let mut next_trade_seq = 0u64;

    for candle in &feed {
        let price = candle.close;
        let ts = candle.timestamp;
        last_price.insert(candle.symbol.clone(), (price, ts));

        let window = windows.entry(candle.symbol.clone()).or_default();
        window.push(candle.clone());
        if candle.symbol == strategy.symbol() {
            strategy.on_market_data(candle);
        }

        // Exits first, using the levels the signal itself carried.
        if let Some(position) = open.get(&candle.symbol) {
            let reason = exit_reason(position, price);
            if let Some(reason) = reason {
                let position = open.remove(&candle.symbol).unwrap();
                let trade = settle(position, price, ts, reason, config);
                balance += trade.pnl.unwrap_or(0.0);
                closed.push(trade);
            }
        }

        // New-signal evaluation under the simulator's admission gates.
        if candle.symbol == strategy.symbol()
            && window.len() >= strategy.warmup()
            && balance >= MIN_TRADING_BALANCE
            && open.len() < config.max_positions
            && !open.contains_key(&candle.symbol)
        {
            let context = market_context(window, price, candle.volume, ts);
            if let Some(signal) = strategy.analyze(&context) {
                if signal.strength >= MIN_SIGNAL_STRENGTH {
                    let quantity =
                        position_size(balance, price, signal.stop_loss, config.risk_per_trade)
                            * signal.size_factor;
                    if quantity > 0.0 {
                        let entry_fill =
                            slipped(price, signal.direction, true, config.slippage_pct);
                        let entry_fee = entry_fill * quantity * config.commission_pct;
                        next_trade_seq += 1;
                        let trade = Trade {
                            id: format!("bt-{}", next_trade_seq),
                            strategy_id: strategy.id().to_string(),
                            symbol: candle.symbol.clone(),
                            side: signal.direction,
                            entry_price: entry_fill,
                            quantity,
                            stop_loss: signal.stop_loss,
                            take_profit: signal.take_profit,
                            status: TradeStatus::Open,
                            fees: entry_fee,
                            entry_time: ts,
                            exit_price: None,
                            exit_time: None,
                            pnl: None,
                            close_reason: None,
                            broker: "backtest".to_string(),
                            metadata: serde_json::Value::Null,
                        };
                        debug!(
                            "backtest opened {} {} {:.6} @ {:.4}",
                            trade.side, trade.symbol, trade.quantity, trade.entry_price
                        );
                        open.insert(candle.symbol.clone(), trade);
                        strategy.on_trade(&signal, true);
                    }
                }
            }
        }

        peak = peak.max(balance);
        let drawdown = if peak > 0.0 { (peak - balance) / peak } else { 0.0 };
        equity.push(EquityPoint {
            timestamp: ts,
            balance,
            drawdown,
        });
    }

    // Anything still open is force-closed at the last seen price.
    for (symbol, position) in std::mem::take(&mut open) {
        let Some(&(price, ts)) = last_price.get(&symbol) else {
            continue;
        };
        let trade = settle(position, price, ts, CloseReason::EndOfTest, config);
        balance += trade.pnl.unwrap_or(0.0);
        closed.push(trade);
    }
    if let Some(last) = equity.last_mut() {
        peak = peak.max(balance);
        last.balance = balance;
        last.drawdown = if peak > 0.0 { (peak - balance) / peak } else { 0.0 };
    }

    let performance = PerformanceCalculator::summarize(&closed, &equity);
    let monthly = monthly_returns(&closed, config.initial_balance);
    Ok(BacktestReport {
        trades: closed,
        performance,
        equity,
        monthly_returns: monthly,
    })
}

fn exit_reason(position: &Trade, price: f64) -> Option<CloseReason> {
    match position.side {
        SignalDirection::Buy => {
            if position.stop_loss.is_some_and(|stop| price <= stop) {
                Some(CloseReason::StopLoss)
            } else if position.take_profit.is_some_and(|tp| price >= tp) {
                Some(CloseReason::TakeProfit)
            } else {
                None
            }
        }
        SignalDirection::Sell => {
            if position.stop_loss.is_some_and(|stop| price >= stop) {
                Some(CloseReason::StopLoss)
            } else if position.take_profit.is_some_and(|tp| price <= tp) {
                Some(CloseReason::TakeProfit)
            } else {
                None
            }
        }
    }
}

/// Close a simulated position at `price`, applying slippage and the exit-side
/// commission.
fn settle(
    mut position: Trade,
    price: f64,
    ts: DateTime<Utc>,
    reason: CloseReason,
    config: &BacktestConfig,
) -> Trade {
    let exit_fill = slipped(price, position.side, false, config.slippage_pct);
    let exit_fee = exit_fill * position.quantity * config.commission_pct;
    position.close(exit_fill, ts, reason, exit_fee);
    position
}

fn market_context(
    window: &IndicatorWindow,
    price: f64,
    volume: f64,
    ts: DateTime<Utc>,
) -> MarketContext {
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
    MarketContext {
        price,
        volume,
        volatility,
        trend,
        sentiment: None,
        timestamp: ts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TradeSignal;
    use crate::strategy::{build_signal, StrategyKind};
    use chrono::{Duration, TimeZone};

    /// Emits a buy with fixed levels whenever no better reason not to;
    /// admission gates keep it to one position at a time.
    struct FixedLevelStrategy {
        stop_loss: f64,
        take_profit: f64,
    }

    impl Strategy for FixedLevelStrategy {
        fn id(&self) -> &str {
            "fixed"
        }

        fn kind(&self) -> StrategyKind {
            StrategyKind::Momentum
        }

        fn symbol(&self) -> &str {
            "BTCUSDT"
        }

        fn on_market_data(&mut self, _candle: &Candle) {}

        fn analyze(&self, context: &MarketContext) -> Option<TradeSignal> {
            Some(build_signal(
                "fixed",
                "BTCUSDT",
                SignalDirection::Buy,
                0.9,
                context.price * 1.05,
                Some(self.stop_loss),
                Some(self.take_profit),
                "fixed levels".to_string(),
            ))
        }

        fn warmup(&self) -> usize {
            0
        }
    }

    fn candles(closes: &[f64]) -> Vec<Candle> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| Candle {
                symbol: "BTCUSDT".to_string(),
                timestamp: start + Duration::minutes(i as i64),
                open: close,
                high: close + 0.5,
                low: close - 0.5,
                close,
                volume: 100.0,
                source: "csv".to_string(),
            })
            .collect()
    }

    fn config() -> BacktestConfig {
        BacktestConfig {
            start_date: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            end_date: Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap(),
            initial_balance: 10_000.0,
            commission_pct: 0.001,
            slippage_pct: 0.001,
            max_positions: 3,
            risk_per_trade: 0.01,
            symbols: vec!["BTCUSDT".to_string()],
        }
    }

    #[test]
    fn take_profit_exit_applies_slippage_and_commission_both_ways() {
        let mut strategy = FixedLevelStrategy {
            stop_loss: 95.0,
            take_profit: 105.0,
        };
        let feed = candles(&[100.0, 101.0, 106.0]);
        let report = run_backtest(&mut strategy, &config(), &feed).unwrap();

        // The take-profit exit, plus a re-entry on the same tick that is
        // force-closed at end of test.
        assert_eq!(report.trades.len(), 2);
        let trade = &report.trades[0];
        assert_eq!(trade.close_reason, Some(CloseReason::TakeProfit));
        assert_eq!(report.trades[1].close_reason, Some(CloseReason::EndOfTest));

        // Entry pays up, exit receives less; commission on both notionals.
        let entry_fill = 100.0 * 1.001;
        let exit_fill = 106.0 * 0.999;
        assert!((trade.entry_price - entry_fill).abs() < 1e-9);
        assert!((trade.exit_price.unwrap() - exit_fill).abs() < 1e-9);
        let expected_fees =
            entry_fill * trade.quantity * 0.001 + exit_fill * trade.quantity * 0.001;
        assert!((trade.fees - expected_fees).abs() < 1e-9);
        let expected_pnl = (exit_fill - entry_fill) * trade.quantity - expected_fees;
        assert!((trade.pnl.unwrap() - expected_pnl).abs() < 1e-9);
    }

    #[test]
    fn stop_loss_exit_and_balance_update() {
        let mut strategy = FixedLevelStrategy {
            stop_loss: 95.0,
            take_profit: 110.0,
        };
        let feed = candles(&[100.0, 98.0, 94.0, 96.0]);
        let report = run_backtest(&mut strategy, &config(), &feed).unwrap();

        let stops: Vec<_> = report
            .trades
            .iter()
            .filter(|t| t.close_reason == Some(CloseReason::StopLoss))
            .collect();
        assert!(!stops.is_empty());
        assert!(stops[0].pnl.unwrap() < 0.0);
        let final_balance = report.equity.last().unwrap().balance;
        let realized: f64 = report.trades.iter().filter_map(|t| t.pnl).sum();
        assert!((final_balance - (10_000.0 + realized)).abs() < 1e-6);
    }

    #[test]
    fn open_positions_forced_closed_at_end_of_test() {
        let mut strategy = FixedLevelStrategy {
            stop_loss: 50.0,
            take_profit: 200.0,
        };
        let feed = candles(&[100.0, 100.5, 101.0]);
        let report = run_backtest(&mut strategy, &config(), &feed).unwrap();

        assert_eq!(report.trades.len(), 1);
        assert_eq!(report.trades[0].close_reason, Some(CloseReason::EndOfTest));
        assert!(report.trades[0].exit_time.is_some());
    }

    #[test]
    fn low_balance_blocks_trading() {
        let mut strategy = FixedLevelStrategy {
            stop_loss: 95.0,
            take_profit: 105.0,
        };
        let feed = candles(&[100.0, 101.0, 106.0]);
        let mut config = config();
        config.initial_balance = 50.0;
        let report = run_backtest(&mut strategy, &config, &feed).unwrap();
        assert!(report.trades.is_empty());
    }

    #[test]
    fn repeated_runs_are_identical() {
        let closes: Vec<f64> = (0..300)
            .map(|i| 100.0 + (i as f64 * 0.7).sin() * 5.0 + i as f64 * 0.01)
            .collect();
        let feed = candles(&closes);

        let mut first_strategy = FixedLevelStrategy {
            stop_loss: 98.0,
            take_profit: 104.0,
        };
        let first = run_backtest(&mut first_strategy, &config(), &feed).unwrap();
        let mut second_strategy = FixedLevelStrategy {
            stop_loss: 98.0,
            take_profit: 104.0,
        };
        let second = run_backtest(&mut second_strategy, &config(), &feed).unwrap();

        assert!(!first.trades.is_empty());
        assert_eq!(
            serde_json::to_string(&first.trades).unwrap(),
            serde_json::to_string(&second.trades).unwrap()
        );
        assert_eq!(
            serde_json::to_string(&first.equity).unwrap(),
            serde_json::to_string(&second.equity).unwrap()
        );
    }
}
