use crate::backtest::EquityPoint;
use crate::models::Trade;
use serde::Serialize;
use statrs::statistics::Statistics;
use std::collections::BTreeMap;

const TRADING_DAYS_PER_YEAR: f64 = 252.0;

#[derive(Debug, Clone, Default, Serialize)]
pub struct PerformanceSummary {
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
    pub gross_profit: f64,
    pub gross_loss: f64,
    pub net_pnl: f64,
    pub total_fees: f64,
    pub profit_factor: f64,
    pub max_drawdown: f64,
    pub max_drawdown_pct: f64,
    pub sharpe_ratio: f64,
    pub average_win: f64,
    pub average_loss: f64,
    pub largest_win: f64,
    pub largest_loss: f64,
    pub longest_win_streak: usize,
    pub longest_loss_streak: usize,
}

/// Aggregates closed trades and an equity curve into summary statistics.
pub struct PerformanceCalculator;

impl PerformanceCalculator {
    pub fn summarize(trades: &[Trade], equity: &[EquityPoint]) -> PerformanceSummary {
        let pnls: Vec<f64> = trades.iter().filter_map(|t| t.pnl).collect();
        let wins: Vec<f64> = pnls.iter().copied().filter(|p| *p > 0.0).collect();
        let losses: Vec<f64> = pnls.iter().copied().filter(|p| *p < 0.0).collect();

        let gross_profit: f64 = wins.iter().sum();
        let gross_loss: f64 = losses.iter().sum::<f64>().abs();
        let net_pnl: f64 = pnls.iter().sum();
        let total_fees: f64 = trades.iter().map(|t| t.fees).sum();

        let profit_factor = if gross_loss > 0.0 {
            gross_profit / gross_loss
        } else if gross_profit > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };

        let (max_drawdown, max_drawdown_pct) = drawdown_extremes(equity);
        let (longest_win_streak, longest_loss_streak) = streaks(&pnls);

        PerformanceSummary {
            total_trades: pnls.len(),
            winning_trades: wins.len(),
            losing_trades: losses.len(),
            win_rate: if pnls.is_empty() {
                0.0
            } else {
                wins.len() as f64 / pnls.len() as f64
            },
            gross_profit,
            gross_loss,
            net_pnl,
            total_fees,
            profit_factor,
            max_drawdown,
            max_drawdown_pct,
            sharpe_ratio: sharpe_ratio(equity),
            average_win: mean_or_zero(&wins),
            average_loss: mean_or_zero(&losses),
            largest_win: wins.iter().copied().fold(0.0, f64::max),
            largest_loss: losses.iter().copied().fold(0.0, f64::min),
            longest_win_streak,
            longest_loss_streak,
        }
    }
}

fn mean_or_zero(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Annualized Sharpe ratio over per-tick balance returns.
fn sharpe_ratio(equity: &[EquityPoint]) -> f64 {
    if equity.len() < 3 {
        return 0.0;
    }
    let mut returns = Vec::with_capacity(equity.len() - 1);
    for pair in equity.windows(2) {
        if pair[0].balance > 0.0 {
            returns.push((pair[1].balance - pair[0].balance) / pair[0].balance);
        }
    }
    if returns.len() < 2 {
        return 0.0;
    }
    let mean = returns.iter().mean();
    let std_dev = returns.iter().std_dev();
    if std_dev <= 0.0 || !std_dev.is_finite() {
        return 0.0;
    }
    mean / std_dev * TRADING_DAYS_PER_YEAR.sqrt()
}

fn drawdown_extremes(equity: &[EquityPoint]) -> (f64, f64) {
    let mut peak = f64::NEG_INFINITY;
    let mut max_abs = 0.0f64;
    let mut max_pct = 0.0f64;
    for point in equity {
        peak = peak.max(point.balance);
        if peak > 0.0 {
            let abs = peak - point.balance;
            max_abs = max_abs.max(abs);
            max_pct = max_pct.max(abs / peak);
        }
    }
    (max_abs, max_pct)
}

fn streaks(pnls: &[f64]) -> (usize, usize) {
    let mut longest_win = 0usize;
    let mut longest_loss = 0usize;
    let mut win_run = 0usize;
    let mut loss_run = 0usize;
    for &pnl in pnls {
        if pnl > 0.0 {
            win_run += 1;
            loss_run = 0;
        } else if pnl < 0.0 {
            loss_run += 1;
            win_run = 0;
        } else {
            win_run = 0;
            loss_run = 0;
        }
        longest_win = longest_win.max(win_run);
        longest_loss = longest_loss.max(loss_run);
    }
    (longest_win, longest_loss)
}

/// Realized PnL bucketed by exit month, as a fraction of the initial balance.
pub fn monthly_returns(trades: &[Trade], initial_balance: f64) -> BTreeMap<String, f64> {
    let mut buckets: BTreeMap<String, f64> = BTreeMap::new();
    if initial_balance <= 0.0 {
        return buckets;
    }
    for trade in trades {
        let (Some(exit_time), Some(pnl)) = (trade.exit_time, trade.pnl) else {
            continue;
        };
        let key = exit_time.format("%Y-%m").to_string();
        *buckets.entry(key).or_insert(0.0) += pnl / initial_balance;
    }
    buckets
}
