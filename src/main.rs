use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use clap::{Parser, Subcommand};
use log::info;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tradekit::backtest::{run_backtest, BacktestConfig};
use tradekit::broker::Broker;
use tradekit::engine::{EngineConfig, LiveEngine};
use tradekit::models::Candle;
use tradekit::paper::PaperBroker;
use tradekit::risk::RiskConfig;
use tradekit::store::MemoryStore;
use tradekit::strategy::{create_strategy, StrategyKind};

#[derive(Parser)]
#[command(name = "tradekit", about = "Strategy-driven trading engine and backtester")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the live engine against the simulated paper broker.
    Run {
        /// Symbols to trade, comma separated.
        #[arg(long, default_value = "BTCUSDT,ETHUSDT")]
        symbols: String,
        /// Strategy kinds to attach to every symbol, comma separated.
        #[arg(long, default_value = "momentum,mean_reversion")]
        strategies: String,
        #[arg(long, default_value_t = 10_000.0)]
        balance: f64,
        /// Paper broker fee per fill, as a fraction of notional.
        #[arg(long, default_value_t = 0.001)]
        fee_pct: f64,
        /// Starting price assigned to each symbol's random walk.
        #[arg(long, default_value_t = 100.0)]
        start_price: f64,
        #[arg(long, default_value_t = 5)]
        ingest_secs: u64,
        #[arg(long, default_value_t = 10)]
        monitor_secs: u64,
    },
    /// Replay historical candles from a CSV file through one strategy.
    Backtest {
        /// CSV with timestamp,open,high,low,close,volume rows.
        #[arg(long)]
        file: PathBuf,
        #[arg(long, default_value = "momentum")]
        strategy: String,
        #[arg(long, default_value = "BTCUSDT")]
        symbol: String,
        /// RFC3339; defaults to the first candle in the file.
        #[arg(long)]
        start_date: Option<DateTime<Utc>>,
        /// RFC3339; defaults to the last candle in the file.
        #[arg(long)]
        end_date: Option<DateTime<Utc>>,
        #[arg(long, default_value_t = 10_000.0)]
        balance: f64,
        #[arg(long, default_value_t = 0.001)]
        commission_pct: f64,
        #[arg(long, default_value_t = 0.0005)]
        slippage_pct: f64,
        #[arg(long, default_value_t = 3)]
        max_positions: usize,
        #[arg(long, default_value_t = 0.01)]
        risk_per_trade: f64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            symbols,
            strategies,
            balance,
            fee_pct,
            start_price,
            ingest_secs,
            monitor_secs,
        } => {
            run_paper(
                &symbols,
                &strategies,
                balance,
                fee_pct,
                start_price,
                ingest_secs,
                monitor_secs,
            )
            .await
        }
        Command::Backtest {
            file,
            strategy,
            symbol,
            start_date,
            end_date,
            balance,
            commission_pct,
            slippage_pct,
            max_positions,
            risk_per_trade,
        } => {
            let candles = load_candles(&file, &symbol)?;
            let start = start_date
                .or_else(|| candles.first().map(|c| c.timestamp))
                .unwrap_or_else(|| Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap());
            let end = end_date
                .or_else(|| candles.last().map(|c| c.timestamp))
                .unwrap_or_else(Utc::now);
            let config = BacktestConfig {
                start_date: start,
                end_date: end,
                initial_balance: balance,
                commission_pct,
                slippage_pct,
                max_positions,
                risk_per_trade,
                symbols: vec![symbol.clone()],
            };
            let kind: StrategyKind = strategy.parse()?;
            let mut strategy =
                create_strategy(kind, &format!("bt-{}", kind.as_str()), &symbol, HashMap::new());
            let report = run_backtest(strategy.as_mut(), &config, &candles)?;

            let perf = &report.performance;
            info!("backtest finished: {} trades", perf.total_trades);
            info!(
                "win rate {:.1}%  net pnl {:.2}  fees {:.2}",
                perf.win_rate * 100.0,
                perf.net_pnl,
                perf.total_fees
            );
            info!(
                "max drawdown {:.2} ({:.2}%)  sharpe {:.2}  profit factor {:.2}",
                perf.max_drawdown,
                perf.max_drawdown_pct * 100.0,
                perf.sharpe_ratio,
                perf.profit_factor
            );
            for (month, ret) in &report.monthly_returns {
                info!("{}: {:+.2}%", month, ret * 100.0);
            }
            Ok(())
        }
    }
}

async fn run_paper(
    symbols: &str,
    strategies: &str,
    balance: f64,
    fee_pct: f64,
    start_price: f64,
    ingest_secs: u64,
    monitor_secs: u64,
) -> Result<()> {
    let symbols: Vec<String> = symbols
        .split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect();
    let kinds: Vec<StrategyKind> = strategies
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|s| s.parse())
        .collect::<Result<_>>()?;

    let paper = Arc::new(PaperBroker::new(balance, fee_pct));
    paper.connect().await?;
    for symbol in &symbols {
        paper.set_price(symbol, start_price);
    }

    let store = Arc::new(MemoryStore::new());
    let mut brokers: HashMap<String, Arc<dyn Broker>> = HashMap::new();
    brokers.insert("paper".to_string(), paper.clone());
    let routing = symbols
        .iter()
        .map(|s| (s.clone(), "paper".to_string()))
        .collect();

    let engine = LiveEngine::new(
        brokers,
        store,
        EngineConfig {
            symbols: symbols.clone(),
            routing,
            risk: RiskConfig::default(),
            ingestion_interval_secs: ingest_secs,
            monitoring_interval_secs: monitor_secs,
        },
    );

    for symbol in &symbols {
        for kind in &kinds {
            let id = format!("{}-{}", kind.as_str(), symbol.to_lowercase());
            engine
                .add_strategy(create_strategy(*kind, &id, symbol, HashMap::new()))
                .await;
        }
    }

    engine.start().await.context("engine failed to start")?;
    info!("paper trading {} with {} strategies; ctrl-c to stop", symbols.join(", "), kinds.len());

    let walker = paper.clone();
    let walk = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;
            walker.step_random_walk(0.002);
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    walk.abort();
    engine.stop().await;
    paper.disconnect().await?;
    Ok(())
}

#[derive(Debug, serde::Deserialize)]
struct CsvRow {
    timestamp: String,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

/// Load candles from CSV, accepting RFC3339 or unix-second timestamps.
fn load_candles(path: &PathBuf, symbol: &str) -> Result<Vec<Candle>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("cannot open {}", path.display()))?;
    let mut candles = Vec::new();
    for row in reader.deserialize() {
        let row: CsvRow = row.context("malformed candle row")?;
        let timestamp = parse_timestamp(&row.timestamp)
            .with_context(|| format!("bad timestamp '{}'", row.timestamp))?;
        candles.push(Candle {
            symbol: symbol.to_string(),
            timestamp,
            open: row.open,
            high: row.high,
            low: row.low,
            close: row.close,
            volume: row.volume,
            source: "csv".to_string(),
        });
    }
    candles.sort_by_key(|c| c.timestamp);
    info!("loaded {} candles from {}", candles.len(), path.display());
    Ok(candles)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(ts) = raw.parse::<DateTime<Utc>>() {
        return Ok(ts);
    }
    let seconds: i64 = raw.parse().context("neither RFC3339 nor unix seconds")?;
    Utc.timestamp_opt(seconds, 0)
        .single()
        .context("unix timestamp out of range")
}
