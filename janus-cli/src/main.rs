use anyhow::{Context, Result};
use chrono::{TimeDelta, Utc};
use clap::{Parser, Subcommand};
use janus_broker::{BrokerBuilder, QueryReply, QueryRequest};
use janus_config::{AppConfig, MatcherKind, RunMode, StrategyConfig};
use janus_core::{Bar, Contract, ContractBook, Interval, Order, OrderType, Side};
use janus_risk::{MaxNotionalCheck, MaxPositionCheck, RiskSupervisor};
use janus_sim::{BacktestRunner, CrossMatcher, MarketEvent, Matcher, SimExchange, SimpleMatcher};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(author, version, about = "Janus trading engine")]
struct Cli {
    /// Configuration directory.
    #[arg(long, default_value = "config")]
    config: PathBuf,
    /// Environment overlay merged on top of default.toml.
    #[arg(long)]
    env: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Replay synthetic bars through the simulated venue, working a TWAP
    /// parent order across them.
    Backtest {
        #[arg(long, default_value = "BTCUSDT")]
        symbol: String,
        #[arg(long, default_value_t = 240)]
        bars: usize,
        #[arg(long, default_value = "1")]
        volume: Decimal,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = janus_config::load_config_from(&cli.config, cli.env.as_deref())?;
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone()))
        .init();
    if config.mode == RunMode::Live {
        anyhow::bail!("mode = \"live\" requires a venue connector; only backtest is wired up");
    }

    match cli.command {
        Command::Backtest {
            symbol,
            bars,
            volume,
        } => run_backtest(config, symbol, bars, volume).await,
    }
}

async fn run_backtest(
    config: AppConfig,
    symbol: String,
    bars: usize,
    volume: Decimal,
) -> Result<()> {
    let strategy = config
        .strategies
        .first()
        .context("no strategies configured")?;
    let contracts = contracts_for(&symbol, strategy);

    let mut builder = BrokerBuilder::new(contracts.clone())
        .strategy(&strategy.strategy_id, &strategy.accounting_unit)
        .worker_pool(config.broker.worker_pool)
        .snapshot_minutes(config.broker.snapshot_minutes)
        .inline_dispatch(true);
    for (asset, amount) in &strategy.positions {
        builder = builder.deposit(&strategy.strategy_id, asset, *amount);
    }
    if let Some(limit) = config.risk.max_order_notional {
        builder = builder.check(Box::new(MaxNotionalCheck { limit }));
    }
    if let Some(limit) = config.risk.max_position_notional {
        builder = builder.check(Box::new(MaxPositionCheck { limit }));
    }
    builder = builder.supervisor(RiskSupervisor::new(
        config.risk.drawdown_limit,
        config.risk.position_stop_loss,
    ));

    let matcher: Box<dyn Matcher> = match config.matcher.kind {
        MatcherKind::Simple => Box::new(SimpleMatcher::new(
            contracts,
            config.matcher.slippage,
            config.matcher.fee_rate,
        )),
        MatcherKind::Cross => Box::new(CrossMatcher::new(contracts, config.matcher.fee_rate)),
    };
    let sim = Arc::new(SimExchange::new(matcher, builder.event_sender()));
    let broker = builder
        .adapter(
            sim.clone(),
            config.broker.rate_limit_permits,
            Duration::from_secs(config.broker.rate_limit_window_secs),
        )
        .build();
    let handle = broker.handle();

    let feed = synth_bars(&symbol, bars);
    let mut parent = Order::new(
        "sim",
        &strategy.strategy_id,
        symbol.as_str(),
        Side::Buy,
        OrderType::Twap,
        Decimal::from(50_000),
        volume,
    );
    parent.params.insert(
        "execute_times".into(),
        serde_json::Value::Number(8.into()),
    );
    parent.params.insert(
        "execute_interval".into(),
        serde_json::Value::Number(60.into()),
    );
    let parent_id = parent.client_order_id.clone();
    handle
        .send_order(parent)
        .context("broker unavailable before replay")?;

    let mut broker = BacktestRunner::new(broker, sim).run(feed).await;

    let pnl = handle.query(QueryRequest::Pnl {
        strategy_id: strategy.strategy_id.clone(),
    });
    let (reply, ()) = tokio::join!(pnl, broker.run_until_idle());
    if let Ok(QueryReply::Pnl(Some(pnl))) = reply {
        println!(
            "Backtest complete for {symbol} (parent {parent_id}): realized={} unrealized={} asset_value={}",
            pnl.realized, pnl.unrealized, pnl.asset_value
        );
    } else {
        println!("Backtest complete for {symbol}, no portfolio to report");
    }
    Ok(())
}

fn contracts_for(symbol: &str, strategy: &StrategyConfig) -> Arc<ContractBook> {
    let quote = strategy.accounting_unit.as_str();
    let universe = std::iter::once(symbol).chain(strategy.universe.iter().map(String::as_str));
    let mut seen = Vec::new();
    let mut book = Vec::new();
    for sym in universe {
        if seen.contains(&sym) {
            continue;
        }
        seen.push(sym);
        let base = sym.strip_suffix(quote).unwrap_or(sym);
        book.push(Contract::spot(sym, base, quote));
    }
    ContractBook::shared(book)
}

/// Deterministic minute bars oscillating around 50k, oldest first.
fn synth_bars(symbol: &str, len: usize) -> Vec<MarketEvent> {
    let mut feed = Vec::with_capacity(len);
    let start = Utc::now() - TimeDelta::minutes(len as i64);
    for i in 0..len {
        let base = 50_000.0 + (i as f64 / 10.0).sin() * 500.0;
        let open = base + (i % 3) as f64 * 10.0;
        let close = open + (i % 5) as f64 * 5.0 - 10.0;
        let to_dec = |v: f64| Decimal::from_f64(v).unwrap_or_default().round_dp(2);
        feed.push(MarketEvent::Bar(Bar {
            exchange: "sim".into(),
            symbol: symbol.into(),
            interval: Interval::OneMinute,
            open: to_dec(open),
            high: to_dec(open.max(close) + 20.0),
            low: to_dec(open.min(close) - 20.0),
            close: to_dec(close),
            volume: Decimal::ONE,
            timestamp: start + TimeDelta::minutes(i as i64),
        }));
    }
    feed
}
