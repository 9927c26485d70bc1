use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use revertbot::config::BotConfig;
use revertbot::engine::{needs_refresh_timer, refresh_timer, Alert, EngineCommand, TradingEngine};
use revertbot::execution::FeedSupervisor;
use revertbot::models::TradeRecord;
use revertbot::PaperExchange;
use rust_decimal::Decimal;
use tokio::sync::{mpsc, watch};

#[derive(Parser, Debug)]
#[command(name = "revertbot")]
#[command(about = "Mean-reversion trading bot running against a paper exchange")]
struct Args {
    /// TOML configuration file (defaults to ./revertbot.toml if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Seed for the simulated price path
    #[arg(long)]
    seed: Option<u64>,

    /// Starting quote balance of the paper account
    #[arg(long)]
    balance: Option<Decimal>,

    /// Where to write the trade journal on shutdown
    #[arg(long, default_value = "trades.json")]
    trade_log: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let args = Args::parse();
    let mut config = BotConfig::load(args.config.as_deref())
        .map_err(|e| anyhow::anyhow!(e))
        .context("Failed to load configuration")?;
    if let Some(seed) = args.seed {
        config.paper.seed = seed;
    }
    if let Some(balance) = args.balance {
        config.paper.starting_balance = balance;
    }

    tracing::info!("🚀 revertbot starting on {} (paper)", config.symbol);
    log_configuration(&config);

    let exchange = Arc::new(PaperExchange::new(&config.paper, config.quote_asset.clone()));
    let (alert_tx, alert_rx) = mpsc::unbounded_channel();
    let engine = TradingEngine::connect(&config, exchange.clone())
        .await
        .context("Failed to initialize trading engine")?
        .with_alerts(alert_tx);

    let (command_tx, command_rx) = mpsc::channel(config.feed.channel_capacity);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let engine_task = tokio::spawn(engine.run(command_rx, shutdown_rx.clone()));

    let feed_task = {
        let supervisor = FeedSupervisor::new(exchange.clone(), config.symbol.clone(), &config.feed);
        tokio::spawn(supervisor.run(command_tx.clone(), shutdown_rx.clone()))
    };

    let refresh_task = needs_refresh_timer(&config).then(|| {
        tokio::spawn(refresh_timer(
            config.indicator.refresh_interval(),
            command_tx.clone(),
            shutdown_rx.clone(),
        ))
    });

    let alert_task = tokio::spawn(alert_logger(alert_rx));
    std::thread::spawn(move || operator_console(command_tx));

    tracing::info!("✅ Engine, feed and alert tasks spawned");
    tracing::info!("Type 'clear' + Enter to clear a trading halt, Ctrl+C to stop\n");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    tracing::info!("⚠️  Received Ctrl+C, shutting down...");
    let _ = shutdown_tx.send(true);

    let stats = feed_task.await.context("Feed task panicked")?;
    tracing::info!(
        "Feed: {} subscriptions, {} events, {} reconnects",
        stats.subscriptions,
        stats.events_delivered,
        stats.reconnects
    );
    if let Some(task) = refresh_task {
        task.await.context("Refresh timer panicked")?;
    }

    let engine = engine_task.await.context("Engine task panicked")?;
    write_trade_log(&args.trade_log, engine.trade_log())?;

    let position = engine.positions().position();
    if !position.is_flat() {
        tracing::warn!(
            "Stopped with an open {:?} position of {} (not closed on shutdown)",
            position.side,
            position.quantity
        );
    }

    drop(engine);
    alert_task.await.context("Alert task panicked")?;

    tracing::info!("👋 revertbot stopped");
    Ok(())
}

fn setup_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("revertbot=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn log_configuration(config: &BotConfig) {
    tracing::info!("\n📊 Configuration:");
    tracing::info!("  Window: {} ({:?})", config.indicator.window_length, config.indicator.refresh_mode);
    tracing::info!("  Signal source: {:?}", config.indicator.signal_source);
    tracing::info!("  Entry threshold: {}%", config.strategy.threshold_pct);
    tracing::info!("  Stop loss: {}%", config.strategy.stop_loss_pct);
    tracing::info!("  Profit target: {:?}", config.strategy.profit_target);
    tracing::info!("  Risk per trade: {}%", config.risk.risk_per_trade_pct);
    tracing::info!("  Cooldown: {} samples", config.risk.cooldown_samples);
    tracing::info!("  Paper balance: {} {}", config.paper.starting_balance, config.quote_asset);
}

async fn alert_logger(mut alerts: mpsc::UnboundedReceiver<Alert>) {
    while let Some(alert) = alerts.recv().await {
        match alert {
            Alert::FatalExposureMismatch {
                direction,
                executed,
                remaining,
            } => tracing::error!(
                "🚨 OPERATOR ACTION REQUIRED: {} exit executed {}, {} still open on the exchange. \
                 Flatten it manually, then type 'clear'.",
                direction,
                executed,
                remaining
            ),
        }
    }
}

/// Read operator commands from stdin
///
/// Runs on a plain thread so a pending read never holds up runtime shutdown.
fn operator_console(commands: mpsc::Sender<EngineCommand>) {
    for line in std::io::stdin().lock().lines() {
        let Ok(line) = line else { break };
        match line.trim() {
            "clear" => {
                if commands.blocking_send(EngineCommand::ClearHalt).is_err() {
                    break;
                }
            }
            "" => {}
            other => tracing::warn!("Unknown command '{}'", other),
        }
    }
}

fn write_trade_log(path: &Path, trades: &[TradeRecord]) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(trades).context("Failed to serialize trade log")?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write trade log to {}", path.display()))?;
    tracing::info!("📝 {} trade records written to {}", trades.len(), path.display());
    Ok(())
}
