use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use ladderbot::api::{BackpackRestClient, PaperExchange, WsConnector};
use ladderbot::execution::CycleController;
use ladderbot::{Settings, TracingObserver};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

/// DCA buy ladder with take-profit exit
#[derive(Parser, Debug)]
#[command(name = "ladderbot", version)]
struct Args {
    /// TOML config file (defaults to ./ladderbot.toml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Stop after the first take profit instead of starting a new cycle
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let args = Args::parse();
    let mut settings =
        Settings::load(args.config.as_deref()).context("Failed to load configuration")?;
    if args.once {
        settings.actions.restart_after_take_profit = false;
    }

    let instrument = settings.instrument();
    tracing::info!("🚀 LadderBot starting for {}", instrument.symbol());
    tracing::info!(
        "   Budget ${:.2} over {} orders, max drop {}%, take profit {}%",
        settings.trading.total_budget,
        settings.trading.order_count,
        settings.trading.max_drop_pct,
        settings.trading.take_profit_pct
    );
    tracing::info!(
        "   Paper account: ${:.2} {}",
        settings.exchange.paper_quote_balance,
        instrument.quote_asset
    );

    let market = BackpackRestClient::new(
        &settings.exchange.rest_url,
        settings.exchange.requests_per_second,
    )
    .context("Failed to build REST client")?;
    let exchange = Arc::new(PaperExchange::with_market(
        instrument,
        settings.exchange.paper_quote_balance,
        market,
    ));
    let connector = Arc::new(WsConnector::new(settings.exchange.ws_url.clone()));

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("⚠️  Received Ctrl+C, shutting down...");
            let _ = shutdown_tx.send(());
        }
    });

    let mut controller =
        CycleController::new(settings, exchange, connector, Arc::new(TracingObserver));
    let summary = controller.run(shutdown_rx).await;

    tracing::info!(
        "✅ Finished after {} cycle(s), {} take profit(s)",
        summary.cycles,
        summary.take_profits
    );
    Ok(())
}

fn setup_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ladderbot=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
