use anyhow::{bail, Context};
use clap::Parser;
use kestrel::cli::{Cli, Commands};
use kestrel::config::{AccountConfig, AppConfig};
use kestrel::coordinator::{build_orchestrator, Orchestrator};
use kestrel::domain::Account;
use kestrel::error::Result;
use kestrel::exchange::{ExchangeClient, PaperExchange};
use kestrel::logging::{init_logging, init_logging_simple};
use kestrel::strategy::IdleSignalSource;
use std::path::Path;
use std::sync::Arc;
use tokio::signal;
use tokio::time::Duration;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            paper,
            status_every,
        } => run(&config, paper, status_every).await,
        Commands::Check { config } => {
            init_logging_simple();
            check(&config)
        }
    }
}

fn load_validated(dir: &Path) -> anyhow::Result<AppConfig> {
    let config = AppConfig::load_from(dir)
        .with_context(|| format!("loading configuration from {}", dir.display()))?;
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("  ✗ {}", e);
        }
        bail!("{} configuration problem(s) in {}", errors.len(), dir.display());
    }
    Ok(config)
}

fn check(dir: &Path) -> anyhow::Result<()> {
    let config = load_validated(dir)?;
    println!("Configuration OK ({})", dir.display());
    println!(
        "  cap {} positions, {} liquidation cycles, safety buffer {}",
        config.cap.max_positions, config.cap.max_cycles, config.capital.safety_buffer_pct
    );
    for account in &config.accounts {
        println!("  {:<16} {:<7} on {}", account.id, account.role.to_string(), account.exchange);
    }
    Ok(())
}

fn paper_client(quote_asset: String) -> impl Fn(&AccountConfig, &Account) -> Result<Arc<dyn ExchangeClient>> + Send + Sync {
    move |cfg: &AccountConfig, account: &Account| {
        let exchange = PaperExchange::new(account.exchange.clone())
            .with_quote_asset(quote_asset.clone())
            .with_balance(&quote_asset, cfg.paper_quote_balance);
        Ok(Arc::new(exchange) as Arc<dyn ExchangeClient>)
    }
}

async fn run(dir: &Path, paper: bool, status_every: u64) -> anyhow::Result<()> {
    let config = load_validated(dir)?;
    let _log_guard = init_logging(&config.logging);

    if !paper {
        // Live connectors are supplied by embedding the library
        bail!("no live exchange connector is built into this binary; run with --paper");
    }

    let factory = paper_client(config.cap.quote_asset.clone());
    let orchestrator =
        build_orchestrator(&config, &factory, Arc::new(IdleSignalSource), paper)
            .await
            .context("starting account loops")?;

    info!("Kestrel running; press Ctrl-C to stop");
    wait_for_shutdown(&orchestrator, status_every).await;

    orchestrator.shutdown().await;
    info!("Kestrel stopped");
    Ok(())
}

async fn wait_for_shutdown(orchestrator: &Orchestrator, status_every: u64) {
    let period = Duration::from_secs(status_every.max(1));
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;

    loop {
        tokio::select! {
            result = signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("Failed to listen for Ctrl-C: {}", e);
                }
                info!("Shutdown requested");
                return;
            }
            _ = ticker.tick(), if status_every > 0 => {
                log_statuses(orchestrator).await;
            }
        }
    }
}

async fn log_statuses(orchestrator: &Orchestrator) {
    for status in orchestrator.statuses().await {
        match &status.last_error {
            Some(e) if !status.is_running() => warn!(
                "[{}] {} ({}): {}",
                status.account_id, status.state, e.class, e.message
            ),
            _ => info!(
                "[{}] {} cycles={} skipped={} orders={}",
                status.account_id,
                status.state,
                status.cycles_completed,
                status.cycles_skipped,
                status.orders_submitted
            ),
        }
    }

    if let Some(record) = orchestrator.halt().record() {
        warn!("Trading halted since {}: {}", record.triggered_at, record.reason);
    }
}
