//! RankBot - consensus pricing and symbol ranking across spot exchanges
//!
//! Startup: config → logging → exchange registry → journal → engine.
//! Ctrl+C flips the shutdown channel; the engine finishes its current
//! symbol and exits.

use std::process::ExitCode;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, warn};

use rankbot::config::AppConfig;
use rankbot::engine::TradingEngine;
use rankbot::exchange::ExchangeRegistry;
use rankbot::logging;
use rankbot::persistence::{CsvJournal, NullJournal, TradeJournal};

#[tokio::main]
async fn main() -> ExitCode {
    let config = match AppConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    logging::init(&config.logging);
    info!(config = %config.digest(), "RankBot starting");

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{:#}", e), "RankBot exited with error");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: AppConfig) -> anyhow::Result<()> {
    let registry = ExchangeRegistry::new(&config.exchanges, config.bot.paper_trading)
        .with_taker_fee(config.risk.taker_fee)
        .with_paper_balance(&config.bot.quote_currency, config.risk.initial_capital);
    registry.initialize();

    let statuses = registry.probe_all().await;
    for status in &statuses {
        if status.reachable {
            info!(exchange = %status.name, "Exchange reachable");
        } else {
            warn!(exchange = %status.name, "Exchange unreachable at startup");
        }
    }

    if registry.list_available().is_empty() {
        anyhow::bail!(
            "none of the configured exchanges are reachable: {:?}",
            config.exchanges.enabled
        );
    }
    let registry = Arc::new(registry);

    let journal: Arc<dyn TradeJournal> = if config.persistence.csv_enabled {
        let journal = CsvJournal::new(&config.persistence.data_dir)?;
        info!(dir = %journal.data_dir().display(), "CSV journal enabled");
        Arc::new(journal)
    } else {
        info!("CSV journal disabled");
        Arc::new(NullJournal)
    };

    let engine = TradingEngine::new(&config, registry, journal)?;
    let handle = engine.handle();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut engine_task = tokio::spawn(engine.run(shutdown_rx));

    tokio::select! {
        result = &mut engine_task => {
            return match result {
                Ok(outcome) => outcome,
                Err(e) => Err(anyhow::anyhow!("engine task failed: {}", e)),
            };
        }
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!(error = %e, "Failed to listen for Ctrl+C, shutting down");
            } else {
                info!("Received Ctrl+C, initiating shutdown");
            }
        }
    }

    let _ = shutdown_tx.send(true);
    match engine_task.await {
        Ok(outcome) => outcome?,
        Err(e) => warn!(error = %e, "Engine task ended abnormally"),
    }

    let portfolio = handle.portfolio();
    info!(
        total_value = format!("{:.2}", portfolio.total_value),
        realised_pnl = format!("{:.2}", portfolio.realised_pnl),
        open_positions = portfolio.open_positions,
        "Shutdown complete"
    );
    Ok(())
}
