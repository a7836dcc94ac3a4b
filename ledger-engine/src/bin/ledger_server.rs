//! Ledger server binary
//!
//! `ledger-server` runs the background reconciler until Ctrl-C.
//! `ledger-server reconcile` runs one batch reconciliation and prints the
//! summary as JSON.
//!
//! Configuration comes from the TOML file named by `LEDGER_CONFIG`, or from
//! `LEDGER_*` environment variables when it is unset.

use anyhow::Context;
use ledger_engine::{Config, Ledger};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = load_config()?;
    let command = std::env::args().nth(1);

    match command.as_deref() {
        None | Some("serve") => serve(config).await,
        Some("reconcile") => reconcile_once(config).await,
        Some(other) => {
            anyhow::bail!("Unknown command {:?}, expected `serve` or `reconcile`", other)
        }
    }
}

fn load_config() -> anyhow::Result<Config> {
    match std::env::var("LEDGER_CONFIG") {
        Ok(path) => Config::from_file(&path)
            .with_context(|| format!("Failed to load config from {}", path)),
        Err(_) => Config::from_env().context("Failed to load config from environment"),
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    tracing::info!(
        service = %config.service_name,
        interval_secs = config.reconciler.interval_secs,
        auto_correct = config.reconciler.auto_correct,
        "Starting ledger server"
    );

    let ledger = Ledger::open(config).await.context("Failed to open ledger")?;

    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down ledger server");
    ledger.shutdown().await?;
    Ok(())
}

async fn reconcile_once(mut config: Config) -> anyhow::Result<()> {
    // One pass only, no background schedule
    config.reconciler.enabled = false;
    let ledger = Ledger::open(config).await.context("Failed to open ledger")?;

    let summary = ledger.reconcile_all().await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);

    ledger.shutdown().await?;

    if summary.drifted_accounts > 0 || !summary.unpaired_transfers.is_empty() {
        std::process::exit(2);
    }
    Ok(())
}
