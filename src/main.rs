use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::Parser;

use lipmaker::{bot, config::Settings, sim, store::SqliteStore};

#[derive(Debug, Parser)]
#[command(name = "lipmaker", version)]
struct Cli {
    /// Discovery and risk scoring only; never places orders.
    #[arg(long)]
    scan_only: bool,

    /// Execution venue (paper only in this build).
    #[arg(long, default_value = "paper")]
    mode: String,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    if cli.mode.to_lowercase() != "paper" {
        return Err(anyhow!(
            "this build is paper-only; run with --mode paper (got {})",
            cli.mode
        ));
    }

    let settings = Settings::load()?;
    let store = SqliteStore::new(&settings.sqlite_path)?;
    store.init_db()?;

    log::info!(
        "app.start mode={} scan_only={} dt={}s max_markets={} sqlite={}",
        cli.mode,
        cli.scan_only,
        settings.dt_secs,
        settings.max_markets_with_orders,
        store.path()
    );

    let exchange = Arc::new(sim::PaperExchange::new(24));
    tokio::spawn(sim::run_paper_driver(exchange.clone()));

    bot::run(settings, store, exchange, cli.scan_only).await
}
