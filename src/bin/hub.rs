use std::sync::Arc;

use sentinel_hub::{
    bootstrap::{init_tracing, initialize_database},
    config::{self, HubConfig},
    hub::Hub,
    ledger::{LedgerRepository, LedgerStore},
    server,
    signature::Ed25519Verifier,
};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing("info,tower_http=debug,sentinel_hub=debug");
    info!("🚀 Starting validator hub");

    let config: HubConfig = config::load()?;
    let pool = initialize_database(&config.database_url).await?;
    let ledger: Arc<dyn LedgerStore> = Arc::new(LedgerRepository::new(pool));

    let hub = Arc::new(Hub::new(ledger, Arc::new(Ed25519Verifier), &config));
    tokio::spawn(hub.clone().run_dispatch_loop(config.tick_interval()));
    tokio::spawn(hub.clone().run_sweeper(config.sweep_interval()));

    let app = server::create_hub_app(hub);
    server::run_server(app, &config.hub_bind_address).await?;

    Ok(())
}
