use std::sync::Arc;

use sentinel_hub::{
    api::ApiState,
    bootstrap::{init_tracing, initialize_database},
    config::{self, ApiConfig},
    ledger::{LedgerRepository, LedgerStore},
    server,
    settlement::{RabbitQueue, SettlementWorker, SolanaTransfer},
};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing("info,tower_http=debug,sentinel_hub=debug");
    info!("🚀 Starting ledger API");

    let config: ApiConfig = config::load()?;
    let pool = initialize_database(&config.database_url).await?;
    let ledger: Arc<dyn LedgerStore> = Arc::new(LedgerRepository::new(pool));
    let queue = Arc::new(RabbitQueue::connect(&config.rabbitmq_url, &config.payout_queue).await?);

    let worker_enabled = match config.platform_private_key.as_deref() {
        Some(secret) => {
            let transfer = Arc::new(SolanaTransfer::from_base58(&config.solana_rpc_url, secret)?);
            let worker = Arc::new(SettlementWorker::new(
                ledger.clone(),
                transfer,
                config.worker_config(),
            ));
            let consumer = queue.clone();
            tokio::spawn(async move {
                if let Err(e) = consumer.consume(worker).await {
                    error!("❌ Settlement worker stopped: {}", e);
                }
            });
            true
        }
        None => {
            warn!("⚠️  PLATFORM_PRIVATE_KEY not set - settlement worker disabled");
            false
        }
    };

    let health_queue = queue.clone();
    let state = ApiState {
        ledger,
        publisher: queue,
        queue_health: Arc::new(move || health_queue.is_connected()),
        worker_enabled,
    };

    let app = server::create_api_app(state);
    server::run_server(app, &config.bind_address).await?;

    Ok(())
}
