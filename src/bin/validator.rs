use sentinel_hub::{
    agent::ValidatorAgent,
    bootstrap::init_tracing,
    config::{self, AgentConfig},
};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing("info,sentinel_hub=debug");

    let config: AgentConfig = config::load()?;
    let agent = ValidatorAgent::from_config(config)?;
    info!("🛰️  Validator {} starting", agent.public_key());

    tokio::select! {
        result = agent.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    Ok(())
}
