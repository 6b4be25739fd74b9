use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::{
    api::handler::{get_balance, health_check, list_settlements, request_payout, ApiState},
    error::AppResult,
    hub::{
        socket::{hub_health, validator_socket},
        Hub,
    },
};

/// Validator-facing router: the duplex socket plus a health probe
pub fn create_hub_app(hub: Arc<Hub>) -> Router {
    info!("⚙️ Setting up hub routes...");

    Router::new()
        .route("/", get(validator_socket))
        .route("/ws", get(validator_socket))
        .route("/health", get(hub_health))
        .layer(TraceLayer::new_for_http())
        .with_state(hub)
}

/// Ledger API router
pub fn create_api_app(state: ApiState) -> Router {
    info!("⚙️ Setting up HTTP routes...");

    Router::new()
        .route("/health", get(health_check))
        .nest(
            "/api/v1",
            Router::new()
                .route("/payout/:validator_id", post(request_payout))
                .route("/validator/:validator_id/balance", get(get_balance))
                .route("/validator/:validator_id/settlements", get(list_settlements)),
        )
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::very_permissive()),
        )
        .with_state(state)
}

pub async fn run_server(app: Router, bind_address: &str) -> AppResult<()> {
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    info!("🌐 Server listening on: {}", bind_address);

    axum::serve(listener, app).await?;
    Ok(())
}
