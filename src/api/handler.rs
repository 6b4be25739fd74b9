use std::sync::Arc;

use axum::{
    extract::{Path, State},
    Json,
};
use tracing::info;
use uuid::Uuid;

use super::models::*;
use crate::{
    error::{AppError, AppResult},
    ledger::{models::lamports_to_sol, LedgerStore},
    settlement::{SettlementPublisher, SettlementTicket},
};

#[derive(Clone)]
pub struct ApiState {
    pub ledger: Arc<dyn LedgerStore>,
    pub publisher: Arc<dyn SettlementPublisher>,
    /// Whether the broker connection is currently up
    pub queue_health: Arc<dyn Fn() -> bool + Send + Sync>,
    pub worker_enabled: bool,
}

/// Move a validator's whole pending credit onto the payout queue
pub async fn request_payout(
    State(state): State<ApiState>,
    Path(validator_id): Path<Uuid>,
) -> AppResult<Json<PayoutResponse>> {
    info!("💰 Payout requested for validator {}", validator_id);

    let ticket = state
        .ledger
        .request_settlement(validator_id, state.publisher.as_ref())
        .await?;

    let response = match ticket {
        SettlementTicket::Cleared => PayoutResponse {
            validator_id,
            status: PayoutState::Cleared,
            message: "All payment cleared".to_string(),
            amount: 0,
            request_id: None,
        },
        SettlementTicket::Queued(request) => PayoutResponse {
            validator_id,
            status: PayoutState::Queued,
            message: "Payout queued successfully".to_string(),
            amount: request.amount,
            request_id: request.request_id,
        },
    };

    Ok(Json(response))
}

pub async fn get_balance(
    State(state): State<ApiState>,
    Path(validator_id): Path<Uuid>,
) -> AppResult<Json<BalanceResponse>> {
    let validator = state
        .ledger
        .get_validator(validator_id)
        .await?
        .ok_or(AppError::ValidatorNotFound(validator_id))?;

    Ok(Json(BalanceResponse {
        validator_id,
        pending_sol: lamports_to_sol(validator.pending_credit),
        pending_lamports: validator.pending_credit,
        public_key: validator.public_key,
    }))
}

pub async fn list_settlements(
    State(state): State<ApiState>,
    Path(validator_id): Path<Uuid>,
) -> AppResult<Json<SettlementHistoryResponse>> {
    if state.ledger.get_validator(validator_id).await?.is_none() {
        return Err(AppError::ValidatorNotFound(validator_id));
    }

    let settlements = state
        .ledger
        .settlements_for(validator_id)
        .await?
        .into_iter()
        .map(SettlementView::from)
        .collect();

    Ok(Json(SettlementHistoryResponse {
        validator_id,
        settlements,
    }))
}

pub async fn health_check(State(state): State<ApiState>) -> Json<HealthResponse> {
    let queue_connected = (state.queue_health)();
    Json(HealthResponse {
        status: if queue_connected { "healthy" } else { "degraded" }.to_string(),
        queue_connected,
        settlement_worker: state.worker_enabled,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ledger::{
            models::{NewTick, TickStatus},
            MemoryLedger,
        },
        server::create_api_app,
        settlement::MemoryQueue,
    };
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
        Router,
    };
    use tower::ServiceExt;

    struct Harness {
        app: Router,
        ledger: Arc<MemoryLedger>,
        queue: Arc<MemoryQueue>,
    }

    fn harness() -> Harness {
        let ledger = Arc::new(MemoryLedger::new());
        let queue = Arc::new(MemoryQueue::new());
        let state = ApiState {
            ledger: ledger.clone(),
            publisher: queue.clone(),
            queue_health: Arc::new(|| true),
            worker_enabled: false,
        };
        Harness {
            app: create_api_app(state),
            ledger,
            queue,
        }
    }

    async fn call(app: &Router, method: &str, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    async fn funded_validator(ledger: &MemoryLedger, credit: i64) -> Uuid {
        let validator = ledger.upsert_validator("PK1", "ip").await.unwrap();
        ledger
            .record_tick(
                NewTick {
                    target_id: Uuid::new_v4(),
                    validator_id: validator.id,
                    status: TickStatus::Good,
                    latency_ms: 10.0,
                },
                credit,
            )
            .await
            .unwrap();
        validator.id
    }

    #[tokio::test]
    async fn test_payout_queues_full_balance_once() {
        let h = harness();
        let validator_id = funded_validator(&h.ledger, 1_500).await;
        let uri = format!("/api/v1/payout/{}", validator_id);

        let (status, body) = call(&h.app, "POST", &uri).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "queued");
        assert_eq!(body["amount"], 1_500);
        assert_eq!(h.queue.len(), 1);

        let (status, body) = call(&h.app, "POST", &uri).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "cleared");
        assert_eq!(body["message"], "All payment cleared");
        assert_eq!(h.queue.len(), 1);
    }

    #[tokio::test]
    async fn test_payout_for_unknown_validator_is_404() {
        let h = harness();
        let (status, body) = call(
            &h.app,
            "POST",
            &format!("/api/v1/payout/{}", Uuid::new_v4()),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error_code"], "VALIDATOR_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_balance_reports_lamports_and_sol() {
        let h = harness();
        let validator_id = funded_validator(&h.ledger, 1_500).await;

        let (status, body) = call(
            &h.app,
            "GET",
            &format!("/api/v1/validator/{}/balance", validator_id),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["pending_lamports"], 1_500);
        assert!((body["pending_sol"].as_f64().unwrap() - 0.0000015).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_settlement_history_lists_records() {
        let h = harness();
        let validator_id = funded_validator(&h.ledger, 300).await;
        call(&h.app, "POST", &format!("/api/v1/payout/{}", validator_id)).await;

        let payload = h.queue.pop().unwrap();
        let request: crate::settlement::SettlementRequest =
            serde_json::from_slice(&payload).unwrap();
        h.ledger.begin_settlement(&request).await.unwrap();

        let (status, body) = call(
            &h.app,
            "GET",
            &format!("/api/v1/validator/{}/settlements", validator_id),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let settlements = body["settlements"].as_array().unwrap();
        assert_eq!(settlements.len(), 1);
        assert_eq!(settlements[0]["status"], "processing");
        assert_eq!(settlements[0]["amount"], 300);
    }

    #[tokio::test]
    async fn test_health_reports_queue_state() {
        let h = harness();
        let (status, body) = call(&h.app, "GET", "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["settlement_worker"], false);
    }
}
