use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ledger::models::{SettlementRecord, SettlementStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayoutState {
    /// Nothing was owed
    Cleared,
    /// The full balance is on the payout queue
    Queued,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PayoutResponse {
    pub validator_id: Uuid,
    pub status: PayoutState,
    pub message: String,
    /// Lamports moved to the queue
    pub amount: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Uuid>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BalanceResponse {
    pub validator_id: Uuid,
    pub public_key: String,
    pub pending_lamports: i64,
    pub pending_sol: Decimal,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SettlementView {
    pub id: Uuid,
    pub request_id: Uuid,
    pub amount: i64,
    pub status: SettlementStatus,
    pub tx_ref: Option<String>,
    pub error_message: Option<String>,
    pub compensated: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl From<SettlementRecord> for SettlementView {
    fn from(record: SettlementRecord) -> Self {
        Self {
            id: record.id,
            request_id: record.request_id,
            amount: record.amount,
            status: record.status,
            tx_ref: record.tx_ref,
            error_message: record.error_message,
            compensated: record.compensated,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SettlementHistoryResponse {
    pub validator_id: Uuid,
    pub settlements: Vec<SettlementView>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub queue_connected: bool,
    pub settlement_worker: bool,
}
