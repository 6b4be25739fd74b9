// Payout pipeline: ledger -> queue -> worker -> Solana
pub mod queue;
pub mod transfer;
pub mod worker;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use queue::{MemoryQueue, RabbitQueue, SettlementPublisher};
pub use transfer::{SolanaTransfer, SubmittedTransfer, TransferClient, TransferStatus};
pub use worker::{Disposition, SettlementWorker, WorkerConfig};

/// Message placed on the payout queue.
///
/// `request_id` is absent on messages produced by older publishers; those are
/// settled without redelivery protection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementRequest {
    pub validator_id: Uuid,
    /// Lamports
    pub amount: i64,
    pub public_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Uuid>,
}

impl SettlementRequest {
    pub fn new(validator_id: Uuid, amount: i64, public_key: String) -> Self {
        Self {
            validator_id,
            amount,
            public_key,
            request_id: Some(Uuid::new_v4()),
        }
    }
}

/// What a payout request did to the ledger
#[derive(Debug, Clone)]
pub enum SettlementTicket {
    /// Nothing owed
    Cleared,
    /// Full balance moved onto the queue
    Queued(SettlementRequest),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_format() {
        let request = SettlementRequest::new(Uuid::nil(), 1_500, "PK1".to_string());
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["validator_id"], Uuid::nil().to_string());
        assert_eq!(json["amount"], 1_500);
        assert_eq!(json["public_key"], "PK1");
        assert!(json["request_id"].is_string());
    }

    #[test]
    fn test_request_without_id_still_parses() {
        let raw = format!(
            r#"{{"validator_id":"{}","amount":200,"public_key":"PK2"}}"#,
            Uuid::nil()
        );
        let request: SettlementRequest = serde_json::from_str(&raw).unwrap();
        assert_eq!(request.amount, 200);
        assert!(request.request_id.is_none());
    }
}
