pub mod memory;
pub mod models;
pub mod repository;

use async_trait::async_trait;
use uuid::Uuid;

use crate::{
    error::AppResult,
    settlement::{queue::SettlementPublisher, SettlementRequest, SettlementTicket},
};
use models::{
    NewTick, SettlementFailure, SettlementRecord, SettlementStart, Target, Tick, Validator,
};

pub use memory::MemoryLedger;
pub use repository::LedgerRepository;

/// Transactional persistence shared by the hub, the ledger API and the
/// settlement worker.
///
/// Every method that touches `pending_credit` does so inside a single
/// transaction together with the row it is paired with (tick, settlement
/// record), so credit can never be observed half-applied.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Targets that should receive a probe this cycle
    async fn active_targets(&self) -> AppResult<Vec<Target>>;

    /// Look up a validator by public key, creating it on first sight.
    /// An existing row keeps its id and credit; only the ip is refreshed.
    async fn upsert_validator(&self, public_key: &str, ip: &str) -> AppResult<Validator>;

    async fn get_validator(&self, validator_id: Uuid) -> AppResult<Option<Validator>>;

    /// Insert a tick and add `reward` to the validator's credit atomically
    async fn record_tick(&self, tick: NewTick, reward: i64) -> AppResult<Tick>;

    async fn ticks_for(&self, validator_id: Uuid) -> AppResult<Vec<Tick>>;

    /// Move the full pending credit of a validator onto the settlement queue.
    ///
    /// The validator row stays locked while the request is published and the
    /// credit is only zeroed if publishing succeeded, so concurrent callers
    /// can never enqueue more than the balance.
    async fn request_settlement(
        &self,
        validator_id: Uuid,
        publisher: &dyn SettlementPublisher,
    ) -> AppResult<SettlementTicket>;

    /// Open a `processing` record for a dequeued request, or return the
    /// record a previous delivery of the same request already created.
    async fn begin_settlement(&self, request: &SettlementRequest) -> AppResult<SettlementStart>;

    /// Mark a processing record completed with its transaction reference
    async fn complete_settlement(&self, settlement_id: Uuid, tx_ref: &str) -> AppResult<()>;

    /// Mark a processing record failed. With `compensate` set the amount is
    /// credited back to the validator in the same transaction. A record that
    /// is already terminal is returned untouched.
    async fn fail_settlement(
        &self,
        settlement_id: Uuid,
        failure: SettlementFailure,
    ) -> AppResult<SettlementRecord>;

    /// Settlement history for a validator, newest first
    async fn settlements_for(&self, validator_id: Uuid) -> AppResult<Vec<SettlementRecord>>;
}
