use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{models::*, LedgerStore};
use crate::{
    error::{AppError, AppResult},
    settlement::{queue::SettlementPublisher, SettlementRequest, SettlementTicket},
};

#[derive(Default)]
struct LedgerState {
    targets: Vec<Target>,
    validators: HashMap<Uuid, Validator>,
    ticks: Vec<Tick>,
    settlements: Vec<SettlementRecord>,
}

/// In-process ledger with the same transactional guarantees as the Postgres
/// store. One lock guards the whole state, so every operation is atomic.
#[derive(Default)]
pub struct MemoryLedger {
    state: Mutex<LedgerState>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an active target, as the external CRUD API would
    pub async fn add_target(&self, url: &str) -> Target {
        let target = Target {
            id: Uuid::new_v4(),
            url: url.to_string(),
            owner_id: Uuid::new_v4(),
            active: true,
            created_at: Utc::now(),
        };
        self.state.lock().await.targets.push(target.clone());
        target
    }

    pub async fn deactivate_target(&self, target_id: Uuid) {
        let mut state = self.state.lock().await;
        if let Some(target) = state.targets.iter_mut().find(|t| t.id == target_id) {
            target.active = false;
        }
    }

    pub async fn all_ticks(&self) -> Vec<Tick> {
        self.state.lock().await.ticks.clone()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn active_targets(&self) -> AppResult<Vec<Target>> {
        let state = self.state.lock().await;
        Ok(state.targets.iter().filter(|t| t.active).cloned().collect())
    }

    async fn upsert_validator(&self, public_key: &str, ip: &str) -> AppResult<Validator> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        if let Some(existing) = state
            .validators
            .values_mut()
            .find(|v| v.public_key == public_key)
        {
            existing.ip = ip.to_string();
            existing.updated_at = now;
            return Ok(existing.clone());
        }

        let validator = Validator {
            id: Uuid::new_v4(),
            public_key: public_key.to_string(),
            location: "unknown".to_string(),
            ip: ip.to_string(),
            pending_credit: 0,
            created_at: now,
            updated_at: now,
        };
        state.validators.insert(validator.id, validator.clone());
        Ok(validator)
    }

    async fn get_validator(&self, validator_id: Uuid) -> AppResult<Option<Validator>> {
        Ok(self.state.lock().await.validators.get(&validator_id).cloned())
    }

    async fn record_tick(&self, tick: NewTick, reward: i64) -> AppResult<Tick> {
        tick.validate(reward)?;

        let mut state = self.state.lock().await;
        let validator = state
            .validators
            .get_mut(&tick.validator_id)
            .ok_or(AppError::ValidatorNotFound(tick.validator_id))?;
        validator.pending_credit += reward;
        validator.updated_at = Utc::now();

        let recorded = Tick {
            id: Uuid::new_v4(),
            target_id: tick.target_id,
            validator_id: tick.validator_id,
            status: tick.status,
            latency_ms: tick.latency_ms,
            created_at: Utc::now(),
        };
        state.ticks.push(recorded.clone());
        Ok(recorded)
    }

    async fn ticks_for(&self, validator_id: Uuid) -> AppResult<Vec<Tick>> {
        let state = self.state.lock().await;
        Ok(state
            .ticks
            .iter()
            .rev()
            .filter(|t| t.validator_id == validator_id)
            .cloned()
            .collect())
    }

    async fn request_settlement(
        &self,
        validator_id: Uuid,
        publisher: &dyn SettlementPublisher,
    ) -> AppResult<SettlementTicket> {
        // Held across the publish, like the row lock in Postgres
        let mut state = self.state.lock().await;
        let validator = state
            .validators
            .get_mut(&validator_id)
            .ok_or(AppError::ValidatorNotFound(validator_id))?;

        if validator.pending_credit <= 0 {
            return Ok(SettlementTicket::Cleared);
        }

        let request = SettlementRequest::new(
            validator.id,
            validator.pending_credit,
            validator.public_key.clone(),
        );
        publisher.publish(&request).await?;

        validator.pending_credit = 0;
        validator.updated_at = Utc::now();
        Ok(SettlementTicket::Queued(request))
    }

    async fn begin_settlement(&self, request: &SettlementRequest) -> AppResult<SettlementStart> {
        let mut state = self.state.lock().await;
        let request_id = request.request_id.unwrap_or_else(Uuid::new_v4);

        if let Some(existing) = state
            .settlements
            .iter()
            .find(|s| s.request_id == request_id)
        {
            return Ok(SettlementStart::Duplicate(existing.clone()));
        }

        let now = Utc::now();
        let record = SettlementRecord {
            id: Uuid::new_v4(),
            request_id,
            validator_id: request.validator_id,
            amount: request.amount,
            status: SettlementStatus::Processing,
            tx_ref: None,
            error_message: None,
            compensated: false,
            created_at: now,
            updated_at: now,
        };
        state.settlements.push(record.clone());
        Ok(SettlementStart::Started(record))
    }

    async fn complete_settlement(&self, settlement_id: Uuid, tx_ref: &str) -> AppResult<()> {
        let mut state = self.state.lock().await;
        if let Some(record) = state
            .settlements
            .iter_mut()
            .find(|s| s.id == settlement_id && s.status == SettlementStatus::Processing)
        {
            record.status = SettlementStatus::Completed;
            record.tx_ref = Some(tx_ref.to_string());
            record.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn fail_settlement(
        &self,
        settlement_id: Uuid,
        failure: SettlementFailure,
    ) -> AppResult<SettlementRecord> {
        let mut state = self.state.lock().await;
        let index = state
            .settlements
            .iter()
            .position(|s| s.id == settlement_id)
            .ok_or_else(|| {
                AppError::InvalidInput(format!("Settlement not found: {}", settlement_id))
            })?;

        if state.settlements[index].status.is_terminal() {
            return Ok(state.settlements[index].clone());
        }

        let (validator_id, amount) = {
            let record = &state.settlements[index];
            (record.validator_id, record.amount)
        };
        if failure.compensate {
            let validator = state
                .validators
                .get_mut(&validator_id)
                .ok_or(AppError::ValidatorNotFound(validator_id))?;
            validator.pending_credit += amount;
            validator.updated_at = Utc::now();
        }

        let record = &mut state.settlements[index];
        record.status = SettlementStatus::Failed;
        record.error_message = Some(failure.error);
        if failure.tx_ref.is_some() {
            record.tx_ref = failure.tx_ref;
        }
        record.compensated = failure.compensate;
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    async fn settlements_for(&self, validator_id: Uuid) -> AppResult<Vec<SettlementRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .settlements
            .iter()
            .rev()
            .filter(|s| s.validator_id == validator_id)
            .cloned()
            .collect())
    }
}
