use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{info, warn};
use uuid::Uuid;

use super::{models::*, LedgerStore};
use crate::{
    error::{AppError, AppResult},
    settlement::{queue::SettlementPublisher, SettlementRequest, SettlementTicket},
};

const VALIDATOR_COLUMNS: &str =
    "id, public_key, location, ip, pending_credit, created_at, updated_at";

const SETTLEMENT_COLUMNS: &str = "id, request_id, validator_id, amount, status, tx_ref, \
     error_message, compensated, created_at, updated_at";

/// Postgres ledger - the source of truth for credit and settlement state
pub struct LedgerRepository {
    pub pool: PgPool,
}

impl LedgerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn begin_tx(&self) -> AppResult<Transaction<'_, Postgres>> {
        Ok(self.pool.begin().await?)
    }

    async fn credit_validator(
        tx: &mut Transaction<'_, Postgres>,
        validator_id: Uuid,
        amount: i64,
    ) -> AppResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE validators
            SET pending_credit = pending_credit + $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(validator_id)
        .bind(amount)
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::ValidatorNotFound(validator_id));
        }
        Ok(())
    }

    async fn settlement_by_id(
        tx: &mut Transaction<'_, Postgres>,
        settlement_id: Uuid,
    ) -> AppResult<SettlementRecord> {
        sqlx::query_as::<_, SettlementRecord>(&format!(
            "SELECT {} FROM settlements WHERE id = $1",
            SETTLEMENT_COLUMNS
        ))
        .bind(settlement_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| AppError::InvalidInput(format!("Settlement not found: {}", settlement_id)))
    }
}

#[async_trait]
impl LedgerStore for LedgerRepository {
    async fn active_targets(&self) -> AppResult<Vec<Target>> {
        let targets = sqlx::query_as::<_, Target>(
            r#"
            SELECT id, url, owner_id, active, created_at
            FROM targets
            WHERE active = true
            ORDER BY created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(targets)
    }

    async fn upsert_validator(&self, public_key: &str, ip: &str) -> AppResult<Validator> {
        let validator = sqlx::query_as::<_, Validator>(&format!(
            r#"
            INSERT INTO validators (public_key, location, ip)
            VALUES ($1, 'unknown', $2)
            ON CONFLICT (public_key)
            DO UPDATE SET ip = EXCLUDED.ip, updated_at = NOW()
            RETURNING {}
            "#,
            VALIDATOR_COLUMNS
        ))
        .bind(public_key)
        .bind(ip)
        .fetch_one(&self.pool)
        .await?;

        Ok(validator)
    }

    async fn get_validator(&self, validator_id: Uuid) -> AppResult<Option<Validator>> {
        let validator = sqlx::query_as::<_, Validator>(&format!(
            "SELECT {} FROM validators WHERE id = $1",
            VALIDATOR_COLUMNS
        ))
        .bind(validator_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(validator)
    }

    async fn record_tick(&self, tick: NewTick, reward: i64) -> AppResult<Tick> {
        tick.validate(reward)?;

        let mut tx = self.begin_tx().await?;

        // Credit first so a missing validator aborts before the tick exists
        Self::credit_validator(&mut tx, tick.validator_id, reward).await?;

        let recorded = sqlx::query_as::<_, Tick>(
            r#"
            INSERT INTO ticks (target_id, validator_id, status, latency_ms)
            VALUES ($1, $2, $3, $4)
            RETURNING id, target_id, validator_id, status, latency_ms, created_at
            "#,
        )
        .bind(tick.target_id)
        .bind(tick.validator_id)
        .bind(tick.status)
        .bind(tick.latency_ms)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(recorded)
    }

    async fn ticks_for(&self, validator_id: Uuid) -> AppResult<Vec<Tick>> {
        let ticks = sqlx::query_as::<_, Tick>(
            r#"
            SELECT id, target_id, validator_id, status, latency_ms, created_at
            FROM ticks
            WHERE validator_id = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(validator_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(ticks)
    }

    async fn request_settlement(
        &self,
        validator_id: Uuid,
        publisher: &dyn SettlementPublisher,
    ) -> AppResult<SettlementTicket> {
        let mut tx = self.begin_tx().await?;

        // Row lock serializes concurrent payout requests for the same validator
        let validator = sqlx::query_as::<_, Validator>(&format!(
            "SELECT {} FROM validators WHERE id = $1 FOR UPDATE",
            VALIDATOR_COLUMNS
        ))
        .bind(validator_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(AppError::ValidatorNotFound(validator_id))?;

        if validator.pending_credit <= 0 {
            tx.rollback().await?;
            return Ok(SettlementTicket::Cleared);
        }

        let request = SettlementRequest::new(
            validator.id,
            validator.pending_credit,
            validator.public_key.clone(),
        );

        // Dropping the transaction on a publish error rolls the lock back
        // with the credit untouched
        publisher.publish(&request).await?;

        sqlx::query(
            r#"
            UPDATE validators
            SET pending_credit = 0, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(validator_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        info!(
            "💸 Queued settlement of {} lamports for validator {}",
            request.amount, validator_id
        );
        Ok(SettlementTicket::Queued(request))
    }

    async fn begin_settlement(&self, request: &SettlementRequest) -> AppResult<SettlementStart> {
        let request_id = request.request_id.unwrap_or_else(Uuid::new_v4);

        let inserted = sqlx::query_as::<_, SettlementRecord>(&format!(
            r#"
            INSERT INTO settlements (request_id, validator_id, amount, status)
            VALUES ($1, $2, $3, 'processing')
            ON CONFLICT (request_id) DO NOTHING
            RETURNING {}
            "#,
            SETTLEMENT_COLUMNS
        ))
        .bind(request_id)
        .bind(request.validator_id)
        .bind(request.amount)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(record) = inserted {
            return Ok(SettlementStart::Started(record));
        }

        let existing = sqlx::query_as::<_, SettlementRecord>(&format!(
            "SELECT {} FROM settlements WHERE request_id = $1",
            SETTLEMENT_COLUMNS
        ))
        .bind(request_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(SettlementStart::Duplicate(existing))
    }

    async fn complete_settlement(&self, settlement_id: Uuid, tx_ref: &str) -> AppResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE settlements
            SET status = 'completed', tx_ref = $2, updated_at = NOW()
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(settlement_id)
        .bind(tx_ref)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            warn!(
                "⚠️  Settlement {} was not in processing when completing",
                settlement_id
            );
        }
        Ok(())
    }

    async fn fail_settlement(
        &self,
        settlement_id: Uuid,
        failure: SettlementFailure,
    ) -> AppResult<SettlementRecord> {
        let mut tx = self.begin_tx().await?;

        let updated = sqlx::query_as::<_, SettlementRecord>(&format!(
            r#"
            UPDATE settlements
            SET status = 'failed',
                error_message = $2,
                tx_ref = COALESCE($3, tx_ref),
                compensated = $4,
                updated_at = NOW()
            WHERE id = $1 AND status = 'processing'
            RETURNING {}
            "#,
            SETTLEMENT_COLUMNS
        ))
        .bind(settlement_id)
        .bind(&failure.error)
        .bind(failure.tx_ref.as_deref())
        .bind(failure.compensate)
        .fetch_optional(&mut *tx)
        .await?;

        let record = match updated {
            Some(record) => record,
            None => {
                let existing = Self::settlement_by_id(&mut tx, settlement_id).await?;
                tx.rollback().await?;
                warn!(
                    "⚠️  Settlement {} already {:?}, leaving it untouched",
                    settlement_id, existing.status
                );
                return Ok(existing);
            }
        };

        if failure.compensate {
            Self::credit_validator(&mut tx, record.validator_id, record.amount).await?;
        }

        tx.commit().await?;
        Ok(record)
    }

    async fn settlements_for(&self, validator_id: Uuid) -> AppResult<Vec<SettlementRecord>> {
        let records = sqlx::query_as::<_, SettlementRecord>(&format!(
            "SELECT {} FROM settlements WHERE validator_id = $1 ORDER BY created_at DESC",
            SETTLEMENT_COLUMNS
        ))
        .bind(validator_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }
}
