use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, Type};
use std::fmt;
use uuid::Uuid;

use crate::error::{AppError, AppResult};

/// Lamports per SOL, used when presenting balances
pub const LAMPORTS_PER_SOL_SCALE: u32 = 9;

/// Outcome of a single probe, as reported by a validator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "tick_status", rename_all = "lowercase")]
pub enum TickStatus {
    Good,
    Bad,
}

impl TickStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TickStatus::Good => "Good",
            TickStatus::Bad => "Bad",
        }
    }
}

impl fmt::Display for TickStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Settlement record lifecycle: processing -> completed | failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "settlement_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SettlementStatus {
    Processing,
    Completed,
    Failed,
}

impl SettlementStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SettlementStatus::Completed | SettlementStatus::Failed)
    }
}

/// Monitored endpoint. Owned by the external CRUD API, read-only here.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Target {
    pub id: Uuid,
    pub url: String,
    pub owner_id: Uuid,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// Public-key addressed validator identity with its unsettled credit
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Validator {
    pub id: Uuid,
    pub public_key: String,
    pub location: String,
    pub ip: String,
    /// Accrued, unsettled reward in lamports. Never negative.
    pub pending_credit: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Validator {
    pub fn pending_sol(&self) -> Decimal {
        lamports_to_sol(self.pending_credit)
    }
}

pub fn lamports_to_sol(lamports: i64) -> Decimal {
    Decimal::new(lamports, LAMPORTS_PER_SOL_SCALE)
}

/// Immutable probe result
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Tick {
    pub id: Uuid,
    pub target_id: Uuid,
    pub validator_id: Uuid,
    pub status: TickStatus,
    pub latency_ms: f64,
    pub created_at: DateTime<Utc>,
}

/// Tick about to be recorded together with its credit
#[derive(Debug, Clone)]
pub struct NewTick {
    pub target_id: Uuid,
    pub validator_id: Uuid,
    pub status: TickStatus,
    pub latency_ms: f64,
}

impl NewTick {
    /// Reject values the ledger must never store
    pub fn validate(&self, reward: i64) -> AppResult<()> {
        if reward < 0 {
            return Err(AppError::InvalidInput(format!(
                "reward per check must be non-negative, got {}",
                reward
            )));
        }
        if !self.latency_ms.is_finite() || self.latency_ms < 0.0 {
            return Err(AppError::InvalidInput(format!(
                "latency must be a non-negative number of milliseconds, got {}",
                self.latency_ms
            )));
        }
        Ok(())
    }
}

/// Persisted outcome of one settlement attempt
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SettlementRecord {
    pub id: Uuid,
    pub request_id: Uuid,
    pub validator_id: Uuid,
    pub amount: i64,
    pub status: SettlementStatus,
    pub tx_ref: Option<String>,
    pub error_message: Option<String>,
    pub compensated: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Terminal failure details handed to the store in one atomic write
#[derive(Debug, Clone)]
pub struct SettlementFailure {
    pub error: String,
    pub tx_ref: Option<String>,
    /// Re-credit the settled amount to the validator in the same transaction
    pub compensate: bool,
}

/// Result of opening a settlement record for a queued request
#[derive(Debug, Clone)]
pub enum SettlementStart {
    /// Fresh record in `processing`
    Started(SettlementRecord),
    /// A record for this request id already exists (redelivered message)
    Duplicate(SettlementRecord),
}
