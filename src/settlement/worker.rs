use std::{sync::Arc, time::Duration};

use tracing::{error, info, instrument, warn};

use super::{
    transfer::{SubmittedTransfer, TransferClient, TransferStatus},
    SettlementRequest,
};
use crate::ledger::{
    models::{SettlementFailure, SettlementRecord, SettlementStart},
    LedgerStore,
};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub poll_interval: Duration,
    pub confirmation_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            confirmation_timeout: Duration::from_secs(30),
        }
    }
}

/// What the consumer should tell the broker about a delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Handled (completed, or already settled by an earlier delivery)
    Ack,
    /// Transient ledger problem before any funds moved; try again
    Requeue,
    /// Malformed or failed; the outcome is recorded, do not redeliver
    Reject,
}

/// Where polling left a submitted transfer
#[derive(Debug, Clone, PartialEq, Eq)]
enum Finality {
    Finalized,
    FailedOnChain(String),
    /// Blockhash expired without the transaction landing
    Expired,
    /// Still unknown after the confirmation window; funds may have moved
    Ambiguous,
}

pub struct SettlementWorker {
    ledger: Arc<dyn LedgerStore>,
    transfer: Arc<dyn TransferClient>,
    config: WorkerConfig,
}

impl SettlementWorker {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        transfer: Arc<dyn TransferClient>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            ledger,
            transfer,
            config,
        }
    }

    /// Settle one queued payout end to end
    #[instrument(skip_all)]
    pub async fn process(&self, payload: &[u8]) -> Disposition {
        let request: SettlementRequest = match serde_json::from_slice(payload) {
            Ok(request) => request,
            Err(e) => {
                error!("❌ Dropping malformed settlement message: {}", e);
                return Disposition::Reject;
            }
        };

        if request.amount <= 0 {
            error!(
                "❌ Dropping settlement for {} with non-positive amount {}",
                request.validator_id, request.amount
            );
            return Disposition::Reject;
        }

        match self.ledger.get_validator(request.validator_id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                error!(
                    "❌ Dropping settlement for unknown validator {}",
                    request.validator_id
                );
                return Disposition::Reject;
            }
            Err(e) => {
                warn!("⚠️  Ledger unavailable, requeueing settlement: {}", e);
                return Disposition::Requeue;
            }
        }

        let record = match self.ledger.begin_settlement(&request).await {
            Ok(SettlementStart::Started(record)) => record,
            Ok(SettlementStart::Duplicate(existing)) => {
                return if existing.status.is_terminal() {
                    info!(
                        "Settlement {} already {:?}, acknowledging redelivery",
                        existing.id, existing.status
                    );
                    Disposition::Ack
                } else {
                    // A previous attempt may have submitted funds; never resubmit
                    error!(
                        "❌ Settlement {} is still processing from an earlier delivery, needs reconciliation",
                        existing.id
                    );
                    Disposition::Reject
                };
            }
            Err(e) => {
                warn!("⚠️  Could not open settlement record, requeueing: {}", e);
                return Disposition::Requeue;
            }
        };

        self.settle(&request, record).await
    }

    async fn settle(&self, request: &SettlementRequest, record: SettlementRecord) -> Disposition {
        info!(
            "💸 Settling {} lamports to validator {} ({})",
            request.amount, request.validator_id, request.public_key
        );

        let submitted = match self
            .transfer
            .submit_transfer(&request.public_key, request.amount as u64)
            .await
        {
            Ok(submitted) => submitted,
            Err(e) => {
                error!("❌ Transfer submission failed: {}", e);
                self.record_failure(
                    &record,
                    SettlementFailure {
                        error: e.to_string(),
                        tx_ref: None,
                        compensate: true,
                    },
                )
                .await;
                return Disposition::Reject;
            }
        };

        match self.await_finality(&submitted).await {
            Finality::Finalized => {
                if let Err(e) = self
                    .ledger
                    .complete_settlement(record.id, &submitted.signature)
                    .await
                {
                    // Funds moved; the record stays processing for reconciliation
                    error!(
                        "❌ Transfer {} finalized but settlement {} could not be completed: {}",
                        submitted.signature, record.id, e
                    );
                } else {
                    info!(
                        "✅ Settlement {} completed with {}",
                        record.id, submitted.signature
                    );
                }
                Disposition::Ack
            }
            Finality::FailedOnChain(reason) => {
                self.record_failure(
                    &record,
                    SettlementFailure {
                        error: format!("Transaction failed on-chain: {}", reason),
                        tx_ref: Some(submitted.signature),
                        compensate: true,
                    },
                )
                .await;
                Disposition::Reject
            }
            Finality::Expired => {
                self.record_failure(
                    &record,
                    SettlementFailure {
                        error: "Transaction expired before landing".to_string(),
                        tx_ref: Some(submitted.signature),
                        compensate: true,
                    },
                )
                .await;
                Disposition::Reject
            }
            Finality::Ambiguous => {
                self.record_failure(
                    &record,
                    SettlementFailure {
                        error: "Transaction confirmation timeout".to_string(),
                        tx_ref: Some(submitted.signature),
                        compensate: false,
                    },
                )
                .await;
                Disposition::Reject
            }
        }
    }

    async fn await_finality(&self, submitted: &SubmittedTransfer) -> Finality {
        match tokio::time::timeout(
            self.config.confirmation_timeout,
            self.poll_until_settled(&submitted.signature),
        )
        .await
        {
            Ok(finality) => finality,
            Err(_) => self.resolve_timeout(submitted).await,
        }
    }

    async fn poll_until_settled(&self, signature: &str) -> Finality {
        loop {
            tokio::time::sleep(self.config.poll_interval).await;
            match self.transfer.transfer_status(signature).await {
                Ok(TransferStatus::Finalized) => return Finality::Finalized,
                Ok(TransferStatus::Failed(reason)) => return Finality::FailedOnChain(reason),
                Ok(TransferStatus::Unknown | TransferStatus::Processing) => {}
                Err(e) => warn!("⚠️  Status query for {} failed: {}", signature, e),
            }
        }
    }

    /// Past the confirmation window the transfer only counts as not having
    /// happened when its blockhash is dead and the cluster never saw it.
    async fn resolve_timeout(&self, submitted: &SubmittedTransfer) -> Finality {
        match self.transfer.blockhash_expired(&submitted.blockhash).await {
            Ok(true) => {}
            Ok(false) => return Finality::Ambiguous,
            Err(e) => {
                warn!("⚠️  Blockhash validity check failed: {}", e);
                return Finality::Ambiguous;
            }
        }

        match self.transfer.transfer_status(&submitted.signature).await {
            Ok(TransferStatus::Unknown) => Finality::Expired,
            Ok(TransferStatus::Finalized) => Finality::Finalized,
            Ok(TransferStatus::Failed(reason)) => Finality::FailedOnChain(reason),
            Ok(TransferStatus::Processing) => Finality::Ambiguous,
            Err(e) => {
                warn!("⚠️  Final status check for {} failed: {}", submitted.signature, e);
                Finality::Ambiguous
            }
        }
    }

    async fn record_failure(&self, record: &SettlementRecord, failure: SettlementFailure) {
        let compensate = failure.compensate;
        match self.ledger.fail_settlement(record.id, failure).await {
            Ok(updated) if compensate && updated.compensated => warn!(
                "↩️  Settlement {} failed, {} lamports returned to validator {}",
                record.id, record.amount, record.validator_id
            ),
            Ok(_) => warn!(
                "⚠️  Settlement {} failed without compensation, needs reconciliation",
                record.id
            ),
            Err(e) => error!(
                "❌ Could not record failure of settlement {}: {}",
                record.id, e
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::{AppError, AppResult, SettlementError},
        ledger::{
            models::{NewTick, SettlementStatus, Target, Tick, TickStatus, Validator},
            MemoryLedger,
        },
        settlement::{
            queue::{MemoryQueue, SettlementPublisher},
            SettlementTicket,
        },
    };
    use std::sync::atomic::{AtomicBool, Ordering};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use uuid::Uuid;

    /// Scripted transfer client
    #[derive(Default)]
    struct ScriptedTransfer {
        fail_submit: bool,
        statuses: Mutex<VecDeque<TransferStatus>>,
        expired: bool,
        submissions: Mutex<Vec<(String, u64)>>,
    }

    impl ScriptedTransfer {
        fn with_statuses(statuses: Vec<TransferStatus>) -> Self {
            Self {
                statuses: Mutex::new(statuses.into()),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl TransferClient for ScriptedTransfer {
        async fn submit_transfer(
            &self,
            recipient: &str,
            lamports: u64,
        ) -> Result<SubmittedTransfer, SettlementError> {
            if self.fail_submit {
                return Err(SettlementError::SubmissionFailed("rpc down".to_string()));
            }
            self.submissions.lock().push((recipient.to_string(), lamports));
            Ok(SubmittedTransfer {
                signature: "5igSig".to_string(),
                blockhash: "hash".to_string(),
            })
        }

        async fn transfer_status(&self, _signature: &str) -> Result<TransferStatus, SettlementError> {
            let mut statuses = self.statuses.lock();
            // Last scripted status repeats
            let status = if statuses.len() > 1 {
                statuses.pop_front()
            } else {
                statuses.front().cloned()
            };
            Ok(status.unwrap_or(TransferStatus::Unknown))
        }

        async fn blockhash_expired(&self, _blockhash: &str) -> Result<bool, SettlementError> {
            Ok(self.expired)
        }
    }

    /// Memory ledger whose settlement records cannot be written while `down`
    struct FlakyLedger {
        inner: MemoryLedger,
        down: AtomicBool,
    }

    #[async_trait]
    impl LedgerStore for FlakyLedger {
        async fn active_targets(&self) -> AppResult<Vec<Target>> {
            self.inner.active_targets().await
        }

        async fn upsert_validator(&self, public_key: &str, ip: &str) -> AppResult<Validator> {
            self.inner.upsert_validator(public_key, ip).await
        }

        async fn get_validator(&self, validator_id: Uuid) -> AppResult<Option<Validator>> {
            self.inner.get_validator(validator_id).await
        }

        async fn record_tick(&self, tick: NewTick, reward: i64) -> AppResult<Tick> {
            self.inner.record_tick(tick, reward).await
        }

        async fn ticks_for(&self, validator_id: Uuid) -> AppResult<Vec<Tick>> {
            self.inner.ticks_for(validator_id).await
        }

        async fn request_settlement(
            &self,
            validator_id: Uuid,
            publisher: &dyn SettlementPublisher,
        ) -> AppResult<SettlementTicket> {
            self.inner.request_settlement(validator_id, publisher).await
        }

        async fn begin_settlement(&self, request: &SettlementRequest) -> AppResult<SettlementStart> {
            if self.down.load(Ordering::SeqCst) {
                return Err(AppError::Database(sqlx::Error::PoolTimedOut));
            }
            self.inner.begin_settlement(request).await
        }

        async fn complete_settlement(&self, settlement_id: Uuid, tx_ref: &str) -> AppResult<()> {
            self.inner.complete_settlement(settlement_id, tx_ref).await
        }

        async fn fail_settlement(
            &self,
            settlement_id: Uuid,
            failure: SettlementFailure,
        ) -> AppResult<SettlementRecord> {
            self.inner.fail_settlement(settlement_id, failure).await
        }

        async fn settlements_for(&self, validator_id: Uuid) -> AppResult<Vec<SettlementRecord>> {
            self.inner.settlements_for(validator_id).await
        }
    }

    fn fast_config() -> WorkerConfig {
        WorkerConfig {
            poll_interval: Duration::from_millis(5),
            confirmation_timeout: Duration::from_millis(60),
        }
    }

    async fn funded_ledger(credit: i64) -> (Arc<MemoryLedger>, Uuid) {
        let ledger = Arc::new(MemoryLedger::new());
        let validator = ledger.upsert_validator("PK1", "10.0.0.1").await.unwrap();
        ledger
            .record_tick(
                NewTick {
                    target_id: Uuid::new_v4(),
                    validator_id: validator.id,
                    status: TickStatus::Good,
                    latency_ms: 80.0,
                },
                credit,
            )
            .await
            .unwrap();
        (ledger, validator.id)
    }

    async fn queue_payout(ledger: &MemoryLedger, validator_id: Uuid) -> MemoryQueue {
        let queue = MemoryQueue::new();
        let ticket = ledger.request_settlement(validator_id, &queue).await.unwrap();
        assert!(matches!(ticket, SettlementTicket::Queued(_)));
        queue
    }

    async fn credit_of(ledger: &MemoryLedger, validator_id: Uuid) -> i64 {
        ledger
            .get_validator(validator_id)
            .await
            .unwrap()
            .unwrap()
            .pending_credit
    }

    #[tokio::test]
    async fn test_finalized_transfer_completes_without_recredit() {
        let (ledger, validator_id) = funded_ledger(1_500).await;
        let queue = queue_payout(&ledger, validator_id).await;
        let transfer = Arc::new(ScriptedTransfer::with_statuses(vec![
            TransferStatus::Processing,
            TransferStatus::Finalized,
        ]));
        let worker = SettlementWorker::new(ledger.clone(), transfer.clone(), fast_config());

        assert_eq!(queue.drain_into(&worker).await, vec![Disposition::Ack]);

        let records = ledger.settlements_for(validator_id).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, SettlementStatus::Completed);
        assert_eq!(records[0].tx_ref.as_deref(), Some("5igSig"));
        assert_eq!(credit_of(&ledger, validator_id).await, 0);
        assert_eq!(transfer.submissions.lock()[0], ("PK1".to_string(), 1_500));
    }

    #[tokio::test]
    async fn test_submission_failure_restores_credit() {
        let (ledger, validator_id) = funded_ledger(1_500).await;
        let queue = queue_payout(&ledger, validator_id).await;
        assert_eq!(credit_of(&ledger, validator_id).await, 0);

        let transfer = Arc::new(ScriptedTransfer {
            fail_submit: true,
            ..Default::default()
        });
        let worker = SettlementWorker::new(ledger.clone(), transfer, fast_config());

        assert_eq!(queue.drain_into(&worker).await, vec![Disposition::Reject]);

        let records = ledger.settlements_for(validator_id).await.unwrap();
        assert_eq!(records[0].status, SettlementStatus::Failed);
        assert!(records[0].compensated);
        assert!(records[0].tx_ref.is_none());
        assert_eq!(credit_of(&ledger, validator_id).await, 1_500);
    }

    #[tokio::test]
    async fn test_on_chain_failure_restores_credit() {
        let (ledger, validator_id) = funded_ledger(700).await;
        let queue = queue_payout(&ledger, validator_id).await;
        let transfer = Arc::new(ScriptedTransfer::with_statuses(vec![TransferStatus::Failed(
            "InsufficientFundsForFee".to_string(),
        )]));
        let worker = SettlementWorker::new(ledger.clone(), transfer, fast_config());

        queue.drain_into(&worker).await;

        let records = ledger.settlements_for(validator_id).await.unwrap();
        assert_eq!(records[0].status, SettlementStatus::Failed);
        assert_eq!(records[0].tx_ref.as_deref(), Some("5igSig"));
        assert_eq!(credit_of(&ledger, validator_id).await, 700);
    }

    #[tokio::test]
    async fn test_ambiguous_timeout_does_not_compensate() {
        let (ledger, validator_id) = funded_ledger(900).await;
        let queue = queue_payout(&ledger, validator_id).await;
        let transfer = Arc::new(ScriptedTransfer::with_statuses(vec![
            TransferStatus::Processing,
        ]));
        let worker = SettlementWorker::new(ledger.clone(), transfer, fast_config());

        assert_eq!(queue.drain_into(&worker).await, vec![Disposition::Reject]);

        let records = ledger.settlements_for(validator_id).await.unwrap();
        assert_eq!(records[0].status, SettlementStatus::Failed);
        assert_eq!(
            records[0].error_message.as_deref(),
            Some("Transaction confirmation timeout")
        );
        assert!(!records[0].compensated);
        assert_eq!(credit_of(&ledger, validator_id).await, 0);
    }

    #[tokio::test]
    async fn test_expired_blockhash_compensates() {
        let (ledger, validator_id) = funded_ledger(900).await;
        let queue = queue_payout(&ledger, validator_id).await;
        let transfer = Arc::new(ScriptedTransfer {
            expired: true,
            ..Default::default()
        });
        let worker = SettlementWorker::new(ledger.clone(), transfer, fast_config());

        queue.drain_into(&worker).await;

        let records = ledger.settlements_for(validator_id).await.unwrap();
        assert_eq!(records[0].status, SettlementStatus::Failed);
        assert!(records[0].compensated);
        assert_eq!(credit_of(&ledger, validator_id).await, 900);
    }

    #[tokio::test]
    async fn test_redelivery_never_pays_twice() {
        let (ledger, validator_id) = funded_ledger(1_000).await;
        let queue = queue_payout(&ledger, validator_id).await;
        let payload = queue.pop().unwrap();

        let transfer = Arc::new(ScriptedTransfer::with_statuses(vec![
            TransferStatus::Finalized,
        ]));
        let worker = SettlementWorker::new(ledger.clone(), transfer.clone(), fast_config());

        assert_eq!(worker.process(&payload).await, Disposition::Ack);
        assert_eq!(worker.process(&payload).await, Disposition::Ack);

        assert_eq!(transfer.submissions.lock().len(), 1);
        assert_eq!(ledger.settlements_for(validator_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_and_unknown_messages_are_rejected() {
        let ledger = Arc::new(MemoryLedger::new());
        let transfer = Arc::new(ScriptedTransfer::default());
        let worker = SettlementWorker::new(ledger, transfer.clone(), fast_config());

        assert_eq!(worker.process(b"not json").await, Disposition::Reject);

        let orphan = SettlementRequest::new(Uuid::new_v4(), 100, "PK9".to_string());
        let payload = serde_json::to_vec(&orphan).unwrap();
        assert_eq!(worker.process(&payload).await, Disposition::Reject);
        assert!(transfer.submissions.lock().is_empty());
    }

    #[tokio::test]
    async fn test_ledger_outage_requeues_without_paying() {
        let (memory, validator_id) = funded_ledger(700).await;
        let queue = queue_payout(&memory, validator_id).await;
        let ledger = Arc::new(FlakyLedger {
            inner: Arc::try_unwrap(memory).ok().unwrap(),
            down: AtomicBool::new(true),
        });
        let transfer = Arc::new(ScriptedTransfer::with_statuses(vec![
            TransferStatus::Finalized,
        ]));
        let worker = SettlementWorker::new(ledger.clone(), transfer.clone(), fast_config());

        assert_eq!(queue.drain_into(&worker).await, vec![Disposition::Requeue]);
        assert_eq!(queue.len(), 1);
        assert!(transfer.submissions.lock().is_empty());
        assert!(ledger.settlements_for(validator_id).await.unwrap().is_empty());
        assert_eq!(credit_of(&ledger.inner, validator_id).await, 0);

        // Once the ledger is back the redelivered message settles
        ledger.down.store(false, Ordering::SeqCst);
        assert_eq!(queue.drain_into(&worker).await, vec![Disposition::Ack]);
        assert!(queue.is_empty());
        assert_eq!(transfer.submissions.lock().len(), 1);
    }
}
