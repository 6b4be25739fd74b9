use std::{collections::VecDeque, sync::Arc};

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions, QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

use super::{
    worker::{Disposition, SettlementWorker},
    SettlementRequest,
};
use crate::error::{AppError, AppResult};

/// Durable hand-off between the ledger and the settlement worker
#[async_trait]
pub trait SettlementPublisher: Send + Sync {
    /// Resolves only once the broker has accepted the message
    async fn publish(&self, request: &SettlementRequest) -> AppResult<()>;
}

/// RabbitMQ backed payout queue
pub struct RabbitQueue {
    connection: Connection,
    channel: Arc<AsyncMutex<Channel>>,
    queue_name: String,
}

impl RabbitQueue {
    pub async fn connect(url: &str, queue_name: &str) -> AppResult<Self> {
        let connection = Connection::connect(url, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;

        Self::declare_queue(&channel, queue_name).await?;
        info!("🐇 Connected to RabbitMQ, queue '{}' ready", queue_name);

        Ok(Self {
            connection,
            channel: Arc::new(AsyncMutex::new(channel)),
            queue_name: queue_name.to_string(),
        })
    }

    async fn declare_queue(channel: &Channel, queue_name: &str) -> AppResult<()> {
        channel
            .queue_declare(
                queue_name,
                QueueDeclareOptions {
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        debug!("Queue {} declared", queue_name);
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    /// Feed deliveries to the worker one at a time, acknowledging each only
    /// after the worker has decided its fate. Returns when the consumer
    /// stream ends.
    pub async fn consume(&self, worker: Arc<SettlementWorker>) -> AppResult<()> {
        let channel = self.connection.create_channel().await?;
        channel.basic_qos(1, BasicQosOptions::default()).await?;

        let mut consumer = channel
            .basic_consume(
                &self.queue_name,
                "settlement-worker",
                BasicConsumeOptions {
                    no_ack: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        info!("👷 Settlement worker consuming '{}'", self.queue_name);

        while let Some(delivery) = consumer.next().await {
            let delivery = match delivery {
                Ok(delivery) => delivery,
                Err(e) => {
                    error!("❌ Consumer error: {}", e);
                    return Err(e.into());
                }
            };

            let outcome = match worker.process(&delivery.data).await {
                Disposition::Ack => delivery.ack(BasicAckOptions::default()).await,
                Disposition::Requeue => {
                    delivery
                        .nack(BasicNackOptions {
                            requeue: true,
                            ..Default::default()
                        })
                        .await
                }
                Disposition::Reject => {
                    delivery
                        .reject(BasicRejectOptions { requeue: false })
                        .await
                }
            };

            if let Err(e) = outcome {
                warn!("⚠️  Failed to settle delivery with broker: {}", e);
            }
        }

        warn!("Consumer stream for '{}' ended", self.queue_name);
        Ok(())
    }
}

#[async_trait]
impl SettlementPublisher for RabbitQueue {
    async fn publish(&self, request: &SettlementRequest) -> AppResult<()> {
        let payload = serde_json::to_vec(request)?;
        let channel = self.channel.lock().await;

        let confirm = channel
            .basic_publish(
                "",
                &self.queue_name,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default()
                    .with_delivery_mode(2)
                    .with_content_type("application/json".into()),
            )
            .await?;
        broker_accepted(confirm.await?)?;

        debug!(
            "Published settlement for validator {} to {}",
            request.validator_id, self.queue_name
        );
        Ok(())
    }
}

/// Only a plain ack means the broker took ownership of the message
fn broker_accepted(confirmation: Confirmation) -> AppResult<()> {
    match confirmation {
        Confirmation::Ack(None) => Ok(()),
        Confirmation::Ack(Some(_)) => Err(AppError::ExternalError(
            "Settlement message was returned by the broker".to_string(),
        )),
        Confirmation::Nack(_) => Err(AppError::ExternalError(
            "Broker refused settlement message".to_string(),
        )),
        Confirmation::NotRequested => Err(AppError::ExternalError(
            "Publisher confirms are not enabled on the settlement channel".to_string(),
        )),
    }
}

/// In-process queue used by tests and local runs without a broker
#[derive(Default)]
pub struct MemoryQueue {
    messages: Mutex<VecDeque<Vec<u8>>>,
    fail_next: Mutex<bool>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next publish fail as if the broker were down
    pub fn fail_next_publish(&self) {
        *self.fail_next.lock() = true;
    }

    pub fn pop(&self) -> Option<Vec<u8>> {
        self.messages.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }

    /// Run every queued message through the worker, re-queueing the ones it
    /// asks to retry. Returns the dispositions in processing order.
    pub async fn drain_into(&self, worker: &SettlementWorker) -> Vec<Disposition> {
        let mut outcomes = Vec::new();
        let pending = self.len();
        for _ in 0..pending {
            let Some(payload) = self.pop() else { break };
            let disposition = worker.process(&payload).await;
            if disposition == Disposition::Requeue {
                self.messages.lock().push_back(payload);
            }
            outcomes.push(disposition);
        }
        outcomes
    }
}

#[async_trait]
impl SettlementPublisher for MemoryQueue {
    async fn publish(&self, request: &SettlementRequest) -> AppResult<()> {
        {
            let mut fail = self.fail_next.lock();
            if *fail {
                *fail = false;
                return Err(AppError::ExternalError(
                    "payout queue unavailable".to_string(),
                ));
            }
        }
        let payload = serde_json::to_vec(request)?;
        self.messages.lock().push_back(payload);
        Ok(())
    }
}
