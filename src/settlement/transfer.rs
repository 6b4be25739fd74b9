use std::{str::FromStr, sync::Arc};

use async_trait::async_trait;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::{
    hash::Hash,
    instruction::Instruction,
    message::{AccountMeta, Message},
    pubkey::Pubkey,
    signature::{Keypair, Signature, Signer},
    transaction::Transaction,
};
use tracing::{debug, info};

use crate::error::SettlementError;

/// Index of `Transfer` in the system program's instruction enum
const SYSTEM_TRANSFER_INDEX: u32 = 2;

/// A transfer accepted by the RPC node but not yet known to be final
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedTransfer {
    pub signature: String,
    /// Blockhash the transaction was signed against; once it stops being
    /// valid the transaction can no longer land.
    pub blockhash: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferStatus {
    /// Cluster has not seen the signature
    Unknown,
    /// Seen but not finalized yet
    Processing,
    Finalized,
    /// Finalized with an execution error; no funds moved
    Failed(String),
}

/// Moves lamports from the platform wallet to a recipient
#[async_trait]
pub trait TransferClient: Send + Sync {
    async fn submit_transfer(
        &self,
        recipient: &str,
        lamports: u64,
    ) -> Result<SubmittedTransfer, SettlementError>;

    async fn transfer_status(&self, signature: &str) -> Result<TransferStatus, SettlementError>;

    async fn blockhash_expired(&self, blockhash: &str) -> Result<bool, SettlementError>;
}

/// System-program transfer signed by the platform wallet.
///
/// The RPC client uses its default (finalized) commitment for both the
/// blockhash and validity checks.
pub struct SolanaTransfer {
    client: RpcClient,
    platform: Arc<Keypair>,
}

impl SolanaTransfer {
    pub fn new(rpc_url: &str, platform: Keypair) -> Self {
        Self {
            client: RpcClient::new(rpc_url.to_string()),
            platform: Arc::new(platform),
        }
    }

    /// Build from a base58 encoded 64-byte secret key
    pub fn from_base58(rpc_url: &str, secret: &str) -> Result<Self, SettlementError> {
        let keypair = keypair_from_base58(secret)?;
        info!(
            "🔑 Settlement wallet {} on {}",
            keypair.pubkey(),
            rpc_url
        );
        Ok(Self::new(rpc_url, keypair))
    }

    pub fn platform_pubkey(&self) -> Pubkey {
        self.platform.pubkey()
    }
}

pub fn keypair_from_base58(secret: &str) -> Result<Keypair, SettlementError> {
    let bytes = bs58::decode(secret.trim())
        .into_vec()
        .map_err(|e| SettlementError::InvalidKeypair(e.to_string()))?;
    Keypair::try_from(bytes.as_slice()).map_err(|e| SettlementError::InvalidKeypair(e.to_string()))
}

/// System program transfer: u32 LE variant index followed by u64 LE lamports
pub fn transfer_instruction(from: &Pubkey, to: &Pubkey, lamports: u64) -> Instruction {
    let mut data = Vec::with_capacity(12);
    data.extend_from_slice(&SYSTEM_TRANSFER_INDEX.to_le_bytes());
    data.extend_from_slice(&lamports.to_le_bytes());

    Instruction {
        // The system program id is the all-zero key
        program_id: Pubkey::default(),
        accounts: vec![AccountMeta::new(*from, true), AccountMeta::new(*to, false)],
        data,
    }
}

#[async_trait]
impl TransferClient for SolanaTransfer {
    async fn submit_transfer(
        &self,
        recipient: &str,
        lamports: u64,
    ) -> Result<SubmittedTransfer, SettlementError> {
        if lamports == 0 {
            return Err(SettlementError::ZeroAmount);
        }
        let to = Pubkey::from_str(recipient)
            .map_err(|e| SettlementError::InvalidRecipient(format!("{}: {}", recipient, e)))?;

        let recent_blockhash = self
            .client
            .get_latest_blockhash()
            .await
            .map_err(|e| SettlementError::Blockhash(e.to_string()))?;

        let payer = self.platform.pubkey();
        let message = Message::new(&[transfer_instruction(&payer, &to, lamports)], Some(&payer));
        let transaction = Transaction::new(&[&*self.platform], message, recent_blockhash);

        let signature = self
            .client
            .send_transaction(&transaction)
            .await
            .map_err(|e| SettlementError::SubmissionFailed(e.to_string()))?;

        debug!("Submitted transfer {} of {} lamports to {}", signature, lamports, recipient);
        Ok(SubmittedTransfer {
            signature: signature.to_string(),
            blockhash: recent_blockhash.to_string(),
        })
    }

    async fn transfer_status(&self, signature: &str) -> Result<TransferStatus, SettlementError> {
        let signature = Signature::from_str(signature)
            .map_err(|e| SettlementError::InvalidTxRef(e.to_string()))?;

        let response = self
            .client
            .get_signature_statuses_with_history(&[signature])
            .await
            .map_err(|e| SettlementError::StatusQuery(e.to_string()))?;

        let status = match response.value.into_iter().next().flatten() {
            Some(status) => status,
            None => return Ok(TransferStatus::Unknown),
        };

        // `confirmations == None` means the slot is rooted
        if status.confirmations.is_some() {
            return Ok(TransferStatus::Processing);
        }
        match status.err {
            Some(err) => Ok(TransferStatus::Failed(format!("{:?}", err))),
            None => Ok(TransferStatus::Finalized),
        }
    }

    async fn blockhash_expired(&self, blockhash: &str) -> Result<bool, SettlementError> {
        let hash =
            Hash::from_str(blockhash).map_err(|e| SettlementError::InvalidBlockhash(e.to_string()))?;

        let valid = self
            .client
            .is_blockhash_valid(&hash, self.client.commitment())
            .await
            .map_err(|e| SettlementError::StatusQuery(e.to_string()))?;

        Ok(!valid)
    }
}
