//! Ed25519 signing and verification for validator identity proofs.
//!
//! Validators are identified by their Solana public key (base58). Both the
//! handshake and every probe reply carry a base64 detached signature over a
//! fixed message, verified here before the hub trusts the payload.

use std::str::FromStr;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ed25519_dalek::{Signature, VerifyingKey};
use solana_sdk::{
    pubkey::Pubkey,
    signature::{Keypair, Signer},
};

use crate::error::{AppError, AppResult};

pub trait SignatureVerifier: Send + Sync {
    /// Verify a base64 `signature` of `message` under the base58 `public_key`
    fn verify_signature(&self, signature: &str, message: &str, public_key: &str)
        -> AppResult<()>;
}

/// Strict ed25519 verifier for Solana public keys
#[derive(Debug, Default, Clone, Copy)]
pub struct Ed25519Verifier;

impl SignatureVerifier for Ed25519Verifier {
    fn verify_signature(
        &self,
        signature: &str,
        message: &str,
        public_key: &str,
    ) -> AppResult<()> {
        let signature_bytes = BASE64
            .decode(signature)
            .map_err(|_| AppError::InvalidSignature("Invalid base64 encoding".to_string()))?;

        let sig_array: [u8; 64] = signature_bytes
            .try_into()
            .map_err(|_| AppError::InvalidSignature("Signature must be 64 bytes".to_string()))?;

        let pubkey = Pubkey::from_str(public_key)
            .map_err(|_| AppError::InvalidAddress(format!("Invalid public key: {}", public_key)))?;

        let verify_key = VerifyingKey::from_bytes(&pubkey.to_bytes())
            .map_err(|_| AppError::InvalidSignature("Invalid verification key".to_string()))?;

        verify_key
            .verify_strict(message.as_bytes(), &Signature::from_bytes(&sig_array))
            .map_err(|_| AppError::InvalidSignature("Signature verification failed".to_string()))
    }
}

/// Sign `message` with the validator keypair, base64 encoded
pub fn sign_message(keypair: &Keypair, message: &str) -> String {
    let signature = keypair.sign_message(message.as_bytes());
    BASE64.encode(signature.as_ref())
}
