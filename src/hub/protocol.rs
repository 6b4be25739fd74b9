use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{error::ProtocolError, ledger::models::TickStatus};

pub const SIGNUP: &str = "signup";
pub const VALIDATE: &str = "validate";

/// Message a validator signs to prove key ownership during the handshake
pub fn signup_message(callback_id: &str, public_key: &str) -> String {
    format!("Signed message for {}, {}", callback_id, public_key)
}

/// Message a validator signs on every probe reply
pub fn reply_message(callback_id: &str) -> String {
    format!("Replying to {}", callback_id)
}

/// `{ "type": ..., "data": ... }` frame shared by both directions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
}

impl Envelope {
    pub fn new<T: Serialize>(kind: &str, data: &T) -> Result<Self, ProtocolError> {
        let data = serde_json::to_value(data)
            .map_err(|e| ProtocolError::MalformedFrame(e.to_string()))?;
        Ok(Self {
            kind: kind.to_string(),
            data,
        })
    }

    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::MalformedFrame(e.to_string()))
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_value(self.data.clone())
            .map_err(|e| ProtocolError::MalformedFrame(format!("{} payload: {}", self.kind, e)))
    }

    pub fn to_text(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::MalformedFrame(e.to_string()))
    }
}

/// Validator -> hub handshake
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignupRequest {
    pub ip: String,
    pub public_key: String,
    pub signed_message: String,
    pub callback_id: String,
}

/// Hub -> validator handshake reply
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignupResponse {
    pub validator_id: Uuid,
    pub callback_id: String,
}

/// Hub -> validator probe task
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateRequest {
    pub url: String,
    pub callback_id: String,
    pub website_id: Uuid,
}

/// Validator -> hub probe result
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateResponse {
    pub callback_id: String,
    pub status: TickStatus,
    /// Milliseconds
    pub latency: f64,
    pub validator_id: Uuid,
    pub website_id: Uuid,
    pub signed_message: String,
}

/// Just enough of a reply frame to find its callback
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackRef {
    pub callback_id: String,
}

/// Frames the validator agent accepts
#[derive(Debug, Clone)]
pub enum AgentInbound {
    Signup(SignupResponse),
    Validate(ValidateRequest),
}

impl AgentInbound {
    pub fn from_text(text: &str) -> Result<Self, ProtocolError> {
        let envelope = Envelope::parse(text)?;
        match envelope.kind.as_str() {
            SIGNUP => Ok(AgentInbound::Signup(envelope.decode()?)),
            VALIDATE => Ok(AgentInbound::Validate(envelope.decode()?)),
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }
}

pub fn encode<T: Serialize>(kind: &str, data: &T) -> Result<String, ProtocolError> {
    Envelope::new(kind, data)?.to_text()
}
