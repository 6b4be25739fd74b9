use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use sqlx::migrate::MigrateError;
use thiserror::Error;
use uuid::Uuid;

/// Top-level error type for the entire application
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Queue error: {0}")]
    Queue(#[from] lapin::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Settlement error: {0}")]
    Settlement(#[from] SettlementError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validator not found: {0}")]
    ValidatorNotFound(Uuid),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("External error: {0}")]
    ExternalError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors on the hub <-> validator duplex channel
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Unknown message type: {0}")]
    UnknownType(String),

    #[error("Handshake rejected for {public_key}: {reason}")]
    HandshakeRejected { public_key: String, reason: String },

    #[error("Reply from {validator_id} does not match dispatched probe {callback_id}")]
    ReplyMismatch { validator_id: Uuid, callback_id: String },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Handshake timed out")]
    HandshakeTimeout,

    #[error("Transport error: {0}")]
    Transport(String),
}

/// Errors raised while moving funds on the external ledger
#[derive(Error, Debug)]
pub enum SettlementError {
    #[error("Invalid recipient public key: {0}")]
    InvalidRecipient(String),

    #[error("Invalid platform keypair: {0}")]
    InvalidKeypair(String),

    #[error("Failed to fetch recent blockhash: {0}")]
    Blockhash(String),

    #[error("Transfer submission failed: {0}")]
    SubmissionFailed(String),

    #[error("Status query failed: {0}")]
    StatusQuery(String),

    #[error("Invalid blockhash: {0}")]
    InvalidBlockhash(String),

    #[error("Invalid transaction reference: {0}")]
    InvalidTxRef(String),

    #[error("Transfer amount must be greater than zero")]
    ZeroAmount,
}

/// API error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, message, details) = match self {
            AppError::ValidatorNotFound(id) => (
                StatusCode::NOT_FOUND,
                "VALIDATOR_NOT_FOUND",
                format!("Validator not found: {}", id),
                Some(serde_json::json!({ "validator_id": id })),
            ),
            AppError::InvalidInput(message) => (
                StatusCode::BAD_REQUEST,
                "INVALID_INPUT",
                message,
                None,
            ),
            AppError::InvalidSignature(message) => (
                StatusCode::UNAUTHORIZED,
                "INVALID_SIGNATURE",
                message,
                None,
            ),
            AppError::Queue(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "QUEUE_UNAVAILABLE",
                "Failed to queue payout".to_string(),
                None,
            ),
            AppError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                "A database error occurred".to_string(),
                None,
            ),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An internal error occurred".to_string(),
                None,
            ),
        };

        let body = Json(ErrorResponse {
            error: message,
            error_code: error_code.to_string(),
            details,
        });

        (status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(error: anyhow::Error) -> Self {
        AppError::Internal(format!("Error converting: {:?}", error))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(error: reqwest::Error) -> Self {
        AppError::ExternalError(format!("HTTP request error: {:?}", error))
    }
}

impl From<MigrateError> for AppError {
    fn from(error: MigrateError) -> Self {
        AppError::Internal(format!("Migration error: {:?}", error))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(error: config::ConfigError) -> Self {
        AppError::Config(error.to_string())
    }
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;
