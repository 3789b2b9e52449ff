//! Error types for the File Relay server

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::hash::ContentHash;

/// HTTP-facing result type
pub type Result<T> = std::result::Result<T, AppError>;

/// Errors returned by the ingestion endpoint
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Identical content is already being delivered: {0}")]
    DuplicateInFlight(ContentHash),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Why the publisher refused a file
#[derive(Error, Debug)]
pub enum AcceptError {
    #[error("Identical content is already being delivered: {0}")]
    DuplicateInFlight(ContentHash),

    #[error("Failed to encode delivery message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Failed to publish delivery message: {0}")]
    Publish(#[from] BrokerError),
}

/// A queue payload that cannot be turned into a delivery message
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Malformed delivery message: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Broker errors
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Queue database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    #[error("Broker refused message for queue {0}")]
    Nacked(String),

    #[error("Unknown delivery tag: {0}")]
    UnknownDelivery(i64),

    #[error("Broker connection closed")]
    Closed,
}

/// Remote storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to connect to remote storage: {0}")]
    Connect(String),

    #[error("Upload to {path} failed: {reason}")]
    Upload { path: String, reason: String },

    #[error("Upload timed out after {0}s")]
    Timeout(u64),

    #[error("Invalid remote path: {0}")]
    InvalidPath(String),

    #[error("Storage configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<AcceptError> for AppError {
    fn from(e: AcceptError) -> Self {
        match e {
            AcceptError::DuplicateInFlight(hash) => AppError::DuplicateInFlight(hash),
            other => AppError::Internal(other.to_string()),
        }
    }
}

/// Error response body
#[derive(Serialize)]
struct ErrorResponse {
    status: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    hash: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, kind, message, hash) = match &self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone(), None),
            AppError::DuplicateInFlight(hash) => (
                StatusCode::BAD_REQUEST,
                "duplicate_in_flight",
                "A file with identical content is already being processed. Try again later."
                    .to_string(),
                Some(hash.to_string()),
            ),
            AppError::Unavailable(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "unavailable",
                msg.clone(),
                None,
            ),
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "An error occurred while processing the file".to_string(),
                    None,
                )
            }
        };

        let body = Json(ErrorResponse {
            status: kind,
            message,
            hash,
        });

        (status, body).into_response()
    }
}
