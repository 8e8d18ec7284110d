use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use roster_store::StoreError;
use serde::Serialize;
use thiserror::Error;

/// Errors surfaced by the synchronization core.
#[derive(Debug, Error)]
pub enum NodeError {
    /// The node cannot start with the given settings.
    #[error("configuration error: {0}")]
    Config(String),

    /// The shared store could not be reached; shared state is unknown.
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("another instance is already running as node {0}")]
    Impostor(String),

    #[error("{0} is not an active proxy id")]
    UnknownProxy(String),
}

pub type Result<T> = std::result::Result<T, NodeError>;

/// A pub/sub message that could not be understood.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    Json(#[from] serde_json::Error),
}

/// API error response structure
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: None,
        }
    }

    pub fn with_details(error: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: Some(details.into()),
        }
    }
}

/// HTTP-facing error type
#[derive(Debug)]
pub enum AppError {
    Node(NodeError),
    Validation(String),
    NoSession(String),
    AlreadyOnline(String),
    /// A dispatched lifecycle task panicked or was cancelled.
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Node(err) => {
                let (status, message) = match &err {
                    NodeError::Store(store_err) => {
                        tracing::error!(%store_err, "shared store unavailable");
                        (
                            StatusCode::SERVICE_UNAVAILABLE,
                            "Shared state is temporarily unavailable",
                        )
                    }
                    NodeError::UnknownProxy(_) => (StatusCode::NOT_FOUND, "Unknown proxy id"),
                    NodeError::Config(_) | NodeError::Impostor(_) => {
                        tracing::error!(?err, "node error");
                        (
                            StatusCode::INTERNAL_SERVER_ERROR,
                            "An internal error occurred. Please try again later.",
                        )
                    }
                };
                (status, Json(ErrorResponse::new(message))).into_response()
            }
            AppError::Validation(msg) => {
                tracing::warn!(validation_error = %msg, "Validation failed");
                (StatusCode::BAD_REQUEST, Json(ErrorResponse::new(msg))).into_response()
            }
            AppError::NoSession(player) => (
                StatusCode::NOT_FOUND,
                Json(ErrorResponse::with_details(
                    "Player is not connected to this proxy",
                    player,
                )),
            )
                .into_response(),
            AppError::AlreadyOnline(player) => (
                StatusCode::CONFLICT,
                Json(ErrorResponse::with_details(
                    "You are already logged on to this network",
                    player,
                )),
            )
                .into_response(),
            AppError::Internal(msg) => {
                tracing::error!(error = %msg, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorResponse::new(
                        "An internal error occurred. Please try again later.",
                    )),
                )
                    .into_response()
            }
        }
    }
}

impl From<NodeError> for AppError {
    fn from(err: NodeError) -> Self {
        AppError::Node(err)
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        AppError::Node(NodeError::Store(err))
    }
}

impl From<crate::validation::ValidationError> for AppError {
    fn from(err: crate::validation::ValidationError) -> Self {
        AppError::Validation(err.to_string())
    }
}
