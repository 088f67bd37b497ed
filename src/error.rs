use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::services::agent::AgentError;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),

    #[error("Concurrent modification: {0}")]
    ConcurrentModification(String),

    #[error("An execution is already pending or running for task {0}")]
    ExecutionAlreadyRunning(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("Spam limit exceeded: {0}")]
    SpamLimitExceeded(String),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("Scheduler error: {0}")]
    Scheduler(String),

    #[error("Notification delivery error: {0}")]
    NotificationDelivery(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            AppError::InvalidTransition(msg) => {
                (StatusCode::BAD_REQUEST, "INVALID_TRANSITION", msg.clone())
            }
            AppError::ConcurrentModification(msg) => {
                (StatusCode::CONFLICT, "CONCURRENT_MODIFICATION", msg.clone())
            }
            AppError::ExecutionAlreadyRunning(_) => (
                StatusCode::CONFLICT,
                "EXECUTION_ALREADY_RUNNING",
                self.to_string(),
            ),
            AppError::Validation(msg) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "VALIDATION_ERROR",
                msg.clone(),
            ),
            AppError::RateLimited(msg) => {
                (StatusCode::TOO_MANY_REQUESTS, "RATE_LIMITED", msg.clone())
            }
            AppError::SpamLimitExceeded(msg) => (
                StatusCode::TOO_MANY_REQUESTS,
                "SPAM_LIMIT_EXCEEDED",
                msg.clone(),
            ),
            AppError::Agent(e) => {
                tracing::error!("Agent error: {:?}", e);
                (StatusCode::BAD_GATEWAY, "AGENT_ERROR", e.to_string())
            }
            AppError::Scheduler(msg) => {
                tracing::error!("Scheduler error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "SCHEDULER_ERROR",
                    msg.clone(),
                )
            }
            AppError::NotificationDelivery(msg) => {
                tracing::error!("Notification delivery error: {}", msg);
                (StatusCode::BAD_GATEWAY, "NOTIFICATION_ERROR", msg.clone())
            }
            AppError::Database(e) => {
                tracing::error!("Database error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "DATABASE_ERROR",
                    "A database error occurred".to_string(),
                )
            }
            AppError::Request(e) => {
                tracing::error!("HTTP request error: {:?}", e);
                (
                    StatusCode::BAD_GATEWAY,
                    "EXTERNAL_REQUEST_FAILED",
                    "Failed to communicate with external service".to_string(),
                )
            }
            AppError::Config(msg) => {
                tracing::error!("Configuration error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "CONFIG_ERROR",
                    "Server configuration error".to_string(),
                )
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                )
            }
        };

        let body = ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message,
            },
        };

        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
