use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Audit row for one webhook attempt.
///
/// Exactly one of `delivered_at`, `failed_at`, `next_retry_at` is set:
/// the attempt was delivered, exhausted its retries, or is pending a retry.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub id: String,
    pub task_id: String,
    pub execution_id: String,
    pub webhook_url: String,
    /// JSON snapshot of the payload actually sent.
    pub payload: String,
    pub signature: Option<String>,
    pub http_status: Option<i64>,
    pub error_message: Option<String>,
    pub attempt_number: i64,
    pub delivered_at: Option<NaiveDateTime>,
    pub failed_at: Option<NaiveDateTime>,
    pub next_retry_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateWebhookDelivery {
    pub task_id: String,
    pub execution_id: String,
    pub webhook_url: String,
    pub payload: String,
    pub signature: Option<String>,
    pub http_status: Option<i64>,
    pub error_message: Option<String>,
    pub attempt_number: i64,
    pub delivered_at: Option<NaiveDateTime>,
    pub failed_at: Option<NaiveDateTime>,
    pub next_retry_at: Option<NaiveDateTime>,
}
