use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Append-only audit row for one email attempt. Counted for spam caps.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct NotificationSend {
    pub id: String,
    pub user_id: String,
    pub task_id: Option<String>,
    pub execution_id: Option<String>,
    pub recipient_email: String,
    /// 'email' for task notifications, 'welcome' for the first-run email,
    /// 'verification' for code delivery.
    pub notification_type: String,
    /// 'success', 'failed' or 'skipped'.
    pub status: String,
    pub error_message: Option<String>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateNotificationSend {
    pub user_id: String,
    pub task_id: Option<String>,
    pub execution_id: Option<String>,
    pub recipient_email: String,
    pub notification_type: String,
    pub status: String,
    pub error_message: Option<String>,
}
