use chrono::NaiveDateTime;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::{CreateNotificationSend, NotificationSend};
use crate::error::{AppError, AppResult};

const SEND_COLUMNS: &str = r#"
    id, user_id, task_id, execution_id, recipient_email, notification_type,
    status, error_message, created_at
"#;

pub struct NotificationSendRepository;

impl NotificationSendRepository {
    pub async fn create(
        pool: &SqlitePool,
        send: CreateNotificationSend,
    ) -> AppResult<NotificationSend> {
        let id = Uuid::new_v4().to_string();
        let now = chrono::Utc::now().naive_utc();

        let row = sqlx::query_as::<_, NotificationSend>(&format!(
            r#"
            INSERT INTO notification_sends (
                id, user_id, task_id, execution_id, recipient_email,
                notification_type, status, error_message, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING {}
            "#,
            SEND_COLUMNS
        ))
        .bind(id)
        .bind(send.user_id)
        .bind(send.task_id)
        .bind(send.execution_id)
        .bind(send.recipient_email)
        .bind(send.notification_type)
        .bind(send.status)
        .bind(send.error_message)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    /// Successful sends to a recipient since the given instant.
    /// Feeds the hourly and daily spam caps.
    pub async fn count_success_since(
        pool: &SqlitePool,
        recipient_email: &str,
        since: NaiveDateTime,
    ) -> AppResult<i64> {
        let count: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM notification_sends
            WHERE recipient_email = ? AND status = 'success' AND created_at >= ?
            "#,
        )
        .bind(recipient_email)
        .bind(since)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(count.0)
    }

    pub async fn list_for_execution(
        pool: &SqlitePool,
        execution_id: &str,
    ) -> AppResult<Vec<NotificationSend>> {
        let rows = sqlx::query_as::<_, NotificationSend>(&format!(
            "SELECT {} FROM notification_sends WHERE execution_id = ? ORDER BY created_at",
            SEND_COLUMNS
        ))
        .bind(execution_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }
}
