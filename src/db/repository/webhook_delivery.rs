use chrono::{NaiveDateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::{CreateWebhookDelivery, WebhookDelivery};
use crate::error::{AppError, AppResult};

const DELIVERY_COLUMNS: &str = r#"
    id, task_id, execution_id, webhook_url, payload, signature, http_status,
    error_message, attempt_number, delivered_at, failed_at, next_retry_at,
    created_at
"#;

/// Repository for per-attempt webhook delivery audit rows.
///
/// Claiming a due retry uses an atomic single-statement UPDATE with a
/// subselect (`UPDATE ... WHERE id = (SELECT id ... LIMIT 1) RETURNING ...`)
/// so concurrent sweeps never pick up the same row. Claiming resolves the
/// row's pending state: the follow-up attempt gets its own row.
pub struct WebhookDeliveryRepository;

impl WebhookDeliveryRepository {
    pub async fn create(
        pool: &SqlitePool,
        delivery: CreateWebhookDelivery,
    ) -> AppResult<WebhookDelivery> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().naive_utc();

        let row = sqlx::query_as::<_, WebhookDelivery>(&format!(
            r#"
            INSERT INTO webhook_deliveries (
                id, task_id, execution_id, webhook_url, payload, signature,
                http_status, error_message, attempt_number, delivered_at,
                failed_at, next_retry_at, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING {}
            "#,
            DELIVERY_COLUMNS
        ))
        .bind(id)
        .bind(delivery.task_id)
        .bind(delivery.execution_id)
        .bind(delivery.webhook_url)
        .bind(delivery.payload)
        .bind(delivery.signature)
        .bind(delivery.http_status)
        .bind(delivery.error_message)
        .bind(delivery.attempt_number)
        .bind(delivery.delivered_at)
        .bind(delivery.failed_at)
        .bind(delivery.next_retry_at)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    /// Claim up to `limit` rows whose retry is due. Each claimed row is moved
    /// from pending-retry to resolved-failed in the same statement; the sweep
    /// then performs the next attempt and records it as a new row.
    pub async fn claim_due(
        pool: &SqlitePool,
        now: NaiveDateTime,
        limit: i64,
    ) -> AppResult<Vec<WebhookDelivery>> {
        let mut claimed: Vec<WebhookDelivery> = Vec::new();
        if limit <= 0 {
            return Ok(claimed);
        }

        for _ in 0..(limit as usize) {
            let opt = sqlx::query_as::<_, WebhookDelivery>(&format!(
                r#"
                UPDATE webhook_deliveries
                SET failed_at = ?, next_retry_at = NULL
                WHERE id = (
                    SELECT id FROM webhook_deliveries
                    WHERE delivered_at IS NULL
                      AND failed_at IS NULL
                      AND next_retry_at IS NOT NULL
                      AND next_retry_at <= ?
                    ORDER BY next_retry_at ASC
                    LIMIT 1
                )
                RETURNING {}
                "#,
                DELIVERY_COLUMNS
            ))
            .bind(now)
            .bind(now)
            .fetch_optional(pool)
            .await
            .map_err(AppError::Database)?;

            if let Some(row) = opt {
                claimed.push(row);
            } else {
                break;
            }
        }

        Ok(claimed)
    }

    pub async fn list_for_execution(
        pool: &SqlitePool,
        execution_id: &str,
    ) -> AppResult<Vec<WebhookDelivery>> {
        let rows = sqlx::query_as::<_, WebhookDelivery>(&format!(
            "SELECT {} FROM webhook_deliveries WHERE execution_id = ? ORDER BY attempt_number",
            DELIVERY_COLUMNS
        ))
        .bind(execution_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }
}
