use chrono::Utc;
use sqlx::SqlitePool;

use crate::db::models::User;
use crate::error::{AppError, AppResult};

const USER_COLUMNS: &str = r#"
    id, email, verified_notification_emails, webhook_url, webhook_secret,
    webhook_enabled, created_at, updated_at
"#;

pub struct UserRepository;

impl UserRepository {
    pub async fn find_by_id(pool: &SqlitePool, id: &str) -> AppResult<Option<User>> {
        let row = sqlx::query_as::<_, User>(&format!(
            "SELECT {} FROM users WHERE id = ?",
            USER_COLUMNS
        ))
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    /// Append an address to the user's verified list. Idempotent.
    pub async fn add_verified_email(pool: &SqlitePool, id: &str, email: &str) -> AppResult<()> {
        let user = Self::find_by_id(pool, id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("User {}", id)))?;

        let mut verified = user.verified_emails();
        if verified.iter().any(|e| e == email) {
            return Ok(());
        }
        verified.push(email.to_string());

        sqlx::query("UPDATE users SET verified_notification_emails = ?, updated_at = ? WHERE id = ?")
            .bind(serde_json::to_string(&verified).unwrap_or_else(|_| "[]".to_string()))
            .bind(Utc::now().naive_utc())
            .bind(id)
            .execute(pool)
            .await
            .map_err(AppError::Database)?;

        Ok(())
    }

    pub async fn count(pool: &SqlitePool) -> AppResult<i64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM users")
            .fetch_one(pool)
            .await
            .map_err(AppError::Database)?;

        Ok(count.0)
    }
}
