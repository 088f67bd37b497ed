use chrono::{NaiveDateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::EmailVerification;
use crate::error::{AppError, AppResult};

const VERIFICATION_COLUMNS: &str = r#"
    id, user_id, email, code, expires_at, attempts_left, verified,
    verified_at, created_at
"#;

pub struct EmailVerificationRepository;

impl EmailVerificationRepository {
    pub async fn create(
        pool: &SqlitePool,
        user_id: &str,
        email: &str,
        code: &str,
        expires_at: NaiveDateTime,
        attempts: i64,
    ) -> AppResult<EmailVerification> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().naive_utc();

        let row = sqlx::query_as::<_, EmailVerification>(&format!(
            r#"
            INSERT INTO email_verifications (
                id, user_id, email, code, expires_at, attempts_left,
                verified, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, 0, ?)
            RETURNING {}
            "#,
            VERIFICATION_COLUMNS
        ))
        .bind(id)
        .bind(user_id)
        .bind(email)
        .bind(code)
        .bind(expires_at)
        .bind(attempts)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    /// Latest unverified code for the (user, email) pair.
    pub async fn find_active(
        pool: &SqlitePool,
        user_id: &str,
        email: &str,
    ) -> AppResult<Option<EmailVerification>> {
        let row = sqlx::query_as::<_, EmailVerification>(&format!(
            r#"
            SELECT {} FROM email_verifications
            WHERE user_id = ? AND email = ? AND verified = 0
            ORDER BY created_at DESC
            LIMIT 1
            "#,
            VERIFICATION_COLUMNS
        ))
        .bind(user_id)
        .bind(email)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    /// Codes issued for the (user, email) pair since the given instant.
    /// Feeds the rolling-hour issuance limit.
    pub async fn count_issued_since(
        pool: &SqlitePool,
        user_id: &str,
        email: &str,
        since: NaiveDateTime,
    ) -> AppResult<i64> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM email_verifications WHERE user_id = ? AND email = ? AND created_at >= ?",
        )
        .bind(user_id)
        .bind(email)
        .bind(since)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(count.0)
    }

    pub async fn decrement_attempts(pool: &SqlitePool, id: &str) -> AppResult<i64> {
        let row: (i64,) = sqlx::query_as(
            r#"
            UPDATE email_verifications
            SET attempts_left = attempts_left - 1
            WHERE id = ? AND attempts_left > 0
            RETURNING attempts_left
            "#,
        )
        .bind(id)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row.0)
    }

    pub async fn mark_verified(pool: &SqlitePool, id: &str) -> AppResult<()> {
        sqlx::query("UPDATE email_verifications SET verified = 1, verified_at = ? WHERE id = ?")
            .bind(Utc::now().naive_utc())
            .bind(id)
            .execute(pool)
            .await
            .map_err(AppError::Database)?;

        Ok(())
    }
}
