use chrono::{NaiveDateTime, Utc};
use sqlx::SqlitePool;

use crate::db::models::{Task, TaskState};
use crate::error::{AppError, AppResult};

const TASK_COLUMNS: &str = r#"
    id, user_id, name, search_query, condition_description, schedule,
    state, state_changed_at, notify_behavior, notification_channels,
    notification_email, webhook_url, webhook_secret, last_execution_id,
    last_known_state, next_run, created_at, updated_at
"#;

pub struct TaskRepository;

impl TaskRepository {
    pub async fn find_by_id(pool: &SqlitePool, id: &str) -> AppResult<Option<Task>> {
        let row = sqlx::query_as::<_, Task>(&format!(
            "SELECT {} FROM tasks WHERE id = ?",
            TASK_COLUMNS
        ))
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    /// All tasks, used by startup reconciliation.
    pub async fn list_all(pool: &SqlitePool) -> AppResult<Vec<Task>> {
        let rows = sqlx::query_as::<_, Task>(&format!(
            "SELECT {} FROM tasks ORDER BY created_at",
            TASK_COLUMNS
        ))
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }

    /// Compare-and-swap state update. Returns false when zero rows matched,
    /// meaning the task state changed concurrently (or the task is gone).
    pub async fn update_state_cas(
        pool: &SqlitePool,
        id: &str,
        to: TaskState,
        expected: TaskState,
    ) -> AppResult<bool> {
        let now = Utc::now().naive_utc();
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET state = ?, state_changed_at = ?, updated_at = ?
            WHERE id = ? AND state = ?
            "#,
        )
        .bind(to.as_str())
        .bind(now)
        .bind(now)
        .bind(id)
        .bind(expected.as_str())
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected() > 0)
    }

    /// Unconditional state write, used only to roll back a failed transition.
    pub async fn force_state(pool: &SqlitePool, id: &str, state: TaskState) -> AppResult<()> {
        let now = Utc::now().naive_utc();
        sqlx::query("UPDATE tasks SET state = ?, state_changed_at = ?, updated_at = ? WHERE id = ?")
            .bind(state.as_str())
            .bind(now)
            .bind(now)
            .bind(id)
            .execute(pool)
            .await
            .map_err(AppError::Database)?;

        Ok(())
    }

    pub async fn set_next_run(
        pool: &SqlitePool,
        id: &str,
        next_run: Option<NaiveDateTime>,
    ) -> AppResult<()> {
        sqlx::query("UPDATE tasks SET next_run = ?, updated_at = ? WHERE id = ?")
            .bind(next_run)
            .bind(Utc::now().naive_utc())
            .bind(id)
            .execute(pool)
            .await
            .map_err(AppError::Database)?;

        Ok(())
    }

    /// Rename a task, used for agent-provided auto-naming.
    pub async fn rename(pool: &SqlitePool, id: &str, name: &str) -> AppResult<()> {
        sqlx::query("UPDATE tasks SET name = ?, updated_at = ? WHERE id = ?")
            .bind(name)
            .bind(Utc::now().naive_utc())
            .bind(id)
            .execute(pool)
            .await
            .map_err(AppError::Database)?;

        Ok(())
    }

    pub async fn count(pool: &SqlitePool) -> AppResult<i64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM tasks")
            .fetch_one(pool)
            .await
            .map_err(AppError::Database)?;

        Ok(count.0)
    }

    pub async fn count_by_state(pool: &SqlitePool, state: TaskState) -> AppResult<i64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM tasks WHERE state = ?")
            .bind(state.as_str())
            .fetch_one(pool)
            .await
            .map_err(AppError::Database)?;

        Ok(count.0)
    }
}
