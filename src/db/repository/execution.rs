use chrono::{NaiveDateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::{ExecutionStatus, TaskExecution};
use crate::error::{AppError, AppResult};

const EXECUTION_COLUMNS: &str = r#"
    id, task_id, status, started_at, completed_at, result, error_message,
    notification, change_summary, grounding_sources, retry_count, is_first,
    created_at
"#;

/// Fields written when an execution finishes successfully.
#[derive(Debug, Clone)]
pub struct FinalizeSuccess {
    /// Full agent payload as JSON.
    pub result: String,
    pub notification: Option<String>,
    pub change_summary: String,
    /// JSON array of grounding sources.
    pub grounding_sources: String,
    /// New value for tasks.last_known_state.
    pub last_known_state: Option<String>,
}

pub struct ExecutionRepository;

impl ExecutionRepository {
    /// Insert a new PENDING execution inside a transaction that also verifies
    /// no other execution is in flight for the task. The partial unique index
    /// on (task_id) WHERE status IN ('pending','running') backstops the check
    /// under concurrent inserts.
    ///
    /// `retry_count` is inherited from the most recent execution; `is_first`
    /// is computed here, when the record is created, not when emails go out.
    pub async fn create_pending(pool: &SqlitePool, task_id: &str) -> AppResult<TaskExecution> {
        let mut tx = pool.begin().await.map_err(AppError::Database)?;

        let in_flight: Option<(String,)> = sqlx::query_as(
            "SELECT id FROM task_executions WHERE task_id = ? AND status IN ('pending', 'running')",
        )
        .bind(task_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(AppError::Database)?;

        if in_flight.is_some() {
            return Err(AppError::ExecutionAlreadyRunning(task_id.to_string()));
        }

        let previous: Option<(i64,)> = sqlx::query_as(
            "SELECT retry_count FROM task_executions WHERE task_id = ? ORDER BY started_at DESC LIMIT 1",
        )
        .bind(task_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(AppError::Database)?;

        let is_first = previous.is_none();
        let retry_count = previous.map(|(count,)| count).unwrap_or(0);

        let execution = Self::insert_pending(&mut tx, task_id, retry_count, is_first).await?;

        tx.commit().await.map_err(AppError::Database)?;
        Ok(execution)
    }

    /// Variant of `create_pending` that first fails over a stuck in-flight
    /// execution instead of rejecting. Used by force runs.
    pub async fn create_pending_force(
        pool: &SqlitePool,
        task_id: &str,
        override_message: &str,
    ) -> AppResult<TaskExecution> {
        let mut tx = pool.begin().await.map_err(AppError::Database)?;
        let now = Utc::now().naive_utc();

        sqlx::query(
            r#"
            UPDATE task_executions
            SET status = 'failed', error_message = ?, completed_at = ?,
                retry_count = retry_count + 1
            WHERE task_id = ? AND status IN ('pending', 'running')
            "#,
        )
        .bind(override_message)
        .bind(now)
        .bind(task_id)
        .execute(&mut *tx)
        .await
        .map_err(AppError::Database)?;

        let previous: Option<(i64,)> = sqlx::query_as(
            "SELECT retry_count FROM task_executions WHERE task_id = ? ORDER BY started_at DESC LIMIT 1",
        )
        .bind(task_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(AppError::Database)?;

        let is_first = previous.is_none();
        let retry_count = previous.map(|(count,)| count).unwrap_or(0);

        let execution = Self::insert_pending(&mut tx, task_id, retry_count, is_first).await?;

        tx.commit().await.map_err(AppError::Database)?;
        Ok(execution)
    }

    async fn insert_pending(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        task_id: &str,
        retry_count: i64,
        is_first: bool,
    ) -> AppResult<TaskExecution> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().naive_utc();

        let row = sqlx::query_as::<_, TaskExecution>(&format!(
            r#"
            INSERT INTO task_executions (id, task_id, status, started_at, retry_count, is_first, created_at)
            VALUES (?, ?, 'pending', ?, ?, ?, ?)
            RETURNING {}
            "#,
            EXECUTION_COLUMNS
        ))
        .bind(id)
        .bind(task_id)
        .bind(now)
        .bind(retry_count)
        .bind(is_first)
        .bind(now)
        .fetch_one(&mut **tx)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn find_by_id(pool: &SqlitePool, id: &str) -> AppResult<Option<TaskExecution>> {
        let row = sqlx::query_as::<_, TaskExecution>(&format!(
            "SELECT {} FROM task_executions WHERE id = ?",
            EXECUTION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn find_in_flight(
        pool: &SqlitePool,
        task_id: &str,
    ) -> AppResult<Option<TaskExecution>> {
        let row = sqlx::query_as::<_, TaskExecution>(&format!(
            "SELECT {} FROM task_executions WHERE task_id = ? AND status IN ('pending', 'running')",
            EXECUTION_COLUMNS
        ))
        .bind(task_id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn mark_running(pool: &SqlitePool, id: &str) -> AppResult<()> {
        sqlx::query("UPDATE task_executions SET status = 'running' WHERE id = ? AND status = 'pending'")
            .bind(id)
            .execute(pool)
            .await
            .map_err(AppError::Database)?;

        Ok(())
    }

    /// Mark an execution FAILED. A no-op when the row is already terminal, so
    /// a reaped or force-overridden execution can be finalized twice safely.
    /// Bumps the monotonic failure counter.
    pub async fn mark_failed(pool: &SqlitePool, id: &str, error_message: &str) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE task_executions
            SET status = 'failed', error_message = ?, completed_at = ?,
                retry_count = retry_count + 1
            WHERE id = ? AND status IN ('pending', 'running')
            "#,
        )
        .bind(error_message)
        .bind(Utc::now().naive_utc())
        .bind(id)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected() > 0)
    }

    /// Finalize a successful execution and patch the owning task in one
    /// transaction: execution row gets its terminal fields, the task gets
    /// last_execution_id and last_known_state. A no-op when the execution is
    /// already terminal.
    pub async fn finalize_success(
        pool: &SqlitePool,
        task_id: &str,
        execution_id: &str,
        args: FinalizeSuccess,
    ) -> AppResult<bool> {
        let mut tx = pool.begin().await.map_err(AppError::Database)?;
        let now = Utc::now().naive_utc();

        let updated = sqlx::query(
            r#"
            UPDATE task_executions
            SET status = 'success', result = ?, completed_at = ?,
                notification = ?, change_summary = ?, grounding_sources = ?
            WHERE id = ? AND status IN ('pending', 'running')
            "#,
        )
        .bind(&args.result)
        .bind(now)
        .bind(&args.notification)
        .bind(&args.change_summary)
        .bind(&args.grounding_sources)
        .bind(execution_id)
        .execute(&mut *tx)
        .await
        .map_err(AppError::Database)?;

        if updated.rows_affected() == 0 {
            // Already terminal; leave both tables untouched.
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE tasks
            SET last_known_state = ?, last_execution_id = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&args.last_known_state)
        .bind(execution_id)
        .bind(now)
        .bind(task_id)
        .execute(&mut *tx)
        .await
        .map_err(AppError::Database)?;

        tx.commit().await.map_err(AppError::Database)?;
        Ok(true)
    }

    /// Most recent completed executions, newest first. Feeds the bounded
    /// history block of the agent prompt.
    pub async fn recent_completed(
        pool: &SqlitePool,
        task_id: &str,
        limit: i64,
    ) -> AppResult<Vec<TaskExecution>> {
        let rows = sqlx::query_as::<_, TaskExecution>(&format!(
            r#"
            SELECT {} FROM task_executions
            WHERE task_id = ? AND completed_at IS NOT NULL
            ORDER BY completed_at DESC
            LIMIT ?
            "#,
            EXECUTION_COLUMNS
        ))
        .bind(task_id)
        .bind(limit)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }

    /// Find RUNNING executions older than the cutoff and fail them.
    /// Returns the number of reaped rows.
    pub async fn reap_stale(
        pool: &SqlitePool,
        cutoff: NaiveDateTime,
        error_message: &str,
    ) -> AppResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE task_executions
            SET status = 'failed', error_message = ?, completed_at = ?,
                retry_count = retry_count + 1
            WHERE status = 'running' AND started_at < ?
            "#,
        )
        .bind(error_message)
        .bind(Utc::now().naive_utc())
        .bind(cutoff)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected())
    }

    /// Merge additional keys into an execution's result JSON. Used for
    /// delivery bookkeeping flags such as notification_failed.
    pub async fn merge_result(
        pool: &SqlitePool,
        execution_id: &str,
        patch: serde_json::Value,
    ) -> AppResult<()> {
        let current: Option<(Option<String>,)> =
            sqlx::query_as("SELECT result FROM task_executions WHERE id = ?")
                .bind(execution_id)
                .fetch_optional(pool)
                .await
                .map_err(AppError::Database)?;

        let Some((raw,)) = current else {
            return Ok(());
        };

        let mut value: serde_json::Value = raw
            .as_deref()
            .and_then(|r| serde_json::from_str(r).ok())
            .unwrap_or_else(|| serde_json::json!({}));

        if let (Some(obj), Some(patch_obj)) = (value.as_object_mut(), patch.as_object()) {
            for (key, val) in patch_obj {
                obj.insert(key.clone(), val.clone());
            }
        }

        sqlx::query("UPDATE task_executions SET result = ? WHERE id = ?")
            .bind(value.to_string())
            .bind(execution_id)
            .execute(pool)
            .await
            .map_err(AppError::Database)?;

        Ok(())
    }

    pub async fn count_by_status(pool: &SqlitePool, status: ExecutionStatus) -> AppResult<i64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM task_executions WHERE status = ?")
            .bind(status.as_str())
            .fetch_one(pool)
            .await
            .map_err(AppError::Database)?;

        Ok(count.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seed_task(pool: &SqlitePool, id: &str) {
        sqlx::query("INSERT OR IGNORE INTO users (id, email) VALUES ('u1', 'owner@example.com')")
            .execute(pool)
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO tasks (id, user_id, name, search_query) VALUES (?, 'u1', 'watch', 'q')",
        )
        .bind(id)
        .execute(pool)
        .await
        .unwrap();
    }

    fn finalize_args() -> FinalizeSuccess {
        FinalizeSuccess {
            result: r#"{"evidence":"found"}"#.to_string(),
            notification: None,
            change_summary: "found".to_string(),
            grounding_sources: "[]".to_string(),
            last_known_state: Some(r#"{"evidence":"found"}"#.to_string()),
        }
    }

    #[tokio::test]
    async fn at_most_one_in_flight_execution_per_task() {
        let pool = crate::db::test_pool().await;
        seed_task(&pool, "t1").await;

        let first = ExecutionRepository::create_pending(&pool, "t1").await.unwrap();
        assert!(first.is_first);
        assert_eq!(first.retry_count, 0);

        let err = ExecutionRepository::create_pending(&pool, "t1").await.unwrap_err();
        assert!(matches!(err, AppError::ExecutionAlreadyRunning(_)));

        // Still exactly one in-flight row.
        let in_flight = ExecutionRepository::find_in_flight(&pool, "t1").await.unwrap();
        assert_eq!(in_flight.unwrap().id, first.id);
    }

    #[tokio::test]
    async fn second_execution_is_not_first_and_inherits_retry_count() {
        let pool = crate::db::test_pool().await;
        seed_task(&pool, "t1").await;

        let first = ExecutionRepository::create_pending(&pool, "t1").await.unwrap();
        ExecutionRepository::mark_failed(&pool, &first.id, "boom").await.unwrap();

        let second = ExecutionRepository::create_pending(&pool, "t1").await.unwrap();
        assert!(!second.is_first);
        // The failure bumped the counter; the successor inherits it.
        assert_eq!(second.retry_count, 1);
    }

    #[tokio::test]
    async fn finalize_is_a_noop_on_terminal_executions() {
        let pool = crate::db::test_pool().await;
        seed_task(&pool, "t1").await;

        let execution = ExecutionRepository::create_pending(&pool, "t1").await.unwrap();
        ExecutionRepository::mark_running(&pool, &execution.id).await.unwrap();

        assert!(ExecutionRepository::finalize_success(&pool, "t1", &execution.id, finalize_args())
            .await
            .unwrap());

        // A second finalize changes nothing and reports the no-op.
        assert!(!ExecutionRepository::finalize_success(&pool, "t1", &execution.id, finalize_args())
            .await
            .unwrap());

        // Marking a succeeded execution failed is also a no-op.
        assert!(!ExecutionRepository::mark_failed(&pool, &execution.id, "late failure")
            .await
            .unwrap());

        let row = ExecutionRepository::find_by_id(&pool, &execution.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, "success");
        assert!(row.completed_at.is_some());
        assert!(row.error_message.is_none());
    }

    #[tokio::test]
    async fn finalize_patches_owning_task() {
        let pool = crate::db::test_pool().await;
        seed_task(&pool, "t1").await;

        let execution = ExecutionRepository::create_pending(&pool, "t1").await.unwrap();
        ExecutionRepository::finalize_success(&pool, "t1", &execution.id, finalize_args())
            .await
            .unwrap();

        let task: (Option<String>, Option<String>) =
            sqlx::query_as("SELECT last_execution_id, last_known_state FROM tasks WHERE id = 't1'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(task.0.as_deref(), Some(execution.id.as_str()));
        assert!(task.1.unwrap().contains("found"));
    }

    #[tokio::test]
    async fn reaper_fails_only_old_running_executions() {
        let pool = crate::db::test_pool().await;
        seed_task(&pool, "t1").await;
        seed_task(&pool, "t2").await;

        let old_start = Utc::now().naive_utc() - chrono::Duration::minutes(45);
        sqlx::query(
            "INSERT INTO task_executions (id, task_id, status, started_at) VALUES ('stuck', 't1', 'running', ?)",
        )
        .bind(old_start)
        .execute(&pool)
        .await
        .unwrap();

        let fresh = ExecutionRepository::create_pending(&pool, "t2").await.unwrap();
        ExecutionRepository::mark_running(&pool, &fresh.id).await.unwrap();

        let cutoff = Utc::now().naive_utc() - chrono::Duration::minutes(30);
        let reaped = ExecutionRepository::reap_stale(&pool, cutoff, "execution exceeded maximum runtime")
            .await
            .unwrap();
        assert_eq!(reaped, 1);

        let stuck = ExecutionRepository::find_by_id(&pool, "stuck").await.unwrap().unwrap();
        assert_eq!(stuck.status, "failed");
        assert!(stuck.error_message.unwrap().contains("maximum runtime"));
        assert!(stuck.completed_at.is_some());

        let fresh = ExecutionRepository::find_by_id(&pool, &fresh.id).await.unwrap().unwrap();
        assert_eq!(fresh.status, "running");
    }

    #[tokio::test]
    async fn merge_result_preserves_existing_keys() {
        let pool = crate::db::test_pool().await;
        seed_task(&pool, "t1").await;

        let execution = ExecutionRepository::create_pending(&pool, "t1").await.unwrap();
        ExecutionRepository::finalize_success(&pool, "t1", &execution.id, finalize_args())
            .await
            .unwrap();

        ExecutionRepository::merge_result(
            &pool,
            &execution.id,
            serde_json::json!({ "notification_failed": true }),
        )
        .await
        .unwrap();

        let row = ExecutionRepository::find_by_id(&pool, &execution.id).await.unwrap().unwrap();
        let result: serde_json::Value = serde_json::from_str(&row.result.unwrap()).unwrap();
        assert_eq!(result["evidence"], "found");
        assert_eq!(result["notification_failed"], true);
    }
}
