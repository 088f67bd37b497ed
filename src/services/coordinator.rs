//! Manual-run coordination.
//!
//! "Run Now" requests go through here: at most one in-flight execution per
//! task, user-initiated runs take precedence over pending scheduled retries,
//! and a force run fails over a stuck execution instead of queueing behind it.

use std::sync::Arc;

use crate::db::models::TaskExecution;
use crate::db::repository::{ExecutionRepository, TaskRepository};
use crate::error::{AppError, AppResult};
use crate::services::orchestrator::Orchestrator;
use crate::services::scheduler::task_job_id;
use crate::AppState;

const OVERRIDE_MESSAGE: &str = "Execution overridden by manual force run";

pub struct ManualRunCoordinator;

impl ManualRunCoordinator {
    /// Start a manual execution for a task.
    ///
    /// Without `force`, an in-flight execution rejects the request. With
    /// `force`, the in-flight row is failed over and a fresh one is created;
    /// both happen in one transaction. The pending scheduled job (often a
    /// failure retry) is cancelled best-effort: losing that race is fine
    /// because the losing side resolves against the in-flight check.
    pub async fn start_task_execution(
        state: &Arc<AppState>,
        task_id: &str,
        force: bool,
        suppress_notifications: bool,
    ) -> AppResult<TaskExecution> {
        let task = TaskRepository::find_by_id(&state.db, task_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Task {}", task_id)))?;

        let execution = if force {
            ExecutionRepository::create_pending_force(&state.db, task_id, OVERRIDE_MESSAGE).await?
        } else {
            ExecutionRepository::create_pending(&state.db, task_id).await?
        };

        if state.scheduler.remove_job(&task_job_id(task_id)) {
            tracing::info!(
                "Cancelled pending scheduled run for task {} in favor of manual run",
                task_id
            );
        }

        tracing::info!(
            "Starting manual execution {} for task {} (force={}, suppress={})",
            execution.id,
            task_id,
            force,
            suppress_notifications
        );

        let state = state.clone();
        let task_id = task_id.to_string();
        let execution_id = execution.id.clone();
        let user_id = task.user_id.clone();
        let task_name = task.name.clone();
        tokio::spawn(async move {
            if let Err(e) = Orchestrator::execute_manual(
                &state,
                &task_id,
                &execution_id,
                &user_id,
                &task_name,
                suppress_notifications,
            )
            .await
            {
                tracing::error!("Manual execution {} failed: {}", execution_id, e);
            }
        });

        Ok(execution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::services::agent::{AgentError, AgentResponse, MonitoringAgent};
    use crate::services::email::{EmailProvider, EmailService, ProviderResult};
    use crate::services::scheduler::{JobArgs, Scheduler};
    use crate::services::webhook::WebhookDeliveryService;
    use async_trait::async_trait;
    use chrono::Utc;

    struct QuietAgent;

    #[async_trait]
    impl MonitoringAgent for QuietAgent {
        async fn call(&self, _prompt: &str) -> Result<AgentResponse, AgentError> {
            Ok(AgentResponse {
                evidence: "nothing new".to_string(),
                notification: None,
                sources: vec![],
                confidence: 30,
                next_run: Some(Utc::now().naive_utc() + chrono::Duration::days(1)),
                topic: None,
            })
        }
    }

    struct OkProvider;

    #[async_trait]
    impl EmailProvider for OkProvider {
        async fn trigger(
            &self,
            _workflow_id: &str,
            _recipient: &str,
            _payload: serde_json::Value,
        ) -> ProviderResult {
            ProviderResult {
                success: true,
                ..Default::default()
            }
        }
    }

    async fn test_state() -> Arc<AppState> {
        let config = Config::default();
        let pool = crate::db::test_pool().await;

        Arc::new(AppState {
            db: pool,
            scheduler: Scheduler::new(),
            agent: Arc::new(QuietAgent),
            email: Arc::new(EmailService::with_provider(
                config.email.clone(),
                Arc::new(OkProvider),
            )),
            webhook: Arc::new(WebhookDeliveryService::new(config.webhook.clone())),
            config,
        })
    }

    async fn seed_task(state: &Arc<AppState>, id: &str) {
        sqlx::query("INSERT OR IGNORE INTO users (id, email) VALUES ('u1', 'owner@example.com')")
            .execute(&state.db)
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO tasks (id, user_id, name, search_query, state) VALUES (?, 'u1', 'watch', 'q', 'active')",
        )
        .bind(id)
        .execute(&state.db)
        .await
        .unwrap();
    }

    async fn seed_running_execution(state: &Arc<AppState>, id: &str, task_id: &str, minutes_ago: i64) {
        sqlx::query(
            "INSERT INTO task_executions (id, task_id, status, started_at, retry_count) VALUES (?, ?, 'running', ?, 2)",
        )
        .bind(id)
        .bind(task_id)
        .bind(Utc::now().naive_utc() - chrono::Duration::minutes(minutes_ago))
        .execute(&state.db)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn rejects_when_execution_in_flight() {
        let state = test_state().await;
        seed_task(&state, "t1").await;
        seed_running_execution(&state, "e-old", "t1", 5).await;

        let err = ManualRunCoordinator::start_task_execution(&state, "t1", false, false)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ExecutionAlreadyRunning(_)));
    }

    #[tokio::test]
    async fn force_overrides_stuck_execution() {
        let state = test_state().await;
        seed_task(&state, "t1").await;
        // Stuck RUNNING for 45 minutes.
        seed_running_execution(&state, "e-old", "t1", 45).await;

        let execution = ManualRunCoordinator::start_task_execution(&state, "t1", true, false)
            .await
            .unwrap();

        let old: (String, Option<String>) = sqlx::query_as(
            "SELECT status, error_message FROM task_executions WHERE id = 'e-old'",
        )
        .fetch_one(&state.db)
        .await
        .unwrap();
        assert_eq!(old.0, "failed");
        assert!(old.1.unwrap().contains("overridden"));

        assert_eq!(execution.status, "pending");
        // Inherits the failure counter from the overridden row.
        assert_eq!(execution.retry_count, 3);
    }

    #[tokio::test]
    async fn cancels_pending_scheduled_retry() {
        let state = test_state().await;
        seed_task(&state, "t1").await;

        state.scheduler.add_date_job(
            "task-t1",
            Utc::now().naive_utc() + chrono::Duration::hours(1),
            JobArgs {
                task_id: "t1".to_string(),
                user_id: "u1".to_string(),
                task_name: "watch".to_string(),
            },
        );

        ManualRunCoordinator::start_task_execution(&state, "t1", false, false)
            .await
            .unwrap();

        assert!(state.scheduler.get_job("task-t1").is_none());
    }

    #[tokio::test]
    async fn missing_task_is_not_found() {
        let state = test_state().await;
        let err = ManualRunCoordinator::start_task_execution(&state, "ghost", false, false)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
