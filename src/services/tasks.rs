//! Task state machine.
//!
//! Transitions keep the database row and the scheduler job in lock-step:
//! a conditional UPDATE acts as a compare-and-swap against the caller's
//! observed state, then the scheduler side effect runs, and a side-effect
//! failure rolls the row back. Startup reconciliation repairs anything a
//! failed rollback leaves behind.

use std::sync::Arc;

use sqlx::SqlitePool;

use crate::db::models::TaskState;
use crate::db::repository::TaskRepository;
use crate::error::{AppError, AppResult};
use crate::services::scheduler::{compute_next_run, task_job_id, JobArgs, Scheduler};
use crate::AppState;

/// Fields required to (re)create a scheduler job during activation.
#[derive(Debug, Clone)]
pub struct ActivationContext {
    pub user_id: String,
    pub task_name: String,
    pub schedule: Option<String>,
}

pub struct TaskService {
    pool: SqlitePool,
    scheduler: Scheduler,
}

impl TaskService {
    pub fn new(state: &Arc<AppState>) -> Self {
        Self {
            pool: state.db.clone(),
            scheduler: state.scheduler.clone(),
        }
    }

    pub fn with_parts(pool: SqlitePool, scheduler: Scheduler) -> Self {
        Self { pool, scheduler }
    }

    pub async fn activate(
        &self,
        task_id: &str,
        current_state: TaskState,
        activation: ActivationContext,
    ) -> AppResult<()> {
        self.transition(task_id, current_state, TaskState::Active, Some(activation))
            .await
    }

    pub async fn pause(&self, task_id: &str, current_state: TaskState) -> AppResult<()> {
        self.transition(task_id, current_state, TaskState::Paused, None)
            .await
    }

    pub async fn complete(&self, task_id: &str, current_state: TaskState) -> AppResult<()> {
        self.transition(task_id, current_state, TaskState::Completed, None)
            .await
    }

    /// Execute a state transition with validation and scheduler side effects.
    pub async fn transition(
        &self,
        task_id: &str,
        from: TaskState,
        to: TaskState,
        activation: Option<ActivationContext>,
    ) -> AppResult<()> {
        if !is_valid_transition(from, to) {
            return Err(AppError::InvalidTransition(format!(
                "cannot transition from {} to {}",
                from.as_str(),
                to.as_str()
            )));
        }

        if from == to {
            tracing::info!(
                "Task {} is already in state {}, no transition needed",
                task_id,
                to.as_str()
            );
            return Ok(());
        }

        let updated = TaskRepository::update_state_cas(&self.pool, task_id, to, from).await?;
        if !updated {
            return Err(AppError::ConcurrentModification(format!(
                "task {} state changed concurrently, expected {}",
                task_id,
                from.as_str()
            )));
        }

        match self.apply_scheduler_side_effect(task_id, to, activation) {
            Ok(action) => {
                tracing::info!(
                    "Task {} transitioned {} -> {} (schedule {})",
                    task_id,
                    from.as_str(),
                    to.as_str(),
                    action
                );
                Ok(())
            }
            Err(e) => {
                tracing::error!(
                    "Scheduler side effect failed for task {} ({} -> {}), rolling back: {}",
                    task_id,
                    from.as_str(),
                    to.as_str(),
                    e
                );
                if let Err(rollback_err) =
                    TaskRepository::force_state(&self.pool, task_id, from).await
                {
                    tracing::error!(
                        "ROLLBACK FAILED for task {}: state is inconsistent until the next \
                         reconciliation pass: {}",
                        task_id,
                        rollback_err
                    );
                }
                Err(e)
            }
        }
    }

    fn apply_scheduler_side_effect(
        &self,
        task_id: &str,
        to: TaskState,
        activation: Option<ActivationContext>,
    ) -> AppResult<&'static str> {
        let job_id = task_job_id(task_id);

        match to {
            TaskState::Active => {
                let ctx = activation.ok_or_else(|| {
                    AppError::Scheduler(
                        "cannot activate task: missing task_name, user_id, or schedule".to_string(),
                    )
                })?;

                let args = JobArgs {
                    task_id: task_id.to_string(),
                    user_id: ctx.user_id,
                    task_name: ctx.task_name,
                };
                let next_run = compute_next_run(ctx.schedule.as_deref());

                if self.scheduler.get_job(&job_id).is_some() {
                    // Resume and move the trigger to the freshly computed time.
                    self.scheduler.add_date_job(&job_id, next_run, args);
                    Ok("resumed")
                } else {
                    self.scheduler.add_date_job(&job_id, next_run, args);
                    Ok("created")
                }
            }
            TaskState::Paused => {
                if self.scheduler.pause_job(&job_id) {
                    Ok("paused")
                } else {
                    tracing::info!(
                        "Job {} not found when pausing - already deleted or never existed",
                        job_id
                    );
                    Ok("not_found_ok")
                }
            }
            TaskState::Completed => {
                if self.scheduler.remove_job(&job_id) {
                    Ok("deleted")
                } else {
                    tracing::info!(
                        "Job {} not found when removing - already deleted or never existed",
                        job_id
                    );
                    Ok("not_found_ok")
                }
            }
        }
    }
}

fn is_valid_transition(from: TaskState, to: TaskState) -> bool {
    if from == to {
        return true;
    }

    matches!(
        (from, to),
        (TaskState::Paused, TaskState::Active)
            | (TaskState::Active, TaskState::Paused)
            | (TaskState::Active, TaskState::Completed)
            | (TaskState::Completed, TaskState::Active)
    )
}
