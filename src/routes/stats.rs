use std::sync::Arc;

use axum::{extract::State, Json};
use serde::Serialize;

use crate::db::models::{ExecutionStatus, TaskState};
use crate::db::repository::{ExecutionRepository, TaskRepository, UserRepository};
use crate::error::AppResult;
use crate::AppState;

#[derive(Serialize)]
pub struct StatsResponse {
    pub users: i64,
    pub max_users: u32,
    pub tasks: i64,
    pub active_tasks: i64,
    pub running_executions: i64,
    pub scheduled_jobs: usize,
}

/// Operational counters. `max_users` is reported, not enforced.
pub async fn stats(State(state): State<Arc<AppState>>) -> AppResult<Json<StatsResponse>> {
    let users = UserRepository::count(&state.db).await?;
    let tasks = TaskRepository::count(&state.db).await?;
    let active_tasks = TaskRepository::count_by_state(&state.db, TaskState::Active).await?;
    let running_executions =
        ExecutionRepository::count_by_status(&state.db, ExecutionStatus::Running).await?;

    Ok(Json(StatsResponse {
        users,
        max_users: state.config.server.max_users,
        tasks,
        active_tasks,
        running_executions,
        scheduled_jobs: state.scheduler.job_count(),
    }))
}
