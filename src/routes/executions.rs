use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;

use crate::db::models::TaskExecution;
use crate::error::AppResult;
use crate::services::coordinator::ManualRunCoordinator;
use crate::AppState;

#[derive(Debug, Deserialize, Default)]
pub struct RunNowParams {
    /// Fail over an in-flight execution instead of rejecting with 409.
    #[serde(default)]
    pub force: bool,
    /// Preview mode: run the pipeline but send no notifications.
    #[serde(default)]
    pub suppress_notifications: bool,
}

/// Trigger a manual run. The public REST API proxies "Run Now" here.
pub async fn run_now(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
    Query(params): Query<RunNowParams>,
) -> AppResult<Json<TaskExecution>> {
    let execution = ManualRunCoordinator::start_task_execution(
        &state,
        &task_id,
        params.force,
        params.suppress_notifications,
    )
    .await?;

    Ok(Json(execution))
}
