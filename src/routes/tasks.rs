use std::sync::Arc;

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::db::models::TaskState;
use crate::db::repository::TaskRepository;
use crate::error::{AppError, AppResult};
use crate::services::tasks::{ActivationContext, TaskService};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct TransitionBody {
    /// The state the caller observed; the transition CAS-checks against it.
    pub from: String,
    pub to: String,
}

/// Perform a task state transition, keeping the scheduler in lock-step.
pub async fn transition(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
    Json(body): Json<TransitionBody>,
) -> AppResult<Json<Value>> {
    let from = TaskState::from_str(&body.from)
        .ok_or_else(|| AppError::Validation(format!("unknown state '{}'", body.from)))?;
    let to = TaskState::from_str(&body.to)
        .ok_or_else(|| AppError::Validation(format!("unknown state '{}'", body.to)))?;

    let service = TaskService::new(&state);

    let activation = if to == TaskState::Active {
        let task = TaskRepository::find_by_id(&state.db, &task_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Task {}", task_id)))?;
        Some(ActivationContext {
            user_id: task.user_id,
            task_name: task.name,
            schedule: task.schedule,
        })
    } else {
        None
    };

    service.transition(&task_id, from, to, activation).await?;

    Ok(Json(json!({ "state": to.as_str() })))
}
