use std::sync::Arc;

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{AppError, AppResult};
use crate::services::email::VerifyCodeOutcome;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct RequestCodeBody {
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct VerifyCodeBody {
    pub email: String,
    pub code: String,
}

/// Issue a verification code for a custom notification address.
pub async fn request_code(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    Json(body): Json<RequestCodeBody>,
) -> AppResult<Json<Value>> {
    if !body.email.contains('@') {
        return Err(AppError::Validation(format!(
            "'{}' is not an email address",
            body.email
        )));
    }

    state
        .email
        .request_verification(&state.db, &user_id, &body.email)
        .await?;

    Ok(Json(json!({ "sent": true })))
}

/// Check a submitted verification code.
pub async fn verify_code(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    Json(body): Json<VerifyCodeBody>,
) -> AppResult<Json<Value>> {
    let outcome = state
        .email
        .verify_code(&state.db, &user_id, &body.email, &body.code)
        .await?;

    match outcome {
        VerifyCodeOutcome::Verified => Ok(Json(json!({ "verified": true }))),
        VerifyCodeOutcome::InvalidCode { attempts_left } => Err(AppError::Validation(format!(
            "invalid code, {} attempt(s) left",
            attempts_left
        ))),
        VerifyCodeOutcome::Expired => {
            Err(AppError::Validation("verification code expired".to_string()))
        }
        VerifyCodeOutcome::Exhausted => Err(AppError::Validation(
            "too many failed attempts, request a new code".to_string(),
        )),
        VerifyCodeOutcome::NotFound => Err(AppError::NotFound(format!(
            "no pending verification for {}",
            body.email
        ))),
    }
}
