//! Combined notification dispatch for task executions.
//!
//! Iterates a task's declared channels; a failure in one channel never blocks
//! the other. Email failures and webhook configuration errors surface as a
//! `notification_failed` flag on the execution result; a webhook attempt that
//! merely got an unhealthy HTTP response is not a dispatch failure, because a
//! retry is already scheduled for it.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use sqlx::SqlitePool;

use crate::db::models::{
    CreateNotificationSend, CreateWebhookDelivery, GroundingSource, NotificationChannel, Task,
    User,
};
use crate::db::repository::{
    NotificationSendRepository, TaskRepository, UserRepository, WebhookDeliveryRepository,
};
use crate::error::{AppError, AppResult};
use crate::services::email::EmailService;
use crate::services::webhook::{
    next_retry_time, WebhookDeliveryService, WebhookExecutionInfo, WebhookPayload,
    WebhookTaskInfo, CONDITION_MET_EVENT,
};
use crate::AppState;

/// Rows processed per webhook retry sweep.
const SWEEP_BATCH_SIZE: i64 = 50;

/// Everything the dispatcher needs to describe one execution's notification.
#[derive(Debug, Clone)]
pub struct ExecutionNotification {
    pub task_id: String,
    pub execution_id: String,
    pub user_id: String,
    pub task_name: String,
    pub notification: String,
    pub change_summary: String,
    pub sources: Vec<GroundingSource>,
}

/// Per-channel outcome of a dispatch.
#[derive(Debug, Clone, Copy, Default)]
pub struct DispatchOutcome {
    pub email_failed: bool,
    pub webhook_failed: bool,
}

impl DispatchOutcome {
    pub fn any_failed(&self) -> bool {
        self.email_failed || self.webhook_failed
    }
}

pub struct NotificationDispatcher {
    pool: SqlitePool,
    email: Arc<EmailService>,
    webhook: Arc<WebhookDeliveryService>,
}

impl NotificationDispatcher {
    pub fn new(state: &Arc<AppState>) -> Self {
        Self {
            pool: state.db.clone(),
            email: state.email.clone(),
            webhook: state.webhook.clone(),
        }
    }

    #[cfg(test)]
    pub fn with_parts(
        pool: SqlitePool,
        email: Arc<EmailService>,
        webhook: Arc<WebhookDeliveryService>,
    ) -> Self {
        Self {
            pool,
            email,
            webhook,
        }
    }

    /// Send the condition-met notification across the task's channels.
    pub async fn dispatch(&self, notification: &ExecutionNotification) -> AppResult<DispatchOutcome> {
        let (task, user) = self.load_context(&notification.task_id).await?;
        let mut outcome = DispatchOutcome::default();

        for channel in task.channels() {
            match channel {
                NotificationChannel::Email => {
                    if let Err(e) = self.send_email(&task, &user, notification).await {
                        tracing::error!(
                            "Email notification failed for task {}: {}",
                            task.id,
                            e
                        );
                        outcome.email_failed = true;
                    }
                }
                NotificationChannel::Webhook => {
                    if let Err(e) = self.send_webhook(&task, &user, notification).await {
                        tracing::error!(
                            "Webhook notification failed for task {}: {}",
                            task.id,
                            e
                        );
                        outcome.webhook_failed = true;
                    }
                }
            }
        }

        Ok(outcome)
    }

    /// Welcome email for a task's first execution, sent before any
    /// condition-met notification from the same run.
    pub async fn send_welcome(
        &self,
        task_id: &str,
        execution_id: &str,
        summary: &str,
        condition_met: bool,
        sources: &[GroundingSource],
    ) -> AppResult<()> {
        let (task, user) = self.load_context(task_id).await?;

        let result = self
            .email
            .send_welcome(
                &user.email,
                &task.name,
                &task.search_query,
                &task.condition_description,
                &task.notify_behavior,
                json!({
                    "answer": summary,
                    "condition_met": condition_met,
                    "grounding_sources": sources,
                }),
                &task.id,
            )
            .await;

        let status = if result.success {
            "success"
        } else if result.skipped {
            "skipped"
        } else {
            "failed"
        };

        NotificationSendRepository::create(
            &self.pool,
            CreateNotificationSend {
                user_id: user.id.clone(),
                task_id: Some(task.id.clone()),
                execution_id: Some(execution_id.to_string()),
                recipient_email: user.email.clone(),
                notification_type: "welcome".to_string(),
                status: status.to_string(),
                error_message: result.error.clone(),
            },
        )
        .await?;

        if let Some(error) = result.error {
            return Err(AppError::NotificationDelivery(error));
        }
        Ok(())
    }

    /// Re-deliver webhook attempts whose retry is due. Each claimed row
    /// produces one follow-up attempt row; attempts past the cap exhaust.
    pub async fn run_webhook_retry_sweep(&self) -> AppResult<usize> {
        let now = Utc::now().naive_utc();
        let due = WebhookDeliveryRepository::claim_due(&self.pool, now, SWEEP_BATCH_SIZE).await?;
        let processed = due.len();

        for delivery in due {
            let attempt = delivery.attempt_number + 1;

            let secret = match self.webhook_secret_for(&delivery.task_id).await {
                Ok(secret) => secret,
                Err(e) => {
                    tracing::warn!(
                        "Skipping webhook retry for task {}: {}",
                        delivery.task_id,
                        e
                    );
                    continue;
                }
            };

            let payload: serde_json::Value = match serde_json::from_str(&delivery.payload) {
                Ok(v) => v,
                Err(e) => {
                    tracing::error!(
                        "Stored webhook payload for delivery {} is not JSON: {}",
                        delivery.id,
                        e
                    );
                    continue;
                }
            };

            let result = self
                .webhook
                .deliver(&delivery.webhook_url, &payload, &secret)
                .await;

            let now = Utc::now().naive_utc();
            let (delivered_at, failed_at, next_retry_at) = if result.success {
                (Some(now), None, None)
            } else if attempt >= self.webhook.max_attempts() {
                (None, Some(now), None)
            } else {
                (
                    None,
                    None,
                    Some(next_retry_time(attempt, self.webhook.retry_base_minutes())),
                )
            };

            WebhookDeliveryRepository::create(
                &self.pool,
                CreateWebhookDelivery {
                    task_id: delivery.task_id.clone(),
                    execution_id: delivery.execution_id.clone(),
                    webhook_url: delivery.webhook_url.clone(),
                    payload: delivery.payload.clone(),
                    signature: Some(result.signature.clone()),
                    http_status: result.http_status,
                    error_message: result.error.clone(),
                    attempt_number: attempt,
                    delivered_at,
                    failed_at,
                    next_retry_at,
                },
            )
            .await?;

            if result.success {
                tracing::info!(
                    "Webhook retry delivered for execution {} (attempt {})",
                    delivery.execution_id,
                    attempt
                );
            } else {
                tracing::warn!(
                    "Webhook retry failed for execution {} (attempt {}): {:?}",
                    delivery.execution_id,
                    attempt,
                    result.error
                );
            }
        }

        Ok(processed)
    }

    async fn load_context(&self, task_id: &str) -> AppResult<(Task, User)> {
        let task = TaskRepository::find_by_id(&self.pool, task_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Task {}", task_id)))?;
        let user = UserRepository::find_by_id(&self.pool, &task.user_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("User {}", task.user_id)))?;
        Ok((task, user))
    }

    /// Recipient selection: a custom notification address is honored only if
    /// it is currently verified; otherwise fall back to the primary address.
    fn select_recipient(task: &Task, user: &User) -> String {
        match &task.notification_email {
            Some(custom) if custom != &user.email => {
                if user.is_email_verified(custom) {
                    custom.clone()
                } else {
                    tracing::warn!(
                        "Custom notification email for task {} is not verified, using primary",
                        task.id
                    );
                    user.email.clone()
                }
            }
            _ => user.email.clone(),
        }
    }

    async fn send_email(
        &self,
        task: &Task,
        user: &User,
        notification: &ExecutionNotification,
    ) -> AppResult<()> {
        let recipient = Self::select_recipient(task, user);

        if let Some(reason) = self.email.check_spam_limits(&self.pool, &recipient).await? {
            tracing::warn!("Spam limit hit for task {}: {}", task.id, reason);
            NotificationSendRepository::create(
                &self.pool,
                CreateNotificationSend {
                    user_id: user.id.clone(),
                    task_id: Some(task.id.clone()),
                    execution_id: Some(notification.execution_id.clone()),
                    recipient_email: recipient,
                    notification_type: "email".to_string(),
                    status: "failed".to_string(),
                    error_message: Some(format!("spam limit exceeded: {}", reason)),
                },
            )
            .await?;
            return Err(AppError::SpamLimitExceeded(reason));
        }

        let result = self
            .email
            .send_condition_met(
                &recipient,
                &notification.task_name,
                &task.search_query,
                &notification.notification,
                &notification.sources,
                &task.id,
                &notification.execution_id,
            )
            .await;

        let status = if result.success {
            "success"
        } else if result.skipped {
            "skipped"
        } else {
            "failed"
        };

        NotificationSendRepository::create(
            &self.pool,
            CreateNotificationSend {
                user_id: user.id.clone(),
                task_id: Some(task.id.clone()),
                execution_id: Some(notification.execution_id.clone()),
                recipient_email: recipient,
                notification_type: "email".to_string(),
                status: status.to_string(),
                error_message: result.error.clone(),
            },
        )
        .await?;

        if let Some(error) = result.error {
            return Err(AppError::NotificationDelivery(error));
        }
        Ok(())
    }

    async fn send_webhook(
        &self,
        task: &Task,
        user: &User,
        notification: &ExecutionNotification,
    ) -> AppResult<()> {
        let webhook_url = task
            .webhook_url
            .clone()
            .or_else(|| user.webhook_url.clone())
            .ok_or_else(|| {
                AppError::NotificationDelivery("webhook URL not configured".to_string())
            })?;
        let secret = task
            .webhook_secret
            .clone()
            .or_else(|| user.webhook_secret.clone())
            .ok_or_else(|| {
                AppError::NotificationDelivery("webhook secret not configured".to_string())
            })?;

        let payload = WebhookPayload {
            event: CONDITION_MET_EVENT.to_string(),
            task: WebhookTaskInfo {
                id: task.id.clone(),
                name: notification.task_name.clone(),
                search_query: task.search_query.clone(),
                condition_description: task.condition_description.clone(),
            },
            execution: WebhookExecutionInfo {
                id: notification.execution_id.clone(),
                status: "success".to_string(),
                condition_met: true,
                change_summary: notification.change_summary.clone(),
                grounding_sources: notification.sources.clone(),
            },
            timestamp: Utc::now().to_rfc3339(),
        };

        let payload_value = serde_json::to_value(&payload)
            .map_err(|e| AppError::NotificationDelivery(e.to_string()))?;

        let result = self.webhook.deliver(&webhook_url, &payload_value, &secret).await;

        let now = Utc::now().naive_utc();
        let (delivered_at, failed_at, next_retry_at) = if result.success {
            (Some(now), None, None)
        } else if self.webhook.max_attempts() <= 1 {
            (None, Some(now), None)
        } else {
            (
                None,
                None,
                Some(next_retry_time(1, self.webhook.retry_base_minutes())),
            )
        };

        WebhookDeliveryRepository::create(
            &self.pool,
            CreateWebhookDelivery {
                task_id: task.id.clone(),
                execution_id: notification.execution_id.clone(),
                webhook_url: webhook_url.clone(),
                payload: serde_json::to_string(&payload_value).unwrap_or_default(),
                signature: Some(result.signature.clone()),
                http_status: result.http_status,
                error_message: result.error.clone(),
                attempt_number: 1,
                delivered_at,
                failed_at,
                next_retry_at,
            },
        )
        .await?;

        if result.success {
            tracing::info!("Webhook delivered for task {}", task.id);
        } else {
            // A retry is scheduled; the dispatch itself did not fail.
            tracing::warn!(
                "Webhook attempt 1 failed for task {} ({:?}), retry scheduled",
                task.id,
                result.error
            );
        }

        Ok(())
    }

    async fn webhook_secret_for(&self, task_id: &str) -> AppResult<String> {
        let (task, user) = self.load_context(task_id).await?;
        task.webhook_secret
            .or(user.webhook_secret)
            .ok_or_else(|| {
                AppError::NotificationDelivery("webhook secret not configured".to_string())
            })
    }
}
