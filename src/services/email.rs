//! Email delivery through the external provider, plus the verification-code
//! flow for custom notification addresses and the per-recipient spam caps.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use serde_json::{json, Value};
use sqlx::SqlitePool;

use crate::config::EmailConfig;
use crate::db::models::GroundingSource;
use crate::db::repository::{EmailVerificationRepository, UserRepository};
use crate::error::{AppError, AppResult};

/// Result of one provider trigger call.
#[derive(Debug, Clone, Default)]
pub struct ProviderResult {
    pub success: bool,
    /// True when the provider is not configured; not an error.
    pub skipped: bool,
    pub transaction_id: Option<String>,
    pub error: Option<String>,
}

/// Fire-and-forget workflow trigger on the external email provider.
#[async_trait]
pub trait EmailProvider: Send + Sync + 'static {
    async fn trigger(&self, workflow_id: &str, recipient: &str, payload: Value) -> ProviderResult;
}

/// HTTP implementation of the provider protocol (Novu-style trigger API).
pub struct HttpEmailProvider {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpEmailProvider {
    pub fn new(config: &EmailConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_default();

        Self {
            http,
            base_url: config.provider_url.clone(),
            api_key: config.provider_key.clone(),
        }
    }
}

#[async_trait]
impl EmailProvider for HttpEmailProvider {
    async fn trigger(&self, workflow_id: &str, recipient: &str, payload: Value) -> ProviderResult {
        let Some(api_key) = &self.api_key else {
            tracing::info!("Email provider not configured, skipping send to {}", recipient);
            return ProviderResult {
                skipped: true,
                ..Default::default()
            };
        };

        let body = json!({
            "name": workflow_id,
            "to": { "subscriberId": recipient, "email": recipient },
            "payload": payload,
        });

        let result = self
            .http
            .post(format!("{}/events/trigger", self.base_url.trim_end_matches('/')))
            .header(http::header::AUTHORIZATION, format!("ApiKey {}", api_key))
            .json(&body)
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                let transaction_id = response
                    .json::<Value>()
                    .await
                    .ok()
                    .and_then(|v| {
                        v.pointer("/data/transactionId")
                            .and_then(|t| t.as_str())
                            .map(|s| s.to_string())
                    });
                tracing::info!(
                    "Email sent to {} (transaction {:?})",
                    recipient,
                    transaction_id
                );
                ProviderResult {
                    success: true,
                    transaction_id,
                    ..Default::default()
                }
            }
            Ok(response) => ProviderResult {
                error: Some(format!("provider returned HTTP {}", response.status())),
                ..Default::default()
            },
            Err(e) => ProviderResult {
                error: Some(e.to_string()),
                ..Default::default()
            },
        }
    }
}

/// Outcome of a code verification attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyCodeOutcome {
    Verified,
    InvalidCode { attempts_left: i64 },
    Expired,
    Exhausted,
    NotFound,
}

pub struct EmailService {
    provider: Arc<dyn EmailProvider>,
    config: EmailConfig,
}

impl EmailService {
    pub fn new(config: EmailConfig) -> Self {
        let provider = Arc::new(HttpEmailProvider::new(&config));
        Self { provider, config }
    }

    pub fn with_provider(config: EmailConfig, provider: Arc<dyn EmailProvider>) -> Self {
        Self { provider, config }
    }

    /// Condition-met notification for a task execution.
    pub async fn send_condition_met(
        &self,
        recipient: &str,
        task_name: &str,
        search_query: &str,
        notification_text: &str,
        sources: &[GroundingSource],
        task_id: &str,
        execution_id: &str,
    ) -> ProviderResult {
        let payload = json!({
            "task_id": task_id,
            "execution_id": execution_id,
            "task_name": task_name,
            "search_query": search_query,
            "notification": notification_text,
            "grounding_sources": sources,
        });

        self.provider
            .trigger(&self.config.condition_met_workflow_id, recipient, payload)
            .await
    }

    /// Welcome email, sent once per task on its first execution.
    #[allow(clippy::too_many_arguments)]
    pub async fn send_welcome(
        &self,
        recipient: &str,
        task_name: &str,
        search_query: &str,
        condition_description: &str,
        notify_behavior: &str,
        first_result: Value,
        task_id: &str,
    ) -> ProviderResult {
        let payload = json!({
            "task_id": task_id,
            "task_name": task_name,
            "search_query": search_query,
            "condition_description": condition_description,
            "notify_behavior": notify_behavior,
            "first_execution_result": first_result,
        });

        self.provider
            .trigger(&self.config.welcome_workflow_id, recipient, payload)
            .await
    }

    /// Per-recipient spam caps, counted over successful notification_sends.
    /// Returns the rejection reason when a cap is hit.
    pub async fn check_spam_limits(
        &self,
        pool: &SqlitePool,
        recipient: &str,
    ) -> AppResult<Option<String>> {
        use crate::db::repository::NotificationSendRepository;

        let now = Utc::now().naive_utc();

        let daily = NotificationSendRepository::count_success_since(
            pool,
            recipient,
            now - chrono::Duration::hours(24),
        )
        .await?;
        if daily >= self.config.spam_daily_limit {
            return Ok(Some(format!(
                "recipient received {} notifications in the last 24h (limit {})",
                daily, self.config.spam_daily_limit
            )));
        }

        let hourly = NotificationSendRepository::count_success_since(
            pool,
            recipient,
            now - chrono::Duration::hours(1),
        )
        .await?;
        if hourly >= self.config.spam_hourly_limit {
            return Ok(Some(format!(
                "recipient received {} notifications in the last hour (limit {})",
                hourly, self.config.spam_hourly_limit
            )));
        }

        Ok(None)
    }

    /// Issue a verification code for a custom notification address.
    /// Limited to a few codes per (user, email) per rolling hour.
    pub async fn request_verification(
        &self,
        pool: &SqlitePool,
        user_id: &str,
        email: &str,
    ) -> AppResult<()> {
        let now = Utc::now().naive_utc();
        let issued = EmailVerificationRepository::count_issued_since(
            pool,
            user_id,
            email,
            now - chrono::Duration::hours(1),
        )
        .await?;

        if issued >= self.config.code_hourly_limit {
            return Err(AppError::RateLimited(format!(
                "too many verification codes requested for {}",
                email
            )));
        }

        let code = generate_code();
        let expires_at = now + chrono::Duration::minutes(self.config.code_ttl_minutes);

        EmailVerificationRepository::create(
            pool,
            user_id,
            email,
            &code,
            expires_at,
            self.config.code_max_attempts,
        )
        .await?;

        let result = self
            .provider
            .trigger(
                &self.config.verification_workflow_id,
                email,
                json!({ "code": code, "ttl_minutes": self.config.code_ttl_minutes }),
            )
            .await;

        if let Some(error) = result.error {
            tracing::error!("Failed to send verification code to {}: {}", email, error);
            return Err(AppError::NotificationDelivery(error));
        }

        Ok(())
    }

    /// Check a submitted code. A correct code within its TTL marks the
    /// address verified and appends it to the user's verified list.
    pub async fn verify_code(
        &self,
        pool: &SqlitePool,
        user_id: &str,
        email: &str,
        submitted: &str,
    ) -> AppResult<VerifyCodeOutcome> {
        let Some(verification) =
            EmailVerificationRepository::find_active(pool, user_id, email).await?
        else {
            return Ok(VerifyCodeOutcome::NotFound);
        };

        let now = Utc::now().naive_utc();
        if verification.is_expired(now) {
            return Ok(VerifyCodeOutcome::Expired);
        }
        if verification.attempts_left <= 0 {
            return Ok(VerifyCodeOutcome::Exhausted);
        }

        if verification.code != submitted {
            let attempts_left =
                EmailVerificationRepository::decrement_attempts(pool, &verification.id).await?;
            if attempts_left <= 0 {
                return Ok(VerifyCodeOutcome::Exhausted);
            }
            return Ok(VerifyCodeOutcome::InvalidCode { attempts_left });
        }

        EmailVerificationRepository::mark_verified(pool, &verification.id).await?;
        UserRepository::add_verified_email(pool, user_id, email).await?;

        Ok(VerifyCodeOutcome::Verified)
    }
}

/// 6 decimal digits, zero-padded.
pub fn generate_code() -> String {
    let mut rng = rand::thread_rng();
    format!("{:06}", rng.gen_range(0..1_000_000))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::repository::NotificationSendRepository;
    use crate::db::models::CreateNotificationSend;

    struct RecordingProvider {
        calls: tokio::sync::Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl EmailProvider for RecordingProvider {
        async fn trigger(
            &self,
            workflow_id: &str,
            recipient: &str,
            _payload: Value,
        ) -> ProviderResult {
            self.calls
                .lock()
                .await
                .push((workflow_id.to_string(), recipient.to_string()));
            ProviderResult {
                success: true,
                transaction_id: Some("txn-1".to_string()),
                ..Default::default()
            }
        }
    }

    fn service_with_recorder() -> (EmailService, Arc<RecordingProvider>) {
        let provider = Arc::new(RecordingProvider {
            calls: tokio::sync::Mutex::new(Vec::new()),
        });
        let service = EmailService::with_provider(Config::default().email, provider.clone());
        (service, provider)
    }

    async fn insert_user(pool: &SqlitePool, id: &str, email: &str) {
        sqlx::query("INSERT INTO users (id, email) VALUES (?, ?)")
            .bind(id)
            .bind(email)
            .execute(pool)
            .await
            .unwrap();
    }

    #[test]
    fn generates_six_digit_codes() {
        for _ in 0..20 {
            let code = generate_code();
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[tokio::test]
    async fn hourly_spam_cap_blocks_recipient() {
        let pool = crate::db::test_pool().await;
        insert_user(&pool, "u1", "owner@example.com").await;
        let (service, _) = service_with_recorder();

        for _ in 0..10 {
            NotificationSendRepository::create(
                &pool,
                CreateNotificationSend {
                    user_id: "u1".to_string(),
                    task_id: None,
                    execution_id: None,
                    recipient_email: "owner@example.com".to_string(),
                    notification_type: "email".to_string(),
                    status: "success".to_string(),
                    error_message: None,
                },
            )
            .await
            .unwrap();
        }

        let verdict = service
            .check_spam_limits(&pool, "owner@example.com")
            .await
            .unwrap();
        assert!(verdict.is_some());

        // A different recipient is unaffected.
        let verdict = service
            .check_spam_limits(&pool, "other@example.com")
            .await
            .unwrap();
        assert!(verdict.is_none());
    }

    #[tokio::test]
    async fn failed_sends_do_not_count_toward_caps() {
        let pool = crate::db::test_pool().await;
        insert_user(&pool, "u1", "owner@example.com").await;
        let (service, _) = service_with_recorder();

        for _ in 0..15 {
            NotificationSendRepository::create(
                &pool,
                CreateNotificationSend {
                    user_id: "u1".to_string(),
                    task_id: None,
                    execution_id: None,
                    recipient_email: "owner@example.com".to_string(),
                    notification_type: "email".to_string(),
                    status: "failed".to_string(),
                    error_message: Some("provider down".to_string()),
                },
            )
            .await
            .unwrap();
        }

        let verdict = service
            .check_spam_limits(&pool, "owner@example.com")
            .await
            .unwrap();
        assert!(verdict.is_none());
    }

    #[tokio::test]
    async fn verification_flow_marks_email_verified() {
        let pool = crate::db::test_pool().await;
        insert_user(&pool, "u1", "owner@example.com").await;
        let (service, provider) = service_with_recorder();

        service
            .request_verification(&pool, "u1", "alerts@example.com")
            .await
            .unwrap();

        assert_eq!(provider.calls.lock().await.len(), 1);

        let verification =
            EmailVerificationRepository::find_active(&pool, "u1", "alerts@example.com")
                .await
                .unwrap()
                .unwrap();

        // Wrong code burns an attempt.
        let outcome = service
            .verify_code(&pool, "u1", "alerts@example.com", "000000")
            .await
            .unwrap();
        match outcome {
            VerifyCodeOutcome::InvalidCode { attempts_left } => assert_eq!(attempts_left, 4),
            // The random code could legitimately be 000000.
            VerifyCodeOutcome::Verified => return,
            other => panic!("unexpected outcome: {:?}", other),
        }

        let outcome = service
            .verify_code(&pool, "u1", "alerts@example.com", &verification.code)
            .await
            .unwrap();
        assert_eq!(outcome, VerifyCodeOutcome::Verified);

        let user = UserRepository::find_by_id(&pool, "u1").await.unwrap().unwrap();
        assert!(user.is_email_verified("alerts@example.com"));
    }

    #[tokio::test]
    async fn code_requests_are_rate_limited() {
        let pool = crate::db::test_pool().await;
        insert_user(&pool, "u1", "owner@example.com").await;
        let (service, _) = service_with_recorder();

        for _ in 0..3 {
            service
                .request_verification(&pool, "u1", "alerts@example.com")
                .await
                .unwrap();
        }

        let err = service
            .request_verification(&pool, "u1", "alerts@example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::RateLimited(_)));
    }
}
