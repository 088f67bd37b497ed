use std::env;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub agent: AgentConfig,
    pub email: EmailConfig,
    pub webhook: WebhookConfig,
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub frontend_url: String,
    /// Capacity limit reported by /stats (not enforced by the engine).
    pub max_users: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Primary (free tier) agent endpoint.
    pub url_free: String,
    /// Fallback endpoint tried once when the free tier returns 429 on submit.
    pub url_paid: Option<String>,
    /// Per-call deadline in seconds, submission to terminal poll.
    pub timeout_seconds: u64,
    /// Delay between status polls in milliseconds.
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmailConfig {
    /// Credential for the email provider. `None` disables email delivery
    /// (sends are recorded as skipped).
    pub provider_key: Option<String>,
    pub provider_url: String,
    pub condition_met_workflow_id: String,
    pub welcome_workflow_id: String,
    pub verification_workflow_id: String,
    /// Per-recipient caps counted over notification_sends success rows.
    pub spam_daily_limit: i64,
    pub spam_hourly_limit: i64,
    /// Verification code settings.
    pub code_ttl_minutes: i64,
    pub code_max_attempts: i64,
    pub code_hourly_limit: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    pub request_timeout_seconds: u64,
    pub max_attempts: i64,
    pub retry_base_minutes: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// RUNNING executions older than this are reaped into FAILED.
    pub stale_execution_minutes: i64,
    pub stale_reap_interval_minutes: u64,
    pub webhook_sweep_interval_minutes: u64,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        Ok(Config {
            server: ServerConfig {
                host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env::var("PORT")
                    .unwrap_or_else(|_| "8080".to_string())
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue("PORT".to_string()))?,
                frontend_url: env::var("FRONTEND_URL")
                    .unwrap_or_else(|_| "http://localhost:3000".to_string()),
                max_users: env::var("MAX_USERS")
                    .unwrap_or_else(|_| "500".to_string())
                    .parse()
                    .unwrap_or(500),
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL")
                    .unwrap_or_else(|_| "sqlite://data/torale.db".to_string()),
                max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()
                    .unwrap_or(5),
            },
            agent: AgentConfig {
                url_free: env::var("AGENT_URL_FREE")
                    .map_err(|_| ConfigError::MissingEnv("AGENT_URL_FREE".to_string()))?,
                url_paid: env::var("AGENT_URL_PAID").ok(),
                timeout_seconds: env::var("AGENT_TIMEOUT_SECONDS")
                    .unwrap_or_else(|_| "300".to_string())
                    .parse()
                    .unwrap_or(300),
                poll_interval_ms: env::var("AGENT_POLL_INTERVAL_MS")
                    .unwrap_or_else(|_| "1000".to_string())
                    .parse()
                    .unwrap_or(1000),
            },
            email: EmailConfig {
                provider_key: env::var("EMAIL_PROVIDER_KEY").ok(),
                provider_url: env::var("EMAIL_PROVIDER_URL")
                    .unwrap_or_else(|_| "https://api.novu.co/v1".to_string()),
                condition_met_workflow_id: env::var("EMAIL_CONDITION_MET_WORKFLOW")
                    .unwrap_or_else(|_| "condition-met".to_string()),
                welcome_workflow_id: env::var("EMAIL_WELCOME_WORKFLOW")
                    .unwrap_or_else(|_| "task-welcome".to_string()),
                verification_workflow_id: env::var("EMAIL_VERIFICATION_WORKFLOW")
                    .unwrap_or_else(|_| "email-verification".to_string()),
                spam_daily_limit: env::var("SPAM_DAILY_LIMIT")
                    .unwrap_or_else(|_| "100".to_string())
                    .parse()
                    .unwrap_or(100),
                spam_hourly_limit: env::var("SPAM_HOURLY_LIMIT")
                    .unwrap_or_else(|_| "10".to_string())
                    .parse()
                    .unwrap_or(10),
                code_ttl_minutes: env::var("EMAIL_CODE_TTL_MINUTES")
                    .unwrap_or_else(|_| "15".to_string())
                    .parse()
                    .unwrap_or(15),
                code_max_attempts: env::var("EMAIL_CODE_MAX_ATTEMPTS")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()
                    .unwrap_or(5),
                code_hourly_limit: env::var("EMAIL_CODE_HOURLY_LIMIT")
                    .unwrap_or_else(|_| "3".to_string())
                    .parse()
                    .unwrap_or(3),
            },
            webhook: WebhookConfig {
                request_timeout_seconds: env::var("WEBHOOK_REQUEST_TIMEOUT_SECONDS")
                    .unwrap_or_else(|_| "10".to_string())
                    .parse()
                    .unwrap_or(10),
                max_attempts: env::var("WEBHOOK_MAX_ATTEMPTS")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()
                    .unwrap_or(5),
                retry_base_minutes: env::var("WEBHOOK_RETRY_BASE_MINUTES")
                    .unwrap_or_else(|_| "1".to_string())
                    .parse()
                    .unwrap_or(1),
            },
            scheduler: SchedulerConfig {
                stale_execution_minutes: env::var("STALE_EXECUTION_MINUTES")
                    .unwrap_or_else(|_| "30".to_string())
                    .parse()
                    .unwrap_or(30),
                stale_reap_interval_minutes: env::var("STALE_REAP_INTERVAL_MINUTES")
                    .unwrap_or_else(|_| "15".to_string())
                    .parse()
                    .unwrap_or(15),
                webhook_sweep_interval_minutes: env::var("WEBHOOK_SWEEP_INTERVAL_MINUTES")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()
                    .unwrap_or(5),
            },
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),

    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
                frontend_url: "http://localhost:3000".to_string(),
                max_users: 500,
            },
            database: DatabaseConfig {
                url: "sqlite://data/torale.db".to_string(),
                max_connections: 5,
            },
            agent: AgentConfig {
                url_free: "http://localhost:9100".to_string(),
                url_paid: None,
                timeout_seconds: 300,
                poll_interval_ms: 1000,
            },
            email: EmailConfig {
                provider_key: None,
                provider_url: "https://api.novu.co/v1".to_string(),
                condition_met_workflow_id: "condition-met".to_string(),
                welcome_workflow_id: "task-welcome".to_string(),
                verification_workflow_id: "email-verification".to_string(),
                spam_daily_limit: 100,
                spam_hourly_limit: 10,
                code_ttl_minutes: 15,
                code_max_attempts: 5,
                code_hourly_limit: 3,
            },
            webhook: WebhookConfig {
                request_timeout_seconds: 10,
                max_attempts: 5,
                retry_base_minutes: 1,
            },
            scheduler: SchedulerConfig {
                stale_execution_minutes: 30,
                stale_reap_interval_minutes: 15,
                webhook_sweep_interval_minutes: 5,
            },
        }
    }
}
