use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Projection of a user as seen by the notification engine.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    /// Primary (identity-provider-verified) address.
    pub email: String,
    /// JSON array of additional addresses verified through the code flow.
    pub verified_notification_emails: String,

    /// User-level webhook defaults, used when a task does not override them.
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<String>,
    pub webhook_enabled: bool,

    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl User {
    pub fn verified_emails(&self) -> Vec<String> {
        serde_json::from_str(&self.verified_notification_emails).unwrap_or_default()
    }

    pub fn is_email_verified(&self, address: &str) -> bool {
        address == self.email || self.verified_emails().iter().any(|e| e == address)
    }
}
