use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Ephemeral record for the email verification code flow.
/// Codes are 6 decimal digits with a 15-minute TTL and 5 attempts.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct EmailVerification {
    pub id: String,
    pub user_id: String,
    pub email: String,
    pub code: String,
    pub expires_at: NaiveDateTime,
    pub attempts_left: i64,
    pub verified: bool,
    pub verified_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
}

impl EmailVerification {
    pub fn is_expired(&self, now: NaiveDateTime) -> bool {
        self.expires_at <= now
    }
}
