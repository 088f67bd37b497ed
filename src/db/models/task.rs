use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Lifecycle state of a monitored task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Active,
    Paused,
    Completed,
}

impl TaskState {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "active" => Some(TaskState::Active),
            "paused" => Some(TaskState::Paused),
            "completed" => Some(TaskState::Completed),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Active => "active",
            TaskState::Paused => "paused",
            TaskState::Completed => "completed",
        }
    }
}

impl TryFrom<&str> for TaskState {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::from_str(value).ok_or_else(|| format!("Invalid task state: {}", value))
    }
}

/// How often a task keeps notifying once its condition is met.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyBehavior {
    Once,
    Always,
    TrackState,
}

impl NotifyBehavior {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "once" => Some(NotifyBehavior::Once),
            "always" => Some(NotifyBehavior::Always),
            "track_state" => Some(NotifyBehavior::TrackState),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NotifyBehavior::Once => "once",
            NotifyBehavior::Always => "always",
            NotifyBehavior::TrackState => "track_state",
        }
    }
}

/// Delivery channel for notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationChannel {
    Email,
    Webhook,
}

impl NotificationChannel {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "email" => Some(NotificationChannel::Email),
            "webhook" => Some(NotificationChannel::Webhook),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NotificationChannel::Email => "email",
            NotificationChannel::Webhook => "webhook",
        }
    }
}

/// A persistent, user-owned intent to monitor something.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub search_query: String,
    pub condition_description: String,

    /// Optional 5-field cron expression (UTC). Tasks without one are driven
    /// entirely by the agent's next_run.
    pub schedule: Option<String>,

    pub state: String,
    pub state_changed_at: NaiveDateTime,

    pub notify_behavior: String,

    /// JSON array of channel names, e.g. `["email","webhook"]`.
    pub notification_channels: String,
    pub notification_email: Option<String>,
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<String>,

    pub last_execution_id: Option<String>,
    /// JSON object holding the evidence narrative from the most recent run.
    pub last_known_state: Option<String>,
    pub next_run: Option<NaiveDateTime>,

    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Task {
    pub fn state(&self) -> Option<TaskState> {
        TaskState::from_str(&self.state)
    }

    pub fn notify_behavior(&self) -> Option<NotifyBehavior> {
        NotifyBehavior::from_str(&self.notify_behavior)
    }

    pub fn channels(&self) -> Vec<NotificationChannel> {
        serde_json::from_str::<Vec<String>>(&self.notification_channels)
            .unwrap_or_default()
            .iter()
            .filter_map(|s| NotificationChannel::from_str(s))
            .collect()
    }

    /// Previous evidence string extracted from last_known_state, if any.
    pub fn previous_evidence(&self) -> Option<String> {
        let raw = self.last_known_state.as_deref()?;
        let value: serde_json::Value = serde_json::from_str(raw).ok()?;
        value
            .get("evidence")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    }
}
