use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Status of a single task run. Pending and Running are in-flight;
/// Success and Failed are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl ExecutionStatus {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(ExecutionStatus::Pending),
            "running" => Some(ExecutionStatus::Running),
            "success" => Some(ExecutionStatus::Success),
            "failed" => Some(ExecutionStatus::Failed),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ExecutionStatus::Success | ExecutionStatus::Failed)
    }
}

/// A grounding source returned by the agent, normalized to url + title.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroundingSource {
    pub url: String,
    pub title: String,
}

/// One run of a task.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TaskExecution {
    pub id: String,
    pub task_id: String,
    pub status: String,
    pub started_at: NaiveDateTime,
    pub completed_at: Option<NaiveDateTime>,

    /// Full agent payload as JSON.
    pub result: Option<String>,
    pub error_message: Option<String>,
    /// User-facing message, present only when the agent emitted one.
    pub notification: Option<String>,
    pub change_summary: Option<String>,
    /// JSON array of GroundingSource.
    pub grounding_sources: Option<String>,

    /// Monotonic failure counter inherited from the previous execution.
    pub retry_count: i64,
    /// Set when the record is created and no prior execution exists;
    /// drives the welcome email.
    pub is_first: bool,

    pub created_at: NaiveDateTime,
}

impl TaskExecution {
    pub fn status(&self) -> Option<ExecutionStatus> {
        ExecutionStatus::from_str(&self.status)
    }

    pub fn sources(&self) -> Vec<GroundingSource> {
        self.grounding_sources
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(!ExecutionStatus::Pending.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(ExecutionStatus::Success.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
    }

    #[test]
    fn status_round_trips() {
        for status in [
            ExecutionStatus::Pending,
            ExecutionStatus::Running,
            ExecutionStatus::Success,
            ExecutionStatus::Failed,
        ] {
            assert_eq!(ExecutionStatus::from_str(status.as_str()), Some(status));
        }
    }
}
