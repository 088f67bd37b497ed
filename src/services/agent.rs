//! Client for the external monitoring agent.
//!
//! A call submits the prompt, receives an agent-side task id, then polls the
//! status endpoint until the task reaches a terminal state. A 429 on submit
//! retries once against the configured paid-tier endpoint; a 429 while
//! polling propagates without failover because the work is already queued.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;

use crate::config::AgentConfig;
use crate::db::models::GroundingSource;

/// Consecutive transient poll failures tolerated before giving up.
const MAX_POLL_FAILURES: u32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("agent unavailable: {0}")]
    Unavailable(String),

    #[error("agent rate limited on all tiers")]
    RateLimited,

    #[error("agent call exceeded deadline of {0} seconds")]
    Timeout(u64),

    #[error("agent protocol error: {0}")]
    Protocol(String),

    #[error("agent response validation error: {0}")]
    Validation(String),
}

/// Validated response from the monitoring agent.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentResponse {
    /// Narrative of what was found. Never empty.
    pub evidence: String,
    /// User-facing message; `Some` means notifications should go out.
    pub notification: Option<String>,
    pub sources: Vec<GroundingSource>,
    /// Clamped to 0..=100.
    pub confidence: i64,
    /// When to check again, UTC. `None` means the task is finished.
    pub next_run: Option<NaiveDateTime>,
    /// Optional short label used to auto-name placeholder tasks.
    pub topic: Option<String>,
}

/// Seam between the orchestrator and the external agent, so tests can swap
/// in a scripted agent without an HTTP server.
#[async_trait]
pub trait MonitoringAgent: Send + Sync + 'static {
    async fn call(&self, prompt: &str) -> Result<AgentResponse, AgentError>;
}

pub struct AgentClient {
    http: reqwest::Client,
    config: AgentConfig,
}

#[async_trait]
impl MonitoringAgent for AgentClient {
    async fn call(&self, prompt: &str) -> Result<AgentResponse, AgentError> {
        AgentClient::call(self, prompt).await
    }
}

impl AgentClient {
    pub fn new(config: AgentConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();

        Self { http, config }
    }

    /// Run one monitoring call end to end: submit, poll, validate.
    pub async fn call(&self, prompt: &str) -> Result<AgentResponse, AgentError> {
        let deadline = tokio::time::Instant::now()
            + Duration::from_secs(self.config.timeout_seconds);

        let (base_url, agent_task_id) = match self.submit(&self.config.url_free, prompt).await {
            Ok(id) => (self.config.url_free.clone(), id),
            Err(AgentError::RateLimited) => {
                let Some(paid_url) = self.config.url_paid.clone() else {
                    return Err(AgentError::RateLimited);
                };
                tracing::warn!("Agent free tier rate limited, retrying submit on paid tier");
                let id = self.submit(&paid_url, prompt).await?;
                (paid_url, id)
            }
            Err(e) => return Err(e),
        };

        self.poll(&base_url, &agent_task_id, deadline).await
    }

    async fn submit(&self, base_url: &str, prompt: &str) -> Result<String, AgentError> {
        let response = self
            .http
            .post(format!("{}/tasks", base_url.trim_end_matches('/')))
            .json(&serde_json::json!({ "prompt": prompt }))
            .send()
            .await
            .map_err(|e| AgentError::Unavailable(format!("submit failed: {}", e)))?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(AgentError::RateLimited);
        }
        if !status.is_success() {
            return Err(AgentError::Unavailable(format!(
                "submit returned HTTP {}",
                status
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| AgentError::Protocol(format!("submit response not JSON: {}", e)))?;

        body.get("id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| AgentError::Protocol("submit response missing task id".to_string()))
    }

    async fn poll(
        &self,
        base_url: &str,
        agent_task_id: &str,
        deadline: tokio::time::Instant,
    ) -> Result<AgentResponse, AgentError> {
        let status_url = format!(
            "{}/tasks/{}",
            base_url.trim_end_matches('/'),
            agent_task_id
        );
        let mut consecutive_failures: u32 = 0;

        loop {
            if tokio::time::Instant::now() >= deadline {
                return Err(AgentError::Timeout(self.config.timeout_seconds));
            }

            match self.poll_once(&status_url).await {
                Ok(PollOutcome::Terminal(response)) => return Ok(response),
                Ok(PollOutcome::Pending) => {
                    consecutive_failures = 0;
                }
                Err(PollError::Fatal(e)) => return Err(e),
                Err(PollError::Transient(reason)) => {
                    consecutive_failures += 1;
                    tracing::warn!(
                        "Transient agent poll failure ({}/{}): {}",
                        consecutive_failures,
                        MAX_POLL_FAILURES,
                        reason
                    );
                    if consecutive_failures >= MAX_POLL_FAILURES {
                        return Err(AgentError::Unavailable(reason));
                    }
                }
            }

            tokio::time::sleep(Duration::from_millis(self.config.poll_interval_ms)).await;
        }
    }

    async fn poll_once(&self, status_url: &str) -> Result<PollOutcome, PollError> {
        let response = self
            .http
            .get(status_url)
            .send()
            .await
            .map_err(|e| PollError::Transient(format!("poll failed: {}", e)))?;

        let status = response.status();
        if status.as_u16() == 429 {
            // Already submitted; failing over would duplicate the work.
            return Err(PollError::Fatal(AgentError::RateLimited));
        }
        if status.is_server_error() {
            return Err(PollError::Transient(format!("poll returned HTTP {}", status)));
        }
        if !status.is_success() {
            return Err(PollError::Fatal(AgentError::Protocol(format!(
                "poll returned HTTP {}",
                status
            ))));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| PollError::Transient(format!("poll response not JSON: {}", e)))?;

        let state = body
            .get("status")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                PollError::Fatal(AgentError::Protocol(
                    "poll response missing status".to_string(),
                ))
            })?;

        match state {
            "completed" => {
                let result = body.get("result").ok_or_else(|| {
                    PollError::Fatal(AgentError::Protocol(
                        "completed task carries no result".to_string(),
                    ))
                })?;
                parse_agent_response(result).map(PollOutcome::Terminal).map_err(PollError::Fatal)
            }
            "failed" => {
                let message = body
                    .get("error")
                    .and_then(|v| v.as_str())
                    .unwrap_or("agent reported failure");
                Err(PollError::Fatal(AgentError::Unavailable(message.to_string())))
            }
            "submitted" | "working" | "pending" | "running" => Ok(PollOutcome::Pending),
            other => Err(PollError::Fatal(AgentError::Protocol(format!(
                "unknown task status '{}'",
                other
            )))),
        }
    }
}

enum PollOutcome {
    Terminal(AgentResponse),
    Pending,
}

enum PollError {
    Transient(String),
    Fatal(AgentError),
}

/// Parse and validate the terminal agent payload.
///
/// Missing required fields are protocol errors; fields that are present but
/// carry the wrong shape are validation errors, except `confidence`, which is
/// clamped (non-numeric values fall back to 50).
pub fn parse_agent_response(value: &Value) -> Result<AgentResponse, AgentError> {
    let obj = value
        .as_object()
        .ok_or_else(|| AgentError::Protocol("agent result is not an object".to_string()))?;

    let evidence_value = obj
        .get("evidence")
        .ok_or_else(|| AgentError::Protocol("missing field 'evidence'".to_string()))?;
    let evidence = evidence_value
        .as_str()
        .ok_or_else(|| AgentError::Validation("'evidence' is not a string".to_string()))?;
    if evidence.trim().is_empty() {
        return Err(AgentError::Validation("'evidence' is empty".to_string()));
    }

    let notification = match obj.get("notification") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => {
            return Err(AgentError::Validation(
                "'notification' is neither string nor null".to_string(),
            ))
        }
    };

    let sources = match obj.get("sources") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => normalize_sources(items),
        Some(_) => {
            tracing::warn!("Agent returned non-list sources, ignoring");
            Vec::new()
        }
    };

    let confidence = normalize_confidence(obj.get("confidence"));

    let next_run = match obj.get("next_run") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => parse_next_run(s),
        Some(_) => {
            return Err(AgentError::Validation(
                "'next_run' is neither string nor null".to_string(),
            ))
        }
    };

    let topic = obj
        .get("topic")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    Ok(AgentResponse {
        evidence: evidence.to_string(),
        notification,
        sources,
        confidence,
        next_run,
        topic,
    })
}

/// Clamp confidence into 0..=100; anything non-numeric becomes 50.
pub fn normalize_confidence(value: Option<&Value>) -> i64 {
    match value {
        Some(Value::Number(n)) => {
            if let Some(i) = n.as_i64() {
                i.clamp(0, 100)
            } else if let Some(f) = n.as_f64() {
                (f as i64).clamp(0, 100)
            } else {
                50
            }
        }
        Some(Value::String(s)) => match s.trim().parse::<f64>() {
            Ok(f) => (f as i64).clamp(0, 100),
            Err(_) => 50,
        },
        _ => 50,
    }
}

/// Parse an ISO-8601 timestamp as UTC. Accepts a trailing "Z", an explicit
/// offset, or a bare naive datetime (treated as UTC). Returns None when the
/// string does not parse.
pub fn parse_next_run(raw: &str) -> Option<NaiveDateTime> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.with_timezone(&Utc).naive_utc());
    }

    NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f"))
        .ok()
}

/// Normalize a mixed list of URL strings and {url, title} objects.
/// Titles default to the URL's host.
pub fn normalize_sources(items: &[Value]) -> Vec<GroundingSource> {
    items
        .iter()
        .filter_map(|item| match item {
            Value::String(u) => Some(GroundingSource {
                url: u.clone(),
                title: default_title(u),
            }),
            Value::Object(obj) => {
                let source_url = obj.get("url").and_then(|v| v.as_str())?;
                let title = obj
                    .get("title")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| default_title(source_url));
                Some(GroundingSource {
                    url: source_url.to_string(),
                    title,
                })
            }
            _ => None,
        })
        .collect()
}

fn default_title(source_url: &str) -> String {
    url::Url::parse(source_url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_string()))
        .unwrap_or_else(|| source_url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn clamps_confidence_bounds() {
        assert_eq!(normalize_confidence(Some(&json!(-5))), 0);
        assert_eq!(normalize_confidence(Some(&json!(150))), 100);
        assert_eq!(normalize_confidence(Some(&json!(42))), 42);
        assert_eq!(normalize_confidence(Some(&json!("high"))), 50);
        assert_eq!(normalize_confidence(Some(&json!("87"))), 87);
        assert_eq!(normalize_confidence(Some(&json!(null))), 50);
        assert_eq!(normalize_confidence(None), 50);
    }

    #[test]
    fn parses_next_run_variants() {
        let dt = parse_next_run("2024-02-11T09:00:00Z").unwrap();
        assert_eq!(dt.to_string(), "2024-02-11 09:00:00");

        let dt = parse_next_run("2024-02-11T09:00:00+02:00").unwrap();
        assert_eq!(dt.to_string(), "2024-02-11 07:00:00");

        let dt = parse_next_run("2024-02-11T09:00:00").unwrap();
        assert_eq!(dt.to_string(), "2024-02-11 09:00:00");

        assert!(parse_next_run("").is_none());
        assert!(parse_next_run("soon").is_none());
    }

    #[test]
    fn normalizes_string_and_object_sources() {
        let sources = normalize_sources(&[
            json!("https://nvidia.com/news/rtx"),
            json!({"url": "https://example.com/a", "title": "Example"}),
            json!({"title": "no url"}),
            json!(17),
        ]);

        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].url, "https://nvidia.com/news/rtx");
        assert_eq!(sources[0].title, "nvidia.com");
        assert_eq!(sources[1].title, "Example");
    }

    #[test]
    fn parses_full_response() {
        let response = parse_agent_response(&json!({
            "evidence": "NVIDIA announced Jan 30 launch",
            "notification": "NVIDIA announced RTX 5090 launch on January 30",
            "sources": ["https://nvidia.com/news"],
            "confidence": 95,
            "next_run": null,
            "topic": "RTX 5090 release"
        }))
        .unwrap();

        assert_eq!(response.evidence, "NVIDIA announced Jan 30 launch");
        assert!(response.notification.is_some());
        assert_eq!(response.confidence, 95);
        assert!(response.next_run.is_none());
        assert_eq!(response.topic.as_deref(), Some("RTX 5090 release"));
    }

    #[test]
    fn missing_evidence_is_protocol_error() {
        let err = parse_agent_response(&json!({"notification": null})).unwrap_err();
        assert!(matches!(err, AgentError::Protocol(_)));
    }

    #[test]
    fn empty_evidence_is_validation_error() {
        let err = parse_agent_response(&json!({"evidence": "  "})).unwrap_err();
        assert!(matches!(err, AgentError::Validation(_)));
    }

    #[test]
    fn wrong_notification_type_is_validation_error() {
        let err = parse_agent_response(&json!({
            "evidence": "ok",
            "notification": 5
        }))
        .unwrap_err();
        assert!(matches!(err, AgentError::Validation(_)));
    }
}
