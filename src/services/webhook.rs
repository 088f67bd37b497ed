//! Webhook signing and delivery.
//!
//! Payloads are signed with `X-Torale-Signature: t=<unix_ts>,v1=<hex>` where
//! the hex digest is HMAC-SHA256 over `"{t}.{canonical_json(payload)}"`.
//! Canonical JSON sorts object keys recursively and emits no whitespace, so
//! the signature input is independent of field order on either side.

use std::time::Duration;

use chrono::{NaiveDateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use uuid::Uuid;

use crate::config::WebhookConfig;
use crate::db::models::GroundingSource;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Torale-Signature";
pub const EVENT_HEADER: &str = "X-Torale-Event";
pub const DELIVERY_ID_HEADER: &str = "X-Torale-Delivery-ID";

/// Maximum accepted clock skew between signing and verification, seconds.
pub const SIGNATURE_TOLERANCE_SECONDS: i64 = 300;

pub const CONDITION_MET_EVENT: &str = "task.condition_met";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub event: String,
    pub task: WebhookTaskInfo,
    pub execution: WebhookExecutionInfo,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookTaskInfo {
    pub id: String,
    pub name: String,
    pub search_query: String,
    pub condition_description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookExecutionInfo {
    pub id: String,
    pub status: String,
    pub condition_met: bool,
    pub change_summary: String,
    pub grounding_sources: Vec<GroundingSource>,
}

/// Outcome of a single delivery attempt.
#[derive(Debug, Clone)]
pub struct DeliveryOutcome {
    pub success: bool,
    pub http_status: Option<i64>,
    pub error: Option<String>,
    pub signature: String,
    pub delivery_id: String,
}

/// Serialize a JSON value deterministically: object keys sorted recursively,
/// separators without whitespace. Used exclusively as the signature input.
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let parts: Vec<String> = keys
                .into_iter()
                .map(|key| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(key).unwrap_or_default(),
                        canonical_json(&map[key])
                    )
                })
                .collect();
            format!("{{{}}}", parts.join(","))
        }
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", parts.join(","))
        }
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// Produce the signature header value for a payload at the given unix time.
pub fn sign_payload(secret: &str, payload: &Value, timestamp: i64) -> String {
    let message = format!("{}.{}", timestamp, canonical_json(payload));
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(message.as_bytes());
    let digest = hex::encode(mac.finalize().into_bytes());
    format!("t={},v1={}", timestamp, digest)
}

/// Verify a signature header against a payload.
///
/// Rejects signatures whose timestamp is more than
/// [`SIGNATURE_TOLERANCE_SECONDS`] away from `now`, then compares the HMAC in
/// constant time.
pub fn verify_signature(secret: &str, payload: &Value, header: &str, now: i64) -> bool {
    let mut timestamp: Option<i64> = None;
    let mut provided: Option<String> = None;

    for part in header.split(',') {
        if let Some(raw) = part.strip_prefix("t=") {
            timestamp = raw.trim().parse().ok();
        } else if let Some(raw) = part.strip_prefix("v1=") {
            provided = Some(raw.trim().to_string());
        }
    }

    let (Some(timestamp), Some(provided)) = (timestamp, provided) else {
        return false;
    };

    if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECONDS {
        return false;
    }

    let Ok(provided_bytes) = hex::decode(provided) else {
        return false;
    };

    let message = format!("{}.{}", timestamp, canonical_json(payload));
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(message.as_bytes());
    mac.verify_slice(&provided_bytes).is_ok()
}

/// Delivery timing: attempt n failing schedules a retry
/// `base * 2^(n-1)` minutes out; attempts are capped by configuration.
pub fn next_retry_time(attempt_number: i64, base_minutes: i64) -> NaiveDateTime {
    let exponent = (attempt_number - 1).clamp(0, 16) as u32;
    let delay_minutes = base_minutes.max(1) * (1i64 << exponent);
    Utc::now().naive_utc() + chrono::Duration::minutes(delay_minutes)
}

pub struct WebhookDeliveryService {
    http: reqwest::Client,
    config: WebhookConfig,
}

impl WebhookDeliveryService {
    pub fn new(config: WebhookConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .unwrap_or_default();

        Self { http, config }
    }

    pub fn max_attempts(&self) -> i64 {
        self.config.max_attempts
    }

    pub fn retry_base_minutes(&self) -> i64 {
        self.config.retry_base_minutes
    }

    /// POST the payload to the endpoint with a fresh signature.
    /// Any non-2xx status, network error, or timeout is a failure; the caller
    /// records the outcome and schedules retries.
    pub async fn deliver(&self, webhook_url: &str, payload: &Value, secret: &str) -> DeliveryOutcome {
        let timestamp = Utc::now().timestamp();
        let signature = sign_payload(secret, payload, timestamp);
        let delivery_id = Uuid::new_v4().to_string();

        if !webhook_url.starts_with("https://") {
            return DeliveryOutcome {
                success: false,
                http_status: None,
                error: Some("webhook URL must use HTTPS".to_string()),
                signature,
                delivery_id,
            };
        }

        let event = payload
            .get("event")
            .and_then(|v| v.as_str())
            .unwrap_or(CONDITION_MET_EVENT)
            .to_string();

        let body = canonical_json(payload);

        let result = self
            .http
            .post(webhook_url)
            .header(SIGNATURE_HEADER, &signature)
            .header(EVENT_HEADER, event)
            .header(DELIVERY_ID_HEADER, &delivery_id)
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await;

        match result {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    DeliveryOutcome {
                        success: true,
                        http_status: Some(status.as_u16() as i64),
                        error: None,
                        signature,
                        delivery_id,
                    }
                } else {
                    DeliveryOutcome {
                        success: false,
                        http_status: Some(status.as_u16() as i64),
                        error: Some(format!("endpoint returned HTTP {}", status)),
                        signature,
                        delivery_id,
                    }
                }
            }
            Err(e) => DeliveryOutcome {
                success: false,
                http_status: None,
                error: Some(e.to_string()),
                signature,
                delivery_id,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_json_is_key_order_independent() {
        let a = json!({"a": 1, "b": 2});
        let b = json!({"b": 2, "a": 1});
        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(canonical_json(&a), r#"{"a":1,"b":2}"#);
    }

    #[test]
    fn canonical_json_sorts_nested_objects() {
        let value = json!({
            "z": {"b": [1, {"y": 2, "x": 3}], "a": null},
            "a": "text"
        });
        assert_eq!(
            canonical_json(&value),
            r#"{"a":"text","z":{"a":null,"b":[1,{"x":3,"y":2}]}}"#
        );
    }

    #[test]
    fn sign_then_verify_round_trips() {
        let payload = json!({"event": "task.condition_met", "task": {"id": "t1"}});
        let now = 1_000_000;
        let header = sign_payload("secret", &payload, now);

        assert!(verify_signature("secret", &payload, &header, now));
        assert!(verify_signature("secret", &payload, &header, now + 299));
    }

    #[test]
    fn verification_rejects_expired_timestamp() {
        let payload = json!({"event": "task.condition_met"});
        let header = sign_payload("secret", &payload, 1_000_000);

        // 400 seconds later the HMAC still matches but the timestamp is stale.
        assert!(!verify_signature("secret", &payload, &header, 1_000_400));
    }

    #[test]
    fn verification_rejects_tampered_payload() {
        let payload = json!({"amount": 100});
        let header = sign_payload("secret", &payload, 1_000_000);

        let tampered = json!({"amount": 101});
        assert!(!verify_signature("secret", &tampered, &header, 1_000_000));
    }

    #[test]
    fn verification_rejects_wrong_secret_and_garbage_headers() {
        let payload = json!({"ok": true});
        let header = sign_payload("secret", &payload, 1_000_000);

        assert!(!verify_signature("other", &payload, &header, 1_000_000));
        assert!(!verify_signature("secret", &payload, "v1=abc", 1_000_000));
        assert!(!verify_signature("secret", &payload, "t=1000000,v1=zz", 1_000_000));
        assert!(!verify_signature("secret", &payload, "", 1_000_000));
    }

    #[test]
    fn signature_survives_reordered_verification_payload() {
        let signed = json!({"b": 2, "a": 1});
        let header = sign_payload("secret", &signed, 1_000_000);

        let reordered = json!({"a": 1, "b": 2});
        assert!(verify_signature("secret", &reordered, &header, 1_000_000));
    }

    #[test]
    fn retry_delays_double_per_attempt() {
        let base = Utc::now().naive_utc();
        for (attempt, minutes) in [(1, 1i64), (2, 2), (3, 4), (4, 8), (5, 16)] {
            let at = next_retry_time(attempt, 1);
            let delta = at - base;
            assert!(
                (delta.num_seconds() - minutes * 60).abs() <= 2,
                "attempt {} expected ~{}m, got {}s",
                attempt,
                minutes,
                delta.num_seconds()
            );
        }
    }
}
