//! Outbound webhook delivery for gate decisions and credit events. `emit`
//! only pushes onto a bounded in-memory queue and returns — a slow or down
//! webhook receiver must never add latency to the gate's critical path. A
//! background worker (started via `spawn_worker`) drains the queue one
//! delivery at a time, retrying with backoff; permanent failures land in a
//! queryable dead-letter ring. The queue itself drops the oldest entry on
//! overflow rather than blocking the producer.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Serialize;
use serde_json::{json, Value};
use sha2::Sha256;
use tokio::sync::Notify;
use tracing::warn;

use crate::gate::{GateDecision, GateError, GateRequest};
use crate::keystore::mask_key;
use crate::retry::{retry_with_backoff, RetryConfig};

type HmacSha256 = Hmac<Sha256>;

const DEFAULT_DEAD_LETTER_CAPACITY: usize = 1_000;

#[derive(Debug, Clone, Serialize)]
pub struct WebhookEvent {
    pub id: String,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

impl WebhookEvent {
    fn new(event_type: &str, payload: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_type: event_type.to_string(),
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn gate_allow(req: &GateRequest, decision: &GateDecision) -> Self {
        Self::new(
            "gate.allow",
            json!({
                "apiKey": req.api_key.as_deref().map(mask_key),
                "tool": req.tool,
                "creditsCharged": decision.credits_charged,
                "remaining": decision.remaining,
            }),
        )
    }

    pub fn gate_deny(req: &GateRequest, err: &GateError) -> Self {
        Self::new(
            "gate.deny",
            json!({
                "apiKey": req.api_key.as_deref().map(mask_key),
                "tool": req.tool,
                "reason": err.reason(),
            }),
        )
    }

    pub fn credits_refund(req: &GateRequest, decision: &GateDecision) -> Self {
        Self::new(
            "credits.refund",
            json!({
                "apiKey": req.api_key.as_deref().map(mask_key),
                "tool": req.tool,
                "refunded": decision.credits_charged,
            }),
        )
    }

    pub fn key_lifecycle(kind: &str, key_masked: &str, detail: Value) -> Self {
        Self::new(
            kind,
            json!({
                "apiKey": key_masked,
                "detail": detail,
            }),
        )
    }
}

const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    /// `None` disables delivery entirely — `emit` becomes a cheap no-op.
    pub url: Option<String>,
    pub secret: Option<String>,
    pub max_attempts: u32,
    pub timeout: Duration,
    pub queue_capacity: usize,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: None,
            secret: None,
            max_attempts: 5,
            timeout: Duration::from_secs(10),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// An event that exhausted every retry attempt. Kept in memory only — a
/// process restart drops the queue, same tradeoff this codebase makes for
/// the usage/audit rings.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterEntry {
    pub event: WebhookEvent,
    pub failure_reason: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

pub struct WebhookDispatcher {
    config: WebhookConfig,
    client: reqwest::Client,
    queue: Mutex<VecDeque<WebhookEvent>>,
    notify: Notify,
    dead_letter: Mutex<VecDeque<DeadLetterEntry>>,
    capacity: usize,
}

impl WebhookDispatcher {
    pub fn new(config: WebhookConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            dead_letter: Mutex::new(VecDeque::new()),
            capacity: DEFAULT_DEAD_LETTER_CAPACITY,
            config,
        }
    }

    /// Enqueues a delivery. Non-blocking: drops the oldest queued event on
    /// overflow rather than applying backpressure to the caller. No-op when
    /// no webhook URL is configured.
    pub fn emit(&self, event: WebhookEvent) {
        if self.config.url.is_none() {
            return;
        }
        let mut queue = self.queue.lock().unwrap();
        if queue.len() >= self.config.queue_capacity {
            queue.pop_front();
        }
        queue.push_back(event);
        drop(queue);
        self.notify.notify_one();
    }

    /// Drives the delivery loop: waits for queued events, delivers (with
    /// retry) one at a time. Spawn this once at startup via `spawn_worker`.
    async fn run(self: Arc<Self>) {
        loop {
            let event = loop {
                if let Some(event) = self.queue.lock().unwrap().pop_front() {
                    break event;
                }
                self.notify.notified().await;
            };
            let Some(url) = self.config.url.clone() else { continue };
            self.deliver(url, event).await;
        }
    }

    async fn deliver(&self, url: String, event: WebhookEvent) {
        let body = serde_json::to_vec(&event).unwrap_or_default();
        let signature = self.config.secret.as_deref().map(|s| sign(s, &body));
        let retry_cfg = RetryConfig::webhook(self.config.max_attempts);
        let mut attempts = 0u32;

        let result = retry_with_backoff(&retry_cfg, || {
            attempts += 1;
            let client = &self.client;
            let url = &url;
            let body = body.clone();
            let signature = signature.clone();
            let timeout = self.config.timeout;
            async move {
                let mut req = client
                    .post(url)
                    .header("content-type", "application/json")
                    .body(body);
                if let Some(sig) = signature {
                    req = req.header("x-webhook-signature", format!("sha256={sig}"));
                }
                let resp = tokio::time::timeout(timeout, req.send())
                    .await
                    .map_err(|_| "timeout".to_string())?
                    .map_err(|e| e.to_string())?;
                if resp.status().is_success() {
                    Ok(())
                } else {
                    Err(format!("status {}", resp.status()))
                }
            }
        })
        .await;

        if let Err(reason) = result {
            warn!(event_type = %event.event_type, err = %reason, "webhook delivery exhausted retries");
            let mut dl = self.dead_letter.lock().unwrap();
            if dl.len() >= self.capacity {
                dl.pop_front();
            }
            dl.push_back(DeadLetterEntry {
                event,
                failure_reason: reason,
                attempts,
                failed_at: Utc::now(),
            });
        }
    }

    pub fn dead_letter_list(&self) -> Vec<DeadLetterEntry> {
        self.dead_letter.lock().unwrap().iter().cloned().collect()
    }

    pub fn dead_letter_len(&self) -> usize {
        self.dead_letter.lock().unwrap().len()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }
}

pub fn spawn_worker(dispatcher: Arc<WebhookDispatcher>) {
    tokio::spawn(dispatcher.run());
}

/// HMAC-SHA256 over the raw request body, hex-encoded. Used both to sign
/// outbound webhook bodies and (with the caller's own key) to verify
/// inbound Stripe-style signature headers.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

pub fn verify(secret: &str, body: &[u8], signature_hex: &str) -> bool {
    let expected = sign(secret, body);
    // Constant-time-ish comparison: lengths differ fast-path, otherwise XOR all bytes.
    if expected.len() != signature_hex.len() {
        return false;
    }
    expected
        .bytes()
        .zip(signature_hex.bytes())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_is_deterministic_and_verifies() {
        let sig = sign("secret", b"hello");
        assert!(verify("secret", b"hello", &sig));
    }

    #[test]
    fn verify_rejects_wrong_secret() {
        let sig = sign("secret", b"hello");
        assert!(!verify("other", b"hello", &sig));
    }

    #[test]
    fn verify_rejects_tampered_body() {
        let sig = sign("secret", b"hello");
        assert!(!verify("secret", b"goodbye", &sig));
    }

    #[test]
    fn emit_without_url_is_a_noop() {
        let dispatcher = WebhookDispatcher::new(WebhookConfig::default());
        dispatcher.emit(WebhookEvent::new("test.event", json!({})));
        assert_eq!(dispatcher.queue_len(), 0);
        assert_eq!(dispatcher.dead_letter_len(), 0);
    }

    #[tokio::test]
    async fn emit_queues_when_url_configured() {
        let dispatcher = WebhookDispatcher::new(WebhookConfig {
            url: Some("http://127.0.0.1:9/unreachable".into()),
            ..WebhookConfig::default()
        });
        dispatcher.emit(WebhookEvent::new("test.event", json!({})));
        assert_eq!(dispatcher.queue_len(), 1);
    }
}
