//! Stripe webhook ingestion: a thin signed-payload verifier plus the
//! minimal `Event` shape this gateway cares about. Full checkout-session
//! creation and the broader Stripe API are external concerns (see
//! `SPEC_FULL.md` §1) — this is only the inbound top-up path.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::audit::AuditEntry;
use crate::error::AppError;
use crate::webhook::{verify, WebhookEvent};
use crate::AppState;

const REPLAY_TOLERANCE_SECS: i64 = 5 * 60;

#[derive(Debug, Deserialize)]
struct StripeEvent {
    #[serde(rename = "type")]
    kind: String,
    data: StripeEventData,
}

#[derive(Debug, Deserialize)]
struct StripeEventData {
    object: StripeObject,
}

#[derive(Debug, Deserialize)]
struct StripeObject {
    #[serde(default)]
    metadata: std::collections::HashMap<String, String>,
}

/// Parses `Stripe-Signature: t=<unix>,v1=<hex>` and verifies it with
/// HMAC-SHA256 over `"{t}.{body}"`, rejecting anything outside the replay
/// tolerance window.
fn verify_stripe_signature(header: &str, body: &[u8], secret: &str) -> bool {
    let mut timestamp: Option<i64> = None;
    let mut v1: Option<&str> = None;
    for part in header.split(',') {
        if let Some(t) = part.strip_prefix("t=") {
            timestamp = t.parse().ok();
        } else if let Some(sig) = part.strip_prefix("v1=") {
            v1 = Some(sig);
        }
    }
    let (Some(t), Some(sig)) = (timestamp, v1) else {
        return false;
    };
    let now = Utc::now().timestamp();
    if (now - t).abs() > REPLAY_TOLERANCE_SECS {
        return false;
    }
    let signed_payload = [t.to_string().as_bytes(), b".", body].concat();
    verify(secret, &signed_payload, sig)
}

pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<Json<Value>, AppError> {
    let Some(secret) = state.config.stripe_secret.as_deref() else {
        return Err(AppError::BadRequest("stripe webhook not configured".into()));
    };

    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::Unauthorized)?;

    if !verify_stripe_signature(signature, &body, secret) {
        return Err(AppError::Unauthorized);
    }

    let event: StripeEvent = serde_json::from_slice(&body)
        .map_err(|e| AppError::BadRequest(format!("malformed stripe event: {e}")))?;

    if event.kind != "checkout.session.completed" && event.kind != "payment_intent.succeeded" {
        return Ok(Json(json!({ "received": true, "handled": false })));
    }

    let metadata = &event.data.object.metadata;
    let Some(api_key) = metadata.get("paygate_api_key") else {
        return Ok(Json(json!({ "received": true, "handled": false })));
    };
    let credits: i64 = metadata
        .get("paygate_credits")
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| AppError::BadRequest("missing paygate_credits metadata".into()))?;

    let record = state.keystore.add_credits(api_key, credits).await?;
    state.audit.record(AuditEntry::new(
        "credits.stripe_topup",
        "stripe",
        format!("key={} amount={}", record.masked(), credits),
    ));
    state.webhook.emit(WebhookEvent::key_lifecycle(
        "credits.stripe_topup",
        &record.masked(),
        json!({ "amount": credits }),
    ));

    Ok(Json(json!({ "received": true, "handled": true })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webhook::sign;

    #[test]
    fn verifies_well_formed_signature() {
        let body = b"{\"hello\":\"world\"}";
        let t = Utc::now().timestamp();
        let signed_payload = [t.to_string().as_bytes(), b".", body.as_slice()].concat();
        let sig = sign("whsec_test", &signed_payload);
        let header = format!("t={t},v1={sig}");
        assert!(verify_stripe_signature(&header, body, "whsec_test"));
    }

    #[test]
    fn rejects_tampered_body() {
        let body = b"{\"hello\":\"world\"}";
        let t = Utc::now().timestamp();
        let signed_payload = [t.to_string().as_bytes(), b".", body.as_slice()].concat();
        let sig = sign("whsec_test", &signed_payload);
        let header = format!("t={t},v1={sig}");
        assert!(!verify_stripe_signature(&header, b"{\"hello\":\"tampered\"}", "whsec_test"));
    }

    #[test]
    fn rejects_outside_replay_tolerance() {
        let body = b"{}";
        let t = Utc::now().timestamp() - REPLAY_TOLERANCE_SECS - 60;
        let signed_payload = [t.to_string().as_bytes(), b".", body.as_slice()].concat();
        let sig = sign("whsec_test", &signed_payload);
        let header = format!("t={t},v1={sig}");
        assert!(!verify_stripe_signature(&header, body, "whsec_test"));
    }
}
