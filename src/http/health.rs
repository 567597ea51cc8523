//! Liveness/readiness probes and the Prometheus text exporter. All three
//! routes are public — no API key, no admin key.

use axum::extract::State;
use axum::Json;
use serde_json::json;

use crate::AppState;

pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "uptimeSecs": state.started_at.elapsed().as_secs(),
    }))
}

/// Readiness additionally reports the router's backend state — a gateway
/// with no reachable backend is alive but not ready to serve traffic.
pub async fn ready(State(state): State<AppState>) -> Json<serde_json::Value> {
    let degraded = state.router.backend_prefixes().is_empty();
    Json(json!({
        "ready": !degraded,
        "backends": state.router.backend_prefixes(),
    }))
}

/// Prometheus text exposition format, `# TYPE`/`# HELP` per metric.
pub async fn metrics(State(state): State<AppState>) -> String {
    let mut out = String::new();

    out.push_str("# HELP paygate_keys_total Number of keys known to the keystore.\n");
    out.push_str("# TYPE paygate_keys_total gauge\n");
    out.push_str(&format!(
        "paygate_keys_total {}\n",
        state.keystore.list_keys().await.len()
    ));

    out.push_str("# HELP paygate_usage_events_total Usage events currently retained in the meter ring.\n");
    out.push_str("# TYPE paygate_usage_events_total gauge\n");
    out.push_str(&format!("paygate_usage_events_total {}\n", state.meter.len()));

    out.push_str("# HELP paygate_audit_entries_total Audit entries currently retained.\n");
    out.push_str("# TYPE paygate_audit_entries_total gauge\n");
    out.push_str(&format!("paygate_audit_entries_total {}\n", state.audit.len()));

    out.push_str("# HELP paygate_webhook_queue_depth Pending webhook deliveries.\n");
    out.push_str("# TYPE paygate_webhook_queue_depth gauge\n");
    out.push_str(&format!(
        "paygate_webhook_queue_depth {}\n",
        state.webhook.queue_len()
    ));

    out.push_str("# HELP paygate_webhook_dead_letter_total Webhook deliveries that exhausted retries.\n");
    out.push_str("# TYPE paygate_webhook_dead_letter_total gauge\n");
    out.push_str(&format!(
        "paygate_webhook_dead_letter_total {}\n",
        state.webhook.dead_letter_len()
    ));

    out.push_str("# HELP paygate_sessions_active Active Streamable-HTTP sessions.\n");
    out.push_str("# TYPE paygate_sessions_active gauge\n");
    out.push_str(&format!("paygate_sessions_active {}\n", state.sessions.len()));

    out.push_str("# HELP paygate_uptime_seconds Process uptime in seconds.\n");
    out.push_str("# TYPE paygate_uptime_seconds counter\n");
    out.push_str(&format!(
        "paygate_uptime_seconds {}\n",
        state.started_at.elapsed().as_secs()
    ));

    out
}
