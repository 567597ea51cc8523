//! End-to-end scenarios for the gate pipeline, against a real (tempdir-backed)
//! `KeyStore` and in-process meter/audit/webhook — no network, no mock
//! backend. Each test is one literal scenario: a key is created, one or more
//! calls are run through `Gate::evaluate`, and the resulting balances/audit
//! trail/denial reasons are checked.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use paygate::audit::AuditLog;
use paygate::gate::{Gate, GateRequest, NoopTeamHook, PricingTable};
use paygate::keystore::{KeyStore, NewKeyOpts};
use paygate::meter::Meter;
use paygate::plugin::PluginRegistry;
use paygate::quota::QuotaTracker;
use paygate::ratelimit::RateLimiter;
use paygate::webhook::{WebhookConfig, WebhookDispatcher};

async fn test_gate(default_price: i64) -> (Gate, Arc<KeyStore>) {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(KeyStore::load(dir.path().join("keys.json")).await);
    let gate = Gate {
        store: store.clone(),
        rate_limiter: Arc::new(RateLimiter::new()),
        quota: Arc::new(QuotaTracker::new(store.clone())),
        meter: Arc::new(Meter::new(1000)),
        audit: Arc::new(AuditLog::new(1000)),
        webhook: Arc::new(WebhookDispatcher::new(WebhookConfig::default())),
        plugins: Arc::new(PluginRegistry::default()),
        team_hook: Arc::new(NoopTeamHook),
        pricing: PricingTable {
            per_tool: HashMap::new(),
            default_credits_per_call: default_price,
            per_kb_surcharge: 0,
        },
        maintenance_mode: Arc::new(AtomicBool::new(false)),
        shadow_mode: Arc::new(AtomicBool::new(false)),
        refund_on_failure: true,
        default_rate_limit_per_minute: None,
    };
    (gate, store)
}

fn call(key: &str, tool: &str) -> GateRequest {
    GateRequest {
        call_id: uuid::Uuid::new_v4().to_string(),
        api_key: Some(key.to_string()),
        tool: tool.to_string(),
        args: serde_json::json!({}),
        client_ip: None,
        input_bytes: 0,
    }
}

#[tokio::test]
async fn happy_path() {
    let (gate, store) = test_gate(1).await;
    let rec = store
        .create_key("alice".into(), 10, NewKeyOpts::default())
        .await
        .unwrap();

    let decision = gate.evaluate(&call(&rec.key, "echo")).await.unwrap();
    assert!(decision.allowed);
    assert_eq!(decision.credits_charged, 1);
    assert_eq!(decision.remaining, 9);

    let balance = store.get_key(&rec.key).await.unwrap();
    assert_eq!(balance.credits, 9);
    assert_eq!(balance.total_spent, 1);
    assert_eq!(balance.total_calls, 1);
}

#[tokio::test]
async fn exhaustion_denies_second_call_and_leaves_balance_unchanged() {
    let (gate, store) = test_gate(2).await;
    let rec = store
        .create_key("bob".into(), 3, NewKeyOpts::default())
        .await
        .unwrap();

    let first = gate.evaluate(&call(&rec.key, "search")).await.unwrap();
    assert!(first.allowed);
    assert_eq!(first.remaining, 1);

    let second = gate.evaluate(&call(&rec.key, "search")).await;
    let err = second.unwrap_err();
    assert_eq!(err.reason(), "insufficient_credits");
    assert_eq!(err.jsonrpc_code(), -32402);

    let balance = store.get_key(&rec.key).await.unwrap();
    assert_eq!(balance.credits, 1);
}

#[tokio::test]
async fn rotation_preserves_counters_and_invalidates_old_key() {
    let (gate, store) = test_gate(1).await;
    let k1 = store
        .create_key("carol".into(), 100, NewKeyOpts::default())
        .await
        .unwrap();
    store.deduct_credits(&k1.key, 40).await.unwrap();

    let k2 = store.rotate_key(&k1.key).await.unwrap();
    assert_eq!(k2.credits, 60);
    assert_eq!(k2.total_spent, 40);

    let denied = gate.evaluate(&call(&k1.key, "echo")).await;
    assert_eq!(denied.unwrap_err().reason(), "invalid_api_key");

    let allowed = gate.evaluate(&call(&k2.key, "echo")).await.unwrap();
    assert!(allowed.allowed);
    let balance = store.get_key(&k2.key).await.unwrap();
    assert_eq!(balance.total_spent, 41);
}

#[tokio::test]
async fn acl_deny_wins_over_allow_and_unlisted_tools_are_not_allowed() {
    let (gate, store) = test_gate(0).await;
    let rec = store
        .create_key(
            "dave".into(),
            10,
            NewKeyOpts {
                allowed_tools: Some(vec!["a".into(), "b".into()]),
                denied_tools: Some(vec!["b".into()]),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert!(gate.evaluate(&call(&rec.key, "a")).await.unwrap().allowed);

    let denied = gate.evaluate(&call(&rec.key, "b")).await;
    assert_eq!(denied.unwrap_err().reason(), "tool_denied");

    let not_allowed = gate.evaluate(&call(&rec.key, "c")).await;
    assert_eq!(not_allowed.unwrap_err().reason(), "tool_not_allowed");
}

#[tokio::test]
async fn refund_on_backend_failure_restores_balance() {
    let (gate, store) = test_gate(5).await;
    let rec = store
        .create_key("erin".into(), 10, NewKeyOpts::default())
        .await
        .unwrap();

    let req = call(&rec.key, "risky");
    let decision = gate.evaluate(&req).await.unwrap();
    assert_eq!(decision.credits_charged, 5);
    let mid = store.get_key(&rec.key).await.unwrap();
    assert_eq!(mid.credits, 5);

    gate.finalize(&req, &decision, true).await;

    let after = store.get_key(&rec.key).await.unwrap();
    assert_eq!(after.credits, 10);
    assert_eq!(after.total_spent, 0);
}

#[tokio::test]
async fn suspended_key_is_denied() {
    let (gate, store) = test_gate(1).await;
    let rec = store
        .create_key("frank".into(), 10, NewKeyOpts::default())
        .await
        .unwrap();
    store.suspend_key(&rec.key).await.unwrap();

    let denied = gate.evaluate(&call(&rec.key, "echo")).await;
    assert_eq!(denied.unwrap_err().reason(), "key_suspended");
}

#[tokio::test]
async fn shadow_mode_allows_but_records_would_be_denial() {
    // Steps 6–12 (here: insufficient credits at the deduct step) are the
    // denials shadow mode is scoped to convert into allows.
    let (gate, store) = test_gate(5).await;
    let rec = store
        .create_key("grace".into(), 0, NewKeyOpts::default())
        .await
        .unwrap();
    gate.shadow_mode.store(true, std::sync::atomic::Ordering::Release);

    let decision = gate.evaluate(&call(&rec.key, "echo")).await.unwrap();
    assert!(decision.allowed);
    assert!(decision.shadow_overridden);
    assert_eq!(decision.credits_charged, 0);
}

#[tokio::test]
async fn shadow_mode_does_not_override_auth_or_acl_denials() {
    // Steps 1–5 (here: a suspended key) are hard denials regardless of
    // shadow mode — only steps 6–12 are observation-only.
    let (gate, store) = test_gate(1).await;
    let rec = store
        .create_key("grace2".into(), 10, NewKeyOpts::default())
        .await
        .unwrap();
    store.suspend_key(&rec.key).await.unwrap();
    gate.shadow_mode.store(true, std::sync::atomic::Ordering::Release);

    let denied = gate.evaluate(&call(&rec.key, "echo")).await;
    assert_eq!(denied.unwrap_err().reason(), "key_suspended");
}

#[tokio::test]
async fn maintenance_mode_denies_every_call() {
    let (gate, store) = test_gate(1).await;
    let rec = store
        .create_key("heidi".into(), 10, NewKeyOpts::default())
        .await
        .unwrap();
    gate.maintenance_mode
        .store(true, std::sync::atomic::Ordering::Release);

    let denied = gate.evaluate(&call(&rec.key, "echo")).await;
    assert_eq!(denied.unwrap_err().reason(), "maintenance");
}

#[tokio::test]
async fn missing_api_key_is_denied() {
    let (gate, _store) = test_gate(1).await;
    let req = GateRequest {
        call_id: "x".into(),
        api_key: None,
        tool: "echo".into(),
        args: serde_json::json!({}),
        client_ip: None,
        input_bytes: 0,
    };
    let denied = gate.evaluate(&req).await;
    assert_eq!(denied.unwrap_err().reason(), "missing_api_key");
}
