//! The gate: the ordered policy-plus-billing pipeline that turns an
//! incoming tool call into an allow/deny decision with atomic credit
//! accounting. This is the critical path — every suspension point here is
//! a backend dependency (KeyStore, RateLimiter, QuotaTracker), never a
//! disk write directly.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::StatusCode;
use chrono::Utc;
use ipnet::IpNet;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::info;

use crate::audit::{AuditEntry, AuditLog};
use crate::keystore::{mask_key, KeyRecord, KeyStore, StoreError};
use crate::meter::{Meter, UsageEvent};
use crate::plugin::PluginRegistry;
use crate::quota::{QuotaDenyReason, QuotaTracker};
use crate::ratelimit::RateLimiter;
use crate::webhook::{WebhookDispatcher, WebhookEvent};

#[derive(Debug, Error)]
pub enum GateError {
    #[error("maintenance")]
    Maintenance,
    #[error("missing_api_key")]
    MissingApiKey,
    #[error("invalid_api_key")]
    InvalidApiKey,
    #[error("key_expired")]
    KeyExpired,
    #[error("key_suspended")]
    KeySuspended,
    #[error("ip_not_allowed")]
    IpNotAllowed,
    #[error("tool_denied")]
    ToolDenied,
    #[error("tool_not_allowed")]
    ToolNotAllowed,
    #[error("rate_limited")]
    RateLimited { retry_after_secs: u64 },
    #[error("rate_limited_tool")]
    RateLimitedTool { retry_after_secs: u64 },
    #[error("{}", .0.as_str())]
    QuotaExceeded(QuotaDenyReason),
    #[error("team_budget")]
    TeamBudget,
    #[error("team_quota")]
    TeamQuota,
    #[error("spending_limit")]
    SpendingLimit,
    #[error("insufficient_credits")]
    InsufficientCredits,
}

impl GateError {
    pub fn reason(&self) -> &'static str {
        match self {
            GateError::Maintenance => "maintenance",
            GateError::MissingApiKey => "missing_api_key",
            GateError::InvalidApiKey => "invalid_api_key",
            GateError::KeyExpired => "key_expired",
            GateError::KeySuspended => "key_suspended",
            GateError::IpNotAllowed => "ip_not_allowed",
            GateError::ToolDenied => "tool_denied",
            GateError::ToolNotAllowed => "tool_not_allowed",
            GateError::RateLimited { .. } => "rate_limited",
            GateError::RateLimitedTool { .. } => "rate_limited_tool",
            GateError::QuotaExceeded(reason) => reason.as_str(),
            GateError::TeamBudget => "team_budget",
            GateError::TeamQuota => "team_quota",
            GateError::SpendingLimit => "spending_limit",
            GateError::InsufficientCredits => "insufficient_credits",
        }
    }

    /// JSON-RPC error code per the taxonomy: -32402 insufficient credits,
    /// -32001 rate limited, -32000 for everything else denial-shaped.
    pub fn jsonrpc_code(&self) -> i64 {
        match self {
            GateError::InsufficientCredits => -32402,
            GateError::RateLimited { .. } | GateError::RateLimitedTool { .. } => -32001,
            _ => -32000,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GateError::MissingApiKey | GateError::InvalidApiKey => StatusCode::UNAUTHORIZED,
            GateError::KeyExpired
            | GateError::KeySuspended
            | GateError::IpNotAllowed
            | GateError::ToolDenied
            | GateError::ToolNotAllowed
            | GateError::SpendingLimit
            | GateError::TeamBudget
            | GateError::TeamQuota
            | GateError::QuotaExceeded(_) => StatusCode::FORBIDDEN,
            GateError::RateLimited { .. } | GateError::RateLimitedTool { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            GateError::InsufficientCredits => StatusCode::PAYMENT_REQUIRED,
            GateError::Maintenance => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Shadow mode only converts denials from steps 6–12 (rate limit,
    /// quota, team budget, spending limit, credit deduction) into allows.
    /// Steps 1–5 (maintenance, auth, IP allowlist, ACL) stay hard denials
    /// even in shadow mode — there is no "observe but let an invalid key
    /// through" reading of the contract.
    fn is_shadow_convertible(&self) -> bool {
        matches!(
            self,
            GateError::RateLimited { .. }
                | GateError::RateLimitedTool { .. }
                | GateError::QuotaExceeded(_)
                | GateError::TeamBudget
                | GateError::TeamQuota
                | GateError::SpendingLimit
                | GateError::InsufficientCredits
        )
    }
}

#[derive(Debug, Clone)]
pub struct GateRequest {
    pub call_id: String,
    pub api_key: Option<String>,
    pub tool: String,
    pub args: Value,
    pub client_ip: Option<IpAddr>,
    pub input_bytes: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct GateDecision {
    pub allowed: bool,
    pub credits_charged: i64,
    pub remaining: i64,
    pub rate_limit_limit: u32,
    pub rate_limit_remaining: u32,
    pub rate_limit_reset_in_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deny_reason: Option<String>,
    #[serde(skip)]
    pub key_masked: Option<String>,
    #[serde(skip)]
    pub shadow_overridden: bool,
}

/// Per-tool pricing table plus defaults. `per_kb_surcharge` adds credits
/// proportional to request size, per KB of `GateRequest::input_bytes`.
#[derive(Debug, Clone, Default)]
pub struct PricingTable {
    pub per_tool: std::collections::HashMap<String, i64>,
    pub default_credits_per_call: i64,
    pub per_kb_surcharge: i64,
}

impl PricingTable {
    pub fn price_for(&self, tool: &str, input_bytes: usize) -> i64 {
        let base = self
            .per_tool
            .get(tool)
            .copied()
            .unwrap_or(self.default_credits_per_call);
        let surcharge = self.per_kb_surcharge * (input_bytes as i64 / 1024);
        base + surcharge
    }
}

/// Interface to an external team-budget collaborator. The full
/// grant/anomaly/team subsystem lives outside this crate; this is the only
/// seam the Gate needs from it.
#[async_trait]
pub trait TeamHook: Send + Sync {
    async fn check(&self, key: &KeyRecord, price: i64) -> Option<GateError>;
}

pub struct NoopTeamHook;

#[async_trait]
impl TeamHook for NoopTeamHook {
    async fn check(&self, _key: &KeyRecord, _price: i64) -> Option<GateError> {
        None
    }
}

pub struct Gate {
    pub store: Arc<KeyStore>,
    pub rate_limiter: Arc<RateLimiter>,
    pub quota: Arc<QuotaTracker>,
    pub meter: Arc<Meter>,
    pub audit: Arc<AuditLog>,
    pub webhook: Arc<WebhookDispatcher>,
    pub plugins: Arc<PluginRegistry>,
    pub team_hook: Arc<dyn TeamHook>,
    pub pricing: PricingTable,
    pub maintenance_mode: Arc<AtomicBool>,
    pub shadow_mode: Arc<AtomicBool>,
    pub refund_on_failure: bool,
    /// Applied when a key carries no `rate_limit_per_minute` override.
    /// `None` disables the global per-key rate limit entirely.
    pub default_rate_limit_per_minute: Option<u32>,
}

impl Gate {
    /// The thirteen-step ordered pipeline. First failure wins; every
    /// denial emits (in order) a usage event, an audit entry, a webhook
    /// event, and the plugin `on_deny` hook.
    pub async fn evaluate(&self, req: &GateRequest) -> Result<GateDecision, GateError> {
        if let Some(decision) = self.plugins.before_gate(req).await {
            return Ok(decision);
        }

        match self.evaluate_inner(req).await {
            Ok(decision) => Ok(decision),
            Err(err) => {
                if self.shadow_mode.load(Ordering::Acquire) && err.is_shadow_convertible() {
                    let decision = GateDecision {
                        allowed: true,
                        credits_charged: 0,
                        remaining: self.current_credits(req).await,
                        rate_limit_limit: 0,
                        rate_limit_remaining: 0,
                        rate_limit_reset_in_ms: 0,
                        deny_reason: None,
                        key_masked: req.api_key.as_deref().map(mask_key),
                        shadow_overridden: true,
                    };
                    self.record_allow(req, &decision).await;
                    Ok(decision)
                } else {
                    self.record_deny(req, &err).await;
                    Err(err)
                }
            }
        }
    }

    async fn current_credits(&self, req: &GateRequest) -> i64 {
        let Some(key) = &req.api_key else { return 0 };
        self.store.get_key(key).await.map(|k| k.credits).unwrap_or(0)
    }

    async fn evaluate_inner(&self, req: &GateRequest) -> Result<GateDecision, GateError> {
        // 1. Maintenance mode.
        if self.maintenance_mode.load(Ordering::Acquire) {
            return Err(GateError::Maintenance);
        }

        // 2. Missing API key.
        let api_key = req.api_key.as_deref().ok_or(GateError::MissingApiKey)?;

        // 3. Key lookup.
        let raw = self
            .store
            .get_key_raw(api_key)
            .await
            .map_err(|_| GateError::InvalidApiKey)?;
        if !raw.active {
            return Err(GateError::InvalidApiKey);
        }
        let now = Utc::now();
        if raw.is_expired(now) {
            return Err(GateError::KeyExpired);
        }
        if raw.suspended {
            return Err(GateError::KeySuspended);
        }

        // 4. IP allowlist.
        if let Some(allowlist) = &raw.ip_allowlist {
            if !allowlist.is_empty() {
                let ip = req.client_ip.ok_or(GateError::IpNotAllowed)?;
                if !ip_allowed(&allowlist.iter().map(String::as_str).collect::<Vec<_>>(), ip) {
                    return Err(GateError::IpNotAllowed);
                }
            }
        }

        // 5. ACL: deny wins on overlap.
        if let Some(denied) = &raw.denied_tools {
            if denied.iter().any(|t| t == &req.tool) {
                return Err(GateError::ToolDenied);
            }
        }
        if let Some(allowed) = &raw.allowed_tools {
            if !allowed.iter().any(|t| t == &req.tool) {
                return Err(GateError::ToolNotAllowed);
            }
        }

        // 6. Global per-key rate limit. `peek` only — the counter bumps
        // only once the call is actually allowed all the way through (see
        // the `rate_limiter.commit` calls after step 12), so a call that
        // passes the rate-limit check but is later denied on quota/spending/
        // credits never consumes a slot from the window.
        let mut rl_result = None;
        let mut rl_limit = None;
        let mut rl_commits: Vec<Option<String>> = Vec::new();
        if let Some(limit) = raw
            .rate_limit_per_minute
            .or(self.default_rate_limit_per_minute)
        {
            let result = self.rate_limiter.peek(api_key, None, limit);
            if !result.allowed {
                return Err(GateError::RateLimited {
                    retry_after_secs: result.reset_in_ms / 1000,
                });
            }
            rl_result = Some(result);
            rl_limit = Some(limit);
            rl_commits.push(None);
        }

        // 7. Per-tool rate limit.
        if let Some(limit) = raw.tool_rate_limits.get(&req.tool).copied() {
            let result = self.rate_limiter.peek(api_key, Some(&req.tool), limit);
            if !result.allowed {
                return Err(GateError::RateLimitedTool {
                    retry_after_secs: result.reset_in_ms / 1000,
                });
            }
            rl_result = Some(result);
            rl_limit = Some(limit);
            rl_commits.push(Some(req.tool.clone()));
        }

        // 8. Quota check.
        let price = self.pricing.price_for(&req.tool, req.input_bytes);
        let price = self.plugins.transform_price(req, price).await;
        if let Some(reason) = self
            .quota
            .check(api_key, price)
            .await
            .map_err(|_| GateError::InvalidApiKey)?
        {
            return Err(GateError::QuotaExceeded(reason));
        }

        // 9. Team budget/quota (external hook; no-op unless wired).
        if let Some(err) = self.team_hook.check(&raw, price).await {
            return Err(err);
        }

        // 10. Price computation already done above (step 8) so the quota
        // check uses the real charge amount.

        // 11. Spending-limit check.
        if let Some(limit) = raw.spending_limit {
            if raw.total_spent + price > limit {
                return Err(GateError::SpendingLimit);
            }
        }

        // 12. Atomic credit deduction — the linearization point.
        let deducted = self.store.deduct_credits(api_key, price).await;
        let record = match deducted {
            Ok(r) => r,
            Err(StoreError::InsufficientCredits) => return Err(GateError::InsufficientCredits),
            Err(StoreError::Inactive) => return Err(GateError::InvalidApiKey),
            Err(_) => return Err(GateError::InvalidApiKey),
        };

        // 13. Record quota + meter + metrics + plugin afterGate.
        self.quota.record(api_key, price).await.ok();

        // The call is now actually allowed end to end — commit the
        // rate-limit scopes peeked at steps 6–7.
        for scope in &rl_commits {
            self.rate_limiter.commit(api_key, scope.as_deref());
        }

        let decision = GateDecision {
            allowed: true,
            credits_charged: price,
            remaining: record.credits,
            rate_limit_limit: rl_limit.unwrap_or(0),
            rate_limit_remaining: rl_result.as_ref().map(|r| r.remaining).unwrap_or(0),
            rate_limit_reset_in_ms: rl_result.as_ref().map(|r| r.reset_in_ms).unwrap_or(0),
            deny_reason: None,
            key_masked: Some(mask_key(api_key)),
            shadow_overridden: false,
        };
        self.record_allow(req, &decision).await;
        Ok(decision)
    }

    async fn record_allow(&self, req: &GateRequest, decision: &GateDecision) {
        self.meter.record(UsageEvent {
            timestamp: Utc::now(),
            api_key: req.api_key.clone().unwrap_or_default(),
            key_name: String::new(),
            tool: req.tool.clone(),
            credits_charged: decision.credits_charged,
            allowed: true,
            deny_reason: None,
        });
        self.audit.record(AuditEntry::new(
            "gate.allow",
            req.api_key.as_deref().map(mask_key).unwrap_or_default(),
            format!("tool={} credits={}", req.tool, decision.credits_charged),
        ));
        self.webhook.emit(WebhookEvent::gate_allow(req, decision));
        self.plugins.after_gate(req, decision).await;
        info!(tool = %req.tool, credits = decision.credits_charged, "gate allow");
    }

    async fn record_deny(&self, req: &GateRequest, err: &GateError) {
        self.meter.record(UsageEvent {
            timestamp: Utc::now(),
            api_key: req.api_key.clone().unwrap_or_default(),
            key_name: String::new(),
            tool: req.tool.clone(),
            credits_charged: 0,
            allowed: false,
            deny_reason: Some(err.reason().to_string()),
        });
        self.audit.record(AuditEntry::new(
            "gate.deny",
            req.api_key.as_deref().map(mask_key).unwrap_or_default(),
            format!("tool={} reason={}", req.tool, err.reason()),
        ));
        self.webhook.emit(WebhookEvent::gate_deny(req, err));
        self.plugins.on_deny(req, err.reason()).await;
        info!(tool = %req.tool, reason = err.reason(), "gate deny");
    }

    /// Refund on backend failure. Best-effort and idempotent per call_id —
    /// callers must only invoke this once per `call_id`; the refund path
    /// itself does not deduplicate.
    pub async fn finalize(&self, req: &GateRequest, decision: &GateDecision, backend_failed: bool) {
        if !backend_failed || !self.refund_on_failure || decision.credits_charged == 0 {
            return;
        }
        let Some(key) = &req.api_key else { return };
        if self.store.refund_credits(key, decision.credits_charged).await.is_ok() {
            self.audit.record(AuditEntry::new(
                "credits.refund",
                mask_key(key),
                format!("tool={} refunded={}", req.tool, decision.credits_charged),
            ));
            self.webhook.emit(WebhookEvent::credits_refund(req, decision));
        }
    }
}

/// Matches `ip` against a list of exact IPs or CIDR blocks. Malformed
/// entries never match (fail closed, not open).
pub fn ip_allowed(allowlist: &[&str], ip: IpAddr) -> bool {
    allowlist.iter().any(|entry| {
        if let Ok(net) = entry.parse::<IpNet>() {
            net.contains(&ip)
        } else if let Ok(exact) = entry.parse::<IpAddr>() {
            exact == ip
        } else {
            false
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cidr_slash_zero_matches_all_ipv4() {
        let ip: IpAddr = "203.0.113.7".parse().unwrap();
        assert!(ip_allowed(&["0.0.0.0/0"], ip));
    }

    #[test]
    fn slash_32_matches_exactly_one_ip() {
        let ip: IpAddr = "203.0.113.7".parse().unwrap();
        let other: IpAddr = "203.0.113.8".parse().unwrap();
        assert!(ip_allowed(&["203.0.113.7/32"], ip));
        assert!(!ip_allowed(&["203.0.113.7/32"], other));
    }

    #[test]
    fn malformed_cidr_never_matches() {
        let ip: IpAddr = "203.0.113.7".parse().unwrap();
        assert!(!ip_allowed(&["not-an-ip/wat"], ip));
    }

    #[test]
    fn pricing_applies_per_kb_surcharge() {
        let mut table = PricingTable {
            default_credits_per_call: 1,
            per_kb_surcharge: 1,
            ..Default::default()
        };
        table.per_tool.insert("search".into(), 2);
        assert_eq!(table.price_for("search", 0), 2);
        assert_eq!(table.price_for("search", 2048), 4);
        assert_eq!(table.price_for("unknown", 0), 1);
    }
}
