//! Admin HTTP surface: key lifecycle, top-up, limits, and usage/audit
//! export. Every handler here requires `X-Admin-Key` — no endpoint in this
//! module accepts an API key in its place.

use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;

use crate::audit::AuditEntry;
use crate::error::AppError;
use crate::keystore::{KeyRecord, NewKeyOpts, Quota};
use crate::meter::UsageQuery;
use crate::webhook::WebhookEvent;
use crate::AppState;

use super::require_admin;

fn admin_headers_ok(headers: &axum::http::HeaderMap, state: &AppState) -> Result<(), AppError> {
    require_admin(headers, &state.config.admin_key)
}

/// Key material is only ever rendered in full on creation/import/rotation —
/// every other admin view exposes `masked` only.
#[derive(Serialize)]
struct KeyCreatedResponse {
    key: String,
    #[serde(flatten)]
    record: KeyView,
}

#[derive(Serialize)]
struct KeyView {
    name: String,
    masked: String,
    #[serde(rename = "createdAt")]
    created_at: DateTime<Utc>,
    #[serde(rename = "lastUsedAt")]
    last_used_at: Option<DateTime<Utc>>,
    credits: i64,
    #[serde(rename = "totalSpent")]
    total_spent: i64,
    #[serde(rename = "totalCalls")]
    total_calls: u64,
    active: bool,
    suspended: bool,
    #[serde(rename = "expiresAt")]
    expires_at: Option<DateTime<Utc>>,
    #[serde(rename = "allowedTools")]
    allowed_tools: Option<Vec<String>>,
    #[serde(rename = "deniedTools")]
    denied_tools: Option<Vec<String>>,
    #[serde(rename = "ipAllowlist")]
    ip_allowlist: Option<Vec<String>>,
    tags: HashMap<String, String>,
    #[serde(rename = "spendingLimit")]
    spending_limit: Option<i64>,
    quota: Option<Quota>,
    #[serde(rename = "rateLimitPerMinute")]
    rate_limit_per_minute: Option<u32>,
    #[serde(rename = "toolRateLimits")]
    tool_rate_limits: HashMap<String, u32>,
}

impl From<&KeyRecord> for KeyView {
    fn from(r: &KeyRecord) -> Self {
        Self {
            name: r.name.clone(),
            masked: r.masked(),
            created_at: r.created_at,
            last_used_at: r.last_used_at,
            credits: r.credits,
            total_spent: r.total_spent,
            total_calls: r.total_calls,
            active: r.active,
            suspended: r.suspended,
            expires_at: r.expires_at,
            allowed_tools: r.allowed_tools.clone(),
            denied_tools: r.denied_tools.clone(),
            ip_allowlist: r.ip_allowlist.clone(),
            tags: r.tags.clone(),
            spending_limit: r.spending_limit,
            quota: r.quota.clone(),
            rate_limit_per_minute: r.rate_limit_per_minute,
            tool_rate_limits: r.tool_rate_limits.clone(),
        }
    }
}

#[derive(Deserialize)]
pub struct CreateKeyRequest {
    name: String,
    #[serde(default)]
    credits: i64,
    #[serde(default, rename = "allowedTools")]
    allowed_tools: Option<Vec<String>>,
    #[serde(default, rename = "deniedTools")]
    denied_tools: Option<Vec<String>>,
    #[serde(default, rename = "expiresAt")]
    expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    quota: Option<Quota>,
    #[serde(default)]
    tags: HashMap<String, String>,
    #[serde(default, rename = "ipAllowlist")]
    ip_allowlist: Option<Vec<String>>,
    /// Admin-chosen key value, for migrating an existing secret in. When
    /// absent a fresh `pg_`-prefixed key is generated.
    #[serde(default)]
    import_key: Option<String>,
}

pub async fn create_key(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
    Json(req): Json<CreateKeyRequest>,
) -> Result<Json<Value>, AppError> {
    admin_headers_ok(&headers, &state)?;

    let record = if let Some(key) = req.import_key {
        state
            .keystore
            .import_key(key, req.name, req.credits)
            .await?
    } else {
        state
            .keystore
            .create_key(
                req.name,
                req.credits,
                NewKeyOpts {
                    allowed_tools: req.allowed_tools,
                    denied_tools: req.denied_tools,
                    expires_at: req.expires_at,
                    quota: req.quota,
                    tags: req.tags,
                    ip_allowlist: req.ip_allowlist,
                },
            )
            .await?
    };

    state.audit.record(AuditEntry::new(
        "key.created",
        "admin",
        format!("key={} name={}", record.masked(), record.name),
    ));
    state
        .webhook
        .emit(WebhookEvent::key_lifecycle("key.created", &record.masked(), json!({"name": record.name})));

    Ok(Json(json!(KeyCreatedResponse {
        key: record.key.clone(),
        record: KeyView::from(&record),
    })))
}

pub async fn list_keys(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> Result<Json<Value>, AppError> {
    admin_headers_ok(&headers, &state)?;
    let keys = state.keystore.list_keys().await;
    let views: Vec<KeyView> = keys.iter().map(KeyView::from).collect();
    Ok(Json(json!({ "keys": views })))
}

#[derive(Deserialize)]
pub struct SearchKeysRequest {
    #[serde(default)]
    tag_key: Option<String>,
    #[serde(default)]
    tag_value: Option<String>,
}

pub async fn search_keys(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
    Json(req): Json<SearchKeysRequest>,
) -> Result<Json<Value>, AppError> {
    admin_headers_ok(&headers, &state)?;
    let keys = match (req.tag_key, req.tag_value) {
        (Some(k), Some(v)) => state.keystore.list_keys_by_tag(&k, &v).await,
        _ => state.keystore.list_keys().await,
    };
    let views: Vec<KeyView> = keys.iter().map(KeyView::from).collect();
    Ok(Json(json!({ "keys": views })))
}

#[derive(Deserialize)]
pub struct KeyOnlyRequest {
    key: String,
}

pub async fn revoke_key(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
    Json(req): Json<KeyOnlyRequest>,
) -> Result<Json<Value>, AppError> {
    admin_headers_ok(&headers, &state)?;
    let record = state.keystore.revoke_key(&req.key).await?;
    state
        .audit
        .record(AuditEntry::new("key.revoked", "admin", record.masked()));
    state
        .webhook
        .emit(WebhookEvent::key_lifecycle("key.revoked", &record.masked(), Value::Null));
    Ok(Json(json!(KeyView::from(&record))))
}

pub async fn rotate_key(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
    Json(req): Json<KeyOnlyRequest>,
) -> Result<Json<Value>, AppError> {
    admin_headers_ok(&headers, &state)?;
    let record = state.keystore.rotate_key(&req.key).await?;
    state.audit.record(AuditEntry::new(
        "key.rotated",
        "admin",
        format!("new={}", record.masked()),
    ));
    state
        .webhook
        .emit(WebhookEvent::key_lifecycle("key.rotated", &record.masked(), Value::Null));
    Ok(Json(json!(KeyCreatedResponse {
        key: record.key.clone(),
        record: KeyView::from(&record),
    })))
}

#[derive(Deserialize)]
pub struct SetAclRequest {
    key: String,
    #[serde(default, rename = "allowedTools")]
    allowed_tools: Option<Vec<String>>,
    #[serde(default, rename = "deniedTools")]
    denied_tools: Option<Vec<String>>,
}

pub async fn set_acl(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
    Json(req): Json<SetAclRequest>,
) -> Result<Json<Value>, AppError> {
    admin_headers_ok(&headers, &state)?;
    let record = state
        .keystore
        .set_acl(&req.key, req.allowed_tools, req.denied_tools)
        .await?;
    state
        .audit
        .record(AuditEntry::new("key.acl_updated", "admin", record.masked()));
    Ok(Json(json!(KeyView::from(&record))))
}

#[derive(Deserialize)]
pub struct SetExpiryRequest {
    key: String,
    #[serde(default, rename = "expiresAt")]
    expires_at: Option<DateTime<Utc>>,
}

pub async fn set_expiry(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
    Json(req): Json<SetExpiryRequest>,
) -> Result<Json<Value>, AppError> {
    admin_headers_ok(&headers, &state)?;
    let record = state.keystore.set_expiry(&req.key, req.expires_at).await?;
    state
        .audit
        .record(AuditEntry::new("key.expiry_updated", "admin", record.masked()));
    Ok(Json(json!(KeyView::from(&record))))
}

#[derive(Deserialize)]
pub struct SetQuotaRequest {
    key: String,
    #[serde(default)]
    quota: Option<Quota>,
}

pub async fn set_quota(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
    Json(req): Json<SetQuotaRequest>,
) -> Result<Json<Value>, AppError> {
    admin_headers_ok(&headers, &state)?;
    let record = state.keystore.set_quota(&req.key, req.quota).await?;
    state
        .audit
        .record(AuditEntry::new("key.quota_updated", "admin", record.masked()));
    Ok(Json(json!(KeyView::from(&record))))
}

#[derive(Deserialize)]
pub struct SetTagsRequest {
    key: String,
    #[serde(default)]
    tags: HashMap<String, String>,
}

pub async fn set_tags(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
    Json(req): Json<SetTagsRequest>,
) -> Result<Json<Value>, AppError> {
    admin_headers_ok(&headers, &state)?;
    let record = state.keystore.set_tags(&req.key, req.tags).await?;
    state
        .audit
        .record(AuditEntry::new("key.tags_updated", "admin", record.masked()));
    Ok(Json(json!(KeyView::from(&record))))
}

#[derive(Deserialize)]
pub struct SetIpRequest {
    key: String,
    #[serde(default, rename = "ipAllowlist")]
    ip_allowlist: Option<Vec<String>>,
}

pub async fn set_ip_allowlist(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
    Json(req): Json<SetIpRequest>,
) -> Result<Json<Value>, AppError> {
    admin_headers_ok(&headers, &state)?;
    let record = state
        .keystore
        .set_ip_allowlist(&req.key, req.ip_allowlist)
        .await?;
    state
        .audit
        .record(AuditEntry::new("key.ip_allowlist_updated", "admin", record.masked()));
    Ok(Json(json!(KeyView::from(&record))))
}

#[derive(Deserialize)]
pub struct TopupRequest {
    key: String,
    amount: i64,
}

pub async fn topup(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
    Json(req): Json<TopupRequest>,
) -> Result<Json<Value>, AppError> {
    admin_headers_ok(&headers, &state)?;
    let record = state.keystore.add_credits(&req.key, req.amount).await?;
    state.audit.record(AuditEntry::new(
        "credits.topup",
        "admin",
        format!("key={} amount={}", record.masked(), req.amount),
    ));
    state.webhook.emit(WebhookEvent::key_lifecycle(
        "credits.topup",
        &record.masked(),
        json!({ "amount": req.amount }),
    ));
    Ok(Json(json!(KeyView::from(&record))))
}

#[derive(Deserialize)]
pub struct SetLimitsRequest {
    key: String,
    #[serde(default, rename = "spendingLimit")]
    spending_limit: Option<i64>,
}

pub async fn set_limits(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
    Json(req): Json<SetLimitsRequest>,
) -> Result<Json<Value>, AppError> {
    admin_headers_ok(&headers, &state)?;
    let record = state
        .keystore
        .set_spending_limit(&req.key, req.spending_limit)
        .await?;
    state
        .audit
        .record(AuditEntry::new("key.spending_limit_updated", "admin", record.masked()));
    Ok(Json(json!(KeyView::from(&record))))
}

#[derive(Deserialize)]
pub struct SetRateLimitRequest {
    key: String,
    #[serde(default, rename = "rateLimitPerMinute")]
    rate_limit_per_minute: Option<u32>,
    #[serde(default, rename = "toolRateLimits")]
    tool_rate_limits: HashMap<String, u32>,
}

pub async fn set_rate_limit(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
    Json(req): Json<SetRateLimitRequest>,
) -> Result<Json<Value>, AppError> {
    admin_headers_ok(&headers, &state)?;
    let record = state
        .keystore
        .set_rate_limit(&req.key, req.rate_limit_per_minute, req.tool_rate_limits)
        .await?;
    state
        .audit
        .record(AuditEntry::new("key.rate_limit_updated", "admin", record.masked()));
    Ok(Json(json!(KeyView::from(&record))))
}

#[derive(Deserialize)]
pub struct ExportParams {
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
    allowed: Option<bool>,
    limit: Option<usize>,
    offset: Option<usize>,
    #[serde(default)]
    format: Option<String>,
}

impl ExportParams {
    fn query(&self) -> UsageQuery {
        UsageQuery {
            since: self.since,
            until: self.until,
            allowed: self.allowed,
            limit: self.limit,
            offset: self.offset.unwrap_or(0),
        }
    }
}

pub async fn usage(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
    Query(params): Query<ExportParams>,
) -> Result<axum::response::Response, AppError> {
    admin_headers_ok(&headers, &state)?;
    let q = params.query();
    match params.format.as_deref() {
        Some("csv") => {
            let csv = state
                .meter
                .export_csv(&q)
                .map_err(AppError::Internal)?;
            Ok((
                [(axum::http::header::CONTENT_TYPE, "text/csv")],
                csv,
            )
                .into_response())
        }
        _ => {
            let json = state.meter.export_json(&q);
            Ok((
                [(axum::http::header::CONTENT_TYPE, "application/json")],
                json,
            )
                .into_response())
        }
    }
}

pub async fn audit(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
    Query(params): Query<ExportParams>,
) -> Result<Json<Value>, AppError> {
    admin_headers_ok(&headers, &state)?;
    let entries = state.audit.query(&params.query());
    Ok(Json(json!({ "entries": entries })))
}

pub async fn audit_export(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
    Query(params): Query<ExportParams>,
) -> Result<axum::response::Response, AppError> {
    admin_headers_ok(&headers, &state)?;
    let q = params.query();
    match params.format.as_deref() {
        Some("csv") => {
            let csv = state.audit.export_csv(&q).map_err(AppError::Internal)?;
            Ok((
                [(axum::http::header::CONTENT_TYPE, "text/csv")],
                csv,
            )
                .into_response())
        }
        _ => {
            let json = state.audit.export_json(&q);
            Ok((
                [(axum::http::header::CONTENT_TYPE, "application/json")],
                json,
            )
                .into_response())
        }
    }
}

pub async fn audit_stats(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
    Query(params): Query<ExportParams>,
) -> Result<Json<Value>, AppError> {
    admin_headers_ok(&headers, &state)?;
    let entries = state.audit.query(&params.query());
    let mut by_type: HashMap<String, u64> = HashMap::new();
    for e in &entries {
        *by_type.entry(e.kind.clone()).or_insert(0) += 1;
    }
    Ok(Json(json!({
        "total": entries.len(),
        "byType": by_type,
    })))
}
