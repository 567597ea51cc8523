//! HTTP boundary: terminates requests, extracts API/admin keys, dispatches
//! to the gate and router, and renders CORS + request-size limits the same
//! way across every route.

mod admin;
mod health;
mod mcp;
mod pricing;
mod stripe;

use std::net::{IpAddr, SocketAddr};

use axum::extract::{ConnectInfo, Request};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router as AxumRouter;
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::error::AppError;
use crate::AppState;

pub const MCP_SESSION_HEADER: &str = "mcp-session-id";
pub const RATE_LIMIT_LIMIT_HEADER: &str = "x-ratelimit-limit";
pub const RATE_LIMIT_REMAINING_HEADER: &str = "x-ratelimit-remaining";
pub const RATE_LIMIT_RESET_HEADER: &str = "x-ratelimit-reset";
pub const CREDITS_REMAINING_HEADER: &str = "x-credits-remaining";
pub const ADMIN_KEY_HEADER: &str = "x-admin-key";
pub const API_KEY_HEADER: &str = "x-api-key";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

pub fn build_router(state: AppState) -> AxumRouter {
    let max_body = state.config.max_body_bytes;

    let cors = match &state.config.cors_allowed_origins {
        Some(origins) => {
            let parsed: Vec<_> = origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(AllowOrigin::list(parsed))
                .vary([header::ORIGIN])
        }
        None => CorsLayer::permissive(),
    }
    .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
    .allow_headers([
        header::CONTENT_TYPE,
        header::AUTHORIZATION,
        header::HeaderName::from_static(API_KEY_HEADER),
        header::HeaderName::from_static(ADMIN_KEY_HEADER),
    ])
    .expose_headers([
        header::HeaderName::from_static(MCP_SESSION_HEADER),
        header::HeaderName::from_static(RATE_LIMIT_LIMIT_HEADER),
        header::HeaderName::from_static(RATE_LIMIT_REMAINING_HEADER),
        header::HeaderName::from_static(RATE_LIMIT_RESET_HEADER),
        header::HeaderName::from_static(CREDITS_REMAINING_HEADER),
    ]);

    AxumRouter::new()
        .route("/mcp", post(mcp::post_mcp).get(mcp::get_mcp).delete(mcp::delete_mcp))
        .route("/balance", get(mcp::balance))
        .route("/keys", post(admin::create_key).get(admin::list_keys))
        .route("/keys/revoke", post(admin::revoke_key))
        .route("/keys/rotate", post(admin::rotate_key))
        .route("/keys/acl", post(admin::set_acl))
        .route("/keys/expiry", post(admin::set_expiry))
        .route("/keys/quota", post(admin::set_quota))
        .route("/keys/tags", post(admin::set_tags))
        .route("/keys/ip", post(admin::set_ip_allowlist))
        .route("/keys/ratelimit", post(admin::set_rate_limit))
        .route("/keys/search", post(admin::search_keys))
        .route("/topup", post(admin::topup))
        .route("/limits", post(admin::set_limits))
        .route("/usage", get(admin::usage))
        .route("/audit", get(admin::audit))
        .route("/audit/export", get(admin::audit_export))
        .route("/audit/stats", get(admin::audit_stats))
        .route("/metrics", get(health::metrics))
        .route("/health", get(health::health))
        .route("/ready", get(health::ready))
        .route("/pricing", get(pricing::pricing))
        .route("/.well-known/mcp-payment", get(pricing::well_known))
        .route("/stripe/webhook", post(stripe::webhook))
        .route(
            "/.well-known/oauth-authorization-server",
            get(pricing::oauth_metadata),
        )
        .layer(middleware::from_fn(move |req, next| {
            enforce_body_limit(req, next, max_body)
        }))
        .layer(cors)
        .with_state(state)
}

async fn enforce_body_limit(
    req: Request,
    next: Next,
    max_body: usize,
) -> Result<Response, AppError> {
    if let Some(len) = req
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok())
    {
        if len > max_body {
            return Err(AppError::PayloadTooLarge);
        }
    }
    Ok(next.run(req).await)
}

/// Extracts the API key from `X-API-Key` or `Authorization: Bearer`.
pub fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    if let Some(v) = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()) {
        return Some(v.to_string());
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|s| s.to_string())
}

pub fn require_admin(headers: &HeaderMap, expected: &str) -> Result<(), AppError> {
    let provided = headers
        .get(ADMIN_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if provided.is_empty() || provided != expected {
        return Err(AppError::Unauthorized);
    }
    Ok(())
}

pub fn client_ip(headers: &HeaderMap, connect_info: Option<ConnectInfo<SocketAddr>>) -> Option<IpAddr> {
    if let Some(v) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = v.split(',').next() {
            if let Ok(ip) = first.trim().parse() {
                return Some(ip);
            }
        }
    }
    connect_info.map(|ConnectInfo(addr)| addr.ip())
}

pub fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}
