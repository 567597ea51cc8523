//! Public discovery endpoints: tool pricing, the `mcp-payment` well-known
//! document, and a minimal OAuth 2.1 / RFC 8414 metadata stub. None of
//! these require a key — they describe the gateway, they don't act on it.

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::AppState;

pub async fn pricing(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "defaultCreditsPerCall": state.gate.pricing.default_credits_per_call,
        "perKbSurcharge": state.gate.pricing.per_kb_surcharge,
        "tools": state.gate.pricing.per_tool,
    }))
}

/// Minimal machine-readable payment-discovery document. Full schema is an
/// external concern (the payment-discovery spec); this crate's obligation
/// is to advertise pricing and the accepted auth scheme.
pub async fn well_known(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "version": "1",
        "auth": { "type": "api_key", "headers": ["x-api-key", "authorization"] },
        "pricing": {
            "defaultCreditsPerCall": state.gate.pricing.default_credits_per_call,
            "tools": state.gate.pricing.per_tool,
        },
    }))
}

/// RFC 8414 authorization-server metadata document. PayGate does not
/// implement the full OAuth 2.1 authorization-code flow (out of scope —
/// see `SPEC_FULL.md` §1); this handler satisfies discovery for clients
/// that probe it before falling back to API-key auth.
pub async fn oauth_metadata(State(state): State<AppState>) -> Json<Value> {
    let issuer = format!("http://localhost:{}", state.config.port);
    Json(json!({
        "issuer": issuer,
        "token_endpoint_auth_methods_supported": ["none"],
        "response_types_supported": Vec::<String>::new(),
        "grant_types_supported": Vec::<String>::new(),
        "scopes_supported": Vec::<String>::new(),
    }))
}
