//! The `/mcp` and `/balance` routes: the billed JSON-RPC surface. Every
//! `tools/call` here runs through the Gate before anything is forwarded to
//! a backend; `tools/list` and `initialize` are unbilled protocol plumbing.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::stream::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_stream::StreamExt as _;
use uuid::Uuid;

use crate::error::AppError;
use crate::gate::{GateDecision, GateRequest};
use crate::transport::TransportError;
use crate::AppState;

use super::{
    client_ip, extract_api_key, CREDITS_REMAINING_HEADER, MCP_SESSION_HEADER,
    RATE_LIMIT_LIMIT_HEADER, RATE_LIMIT_REMAINING_HEADER, RATE_LIMIT_RESET_HEADER,
    REQUEST_ID_HEADER,
};

#[derive(Debug, Deserialize)]
pub struct JsonRpcEnvelope {
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

fn jsonrpc_error(id: &Value, code: i64, message: &str, data: Option<Value>) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message, "data": data },
    })
}

fn jsonrpc_result(id: &Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn wants_sse(headers: &HeaderMap) -> bool {
    headers
        .get(axum::http::header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("text/event-stream"))
}

/// Renders a single JSON-RPC message as either a plain JSON body or a
/// one-shot `text/event-stream` frame, per the client's `Accept` header —
/// the two response shapes `POST /mcp` promises callers.
fn render(body: &Value, headers: &HeaderMap, session_id: &str) -> Response {
    let mut resp = if wants_sse(headers) {
        let mut r = format!("event: message\ndata: {body}\n\n").into_response();
        r.headers_mut().insert(
            axum::http::header::CONTENT_TYPE,
            HeaderValue::from_static("text/event-stream"),
        );
        r
    } else {
        Json(body.clone()).into_response()
    };
    resp.headers_mut().insert(
        MCP_SESSION_HEADER,
        HeaderValue::from_str(session_id).unwrap(),
    );
    // Every response off this route carries a correlation id, win or lose —
    // the error path gets its own via `AppError`, but responses rendered
    // here never go through that type.
    resp.headers_mut().insert(
        axum::http::header::HeaderName::from_static(REQUEST_ID_HEADER),
        HeaderValue::from_str(&Uuid::new_v4().to_string()).unwrap(),
    );
    resp
}

pub async fn post_mcp(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<std::net::SocketAddr>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<Response, AppError> {
    let envelope: JsonRpcEnvelope = serde_json::from_slice(&body)
        .map_err(|e| AppError::BadRequest(format!("parse_error: {e}")))?;

    let api_key = extract_api_key(&headers);
    let client_ip = client_ip(&headers, Some(ConnectInfo(addr)));

    let session_id = headers
        .get(MCP_SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let session_id = match session_id {
        Some(id) if state.sessions.exists(&id) => {
            state.sessions.touch(&id);
            id
        }
        Some(id) => id, // stale/unknown id from the client; accept but don't create a duplicate
        None => state
            .sessions
            .create(api_key.clone().unwrap_or_default()),
    };

    let body_value = match envelope.method.as_str() {
        "initialize" => jsonrpc_result(
            &envelope.id,
            json!({
                "protocolVersion": "2024-11-05",
                "capabilities": { "tools": {} },
                "serverInfo": { "name": "paygate", "version": env!("CARGO_PKG_VERSION") },
            }),
        ),
        "notifications/initialized" => {
            let mut resp = StatusCode::ACCEPTED.into_response();
            resp.headers_mut().insert(
                MCP_SESSION_HEADER,
                HeaderValue::from_str(&session_id).unwrap(),
            );
            return Ok(resp);
        }
        "tools/list" => {
            if let Some(key) = &api_key {
                state.keystore.get_key(key).await.map_err(|_| AppError::Unauthorized)?;
            } else {
                return Err(AppError::Unauthorized);
            }
            let tools = state.router.list_tools().await;
            jsonrpc_result(&envelope.id, json!({ "tools": tools }))
        }
        "tools/call" => {
            return handle_tools_call(&state, &envelope, api_key, client_ip, session_id, &headers, body.len()).await;
        }
        other => jsonrpc_error(
            &envelope.id,
            -32601,
            &format!("Method not found: {other}"),
            None,
        ),
    };

    Ok(render(&body_value, &headers, &session_id))
}

async fn handle_tools_call(
    state: &AppState,
    envelope: &JsonRpcEnvelope,
    api_key: Option<String>,
    client_ip: Option<std::net::IpAddr>,
    session_id: String,
    headers: &HeaderMap,
    input_bytes: usize,
) -> Result<Response, AppError> {
    let tool = envelope
        .params
        .get("name")
        .and_then(|v| v.as_str())
        .ok_or_else(|| AppError::BadRequest("tools/call requires params.name".into()))?
        .to_string();
    let args = envelope
        .params
        .get("arguments")
        .cloned()
        .unwrap_or(Value::Null);

    let req = GateRequest {
        call_id: Uuid::new_v4().to_string(),
        api_key,
        tool,
        args: args.clone(),
        client_ip,
        input_bytes,
    };

    let decision = match state.gate.evaluate(&req).await {
        Ok(d) => d,
        Err(err) => {
            let body = jsonrpc_error(
                &envelope.id,
                err.jsonrpc_code(),
                &err.to_string(),
                Some(json!({ "reason": err.reason() })),
            );
            let mut resp = render(&body, headers, &session_id);
            *resp.status_mut() = err.status();
            if let crate::gate::GateError::RateLimited { retry_after_secs }
            | crate::gate::GateError::RateLimitedTool { retry_after_secs } = err
            {
                resp.headers_mut().insert(
                    axum::http::header::RETRY_AFTER,
                    HeaderValue::from_str(&retry_after_secs.to_string()).unwrap(),
                );
            }
            return Ok(resp);
        }
    };

    let call_result = state.router.call_tool(&req.tool, args).await;
    let backend_failed = call_result.is_err();
    state.gate.finalize(&req, &decision, backend_failed).await;

    let backend_status = call_result.as_ref().err().map(|e| e.status());
    let body_value = match call_result {
        Ok(value) => jsonrpc_result(&envelope.id, value),
        Err(err) => jsonrpc_error(&envelope.id, backend_error_code(&err), &err.to_string(), None),
    };

    let mut resp = render(&body_value, headers, &session_id);
    if let Some(status) = backend_status {
        *resp.status_mut() = status;
    }
    apply_billing_headers(resp.headers_mut(), &decision, &session_id);
    Ok(resp)
}

fn backend_error_code(err: &TransportError) -> i64 {
    match err {
        // Matches the JSON-RPC taxonomy's "unknown prefix" case exactly:
        // -32601 Method not found.
        TransportError::UnknownPrefix(_) => -32601,
        TransportError::Timeout => -32000,
        _ => -32000,
    }
}

fn apply_billing_headers(headers: &mut HeaderMap, decision: &GateDecision, session_id: &str) {
    headers.insert(MCP_SESSION_HEADER, HeaderValue::from_str(session_id).unwrap());
    headers.insert(
        CREDITS_REMAINING_HEADER,
        HeaderValue::from_str(&decision.remaining.to_string()).unwrap(),
    );
    if decision.rate_limit_limit > 0 {
        headers.insert(
            RATE_LIMIT_LIMIT_HEADER,
            HeaderValue::from_str(&decision.rate_limit_limit.to_string()).unwrap(),
        );
        headers.insert(
            RATE_LIMIT_REMAINING_HEADER,
            HeaderValue::from_str(&decision.rate_limit_remaining.to_string()).unwrap(),
        );
        headers.insert(
            RATE_LIMIT_RESET_HEADER,
            HeaderValue::from_str(&(decision.rate_limit_reset_in_ms / 1000).to_string()).unwrap(),
        );
    }
}

/// GET /mcp — opens an SSE stream of server-to-client notifications for an
/// existing session. Sends a keepalive comment every 30s; the connection
/// drops (and its SSE slot releases) the instant the client disconnects.
pub async fn get_mcp(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let session_id = headers
        .get(MCP_SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::BadRequest("missing Mcp-Session-Id".into()))?
        .to_string();

    let (rx, guard) = state
        .sessions
        .subscribe(&session_id)
        .ok_or_else(|| AppError::NotFound("session".into()))?;

    let stream = tokio_stream::wrappers::BroadcastStream::new(rx)
        .filter_map(|msg| msg.ok())
        .map(|payload| Ok(Event::default().event("message").data(payload)));

    // The guard's Drop releases the session's SSE slot; keeping it alive for
    // the stream's lifetime by moving it into a wrapper that holds both.
    let stream = GuardedStream { stream, _guard: guard };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(30))
            .text("keepalive"),
    ))
}

/// Bundles a notification stream with the `SseGuard` that must outlive it,
/// so the slot releases exactly when the stream (and its connection) ends.
/// `BroadcastStream` is `Unpin`, so no pin-projection is needed here.
struct GuardedStream<S> {
    stream: S,
    _guard: crate::session::SseGuard,
}

impl<S: Stream + Unpin> Stream for GuardedStream<S> {
    type Item = S::Item;
    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        std::pin::Pin::new(&mut self.stream).poll_next(cx)
    }
}

pub async fn delete_mcp(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<StatusCode, AppError> {
    let session_id = headers
        .get(MCP_SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::BadRequest("missing Mcp-Session-Id".into()))?;
    if state.sessions.destroy(session_id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound("session".into()))
    }
}

pub async fn balance(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, AppError> {
    let key = extract_api_key(&headers).ok_or(AppError::Unauthorized)?;
    let record = state
        .keystore
        .get_key(&key)
        .await
        .map_err(|_| AppError::Unauthorized)?;
    Ok(Json(json!({
        "credits": record.credits,
        "totalSpent": record.total_spent,
        "totalCalls": record.total_calls,
    })))
}
