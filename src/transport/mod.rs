//! Backend transports — each owns exactly one backend MCP server, either a
//! stdio child process or a streaming HTTP endpoint, and the map of
//! in-flight requests it has outstanding against it.

pub mod http;
pub mod stdio;

use std::time::Duration;

use async_trait::async_trait;
use axum::http::StatusCode;
use serde_json::Value;
use thiserror::Error;

pub use http::HttpTransport;
pub use stdio::StdioTransport;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("backend timed out")]
    Timeout,
    #[error("backend crashed")]
    BackendCrashed,
    #[error("backend returned an error: {0}")]
    BackendError(String),
    #[error("backend io error: {0}")]
    Io(String),
    #[error("backend not running")]
    NotRunning,
    #[error("unknown backend prefix: {0}")]
    UnknownPrefix(String),
}

impl TransportError {
    pub fn status(&self) -> StatusCode {
        match self {
            TransportError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            TransportError::BackendCrashed | TransportError::NotRunning => {
                StatusCode::BAD_GATEWAY
            }
            TransportError::BackendError(_) => StatusCode::BAD_GATEWAY,
            TransportError::Io(_) => StatusCode::BAD_GATEWAY,
            TransportError::UnknownPrefix(_) => StatusCode::NOT_FOUND,
        }
    }
}

/// One outbound JSON-RPC call to a backend. `id` is assigned by the
/// transport, not the caller, so concurrent callers never collide.
#[derive(Debug, Clone)]
pub struct JsonRpcRequest {
    pub method: String,
    pub params: Value,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn start(&self) -> Result<(), TransportError>;
    async fn stop(&self);
    async fn call(&self, req: JsonRpcRequest, timeout: Duration) -> Result<Value, TransportError>;
    fn is_running(&self) -> bool;
}
