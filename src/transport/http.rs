//! Streaming-HTTP backend transport. POSTs JSON-RPC bodies to a configured
//! URL; when the response is `text/event-stream`, the result is assembled
//! from SSE `message:` frames instead of a single JSON body.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use serde_json::{json, Value};

use super::{JsonRpcRequest, Transport, TransportError};

#[derive(Debug, Clone)]
pub struct HttpBackendConfig {
    pub name: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
}

pub struct HttpTransport {
    config: HttpBackendConfig,
    client: reqwest::Client,
    next_id: AtomicU64,
    running: AtomicBool,
}

impl HttpTransport {
    pub fn new(config: HttpBackendConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            next_id: AtomicU64::new(1),
            running: AtomicBool::new(false),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn read_sse(&self, response: reqwest::Response) -> Result<Value, TransportError> {
        let mut stream = response.bytes_stream().eventsource();
        while let Some(event) = stream.next().await {
            let event = event.map_err(|e| TransportError::Io(e.to_string()))?;
            if event.data.is_empty() {
                continue;
            }
            let value: Value = serde_json::from_str(&event.data)
                .map_err(|e| TransportError::Io(e.to_string()))?;
            if let Some(err) = value.get("error") {
                return Err(TransportError::BackendError(err.to_string()));
            }
            if value.get("result").is_some() || value.get("id").is_some() {
                return Ok(value.get("result").cloned().unwrap_or(Value::Null));
            }
        }
        Err(TransportError::BackendCrashed)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn start(&self) -> Result<(), TransportError> {
        // Nothing to keep alive beyond the pooled reqwest::Client; a
        // lightweight health probe confirms the endpoint is reachable.
        let resp = self
            .client
            .post(&self.config.url)
            .json(&json!({
                "jsonrpc": "2.0",
                "id": 0,
                "method": "initialize",
                "params": {
                    "protocolVersion": "2024-11-05",
                    "capabilities": {},
                    "clientInfo": { "name": "paygate", "version": env!("CARGO_PKG_VERSION") }
                }
            }))
            .send()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(TransportError::Io(format!(
                "backend '{}' initialize returned {}",
                self.config.name,
                resp.status()
            )));
        }
        self.running.store(true, Ordering::Release);
        Ok(())
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    async fn call(&self, req: JsonRpcRequest, timeout: Duration) -> Result<Value, TransportError> {
        if !self.running.load(Ordering::Acquire) {
            return Err(TransportError::NotRunning);
        }
        let id = self.next_id();
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": req.method,
            "params": req.params,
        });

        let mut builder = self.client.post(&self.config.url).json(&body);
        for (k, v) in &self.config.headers {
            builder = builder.header(k, v);
        }

        let fut = builder.send();
        let response = tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::Io(e.to_string()))?;

        let is_sse = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));

        if is_sse {
            return tokio::time::timeout(timeout, self.read_sse(response))
                .await
                .map_err(|_| TransportError::Timeout)?;
        }

        let value: Value = response
            .json()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        if let Some(err) = value.get("error") {
            return Err(TransportError::BackendError(err.to_string()));
        }
        Ok(value.get("result").cloned().unwrap_or(Value::Null))
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}
