//! Routes JSON-RPC calls to the backend(s) behind the gateway. In
//! single-backend mode there's exactly one entry and no prefixing. In
//! multi-backend mode, tools are namespaced `prefix:tool`; `tools/list`
//! fans out to every backend concurrently and merges the results.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::warn;

use crate::transport::{JsonRpcRequest, Transport, TransportError};

pub struct Backend {
    pub prefix: String,
    pub transport: Arc<dyn Transport>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterState {
    Starting,
    Ready,
    Degraded,
}

pub struct Router {
    backends: Vec<Backend>,
    multi: bool,
    default_timeout: Duration,
}

impl Router {
    pub fn new(backends: Vec<Backend>, default_timeout: Duration) -> Self {
        let multi = backends.len() > 1;
        Self {
            backends,
            multi,
            default_timeout,
        }
    }

    /// Start every backend concurrently. Returns `Ready` only if all started;
    /// `Degraded` if at least one failed, naming which in the log.
    pub async fn ready(&self) -> RouterState {
        let results = futures_util::future::join_all(
            self.backends.iter().map(|b| async { (b.prefix.clone(), b.transport.start().await) }),
        )
        .await;

        let mut degraded = false;
        for (prefix, result) in results {
            if let Err(e) = result {
                warn!(backend = %prefix, err = %e, "backend failed to start — router degraded");
                degraded = true;
            }
        }
        if degraded {
            RouterState::Degraded
        } else {
            RouterState::Ready
        }
    }

    pub async fn stop_all(&self) {
        futures_util::future::join_all(self.backends.iter().map(|b| b.transport.stop())).await;
    }

    fn find_backend(&self, prefix: &str) -> Option<&Backend> {
        self.backends.iter().find(|b| b.prefix == prefix)
    }

    /// `tools/call` — in multi-backend mode the tool name must be
    /// `prefix:tool`; in single-backend mode the whole name is passed
    /// through untouched.
    pub async fn call_tool(&self, tool_name: &str, arguments: Value) -> Result<Value, TransportError> {
        let (backend, bare_tool) = if self.multi {
            match tool_name.split_once(':') {
                Some((prefix, rest)) => (
                    self.find_backend(prefix)
                        .ok_or_else(|| TransportError::UnknownPrefix(prefix.to_string()))?,
                    rest,
                ),
                None => {
                    return Err(TransportError::UnknownPrefix(tool_name.to_string()));
                }
            }
        } else {
            (
                self.backends.first().ok_or(TransportError::NotRunning)?,
                tool_name,
            )
        };

        backend
            .transport
            .call(
                JsonRpcRequest {
                    method: "tools/call".to_string(),
                    params: json!({ "name": bare_tool, "arguments": arguments }),
                },
                self.default_timeout,
            )
            .await
    }

    /// `tools/list` — fans out to every backend concurrently and merges,
    /// renaming each tool `prefix:name` in multi-backend mode.
    pub async fn list_tools(&self) -> Vec<Value> {
        let timeout = self.default_timeout;
        let results = futures_util::future::join_all(self.backends.iter().map(|b| async move {
            let result = b
                .transport
                .call(
                    JsonRpcRequest {
                        method: "tools/list".to_string(),
                        params: Value::Null,
                    },
                    timeout,
                )
                .await;
            (b.prefix.clone(), result)
        }))
        .await;

        let mut merged = Vec::new();
        for (prefix, result) in results {
            let tools = match result {
                Ok(v) => v.get("tools").and_then(|t| t.as_array()).cloned().unwrap_or_default(),
                Err(e) => {
                    warn!(backend = %prefix, err = %e, "tools/list failed for backend — omitted from merge");
                    continue;
                }
            };
            for mut tool in tools {
                if self.multi {
                    if let Some(name) = tool.get("name").and_then(|n| n.as_str()) {
                        let renamed = format!("{prefix}:{name}");
                        if let Some(obj) = tool.as_object_mut() {
                            obj.insert("name".to_string(), Value::String(renamed));
                        }
                    }
                }
                merged.push(tool);
            }
        }
        merged
    }

    pub fn is_multi(&self) -> bool {
        self.multi
    }

    pub fn backend_prefixes(&self) -> Vec<&str> {
        self.backends.iter().map(|b| b.prefix.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakeTransport {
        running: AtomicBool,
        tools: Value,
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn start(&self) -> Result<(), TransportError> {
            self.running.store(true, Ordering::Release);
            Ok(())
        }
        async fn stop(&self) {
            self.running.store(false, Ordering::Release);
        }
        async fn call(&self, req: JsonRpcRequest, _timeout: Duration) -> Result<Value, TransportError> {
            if req.method == "tools/list" {
                Ok(json!({ "tools": self.tools }))
            } else {
                Ok(json!({ "echo": req.params }))
            }
        }
        fn is_running(&self) -> bool {
            self.running.load(Ordering::Acquire)
        }
    }

    #[tokio::test]
    async fn merges_tool_lists_with_prefix() {
        let a = Backend {
            prefix: "a".into(),
            transport: Arc::new(FakeTransport {
                running: AtomicBool::new(true),
                tools: json!([{"name": "search"}]),
            }),
        };
        let b = Backend {
            prefix: "b".into(),
            transport: Arc::new(FakeTransport {
                running: AtomicBool::new(true),
                tools: json!([{"name": "fetch"}]),
            }),
        };
        let router = Router::new(vec![a, b], Duration::from_secs(5));
        let tools = router.list_tools().await;
        let names: Vec<&str> = tools.iter().filter_map(|t| t.get("name").and_then(|n| n.as_str())).collect();
        assert!(names.contains(&"a:search"));
        assert!(names.contains(&"b:fetch"));
    }

    #[tokio::test]
    async fn call_tool_routes_by_prefix() {
        let a = Backend {
            prefix: "a".into(),
            transport: Arc::new(FakeTransport {
                running: AtomicBool::new(true),
                tools: json!([]),
            }),
        };
        let b = Backend {
            prefix: "b".into(),
            transport: Arc::new(FakeTransport {
                running: AtomicBool::new(true),
                tools: json!([]),
            }),
        };
        let router = Router::new(vec![a, b], Duration::from_secs(5));
        let result = router.call_tool("b:fetch", json!({})).await.unwrap();
        assert!(result.get("echo").is_some());
    }
}
