//! Multi-backend prefix-routing scenario: two backends behind one gateway,
//! `tools/list` merges both namespaces and `tools/call` forwards to the
//! correct backend with the prefix stripped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use paygate::router::{Backend, Router};
use paygate::transport::{JsonRpcRequest, Transport, TransportError};
use serde_json::{json, Value};

struct RecordingTransport {
    name: &'static str,
    running: AtomicBool,
    tools: Value,
    last_call: std::sync::Mutex<Option<Value>>,
}

impl RecordingTransport {
    fn new(name: &'static str, tools: Value) -> Self {
        Self {
            name,
            running: AtomicBool::new(false),
            tools,
            last_call: std::sync::Mutex::new(None),
        }
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn start(&self) -> Result<(), TransportError> {
        self.running.store(true, Ordering::Release);
        Ok(())
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    async fn call(&self, req: JsonRpcRequest, _timeout: Duration) -> Result<Value, TransportError> {
        if req.method == "tools/list" {
            return Ok(json!({ "tools": self.tools }));
        }
        *self.last_call.lock().unwrap() = Some(req.params.clone());
        Ok(json!({ "backend": self.name, "forwarded": req.params }))
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

#[tokio::test]
async fn multi_backend_prefix_routing() {
    let fs_transport = Arc::new(RecordingTransport::new(
        "fs",
        json!([{"name": "read_file"}]),
    ));
    let gh_transport = Arc::new(RecordingTransport::new(
        "gh",
        json!([{"name": "search_repos"}]),
    ));

    let router = Router::new(
        vec![
            Backend {
                prefix: "fs".into(),
                transport: fs_transport.clone(),
            },
            Backend {
                prefix: "gh".into(),
                transport: gh_transport.clone(),
            },
        ],
        Duration::from_secs(5),
    );

    let tools = router.list_tools().await;
    let names: Vec<&str> = tools
        .iter()
        .filter_map(|t| t.get("name").and_then(|n| n.as_str()))
        .collect();
    assert!(names.contains(&"fs:read_file"));
    assert!(names.contains(&"gh:search_repos"));

    let result = router
        .call_tool("fs:read_file", json!({"path": "/tmp/x"}))
        .await
        .unwrap();
    assert_eq!(result.get("backend").and_then(|v| v.as_str()), Some("fs"));

    let forwarded = fs_transport.last_call.lock().unwrap().clone().unwrap();
    assert_eq!(forwarded.get("name").and_then(|v| v.as_str()), Some("read_file"));
    assert!(gh_transport.last_call.lock().unwrap().is_none());
}

#[tokio::test]
async fn single_backend_mode_passes_tool_name_through_unprefixed() {
    let transport = Arc::new(RecordingTransport::new("only", json!([])));
    let router = Router::new(
        vec![Backend {
            prefix: "only".into(),
            transport: transport.clone(),
        }],
        Duration::from_secs(5),
    );

    router.call_tool("echo", json!({})).await.unwrap();
    let forwarded = transport.last_call.lock().unwrap().clone().unwrap();
    assert_eq!(forwarded.get("name").and_then(|v| v.as_str()), Some("echo"));
}

#[tokio::test]
async fn call_to_unknown_prefix_is_rejected() {
    let a = Arc::new(RecordingTransport::new("a", json!([])));
    let b = Arc::new(RecordingTransport::new("b", json!([])));
    let router = Router::new(
        vec![
            Backend {
                prefix: "a".into(),
                transport: a,
            },
            Backend {
                prefix: "b".into(),
                transport: b,
            },
        ],
        Duration::from_secs(5),
    );

    let err = router.call_tool("c:tool", json!({})).await.unwrap_err();
    assert!(matches!(err, TransportError::UnknownPrefix(_)));
}
