//! Stdio subprocess transport. Spawns the backend as a child process and
//! speaks line-delimited JSON-RPC over its stdin/stdout. Unlike a client
//! that only ever has one request in flight, this transport allows many
//! concurrent callers by correlating responses through a waiter map keyed
//! on the JSON-RPC request ID.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, error, warn};

use super::{JsonRpcRequest, Transport, TransportError};

#[derive(Debug, Clone)]
pub struct StdioBackendConfig {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

struct Waiters {
    map: DashMap<u64, oneshot::Sender<Result<Value, TransportError>>>,
}

struct RunningProcess {
    _child: Child,
    stdin: Mutex<ChildStdin>,
}

pub struct StdioTransport {
    config: StdioBackendConfig,
    next_id: AtomicU64,
    waiters: Arc<Waiters>,
    process: Mutex<Option<RunningProcess>>,
    running: AtomicBool,
}

impl StdioTransport {
    pub fn new(config: StdioBackendConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            next_id: AtomicU64::new(1),
            waiters: Arc::new(Waiters {
                map: DashMap::new(),
            }),
            process: Mutex::new(None),
            running: AtomicBool::new(false),
        })
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn write_line(stdin: &Mutex<ChildStdin>, value: &Value) -> Result<(), TransportError> {
        let mut line = serde_json::to_string(value).map_err(|e| TransportError::Io(e.to_string()))?;
        line.push('\n');
        let mut stdin = stdin.lock().await;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        stdin.flush().await.map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn initialize(&self, stdin: &Mutex<ChildStdin>) -> Result<(), TransportError> {
        let id = self.next_id();
        let req = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "initialize",
            "params": {
                "protocolVersion": "2024-11-05",
                "capabilities": {},
                "clientInfo": { "name": "paygate", "version": env!("CARGO_PKG_VERSION") }
            }
        });
        let (tx, rx) = oneshot::channel();
        self.waiters.map.insert(id, tx);
        Self::write_line(stdin, &req).await?;
        rx.await.map_err(|_| TransportError::BackendCrashed)??;

        let notif = json!({ "jsonrpc": "2.0", "method": "initialized", "params": {} });
        Self::write_line(stdin, &notif).await
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn start(&self) -> Result<(), TransportError> {
        let mut cmd = tokio::process::Command::new(&self.config.command);
        cmd.args(&self.config.args);
        for (k, v) in &self.config.env {
            cmd.env(k, v);
        }
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::null());

        let mut child = cmd
            .spawn()
            .map_err(|e| TransportError::Io(format!("spawn '{}': {e}", self.config.name)))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Io("stdin not available".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Io("stdout not available".into()))?;

        let stdin = Mutex::new(stdin);
        self.initialize(&stdin).await?;

        let waiters = self.waiters.clone();
        let name = self.config.name.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout);
            loop {
                let mut line = String::new();
                match reader.read_line(&mut line).await {
                    Ok(0) => {
                        warn!(backend = %name, "stdout closed — backend exited");
                        break;
                    }
                    Ok(_) => {
                        let Ok(value) = serde_json::from_str::<Value>(line.trim()) else {
                            warn!(backend = %name, line = %line.trim(), "malformed backend response — dropped");
                            continue;
                        };
                        let Some(id) = value.get("id").and_then(|v| v.as_u64()) else {
                            continue; // notification, not a response
                        };
                        if let Some((_, tx)) = waiters.map.remove(&id) {
                            let result = if let Some(err) = value.get("error") {
                                Err(TransportError::BackendError(err.to_string()))
                            } else {
                                Ok(value.get("result").cloned().unwrap_or(Value::Null))
                            };
                            let _ = tx.send(result);
                        }
                    }
                    Err(e) => {
                        error!(backend = %name, err = %e, "error reading backend stdout");
                        break;
                    }
                }
            }
            // Fail every outstanding waiter so no caller blocks forever.
            let ids: Vec<u64> = waiters.map.iter().map(|e| *e.key()).collect();
            for id in ids {
                if let Some((_, tx)) = waiters.map.remove(&id) {
                    let _ = tx.send(Err(TransportError::BackendCrashed));
                }
            }
        });

        *self.process.lock().await = Some(RunningProcess {
            _child: child,
            stdin,
        });
        self.running.store(true, Ordering::Release);
        Ok(())
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::Release);
        let mut guard = self.process.lock().await;
        if let Some(mut proc) = guard.take() {
            #[cfg(unix)]
            {
                if let Some(pid) = proc._child.id() {
                    unsafe {
                        libc::kill(pid as libc::pid_t, libc::SIGTERM);
                    }
                    let _ = tokio::time::timeout(
                        Duration::from_secs(5),
                        proc._child.wait(),
                    )
                    .await;
                    if let Ok(Some(_)) = proc._child.try_wait() {
                        return;
                    }
                    unsafe {
                        libc::kill(pid as libc::pid_t, libc::SIGKILL);
                    }
                }
            }
            let _ = proc._child.kill().await;
        }
    }

    async fn call(&self, req: JsonRpcRequest, timeout: Duration) -> Result<Value, TransportError> {
        if !self.running.load(Ordering::Acquire) {
            return Err(TransportError::NotRunning);
        }
        let guard = self.process.lock().await;
        let Some(proc) = guard.as_ref() else {
            return Err(TransportError::NotRunning);
        };

        let id = self.next_id();
        let payload = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": req.method,
            "params": req.params,
        });
        let (tx, rx) = oneshot::channel();
        self.waiters.map.insert(id, tx);
        if let Err(e) = Self::write_line(&proc.stdin, &payload).await {
            self.waiters.map.remove(&id);
            return Err(e);
        }
        drop(guard);

        debug!(backend = %self.config.name, method = %req.method, id, "dispatched backend call");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::BackendCrashed),
            Err(_) => {
                self.waiters.map.remove(&id);
                Err(TransportError::Timeout)
            }
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}
