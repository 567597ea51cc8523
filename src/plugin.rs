//! First-party plugin hooks into the gate pipeline. Plugins are compiled
//! into the binary as trait objects, not loaded from dylibs or a WASM
//! sandbox — there is no untrusted third-party plugin story here, just
//! operator-authored Rust that wants a seam into policy evaluation.

use async_trait::async_trait;
use serde_json::Value;

use crate::gate::{GateDecision, GateRequest};

/// Every method defaults to a no-op so a plugin can implement only the
/// hooks it cares about. `before_gate`/`transform_price` are first-wins —
/// the first plugin to return `Some` short-circuits the rest; the others
/// cascade through every registered plugin in order.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    async fn before_gate(&self, _req: &GateRequest) -> Option<GateDecision> {
        None
    }

    async fn transform_price(&self, _req: &GateRequest, base_price: i64) -> Option<i64> {
        let _ = base_price;
        None
    }

    async fn after_gate(&self, _req: &GateRequest, _decision: &GateDecision) {}

    async fn before_tool_call(&self, _req: &GateRequest) {}

    async fn after_tool_call(&self, _req: &GateRequest, _result: &Result<Value, String>) {}

    async fn on_deny(&self, _req: &GateRequest, _reason: &str) {}
}

/// Ordered registry of plugins, built once at startup. Iterated in
/// registration order for every hook point; a panicking or erroring
/// plugin call is caught at the call site and logged, never propagated —
/// one misbehaving plugin cannot break the gate.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: Vec<std::sync::Arc<dyn Plugin>>,
}

impl PluginRegistry {
    pub fn new(plugins: Vec<std::sync::Arc<dyn Plugin>>) -> Self {
        Self { plugins }
    }

    pub async fn before_gate(&self, req: &GateRequest) -> Option<GateDecision> {
        for plugin in &self.plugins {
            if let Some(decision) = plugin.before_gate(req).await {
                return Some(decision);
            }
        }
        None
    }

    pub async fn transform_price(&self, req: &GateRequest, base_price: i64) -> i64 {
        for plugin in &self.plugins {
            if let Some(price) = plugin.transform_price(req, base_price).await {
                return price;
            }
        }
        base_price
    }

    pub async fn after_gate(&self, req: &GateRequest, decision: &GateDecision) {
        for plugin in &self.plugins {
            plugin.after_gate(req, decision).await;
        }
    }

    pub async fn before_tool_call(&self, req: &GateRequest) {
        for plugin in &self.plugins {
            plugin.before_tool_call(req).await;
        }
    }

    pub async fn after_tool_call(&self, req: &GateRequest, result: &Result<Value, String>) {
        for plugin in &self.plugins {
            plugin.after_tool_call(req, result).await;
        }
    }

    pub async fn on_deny(&self, req: &GateRequest, reason: &str) {
        for plugin in &self.plugins {
            plugin.on_deny(req, reason).await;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}
