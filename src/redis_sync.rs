//! Optional cross-instance credit sync, feature-gated behind `redis-sync`.
//!
//! Local `KeyStore` state is always authoritative — this layer is a
//! best-effort broadcast so a fleet of gateways sharing one Redis instance
//! converge quickly, not a requirement for correctness. Every local
//! mutation publishes a `SyncEvent`; a subscriber task applies events
//! originating from other instances and ignores its own (loop prevention
//! via the `origin` field). Connection failures are logged and swallowed.

use std::sync::Arc;

use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::keystore::KeyStore;

const EVENTS_CHANNEL: &str = "paygate:credit_events";
const BALANCE_HASH: &str = "paygate:balances";

/// Atomically checks-then-deducts a balance in the mirrored hash and
/// publishes the resulting event, so two gateways racing on the same key
/// never both succeed against a balance Redis itself has already spent.
const DEDUCT_SCRIPT: &str = r#"
local bal = tonumber(redis.call('HGET', KEYS[1], ARGV[1]) or '0')
local amount = tonumber(ARGV[2])
if bal < amount then
  return -1
end
local newbal = bal - amount
redis.call('HSET', KEYS[1], ARGV[1], newbal)
redis.call('PUBLISH', KEYS[2], ARGV[3])
return newbal
"#;

const TOPUP_SCRIPT: &str = r#"
local bal = tonumber(redis.call('HGET', KEYS[1], ARGV[1]) or '0')
local amount = tonumber(ARGV[2])
local newbal = bal + amount
redis.call('HSET', KEYS[1], ARGV[1], newbal)
redis.call('PUBLISH', KEYS[2], ARGV[3])
return newbal
"#;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncEventKind {
    Deduct,
    Topup,
    Refund,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEvent {
    pub origin: String,
    pub key: String,
    pub amount: i64,
    pub kind: SyncEventKind,
}

/// Wraps a `redis::aio::ConnectionManager` (auto-reconnecting) plus this
/// process's instance id, used to tag and filter out our own publishes.
pub struct RedisSync {
    origin: String,
    conn: ConnectionManager,
    deduct_script: Script,
    topup_script: Script,
}

impl RedisSync {
    pub async fn connect(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self {
            origin: Uuid::new_v4().to_string(),
            conn,
            deduct_script: Script::new(DEDUCT_SCRIPT),
            topup_script: Script::new(TOPUP_SCRIPT),
        })
    }

    /// Mirrors a key's balance into the shared hash without publishing —
    /// used for `create_key`/`import_key`, which have no remote analog to
    /// race against.
    pub async fn mirror_balance(&self, masked_key: &str, credits: i64) {
        let mut conn = self.conn.clone();
        if let Err(e) = conn
            .hset::<_, _, _, ()>(BALANCE_HASH, masked_key, credits)
            .await
        {
            warn!(err = %e, "redis_sync: failed to mirror balance");
        }
    }

    /// Runs the atomic deduct Lua script. Returns `Ok(None)` if the shared
    /// balance was insufficient (the caller's local deduct is still the
    /// authority on whether the call is actually allowed — this only keeps
    /// Redis from racing two instances into a negative shared balance).
    pub async fn atomic_deduct(&self, masked_key: &str, amount: i64) -> anyhow::Result<Option<i64>> {
        self.run_balance_script(&self.deduct_script, masked_key, amount, SyncEventKind::Deduct)
            .await
    }

    pub async fn atomic_topup(&self, masked_key: &str, amount: i64) -> anyhow::Result<Option<i64>> {
        self.run_balance_script(&self.topup_script, masked_key, amount, SyncEventKind::Topup)
            .await
    }

    async fn run_balance_script(
        &self,
        script: &Script,
        masked_key: &str,
        amount: i64,
        kind: SyncEventKind,
    ) -> anyhow::Result<Option<i64>> {
        let event = SyncEvent {
            origin: self.origin.clone(),
            key: masked_key.to_string(),
            amount,
            kind,
        };
        let payload = serde_json::to_string(&event)?;
        let mut conn = self.conn.clone();
        let result: i64 = script
            .key(BALANCE_HASH)
            .key(EVENTS_CHANNEL)
            .arg(masked_key)
            .arg(amount)
            .arg(payload)
            .invoke_async(&mut conn)
            .await?;
        Ok(if result < 0 { None } else { Some(result) })
    }

    /// Best-effort publish for events that don't need the Lua atomics (e.g.
    /// refunds, which are already idempotent-guarded by the caller).
    pub async fn publish(&self, key: &str, amount: i64, kind: SyncEventKind) {
        let event = SyncEvent {
            origin: self.origin.clone(),
            key: key.to_string(),
            amount,
            kind,
        };
        let Ok(payload) = serde_json::to_string(&event) else {
            return;
        };
        let mut conn = self.conn.clone();
        if let Err(e) = conn.publish::<_, _, ()>(EVENTS_CHANNEL, payload).await {
            warn!(err = %e, "redis_sync: publish failed");
        }
    }

    /// Reads the full shared balance hash on startup and applies it to any
    /// local key whose masked form matches, so a freshly started instance
    /// doesn't undercount credits another instance already spent.
    pub async fn warm_from_hash(&self, store: &KeyStore) {
        let mut conn = self.conn.clone();
        let remote: std::collections::HashMap<String, i64> =
            match conn.hgetall(BALANCE_HASH).await {
                Ok(m) => m,
                Err(e) => {
                    warn!(err = %e, "redis_sync: warm-from-hash failed, starting cold");
                    return;
                }
            };
        for record in store.list_keys().await {
            if let Some(&remote_credits) = remote.get(&record.masked()) {
                if remote_credits != record.credits {
                    let _ = store
                        .mutate(&record.key, |r| r.credits = remote_credits)
                        .await;
                }
            }
        }
    }
}

/// Subscribes to the shared events channel and applies every inbound event
/// that didn't originate from this instance. Runs until the process exits;
/// reconnects are handled transparently by `ConnectionManager`, but a lost
/// pub/sub connection requires resubscribing, so this loop re-establishes
/// the subscription on error rather than returning.
pub fn spawn_subscriber(sync: Arc<RedisSync>, redis_url: String, store: Arc<KeyStore>) {
    tokio::spawn(async move {
        loop {
            match run_subscriber(&sync, &redis_url, &store).await {
                Ok(()) => {}
                Err(e) => warn!(err = %e, "redis_sync: subscriber loop ended, retrying in 5s"),
            }
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        }
    });
}

async fn run_subscriber(sync: &RedisSync, redis_url: &str, store: &KeyStore) -> anyhow::Result<()> {
    let client = redis::Client::open(redis_url)?;
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(EVENTS_CHANNEL).await?;
    let mut stream = pubsub.on_message();

    use futures_util::StreamExt;
    while let Some(msg) = stream.next().await {
        let payload: String = match msg.get_payload() {
            Ok(p) => p,
            Err(e) => {
                warn!(err = %e, "redis_sync: malformed pub/sub payload");
                continue;
            }
        };
        let event: SyncEvent = match serde_json::from_str(&payload) {
            Ok(e) => e,
            Err(e) => {
                warn!(err = %e, "redis_sync: undecodable event");
                continue;
            }
        };
        if event.origin == sync.origin {
            continue; // our own publish, looped back by the broker
        }
        apply_remote_event(store, &event).await;
    }
    Ok(())
}

async fn apply_remote_event(store: &KeyStore, event: &SyncEvent) {
    let Some(key) = store.resolve_masked(&event.key).await else {
        debug!(masked = %event.key, "redis_sync: event for unknown local key, ignoring");
        return;
    };
    if let Err(e) = store
        .apply_remote_credit_change(&key, event.amount, event.kind)
        .await
    {
        debug!(err = %e, masked = %event.key, "redis_sync: failed to apply remote event locally");
    }
}
