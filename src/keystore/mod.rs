//! API key repository. Single-writer critical section over an in-memory map,
//! flushed to a JSON snapshot on a debounced background task. Mirrors the
//! write-temp-then-rename persistence used elsewhere in this codebase for
//! crash-safe writes.

mod persist;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub use persist::Snapshot;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("key not found")]
    NotFound,
    #[error("key already exists")]
    AlreadyExists,
    #[error("insufficient credits")]
    InsufficientCredits,
    #[error("key inactive")]
    Inactive,
    #[error("spending limit exceeded")]
    SpendingLimitExceeded,
    #[error("snapshot io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Optional per-key quota settings plus the running counters they bound.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Quota {
    #[serde(default)]
    pub daily_call_limit: Option<u64>,
    #[serde(default)]
    pub monthly_call_limit: Option<u64>,
    #[serde(default)]
    pub daily_credit_limit: Option<i64>,
    #[serde(default)]
    pub monthly_credit_limit: Option<i64>,
    #[serde(default)]
    pub daily_calls: u64,
    #[serde(default)]
    pub daily_credits: i64,
    #[serde(default)]
    pub monthly_calls: u64,
    #[serde(default)]
    pub monthly_credits: i64,
    #[serde(default)]
    pub day_anchor: Option<DateTime<Utc>>,
    #[serde(default)]
    pub month_anchor: Option<DateTime<Utc>>,
}

/// A single API key's policy and billing state.
///
/// `#[serde(default)]` on every field added after the initial cut keeps old
/// snapshot files forward-compatible; `extra` preserves fields this binary
/// doesn't know about yet so they round-trip unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRecord {
    /// Opaque bearer secret, `pg_`-prefixed. Immutable once issued.
    pub key: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub credits: i64,
    #[serde(default)]
    pub total_spent: i64,
    #[serde(default)]
    pub total_calls: u64,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub suspended: bool,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub allowed_tools: Option<Vec<String>>,
    #[serde(default)]
    pub denied_tools: Option<Vec<String>>,
    #[serde(default)]
    pub ip_allowlist: Option<Vec<String>>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default)]
    pub spending_limit: Option<i64>,
    #[serde(default)]
    pub quota: Option<Quota>,
    /// Per-key override of the deployment's default global rate limit.
    /// `None` means "use the gateway default" (see
    /// `PayGateConfig::default_rate_limit_per_minute`).
    #[serde(default, rename = "rateLimitPerMinute")]
    pub rate_limit_per_minute: Option<u32>,
    /// Per-tool rate limit overrides, keyed by tool name.
    #[serde(default, rename = "toolRateLimits")]
    pub tool_rate_limits: HashMap<String, u32>,
    /// Unknown fields from a newer snapshot format are kept and re-emitted.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default)]
pub struct NewKeyOpts {
    pub allowed_tools: Option<Vec<String>>,
    pub denied_tools: Option<Vec<String>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub quota: Option<Quota>,
    pub tags: HashMap<String, String>,
    pub ip_allowlist: Option<Vec<String>>,
}

impl KeyRecord {
    pub fn new(key: String, name: String, credits: i64, opts: NewKeyOpts) -> Self {
        let now = Utc::now();
        Self {
            key,
            name,
            created_at: now,
            last_used_at: None,
            credits,
            total_spent: 0,
            total_calls: 0,
            active: true,
            suspended: false,
            expires_at: opts.expires_at,
            allowed_tools: opts.allowed_tools,
            denied_tools: opts.denied_tools,
            ip_allowlist: opts.ip_allowlist,
            tags: opts.tags,
            spending_limit: None,
            quota: opts.quota,
            rate_limit_per_minute: None,
            tool_rate_limits: HashMap::new(),
            extra: serde_json::Map::new(),
        }
    }

    pub fn masked(&self) -> String {
        mask_key(&self.key)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| now >= exp)
    }

    /// `getKey` semantics: nil-equivalent unless active, unexpired, unsuspended.
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.active && !self.suspended && !self.is_expired(now)
    }
}

pub fn mask_key(key: &str) -> String {
    if key.len() <= 10 {
        return "***".to_string();
    }
    format!("{}…{}", &key[..6], &key[key.len() - 4..])
}

pub fn generate_key() -> String {
    let mut bytes = [0u8; 32];
    bytes[..16].copy_from_slice(uuid::Uuid::new_v4().as_bytes());
    bytes[16..].copy_from_slice(uuid::Uuid::new_v4().as_bytes());
    format!("pg_{}", hex::encode(bytes))
}

struct Inner {
    keys: HashMap<String, KeyRecord>,
}

/// Feature-independent tag for [`KeyStore::publish_sync`] so the call sites
/// don't need their own `#[cfg(feature = "redis-sync")]` gating.
#[derive(Clone, Copy)]
enum SyncKind {
    Deduct,
    Topup,
    Refund,
}

/// Repository of `KeyRecord`s. Every mutation runs under one `Mutex`, so
/// credit deduction is a single critical section — no lost updates, no
/// torn reads. Reads clone the record out rather than handing back a
/// reference into the map.
pub struct KeyStore {
    inner: Mutex<Inner>,
    snapshot_path: PathBuf,
    flush_pending: std::sync::atomic::AtomicBool,
    #[cfg(feature = "redis-sync")]
    redis_sync: std::sync::OnceLock<Arc<crate::redis_sync::RedisSync>>,
}

impl KeyStore {
    /// Load an existing snapshot, or start empty if the file is missing or
    /// corrupt. A corrupt/missing snapshot is never fatal — it produces an
    /// empty store plus a warning, mirroring how this codebase treats a
    /// missing config file as "use defaults", not an error.
    pub async fn load(snapshot_path: PathBuf) -> Self {
        let keys = match persist::load(&snapshot_path).await {
            Ok(snapshot) => snapshot
                .keys
                .into_iter()
                .map(|k| (k.key.clone(), k))
                .collect(),
            Err(e) => {
                warn!(path = %snapshot_path.display(), err = %e, "no usable key snapshot — starting empty");
                HashMap::new()
            }
        };
        info!(count = keys.len(), "keystore loaded");
        Self {
            inner: Mutex::new(Inner { keys }),
            snapshot_path,
            flush_pending: std::sync::atomic::AtomicBool::new(false),
            #[cfg(feature = "redis-sync")]
            redis_sync: std::sync::OnceLock::new(),
        }
    }

    /// Wires in the best-effort cross-instance sync layer. Called once at
    /// startup if `PAYGATE_REDIS_URL` is configured; a store with no sync
    /// layer attached behaves exactly as it does without the feature.
    #[cfg(feature = "redis-sync")]
    pub fn attach_redis_sync(&self, sync: Arc<crate::redis_sync::RedisSync>) {
        let _ = self.redis_sync.set(sync);
    }

    pub async fn create_key(
        &self,
        name: String,
        credits: i64,
        opts: NewKeyOpts,
    ) -> Result<KeyRecord, StoreError> {
        if credits < 0 {
            return Err(StoreError::SpendingLimitExceeded);
        }
        let mut inner = self.inner.lock().await;
        let key = loop {
            let candidate = generate_key();
            if !inner.keys.contains_key(&candidate) {
                break candidate;
            }
        };
        let record = KeyRecord::new(key.clone(), name, credits, opts);
        inner.keys.insert(key, record.clone());
        drop(inner);
        self.request_flush();
        self.mirror_balance(&record);
        Ok(record)
    }

    pub async fn import_key(
        &self,
        key: String,
        name: String,
        credits: i64,
    ) -> Result<KeyRecord, StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.keys.contains_key(&key) {
            return Err(StoreError::AlreadyExists);
        }
        let record = KeyRecord::new(key.clone(), name, credits, NewKeyOpts::default());
        inner.keys.insert(key, record.clone());
        drop(inner);
        self.request_flush();
        self.mirror_balance(&record);
        Ok(record)
    }

    /// Mirrors a newly created/imported key's balance into the shared hash
    /// without publishing an event — there's no remote analog to race
    /// against for a key that didn't previously exist anywhere.
    #[allow(unused_variables)]
    fn mirror_balance(&self, record: &KeyRecord) {
        #[cfg(feature = "redis-sync")]
        if let Some(sync) = self.redis_sync.get() {
            let sync = sync.clone();
            let masked = record.masked();
            let credits = record.credits;
            tokio::spawn(async move {
                sync.mirror_balance(&masked, credits).await;
            });
        }
    }

    /// `getKey` — returns `NotFound` if absent, inactive, suspended, or expired.
    pub async fn get_key(&self, key: &str) -> Result<KeyRecord, StoreError> {
        let inner = self.inner.lock().await;
        let record = inner.keys.get(key).ok_or(StoreError::NotFound)?;
        if !record.is_usable(Utc::now()) {
            return Err(StoreError::NotFound);
        }
        Ok(record.clone())
    }

    /// `getKeyRaw` — admin introspection, ignores active/expired/suspended.
    pub async fn get_key_raw(&self, key: &str) -> Result<KeyRecord, StoreError> {
        let inner = self.inner.lock().await;
        inner.keys.get(key).cloned().ok_or(StoreError::NotFound)
    }

    pub async fn list_keys(&self) -> Vec<KeyRecord> {
        self.inner.lock().await.keys.values().cloned().collect()
    }

    /// Maps a masked display key (e.g. from a `redis_sync` event, which
    /// never carries the raw secret) back to its raw key. `O(n)` in key
    /// count — fine at the scale this gateway's keystore runs at.
    #[cfg(feature = "redis-sync")]
    pub async fn resolve_masked(&self, masked: &str) -> Option<String> {
        self.inner
            .lock()
            .await
            .keys
            .values()
            .find(|r| r.masked() == masked)
            .map(|r| r.key.clone())
    }

    /// Applies a balance change that originated on another instance via the
    /// sync layer. Unlike `deduct_credits`/`add_credits`, this never calls
    /// `publish_sync` — otherwise two instances would echo the same event
    /// back and forth, each re-applying and re-publishing it forever.
    #[cfg(feature = "redis-sync")]
    pub async fn apply_remote_credit_change(
        &self,
        key: &str,
        amount: i64,
        kind: crate::redis_sync::SyncEventKind,
    ) -> Result<KeyRecord, StoreError> {
        use crate::redis_sync::SyncEventKind;
        match kind {
            SyncEventKind::Deduct => {
                self.mutate(key, |r| {
                    r.credits -= amount;
                    r.total_spent += amount;
                    r.total_calls += 1;
                    Ok(())
                })
                .await
            }
            SyncEventKind::Topup => {
                self.mutate(key, |r| {
                    r.credits += amount;
                    Ok(())
                })
                .await
            }
            SyncEventKind::Refund => {
                self.mutate(key, |r| {
                    r.credits += amount;
                    r.total_spent -= amount;
                    Ok(())
                })
                .await
            }
        }
    }

    pub async fn list_keys_by_tag(&self, tag_key: &str, tag_value: &str) -> Vec<KeyRecord> {
        self.inner
            .lock()
            .await
            .keys
            .values()
            .filter(|r| r.tags.get(tag_key).map(|v| v.as_str()) == Some(tag_value))
            .cloned()
            .collect()
    }

    pub async fn revoke_key(&self, key: &str) -> Result<KeyRecord, StoreError> {
        self.mutate(key, |r| {
            r.active = false;
            Ok(())
        })
        .await
    }

    pub async fn suspend_key(&self, key: &str) -> Result<KeyRecord, StoreError> {
        self.mutate(key, |r| {
            r.suspended = true;
            Ok(())
        })
        .await
    }

    pub async fn resume_key(&self, key: &str) -> Result<KeyRecord, StoreError> {
        self.mutate(key, |r| {
            r.suspended = false;
            Ok(())
        })
        .await
    }

    /// Rotation issues a fresh key value, carries over every counter and
    /// setting, and deactivates the old key — all under one lock so no
    /// caller can observe both keys active at once.
    pub async fn rotate_key(&self, old_key: &str) -> Result<KeyRecord, StoreError> {
        let mut inner = self.inner.lock().await;
        let mut old = inner.keys.get(old_key).ok_or(StoreError::NotFound)?.clone();
        let new_key = loop {
            let candidate = generate_key();
            if !inner.keys.contains_key(&candidate) {
                break candidate;
            }
        };
        old.active = false;
        inner.keys.insert(old_key.to_string(), old.clone());

        let mut new_record = old;
        new_record.key = new_key.clone();
        new_record.active = true;
        new_record.created_at = Utc::now();
        inner.keys.insert(new_key, new_record.clone());
        drop(inner);
        self.request_flush();
        Ok(new_record)
    }

    pub async fn set_acl(
        &self,
        key: &str,
        allowed_tools: Option<Vec<String>>,
        denied_tools: Option<Vec<String>>,
    ) -> Result<KeyRecord, StoreError> {
        self.mutate(key, |r| {
            r.allowed_tools = allowed_tools;
            r.denied_tools = denied_tools;
            Ok(())
        })
        .await
    }

    pub async fn set_expiry(
        &self,
        key: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<KeyRecord, StoreError> {
        self.mutate(key, |r| {
            r.expires_at = expires_at;
            Ok(())
        })
        .await
    }

    pub async fn set_quota(&self, key: &str, quota: Option<Quota>) -> Result<KeyRecord, StoreError> {
        self.mutate(key, |r| {
            r.quota = quota;
            Ok(())
        })
        .await
    }

    pub async fn set_tags(
        &self,
        key: &str,
        tags: HashMap<String, String>,
    ) -> Result<KeyRecord, StoreError> {
        self.mutate(key, |r| {
            r.tags = tags;
            Ok(())
        })
        .await
    }

    pub async fn set_ip_allowlist(
        &self,
        key: &str,
        ip_allowlist: Option<Vec<String>>,
    ) -> Result<KeyRecord, StoreError> {
        self.mutate(key, |r| {
            r.ip_allowlist = ip_allowlist;
            Ok(())
        })
        .await
    }

    pub async fn set_spending_limit(
        &self,
        key: &str,
        spending_limit: Option<i64>,
    ) -> Result<KeyRecord, StoreError> {
        self.mutate(key, |r| {
            r.spending_limit = spending_limit;
            Ok(())
        })
        .await
    }

    pub async fn set_rate_limit(
        &self,
        key: &str,
        rate_limit_per_minute: Option<u32>,
        tool_rate_limits: HashMap<String, u32>,
    ) -> Result<KeyRecord, StoreError> {
        self.mutate(key, |r| {
            r.rate_limit_per_minute = rate_limit_per_minute;
            r.tool_rate_limits = tool_rate_limits;
            Ok(())
        })
        .await
    }

    /// Atomic check-and-decrement: the single critical section that makes
    /// concurrent deductions safe. Fails closed on any policy violation
    /// rather than deducting partially.
    pub async fn deduct_credits(&self, key: &str, amount: i64) -> Result<KeyRecord, StoreError> {
        let now = Utc::now();
        let record = self
            .mutate(key, |r| {
                if !r.active || r.suspended || r.is_expired(now) {
                    return Err(StoreError::Inactive);
                }
                if r.credits < amount {
                    return Err(StoreError::InsufficientCredits);
                }
                if let Some(limit) = r.spending_limit {
                    if r.total_spent + amount > limit {
                        return Err(StoreError::SpendingLimitExceeded);
                    }
                }
                r.credits -= amount;
                r.total_spent += amount;
                r.total_calls += 1;
                r.last_used_at = Some(now);
                Ok(())
            })
            .await;
        if let Ok(r) = &record {
            self.publish_sync(r, amount, SyncKind::Deduct);
        }
        record
    }

    /// Inverse of `deductCredits`: adds back exactly the charged amount and
    /// exactly undoes the `totalSpent` increment.
    pub async fn refund_credits(&self, key: &str, amount: i64) -> Result<KeyRecord, StoreError> {
        let record = self
            .mutate(key, |r| {
                r.credits += amount;
                r.total_spent -= amount;
                Ok(())
            })
            .await;
        if let Ok(r) = &record {
            self.publish_sync(r, amount, SyncKind::Refund);
        }
        record
    }

    pub async fn add_credits(&self, key: &str, amount: i64) -> Result<KeyRecord, StoreError> {
        let record = self
            .mutate(key, |r| {
                if !r.active {
                    return Err(StoreError::Inactive);
                }
                r.credits += amount;
                Ok(())
            })
            .await;
        if let Ok(r) = &record {
            self.publish_sync(r, amount, SyncKind::Topup);
        }
        record
    }

    /// Fans a credit mutation out to the optional Redis broadcast layer.
    /// A no-op when the `redis-sync` feature is off or no sync layer has
    /// been attached — local state is always authoritative regardless.
    #[allow(unused_variables)]
    fn publish_sync(&self, record: &KeyRecord, amount: i64, kind: SyncKind) {
        #[cfg(feature = "redis-sync")]
        if let Some(sync) = self.redis_sync.get() {
            let sync = sync.clone();
            let masked = record.masked();
            let kind = match kind {
                SyncKind::Deduct => crate::redis_sync::SyncEventKind::Deduct,
                SyncKind::Topup => crate::redis_sync::SyncEventKind::Topup,
                SyncKind::Refund => crate::redis_sync::SyncEventKind::Refund,
            };
            tokio::spawn(async move {
                sync.publish(&masked, amount, kind).await;
            });
        }
    }

    pub async fn mutate<F>(&self, key: &str, f: F) -> Result<KeyRecord, StoreError>
    where
        F: FnOnce(&mut KeyRecord) -> Result<(), StoreError>,
    {
        let mut inner = self.inner.lock().await;
        let record = inner.keys.get_mut(key).ok_or(StoreError::NotFound)?;
        f(record)?;
        let out = record.clone();
        drop(inner);
        self.request_flush();
        Ok(out)
    }

    /// Schedule a debounced flush. Coalesces bursts of mutations into one
    /// write; a mutation arriving mid-flush schedules exactly one more via
    /// `spawn_flush_task`'s next tick.
    fn request_flush(&self) {
        self.flush_pending
            .store(true, std::sync::atomic::Ordering::Release);
    }

    pub fn take_flush_pending(&self) -> bool {
        self.flush_pending
            .swap(false, std::sync::atomic::Ordering::AcqRel)
    }

    pub async fn flush_now(&self) -> Result<(), StoreError> {
        let keys: Vec<KeyRecord> = self.inner.lock().await.keys.values().cloned().collect();
        persist::save(
            &self.snapshot_path,
            &Snapshot {
                version: "1".to_string(),
                keys,
            },
        )
        .await
    }
}

/// Spawn the debounced-flush task. A `tokio::spawn` + `tokio::time::interval`
/// loop that checks a pending flag each tick — the same idiom this codebase
/// uses for periodic sweeps of expired/stale state.
pub fn spawn_flush_task(store: Arc<KeyStore>, interval: std::time::Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if store.take_flush_pending() {
                if let Err(e) = store.flush_now().await {
                    warn!(err = %e, "keystore snapshot flush failed");
                }
            }
        }
    });
}

pub(crate) fn quota_rollover(quota: &mut Quota, now: DateTime<Utc>) {
    let day_stale = quota
        .day_anchor
        .map(|a| a.date_naive() != now.date_naive())
        .unwrap_or(true);
    if day_stale {
        quota.daily_calls = 0;
        quota.daily_credits = 0;
        quota.day_anchor = Some(now);
    }
    let month_stale = quota
        .month_anchor
        .map(|a| (a.year(), a.month()) != (now.year(), now.month()))
        .unwrap_or(true);
    if month_stale {
        quota.monthly_calls = 0;
        quota.monthly_credits = 0;
        quota.month_anchor = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deduct_never_goes_negative() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::load(dir.path().join("keys.json")).await;
        let rec = store
            .create_key("test".into(), 10, NewKeyOpts::default())
            .await
            .unwrap();
        assert!(matches!(
            store.deduct_credits(&rec.key, 11).await,
            Err(StoreError::InsufficientCredits)
        ));
        let rec = store.deduct_credits(&rec.key, 10).await.unwrap();
        assert_eq!(rec.credits, 0);
        assert_eq!(rec.total_spent, 10);
    }

    #[tokio::test]
    async fn revoked_key_is_unusable_even_with_credits() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::load(dir.path().join("keys.json")).await;
        let rec = store
            .create_key("test".into(), 100, NewKeyOpts::default())
            .await
            .unwrap();
        store.revoke_key(&rec.key).await.unwrap();
        assert!(matches!(
            store.get_key(&rec.key).await,
            Err(StoreError::NotFound)
        ));
        assert!(matches!(
            store.deduct_credits(&rec.key, 1).await,
            Err(StoreError::Inactive)
        ));
    }

    #[tokio::test]
    async fn rotation_carries_over_counters_and_deactivates_old() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::load(dir.path().join("keys.json")).await;
        let rec = store
            .create_key("test".into(), 50, NewKeyOpts::default())
            .await
            .unwrap();
        store.deduct_credits(&rec.key, 10).await.unwrap();
        let new_rec = store.rotate_key(&rec.key).await.unwrap();
        assert_eq!(new_rec.credits, 40);
        assert_eq!(new_rec.total_spent, 10);
        assert_ne!(new_rec.key, rec.key);
        let old = store.get_key_raw(&rec.key).await.unwrap();
        assert!(!old.active);
    }

    #[tokio::test]
    async fn round_trips_unknown_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");
        let mut extra = serde_json::Map::new();
        extra.insert("future_field".to_string(), serde_json::json!(true));
        let mut record = KeyRecord::new("pg_a".into(), "a".into(), 5, NewKeyOpts::default());
        record.extra = extra;
        persist::save(
            &path,
            &Snapshot {
                version: "1".into(),
                keys: vec![record],
            },
        )
        .await
        .unwrap();

        let loaded = persist::load(&path).await.unwrap();
        assert_eq!(
            loaded.keys[0].extra.get("future_field"),
            Some(&serde_json::json!(true))
        );
    }

    #[tokio::test]
    async fn masks_key_for_display() {
        assert_eq!(mask_key("sk-abcdef1234567890"), "sk-abc…7890");
    }
}
