use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

const DEFAULT_PORT: u16 = 4300;
const DEFAULT_ADMIN_KEY_ENV: &str = "PAYGATE_ADMIN_KEY";
const DEFAULT_DEFAULT_CREDITS_PER_CALL: i64 = 1;
const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;
const DEFAULT_BACKEND_TIMEOUT_SECS: u64 = 60;
const DEFAULT_SESSION_TTL_SECS: u64 = 30 * 60;
const DEFAULT_RING_CAPACITY: usize = 10_000;
const DEFAULT_WEBHOOK_MAX_ATTEMPTS: u32 = 8;

// ─── TOML config file ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, Default)]
pub struct BackendToml {
    pub prefix: Option<String>,
    pub kind: Option<String>, // "stdio" | "http"
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct PricingToml {
    pub default_credits_per_call: Option<i64>,
    pub per_kb_surcharge: Option<i64>,
    #[serde(default)]
    pub tool: std::collections::HashMap<String, i64>,
}

/// `{data_dir}/config.toml` — all fields are optional overrides.
/// Priority: CLI / env var > TOML > built-in default.
#[derive(Deserialize, Default)]
struct TomlConfig {
    port: Option<u16>,
    admin_key: Option<String>,
    maintenance_mode: Option<bool>,
    shadow_mode: Option<bool>,
    max_body_bytes: Option<usize>,
    backend_timeout_secs: Option<u64>,
    session_ttl_secs: Option<u64>,
    ring_capacity: Option<usize>,
    default_rate_limit_per_minute: Option<u32>,
    cors_allowed_origins: Option<Vec<String>>,
    webhook_url: Option<String>,
    webhook_secret: Option<String>,
    webhook_max_attempts: Option<u32>,
    stripe_secret: Option<String>,
    #[serde(default)]
    backends: Vec<BackendToml>,
    #[serde(default)]
    pricing: PricingToml,
    #[cfg(feature = "redis-sync")]
    redis_url: Option<String>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

// ─── PayGateConfig ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PayGateConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub log: String,
    pub admin_key: String,
    pub maintenance_mode: bool,
    pub shadow_mode: bool,
    pub max_body_bytes: usize,
    pub backend_timeout_secs: u64,
    pub session_ttl_secs: u64,
    pub ring_capacity: usize,
    pub default_rate_limit_per_minute: Option<u32>,
    pub cors_allowed_origins: Option<Vec<String>>,
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<String>,
    pub webhook_max_attempts: u32,
    pub stripe_secret: Option<String>,
    pub backends: Vec<BackendToml>,
    pub default_credits_per_call: i64,
    pub per_kb_surcharge: i64,
    pub tool_pricing: std::collections::HashMap<String, i64>,
    #[cfg(feature = "redis-sync")]
    pub redis_url: Option<String>,
}

impl PayGateConfig {
    /// Build config from CLI/env args + optional TOML file. Priority
    /// (highest to lowest): CLI/env, TOML file, built-in default. Resolved
    /// once at startup — components never merge partial config at runtime.
    pub fn new(
        port: Option<u16>,
        data_dir: Option<PathBuf>,
        log: Option<String>,
        admin_key: Option<String>,
    ) -> Self {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);
        let toml = load_toml(&data_dir).unwrap_or_default();

        let port = port.or(toml.port).unwrap_or(DEFAULT_PORT);
        let log = log.unwrap_or_else(|| "info".to_string());

        let admin_key = admin_key
            .or_else(|| std::env::var(DEFAULT_ADMIN_KEY_ENV).ok())
            .or(toml.admin_key)
            .unwrap_or_else(|| {
                warn!("no admin key configured — generating an ephemeral one for this process");
                crate::keystore::generate_key()
            });

        let maintenance_mode = toml.maintenance_mode.unwrap_or(false);
        let shadow_mode = toml.shadow_mode.unwrap_or(false);
        let max_body_bytes = toml.max_body_bytes.unwrap_or(DEFAULT_MAX_BODY_BYTES);
        let backend_timeout_secs = toml.backend_timeout_secs.unwrap_or(DEFAULT_BACKEND_TIMEOUT_SECS);
        let session_ttl_secs = toml.session_ttl_secs.unwrap_or(DEFAULT_SESSION_TTL_SECS);
        let ring_capacity = toml.ring_capacity.unwrap_or(DEFAULT_RING_CAPACITY);
        let webhook_max_attempts = toml.webhook_max_attempts.unwrap_or(DEFAULT_WEBHOOK_MAX_ATTEMPTS);

        let webhook_url = std::env::var("PAYGATE_WEBHOOK_URL").ok().or(toml.webhook_url);
        let webhook_secret = std::env::var("PAYGATE_WEBHOOK_SECRET").ok().or(toml.webhook_secret);
        let stripe_secret = std::env::var("PAYGATE_STRIPE_SECRET").ok().or(toml.stripe_secret);

        #[cfg(feature = "redis-sync")]
        let redis_url = std::env::var("PAYGATE_REDIS_URL").ok().or(toml.redis_url);

        Self {
            port,
            data_dir,
            log,
            admin_key,
            maintenance_mode,
            shadow_mode,
            max_body_bytes,
            backend_timeout_secs,
            session_ttl_secs,
            ring_capacity,
            default_rate_limit_per_minute: toml.default_rate_limit_per_minute,
            cors_allowed_origins: toml.cors_allowed_origins,
            webhook_url,
            webhook_secret,
            webhook_max_attempts,
            stripe_secret,
            backends: toml.backends,
            default_credits_per_call: toml
                .pricing
                .default_credits_per_call
                .unwrap_or(DEFAULT_DEFAULT_CREDITS_PER_CALL),
            per_kb_surcharge: toml.pricing.per_kb_surcharge.unwrap_or(0),
            tool_pricing: toml.pricing.tool,
            #[cfg(feature = "redis-sync")]
            redis_url,
        }
    }
}

// ─── Hot-reloadable config subset ─────────────────────────────────────────────

/// Non-critical config fields that can be changed without restarting the
/// process. Both fields back a shared `AtomicBool` so the gate pipeline can
/// read them lock-free on every call.
pub struct HotConfig {
    pub maintenance_mode: Arc<AtomicBool>,
    pub shadow_mode: Arc<AtomicBool>,
}

/// Watches `config.toml` for changes and reloads `maintenance_mode` /
/// `shadow_mode` in place. Port, admin key, and backend wiring are
/// startup-only and require a restart.
pub struct ConfigWatcher {
    pub hot: HotConfig,
    _watcher: notify_debouncer_full::Debouncer<
        notify_debouncer_full::notify::RecommendedWatcher,
        notify_debouncer_full::FileIdMap,
    >,
}

impl ConfigWatcher {
    /// Returns `None` if the watcher could not be created (non-fatal — the
    /// gateway runs fine with a static config and no hot-reload).
    pub fn start(data_dir: &Path, initial: &PayGateConfig) -> Option<Self> {
        let config_path = data_dir.join("config.toml");
        let maintenance_mode = Arc::new(AtomicBool::new(initial.maintenance_mode));
        let shadow_mode = Arc::new(AtomicBool::new(initial.shadow_mode));

        let maintenance_clone = maintenance_mode.clone();
        let shadow_clone = shadow_mode.clone();
        let config_path_clone = config_path.clone();
        let rt_handle = tokio::runtime::Handle::current();

        let watcher = notify_debouncer_full::new_debouncer(
            std::time::Duration::from_secs(2),
            None,
            move |result: notify_debouncer_full::DebounceEventResult| {
                if let Ok(events) = result {
                    let relevant = events.iter().any(|e| {
                        use notify_debouncer_full::notify::EventKind;
                        matches!(e.event.kind, EventKind::Modify(_) | EventKind::Create(_))
                    });
                    if relevant {
                        let maintenance = maintenance_clone.clone();
                        let shadow = shadow_clone.clone();
                        let path = config_path_clone.clone();
                        rt_handle.spawn(async move {
                            let toml = tokio::task::spawn_blocking(move || load_toml_sync(&path))
                                .await
                                .unwrap_or_default();
                            if let Some(v) = toml.maintenance_mode {
                                maintenance.store(v, Ordering::Release);
                            }
                            if let Some(v) = toml.shadow_mode {
                                shadow.store(v, Ordering::Release);
                            }
                            info!(
                                maintenance_mode = maintenance.load(Ordering::Acquire),
                                shadow_mode = shadow.load(Ordering::Acquire),
                                "config.toml reloaded"
                            );
                        });
                    }
                }
            },
        );

        match watcher {
            Ok(mut debouncer) => {
                use notify_debouncer_full::notify::Watcher as _;
                let watch_path = config_path.parent().unwrap_or_else(|| Path::new("."));
                if let Err(e) = debouncer.watcher().watch(
                    watch_path,
                    notify_debouncer_full::notify::RecursiveMode::NonRecursive,
                ) {
                    warn!("config watcher failed to start: {e} — hot-reload disabled");
                    return None;
                }
                info!(path = %config_path.display(), "config hot-reload watcher started");
                Some(Self {
                    hot: HotConfig {
                        maintenance_mode,
                        shadow_mode,
                    },
                    _watcher: debouncer,
                })
            }
            Err(e) => {
                warn!("config watcher creation failed: {e} — hot-reload disabled");
                None
            }
        }
    }
}

fn load_toml_sync(path: &Path) -> TomlConfig {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| toml::from_str::<TomlConfig>(&s).ok())
        .unwrap_or_default()
}

fn default_data_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        return PathBuf::from(xdg).join("paygate");
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".local").join("share").join("paygate");
    }
    PathBuf::from(".paygate")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_arg_overrides_toml_and_default() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.toml"), "port = 9000\n").unwrap();
        let cfg = PayGateConfig::new(Some(4444), Some(dir.path().to_path_buf()), None, Some("k".into()));
        assert_eq!(cfg.port, 4444);
    }

    #[test]
    fn missing_toml_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = PayGateConfig::new(None, Some(dir.path().to_path_buf()), None, Some("k".into()));
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert_eq!(cfg.default_credits_per_call, DEFAULT_DEFAULT_CREDITS_PER_CALL);
    }
}
