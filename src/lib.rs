pub mod audit;
pub mod config;
pub mod error;
pub mod gate;
pub mod http;
pub mod keystore;
pub mod meter;
pub mod plugin;
pub mod quota;
pub mod ratelimit;
#[cfg(feature = "redis-sync")]
pub mod redis_sync;
pub mod retry;
pub mod router;
pub mod session;
pub mod transport;
pub mod webhook;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use audit::AuditLog;
use config::PayGateConfig;
use gate::{Gate, NoopTeamHook, PricingTable};
use keystore::KeyStore;
use meter::Meter;
use plugin::PluginRegistry;
use quota::QuotaTracker;
use ratelimit::RateLimiter;
use router::{Backend, Router};
use session::SessionManager;
use transport::{HttpBackendConfig, HttpTransport, StdioBackendConfig, StdioTransport, Transport};
use webhook::{WebhookConfig, WebhookDispatcher};

/// Shared application state, built once at startup and handed to the HTTP
/// layer and every background task via constructor injection — no process
/// globals or singletons.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<PayGateConfig>,
    pub keystore: Arc<KeyStore>,
    pub rate_limiter: Arc<RateLimiter>,
    pub quota: Arc<QuotaTracker>,
    pub meter: Arc<Meter>,
    pub audit: Arc<AuditLog>,
    pub webhook: Arc<WebhookDispatcher>,
    pub plugins: Arc<PluginRegistry>,
    pub gate: Arc<Gate>,
    pub router: Arc<Router>,
    pub sessions: Arc<SessionManager>,
    pub maintenance_mode: Arc<AtomicBool>,
    pub shadow_mode: Arc<AtomicBool>,
    pub started_at: std::time::Instant,
}

impl AppState {
    /// Assembles every component from a resolved config. Does not start
    /// backends or background tasks — call `start_background_tasks` and
    /// `router.ready()` once the returned state is wrapped for serving.
    pub async fn build(config: PayGateConfig) -> anyhow::Result<Self> {
        Self::build_with_hot(config, None).await
    }

    /// Like [`build`](Self::build), but lets the caller supply the hot
    /// `maintenance_mode`/`shadow_mode` atomics so a [`config::ConfigWatcher`]
    /// started before construction can mutate the same cells the running
    /// `Gate` reads — the `Gate` is handed out behind an `Arc` once built, so
    /// there is no other way to wire hot-reload after the fact.
    pub async fn build_with_hot(
        config: PayGateConfig,
        hot: Option<(Arc<AtomicBool>, Arc<AtomicBool>)>,
    ) -> anyhow::Result<Self> {
        let config = Arc::new(config);

        let snapshot_path = config.data_dir.join("keys.json");
        tokio::fs::create_dir_all(&config.data_dir).await.ok();
        let keystore = Arc::new(KeyStore::load(snapshot_path).await);

        #[cfg(feature = "redis-sync")]
        if let Some(redis_url) = &config.redis_url {
            match redis_sync::RedisSync::connect(redis_url).await {
                Ok(sync) => {
                    let sync = Arc::new(sync);
                    keystore.attach_redis_sync(sync.clone());
                    sync.warm_from_hash(&keystore).await;
                    redis_sync::spawn_subscriber(sync, redis_url.clone(), keystore.clone());
                    info!("redis_sync connected and subscriber started");
                }
                Err(e) => {
                    warn!(err = %e, "redis_sync connection failed — continuing with local state only");
                }
            }
        }

        let rate_limiter = Arc::new(RateLimiter::new());
        let quota = Arc::new(QuotaTracker::new(keystore.clone()));
        let meter = Arc::new(Meter::new(config.ring_capacity));
        let audit = Arc::new(AuditLog::new(config.ring_capacity));

        let webhook = Arc::new(WebhookDispatcher::new(WebhookConfig {
            url: config.webhook_url.clone(),
            secret: config.webhook_secret.clone(),
            max_attempts: config.webhook_max_attempts,
            ..WebhookConfig::default()
        }));
        webhook::spawn_worker(webhook.clone());

        let plugins = Arc::new(PluginRegistry::default());

        let (maintenance_mode, shadow_mode) = hot.unwrap_or_else(|| {
            (
                Arc::new(AtomicBool::new(config.maintenance_mode)),
                Arc::new(AtomicBool::new(config.shadow_mode)),
            )
        });

        let mut pricing = PricingTable {
            per_tool: config.tool_pricing.clone(),
            default_credits_per_call: config.default_credits_per_call,
            per_kb_surcharge: config.per_kb_surcharge,
        };
        if pricing.per_tool.is_empty() {
            pricing.per_tool = HashMap::new();
        }

        let gate = Arc::new(Gate {
            store: keystore.clone(),
            rate_limiter: rate_limiter.clone(),
            quota: quota.clone(),
            meter: meter.clone(),
            audit: audit.clone(),
            webhook: webhook.clone(),
            plugins: plugins.clone(),
            team_hook: Arc::new(NoopTeamHook),
            pricing,
            maintenance_mode: maintenance_mode.clone(),
            shadow_mode: shadow_mode.clone(),
            refund_on_failure: true,
            default_rate_limit_per_minute: config.default_rate_limit_per_minute,
        });

        let router = Arc::new(build_router(&config));
        let sessions = Arc::new(SessionManager::new(Duration::from_secs(config.session_ttl_secs)));

        Ok(Self {
            config,
            keystore,
            rate_limiter,
            quota,
            meter,
            audit,
            webhook,
            plugins,
            gate,
            router,
            sessions,
            maintenance_mode,
            shadow_mode,
            started_at: std::time::Instant::now(),
        })
    }

    /// Starts every periodic sweep/flush task. Call once after `build`.
    pub fn start_background_tasks(&self) {
        keystore::spawn_flush_task(self.keystore.clone(), Duration::from_secs(5));
        ratelimit::spawn_sweep_task(self.rate_limiter.clone(), Duration::from_secs(60));
        session::spawn_sweep_task(self.sessions.clone(), Duration::from_secs(60));
    }

    /// Flushes the keystore snapshot synchronously. Called on graceful
    /// shutdown so no accepted credit deduction is lost to a process exit
    /// racing the next debounced flush tick.
    pub async fn flush(&self) {
        if let Err(e) = self.keystore.flush_now().await {
            warn!(err = %e, "final keystore flush failed");
        }
    }

    pub async fn shutdown_backends(&self) {
        self.router.stop_all().await;
    }
}

fn build_router(config: &PayGateConfig) -> Router {
    let backends: Vec<Backend> = config
        .backends
        .iter()
        .filter_map(|b| {
            let prefix = b.prefix.clone().unwrap_or_default();
            let transport: Arc<dyn Transport> = match b.kind.as_deref() {
                Some("http") => Arc::new(HttpTransport::new(HttpBackendConfig {
                    name: prefix.clone(),
                    url: b.url.clone()?,
                    headers: Vec::new(),
                })),
                _ => StdioTransport::new(StdioBackendConfig {
                    name: prefix.clone(),
                    command: b.command.clone()?,
                    args: b.args.clone(),
                    env: HashMap::new(),
                }),
            };
            Some(Backend { prefix, transport })
        })
        .collect();
    if backends.is_empty() {
        info!("no backends configured — router will report degraded until one is added");
    }
    Router::new(backends, Duration::from_secs(config.backend_timeout_secs))
}
