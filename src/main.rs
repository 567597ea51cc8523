use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use paygate::config::{ConfigWatcher, PayGateConfig};
use paygate::AppState;
use tracing::{info, warn};

#[derive(Parser)]
#[command(
    name = "paygate",
    about = "PayGate — monetization gateway for MCP tool backends",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// HTTP listen port
    #[arg(long, env = "PAYGATE_PORT")]
    port: Option<u16>,

    /// Data directory for the key snapshot, config.toml, and logs
    #[arg(long, env = "PAYGATE_DATA_DIR")]
    data_dir: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "PAYGATE_LOG")]
    log: Option<String>,

    /// Admin key for the X-Admin-Key header. Generated ephemerally if unset.
    #[arg(long, env = "PAYGATE_ADMIN_KEY")]
    admin_key: Option<String>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "PAYGATE_LOG_FILE")]
    log_file: Option<std::path::PathBuf>,

    /// Suppress startup banner output.
    #[arg(long, short = 'q', global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Start the gateway server (default when no subcommand is given).
    ///
    /// Examples:
    ///   paygate serve
    ///   paygate
    Serve,
    /// Run diagnostic checks on gateway prerequisites.
    ///
    /// Checks port availability, data directory writability, snapshot file
    /// readability, and configured backend reachability.
    ///
    /// Exit code 0 if all checks pass, 1 if any check fails.
    ///
    /// Examples:
    ///   paygate doctor
    Doctor,
    /// Print the resolved configuration (admin key redacted) and exit.
    ///
    /// Examples:
    ///   paygate config
    Config,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Some(Command::Doctor) => {
            let config = PayGateConfig::new(args.port, args.data_dir, args.log, args.admin_key);
            run_doctor(&config).await
        }
        Some(Command::Config) => {
            let config = PayGateConfig::new(args.port, args.data_dir, args.log, args.admin_key);
            print_config(&config);
            Ok(())
        }
        None | Some(Command::Serve) => {
            run_server(
                args.port,
                args.data_dir,
                args.log,
                args.admin_key,
                args.log_file,
                args.quiet,
            )
            .await
        }
    }
}

async fn run_server(
    port: Option<u16>,
    data_dir: Option<std::path::PathBuf>,
    log: Option<String>,
    admin_key: Option<String>,
    log_file: Option<std::path::PathBuf>,
    quiet: bool,
) -> Result<()> {
    let config = PayGateConfig::new(port, data_dir, log, admin_key);
    let log_path = log_file.or_else(|| Some(config.data_dir.join("paygate.log")));
    let _log_guard = setup_logging(&config.log, log_path.as_deref());

    if !quiet {
        println!("paygate {} — starting on port {}", env!("CARGO_PKG_VERSION"), config.port);
        println!("data dir: {}", config.data_dir.display());
    }

    info!(
        port = config.port,
        data_dir = %config.data_dir.display(),
        backends = config.backends.len(),
        maintenance_mode = config.maintenance_mode,
        shadow_mode = config.shadow_mode,
        "paygate starting"
    );

    let watcher = ConfigWatcher::start(&config.data_dir, &config);
    let port = config.port;
    let hot = watcher
        .as_ref()
        .map(|w| (w.hot.maintenance_mode.clone(), w.hot.shadow_mode.clone()));

    let state = AppState::build_with_hot(config, hot)
        .await
        .context("failed to build application state")?;

    state.start_background_tasks();

    let router_state = state.router.ready().await;
    if router_state.degraded {
        warn!("router is degraded — one or more backends failed to start in time");
    }

    let app = paygate::http::build_router(state.clone());
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!(addr = %addr, "paygate listening");

    let shutdown = shutdown_signal();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("server error")?;

    info!("shutting down — draining backends and flushing snapshot");
    state.shutdown_backends().await;
    state.flush().await;
    drop(watcher);

    Ok(())
}

/// Waits for Ctrl-C (or SIGTERM on unix). A second signal during drain is
/// handled by the OS's default double-signal behavior once this future
/// resolves and axum begins its drain timeout.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

async fn run_doctor(config: &PayGateConfig) -> Result<()> {
    let mut ok = true;

    match tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await {
        Ok(_) => println!("[ok]   port {} is available", config.port),
        Err(e) => {
            println!("[fail] port {} unavailable: {e}", config.port);
            ok = false;
        }
    }

    match tokio::fs::create_dir_all(&config.data_dir).await {
        Ok(()) => println!("[ok]   data dir writable: {}", config.data_dir.display()),
        Err(e) => {
            println!("[fail] data dir not writable: {e}");
            ok = false;
        }
    }

    let snapshot_path = config.data_dir.join("keys.json");
    match tokio::fs::metadata(&snapshot_path).await {
        Ok(_) => match tokio::fs::read_to_string(&snapshot_path).await {
            Ok(contents) => match serde_json::from_str::<serde_json::Value>(&contents) {
                Ok(_) => println!("[ok]   key snapshot is valid JSON"),
                Err(e) => {
                    println!("[warn] key snapshot is not valid JSON (will start empty): {e}");
                }
            },
            Err(e) => {
                println!("[warn] key snapshot unreadable: {e}");
            }
        },
        Err(_) => println!("[info] no key snapshot yet — will be created on first mutation"),
    }

    if config.backends.is_empty() {
        println!("[warn] no backends configured — the router will report degraded");
    } else {
        for backend in &config.backends {
            let prefix = backend.prefix.as_deref().unwrap_or("(default)");
            match backend.kind.as_deref() {
                Some("http") => match &backend.url {
                    Some(url) => println!("[ok]   backend '{prefix}' configured (http {url})"),
                    None => {
                        println!("[fail] backend '{prefix}' is http but has no url");
                        ok = false;
                    }
                },
                _ => match &backend.command {
                    Some(cmd) => println!("[ok]   backend '{prefix}' configured (stdio {cmd})"),
                    None => {
                        println!("[fail] backend '{prefix}' has no command");
                        ok = false;
                    }
                },
            }
        }
    }

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

fn print_config(config: &PayGateConfig) {
    println!("port: {}", config.port);
    println!("data_dir: {}", config.data_dir.display());
    println!("log: {}", config.log);
    println!("admin_key: <redacted>");
    println!("maintenance_mode: {}", config.maintenance_mode);
    println!("shadow_mode: {}", config.shadow_mode);
    println!("max_body_bytes: {}", config.max_body_bytes);
    println!("backend_timeout_secs: {}", config.backend_timeout_secs);
    println!("session_ttl_secs: {}", config.session_ttl_secs);
    println!("ring_capacity: {}", config.ring_capacity);
    println!("backends: {}", config.backends.len());
    println!("default_credits_per_call: {}", config.default_credits_per_call);
}

/// Initialize the tracing subscriber. If `log_file` is set, logs go to both
/// stdout and a daily-rolling file. Returns a `WorkerGuard` that must stay
/// alive for the process lifetime.
///
/// If the log directory cannot be created, falls back to stdout-only
/// logging with a warning — never panics.
fn setup_logging(
    log_level: &str,
    log_file: Option<&std::path::Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    if let Some(path) = log_file {
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let filename = path
            .file_name()
            .unwrap_or_else(|| std::ffi::OsStr::new("paygate.log"));

        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!(
                "warn: could not create log directory '{}': {e} — falling back to stdout",
                dir.display()
            );
            tracing_subscriber::fmt()
                .with_env_filter(log_level)
                .compact()
                .init();
            return None;
        }

        let appender = tracing_appender::rolling::daily(dir, filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(log_level))
            .with(tracing_subscriber::fmt::layer().compact())
            .with(tracing_subscriber::fmt::layer().json().with_writer(non_blocking))
            .init();

        Some(guard)
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(log_level)
            .compact()
            .init();
        None
    }
}
