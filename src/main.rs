use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::{info, warn};
use unbound_daemon::{
    auth,
    config::DaemonConfig,
    ipc::event::EventBroadcaster,
    relay,
    ring::RingRegistry,
    session::SessionManager,
    storage::Storage,
    AppContext,
};

#[derive(Parser)]
#[command(name = "unboundd", about = "Unbound daemon — always-on background session host", version)]
struct Args {
    /// Data directory for sessions, config, and SQLite database.
    #[arg(long, env = "UNBOUND_DATA_DIR")]
    data_dir: Option<std::path::PathBuf>,

    /// Path to the Unix domain socket the RPC clients connect to.
    #[arg(long, env = "UNBOUND_SOCKET_PATH")]
    socket_path: Option<std::path::PathBuf>,

    /// Path to the Unix domain socket used for local side-effect-frame publishing.
    #[arg(long, env = "UNBOUND_RELAY_SOCKET_PATH")]
    relay_socket_path: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "UNBOUND_LOG")]
    log: Option<String>,

    /// Maximum concurrent sessions (0 = unlimited).
    #[arg(long, env = "UNBOUND_MAX_SESSIONS")]
    max_sessions: Option<usize>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "UNBOUND_LOG_FILE")]
    log_file: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = args.log.clone().unwrap_or_else(|| "info".to_string());
    let _file_guard = setup_logging(&log_level, args.log_file.as_deref());

    run_server(
        args.data_dir,
        args.socket_path,
        args.relay_socket_path,
        args.log,
        args.max_sessions,
    )
    .await
}

/// Initialize the tracing subscriber.
///
/// If `log_file` is set, logs go to both stdout and a daily-rolling file.
/// Returns a `WorkerGuard` that must stay alive for the process lifetime.
/// Falls back to stdout-only logging if the log directory cannot be created.
fn setup_logging(
    log_level: &str,
    log_file: Option<&std::path::Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    if let Some(path) = log_file {
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let filename = path.file_name().unwrap_or_else(|| std::ffi::OsStr::new("unboundd.log"));

        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!(
                "warn: could not create log directory '{}': {e} — falling back to stdout",
                dir.display()
            );
            tracing_subscriber::fmt().with_env_filter(log_level.to_string()).compact().init();
            return None;
        }

        let appender = tracing_appender::rolling::daily(dir, filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(log_level.to_string()))
            .with(tracing_subscriber::fmt::layer().compact())
            .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
            .init();

        Some(guard)
    } else {
        tracing_subscriber::fmt().with_env_filter(log_level.to_string()).compact().init();
        None
    }
}

async fn run_server(
    data_dir: Option<std::path::PathBuf>,
    socket_path: Option<std::path::PathBuf>,
    relay_socket_path: Option<std::path::PathBuf>,
    log: Option<String>,
    max_sessions: Option<usize>,
) -> Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "unboundd starting");

    let config = Arc::new(DaemonConfig::new(data_dir, socket_path, relay_socket_path, log, max_sessions));
    info!(
        data_dir = %config.data_dir.display(),
        socket_path = %config.socket_path.display(),
        max_sessions = config.max_sessions,
        "config loaded"
    );

    // ── Provider CLI availability check ────────────────────────────────────
    let available = std::process::Command::new("claude")
        .arg("--version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .is_ok();
    if available {
        info!("claude CLI found on PATH");
    } else {
        warn!("claude CLI not found on PATH — sessions will fail to start a turn");
    }

    let storage = Arc::new(Storage::new(&config.data_dir).await?);

    let recovered = storage.recover_stale_sessions().await.unwrap_or(0);
    if recovered > 0 {
        info!(count = recovered, "recovered stale sessions from previous run");
    }

    // ── DB pruning + vacuum (daily) ─────────────────────────────────────────
    {
        let storage = storage.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(60 * 60)).await;
            loop {
                if let Err(e) = storage.vacuum().await {
                    warn!(err = %e, "sqlite vacuum failed");
                }
                tokio::time::sleep(std::time::Duration::from_secs(24 * 60 * 60)).await;
            }
        });
    }

    let broadcaster = Arc::new(EventBroadcaster::new());
    let ring_registry = Arc::new(RingRegistry::new());
    let session_manager = Arc::new(SessionManager::new(
        storage.clone(),
        broadcaster.clone(),
        ring_registry.clone(),
    ));

    let auth_token = match auth::get_or_create_token(&config.data_dir) {
        Ok(t) => {
            info!("auth token ready");
            t
        }
        Err(e) => {
            eprintln!("FATAL: failed to generate auth token: {e:#}");
            std::process::exit(1);
        }
    };

    let ctx = Arc::new(AppContext {
        config: config.clone(),
        storage,
        broadcaster,
        session_manager,
        ring_registry,
        started_at: std::time::Instant::now(),
        auth_token,
        shutdown: Arc::new(tokio::sync::Notify::new()),
    });

    relay::spawn(config, ctx.clone());

    unbound_daemon::ipc::run(ctx).await
}
