//! qcon - emulator controller
//!
//! Launches hardware-emulator instances on request, keeps them alive while
//! clients ping them, and relays their device and display WebSockets.

use clap::Parser as ClapParser;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use qcon::{
    allocator::PortAllocator,
    api,
    config::{ConfigError, ControllerConfig, EmulatorSettings},
    privileges::{self, PrivilegeError},
    registry::EmulatorRegistry,
    tls::{self, TlsError},
    watchdog::IdleWatchdog,
};

/// How long in-flight requests get to finish after a shutdown signal.
const SERVER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Instances allowed per CPU when no fixed limit is configured.
const INSTANCES_PER_CPU: usize = 12;

/// qcon - emulator controller
///
/// Every option can also be set through the environment variable shown.
#[derive(ClapParser, Debug)]
#[command(name = "qcon", version, about, long_about = None)]
struct Cli {
    /// Address to bind the HTTP/WebSocket API server
    #[arg(long, env = "QCON_HOST", default_value = "0.0.0.0")]
    host: IpAddr,

    /// Port to bind the HTTP/WebSocket API server
    #[arg(long, env = "QCON_PORT", default_value_t = 5001)]
    port: u16,

    /// Value launch requests must send in their `authorization` header
    #[arg(long, env = "LAUNCH_AUTH_HEADER", default_value = "secret", hide_env_values = true)]
    launch_secret: String,

    /// Maximum concurrent emulators (default: 12 per CPU)
    #[arg(long, env = "EMULATOR_FIXED_LIMIT")]
    limit: Option<usize>,

    /// Working directory for the emulator process
    #[arg(long, env = "QEMU_DIR")]
    qemu_dir: PathBuf,

    /// Emulator executable
    #[arg(long, env = "QEMU_BIN", default_value = "qemu-system-arm")]
    qemu_bin: PathBuf,

    /// Root of the firmware images: <root>/<platform>/qemu/
    #[arg(long, env = "QEMU_IMAGE_ROOT")]
    image_root: PathBuf,

    /// Companion JavaScript runtime executable
    #[arg(long, env = "PKJS_BIN", default_value = "pypkjs")]
    pkjs_bin: PathBuf,

    /// Stop the runtime from reaching private network addresses
    #[arg(long, env = "BLOCK_PRIVATE_ADDRESSES")]
    block_private_addresses: bool,

    /// Directory holding server-cert.pem and server-key.pem; enables TLS
    #[arg(long, env = "SSL_ROOT")]
    ssl_root: Option<PathBuf>,

    /// Account to switch to after binding when started as root
    #[arg(long, env = "RUN_AS_USER")]
    run_as_user: Option<String>,

    /// TOML file with boot and watchdog timing overrides
    #[arg(long, env = "QCON_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Error, Debug)]
pub enum QconError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("tls error: {0}")]
    Tls(#[from] TlsError),

    #[error("privilege drop failed: {0}")]
    Privileges(#[from] PrivilegeError),

    #[error("task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> Result<(), QconError> {
    let cli = Cli::parse();
    init_tracing();
    run_server(cli).await
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "qcon=debug,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_controller_config(path: Option<&PathBuf>) -> Result<ControllerConfig, QconError> {
    let Some(path) = path else {
        return Ok(ControllerConfig::default());
    };
    match ControllerConfig::load(path)? {
        Some(config) => {
            tracing::info!(path = %path.display(), "loaded controller config");
            Ok(config)
        }
        None => {
            tracing::warn!(path = %path.display(), "config file not found, using defaults");
            Ok(ControllerConfig::default())
        }
    }
}

fn default_limit() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        * INSTANCES_PER_CPU
}

async fn run_server(cli: Cli) -> Result<(), QconError> {
    tracing::info!("qcon starting");

    let controller = load_controller_config(cli.config.as_ref())?;
    let limit = cli.limit.unwrap_or_else(default_limit);
    tracing::info!(limit, "emulator limit");

    let settings = Arc::new(EmulatorSettings {
        qemu_bin: cli.qemu_bin,
        qemu_dir: cli.qemu_dir,
        image_root: cli.image_root,
        pkjs_bin: cli.pkjs_bin,
        block_private_addresses: cli.block_private_addresses,
        timing: controller.boot.clone(),
    });
    let registry = EmulatorRegistry::new(limit, PortAllocator::new(), settings);
    let app = api::router(api::AppState::new(registry.clone(), cli.launch_secret));

    let acceptor = match &cli.ssl_root {
        Some(root) => {
            let (cert, key) = tls::ssl_root_paths(root);
            Some(tls::load_tls_config(&cert, &key)?)
        }
        None => None,
    };

    let bind = SocketAddr::new(cli.host, cli.port);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(addr = %bind, tls = acceptor.is_some(), "HTTP/WS server listening");

    if let Some(user) = &cli.run_as_user {
        privileges::drop_privileges(user)?;
    }
    if let Some(user) = privileges::current_user() {
        tracing::info!(user = %user, "running as");
    }

    let cancel = CancellationToken::new();
    let watchdog =
        IdleWatchdog::from_timing(registry.clone(), &controller.watchdog).supervise(cancel.clone());

    let server_cancel = cancel.clone();
    let http_handle = tokio::spawn(async move {
        match acceptor {
            Some(acceptor) => {
                tls::serve_tls(listener, acceptor, app, server_cancel).await;
                Ok(())
            }
            None => {
                axum::serve(listener, app)
                    .with_graceful_shutdown(async move { server_cancel.cancelled().await })
                    .await
            }
        }
    });

    tracing::info!("qcon ready");
    shutdown_signal().await;

    // Stop reaping and accepting, then take every instance down.
    cancel.cancel();
    watchdog.await?;
    match tokio::time::timeout(SERVER_STOP_TIMEOUT, http_handle).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => tracing::error!(?e, "HTTP server error"),
        Ok(Err(e)) => tracing::warn!(?e, "HTTP server task panicked"),
        Err(_) => tracing::warn!("HTTP server did not stop in time"),
    }
    registry.drain().await;

    tracing::info!("qcon exiting");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(?e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(?e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl+C"),
        _ = terminate => tracing::info!("received SIGTERM"),
    }
}
