use anyhow::Context;
use clap::Parser;
use shellbox::{build_router, DockerRuntime, Workspace, WorkspaceSettings, DEFAULT_HTTP_PORT};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "shellboxd",
    author,
    version,
    about = "Per-user shell sandboxes shared across sessions"
)]
struct Options {
    /// Image every user sandbox runs
    #[arg(long, env = "IMAGE_URL")]
    image: String,
    /// User shells run as inside the sandbox
    #[arg(long, env = "IMAGE_USER")]
    user: String,
    /// Command started for every session
    #[arg(long, env = "IMAGE_CMD")]
    command: String,
    /// Address the HTTP server binds to
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,
    /// Port for the HTTP server
    #[arg(long, default_value_t = DEFAULT_HTTP_PORT, env = "SHELLBOX_PORT")]
    port: u16,
    /// Directory for rolling log files; stdout only when unset
    #[arg(long, env = "SHELLBOX_LOG_DIR")]
    log_dir: Option<PathBuf>,
    /// Maximum shells attached to one user's sandbox
    #[arg(long, default_value_t = 20)]
    max_sessions: usize,
    /// Seconds a sandbox gets to shut down before it is killed
    #[arg(long, default_value_t = 10)]
    stop_grace_secs: u64,
    /// Seconds between retries of failed sandbox stops
    #[arg(long, default_value_t = 30)]
    stop_retry_secs: u64,
    /// Use the image already present on the host
    #[arg(long)]
    skip_pull: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let options = Options::parse();
    let _guard = init_tracing(options.log_dir.as_deref());

    let runtime = DockerRuntime::connect_local().context("failed to connect to docker")?;
    if !options.skip_pull {
        runtime
            .pull_image(&options.image)
            .await
            .with_context(|| format!("failed to pull image {}", options.image))?;
    }

    let settings = WorkspaceSettings::new(&options.image, &options.user, &options.command)
        .with_max_sessions(options.max_sessions)
        .with_stop_grace(Duration::from_secs(options.stop_grace_secs))
        .with_stop_retry_interval(Duration::from_secs(options.stop_retry_secs));
    let workspace = Arc::new(Workspace::new(Arc::new(runtime), settings));

    let shutdown = CancellationToken::new();
    let retry_loop = workspace.spawn_stop_retry_loop(shutdown.clone());
    let app = build_router(workspace, shutdown.clone());

    let addr = SocketAddr::new(parse_bind_ip(&options.bind), options.port);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("shellboxd listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await
        .context("server error")?;

    shutdown.cancel();
    let _ = retry_loop.await;
    tracing::info!("server shut down gracefully");
    Ok(())
}

fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (writer, guard) = log_dir.and_then(open_log_file).unzip();
    let file_layer = writer.map(|writer| {
        tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_target(false)
            .with_ansi(false)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    guard
}

/// Daily rolling log file under `dir`, or `None` when the directory cannot be
/// created.
fn open_log_file(dir: &Path) -> Option<(NonBlocking, WorkerGuard)> {
    match std::fs::create_dir_all(dir) {
        Ok(()) => Some(tracing_appender::non_blocking(
            tracing_appender::rolling::daily(dir, "shellboxd.log"),
        )),
        Err(e) => {
            eprintln!("cannot create log directory {dir:?}: {e}; logging to stdout only");
            None
        }
    }
}

/// Resolves on ctrl-c and cancels every attached session.
async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {error}");
        // Without a signal handler the server only stops when cancelled elsewhere.
        shutdown.cancelled().await;
    }
    tracing::info!("shutdown signal received");
    shutdown.cancel();
}

fn parse_bind_ip(bind: &str) -> IpAddr {
    match bind.parse() {
        Ok(ip) => ip,
        Err(error) => {
            tracing::error!(
                ?error,
                %bind,
                "invalid bind address; defaulting to 0.0.0.0"
            );
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        }
    }
}
