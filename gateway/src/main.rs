//! gateway – entry point.
//!
//! Startup order:
//! 1. Parse configuration from environment variables.
//! 2. Initialise structured tracing, plus a separate file sink for the
//!    per-request chat transcript log.
//! 3. Load the model registry.
//! 4. Build the worker pool and dispatcher.
//! 5. Build the Axum router and start the HTTP server with graceful shutdown.

mod config;
mod error;
mod routes;
mod schemas;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use gw_pool::{Dispatcher, DispatcherConfig, WorkerProcessOptions};
use gw_types::ModelRegistry;
use tracing::{info, warn};

use crate::config::Config;
use crate::state::AppState;

/// Hidden flags used only when the gateway re-execs itself as a worker
/// process; a normal operator never passes these.
#[derive(Parser, Debug)]
#[command(name = "gateway")]
struct Cli {
    /// Run as a worker process, reading commands on stdin and writing
    /// events on stdout, instead of starting the HTTP server.
    #[arg(long, hide = true)]
    worker_process: bool,

    #[arg(long, hide = true, default_value_t = 1)]
    lru_capacity: usize,

    #[arg(long, hide = true, default_value_t = 0)]
    recycle_after_evictions: u64,

    #[arg(long, hide = true, default_value_t = 0)]
    gpu_layers: u32,

    #[arg(long, hide = true, default_value_t = 60)]
    model_load_timeout_secs: u64,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if cli.worker_process {
        // Runs synchronously on stdin/stdout; never enters the async
        // HTTP-server runtime.
        gw_pool::run_worker_process(WorkerProcessOptions {
            lru_capacity: cli.lru_capacity,
            recycle_after_evictions: cli.recycle_after_evictions,
            gpu_layers: cli.gpu_layers,
            model_load_timeout: Duration::from_secs(cli.model_load_timeout_secs),
        });
        return Ok(());
    }

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run_server())
}

async fn run_server() -> anyhow::Result<()> {
    let cfg = Config::from_env();

    let _chat_log_guard = init_tracing(&cfg);

    info!(version = env!("CARGO_PKG_VERSION"), "gateway starting");

    let registry = ModelRegistry::from_file(&cfg.model_registry_path)
        .map_err(|e| anyhow::anyhow!("failed to load model registry: {e}"))?;
    info!(path = %cfg.model_registry_path.display(), count = registry.list().count(), "model registry loaded");

    let dispatcher_config = DispatcherConfig {
        max_workers: cfg.max_workers,
        max_semaphores: cfg.max_semaphores,
        no_embed: cfg.no_embed,
        lru_capacity: 1,
        recycle_after_evictions: cfg.recycle_after_evictions,
        gpu_layers: cfg.gpu_layers,
        model_load_timeout: cfg.model_load_timeout(),
    };
    let dispatcher = Arc::new(Dispatcher::new(Arc::new(registry), dispatcher_config));
    info!(workers = cfg.max_workers, semaphores = cfg.max_semaphores, "worker pool ready");

    let state = Arc::new(AppState {
        config: Arc::new(cfg.clone()),
        dispatcher,
    });

    let app = routes::build(Arc::clone(&state));
    let addr: SocketAddr = cfg.bind_address.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("gateway stopped");
    Ok(())
}

/// Sets up the default stdout/stderr subscriber plus a non-blocking
/// file writer for the `chat_log` tracing target. The returned guard
/// must be held for the process lifetime or buffered lines are lost.
fn init_tracing(cfg: &Config) -> tracing_appender::non_blocking::WorkerGuard {
    let env_filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => match cfg.log_level.parse::<tracing_subscriber::EnvFilter>() {
            Ok(f) => f,
            Err(e) => {
                eprintln!(
                    "WARN: GATEWAY_LOG_LEVEL='{}' is not a valid tracing filter ({}); falling back to 'info'",
                    cfg.log_level, e
                );
                tracing_subscriber::EnvFilter::new("info")
            }
        },
    };

    use tracing_subscriber::Layer as _;

    let file_appender = tracing_appender::rolling::daily("logs", "chat.log");
    let (chat_writer, guard) = tracing_appender::non_blocking(file_appender);

    let chat_layer = tracing_subscriber::fmt::layer()
        .with_writer(chat_writer)
        .json()
        .with_filter(tracing_subscriber::filter::filter_fn(|meta| meta.target() == "chat_log"));

    let stdout_layer = tracing_subscriber::fmt::layer().with_target(true).with_thread_ids(true);

    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let registry = tracing_subscriber::registry().with(env_filter).with(chat_layer);

    if cfg.log_json {
        registry.with(stdout_layer.json()).init();
    } else {
        registry.with(stdout_layer).init();
    }

    guard
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install CTRL+C signal handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received; starting graceful shutdown");
}
