use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use trafficgate::config::{GateConfig, SinkKind, StoreBackend};
use trafficgate::http::HttpServer;
use trafficgate::ratelimit::{Clock, RateLimiter, SystemClock};
use trafficgate::store::{InMemoryWindowStore, RedisWindowStore, WindowStore};
use trafficgate::usage::{LogSink, RedisStreamSink, UsageEventPublisher, UsageSink};

/// How long to wait for queued usage events on shutdown.
const PUBLISHER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "trafficgate", version)]
#[command(about = "Sliding-window API quota enforcement backed by a shared store")]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address for the HTTP server
    #[arg(long)]
    http_addr: Option<SocketAddr>,

    /// Admitted requests per window for resources without an override
    #[arg(long)]
    limit: Option<u64>,

    /// Window store backend
    #[arg(long, value_enum)]
    store: Option<StoreArg>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StoreArg {
    Redis,
    Memory,
}

impl From<StoreArg> for StoreBackend {
    fn from(arg: StoreArg) -> Self {
        match arg {
            StoreArg::Redis => StoreBackend::Redis,
            StoreArg::Memory => StoreBackend::Memory,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    info!("Starting trafficgate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = GateConfig::load(args.config.as_deref())?;
    if let Some(addr) = args.http_addr {
        config.server.http_addr = addr;
    }
    if let Some(limit) = args.limit {
        config.rate_limiting.limit_per_window = limit;
    }
    if let Some(store) = args.store {
        config.store.backend = store.into();
    }
    config.validate()?;

    info!(
        http_addr = %config.server.http_addr,
        window_size_seconds = config.rate_limiting.window_size_seconds,
        limit_per_window = config.rate_limiting.limit_per_window,
        mode = ?config.rate_limiting.mode,
        store = ?config.store.backend,
        sink = ?config.usage.sink,
        "Configuration loaded"
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let op_timeout = config.store.op_timeout();

    // Build the window store
    let mut redis_store = None;
    let mut purge_task = None;
    let store: Arc<dyn WindowStore> = match config.store.backend {
        StoreBackend::Redis => {
            let store = RedisWindowStore::connect(&config.store.redis_url, op_timeout).await?;
            redis_store = Some(store.clone());
            Arc::new(store)
        }
        StoreBackend::Memory => {
            warn!("Using the in-memory window store; quotas are enforced per instance only");
            let store = Arc::new(InMemoryWindowStore::new(clock.clone()));
            purge_task = Some(store.clone().spawn_purge_task(config.rate_limiting.window()));
            store
        }
    };

    // Build the usage sink
    let sink: Option<Arc<dyn UsageSink>> = match config.usage.sink {
        SinkKind::Log => Some(Arc::new(LogSink)),
        SinkKind::RedisStream => {
            let connection = match &redis_store {
                Some(store) => store.connection(),
                None => RedisWindowStore::connect(&config.store.redis_url, op_timeout)
                    .await?
                    .connection(),
            };
            Some(Arc::new(RedisStreamSink::new(
                connection,
                &config.usage.stream_key,
                config.usage.stream_max_len,
                op_timeout,
            )))
        }
        SinkKind::Disabled => None,
    };

    let mut rate_limiter = RateLimiter::new(store, config.rate_limiting.clone()).with_clock(clock);
    let mut publisher_handle = None;
    if let Some(sink) = sink {
        let (publisher, handle) = UsageEventPublisher::spawn(
            sink,
            config.usage.queue_capacity,
            config.usage.worker_count,
        );
        rate_limiter = rate_limiter.with_publisher(publisher);
        publisher_handle = Some(handle);
    }
    info!("Rate limiter initialized");

    let server = HttpServer::new(config.server.http_addr, Arc::new(rate_limiter));
    server.serve_with_shutdown(shutdown_signal()).await?;

    // The server owned the last limiter, so the publisher queue is now closed.
    if let Some(handle) = publisher_handle {
        if tokio::time::timeout(PUBLISHER_DRAIN_TIMEOUT, handle.join())
            .await
            .is_err()
        {
            warn!("Timed out draining usage events");
        }
    }
    if let Some(task) = purge_task {
        task.abort();
    }

    info!("trafficgate stopped");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
