use clap::Parser;
use connpool::config::Config;
use connpool::{ConnPool, PoolError, PoolOptions, Result};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{interval, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[cfg(feature = "fast-allocator")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "connpool")]
#[command(about = "Drive a TCP connection pool against a target and report its statistics", long_about = None)]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Target address, host:port (overrides config)
    #[arg(long)]
    target: Option<String>,

    /// Concurrent workers (overrides config)
    #[arg(long)]
    workers: Option<usize>,

    /// Run time in seconds (overrides config)
    #[arg(long)]
    duration_secs: Option<u64>,

    /// Generate example configuration file
    #[arg(long, value_name = "FILE")]
    generate_config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides config
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle config generation
    if let Some(config_path) = args.generate_config {
        println!("Generating example configuration file: {:?}", config_path);
        Config::create_example(&config_path)?;
        println!("Example configuration file created successfully!");
        println!("Edit the file and run: connpool --config {:?}", config_path);
        return Ok(());
    }

    let mut config = match &args.config {
        Some(config_path) => Config::from_file(config_path)?,
        None => Config::default(),
    };

    // Apply CLI overrides
    if let Some(target) = args.target {
        config.target.address = target;
    }
    if let Some(workers) = args.workers {
        config.load.workers = workers;
    }
    if let Some(duration_secs) = args.duration_secs {
        config.load.duration_secs = duration_secs;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    config.validate()?;

    init_logging(&config.logging.level, &config.logging.format)?;

    info!("connpool v{} starting", env!("CARGO_PKG_VERSION"));
    match &args.config {
        Some(path) => info!("Loaded configuration from: {:?}", path),
        None => info!("No configuration file specified, using defaults"),
    }

    #[cfg(feature = "metrics")]
    connpool::pool::metrics::init();

    let pool = ConnPool::new(config.pool.apply(tcp_options(&config))?);
    info!(
        "Pool ready: target={}, pool_size={}, min_idle={}",
        config.target.address, config.pool.pool_size, config.pool.min_idle_conns
    );

    let shutdown = CancellationToken::new();
    let ctrl_c = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl+C, shutting down gracefully...");
                shutdown.cancel();
            }
        })
    };

    run_load(&pool, &config, &shutdown).await;
    ctrl_c.abort();

    let stats = pool.stats();
    match serde_json::to_string_pretty(&stats) {
        Ok(json) => println!("{}", json),
        Err(e) => warn!("Failed to serialize pool stats: {}", e),
    }

    if let Err(e) = pool.close() {
        error!("Error while closing pool: {}", e);
    }
    info!("Shutdown complete");

    Ok(())
}

fn tcp_options(config: &Config) -> PoolOptions<TcpStream> {
    let address = Arc::new(config.target.address.clone());
    let connect_timeout = Duration::from_millis(config.target.connect_timeout_ms);

    PoolOptions::with_dialer(move |cancel: CancellationToken| {
        let address = Arc::clone(&address);
        async move {
            tokio::select! {
                _ = cancel.cancelled() => Err(std::io::Error::new(
                    std::io::ErrorKind::Interrupted,
                    "dial cancelled",
                )),
                connected = timeout(connect_timeout, TcpStream::connect(address.as_str())) => {
                    match connected {
                        Ok(result) => result,
                        Err(_) => Err(std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            format!("Connection to {} timed out after {:?}", address, connect_timeout),
                        )),
                    }
                }
            }
        }
    })
    .on_close(|conn| debug!("Closing connection {}", conn.id()))
}

/// Run `workers` get/hold/put loops until the configured duration elapses or
/// `shutdown` fires, logging pool stats once per second.
async fn run_load(pool: &ConnPool<TcpStream>, config: &Config, shutdown: &CancellationToken) {
    let deadline = Instant::now() + Duration::from_secs(config.load.duration_secs);
    let hold = Duration::from_millis(config.load.hold_ms);
    let failures = Arc::new(AtomicU64::new(0));

    let mut workers = Vec::with_capacity(config.load.workers);
    for worker in 0..config.load.workers {
        let pool = pool.clone();
        let shutdown = shutdown.clone();
        let failures = Arc::clone(&failures);

        workers.push(tokio::spawn(async move {
            while Instant::now() < deadline && !shutdown.is_cancelled() {
                match pool.get(&shutdown).await {
                    Ok(conn) => {
                        tokio::time::sleep(hold).await;
                        if let Err(e) = pool.put(conn) {
                            debug!("Worker {} failed to return connection: {}", worker, e);
                        }
                    }
                    Err(PoolError::Cancelled) | Err(PoolError::Closed) => break,
                    Err(e) => {
                        failures.fetch_add(1, Ordering::Relaxed);
                        debug!("Worker {} get failed: {}", worker, e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }));
    }

    let mut ticker = interval(Duration::from_secs(1));
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep_until(deadline) => break,
            _ = ticker.tick() => {
                let stats = pool.stats();
                info!(
                    "hits={} misses={} timeouts={} total={} idle={} stale={} failures={}",
                    stats.hits,
                    stats.misses,
                    stats.timeouts,
                    stats.total_conns,
                    stats.idle_conns,
                    stats.stale_conns,
                    failures.load(Ordering::Relaxed)
                );
            }
        }
    }

    for handle in futures::future::join_all(workers).await {
        if let Err(e) = handle {
            error!("Worker task failed: {}", e);
        }
    }
}

fn init_logging(level: &str, format: &str) -> Result<()> {
    let env_filter = EnvFilter::try_new(level)
        .map_err(|e| PoolError::Config(format!("Invalid log level: {}", e)))?;

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }

    Ok(())
}
