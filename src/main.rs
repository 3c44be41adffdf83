use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use webreactor::config::{clamp_connections, normalize_port};
use webreactor::metrics;
use webreactor::reactor::TriggerMode;
use webreactor::signals;
use webreactor::users::UserPool;
use webreactor::{Dispatcher, ServerConfig};

const METRICS_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(about = "Epoll-driven static file HTTP server")]
struct Args {
    /// `KEY: VALUE` config file; flags below override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on (below 1024 falls back to 5678)
    #[arg(short, long)]
    port: Option<u32>,

    /// Document root
    #[arg(short, long)]
    root: Option<PathBuf>,

    /// 0: LT/LT, 1: LT listener + ET conns, 2: ET listener + LT conns, 3: ET/ET
    #[arg(short, long)]
    trigmode: Option<u8>,

    /// Idle timeout in milliseconds, 0 disables eviction
    #[arg(long)]
    timeout: Option<u64>,

    /// Worker threads
    #[arg(long)]
    threads: Option<usize>,

    /// Connection ceiling
    #[arg(long)]
    max_conns: Option<usize>,

    /// Enable SO_LINGER on the listening socket
    #[arg(long)]
    linger: bool,

    /// Log filter (overridden by RUST_LOG)
    #[arg(short, long)]
    log_level: Option<String>,
}

fn load_config(args: &Args) -> Result<ServerConfig> {
    let mut config = match &args.config {
        Some(path) => ServerConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ServerConfig::default(),
    };
    if let Some(port) = args.port {
        config.port = normalize_port(port);
    }
    if let Some(root) = &args.root {
        config.root = root.clone();
    }
    if let Some(code) = args.trigmode {
        config.trigger = TriggerMode::from_code(code);
    }
    if let Some(ms) = args.timeout {
        config.timeout = Duration::from_millis(ms);
    }
    if let Some(n) = args.threads {
        config.workers = n.max(1);
    }
    if let Some(n) = args.max_conns {
        config.max_connections = clamp_connections(n);
    }
    if args.linger {
        config.open_linger = true;
    }
    if let Some(level) = &args.log_level {
        config.log_level = level.clone();
    }
    Ok(config)
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .init();
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    init_tracing(&config.log_level);

    info!(
        log_level = %config.log_level,
        log_size = config.log_size,
        store_url = %config.store.url,
        store_schema = %config.store.schema,
        store_pool = config.store.pool_size,
        "webreactor: starting"
    );
    if !config.root.is_dir() {
        error!(root = %config.root.display(), "document root is not a directory");
    }

    // Before any thread exists, so only the listener ever sees the signals.
    signals::block_termination().context("cannot mask termination signals")?;
    let users = Arc::new(UserPool::in_memory(config.store.pool_size));
    let mut server = Dispatcher::new(&config, Some(Arc::clone(&users)))
        .context("server setup failed")?;
    signals::spawn_listener(server.shutdown_handle()).context("cannot start signal listener")?;
    metrics::spawn_reporter(METRICS_INTERVAL);

    let result = server.run();
    drop(server);
    users.close();
    result.context("event loop failed")
}
