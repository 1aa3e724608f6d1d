use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use pinch::blocklist::BlockStore;
use pinch::config::RelayConfig;
use pinch::queue::MessageQueue;
use pinch::relay::limiter::RateLimiter;
use pinch::relay::server::{self, RelayContext};
use pinch::relay::Hub;
use pinch::storage::RelayStorage;

#[derive(Parser)]
#[command(
    name = "pinch-relay",
    about = "Pinch relay — blind router for end-to-end encrypted agent messaging",
    version
)]
struct Args {
    /// WebSocket port (also serves GET /health)
    #[arg(long, env = "PINCH_RELAY_PORT", default_value_t = 8080)]
    port: u16,

    /// Host name clients dial
    #[arg(long, env = "PINCH_RELAY_HOST", default_value = "localhost")]
    host: String,

    /// Host name used in derived addresses and signed during auth
    /// (defaults to --host)
    #[arg(long, env = "PINCH_RELAY_PUBLIC_HOST")]
    public_host: Option<String>,

    /// Path of the shared SQLite database file
    #[arg(long, env = "PINCH_RELAY_DB", default_value = "./pinch-relay.db")]
    db: PathBuf,

    /// Per-recipient cap on undelivered queued messages
    #[arg(long, env = "PINCH_RELAY_QUEUE_MAX", default_value_t = 1000)]
    queue_max: usize,

    /// Queue retention in hours
    #[arg(long, env = "PINCH_RELAY_QUEUE_TTL", default_value_t = 168)]
    queue_ttl_hours: u64,

    /// Sustained per-address rate limit in messages per second
    #[arg(long, env = "PINCH_RELAY_RATE_LIMIT", default_value_t = 1.0)]
    rate_limit: f64,

    /// Per-address burst allowance
    #[arg(long, env = "PINCH_RELAY_RATE_BURST", default_value_t = 10)]
    rate_burst: u32,

    /// "1" disables transport-origin verification (local development only)
    #[arg(long, env = "PINCH_RELAY_DEV", default_value = "")]
    dev: String,

    /// Log level filter, e.g. "debug" or "info,pinch=trace"
    #[arg(long, env = "PINCH_RELAY_LOG", default_value = "info")]
    log: String,
}

impl Args {
    fn into_config(self) -> RelayConfig {
        let public_host = self.public_host.unwrap_or_else(|| self.host.clone());
        RelayConfig {
            port: self.port,
            host: self.host,
            public_host,
            db_path: self.db,
            queue_max: self.queue_max,
            queue_ttl: std::time::Duration::from_secs(self.queue_ttl_hours * 60 * 60),
            rate_limit: self.rate_limit,
            rate_burst: self.rate_burst,
            dev_mode: self.dev == "1",
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&args.log)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = args.into_config();
    info!(
        port = config.port,
        host = %config.public_host,
        db = %config.db_path.display(),
        dev_mode = config.dev_mode,
        "starting pinch relay"
    );
    if config.dev_mode {
        tracing::warn!("dev mode: transport-origin verification is DISABLED");
    }

    // Database and port are fatal: a relay without durable state or a
    // listener is useless.
    let storage = RelayStorage::open(&config.db_path).await?;
    let queue = Arc::new(MessageQueue::new(
        storage.pool(),
        config.queue_max,
        config.queue_ttl,
    ));
    let blocks = BlockStore::new(storage.pool());
    let limiter = Arc::new(RateLimiter::new(config.rate_limit, config.rate_burst));
    let hub = Hub::spawn(Arc::clone(&queue), blocks, limiter);

    let cancel = CancellationToken::new();
    queue.start_sweep(cancel.child_token());

    let listener = TcpListener::bind(config.bind_addr())
        .await
        .with_context(|| format!("binding {}", config.bind_addr()))?;

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown.cancel();
    });

    let ctx = Arc::new(RelayContext { config, hub, cancel });
    server::serve(listener, ctx).await
}

/// Resolves on SIGTERM (Unix) or Ctrl-C.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(_) => {
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}
