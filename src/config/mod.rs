//! Relay configuration.
//!
//! Every knob maps to a `PINCH_RELAY_*` environment variable (clap wires
//! the mapping in the binary). Priority: CLI flag > env var > built-in
//! default.

use std::path::PathBuf;
use std::time::Duration;

use crate::queue;
use crate::relay::limiter;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_DB_PATH: &str = "./pinch-relay.db";

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// TCP port the relay binds (all interfaces).
    pub port: u16,
    /// Host name clients dial.
    pub host: String,
    /// Host name embedded in derived addresses and signed during auth.
    /// Falls back to `host` when not set explicitly.
    pub public_host: String,
    /// Path of the shared SQLite file (queue + block store).
    pub db_path: PathBuf,
    /// Per-recipient cap on undelivered queued messages.
    pub queue_max: usize,
    /// Retention for undelivered queued messages.
    pub queue_ttl: Duration,
    /// Sustained per-address rate in messages per second.
    pub rate_limit: f64,
    /// Per-address burst allowance.
    pub rate_burst: u32,
    /// Disables transport-origin verification. Local development only.
    pub dev_mode: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            port: DEFAULT_PORT,
            host: DEFAULT_HOST.to_string(),
            public_host: DEFAULT_HOST.to_string(),
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            queue_max: queue::DEFAULT_MAX_PER_AGENT,
            queue_ttl: queue::DEFAULT_TTL,
            rate_limit: limiter::DEFAULT_RATE,
            rate_burst: limiter::DEFAULT_BURST,
            dev_mode: false,
        }
    }
}

impl RelayConfig {
    /// Socket address string for the listener.
    pub fn bind_addr(&self) -> String {
        format!("0.0.0.0:{}", self.port)
    }
}
