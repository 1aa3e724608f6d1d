//! Shared harness for integration tests: an in-process relay on an
//! ephemeral port and PinchClient agents backed by scratch databases.
#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use pinch::blocklist::BlockStore;
use pinch::client::store::ClientStore;
use pinch::client::{ClientConfig, PinchClient};
use pinch::config::RelayConfig;
use pinch::identity::Keypair;
use pinch::queue::MessageQueue;
use pinch::relay::limiter::RateLimiter;
use pinch::relay::server::{self, RelayContext};
use pinch::relay::Hub;
use pinch::storage::RelayStorage;

pub struct RelayHarness {
    pub addr: SocketAddr,
    pub url: String,
    pub ctx: Arc<RelayContext>,
    pub cancel: CancellationToken,
    _dir: tempfile::TempDir,
}

impl Drop for RelayHarness {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Start a relay on 127.0.0.1:0 with `tweak` applied to the default
/// config (db path and public host are pre-set for tests).
pub async fn spawn_relay(tweak: impl FnOnce(&mut RelayConfig)) -> RelayHarness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = RelayConfig {
        public_host: "127.0.0.1".to_string(),
        db_path: dir.path().join("relay.db"),
        ..RelayConfig::default()
    };
    tweak(&mut config);

    let storage = RelayStorage::open(&config.db_path).await.unwrap();
    let queue = Arc::new(MessageQueue::new(
        storage.pool(),
        config.queue_max,
        config.queue_ttl,
    ));
    let blocks = BlockStore::new(storage.pool());
    let limiter = Arc::new(RateLimiter::new(config.rate_limit, config.rate_burst));
    let hub = Hub::spawn(Arc::clone(&queue), blocks, limiter);

    let cancel = CancellationToken::new();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let ctx = Arc::new(RelayContext {
        config,
        hub,
        cancel: cancel.clone(),
    });
    tokio::spawn(server::serve(listener, Arc::clone(&ctx)));

    RelayHarness {
        addr,
        url: format!("ws://{addr}"),
        ctx,
        cancel,
        _dir: dir,
    }
}

pub struct TestAgent {
    pub client: Arc<PinchClient>,
    pub keypair: Keypair,
    pub db_path: PathBuf,
    _dir: tempfile::TempDir,
}

impl TestAgent {
    pub fn address(&self) -> String {
        self.client.address()
    }
}

/// Connect a fresh agent (new keypair, new client database).
pub async fn connect_agent(relay_url: &str) -> TestAgent {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("client.db");
    let keypair = Keypair::generate();
    let store = ClientStore::open(&db_path).await.unwrap();
    let client = PinchClient::connect(ClientConfig::new(relay_url), keypair.clone(), store)
        .await
        .unwrap();
    TestAgent {
        client,
        keypair,
        db_path,
        _dir: dir,
    }
}

/// Reconnect with an existing identity and database — same address,
/// same sequence counters, same message history.
pub async fn reconnect_agent(relay_url: &str, agent: &TestAgent) -> Arc<PinchClient> {
    let store = ClientStore::open(&agent.db_path).await.unwrap();
    PinchClient::connect(ClientConfig::new(relay_url), agent.keypair.clone(), store)
        .await
        .unwrap()
}

/// Poll `check` until it returns true, or panic after ~5 s.
pub async fn wait_until<F, Fut>(what: &str, check: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}
