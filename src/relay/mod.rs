//! Relay hub — the authoritative `address → client` routing table.
//!
//! A single mailbox task owns all mutation of the routing table
//! (register/unregister arrive over channels); readers take a read lock
//! for fan-out lookups. This guarantees no torn updates and exactly one
//! owner per address: a duplicate registration displaces the previous
//! session (its cancel token fires), and unregistration is keyed by
//! `(address, session_id)` so a straggling unregister from a displaced
//! session can never evict its replacement.
//!
//! `route_message` is the relay's entire data plane. It never propagates
//! an error to the sender's transport — every signal travels as a typed
//! envelope (`RateLimited`, `QueueFull`) or a silent drop.

pub mod auth;
pub mod flush;
pub mod limiter;
pub mod server;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::blocklist::BlockStore;
use crate::proto::{self, Envelope, EnvelopeType, Payload};
use crate::queue::{MessageQueue, QueueError};
use limiter::RateLimiter;

/// Capacity of each client's outbound send buffer. A full buffer drops
/// the frame rather than blocking the routing path.
pub const SEND_BUFFER: usize = 256;

/// Advisory wait clients are told to observe after a rate-limit rejection.
const RETRY_AFTER_MS: i64 = 1_000;

// ─── ClientHandle ─────────────────────────────────────────────────────────────

/// Routing-table entry for one authenticated transport session.
#[derive(Clone)]
pub struct ClientHandle {
    /// Relay-assigned address (derived from the proven public key).
    pub address: String,
    /// Unique per transport session; distinguishes a displaced session
    /// from its replacement under the same address.
    pub session_id: u64,
    /// Encoded-envelope bytes destined for this client's write task.
    pub sender: mpsc::Sender<Vec<u8>>,
    /// Fires when the session must die (disconnect, displacement).
    pub cancel: CancellationToken,
    flushing: Arc<AtomicBool>,
}

impl ClientHandle {
    /// While true, `route_message` diverts this client's inbound traffic
    /// to the durable queue so the backlog drains in order.
    pub fn is_flushing(&self) -> bool {
        self.flushing.load(Ordering::Acquire)
    }

    pub fn set_flushing(&self, value: bool) {
        self.flushing.store(value, Ordering::Release);
    }
}

// ─── Hub ──────────────────────────────────────────────────────────────────────

pub struct Hub {
    clients: RwLock<HashMap<String, ClientHandle>>,
    register_tx: mpsc::Sender<ClientHandle>,
    unregister_tx: mpsc::Sender<(String, u64)>,
    queue: Arc<MessageQueue>,
    blocks: BlockStore,
    limiter: Arc<RateLimiter>,
    next_session: AtomicU64,
}

impl Hub {
    /// Build the hub and start its mailbox loop.
    pub fn spawn(
        queue: Arc<MessageQueue>,
        blocks: BlockStore,
        limiter: Arc<RateLimiter>,
    ) -> Arc<Self> {
        let (register_tx, register_rx) = mpsc::channel(64);
        let (unregister_tx, unregister_rx) = mpsc::channel(64);
        let hub = Arc::new(Hub {
            clients: RwLock::new(HashMap::new()),
            register_tx,
            unregister_tx,
            queue,
            blocks,
            limiter,
            next_session: AtomicU64::new(1),
        });
        tokio::spawn(hub_loop(Arc::clone(&hub), register_rx, unregister_rx));
        hub
    }

    /// Create a handle (and the receiving half of its send buffer) for a
    /// freshly authenticated session.
    pub fn make_handle(&self, address: String) -> (ClientHandle, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(SEND_BUFFER);
        let handle = ClientHandle {
            address,
            session_id: self.next_session.fetch_add(1, Ordering::Relaxed),
            sender: tx,
            cancel: CancellationToken::new(),
            flushing: Arc::new(AtomicBool::new(false)),
        };
        (handle, rx)
    }

    /// Enqueue a registration for the mailbox loop.
    pub async fn register(&self, handle: ClientHandle) {
        if self.register_tx.send(handle).await.is_err() {
            warn!("hub mailbox closed — registration dropped");
        }
    }

    /// Enqueue an unregistration, keyed by session identity.
    pub async fn unregister(&self, handle: &ClientHandle) {
        if self
            .unregister_tx
            .send((handle.address.clone(), handle.session_id))
            .await
            .is_err()
        {
            warn!("hub mailbox closed — unregistration dropped");
        }
    }

    /// Number of registered sessions, for the health endpoint.
    pub async fn connection_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Current handle for `address`, if registered.
    pub async fn lookup(&self, address: &str) -> Option<ClientHandle> {
        self.clients.read().await.get(address).cloned()
    }

    // ── Mailbox operations (called only from hub_loop) ────────────────────────

    async fn handle_register(self: &Arc<Self>, handle: ClientHandle) {
        let address = handle.address.clone();

        // Decide on the backlog before the handle becomes routable, so no
        // live frame can slip ahead of the queued drain.
        let pending = match self.queue.count(&address).await {
            Ok(n) => n,
            Err(e) => {
                warn!(addr = %address, err = %e, "queue count failed during register");
                0
            }
        };
        if pending > 0 {
            handle.set_flushing(true);
        }

        let displaced = {
            let mut clients = self.clients.write().await;
            clients.insert(address.clone(), handle.clone())
        };
        if let Some(old) = displaced {
            info!(addr = %address, "duplicate registration — displacing previous session");
            old.cancel.cancel();
        }

        info!(addr = %address, pending, "client registered");

        if pending > 0 {
            let mut status = Envelope::new(
                EnvelopeType::QueueStatus,
                Payload::QueueStatus(proto::QueueStatus {
                    pending_count: pending,
                }),
            );
            status.to_address = address.clone();
            if handle.sender.try_send(proto::encode(&status)).is_err() {
                warn!(addr = %address, "send buffer full at register — queue status dropped");
            }
            tokio::spawn(flush::run(Arc::clone(&self.queue), handle));
        }
    }

    async fn handle_unregister(&self, address: String, session_id: u64) {
        let mut clients = self.clients.write().await;
        match clients.get(&address) {
            Some(current) if current.session_id == session_id => {
                clients.remove(&address);
                drop(clients);
                self.limiter.remove(&address);
                info!(addr = %address, "client unregistered");
            }
            // Either already gone, or the address was re-registered by a
            // newer session — a late unregister must not evict it.
            _ => debug!(addr = %address, session_id, "stale unregister ignored"),
        }
    }

    // ── Data plane ────────────────────────────────────────────────────────────

    /// Route one raw frame from an authenticated sender.
    pub async fn route_message(&self, sender: &ClientHandle, raw: &[u8]) {
        // Rate limit first — before any allocation or decode, so abusive
        // senders are rejected as cheaply as possible.
        if !self.limiter.allow(&sender.address) {
            debug!(addr = %sender.address, "rate limited");
            self.reply(
                sender,
                EnvelopeType::RateLimited,
                Payload::RateLimited(proto::RateLimited {
                    retry_after_ms: RETRY_AFTER_MS,
                    reason: "rate limit exceeded".to_string(),
                }),
            );
            return;
        }

        // Oversized envelopes are dropped without feedback; the transport
        // read cap is 2× this limit so the connection survives.
        if raw.len() > proto::MAX_ENVELOPE_BYTES {
            warn!(addr = %sender.address, len = raw.len(), "oversized envelope dropped");
            return;
        }

        let mut envelope = match proto::decode(raw) {
            Ok(env) => env,
            Err(e) => {
                debug!(addr = %sender.address, err = %e, "undecodable envelope dropped");
                return;
            }
        };

        // Identity normalization: whatever the sender claimed, the routed
        // envelope carries the authenticated address — in the outer frame
        // and in any payload identity field.
        envelope.from_address = sender.address.clone();
        if let Some(payload) = envelope.payload.as_mut() {
            payload.normalize_sender(&sender.address);
        }

        // Block bookkeeping terminates here; it is never routed.
        match &envelope.payload {
            Some(Payload::BlockNotification(b)) => {
                if let Err(e) = self.blocks.block(&sender.address, &b.blocked_address).await {
                    warn!(err = %e, "block update failed");
                }
                return;
            }
            Some(Payload::UnblockNotification(u)) => {
                if let Err(e) = self
                    .blocks
                    .unblock(&sender.address, &u.unblocked_address)
                    .await
                {
                    warn!(err = %e, "unblock update failed");
                }
                return;
            }
            _ => {}
        }

        if envelope.to_address.is_empty() {
            debug!(addr = %sender.address, "envelope without recipient dropped");
            return;
        }
        let to = envelope.to_address.clone();

        match self.blocks.is_blocked(&to, &sender.address).await {
            Ok(false) => {}
            Ok(true) => {
                // Silent: a blocked sender learns nothing.
                debug!(from = %sender.address, "dropping message for blocking pair");
                return;
            }
            Err(e) => {
                warn!(err = %e, "block lookup failed — dropping");
                return;
            }
        }

        let bytes = proto::encode(&envelope);
        let target = self.lookup(&to).await;
        match target {
            Some(client) if !client.is_flushing() => {
                if client.sender.try_send(bytes).is_err() {
                    warn!(addr = %to, "send buffer full — dropping frame");
                }
            }
            // Offline, or online but still draining its backlog: the
            // durable queue preserves total order either way.
            _ => match self.queue.enqueue(&to, &sender.address, &bytes).await {
                Ok(()) => {}
                Err(QueueError::Full(_)) => {
                    debug!(addr = %to, "recipient queue full");
                    self.reply(
                        sender,
                        EnvelopeType::QueueFull,
                        Payload::QueueFull(proto::QueueFull {
                            recipient_address: to,
                            reason: "recipient queue is full".to_string(),
                        }),
                    );
                }
                Err(e) => warn!(addr = %to, err = %e, "enqueue failed — dropping"),
            },
        }
    }

    /// Best-effort typed reply to the sender (never blocks the hub).
    fn reply(&self, sender: &ClientHandle, kind: EnvelopeType, payload: Payload) {
        let mut envelope = Envelope::new(kind, payload);
        envelope.to_address = sender.address.clone();
        if sender.sender.try_send(proto::encode(&envelope)).is_err() {
            debug!(addr = %sender.address, "reply dropped — send buffer full");
        }
    }
}

/// The mailbox loop: sole writer of the routing table.
async fn hub_loop(
    hub: Arc<Hub>,
    mut register_rx: mpsc::Receiver<ClientHandle>,
    mut unregister_rx: mpsc::Receiver<(String, u64)>,
) {
    loop {
        tokio::select! {
            registration = register_rx.recv() => match registration {
                Some(handle) => hub.handle_register(handle).await,
                None => break,
            },
            removal = unregister_rx.recv() => match removal {
                Some((address, session_id)) => hub.handle_unregister(address, session_id).await,
                None => break,
            },
        }
    }
    debug!("hub loop stopped");
}
