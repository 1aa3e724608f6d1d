//! Pinch client — the agent side of the protocol.
//!
//! [`Pipeline`] holds all protocol logic (encryption, sequencing,
//! confirmations, consent state); this module wraps it with a relay
//! transport: WebSocket connect, the challenge-response auth exchange,
//! a read loop dispatching into the pipeline, and auto-reconnect with
//! exponential backoff plus jitter. An intentional [`PinchClient::close`]
//! latches the cancel token so shutdown never turns into a reconnect
//! storm.

pub mod crypto;
pub mod model;
pub mod pipeline;
pub mod router;
pub mod store;

pub use pipeline::{ClientError, Pipeline, SendOptions};

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context as _, Result};
use futures_util::{SinkExt, StreamExt};
use rand_core::{OsRng, RngCore};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::activity::ActivityLog;
use crate::identity::Keypair;
use crate::proto::{self, Envelope, EnvelopeType, Payload};
use crate::relay::auth;
use store::ClientStore;

type Transport = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Client transport settings.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Relay endpoint, e.g. `ws://relay.example.org:8080`.
    pub relay_url: String,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
}

impl ClientConfig {
    pub fn new(relay_url: impl Into<String>) -> Self {
        ClientConfig {
            relay_url: relay_url.into(),
            reconnect_base: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(60),
        }
    }
}

enum SessionEnd {
    /// Transport dropped — reconnect.
    Disconnected,
    /// The relay refused our identity — retrying is pointless.
    AuthRejected,
}

// ─── PinchClient ──────────────────────────────────────────────────────────────

pub struct PinchClient {
    pipeline: Arc<Pipeline>,
    outbound_tx: mpsc::Sender<Envelope>,
    cancel: CancellationToken,
}

impl PinchClient {
    /// Connect, authenticate, and start the background session loop.
    /// Resolves once the relay has assigned this client its address.
    pub async fn connect(
        config: ClientConfig,
        keypair: Keypair,
        store: ClientStore,
    ) -> Result<Arc<Self>> {
        let activity = ActivityLog::new(store.pool());
        let pipeline = Arc::new(Pipeline::new(keypair, store, activity));
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();

        tokio::spawn(connection_loop(
            config,
            Arc::clone(&pipeline),
            outbound_rx,
            cancel.clone(),
            ready_tx,
        ));

        ready_rx
            .await
            .context("connection task ended before authenticating")??;

        Ok(Arc::new(PinchClient {
            pipeline,
            outbound_tx,
            cancel,
        }))
    }

    /// Relay-assigned address.
    pub fn address(&self) -> String {
        self.pipeline.address()
    }

    /// Direct access to the protocol pipeline (state queries, consent
    /// toggles, activity log).
    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// Encrypt, persist, and ship a message. Returns the message id
    /// immediately; delivery state is observable on the local record.
    pub async fn send_message(
        &self,
        to: &str,
        body: &str,
        opts: SendOptions,
    ) -> Result<String, ClientError> {
        let (message_id, envelope) = self.pipeline.send_message(to, body, opts).await?;
        self.ship(envelope).await;
        Ok(message_id)
    }

    pub async fn request_connection(
        &self,
        to: &str,
        display_name: &str,
        intro: &str,
    ) -> Result<(), ClientError> {
        let envelope = self.pipeline.request_connection(to, display_name, intro).await?;
        self.ship(envelope).await;
        Ok(())
    }

    pub async fn respond_connection(&self, to: &str, accepted: bool) -> Result<(), ClientError> {
        let envelope = self.pipeline.respond_connection(to, accepted, "").await?;
        self.ship(envelope).await;
        Ok(())
    }

    pub async fn revoke_connection(&self, to: &str, reason: &str) -> Result<(), ClientError> {
        let envelope = self.pipeline.revoke_connection(to, reason).await?;
        self.ship(envelope).await;
        Ok(())
    }

    pub async fn block_peer(&self, peer: &str) -> Result<(), ClientError> {
        let envelope = self.pipeline.block_peer(peer).await?;
        self.ship(envelope).await;
        Ok(())
    }

    pub async fn unblock_peer(&self, peer: &str) -> Result<(), ClientError> {
        let envelope = self.pipeline.unblock_peer(peer).await?;
        self.ship(envelope).await;
        Ok(())
    }

    /// Intentional shutdown: stops the session and disables reconnect.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    async fn ship(&self, envelope: Envelope) {
        if self.outbound_tx.send(envelope).await.is_err() {
            warn!("connection task gone — envelope not shipped");
        }
    }
}

impl Drop for PinchClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ─── Connection loop ──────────────────────────────────────────────────────────

async fn connection_loop(
    config: ClientConfig,
    pipeline: Arc<Pipeline>,
    mut outbound_rx: mpsc::Receiver<Envelope>,
    cancel: CancellationToken,
    ready_tx: oneshot::Sender<Result<String>>,
) {
    let mut ready = Some(ready_tx);
    let mut attempt: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return;
        }

        match connect_async(config.relay_url.as_str()).await {
            Ok((ws, _)) => {
                debug!(url = %config.relay_url, "transport connected");
                match run_session(ws, &pipeline, &mut outbound_rx, &cancel, &mut ready).await {
                    SessionEnd::AuthRejected => {
                        warn!("relay rejected authentication — giving up");
                        return;
                    }
                    SessionEnd::Disconnected => {
                        if cancel.is_cancelled() {
                            return;
                        }
                        attempt = 0;
                    }
                }
            }
            Err(e) => {
                debug!(err = %e, "relay connect failed");
                if let Some(tx) = ready.take() {
                    // First connect never came up: surface the error.
                    let _ = tx.send(Err(anyhow!("relay connect failed: {e}")));
                    return;
                }
            }
        }

        let delay = backoff_delay(&config, attempt);
        info!(delay_ms = delay.as_millis() as u64, "reconnecting after delay");
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        attempt = attempt.saturating_add(1);
    }
}

/// `min(base · 2^attempt + jitter, max)` with up to 250 ms of jitter.
fn backoff_delay(config: &ClientConfig, attempt: u32) -> Duration {
    let exp = config
        .reconnect_base
        .saturating_mul(2u32.saturating_pow(attempt.min(16)));
    let jitter = Duration::from_millis(u64::from(OsRng.next_u32() % 250));
    (exp + jitter).min(config.reconnect_max)
}

async fn run_session(
    mut ws: Transport,
    pipeline: &Arc<Pipeline>,
    outbound_rx: &mut mpsc::Receiver<Envelope>,
    cancel: &CancellationToken,
    ready: &mut Option<oneshot::Sender<Result<String>>>,
) -> SessionEnd {
    // ── Auth: challenge → response → result, before anything else ────────────
    let challenge = match read_envelope(&mut ws, auth::HANDSHAKE_TIMEOUT).await {
        Some(env) => match env.payload {
            Some(Payload::AuthChallenge(challenge)) => challenge,
            _ => {
                warn!("expected auth challenge, got something else");
                return SessionEnd::Disconnected;
            }
        },
        None => return SessionEnd::Disconnected,
    };

    let response = auth::respond(pipeline.keypair(), &challenge);
    let mut response_env = Envelope::new(EnvelopeType::AuthResponse, Payload::AuthResponse(response));
    response_env.to_address = challenge.relay_host.clone();
    if ws
        .send(Message::Binary(proto::encode(&response_env)))
        .await
        .is_err()
    {
        return SessionEnd::Disconnected;
    }

    let result = match read_envelope(&mut ws, auth::HANDSHAKE_TIMEOUT).await {
        Some(env) => match env.payload {
            Some(Payload::AuthResult(result)) => result,
            _ => return SessionEnd::Disconnected,
        },
        None => return SessionEnd::Disconnected,
    };
    if !result.success {
        if let Some(tx) = ready.take() {
            let _ = tx.send(Err(anyhow!("auth rejected: {}", result.error_message)));
        }
        return SessionEnd::AuthRejected;
    }

    pipeline.set_address(&result.assigned_address);
    info!(addr = %result.assigned_address, "authenticated with relay");
    if let Some(tx) = ready.take() {
        let _ = tx.send(Ok(result.assigned_address.clone()));
    }

    // ── Steady state ──────────────────────────────────────────────────────────
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = ws.send(Message::Close(None)).await;
                return SessionEnd::Disconnected;
            }

            outbound = outbound_rx.recv() => {
                let Some(mut envelope) = outbound else { return SessionEnd::Disconnected };
                envelope.from_address = pipeline.address();
                if ws.send(Message::Binary(proto::encode(&envelope))).await.is_err() {
                    return SessionEnd::Disconnected;
                }
            }

            frame = ws.next() => {
                match frame {
                    Some(Ok(Message::Binary(bytes))) => {
                        let envelope = match proto::decode(&bytes) {
                            Ok(env) => env,
                            Err(e) => {
                                debug!(err = %e, "undecodable frame from relay");
                                continue;
                            }
                        };
                        let replies = match pipeline.handle_incoming(envelope).await {
                            Ok(replies) => replies,
                            Err(e) => {
                                warn!(err = %e, "inbound handling failed");
                                continue;
                            }
                        };
                        for reply in replies {
                            if ws.send(Message::Binary(proto::encode(&reply))).await.is_err() {
                                return SessionEnd::Disconnected;
                            }
                        }
                    }
                    // Answer server heartbeats promptly — the relay closes
                    // sessions whose pongs go missing.
                    Some(Ok(Message::Ping(data))) => {
                        if ws.send(Message::Pong(data)).await.is_err() {
                            return SessionEnd::Disconnected;
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                        return SessionEnd::Disconnected;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

async fn read_envelope(ws: &mut Transport, limit: Duration) -> Option<Envelope> {
    loop {
        match timeout(limit, ws.next()).await {
            Ok(Some(Ok(Message::Binary(bytes)))) => return proto::decode(&bytes).ok(),
            Ok(Some(Ok(Message::Ping(_)))) | Ok(Some(Ok(Message::Pong(_)))) => continue,
            _ => return None,
        }
    }
}
