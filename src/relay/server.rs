//! Relay transport server.
//!
//! One TCP port carries both WebSocket upgrades (every frame a binary
//! [`Envelope`]) and a plain HTTP `GET /health` probe, distinguished by
//! peeking the request line. Each accepted session is authenticated with
//! the challenge-response handshake before it touches the hub; after
//! registration a session runs a read loop (this task) and a write task
//! that also drives server-side heartbeats.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async_with_config, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::auth::{self, Challenge};
use super::{ClientHandle, Hub};
use crate::config::RelayConfig;
use crate::identity;
use crate::proto::{self, Envelope, EnvelopeType, Payload};

/// Server → client ping cadence.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);
/// Grace period for the matching pong.
const PONG_TIMEOUT: Duration = Duration::from_secs(7);
/// A session with no inbound frame for this long is closed.
const READ_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
/// Budget for any single outbound write.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared server state handed to every connection task.
pub struct RelayContext {
    pub config: RelayConfig,
    pub hub: Arc<Hub>,
    /// Fires on process shutdown; stops the accept loop.
    pub cancel: CancellationToken,
}

/// Accept loop. Runs until `ctx.cancel` fires or the listener dies.
pub async fn serve(listener: TcpListener, ctx: Arc<RelayContext>) -> Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, host = %ctx.config.public_host, "relay listening");

    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => {
                info!("shutdown signal — stopping accept loop");
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(err = %e, "accept error");
                        continue;
                    }
                };
                debug!(%peer, "new connection");
                let ctx = Arc::clone(&ctx);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, peer, ctx).await {
                        debug!(%peer, err = %e, "connection ended with error");
                    }
                });
            }
        }
    }
    info!("relay stopped");
    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    peer: std::net::SocketAddr,
    ctx: Arc<RelayContext>,
) -> Result<()> {
    // Health probes share the port. Peek exactly "GET /health " (trailing
    // space guards against look-alike paths) and answer without upgrading.
    let mut peek_buf = [0u8; 12];
    let n = stream.peek(&mut peek_buf).await.unwrap_or(0);
    if n >= 12 && &peek_buf[..12] == b"GET /health " {
        return handle_health(stream, peer, &ctx).await;
    }

    let ws_config = WebSocketConfig {
        // 2× the application envelope limit: oversized envelopes are
        // dropped silently in route_message instead of killing the
        // transport here.
        max_message_size: Some(2 * proto::MAX_ENVELOPE_BYTES),
        max_frame_size: Some(2 * proto::MAX_ENVELOPE_BYTES),
        ..Default::default()
    };

    let dev_mode = ctx.config.dev_mode;
    let public_host = ctx.config.public_host.clone();
    let callback = move |request: &Request, response: Response| {
        check_origin(request, dev_mode, &public_host).map(|()| response)
    };
    let mut ws = accept_hdr_async_with_config(stream, callback, Some(ws_config)).await?;

    // Nothing flows until the session proves a key.
    let Some(address) = authenticate(&mut ws, &ctx).await else {
        return Ok(());
    };

    let (handle, out_rx) = ctx.hub.make_handle(address.clone());
    ctx.hub.register(handle.clone()).await;

    let (sink, stream) = ws.split();
    let last_pong = Arc::new(Mutex::new(Instant::now()));

    let writer = tokio::spawn(write_loop(sink, out_rx, handle.clone(), Arc::clone(&last_pong)));
    read_loop(stream, &handle, &ctx, &last_pong).await;

    // Read side done: tear the session down and inform the hub. A late
    // unregister after displacement is harmless — it is session-keyed.
    handle.cancel.cancel();
    ctx.hub.unregister(&handle).await;
    writer.abort();
    debug!(addr = %address, "session closed");
    Ok(())
}

// ─── Origin gate ──────────────────────────────────────────────────────────────

/// Browser cross-site WebSocket protection: a request carrying an Origin
/// header must originate from the relay's own host. Native agent clients
/// send no Origin and pass untouched. `PINCH_RELAY_DEV=1` disables the
/// check for local development.
fn check_origin(request: &Request, dev_mode: bool, public_host: &str) -> Result<(), ErrorResponse> {
    if dev_mode {
        return Ok(());
    }
    let Some(origin) = request.headers().get("Origin") else {
        return Ok(());
    };
    let origin = origin.to_str().unwrap_or_default();
    let origin_host = origin
        .strip_prefix("https://")
        .or_else(|| origin.strip_prefix("http://"))
        .unwrap_or(origin)
        .split([':', '/'])
        .next()
        .unwrap_or_default();

    if origin_host == public_host {
        return Ok(());
    }
    warn!(origin, "rejecting cross-origin upgrade");
    let mut response = ErrorResponse::new(None);
    *response.status_mut() = StatusCode::FORBIDDEN;
    Err(response)
}

// ─── Health ───────────────────────────────────────────────────────────────────

/// Answer `GET /health` with task and connection counts. Loopback only.
async fn handle_health(
    mut stream: TcpStream,
    peer: std::net::SocketAddr,
    ctx: &RelayContext,
) -> Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut req_buf = [0u8; 256];
    let _ = stream.read(&mut req_buf).await;

    let (status, body) = if peer.ip().is_loopback() {
        let tasks = tokio::runtime::Handle::current().metrics().num_alive_tasks();
        let connections = ctx.hub.connection_count().await;
        (
            "200 OK",
            serde_json::json!({ "tasks": tasks, "connections": connections }).to_string(),
        )
    } else {
        ("403 Forbidden", String::new())
    };

    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len(),
    );
    stream.write_all(response.as_bytes()).await?;
    Ok(())
}

// ─── Authentication driver ────────────────────────────────────────────────────

/// Run the relay side of the challenge-response handshake.
/// Returns the assigned address on success; on any failure the client has
/// been told why (where protocol-safe) and the connection closed.
async fn authenticate(ws: &mut WebSocketStream<TcpStream>, ctx: &RelayContext) -> Option<String> {
    let relay_host = ctx.config.public_host.clone();
    let challenge = Challenge::issue(&relay_host);

    let challenge_env = Envelope::new(
        EnvelopeType::AuthChallenge,
        Payload::AuthChallenge(challenge.to_payload()),
    );
    let sent = timeout(
        auth::HANDSHAKE_TIMEOUT,
        ws.send(Message::Binary(proto::encode(&challenge_env))),
    )
    .await;
    if !matches!(sent, Ok(Ok(()))) {
        debug!("failed to deliver auth challenge");
        return None;
    }

    let bytes = match timeout(auth::HANDSHAKE_TIMEOUT, ws.next()).await {
        Err(_) => {
            reject(ws, "authentication timed out", CloseCode::Policy).await;
            return None;
        }
        Ok(None) | Ok(Some(Err(_))) => return None,
        Ok(Some(Ok(Message::Binary(bytes)))) => bytes,
        Ok(Some(Ok(_))) => {
            reject(ws, "expected a binary auth response", CloseCode::Protocol).await;
            return None;
        }
    };

    let envelope = match proto::decode(&bytes) {
        Ok(env) => env,
        Err(_) => {
            reject(ws, "malformed auth envelope", CloseCode::Protocol).await;
            return None;
        }
    };
    let response = match envelope.payload {
        Some(Payload::AuthResponse(response))
            if envelope.r#type == EnvelopeType::AuthResponse as i32 =>
        {
            response
        }
        _ => {
            reject(ws, "expected an auth response", CloseCode::Protocol).await;
            return None;
        }
    };

    let verifying = match challenge.verify(&response, proto::now_ms()) {
        Ok(key) => key,
        Err(e) => {
            reject(ws, &e.to_string(), CloseCode::Policy).await;
            return None;
        }
    };

    let address = identity::derive_address(&verifying, &relay_host);
    let mut result = Envelope::new(
        EnvelopeType::AuthResult,
        Payload::AuthResult(proto::AuthResult {
            success: true,
            assigned_address: address.clone(),
            error_message: String::new(),
        }),
    );
    result.to_address = address.clone();
    let sent = timeout(
        auth::HANDSHAKE_TIMEOUT,
        ws.send(Message::Binary(proto::encode(&result))),
    )
    .await;
    if !matches!(sent, Ok(Ok(()))) {
        debug!(addr = %address, "failed to deliver auth result");
        return None;
    }

    info!(addr = %address, "authenticated");
    Some(address)
}

/// Send a failure `AuthResult`, then close with `code`.
async fn reject(ws: &mut WebSocketStream<TcpStream>, reason: &str, code: CloseCode) {
    debug!(reason, "authentication rejected");
    let failure = Envelope::new(
        EnvelopeType::AuthResult,
        Payload::AuthResult(proto::AuthResult {
            success: false,
            assigned_address: String::new(),
            error_message: reason.to_string(),
        }),
    );
    let _ = timeout(WRITE_TIMEOUT, ws.send(Message::Binary(proto::encode(&failure)))).await;
    let _ = ws
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await;
}

// ─── Session loops ────────────────────────────────────────────────────────────

/// Drain the send buffer to the socket and drive heartbeats. A write
/// timeout or a missed pong cancels the whole session.
async fn write_loop(
    mut sink: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut out_rx: mpsc::Receiver<Vec<u8>>,
    handle: ClientHandle,
    last_pong: Arc<Mutex<Instant>>,
) {
    let mut ping = tokio::time::interval(HEARTBEAT_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = handle.cancel.cancelled() => break,

            outbound = out_rx.recv() => {
                let Some(bytes) = outbound else { break };
                match timeout(WRITE_TIMEOUT, sink.send(Message::Binary(bytes))).await {
                    Ok(Ok(())) => {}
                    _ => {
                        debug!(addr = %handle.address, "write failed — closing session");
                        handle.cancel.cancel();
                        break;
                    }
                }
            }

            _ = ping.tick() => {
                let pong_age = last_pong
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .elapsed();
                if pong_age > HEARTBEAT_INTERVAL + PONG_TIMEOUT {
                    warn!(addr = %handle.address, "heartbeat timeout — closing session");
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code: CloseCode::Policy,
                            reason: "heartbeat timeout".into(),
                        })))
                        .await;
                    handle.cancel.cancel();
                    break;
                }
                if timeout(WRITE_TIMEOUT, sink.send(Message::Ping(Vec::new()))).await.is_err() {
                    handle.cancel.cancel();
                    break;
                }
            }
        }
    }
}

/// Pull frames off the socket and feed the hub.
async fn read_loop(
    mut stream: SplitStream<WebSocketStream<TcpStream>>,
    handle: &ClientHandle,
    ctx: &RelayContext,
    last_pong: &Arc<Mutex<Instant>>,
) {
    loop {
        let frame = tokio::select! {
            _ = handle.cancel.cancelled() => break,
            frame = timeout(READ_IDLE_TIMEOUT, stream.next()) => frame,
        };

        match frame {
            Err(_) => {
                debug!(addr = %handle.address, "read idle timeout");
                break;
            }
            Ok(None) | Ok(Some(Err(_))) => break,
            Ok(Some(Ok(message))) => match message {
                Message::Binary(bytes) => ctx.hub.route_message(handle, &bytes).await,
                Message::Pong(_) => {
                    *last_pong.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
                }
                Message::Close(_) => break,
                // Text frames are not part of the protocol; pings are
                // answered by the websocket layer.
                _ => {}
            },
        }
    }
}
