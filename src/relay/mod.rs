//! Remote publish relay (C4) and its outbound transport.
//!
//! Two independent pieces share this module:
//!
//! 1. **Outbound relay client** — connects to the remote fan-out service over
//!    a WebSocket (`tokio_tungstenite`, `rustls-tls`), authenticates, and
//!    relays inbound RPC frames to the local [`crate::ipc`] dispatcher after
//!    an X25519/HKDF/ChaCha20-Poly1305 end-to-end handshake (`crypto.rs`).
//!    Reconnects are governed by [`crate::supervisor::ConnectionSupervisor`].
//! 2. **Local side-effect-frame socket** — a second Unix socket
//!    (`config.relay_socket_path`) that other daemon components write
//!    length-prefixed "publish this" frames to. Each frame is forwarded to
//!    the remote service (when connected) and acknowledged locally.

pub mod crypto;

use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, error, info, trace, warn};

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::config::DaemonConfig;
use crate::supervisor::{BackoffOutcome, ConnectionSupervisor};
use crate::AppContext;

use crypto::RelayE2e;

const DEFAULT_CHANNEL: &str = "daemon";
/// Cap on a single side-effect frame's JSON body, to bound memory use from a
/// misbehaving local writer.
const MAX_FRAME_BYTES: u32 = 1 << 20;

/// Shared state between the outbound relay loop and the local effect-frame
/// server: the current outbound sender (`None` while disconnected) and the
/// active E2E session.
struct RelayLink {
    supervisor: ConnectionSupervisor,
    outbound: Mutex<Option<mpsc::Sender<String>>>,
    e2e: Mutex<Option<RelayE2e>>,
}

/// Spawns both the outbound relay client and the local side-effect socket.
/// Always runs — there is no license gate in this build.
pub fn spawn(config: Arc<DaemonConfig>, ctx: Arc<AppContext>) {
    let link = Arc::new(RelayLink {
        supervisor: ConnectionSupervisor::new("relay"),
        outbound: Mutex::new(None),
        e2e: Mutex::new(None),
    });

    tokio::spawn(outbound_loop(config.clone(), ctx.clone(), link.clone()));
    tokio::spawn(local_effect_server(config, link));
}

// ─── Outbound client (remote fan-out service) ─────────────────────────────────

async fn outbound_loop(config: Arc<DaemonConfig>, ctx: Arc<AppContext>, link: Arc<RelayLink>) {
    loop {
        if !link.supervisor.is_allowed().await {
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            continue;
        }

        info!(url = %config.relay_url, "relay: connecting");
        match connect_async(&config.relay_url).await {
            Ok((ws_stream, _)) => {
                info!("relay: connected");
                link.supervisor.record_success().await;
                *link.e2e.lock().await = None;

                let (mut sink, mut stream) = ws_stream.split();
                let (out_tx, mut out_rx) = mpsc::channel::<String>(128);
                *link.outbound.lock().await = Some(out_tx.clone());

                tokio::select! {
                    _ = handle_inbound(&mut stream, &ctx, out_tx, &link) => {
                        warn!("relay: inbound stream closed");
                    }
                    _ = handle_outbound(&mut out_rx, &mut sink) => {
                        warn!("relay: outbound sink closed");
                    }
                    _ = forward_broadcasts(&ctx, &link) => {
                        warn!("relay: broadcast forwarder stopped");
                    }
                }

                *link.outbound.lock().await = None;
                *link.e2e.lock().await = None;
            }
            Err(e) => {
                warn!("relay: connection failed: {e:#}");
            }
        }

        match link.supervisor.record_failure().await {
            BackoffOutcome::Retry(delay) => {
                info!("relay: reconnecting in {:?}", delay);
                tokio::time::sleep(delay).await;
            }
            BackoffOutcome::Exhausted => {
                warn!("relay: giving up after repeated failures — backing off 30s before retrying again");
                tokio::time::sleep(std::time::Duration::from_secs(30)).await;
            }
        }
    }
}

/// Receive frames from the relay. Handles the E2E handshake, decryption, and
/// dispatch through the local IPC handler. No RPC frame is dispatched until
/// E2E is fully established.
async fn handle_inbound(
    stream: &mut (impl StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin),
    ctx: &Arc<AppContext>,
    out_tx: mpsc::Sender<String>,
    link: &Arc<RelayLink>,
) {
    let mut e2e_established = false;
    // Relay-originated RPC dispatches share one subscription set for the
    // lifetime of the connection — there is exactly one remote peer behind
    // a relay link, unlike the fan-out of local Unix-socket clients.
    let subscriptions: Arc<Mutex<std::collections::HashSet<String>>> =
        Arc::new(Mutex::new(std::collections::HashSet::new()));

    while let Some(msg) = stream.next().await {
        let text = match msg {
            Ok(Message::Text(t)) => t,
            Ok(Message::Close(_)) | Err(_) => break,
            _ => continue,
        };

        let frame: Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(e) => {
                warn!("relay: unparseable frame: {e}");
                continue;
            }
        };
        let msg_type = frame["type"].as_str().unwrap_or("");

        match msg_type {
            "registered" | "client_disconnected" => {
                debug!("relay: <- {msg_type}");
            }
            "client_connected" => {
                debug!("relay: <- client_connected — resetting E2E state");
                *link.e2e.lock().await = None;
                e2e_established = false;
            }
            "e2e_hello" => {
                if let Some(client_pubkey) = frame["pubkey"].as_str() {
                    match RelayE2e::server_handshake(client_pubkey) {
                        Ok((server_pubkey, new_e2e)) => {
                            let hello = json!({ "type": "e2e_hello", "pubkey": server_pubkey }).to_string();
                            if out_tx.send(hello).await.is_err() {
                                break;
                            }
                            *link.e2e.lock().await = Some(new_e2e);
                            e2e_established = true;
                            info!("relay: E2E encryption established");
                        }
                        Err(e) => warn!("relay: E2E handshake failed: {e:#}"),
                    }
                }
            }
            "e2e" => {
                if !e2e_established {
                    warn!("relay: rejecting e2e frame — handshake not yet completed");
                    continue;
                }
                if let Some(payload) = frame["payload"].as_str() {
                    let inner = {
                        let guard = link.e2e.lock().await;
                        match guard.as_ref() {
                            Some(state) => match state.decrypt(payload) {
                                Ok(s) => s,
                                Err(e) => {
                                    warn!("relay: E2E decrypt failed: {e:#}");
                                    continue;
                                }
                            },
                            None => continue,
                        }
                    };
                    trace!("relay: inbound e2e frame ({} bytes decrypted)", inner.len());
                    let response = crate::ipc::dispatch_text(&inner, ctx, "", &subscriptions).await;
                    let out = {
                        let guard = link.e2e.lock().await;
                        match guard.as_ref() {
                            Some(state) => match state.encrypt(&response) {
                                Ok(p) => json!({ "type": "e2e", "payload": p }).to_string(),
                                Err(e) => {
                                    warn!("relay: E2E encrypt response failed: {e:#}");
                                    continue;
                                }
                            },
                            None => continue,
                        }
                    };
                    if out_tx.send(out).await.is_err() {
                        break;
                    }
                }
            }
            _ => {
                warn!("relay: unrecognized frame type '{}' — closing connection", msg_type);
                break;
            }
        }
    }
}

async fn handle_outbound(
    rx: &mut mpsc::Receiver<String>,
    sink: &mut (impl SinkExt<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
) {
    while let Some(msg) = rx.recv().await {
        if sink.send(Message::Text(msg)).await.is_err() {
            break;
        }
    }
}

/// Forward daemon push events to the relay, encrypted once E2E is active.
async fn forward_broadcasts(ctx: &Arc<AppContext>, link: &Arc<RelayLink>) {
    let mut rx = ctx.broadcaster.subscribe();
    loop {
        match rx.recv().await {
            Ok(json_text) => {
                publish_to_remote(link, &json_text).await;
            }
            Err(broadcast::error::RecvError::Closed) => break,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "relay broadcast lagged");
            }
        }
    }
}

/// Encrypt (if E2E is active) and hand `text` to the current outbound
/// connection. Silently drops the message if disconnected or E2E is not yet
/// established — a dropped push event is preferable to a plaintext leak.
async fn publish_to_remote(link: &Arc<RelayLink>, text: &str) -> bool {
    let out_tx = match link.outbound.lock().await.clone() {
        Some(tx) => tx,
        None => return false,
    };
    let framed = {
        let guard = link.e2e.lock().await;
        match guard.as_ref() {
            Some(state) => match state.encrypt(text) {
                Ok(p) => json!({ "type": "e2e", "payload": p }).to_string(),
                Err(e) => {
                    warn!("relay: encrypt failed: {e:#}");
                    return false;
                }
            },
            None => {
                debug!("relay: dropping publish — E2E not yet established");
                return false;
            }
        }
    };
    out_tx.send(framed).await.is_ok()
}

// ─── Local side-effect-frame socket ───────────────────────────────────────────

async fn local_effect_server(config: Arc<DaemonConfig>, link: Arc<RelayLink>) {
    if config.relay_socket_path.exists() {
        let _ = std::fs::remove_file(&config.relay_socket_path);
    }
    if let Some(parent) = config.relay_socket_path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            error!(err = %e, "relay: failed to create socket parent dir");
            return;
        }
    }
    let listener = match UnixListener::bind(&config.relay_socket_path) {
        Ok(l) => l,
        Err(e) => {
            error!(err = %e, path = %config.relay_socket_path.display(), "relay: failed to bind side-effect socket");
            return;
        }
    };
    info!(path = %config.relay_socket_path.display(), "relay: side-effect socket listening");

    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let link = link.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_effect_connection(stream, link).await {
                        debug!(err = %e, "relay: side-effect connection ended");
                    }
                });
            }
            Err(e) => {
                error!(err = %e, "relay: accept error on side-effect socket");
            }
        }
    }
}

/// One published side effect, decoded from a frame's top-level JSON object.
#[derive(serde::Deserialize)]
struct EffectFrame {
    #[serde(default)]
    effect_id: Option<String>,
    #[serde(default, rename = "type")]
    frame_type: String,
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    payload: Option<Value>,
}

async fn handle_effect_connection(stream: UnixStream, link: Arc<RelayLink>) -> anyhow::Result<()> {
    let (mut read_half, write_half) = stream.into_split();
    let write_half = Arc::new(Mutex::new(write_half));
    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 8192];

    loop {
        let n = read_half.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);

        // Drain as many complete frames as the buffer holds. On a parse
        // failure, resynchronise by dropping one byte and retrying rather
        // than desyncing the whole stream.
        loop {
            if buf.len() < 4 {
                break;
            }
            let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
            if len == 0 || len > MAX_FRAME_BYTES {
                warn!(len, "relay: invalid frame length — resyncing");
                buf.remove(0);
                continue;
            }
            let total = 4 + len as usize;
            if buf.len() < total {
                break;
            }
            let body = buf[4..total].to_vec();
            buf.drain(..total);

            match serde_json::from_slice::<EffectFrame>(&body) {
                Ok(frame) => {
                    handle_effect_frame(frame, &link, &write_half).await;
                }
                Err(e) => {
                    warn!(err = %e, "relay: malformed side-effect frame — resyncing");
                    // We already consumed a length-delimited chunk, so there is
                    // nothing more to resync within this frame; the next 4
                    // bytes in `buf` are a fresh frame header.
                }
            }
        }
    }
}

async fn handle_effect_frame(
    frame: EffectFrame,
    link: &Arc<RelayLink>,
    write_half: &Arc<Mutex<tokio::net::unix::OwnedWriteHalf>>,
) {
    let effect_id = frame.effect_id.clone().unwrap_or_default();

    match frame.frame_type.as_str() {
        "subscribe.v1" | "unsubscribe.v1" => {
            // Remote channel subscription management — acknowledged locally;
            // actual inbound delivery is relayed as `message` frames over
            // this same connection by a future inbound-fanout extension.
            send_ack(write_half, &effect_id, true, None).await;
            return;
        }
        _ => {}
    }

    let event_name = match frame.event.as_deref().filter(|s| !s.is_empty()) {
        Some(e) => e.to_string(),
        None if !frame.frame_type.is_empty() => frame.frame_type.clone(),
        None => {
            send_ack(write_half, &effect_id, false, Some("effect has neither event nor type")).await;
            return;
        }
    };

    let channel = frame.channel.clone().unwrap_or_else(|| DEFAULT_CHANNEL.to_string());

    let envelope_payload = frame.payload.clone().unwrap_or_else(|| {
        json!({
            "effect_id": effect_id,
            "type": frame.frame_type,
            "event": event_name,
            "channel": channel,
            "session_id": frame.session_id,
        })
    });

    let envelope = json!({
        "type": "publish",
        "channel": channel,
        "event": event_name,
        "session_id": frame.session_id,
        "payload": envelope_payload,
    })
    .to_string();

    let published = publish_to_remote(link, &envelope).await;
    if published {
        send_ack(write_half, &effect_id, true, None).await;
    } else {
        send_ack(write_half, &effect_id, false, Some("relay unavailable")).await;
    }
}

async fn send_ack(
    write_half: &Arc<Mutex<tokio::net::unix::OwnedWriteHalf>>,
    effect_id: &str,
    success: bool,
    error: Option<&str>,
) {
    let ack = json!({
        "type": "publish.ack.v1",
        "effect_id": effect_id,
        "status": if success { "success" } else { "failed" },
        "error": error,
    });
    let body = ack.to_string();
    let len = (body.len() as u32).to_be_bytes();

    let mut w = write_half.lock().await;
    if w.write_all(&len).await.is_ok() {
        let _ = w.write_all(body.as_bytes()).await;
    }
}
