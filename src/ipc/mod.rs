pub mod auth;
pub mod event;
pub mod handlers;

use crate::AppContext;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;
use tracing::{debug, error, info, trace, warn};

// ─── Rate limiting ──────────────────────────────────────────────────────────

/// Max new connections accepted per minute. The socket is loopback/local-only
/// (no remote IP to key on), so this is a single global tumbling counter
/// rather than the teacher's per-IP map.
const MAX_CONNECTIONS_PER_MIN: usize = 120;
/// Max RPC requests per connection per second.
const MAX_RPC_PER_SEC: u32 = 100;

struct ConnectionRateLimiter {
    timestamps: Vec<Instant>,
}

impl ConnectionRateLimiter {
    fn new() -> Self {
        Self { timestamps: Vec::new() }
    }

    fn check_and_record(&mut self) -> bool {
        let now = Instant::now();
        let one_min_ago = now - std::time::Duration::from_secs(60);
        self.timestamps.retain(|t| *t > one_min_ago);
        if self.timestamps.len() >= MAX_CONNECTIONS_PER_MIN {
            return false;
        }
        self.timestamps.push(now);
        true
    }
}

/// Per-connection RPC rate tracker using a tumbling window (resets each second).
struct RpcRateLimiter {
    count: u32,
    window_start: Instant,
}

impl RpcRateLimiter {
    fn new() -> Self {
        Self {
            count: 0,
            window_start: Instant::now(),
        }
    }

    fn check(&mut self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.window_start).as_secs() >= 1 {
            self.count = 0;
            self.window_start = now;
        }
        self.count += 1;
        self.count <= MAX_RPC_PER_SEC
    }
}

/// Constant-time token comparison to prevent timing-based token oracle attacks.
fn tokens_equal(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

// ─── Wire shapes (§4.1) ──────────────────────────────────────────────────────

#[derive(Deserialize)]
struct RpcRequest {
    id: Option<Value>,
    method: String,
    params: Option<Value>,
}

#[derive(Serialize)]
struct RpcResponse {
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

#[derive(Serialize)]
struct RpcError {
    code: i32,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

// ─── Error codes (§4.1) ──────────────────────────────────────────────────────

const PARSE_ERROR: i32 = -32700;
const INVALID_REQUEST: i32 = -32600;
const METHOD_NOT_FOUND: i32 = -32601;
const INVALID_PARAMS: i32 = -32602;
const INTERNAL_ERROR: i32 = -32603;
const NOT_AUTHENTICATED: i32 = -32001;
const NOT_FOUND: i32 = -32002;
const CONFLICT: i32 = -32003;

// ─── Server ──────────────────────────────────────────────────────────────────

pub async fn run(ctx: Arc<AppContext>) -> Result<()> {
    let socket_path = &ctx.config.socket_path;
    if socket_path.exists() {
        // A stale socket from an unclean shutdown; a live daemon would have
        // failed to bind in the first place (EADDRINUSE), so it's safe to
        // remove before binding.
        let _ = std::fs::remove_file(socket_path);
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let listener = UnixListener::bind(socket_path)?;
    info!(path = %socket_path.display(), "IPC server listening on Unix socket");

    let conn_limiter = Arc::new(Mutex::new(ConnectionRateLimiter::new()));
    let shutdown = make_shutdown_future(ctx.clone());
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => {
                info!("shutdown signal received — draining sessions and stopping IPC server");
                ctx.session_manager.drain().await;
                break;
            }

            conn = listener.accept() => {
                let (stream, _addr) = match conn {
                    Ok(c) => c,
                    Err(e) => {
                        error!(err = %e, "accept error");
                        continue;
                    }
                };

                {
                    let mut limiter = conn_limiter.lock().await;
                    if !limiter.check_and_record() {
                        warn!("connection rate limit exceeded — rejecting");
                        drop(stream);
                        continue;
                    }
                }

                debug!("new connection");
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, ctx).await {
                        warn!(err = %e, "connection error");
                    }
                });
            }
        }
    }

    let _ = std::fs::remove_file(socket_path);
    info!("IPC server stopped");
    Ok(())
}

/// Resolves when a shutdown signal is received: SIGTERM/Ctrl-C, or an
/// in-process `shutdown` RPC via [`AppContext::shutdown`].
async fn make_shutdown_future(ctx: Arc<AppContext>) {
    let signal = async {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await.ok();
        }
    };
    tokio::select! {
        _ = signal => {}
        _ = ctx.shutdown.notified() => {}
    }
}

async fn handle_connection(stream: UnixStream, ctx: Arc<AppContext>) -> Result<()> {
    let (read_half, write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let write_half = Arc::new(Mutex::new(write_half));

    // ── Auth challenge ───────────────────────────────────────────────────────
    // The first frame on every connection must be `auth.login` carrying the
    // bearer token from `{data_dir}/auth_token`. We remember the token the
    // client authenticated with so every later dispatch can re-validate it —
    // rotating the token file invalidates in-flight connections immediately.
    let mut client_token = String::new();
    if !ctx.auth_token.is_empty() {
        let first = tokio::time::timeout(std::time::Duration::from_secs(10), lines.next_line()).await;
        let text = match first {
            Ok(Ok(Some(t))) => t,
            _ => return Ok(()),
        };

        let req: RpcRequest = match serde_json::from_str(&text) {
            Ok(r) => r,
            Err(_) => {
                send_line(&write_half, &error_response(Value::Null, PARSE_ERROR, "Parse error", None)).await;
                return Ok(());
            }
        };
        let id = req.id.clone().unwrap_or(Value::Null);

        if req.method != "auth.login" {
            send_line(
                &write_half,
                &error_response(id, NOT_AUTHENTICATED, "not authenticated — send auth.login first", None),
            )
            .await;
            return Ok(());
        }

        let provided = req
            .params
            .as_ref()
            .and_then(|p| p.get("token"))
            .and_then(Value::as_str)
            .unwrap_or_default();

        if !tokens_equal(provided, &ctx.auth_token) {
            send_line(
                &write_half,
                &error_response(id, NOT_AUTHENTICATED, "not authenticated — invalid token", None),
            )
            .await;
            return Ok(());
        }

        client_token = provided.to_string();
        let resp = json!({ "id": id, "result": { "authenticated": true } });
        send_line(&write_half, &resp.to_string()).await;
        debug!("client authenticated");
    }

    let mut broadcast_rx = ctx.broadcaster.subscribe();
    let mut rpc_limiter = RpcRateLimiter::new();
    // Sessions this connection has subscribed to; events for other sessions
    // are not forwarded to this client.
    let subscriptions: Arc<Mutex<std::collections::HashSet<String>>> =
        Arc::new(Mutex::new(std::collections::HashSet::new()));

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(text)) => {
                        if text.trim().is_empty() {
                            continue;
                        }
                        if !rpc_limiter.check() {
                            let resp = error_response(Value::Null, INTERNAL_ERROR, "RPC rate limit exceeded — max 100 req/sec", None);
                            send_line(&write_half, &resp).await;
                            continue;
                        }
                        let response = dispatch_text(&text, &ctx, &client_token, &subscriptions).await;
                        send_line(&write_half, &response).await;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(err = %e, "read error");
                        break;
                    }
                }
            }
            event = broadcast_rx.recv() => {
                match event {
                    Ok(json_text) => {
                        let forward = {
                            let subs = subscriptions.lock().await;
                            if subs.is_empty() {
                                false
                            } else {
                                serde_json::from_str::<Value>(&json_text)
                                    .ok()
                                    .and_then(|v| v.get("session_id").and_then(Value::as_str).map(str::to_string))
                                    .map(|sid| subs.contains(&sid))
                                    .unwrap_or(false)
                            }
                        };
                        if forward {
                            send_line(&write_half, &json_text).await;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "broadcast lagged — slow client skipped events");
                    }
                }
            }
        }
    }
    Ok(())
}

async fn send_line(write_half: &Arc<Mutex<tokio::net::unix::OwnedWriteHalf>>, text: &str) {
    let mut w = write_half.lock().await;
    if w.write_all(text.as_bytes()).await.is_ok() {
        let _ = w.write_all(b"\n").await;
    }
}

/// Dispatch a raw NDJSON request frame.
///
/// `client_token` is the bearer token presented at `auth.login`; it is
/// re-verified against the live `ctx.auth_token` on every dispatch so token
/// rotation invalidates in-flight connections immediately.
pub(crate) async fn dispatch_text(
    text: &str,
    ctx: &AppContext,
    client_token: &str,
    subscriptions: &Arc<Mutex<std::collections::HashSet<String>>>,
) -> String {
    let req: RpcRequest = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(_) => return error_response(Value::Null, PARSE_ERROR, "Parse error", None),
    };

    if !ctx.auth_token.is_empty() && !tokens_equal(client_token, &ctx.auth_token) {
        return error_response(
            req.id.unwrap_or(Value::Null),
            NOT_AUTHENTICATED,
            "not authenticated — invalid or missing token",
            None,
        );
    }

    let Some(id) = req.id else {
        return error_response(Value::Null, INVALID_REQUEST, "Invalid Request — missing id", None);
    };
    let params = req.params.unwrap_or(Value::Null);

    trace!(method = %req.method, "rpc dispatch");

    match dispatch(&req.method, params, ctx, subscriptions).await {
        Ok(value) => serde_json::to_string(&RpcResponse { id, result: Some(value), error: None })
            .unwrap_or_default(),
        Err(e) => {
            let (code, msg, data) = classify_error(&e);
            error_response(id, code, &msg, data)
        }
    }
}

async fn dispatch(
    method: &str,
    params: Value,
    ctx: &AppContext,
    subscriptions: &Arc<Mutex<std::collections::HashSet<String>>>,
) -> anyhow::Result<Value> {
    match method {
        "health" => handlers::daemon::health(params, ctx).await,
        "shutdown" => handlers::daemon::shutdown(params, ctx).await,
        "session.create" => handlers::session::create(params, ctx).await,
        "session.list" => handlers::session::list(params, ctx).await,
        "session.get" => handlers::session::get(params, ctx).await,
        "session.archive" => handlers::session::archive(params, ctx).await,
        "session.delete" => handlers::session::delete(params, ctx).await,
        "session.subscribe" => handlers::session::subscribe(params, ctx, subscriptions).await,
        "session.unsubscribe" => handlers::session::unsubscribe(params, ctx, subscriptions).await,
        "claude.send" => handlers::session::send(params, ctx).await,
        "claude.stop" => handlers::session::stop(params, ctx).await,
        "claude.status" => handlers::session::status(params, ctx).await,
        "message.list" => handlers::message::list(params, ctx).await,
        "message.get" => handlers::message::get(params, ctx).await,
        _ if method.starts_with("git.") => Err(not_implemented_here("git", method)),
        _ if method.starts_with("terminal.") => Err(not_implemented_here("terminal", method)),
        _ if method.starts_with("gh.") => Err(not_implemented_here("gh", method)),
        // Repository persistence beyond the upsert-on-session-create path is
        // explicitly out of scope (see SPEC_FULL.md §1) — the same
        // "not implemented here" slot as git/terminal/gh, not a gap.
        _ if method.starts_with("repository.") => Err(not_implemented_here("repository", method)),
        _ => Err(anyhow::anyhow!("METHOD_NOT_FOUND:{}", method)),
    }
}

/// A method whose dispatch slot exists in the closed RPC enum but whose
/// implementation lives in a module this daemon doesn't carry (the git/gh
/// CLI wrappers, the terminal PTY bridge, and repository CRUD beyond the
/// upsert the session-create path needs). Distinct from `METHOD_NOT_FOUND`,
/// which means the method isn't in the enum at all.
fn not_implemented_here(scope: &str, method: &str) -> anyhow::Error {
    anyhow::anyhow!("NOT_IMPLEMENTED_HERE:{}:{}", scope, method)
}

fn classify_error(e: &anyhow::Error) -> (i32, String, Option<Value>) {
    let msg = e.to_string();

    if msg.starts_with("METHOD_NOT_FOUND:") {
        return (METHOD_NOT_FOUND, "Method not found".to_string(), None);
    }
    if msg.contains("session not found") || msg.contains("SESSION_NOT_FOUND") {
        return (NOT_FOUND, "Session not found".to_string(), None);
    }
    if msg.contains("message not found") {
        return (NOT_FOUND, "Message not found".to_string(), None);
    }
    if let Some(scope) = msg.strip_prefix("NOT_IMPLEMENTED_HERE:") {
        let mut parts = scope.splitn(2, ':');
        let prefix = parts.next().unwrap_or_default();
        let method = parts.next().unwrap_or_default();
        return (
            METHOD_NOT_FOUND,
            format!("not implemented here — {} methods are handled outside this daemon", prefix),
            Some(json!({ "scope": prefix, "method": method })),
        );
    }
    if let Some(status) = msg.strip_prefix("CONFLICT:").map(str::trim) {
        // `status` carries the session's current status string, standing in
        // for the optimistic-concurrency revision this error shape was
        // designed around.
        return (
            CONFLICT,
            "conflict — session is already running a turn".to_string(),
            Some(json!({ "current_revision": status })),
        );
    }
    if msg.contains("missing field") || msg.contains("invalid type") {
        return (INVALID_PARAMS, format!("Invalid params: {}", msg), None);
    }

    error!(err = %e, "internal error");
    (INTERNAL_ERROR, "Internal error".to_string(), None)
}

fn error_response(id: Value, code: i32, message: &str, data: Option<Value>) -> String {
    let resp = RpcResponse {
        id,
        result: None,
        error: Some(RpcError { code, message: message.to_string(), data }),
    };
    serde_json::to_string(&resp).unwrap_or_default()
}
