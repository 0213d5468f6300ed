//! End-to-end exercise of the Unix-socket RPC transport: bind a real daemon
//! on a temp socket, speak NDJSON to it, and assert on the wire responses.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use unbound_daemon::config::DaemonConfig;
use unbound_daemon::ipc::auth;
use unbound_daemon::ipc::event::EventBroadcaster;
use unbound_daemon::ring::RingRegistry;
use unbound_daemon::session::SessionManager;
use unbound_daemon::storage::Storage;
use unbound_daemon::AppContext;

async fn spawn_daemon() -> (Arc<AppContext>, tempfile::TempDir, String) {
    let data_dir = tempfile::tempdir().unwrap();
    let config = Arc::new(DaemonConfig::new(
        Some(data_dir.path().to_path_buf()),
        None,
        None,
        None,
        None,
    ));
    let storage = Arc::new(Storage::new(&config.data_dir).await.unwrap());
    let broadcaster = Arc::new(EventBroadcaster::new());
    let ring_registry = Arc::new(RingRegistry::new());
    let session_manager = Arc::new(SessionManager::new(
        storage.clone(),
        broadcaster.clone(),
        ring_registry.clone(),
    ));
    let auth_token = auth::get_or_create_token(&config.data_dir).unwrap();

    let ctx = Arc::new(AppContext {
        config: config.clone(),
        storage,
        broadcaster,
        session_manager,
        ring_registry,
        started_at: std::time::Instant::now(),
        auth_token: auth_token.clone(),
        shutdown: Arc::new(tokio::sync::Notify::new()),
    });

    let run_ctx = ctx.clone();
    tokio::spawn(async move {
        let _ = unbound_daemon::ipc::run(run_ctx).await;
    });

    // Give the listener a moment to bind.
    tokio::time::sleep(Duration::from_millis(100)).await;

    (ctx, data_dir, auth_token)
}

#[tokio::test]
async fn health_requires_auth_then_succeeds() {
    let (ctx, _data_dir, token) = spawn_daemon().await;

    let stream = UnixStream::connect(&ctx.config.socket_path).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    // First frame must be auth.login — a bare health call is rejected.
    let req = json!({ "id": 1, "method": "health", "params": {} });
    write_half.write_all(req.to_string().as_bytes()).await.unwrap();
    write_half.write_all(b"\n").await.unwrap();
    let resp = lines.next_line().await.unwrap().unwrap();
    let v: Value = serde_json::from_str(&resp).unwrap();
    assert_eq!(v["error"]["code"], -32001);

    // Connection is closed after an auth failure; reconnect and log in properly.
    let stream = UnixStream::connect(&ctx.config.socket_path).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    let login = json!({ "id": 1, "method": "auth.login", "params": { "token": token } });
    write_half.write_all(login.to_string().as_bytes()).await.unwrap();
    write_half.write_all(b"\n").await.unwrap();
    let resp = lines.next_line().await.unwrap().unwrap();
    let v: Value = serde_json::from_str(&resp).unwrap();
    assert_eq!(v["result"]["authenticated"], true);

    let req = json!({ "id": 2, "method": "health", "params": {} });
    write_half.write_all(req.to_string().as_bytes()).await.unwrap();
    write_half.write_all(b"\n").await.unwrap();
    let resp = lines.next_line().await.unwrap().unwrap();
    let v: Value = serde_json::from_str(&resp).unwrap();
    assert_eq!(v["id"], 2);
    assert!(v["result"]["uptime_seconds"].is_number());
}

#[tokio::test]
async fn session_create_and_duplicate_send_conflicts() {
    let (ctx, _data_dir, token) = spawn_daemon().await;
    let repo_dir = tempfile::tempdir().unwrap();

    let stream = UnixStream::connect(&ctx.config.socket_path).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    let login = json!({ "id": 1, "method": "auth.login", "params": { "token": token } });
    write_half.write_all(login.to_string().as_bytes()).await.unwrap();
    write_half.write_all(b"\n").await.unwrap();
    lines.next_line().await.unwrap().unwrap();

    let create = json!({
        "id": 2,
        "method": "session.create",
        "params": { "repoPath": repo_dir.path().to_str().unwrap(), "title": "t" }
    });
    write_half.write_all(create.to_string().as_bytes()).await.unwrap();
    write_half.write_all(b"\n").await.unwrap();
    let resp = lines.next_line().await.unwrap().unwrap();
    let v: Value = serde_json::from_str(&resp).unwrap();
    let session_id = v["result"]["id"].as_str().unwrap().to_string();
    assert_eq!(v["result"]["status"], "idle");

    // Simulate an in-flight turn without relying on a real `claude` binary
    // being on PATH — force the status a send() would have set, so the
    // conflict check is exercised deterministically.
    ctx.storage.update_session_status(&session_id, "running").await.unwrap();

    let send = json!({ "id": 3, "method": "claude.send", "params": { "sessionId": session_id, "content": "hi" } });
    write_half.write_all(send.to_string().as_bytes()).await.unwrap();
    write_half.write_all(b"\n").await.unwrap();
    let resp = lines.next_line().await.unwrap().unwrap();
    let v: Value = serde_json::from_str(&resp).unwrap();
    assert_eq!(v["error"]["code"], -32003);
}
