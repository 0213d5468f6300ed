use crate::AppContext;
use anyhow::Result;
use serde_json::{json, Value};

/// `health` — liveness/readiness probe. No auth bypass: callers still need a
/// valid token, since an unauthenticated health check would leak whether a
/// session is active.
pub async fn health(_params: Value, ctx: &AppContext) -> Result<Value> {
    let uptime = ctx.started_at.elapsed().as_secs();
    let active_sessions = ctx.session_manager.active_count().await;
    Ok(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": uptime,
        "active_sessions": active_sessions,
    }))
}

/// `shutdown` — request a graceful stop. Drains in-flight turns before the
/// process exits; the RPC itself returns immediately so the caller isn't
/// left waiting on the drain.
pub async fn shutdown(_params: Value, ctx: &AppContext) -> Result<Value> {
    ctx.shutdown.notify_one();
    Ok(json!({ "shutting_down": true }))
}
