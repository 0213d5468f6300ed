use crate::{security, AppContext};
use anyhow::Result;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Deserialize)]
struct CreateParams {
    #[serde(rename = "repoPath")]
    repo_path: String,
    title: Option<String>,
}

#[derive(Deserialize)]
struct SessionIdParams {
    #[serde(rename = "sessionId")]
    session_id: String,
}

#[derive(Deserialize)]
struct SendParams {
    #[serde(rename = "sessionId")]
    session_id: String,
    content: String,
}

pub async fn create(params: Value, ctx: &AppContext) -> Result<Value> {
    let p: CreateParams = serde_json::from_value(params)?;
    let title = p.title.unwrap_or_else(|| "New Session".to_string());

    if !std::path::Path::new(&p.repo_path).exists() {
        anyhow::bail!("invalid type: repo path does not exist: {}", p.repo_path);
    }
    security::check_repo_path_safety(std::path::Path::new(&p.repo_path), &ctx.config.data_dir)?;

    let session = ctx.session_manager.create(&p.repo_path, &title).await?;
    Ok(serde_json::to_value(session)?)
}

pub async fn list(_params: Value, ctx: &AppContext) -> Result<Value> {
    let sessions = ctx.session_manager.list().await?;
    Ok(json!(sessions))
}

pub async fn get(params: Value, ctx: &AppContext) -> Result<Value> {
    let p: SessionIdParams = serde_json::from_value(params)?;
    let session = ctx.session_manager.get(&p.session_id).await?;
    Ok(serde_json::to_value(session)?)
}

pub async fn archive(params: Value, ctx: &AppContext) -> Result<Value> {
    let p: SessionIdParams = serde_json::from_value(params)?;
    ctx.session_manager.archive(&p.session_id).await?;
    Ok(json!({}))
}

pub async fn delete(params: Value, ctx: &AppContext) -> Result<Value> {
    let p: SessionIdParams = serde_json::from_value(params)?;
    ctx.session_manager.delete(&p.session_id).await?;
    Ok(json!({}))
}

/// `session.subscribe` — register this connection for `session_id`'s push
/// events and return an `initial_state` snapshot of the timeline so the
/// client never has to guess what it missed before subscribing.
pub async fn subscribe(
    params: Value,
    ctx: &AppContext,
    subscriptions: &Arc<Mutex<HashSet<String>>>,
) -> Result<Value> {
    let p: SessionIdParams = serde_json::from_value(params)?;
    // Validates the session exists before registering the subscription.
    let entries = ctx.session_manager.timeline_snapshot(&p.session_id).await?;
    subscriptions.lock().await.insert(p.session_id.clone());
    Ok(json!({
        "subscribed": true,
        "initial_state": {
            "type": "initial_state",
            "session_id": p.session_id,
            "data": { "timeline": entries },
        }
    }))
}

pub async fn unsubscribe(
    params: Value,
    _ctx: &AppContext,
    subscriptions: &Arc<Mutex<HashSet<String>>>,
) -> Result<Value> {
    let p: SessionIdParams = serde_json::from_value(params)?;
    subscriptions.lock().await.remove(&p.session_id);
    Ok(json!({ "unsubscribed": true }))
}

pub async fn send(params: Value, ctx: &AppContext) -> Result<Value> {
    let p: SendParams = serde_json::from_value(params)?;
    ctx.session_manager.send(&p.session_id, &p.content).await?;
    Ok(json!({ "accepted": true }))
}

pub async fn stop(params: Value, ctx: &AppContext) -> Result<Value> {
    let p: SessionIdParams = serde_json::from_value(params)?;
    ctx.session_manager.stop(&p.session_id).await?;
    Ok(json!({}))
}

pub async fn status(params: Value, ctx: &AppContext) -> Result<Value> {
    let p: SessionIdParams = serde_json::from_value(params)?;
    let status = ctx.session_manager.status(&p.session_id).await?;
    Ok(json!({ "status": status }))
}
