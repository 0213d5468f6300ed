//! `message.*` — direct reads against a session's raw message log, for
//! clients that want pagination over history rather than the full
//! `session.subscribe` timeline snapshot.

use crate::AppContext;
use anyhow::Result;
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Deserialize)]
struct ListParams {
    #[serde(rename = "sessionId")]
    session_id: String,
    limit: Option<i64>,
    #[serde(rename = "beforeSequence")]
    before_sequence: Option<i64>,
}

#[derive(Deserialize)]
struct GetParams {
    #[serde(rename = "messageId")]
    message_id: String,
}

fn row_to_json(row: crate::storage::MessageRow) -> Value {
    json!({
        "id": row.id,
        "session_id": row.session_id,
        "sequence_number": row.sequence_number,
        "role": row.role,
        "content": row.content,
        "is_streaming": row.is_streaming,
        "created_at": row.created_at,
    })
}

/// `message.list` — a page of raw messages, newest-first input / oldest-first
/// output, matching `session.timeline_snapshot`'s ordering.
pub async fn list(params: Value, ctx: &AppContext) -> Result<Value> {
    let p: ListParams = serde_json::from_value(params)?;
    ctx.session_manager.get(&p.session_id).await?;
    let limit = p.limit.unwrap_or(50).clamp(1, 500);
    let rows = ctx
        .storage
        .list_messages_page(&p.session_id, limit, p.before_sequence)
        .await?;
    Ok(json!({ "messages": rows.into_iter().map(row_to_json).collect::<Vec<_>>() }))
}

/// `message.get` — a single raw message row by id.
pub async fn get(params: Value, ctx: &AppContext) -> Result<Value> {
    let p: GetParams = serde_json::from_value(params)?;
    let row = ctx
        .storage
        .get_message(&p.message_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("message not found"))?;
    Ok(row_to_json(row))
}
