pub mod engine;
pub mod timeline;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::info;

use crate::ipc::event::EventBroadcaster;
use crate::ring::RingRegistry;
use crate::storage::Storage;

use engine::SessionEngine;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct SessionView {
    pub id: String,
    pub title: String,
    pub status: String,
    pub working_directory: String,
    pub created_at: String,
    pub updated_at: String,
}

/// A session that has an in-flight or recently-run turn has a live
/// [`SessionEngine`] here; a freshly loaded or archived session does not.
pub struct SessionManager {
    storage: Arc<Storage>,
    broadcaster: Arc<EventBroadcaster>,
    ring_registry: Arc<RingRegistry>,
    engines: RwLock<HashMap<String, Arc<SessionEngine>>>,
}

impl SessionManager {
    pub fn new(
        storage: Arc<Storage>,
        broadcaster: Arc<EventBroadcaster>,
        ring_registry: Arc<RingRegistry>,
    ) -> Self {
        Self {
            storage,
            broadcaster,
            ring_registry,
            engines: RwLock::new(HashMap::new()),
        }
    }

    pub async fn active_count(&self) -> usize {
        self.engines.read().await.len()
    }

    pub async fn create(&self, repo_path: &str, title: &str) -> Result<SessionView> {
        let repo = self.storage.upsert_repository(repo_path).await?;
        let row = self.storage.create_session(&repo.id, title, repo_path).await?;
        info!(id = %row.id, "session created");
        self.broadcaster.broadcast(
            "session.statusChanged",
            &row.id,
            json!({ "status": row.status }),
        );
        Ok(row_to_view(row))
    }

    pub async fn list(&self) -> Result<Vec<SessionView>> {
        Ok(self
            .storage
            .list_sessions()
            .await?
            .into_iter()
            .map(row_to_view)
            .collect())
    }

    pub async fn get(&self, session_id: &str) -> Result<SessionView> {
        self.storage
            .get_session(session_id)
            .await?
            .map(row_to_view)
            .context("session not found")
    }

    pub async fn archive(&self, session_id: &str) -> Result<()> {
        self.storage
            .get_session(session_id)
            .await?
            .context("session not found")?;
        self.storage.archive_session(session_id).await?;
        self.broadcaster.broadcast(
            "session.statusChanged",
            session_id,
            json!({ "status": "archived" }),
        );
        Ok(())
    }

    pub async fn delete(&self, session_id: &str) -> Result<()> {
        self.storage
            .get_session(session_id)
            .await?
            .context("session not found")?;
        if let Some(engine) = self.engines.write().await.remove(session_id) {
            let _ = engine.stop().await;
        }
        self.storage.delete_session(session_id).await?;
        self.broadcaster.forget(session_id);
        info!(id = %session_id, "session deleted");
        Ok(())
    }

    /// Send a turn to the session's LLM process. Returns a conflict error if
    /// a turn is already running (`status == "running"`), matching the
    /// "conflict with current_revision" shape clients expect from a retry.
    pub async fn send(self: &Arc<Self>, session_id: &str, content: &str) -> Result<()> {
        let session = self
            .storage
            .get_session(session_id)
            .await?
            .context("session not found")?;
        if session.status == "running" {
            anyhow::bail!("CONFLICT:{}", session.status);
        }

        self.storage
            .append_message(session_id, "user", content, false)
            .await?;
        self.storage
            .update_session_status(session_id, "running")
            .await?;
        self.broadcaster.broadcast(
            "session.statusChanged",
            session_id,
            json!({ "status": "running" }),
        );

        let engine = self.engine_for(session_id, &session.working_directory).await;
        let content_owned = content.to_string();
        let session_id_owned = session_id.to_string();
        let storage = self.storage.clone();
        let broadcaster = self.broadcaster.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.run_turn(&content_owned).await {
                tracing::error!(session = %session_id_owned, error = %e, "run_turn failed");
                let _ = storage.update_session_status(&session_id_owned, "error").await;
                broadcaster.broadcast(
                    "session.statusChanged",
                    &session_id_owned,
                    json!({ "status": "error" }),
                );
            }
        });
        Ok(())
    }

    pub async fn stop(&self, session_id: &str) -> Result<()> {
        self.storage
            .get_session(session_id)
            .await?
            .context("session not found")?;
        if let Some(engine) = self.engines.read().await.get(session_id) {
            engine.stop().await?;
        }
        self.storage.update_session_status(session_id, "idle").await?;
        self.broadcaster.broadcast(
            "session.statusChanged",
            session_id,
            json!({ "status": "idle" }),
        );
        Ok(())
    }

    pub async fn status(&self, session_id: &str) -> Result<String> {
        Ok(self
            .storage
            .get_session(session_id)
            .await?
            .context("session not found")?
            .status)
    }

    async fn engine_for(self: &Arc<Self>, session_id: &str, working_directory: &str) -> Arc<SessionEngine> {
        {
            let engines = self.engines.read().await;
            if let Some(e) = engines.get(session_id) {
                return e.clone();
            }
        }
        let engine = SessionEngine::new(
            session_id.to_string(),
            working_directory.to_string(),
            self.storage.clone(),
            self.broadcaster.clone(),
            self.ring_registry.clone(),
        );
        if let Err(e) = engine.reload().await {
            tracing::warn!(id = %session_id, error = %e, "failed to replay raw event log on engine creation");
        }
        let mut engines = self.engines.write().await;
        engines
            .entry(session_id.to_string())
            .or_insert(engine)
            .clone()
    }

    /// Current timeline projection for `session.subscribe`'s `initial_state`
    /// event. Lazily constructs (and replays) the engine if this session has
    /// no live one yet, so a subscribe right after a daemon restart still
    /// sees history.
    pub async fn timeline_snapshot(self: &Arc<Self>, session_id: &str) -> Result<Vec<serde_json::Value>> {
        let session = self
            .storage
            .get_session(session_id)
            .await?
            .context("session not found")?;
        let engine = self.engine_for(session_id, &session.working_directory).await;
        let entries = engine.timeline_entries().await;
        Ok(entries
            .into_iter()
            .map(|e| serde_json::to_value(e).unwrap_or(json!(null)))
            .collect())
    }

    /// Subscribe to live session events. The returned receiver yields raw
    /// JSON envelope strings as produced by [`EventBroadcaster`]; the caller
    /// filters to the requested session and replays any gap before the
    /// client's last-seen sequence from storage.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<String> {
        self.broadcaster.subscribe()
    }

    /// Stop all active engines and mark their sessions idle. Called during
    /// graceful shutdown so no orphaned `claude` subprocess survives the
    /// daemon exiting.
    pub async fn drain(&self) {
        let engines: Vec<(String, Arc<SessionEngine>)> = {
            let mut map = self.engines.write().await;
            map.drain().collect()
        };
        for (session_id, engine) in engines {
            let stopped = tokio::time::timeout(std::time::Duration::from_secs(5), engine.stop()).await;
            if stopped.is_err() {
                tracing::warn!(id = %session_id, "engine did not stop within 5s during drain");
            }
            let _ = self.storage.update_session_status(&session_id, "idle").await;
        }
        info!("all active sessions drained");
    }
}

fn row_to_view(row: crate::storage::SessionRow) -> SessionView {
    SessionView {
        id: row.id,
        title: row.title,
        status: row.status,
        working_directory: row.working_directory,
        created_at: row.created_at,
        updated_at: row.updated_at,
    }
}
