//! Drives one `claude` subprocess for a session: spawns it with
//! `--output-format stream-json`, reads its stdout line by line, and fans
//! each raw line out three ways — appended verbatim to the persisted
//! [`Storage`] message log, into the shared-memory ring (best-effort, for
//! zero-copy local subscribers), and into the in-memory [`TimelineBuilder`]
//! that backs the live timeline and the `session.message*` broadcasts.
//!
//! The persisted log and the live timeline are deliberately two different
//! shapes of the same raw stream: a message row is the raw NDJSON line, byte
//! for byte, so [`reload`](SessionEngine::reload) can replay it through the
//! same [`TimelineBuilder`] a live client's projection went through and land
//! on an identical result.
//!
//! The spawn/signal lifecycle (stdin null, piped stdout/stderr, PID
//! tracking, pause via SIGSTOP/SIGCONT, stop via SIGCONT-then-kill to avoid
//! leaving a stopped zombie, and the "no terminal result" safety net) is
//! carried over from the process-management idiom this crate's stream
//! runner always used; only the event shape changed.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, warn};

use crate::ipc::event::EventBroadcaster;
use crate::ring::{EventType, RingProducer, RingRegistry};
use crate::storage::Storage;

use super::timeline::{TimelineBuilder, TimelineEntry};

/// How long `stop()` waits after SIGTERM before escalating to SIGKILL.
const STOP_GRACE: std::time::Duration = std::time::Duration::from_secs(3);

pub struct SessionEngine {
    session_id: String,
    working_directory: String,
    storage: Arc<Storage>,
    broadcaster: Arc<EventBroadcaster>,
    ring_registry: Arc<RingRegistry>,
    ring: Mutex<Option<RingProducer>>,
    llm_session_id: RwLock<Option<String>>,
    timeline: Mutex<TimelineBuilder>,
    /// Index into the live timeline of the most recently emitted entry, kept
    /// so a later `tool_result` or terminal `result` line that mutates it in
    /// place (without adding a new entry) can be re-rendered and pushed as a
    /// `session.messageUpdated` event.
    last_entry: Mutex<Option<usize>>,
    paused: AtomicBool,
    child_pid: AtomicU32,
    current_child: Mutex<Option<Child>>,
    cancelled: Arc<AtomicBool>,
}

impl SessionEngine {
    pub fn new(
        session_id: String,
        working_directory: String,
        storage: Arc<Storage>,
        broadcaster: Arc<EventBroadcaster>,
        ring_registry: Arc<RingRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            session_id,
            working_directory,
            storage,
            broadcaster,
            ring_registry,
            ring: Mutex::new(None),
            llm_session_id: RwLock::new(None),
            timeline: Mutex::new(TimelineBuilder::new()),
            last_entry: Mutex::new(None),
            paused: AtomicBool::new(false),
            child_pid: AtomicU32::new(0),
            current_child: Mutex::new(None),
            cancelled: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Rebuild the in-memory timeline from the persisted message log, e.g.
    /// after a daemon restart, so reconnecting clients see the same
    /// projection a live subscriber would have. Each row's `content` is the
    /// raw NDJSON line verbatim — replaying them through the same
    /// [`TimelineBuilder::ingest`] a live turn uses guarantees the reloaded
    /// projection is identical to what a connected client already saw.
    pub async fn reload(&self) -> Result<()> {
        let rows = self.storage.list_messages(&self.session_id).await?;
        let mut timeline = self.timeline.lock().await;
        for row in rows {
            timeline.ingest(&row.content, Some(row.sequence_number), &row.created_at, &row.id);
        }
        Ok(())
    }

    /// Snapshot of the current live timeline projection, for `session.subscribe`'s
    /// `initial_state` event.
    pub async fn timeline_entries(&self) -> Vec<TimelineEntry> {
        self.timeline.lock().await.entries().to_vec()
    }

    pub async fn run_turn(self: &Arc<Self>, content: &str) -> Result<()> {
        self.cancelled.store(false, Ordering::SeqCst);

        if self.ring.lock().await.is_none() {
            match RingProducer::create(
                &self.session_id,
                crate::ring::DEFAULT_SLOT_COUNT,
                crate::ring::DEFAULT_SLOT_SIZE,
                &self.ring_registry,
            ) {
                Ok(producer) => *self.ring.lock().await = Some(producer),
                Err(e) => warn!(
                    session = %self.session_id,
                    error = %e,
                    "ring unavailable, falling back to RPC-only delivery"
                ),
            }
        }

        let mut command = Command::new("claude");
        command
            .current_dir(&self.working_directory)
            .args([
                "--output-format",
                "stream-json",
                "--dangerously-skip-permissions",
                "-p",
                content,
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(sid) = self.llm_session_id.read().await.clone() {
            command.args(["--resume", &sid]);
        }

        let mut child = command.spawn().context("failed to spawn claude")?;
        let pid = child.id().unwrap_or(0);
        self.child_pid.store(pid, Ordering::SeqCst);

        let stdout = child.stdout.take().context("no stdout on child")?;
        let stderr = child.stderr.take();
        *self.current_child.lock().await = Some(child);

        if let Some(stderr) = stderr {
            let session_id = self.session_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(session = %session_id, "claude stderr: {line}");
                }
            });
        }

        self.event_loop(stdout).await;

        let mut guard = self.current_child.lock().await;
        if let Some(mut child) = guard.take() {
            let _ = child.wait().await;
        }
        self.child_pid.store(0, Ordering::SeqCst);
        Ok(())
    }

    async fn event_loop(self: &Arc<Self>, stdout: tokio::process::ChildStdout) {
        let mut lines = BufReader::new(stdout).lines();
        let mut received_result = false;

        loop {
            let line = match lines.next_line().await {
                Ok(Some(l)) => l,
                Ok(None) => break,
                Err(e) => {
                    error!(session = %self.session_id, error = %e, "error reading claude stdout");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            let parsed: Option<Value> = serde_json::from_str(&line).ok();
            if parsed.is_none() {
                warn!(session = %self.session_id, %line, "unparseable claude event line");
            }

            // Raw capture happens before timeline projection: a malformed
            // line is still persisted verbatim, and a row's sequence_number
            // is its position in this session's append-only message log —
            // the one store reload() replays to rebuild the live timeline.
            let row = match self
                .storage
                .append_message(&self.session_id, raw_role(&parsed), &line, false)
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    error!(session = %self.session_id, error = %e, "failed to persist raw event");
                    continue;
                }
            };

            self.push_to_ring(&parsed, &line);

            if let Some(ref value) = parsed {
                if value.get("type").and_then(Value::as_str) == Some("result") {
                    received_result = true;
                }
                self.capture_llm_session_id(value).await;
                self.project_and_broadcast(&line, row.sequence_number, &row.id).await;
            }
        }

        if !self.cancelled.load(Ordering::SeqCst) && !received_result {
            warn!(session = %self.session_id, "claude exited without a terminal result event");
            let _ = self
                .storage
                .update_session_status(&self.session_id, "error")
                .await;
            self.broadcaster
                .broadcast("session.statusChanged", &self.session_id, json!({ "status": "error" }));
        }
    }

    fn push_to_ring(&self, parsed: &Option<Value>, raw_line: &str) {
        let Ok(mut guard) = self.ring.try_lock() else {
            return;
        };
        let Some(producer) = guard.as_mut() else {
            return;
        };
        let event_type = match parsed
            .as_ref()
            .and_then(|v| v.get("type"))
            .and_then(Value::as_str)
        {
            Some("stream_event") | Some("streaming_generating") | Some("streaming_thinking") => {
                EventType::StreamingChunk
            }
            Some("terminal_output") => EventType::TerminalOutput,
            Some("terminal_finished") => EventType::TerminalFinished,
            _ => EventType::LlmEvent,
        };
        producer.push(event_type, &self.session_id, raw_line.as_bytes());
    }

    async fn capture_llm_session_id(&self, value: &Value) {
        if value.get("type").and_then(Value::as_str) != Some("system") {
            return;
        }
        if let Some(sid) = value.get("session_id").and_then(Value::as_str) {
            let mut guard = self.llm_session_id.write().await;
            if guard.as_deref() != Some(sid) {
                *guard = Some(sid.to_string());
                let _ = self.storage.set_llm_session_id(&self.session_id, sid).await;
            }
        }
    }

    /// Feed one raw line into the live timeline projection and broadcast
    /// whatever the projection shows changed. This never mutates the
    /// persisted message log — that row was already appended, raw and
    /// immutable, before this is called — it only decides what a live
    /// subscriber should be told.
    async fn project_and_broadcast(&self, line: &str, sequence: i64, row_id: &str) {
        let now = chrono::Utc::now().to_rfc3339();

        let mut last_entry = self.last_entry.lock().await;
        let snapshot_before = match *last_entry {
            Some(idx) => self.render_entry_at(idx).await,
            None => None,
        };

        let entries_before;
        {
            let mut timeline = self.timeline.lock().await;
            entries_before = timeline.entries().len();
            timeline.ingest(line, Some(sequence), &now, row_id);
        }
        let entries_after = self.timeline.lock().await.entries().len();

        if entries_after > entries_before {
            let idx = entries_before;
            let Some((role, content)) = self.render_entry_at(idx).await else {
                return;
            };
            let entry_id = self.entry_id_at(idx).await;
            *last_entry = Some(idx);
            self.broadcaster.broadcast(
                "session.messageCreated",
                &self.session_id,
                json!({
                    "message": {
                        "id": entry_id,
                        "session_id": &self.session_id,
                        "sequence_number": sequence,
                        "role": role,
                        "content": content,
                        "is_streaming": false,
                        "created_at": now,
                    }
                }),
            );
            if role == "system" {
                self.finish_turn_if_terminal(line).await;
            }
            return;
        }

        // No new entry: a tool_result or terminal result may have mutated
        // the most recently emitted assistant entry in place. Tool results
        // are assumed to reference the latest assistant turn, which holds
        // for a single linear conversation (no concurrent turns per session).
        if let Some(idx) = *last_entry {
            if let Some((_, content)) = self.render_entry_at(idx).await {
                if snapshot_before.map(|(_, c)| c) != Some(content.clone()) {
                    let entry_id = self.entry_id_at(idx).await;
                    self.broadcaster.broadcast(
                        "session.messageUpdated",
                        &self.session_id,
                        json!({ "messageId": entry_id, "content": content }),
                    );
                }
            }
        }
    }

    async fn render_entry_at(&self, idx: usize) -> Option<(String, String)> {
        let timeline = self.timeline.lock().await;
        let entry = timeline.entries().get(idx)?;
        let content = serde_json::to_string(&entry.blocks).ok()?;
        Some((entry.role.clone(), content))
    }

    async fn entry_id_at(&self, idx: usize) -> String {
        self.timeline
            .lock()
            .await
            .entries()
            .get(idx)
            .map(|e| e.id.clone())
            .unwrap_or_default()
    }

    async fn finish_turn_if_terminal(&self, line: &str) {
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            return;
        };
        if value.get("type").and_then(Value::as_str) != Some("result") {
            return;
        }
        let is_error = value.get("is_error").and_then(Value::as_bool).unwrap_or(false);
        let status = if is_error { "error" } else { "idle" };
        let _ = self.storage.update_session_status(&self.session_id, status).await;
        self.broadcaster
            .broadcast("session.statusChanged", &self.session_id, json!({ "status": status }));
    }

    pub async fn pause(&self) -> Result<()> {
        let pid = self.child_pid.load(Ordering::SeqCst);
        if pid == 0 {
            return Ok(());
        }
        #[cfg(unix)]
        unsafe {
            libc::kill(pid as i32, libc::SIGSTOP);
        }
        self.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub async fn resume(&self) -> Result<()> {
        let pid = self.child_pid.load(Ordering::SeqCst);
        if pid == 0 {
            return Ok(());
        }
        #[cfg(unix)]
        unsafe {
            libc::kill(pid as i32, libc::SIGCONT);
        }
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Stop the in-flight turn. Sets `cancelled` before touching the child
    /// so the event loop's "no terminal result" safety net does not race
    /// with an intentional stop and mark the session `error`.
    pub async fn stop(&self) -> Result<()> {
        self.cancelled.store(true, Ordering::SeqCst);
        if self.paused.load(Ordering::SeqCst) {
            self.resume().await?;
        }
        let mut guard = self.current_child.lock().await;
        if let Some(mut child) = guard.take() {
            #[cfg(unix)]
            if let Some(pid) = child.id() {
                unsafe { libc::kill(pid as i32, libc::SIGTERM) };
                let exited = tokio::time::timeout(STOP_GRACE, child.wait()).await;
                if exited.is_err() {
                    let _ = child.kill().await;
                    let _ = child.wait().await;
                }
                return Ok(());
            }
            let _ = child.kill().await;
            let _ = child.wait().await;
        }
        Ok(())
    }
}

/// Best-effort `Message.role` for a raw stdout line, used only for the
/// persisted log — `assistant` and `user` carry their CLI type verbatim;
/// everything else (`result`, `system`, unparseable lines) is recorded as
/// `system` so the append-only log never drops a line for lack of a role.
fn raw_role(parsed: &Option<Value>) -> &'static str {
    match parsed.as_ref().and_then(|v| v.get("type")).and_then(Value::as_str) {
        Some("assistant") => "assistant",
        Some("user") => "user",
        _ => "system",
    }
}
