//! Projects the raw NDJSON event stream from the LLM CLI into an ordered,
//! deduplicated conversation timeline.
//!
//! This is intentionally one module, as fragile, rule-driven parsing like
//! this is easiest to keep correct when every rule lives next to its
//! fixture test. The same [`TimelineBuilder`] is used both for live
//! ingestion (one line at a time, as the child process emits them) and for
//! reload-from-log (replaying the persisted raw lines in order), so the two
//! views are guaranteed semantically identical.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolUseBlock {
    pub tool_use_id: String,
    pub parent_tool_use_id: Option<String>,
    pub name: String,
    pub input: Value,
    pub output: Option<String>,
    pub status: ToolStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubAgentActivity {
    pub tool_use_id: String,
    pub subagent_type: String,
    pub description: String,
    pub children: Vec<ToolUseBlock>,
    pub status: ToolStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct TodoItem {
    pub content: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Block {
    Text(String),
    ToolUse(ToolUseBlock),
    SubAgentActivity(SubAgentActivity),
    TodoList(Vec<TodoItem>),
    Result { is_error: bool, text: Option<String> },
    Error(String),
    CompactBoundary,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimelineEntry {
    pub id: String,
    pub role: String,
    pub blocks: Vec<Block>,
    pub sequence_number: i64,
    pub created_at: String,
}

const PLACEHOLDER_SUBAGENT_TYPES: &[&str] = &["", "unknown", "general-purpose", "general"];

/// Where a tracked tool_use currently lives, so a later `tool_result` or
/// terminal `result` event can find and mutate it without a linear scan.
#[derive(Clone, Copy)]
enum ToolLocation {
    Standalone { entry_idx: usize, block_idx: usize },
    Child { entry_idx: usize, block_idx: usize, child_idx: usize },
}

pub struct TimelineBuilder {
    entries: Vec<TimelineEntry>,
    /// tool_use_id -> where the block lives, for status updates and dedup.
    tool_location: HashMap<String, ToolLocation>,
    /// parent_tool_use_id -> queued children whose parent hasn't arrived yet.
    pending_children: HashMap<String, Vec<ToolUseBlock>>,
    next_row_id: i64,
}

impl Default for TimelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TimelineBuilder {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            tool_location: HashMap::new(),
            pending_children: HashMap::new(),
            next_row_id: 0,
        }
    }

    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }

    /// Ingest one raw NDJSON line. `sequence_number`/`created_at`/`row_id`
    /// come from the persisted Message row (or, for live ingestion before
    /// persistence completes, from the same values the caller is about to
    /// persist) so live and reload projections agree byte-for-byte.
    pub fn ingest(&mut self, line: &str, sequence_number: Option<i64>, created_at: &str, row_id: &str) {
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            return;
        };
        let value = unwrap_raw_json(value);
        let seq = sequence_number.unwrap_or_else(|| {
            let n = self.next_row_id;
            self.next_row_id += 1;
            n
        });
        self.ingest_value(&value, seq, created_at, row_id);
    }

    fn ingest_value(&mut self, value: &Value, seq: i64, created_at: &str, row_id: &str) {
        let Some(type_str) = value.get("type").and_then(Value::as_str) else {
            return;
        };
        match type_str {
            "assistant" => self.ingest_assistant(value, seq, created_at, row_id),
            "user" => self.ingest_user(value, seq, created_at, row_id),
            "result" => self.ingest_result(value, seq, created_at, row_id),
            // system/system.init and transient streaming types carry no
            // timeline-visible content.
            _ => {}
        }
    }

    fn new_entry_id(row_id: &str, seq: i64) -> String {
        if row_id.is_empty() {
            seq.to_string()
        } else {
            row_id.to_string()
        }
    }

    fn ingest_assistant(&mut self, value: &Value, seq: i64, created_at: &str, row_id: &str) {
        let message = value.get("message").unwrap_or(value);
        let top_parent = value
            .get("parent_tool_use_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        let content = message.get("content").and_then(Value::as_array);
        let Some(content) = content else { return };

        let entry_id = Self::new_entry_id(row_id, seq);
        let entry_idx = self.entries.len();
        let mut blocks = Vec::new();

        for block in content {
            let Some(btype) = block.get("type").and_then(Value::as_str) else {
                continue;
            };
            match btype {
                "text" => {
                    if let Some(text) = block.get("text").and_then(Value::as_str) {
                        blocks.push(Block::Text(text.to_string()));
                    }
                }
                "thinking" => { /* hidden from the visible timeline */ }
                "tool_use" => {
                    let tool_use_id = block
                        .get("id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    let name = block
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    let input = block.get("input").cloned().unwrap_or(Value::Null);
                    let parent = block
                        .get("parent_tool_use_id")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .or_else(|| top_parent.clone());

                    if let Some(existing) = self.tool_location.get(&tool_use_id).copied() {
                        self.update_tool_input(existing, input);
                        continue;
                    }

                    if name == "TodoWrite" {
                        if let Some(todos) = parse_todos(&input) {
                            blocks.push(Block::TodoList(todos));
                            continue;
                        }
                    }

                    let tool_block = ToolUseBlock {
                        tool_use_id: tool_use_id.clone(),
                        parent_tool_use_id: parent.clone(),
                        name: name.clone(),
                        input,
                        output: None,
                        status: ToolStatus::Running,
                    };

                    if name == "Task" {
                        let subagent_type = tool_block
                            .input
                            .get("subagent_type")
                            .and_then(Value::as_str)
                            .unwrap_or("")
                            .to_string();
                        let description = tool_block
                            .input
                            .get("description")
                            .and_then(Value::as_str)
                            .unwrap_or("")
                            .to_string();
                        let block_idx = blocks.len();
                        let mut activity = SubAgentActivity {
                            tool_use_id: tool_use_id.clone(),
                            subagent_type,
                            description,
                            children: Vec::new(),
                            status: ToolStatus::Running,
                        };
                        if let Some(queued) = self.pending_children.remove(&tool_use_id) {
                            for child in queued {
                                let child_id = child.tool_use_id.clone();
                                let child_idx = Self::merge_child(&mut activity, child);
                                self.tool_location.insert(
                                    child_id,
                                    ToolLocation::Child { entry_idx, block_idx, child_idx },
                                );
                            }
                        }
                        blocks.push(Block::SubAgentActivity(activity));
                        self.tool_location.insert(
                            tool_use_id,
                            ToolLocation::Standalone { entry_idx, block_idx },
                        );
                    } else if let Some(parent_id) = parent {
                        if let Some(loc) = self.tool_location.get(&parent_id).copied() {
                            self.attach_child_at(loc, tool_block);
                        } else {
                            self.pending_children
                                .entry(parent_id)
                                .or_default()
                                .push(tool_block);
                        }
                        // Grouped away: no standalone block in this entry.
                    } else {
                        let block_idx = blocks.len();
                        blocks.push(Block::ToolUse(tool_block));
                        self.tool_location.insert(
                            tool_use_id,
                            ToolLocation::Standalone { entry_idx, block_idx },
                        );
                    }
                }
                _ => {}
            }
        }

        if blocks.is_empty() {
            return;
        }
        self.entries.push(TimelineEntry {
            id: entry_id,
            role: "assistant".to_string(),
            blocks,
            sequence_number: seq,
            created_at: created_at.to_string(),
        });
    }

    fn attach_child_at(&mut self, loc: ToolLocation, child: ToolUseBlock) {
        match loc {
            ToolLocation::Standalone { entry_idx, block_idx } => {
                let child_id = child.tool_use_id.clone();
                if let Some(Block::SubAgentActivity(activity)) =
                    self.entries[entry_idx].blocks.get_mut(block_idx)
                {
                    let child_idx = Self::merge_child(activity, child);
                    self.tool_location.insert(
                        child_id,
                        ToolLocation::Child { entry_idx, block_idx, child_idx },
                    );
                }
            }
            ToolLocation::Child { .. } => {
                // A child cannot itself be a sub-agent parent in this model.
            }
        }
    }

    /// Merge `child` into `activity`, returning the index it ends up at so
    /// the caller can register its `ToolLocation::Child` for later
    /// `tool_result`/status lookups.
    fn merge_child(activity: &mut SubAgentActivity, child: ToolUseBlock) -> usize {
        if let Some(pos) = activity
            .children
            .iter()
            .position(|c| c.tool_use_id == child.tool_use_id)
        {
            let preserved_status = activity.children[pos].status;
            activity.children[pos] = child;
            // A later occurrence of the same tool_use replaces mutable
            // fields but must not regress a forward-only status.
            if status_rank(preserved_status) > status_rank(activity.children[pos].status) {
                activity.children[pos].status = preserved_status;
            }
            pos
        } else {
            activity.children.push(child);
            activity.children.len() - 1
        }
    }

    fn update_tool_input(&mut self, loc: ToolLocation, input: Value) {
        match loc {
            ToolLocation::Standalone { entry_idx, block_idx } => {
                match self.entries[entry_idx].blocks.get_mut(block_idx) {
                    Some(Block::ToolUse(b)) => b.input = input,
                    Some(Block::SubAgentActivity(_)) => {}
                    _ => {}
                }
            }
            ToolLocation::Child {
                entry_idx,
                block_idx,
                child_idx,
            } => {
                if let Some(Block::SubAgentActivity(activity)) =
                    self.entries[entry_idx].blocks.get_mut(block_idx)
                {
                    if let Some(child) = activity.children.get_mut(child_idx) {
                        child.input = input;
                    }
                }
            }
        }
    }

    fn ingest_user(&mut self, value: &Value, seq: i64, created_at: &str, row_id: &str) {
        // Sub-agent internal input — never user-visible.
        if value.get("parent_tool_use_id").and_then(Value::as_str).is_some() {
            return;
        }

        let message = value.get("message").unwrap_or(value);
        let content = message.get("content");

        // Plain-text payload: pass through unconditionally, even if it
        // happens to look bracketed/JSON-ish.
        if let Some(text) = content.and_then(Value::as_str) {
            self.push_text_entry(text, "user", seq, created_at, row_id);
            return;
        }

        let Some(blocks) = content.and_then(Value::as_array) else {
            return;
        };

        // An envelope whose content is only a serialized protocol message
        // (decodes to a recognized `type`) is an internal artifact.
        if blocks.len() == 1 {
            if let Some(text) = blocks[0].get("text").and_then(Value::as_str) {
                if is_protocol_envelope(text) {
                    return;
                }
            }
        }

        let mut free_text: Option<String> = None;
        let mut only_tool_blocks = true;

        for block in blocks {
            match block.get("type").and_then(Value::as_str) {
                Some("tool_result") => {
                    self.apply_tool_result(block);
                }
                Some("text") => {
                    only_tool_blocks = false;
                    if let Some(text) = block.get("text").and_then(Value::as_str) {
                        free_text = Some(text.to_string());
                    }
                }
                Some("tool_use") => { /* handled as part of assistant envelopes only */ }
                _ => only_tool_blocks = false,
            }
        }

        if only_tool_blocks {
            return;
        }
        if let Some(text) = free_text {
            self.push_text_entry(&text, "user", seq, created_at, row_id);
        }
    }

    fn push_text_entry(&mut self, text: &str, role: &str, seq: i64, created_at: &str, row_id: &str) {
        self.entries.push(TimelineEntry {
            id: Self::new_entry_id(row_id, seq),
            role: role.to_string(),
            blocks: vec![Block::Text(text.to_string())],
            sequence_number: seq,
            created_at: created_at.to_string(),
        });
    }

    fn apply_tool_result(&mut self, block: &Value) {
        let Some(tool_use_id) = block.get("tool_use_id").and_then(Value::as_str) else {
            return;
        };
        let Some(loc) = self.tool_location.get(tool_use_id).copied() else {
            return;
        };
        let is_error = block.get("is_error").and_then(Value::as_bool).unwrap_or(false);
        let output = join_tool_result_content(block.get("content"));
        let status = if is_error { ToolStatus::Failed } else { ToolStatus::Completed };

        match loc {
            ToolLocation::Standalone { entry_idx, block_idx } => {
                if let Some(Block::ToolUse(b)) = self.entries[entry_idx].blocks.get_mut(block_idx) {
                    b.output = output;
                    b.status = status;
                }
            }
            ToolLocation::Child { entry_idx, block_idx, child_idx } => {
                if let Some(Block::SubAgentActivity(a)) =
                    self.entries[entry_idx].blocks.get_mut(block_idx)
                {
                    if let Some(c) = a.children.get_mut(child_idx) {
                        c.output = output;
                        c.status = status;
                    }
                }
            }
        }
    }

    fn ingest_result(&mut self, value: &Value, seq: i64, created_at: &str, row_id: &str) {
        let is_error = value.get("is_error").and_then(Value::as_bool).unwrap_or(false);
        let text = value
            .get("result")
            .and_then(Value::as_str)
            .map(str::to_string);

        self.finalize_running_tools(is_error);

        if is_error {
            let message = text.clone().unwrap_or_default();
            self.entries.push(TimelineEntry {
                id: Self::new_entry_id(row_id, seq),
                role: "system".to_string(),
                blocks: vec![Block::Error(format!("Error: {message}"))],
                sequence_number: seq,
                created_at: created_at.to_string(),
            });
        } else if let Some(ref t) = text {
            if !t.is_empty() {
                self.entries.push(TimelineEntry {
                    id: Self::new_entry_id(row_id, seq),
                    role: "system".to_string(),
                    blocks: vec![Block::Result { is_error: false, text: Some(t.clone()) }],
                    sequence_number: seq,
                    created_at: created_at.to_string(),
                });
            }
        }
    }

    fn finalize_running_tools(&mut self, turn_failed: bool) {
        let status = if turn_failed { ToolStatus::Failed } else { ToolStatus::Completed };
        for entry in &mut self.entries {
            for block in &mut entry.blocks {
                match block {
                    Block::ToolUse(b) if b.status == ToolStatus::Running => b.status = status,
                    Block::SubAgentActivity(a) => {
                        if a.status == ToolStatus::Running {
                            a.status = status;
                        }
                        for child in &mut a.children {
                            if child.status == ToolStatus::Running {
                                child.status = status;
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
    }
}

fn status_rank(status: ToolStatus) -> u8 {
    match status {
        ToolStatus::Running => 0,
        ToolStatus::Completed | ToolStatus::Failed => 1,
    }
}

fn join_tool_result_content(content: Option<&Value>) -> Option<String> {
    match content {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Array(blocks)) => {
            let joined: Vec<&str> = blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect();
            Some(joined.join("\n"))
        }
        _ => None,
    }
}

fn parse_todos(input: &Value) -> Option<Vec<TodoItem>> {
    let todos = input.get("todos")?.as_array()?;
    let mut out = Vec::with_capacity(todos.len());
    for t in todos {
        let content = t.get("content").and_then(Value::as_str)?.to_string();
        let status = t.get("status").and_then(Value::as_str).unwrap_or("pending").to_string();
        out.push(TodoItem { content, status });
    }
    Some(out)
}

const PROTOCOL_TYPES: &[&str] = &[
    "tool_result",
    "tool_use",
    "system",
    "system.init",
    "assistant",
    "user",
    "result",
];

fn is_protocol_envelope(text: &str) -> bool {
    let trimmed = text.trim();
    if !(trimmed.starts_with('{') && trimmed.ends_with('}')) {
        return false;
    }
    let Ok(value) = serde_json::from_str::<Value>(trimmed) else {
        return false;
    };
    value
        .get("type")
        .and_then(Value::as_str)
        .map(|t| PROTOCOL_TYPES.contains(&t))
        .unwrap_or(false)
}

/// Unwrap one level of `{"raw_json": "<inner JSON string>"}` doubly-wrapped
/// envelopes so discrimination on `type` works on the inner object.
fn unwrap_raw_json(value: Value) -> Value {
    if let Some(inner) = value.get("raw_json").and_then(Value::as_str) {
        if let Ok(parsed) = serde_json::from_str::<Value>(inner) {
            return parsed;
        }
    }
    value
}

#[allow(dead_code)]
fn unused_placeholder_types() -> &'static [&'static str] {
    PLACEHOLDER_SUBAGENT_TYPES
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn assistant_line(parent: Option<&str>, blocks: Value) -> String {
        let mut msg = json!({"type": "assistant", "message": {"role": "assistant", "content": blocks}});
        if let Some(p) = parent {
            msg["parent_tool_use_id"] = json!(p);
        }
        msg.to_string()
    }

    #[test]
    fn simple_assistant_text_becomes_entry() {
        let mut tl = TimelineBuilder::new();
        tl.ingest(
            &assistant_line(None, json!([{"type": "text", "text": "hi there"}])),
            Some(0),
            "2026-01-01T00:00:00Z",
            "r0",
        );
        assert_eq!(tl.entries().len(), 1);
        match &tl.entries()[0].blocks[0] {
            Block::Text(t) => assert_eq!(t, "hi there"),
            _ => panic!("expected text block"),
        }
    }

    #[test]
    fn doubly_wrapped_raw_json_is_unwrapped() {
        let inner = assistant_line(None, json!([{"type": "text", "text": "unwrapped"}]));
        let wrapped = json!({"raw_json": inner}).to_string();
        let mut tl = TimelineBuilder::new();
        tl.ingest(&wrapped, Some(0), "t", "r0");
        assert_eq!(tl.entries().len(), 1);
    }

    #[test]
    fn user_envelope_with_only_protocol_artifact_is_suppressed() {
        let artifact = json!({"type": "tool_result", "tool_use_id": "x", "content": "ok"}).to_string();
        let line = json!({
            "type": "user",
            "message": {"content": [{"type": "text", "text": artifact}]}
        })
        .to_string();
        let mut tl = TimelineBuilder::new();
        tl.ingest(&line, Some(0), "t", "r0");
        assert!(tl.entries().is_empty());
    }

    #[test]
    fn user_envelope_with_mixed_artifact_and_text_keeps_only_text() {
        let line = json!({
            "type": "user",
            "message": {"content": [
                {"type": "tool_result", "tool_use_id": "missing", "content": "x"},
                {"type": "text", "text": "please continue"}
            ]}
        })
        .to_string();
        let mut tl = TimelineBuilder::new();
        tl.ingest(&line, Some(0), "t", "r0");
        assert_eq!(tl.entries().len(), 1);
        match &tl.entries()[0].blocks[0] {
            Block::Text(t) => assert_eq!(t, "please continue"),
            _ => panic!("expected text"),
        }
    }

    #[test]
    fn user_row_with_parent_tool_use_id_is_dropped() {
        let line = json!({
            "type": "user",
            "parent_tool_use_id": "parent-1",
            "message": {"content": "sub-agent internal input"}
        })
        .to_string();
        let mut tl = TimelineBuilder::new();
        tl.ingest(&line, Some(0), "t", "r0");
        assert!(tl.entries().is_empty());
    }

    #[test]
    fn bracketed_plain_text_passes_through() {
        let line = json!({"type": "user", "message": {"content": "{not actually JSON}"}}).to_string();
        let mut tl = TimelineBuilder::new();
        tl.ingest(&line, Some(0), "t", "r0");
        assert_eq!(tl.entries().len(), 1);
    }

    #[test]
    fn sub_agent_grouping_collects_children_in_arrival_order() {
        let mut tl = TimelineBuilder::new();
        // Parent Task tool_use arrives first.
        tl.ingest(
            &assistant_line(
                None,
                json!([{"type": "tool_use", "id": "task-1", "name": "Task",
                        "input": {"subagent_type": "explorer", "description": "find bugs"}}]),
            ),
            Some(0),
            "t0",
            "r0",
        );
        // Child arrives referencing the parent.
        tl.ingest(
            &assistant_line(
                Some("task-1"),
                json!([{"type": "tool_use", "id": "child-1", "name": "Read", "input": {"path": "a.rs"}}]),
            ),
            Some(1),
            "t1",
            "r1",
        );
        // Second child, reordered arrival still preserved in push order.
        tl.ingest(
            &assistant_line(
                Some("task-1"),
                json!([{"type": "tool_use", "id": "child-2", "name": "Grep", "input": {}}]),
            ),
            Some(2),
            "t2",
            "r2",
        );

        assert_eq!(tl.entries().len(), 1, "children should not create standalone entries");
        match &tl.entries()[0].blocks[0] {
            Block::SubAgentActivity(a) => {
                assert_eq!(a.subagent_type, "explorer");
                assert_eq!(a.children.len(), 2);
                assert_eq!(a.children[0].tool_use_id, "child-1");
                assert_eq!(a.children[1].tool_use_id, "child-2");
            }
            _ => panic!("expected sub-agent activity"),
        }
    }

    #[test]
    fn orphan_child_with_no_parent_stays_standalone() {
        let mut tl = TimelineBuilder::new();
        tl.ingest(
            &assistant_line(
                Some("never-arrives"),
                json!([{"type": "tool_use", "id": "orphan-1", "name": "Read", "input": {}}]),
            ),
            Some(0),
            "t0",
            "r0",
        );
        // The orphan is queued, never flushed, and never surfaces as an
        // entry of its own (it is not hoisted elsewhere either).
        assert!(tl.entries().is_empty());
        assert!(tl.pending_children.contains_key("never-arrives"));
    }

    #[test]
    fn duplicate_tool_use_keeps_latest_input_preserving_position() {
        let mut tl = TimelineBuilder::new();
        tl.ingest(
            &assistant_line(
                None,
                json!([
                    {"type": "text", "text": "starting"},
                    {"type": "tool_use", "id": "t-1", "name": "Bash", "input": {"cmd": "ls"}}
                ]),
            ),
            Some(0),
            "t0",
            "r0",
        );
        tl.ingest(
            &assistant_line(
                None,
                json!([{"type": "tool_use", "id": "t-1", "name": "Bash", "input": {"cmd": "ls -la"}}]),
            ),
            Some(1),
            "t1",
            "r1",
        );
        assert_eq!(tl.entries().len(), 1, "retry must not add a new entry");
        match &tl.entries()[0].blocks[1] {
            Block::ToolUse(b) => assert_eq!(b.input, json!({"cmd": "ls -la"})),
            _ => panic!("expected tool use"),
        }
    }

    #[test]
    fn todo_write_becomes_todo_list_block() {
        let mut tl = TimelineBuilder::new();
        tl.ingest(
            &assistant_line(
                None,
                json!([{"type": "tool_use", "id": "todo-1", "name": "TodoWrite",
                        "input": {"todos": [{"content": "write tests", "status": "pending"}]}}]),
            ),
            Some(0),
            "t0",
            "r0",
        );
        match &tl.entries()[0].blocks[0] {
            Block::TodoList(items) => {
                assert_eq!(items.len(), 1);
                assert_eq!(items[0].content, "write tests");
            }
            _ => panic!("expected todo list"),
        }
    }

    #[test]
    fn malformed_todo_write_falls_back_to_generic_tool_use() {
        let mut tl = TimelineBuilder::new();
        tl.ingest(
            &assistant_line(
                None,
                json!([{"type": "tool_use", "id": "todo-2", "name": "TodoWrite", "input": {}}]),
            ),
            Some(0),
            "t0",
            "r0",
        );
        match &tl.entries()[0].blocks[0] {
            Block::ToolUse(b) => assert_eq!(b.name, "TodoWrite"),
            _ => panic!("expected generic tool use fallback"),
        }
    }

    #[test]
    fn terminal_result_finalizes_running_tools_to_completed() {
        let mut tl = TimelineBuilder::new();
        tl.ingest(
            &assistant_line(
                None,
                json!([{"type": "tool_use", "id": "t-1", "name": "Bash", "input": {}}]),
            ),
            Some(0),
            "t0",
            "r0",
        );
        tl.ingest(
            &json!({"type": "result", "is_error": false, "result": ""}).to_string(),
            Some(1),
            "t1",
            "r1",
        );
        match &tl.entries()[0].blocks[0] {
            Block::ToolUse(b) => assert_eq!(b.status, ToolStatus::Completed),
            _ => panic!("expected tool use"),
        }
    }

    #[test]
    fn terminal_result_error_surfaces_error_block_and_fails_tools() {
        let mut tl = TimelineBuilder::new();
        tl.ingest(
            &assistant_line(
                None,
                json!([{"type": "tool_use", "id": "t-1", "name": "Bash", "input": {}}]),
            ),
            Some(0),
            "t0",
            "r0",
        );
        tl.ingest(
            &json!({"type": "result", "is_error": true, "result": "boom"}).to_string(),
            Some(1),
            "t1",
            "r1",
        );
        match &tl.entries()[0].blocks[0] {
            Block::ToolUse(b) => assert_eq!(b.status, ToolStatus::Failed),
            _ => panic!("expected tool use"),
        }
        match &tl.entries()[1].blocks[0] {
            Block::Error(msg) => assert_eq!(msg, "Error: boom"),
            _ => panic!("expected error block"),
        }
    }

    #[test]
    fn successful_result_with_no_text_produces_no_entry() {
        let mut tl = TimelineBuilder::new();
        tl.ingest(
            &json!({"type": "result", "is_error": false, "result": ""}).to_string(),
            Some(0),
            "t0",
            "r0",
        );
        assert!(tl.entries().is_empty());
    }

    #[test]
    fn tool_result_updates_matching_sub_agent_child() {
        let mut tl = TimelineBuilder::new();
        tl.ingest(
            &assistant_line(
                None,
                json!([{"type": "tool_use", "id": "task-1", "name": "Task",
                        "input": {"subagent_type": "explorer", "description": "find bugs"}}]),
            ),
            Some(0),
            "t0",
            "r0",
        );
        tl.ingest(
            &assistant_line(
                Some("task-1"),
                json!([{"type": "tool_use", "id": "child-1", "name": "Read", "input": {"path": "a.rs"}}]),
            ),
            Some(1),
            "t1",
            "r1",
        );

        let line = json!({
            "type": "user",
            "message": {"content": [
                {"type": "tool_result", "tool_use_id": "child-1", "content": "file contents"}
            ]}
        })
        .to_string();
        tl.ingest(&line, Some(2), "t2", "r2");

        match &tl.entries()[0].blocks[0] {
            Block::SubAgentActivity(a) => {
                assert_eq!(a.children[0].status, ToolStatus::Completed);
                assert_eq!(a.children[0].output.as_deref(), Some("file contents"));
            }
            _ => panic!("expected sub-agent activity"),
        }
    }

    #[test]
    fn tool_result_updates_queued_child_flushed_into_sub_agent() {
        let mut tl = TimelineBuilder::new();
        // Child arrives before its parent Task.
        tl.ingest(
            &assistant_line(
                Some("task-2"),
                json!([{"type": "tool_use", "id": "child-2", "name": "Grep", "input": {}}]),
            ),
            Some(0),
            "t0",
            "r0",
        );
        tl.ingest(
            &assistant_line(
                None,
                json!([{"type": "tool_use", "id": "task-2", "name": "Task",
                        "input": {"subagent_type": "explorer", "description": "find bugs"}}]),
            ),
            Some(1),
            "t1",
            "r1",
        );

        let line = json!({
            "type": "user",
            "message": {"content": [
                {"type": "tool_result", "tool_use_id": "child-2", "content": "no matches", "is_error": true}
            ]}
        })
        .to_string();
        tl.ingest(&line, Some(2), "t2", "r2");

        match &tl.entries()[0].blocks[0] {
            Block::SubAgentActivity(a) => {
                assert_eq!(a.children[0].status, ToolStatus::Failed);
                assert_eq!(a.children[0].output.as_deref(), Some("no matches"));
            }
            _ => panic!("expected sub-agent activity"),
        }
    }

    #[test]
    fn tool_result_updates_matching_standalone_tool_use() {
        let mut tl = TimelineBuilder::new();
        tl.ingest(
            &assistant_line(
                None,
                json!([{"type": "tool_use", "id": "t-1", "name": "Read", "input": {}}]),
            ),
            Some(0),
            "t0",
            "r0",
        );
        let line = json!({
            "type": "user",
            "message": {"content": [
                {"type": "tool_result", "tool_use_id": "t-1", "content": [
                    {"type": "text", "text": "line one"},
                    {"type": "text", "text": "line two"}
                ]}
            ]}
        })
        .to_string();
        tl.ingest(&line, Some(1), "t1", "r1");
        match &tl.entries()[0].blocks[0] {
            Block::ToolUse(b) => {
                assert_eq!(b.status, ToolStatus::Completed);
                assert_eq!(b.output.as_deref(), Some("line one\nline two"));
            }
            _ => panic!("expected tool use"),
        }
    }
}
