//! Fixture-driven end-to-end scenarios, mirroring the literal inputs and
//! expected observable outputs named in the design doc's testable-properties
//! section (S1-S6).

use unbound_daemon::ring::{EventType, RingConsumer, RingProducer, RingRegistry, ReadOutcome};
use unbound_daemon::session::timeline::{Block, TimelineBuilder, ToolStatus};
use unbound_daemon::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};

fn ingest_all(builder: &mut TimelineBuilder, lines: &[&str]) {
    for (i, line) in lines.iter().enumerate() {
        builder.ingest(line, Some(i as i64), "2026-01-01T00:00:00Z", &format!("row{i}"));
    }
}

/// S1 — a plain assistant turn with no tool calls.
#[test]
fn s1_simple_turn() {
    let mut builder = TimelineBuilder::new();
    ingest_all(
        &mut builder,
        &[
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Hello."}]}}"#,
            r#"{"type":"result","is_error":false,"result":"Hello."}"#,
        ],
    );

    let entries = builder.entries();
    let assistant_entries: Vec<_> = entries.iter().filter(|e| e.role == "assistant").collect();
    assert_eq!(assistant_entries.len(), 1);
    assert_eq!(assistant_entries[0].blocks.len(), 1);
    match &assistant_entries[0].blocks[0] {
        Block::Text(t) => assert_eq!(t, "Hello."),
        other => panic!("expected Text block, got {other:?}"),
    }
    assert!(!entries.iter().any(|e| e.blocks.iter().any(|b| matches!(b, Block::Error(_)))));
}

/// S2 — a child tool_use arrives before its parent Task; the parent must
/// still collect it into one SubAgentActivity.
#[test]
fn s2_task_child_reorder() {
    let mut builder = TimelineBuilder::new();
    ingest_all(
        &mut builder,
        &[
            r#"{"type":"assistant","parent_tool_use_id":"T1","message":{"content":[{"type":"tool_use","id":"c1","name":"Read","input":{"file_path":"R.md"}}]}}"#,
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"T1","name":"Task","input":{"subagent_type":"Explore","description":"D"}}]}}"#,
        ],
    );

    let entries = builder.entries();
    let subagents: Vec<_> = entries
        .iter()
        .flat_map(|e| e.blocks.iter())
        .filter_map(|b| match b {
            Block::SubAgentActivity(s) => Some(s),
            _ => None,
        })
        .collect();
    assert_eq!(subagents.len(), 1);
    let sub = subagents[0];
    assert_eq!(sub.tool_use_id, "T1");
    assert_eq!(sub.subagent_type, "Explore");
    assert_eq!(sub.description, "D");
    assert_eq!(sub.children.len(), 1);
    assert_eq!(sub.children[0].tool_use_id, "c1");
}

/// S3 — a `tool_result` + free text user row suppresses the artifact block.
#[test]
fn s3_artifact_suppression() {
    let mut builder = TimelineBuilder::new();
    ingest_all(
        &mut builder,
        &[r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"x","content":"ok"},{"type":"text","text":"Please continue"}]}}"#],
    );

    let entries = builder.entries();
    let user_entries: Vec<_> = entries.iter().filter(|e| e.role == "user").collect();
    assert_eq!(user_entries.len(), 1);
    assert_eq!(user_entries[0].blocks.len(), 1);
    match &user_entries[0].blocks[0] {
        Block::Text(t) => assert_eq!(t, "Please continue"),
        other => panic!("expected Text block, got {other:?}"),
    }
}

/// S4 — an error result finalises any tool still running.
#[test]
fn s4_result_error_finalises_running_tools() {
    let mut builder = TimelineBuilder::new();
    ingest_all(
        &mut builder,
        &[
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"a","name":"Bash","input":{}}]}}"#,
            r#"{"type":"result","is_error":true,"result":"exit 1"}"#,
        ],
    );

    let entries = builder.entries();
    let tool_blocks: Vec<_> = entries
        .iter()
        .flat_map(|e| e.blocks.iter())
        .filter_map(|b| match b {
            Block::ToolUse(t) => Some(t),
            _ => None,
        })
        .collect();
    assert_eq!(tool_blocks.len(), 1);
    assert_eq!(tool_blocks[0].status, ToolStatus::Failed);

    let has_error_block = entries
        .iter()
        .flat_map(|e| e.blocks.iter())
        .any(|b| matches!(b, Block::Error(msg) if msg == "Error: exit 1"));
    assert!(has_error_block, "expected one Error block with text 'Error: exit 1'");
}

/// S5 — a paused consumer resyncs after the producer overwrites the ring.
#[test]
fn s5_ring_gap_signalling() {
    let registry = RingRegistry::new();
    let session_id = "550e8400-e29b-41d4-a716-446655440001";
    let slot_count = 1024u32;
    let mut producer = RingProducer::create(session_id, slot_count, 4096, &registry).unwrap();
    let mut consumer = RingConsumer::open(session_id).unwrap();

    for i in 0..10_000u32 {
        producer.push(EventType::LlmEvent, session_id, format!("{{\"i\":{i}}}").as_bytes());
    }

    let mut saw_gap = false;
    loop {
        match consumer.read_next() {
            ReadOutcome::Gap { resynced_to } => {
                saw_gap = true;
                assert!(resynced_to >= 10_000 - slot_count as u64);
                break;
            }
            ReadOutcome::Event { .. } => continue,
            ReadOutcome::NoData => break,
        }
    }
    assert!(saw_gap, "expected the consumer to observe a gap after falling behind by 10,000 events");
}

/// S6 — three consecutive failures open the circuit; it half-opens after
/// the timeout and needs two successes to fully close.
#[tokio::test]
async fn s6_circuit_breaker_lifecycle() {
    let cb = CircuitBreaker::new(
        "relay-test",
        CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            timeout: std::time::Duration::from_millis(50),
        },
    );

    for _ in 0..3 {
        cb.record_failure().await;
    }
    assert!(!cb.is_allowed().await, "circuit should be open after 3 consecutive failures");

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert!(cb.is_allowed().await, "circuit should half-open after the timeout");

    cb.record_success().await;
    assert!(cb.is_allowed().await, "one success should keep the circuit half-open, still allowing probes");

    cb.record_success().await;
    assert!(cb.is_allowed().await, "second success should close the circuit");
}
