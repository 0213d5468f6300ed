use std::sync::atomic::{AtomicI64, Ordering};

pub const SLOT_HEADER_LEN: usize = 56;
pub const FLAG_TRUNCATED: u8 = 1 << 1;

const OFF_LEN: usize = 0;
const OFF_EVENT_TYPE: usize = 4;
const OFF_FLAGS: usize = 5;
// bytes 6..8 reserved
const OFF_SEQUENCE: usize = 8;
const OFF_SESSION_ID: usize = 16;
// SLOT_HEADER_LEN = 16 + 36 + 4 pad = 56

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventType {
    LlmEvent = 1,
    TerminalOutput = 2,
    TerminalFinished = 3,
    StreamingChunk = 4,
    Ping = 5,
}

impl EventType {
    fn from_u8(v: u8) -> EventType {
        match v {
            1 => EventType::LlmEvent,
            2 => EventType::TerminalOutput,
            3 => EventType::TerminalFinished,
            4 => EventType::StreamingChunk,
            _ => EventType::Ping,
        }
    }
}

pub struct SlotHeader {
    pub len: u32,
    pub event_type: EventType,
    pub flags: u8,
    pub sequence: i64,
    pub session_id: [u8; 36],
}

impl SlotHeader {
    /// Write every field except `sequence`, per the producer protocol: the
    /// sequence is the release-barrier write that makes the slot visible.
    pub fn write_except_sequence(&self, buf: &mut [u8]) {
        buf[OFF_LEN..OFF_LEN + 4].copy_from_slice(&self.len.to_le_bytes());
        buf[OFF_EVENT_TYPE] = self.event_type as u8;
        buf[OFF_FLAGS] = self.flags;
        buf[OFF_SESSION_ID..OFF_SESSION_ID + 36].copy_from_slice(&self.session_id);
    }

    pub fn read_from(buf: &[u8]) -> SlotHeader {
        let len = u32::from_le_bytes(buf[OFF_LEN..OFF_LEN + 4].try_into().unwrap());
        let event_type = EventType::from_u8(buf[OFF_EVENT_TYPE]);
        let flags = buf[OFF_FLAGS];
        let sequence = acquire_load_sequence(buf);
        let mut session_id = [0u8; 36];
        session_id.copy_from_slice(&buf[OFF_SESSION_ID..OFF_SESSION_ID + 36]);
        SlotHeader {
            len,
            event_type,
            flags,
            sequence,
            session_id,
        }
    }
}

fn sequence_atomic(buf: &[u8]) -> &AtomicI64 {
    let ptr = buf[OFF_SEQUENCE..OFF_SEQUENCE + 8].as_ptr() as *const AtomicI64;
    unsafe { &*ptr }
}

pub fn release_store_sequence(buf: &[u8], sequence: i64) {
    sequence_atomic(buf).store(sequence, Ordering::Release);
}

pub fn acquire_load_sequence(buf: &[u8]) -> i64 {
    sequence_atomic(buf).load(Ordering::Acquire)
}

pub fn write_payload(buf: &mut [u8], payload: &[u8]) {
    buf[SLOT_HEADER_LEN..SLOT_HEADER_LEN + payload.len()].copy_from_slice(payload);
}

pub fn read_payload(buf: &[u8], len: usize) -> Vec<u8> {
    buf[SLOT_HEADER_LEN..SLOT_HEADER_LEN + len].to_vec()
}
