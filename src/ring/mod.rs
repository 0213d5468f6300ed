//! Shared-memory event ring.
//!
//! One named POSIX shared-memory region per session. A single producer
//! (the session's stdout-reader task) appends fixed-size slots; any number
//! of independent readers drain them with their own cursor. The producer
//! never blocks: on overflow a slow reader just observes a sequence
//! mismatch and resyncs.
//!
//! Layout (little-endian throughout):
//!
//! ```text
//! [Header: 64 bytes, cache-line aligned]
//! [Slot 0][Slot 1]...[Slot N-1]
//! ```
//!
//! Each slot is `slot_size` bytes: a 56-byte slot header followed by the
//! payload.

mod header;
mod registry;
mod slot;

use std::path::Path;
use std::sync::atomic::Ordering;

use memmap2::MmapMut;
use thiserror::Error;

pub use header::{Header, HEADER_LEN};
pub use registry::RingRegistry;
pub use slot::{EventType, SlotHeader, SLOT_HEADER_LEN};

pub const DEFAULT_SLOT_COUNT: u32 = 1024;
pub const DEFAULT_SLOT_SIZE: u32 = 4096;
const VENDOR_TAG: &str = "unb";

#[derive(Debug, Error)]
pub enum RingError {
    #[error("slot_count must be a power of two, got {0}")]
    SlotCountNotPowerOfTwo(u32),
    #[error("shared memory name collides with an active session")]
    NameCollision,
    #[error("shared memory backend unsupported on this platform")]
    UnsupportedPlatform,
    #[error("os error: {0}")]
    Os(#[from] std::io::Error),
    #[error("region too small or corrupt")]
    Corrupt,
}

/// Derive the shared-memory object name for a session id.
///
/// `<3-char vendor tag><first 8 chars of the session UUID>`, kept well
/// under the OS shared-memory name limit (31 bytes on macOS, the tightest
/// of the supported platforms).
pub fn shm_name_for_session(session_id: &str) -> String {
    let short: String = session_id.chars().filter(|c| *c != '-').take(8).collect();
    format!("/{VENDOR_TAG}{short}")
}

/// Single-writer producer handle for a session's ring.
pub struct RingProducer {
    mmap: MmapMut,
    slot_count: u32,
    slot_size: u32,
    name: String,
}

/// SAFETY: `RingProducer` touches a memory-mapped region through atomics
/// with explicit ordering; the underlying bytes are never aliased by
/// unsynchronized plain reads/writes from this type's own methods.
unsafe impl Send for RingProducer {}

impl RingProducer {
    /// Create (or re-create) the named shared-memory region for `session_id`
    /// and initialise its header. Fails with `NameCollision` if `registry`
    /// already has a live entry under the derived name for a different
    /// session.
    pub fn create(
        session_id: &str,
        slot_count: u32,
        slot_size: u32,
        registry: &RingRegistry,
    ) -> Result<Self, RingError> {
        if !slot_count.is_power_of_two() {
            return Err(RingError::SlotCountNotPowerOfTwo(slot_count));
        }
        let name = shm_name_for_session(session_id);
        registry.claim(&name, session_id)?;

        let total_len = HEADER_LEN + (slot_count as usize) * (slot_size as usize);
        let mmap = unix::create_shm(&name, total_len)?;
        let mut producer = RingProducer {
            mmap,
            slot_count,
            slot_size,
            name,
        };
        producer.init_header();
        Ok(producer)
    }

    fn init_header(&mut self) {
        let header = Header {
            magic: header::MAGIC,
            version: 1,
            write_seq: 0,
            read_seq: 0,
            flags: header::FLAG_READY,
            slot_size: self.slot_size,
            slot_count: self.slot_count,
            wake_futex: 0,
            reserved: [0u8; 16],
        };
        header.write_to(&mut self.mmap[..HEADER_LEN]);
    }

    fn write_seq_atomic(&self) -> &std::sync::atomic::AtomicU64 {
        header::write_seq_atomic(&self.mmap)
    }

    fn slot_offset(&self, index: u32) -> usize {
        HEADER_LEN + (index as usize) * (self.slot_size as usize)
    }

    /// Append one event. Never blocks; overwrites the oldest slot if the
    /// ring is full, which a lagging consumer will detect via sequence
    /// mismatch.
    pub fn push(&mut self, event_type: EventType, session_id: &str, payload: &[u8]) {
        let write_seq = self.write_seq_atomic().load(Ordering::Relaxed);
        let index = (write_seq & (self.slot_count as u64 - 1)) as u32;
        let offset = self.slot_offset(index);
        let slot_size = self.slot_size as usize;

        let capacity = slot_size - SLOT_HEADER_LEN;
        let (payload_to_write, truncated) = if payload.len() > capacity {
            (&payload[..capacity], true)
        } else {
            (payload, false)
        };

        let slot_buf = &mut self.mmap[offset..offset + slot_size];
        slot::write_payload(slot_buf, payload_to_write);
        let header = SlotHeader {
            len: payload_to_write.len() as u32,
            event_type,
            flags: if truncated { slot::FLAG_TRUNCATED } else { 0 },
            sequence: write_seq as i64,
            session_id: pad_session_id(session_id),
        };
        // Write everything except `sequence` first is logically the same
        // layout write; we set `sequence` last via the release store below,
        // which is the field consumers gate on.
        header.write_except_sequence(slot_buf);

        // Release-store the sequence, marking the slot visible to readers,
        // then acquire-store the advanced write_seq.
        slot::release_store_sequence(slot_buf, write_seq as i64);
        self.write_seq_atomic().store(write_seq + 1, Ordering::Release);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn slot_count(&self) -> u32 {
        self.slot_count
    }
}

impl Drop for RingProducer {
    fn drop(&mut self) {
        let _ = unix::unlink_shm(&self.name);
    }
}

/// One reader's independent cursor into a session's ring.
pub struct RingConsumer {
    mmap: memmap2::Mmap,
    slot_count: u32,
    slot_size: u32,
    my_read_seq: u64,
}

pub enum ReadOutcome {
    Event {
        event_type: EventType,
        truncated: bool,
        sequence: i64,
        payload: Vec<u8>,
    },
    NoData,
    Gap { resynced_to: u64 },
}

impl RingConsumer {
    pub fn open(session_id: &str) -> Result<Self, RingError> {
        let name = shm_name_for_session(session_id);
        let mmap = unix::open_shm_readonly(&name)?;
        let header = Header::read_from(&mmap[..HEADER_LEN]).ok_or(RingError::Corrupt)?;
        Ok(RingConsumer {
            mmap,
            slot_count: header.slot_count,
            slot_size: header.slot_size,
            my_read_seq: 0,
        })
    }

    fn slot_offset(&self, index: u32) -> usize {
        HEADER_LEN + (index as usize) * (self.slot_size as usize)
    }

    /// Resume reading from a specific sequence number (used by C1's
    /// resume-by-sequence subscription path).
    pub fn resume_from(&mut self, sequence: u64) {
        self.my_read_seq = sequence;
    }

    pub fn read_next(&mut self) -> ReadOutcome {
        let write_seq = header::write_seq_atomic(&self.mmap).load(Ordering::Acquire);
        if self.my_read_seq == write_seq {
            return ReadOutcome::NoData;
        }
        let index = (self.my_read_seq & (self.slot_count as u64 - 1)) as u32;
        let offset = self.slot_offset(index);
        let slot_size = self.slot_size as usize;
        let slot_buf = &self.mmap[offset..offset + slot_size];

        let slot_seq = slot::acquire_load_sequence(slot_buf);
        if slot_seq != self.my_read_seq as i64 {
            let resynced_to = write_seq;
            self.my_read_seq = resynced_to;
            return ReadOutcome::Gap { resynced_to };
        }

        let header = SlotHeader::read_from(slot_buf);
        let payload = slot::read_payload(slot_buf, header.len as usize);
        self.my_read_seq += 1;
        ReadOutcome::Event {
            event_type: header.event_type,
            truncated: header.flags & slot::FLAG_TRUNCATED != 0,
            sequence: header.sequence,
            payload,
        }
    }
}

fn pad_session_id(session_id: &str) -> [u8; 36] {
    let mut buf = [0u8; 36];
    let bytes = session_id.as_bytes();
    let n = bytes.len().min(36);
    buf[..n].copy_from_slice(&bytes[..n]);
    buf
}

#[cfg(unix)]
mod unix {
    use super::RingError;
    use memmap2::{Mmap, MmapMut, MmapOptions};
    use std::ffi::CString;
    use std::os::fd::FromRawFd;
    use std::os::unix::io::RawFd;

    pub fn create_shm(name: &str, len: usize) -> Result<MmapMut, RingError> {
        let cname = CString::new(name).map_err(|_| RingError::Corrupt)?;
        let fd: RawFd = unsafe {
            libc::shm_open(
                cname.as_ptr(),
                libc::O_CREAT | libc::O_RDWR | libc::O_EXCL,
                0o600,
            )
        };
        let fd = if fd < 0 {
            // Already exists from a prior crashed run: unlink and retry once.
            unsafe { libc::shm_unlink(cname.as_ptr()) };
            let fd = unsafe {
                libc::shm_open(cname.as_ptr(), libc::O_CREAT | libc::O_RDWR | libc::O_EXCL, 0o600)
            };
            if fd < 0 {
                return Err(RingError::Os(std::io::Error::last_os_error()));
            }
            fd
        } else {
            fd
        };
        if unsafe { libc::ftruncate(fd, len as libc::off_t) } != 0 {
            return Err(RingError::Os(std::io::Error::last_os_error()));
        }
        let file = unsafe { std::fs::File::from_raw_fd(fd) };
        let mmap = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        std::mem::forget(file); // fd lifetime is owned by the shm object, not this handle
        Ok(mmap)
    }

    pub fn open_shm_readonly(name: &str) -> Result<Mmap, RingError> {
        let cname = CString::new(name).map_err(|_| RingError::Corrupt)?;
        let fd: RawFd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDONLY, 0) };
        if fd < 0 {
            return Err(RingError::Os(std::io::Error::last_os_error()));
        }
        let file = unsafe { std::fs::File::from_raw_fd(fd) };
        let mmap = unsafe { Mmap::map(&file)? };
        std::mem::forget(file);
        Ok(mmap)
    }

    pub fn unlink_shm(name: &str) -> Result<(), RingError> {
        let cname = CString::new(name).map_err(|_| RingError::Corrupt)?;
        unsafe { libc::shm_unlink(cname.as_ptr()) };
        Ok(())
    }
}

#[cfg(not(unix))]
mod unix {
    use super::RingError;

    pub fn create_shm(_name: &str, _len: usize) -> Result<memmap2::MmapMut, RingError> {
        Err(RingError::UnsupportedPlatform)
    }

    pub fn open_shm_readonly(_name: &str) -> Result<memmap2::Mmap, RingError> {
        Err(RingError::UnsupportedPlatform)
    }

    pub fn unlink_shm(_name: &str) -> Result<(), RingError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shm_name_is_short_and_stable() {
        let id = "550e8400-e29b-41d4-a716-446655440000";
        let name = shm_name_for_session(id);
        assert_eq!(name, "/unb550e8400");
        assert!(name.len() <= 31, "must fit the macOS shm name limit");
    }

    #[test]
    fn shm_name_differs_for_different_sessions() {
        let a = shm_name_for_session("aaaaaaaa-0000-0000-0000-000000000000");
        let b = shm_name_for_session("bbbbbbbb-0000-0000-0000-000000000000");
        assert_ne!(a, b);
    }

    #[cfg(unix)]
    #[test]
    fn producer_consumer_roundtrip() {
        let registry = RingRegistry::new();
        let session_id = "11111111-1111-1111-1111-111111111111";
        let mut producer =
            RingProducer::create(session_id, 8, 256, &registry).expect("create ring");
        producer.push(EventType::LlmEvent, session_id, b"hello");
        producer.push(EventType::Ping, session_id, b"ping");

        let mut consumer = RingConsumer::open(session_id).expect("open ring");
        match consumer.read_next() {
            ReadOutcome::Event {
                sequence, payload, ..
            } => {
                assert_eq!(sequence, 0);
                assert_eq!(payload, b"hello");
            }
            _ => panic!("expected event"),
        }
        match consumer.read_next() {
            ReadOutcome::Event {
                sequence, payload, ..
            } => {
                assert_eq!(sequence, 1);
                assert_eq!(payload, b"ping");
            }
            _ => panic!("expected event"),
        }
        assert!(matches!(consumer.read_next(), ReadOutcome::NoData));
    }

    #[cfg(unix)]
    #[test]
    fn overflow_signals_gap() {
        let registry = RingRegistry::new();
        let session_id = "22222222-2222-2222-2222-222222222222";
        let mut producer =
            RingProducer::create(session_id, 4, 128, &registry).expect("create ring");
        let mut consumer = RingConsumer::open(session_id).expect("open ring");

        // Fill past the ring capacity so the consumer's cursor (0) is stale.
        for i in 0..10u32 {
            producer.push(EventType::Ping, session_id, format!("{i}").as_bytes());
        }
        match consumer.read_next() {
            ReadOutcome::Gap { resynced_to } => assert_eq!(resynced_to, 10),
            _ => panic!("expected gap"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn oversized_payload_is_truncated_and_flagged() {
        let registry = RingRegistry::new();
        let session_id = "33333333-3333-3333-3333-333333333333";
        let mut producer =
            RingProducer::create(session_id, 4, 128, &registry).expect("create ring");
        let big = vec![b'x'; 1000];
        producer.push(EventType::StreamingChunk, session_id, &big);

        let mut consumer = RingConsumer::open(session_id).expect("open ring");
        match consumer.read_next() {
            ReadOutcome::Event {
                truncated, payload, ..
            } => {
                assert!(truncated);
                assert!(payload.len() < big.len());
            }
            _ => panic!("expected event"),
        }
    }
}
