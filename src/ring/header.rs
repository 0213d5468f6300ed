use std::sync::atomic::AtomicU64;

pub const MAGIC: u32 = u32::from_le_bytes(*b"UNBS");
pub const HEADER_LEN: usize = 64;
pub const FLAG_READY: u32 = 1 << 0;
pub const FLAG_SHUTDOWN: u32 = 1 << 1;

const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 4;
const OFF_WRITE_SEQ: usize = 8;
const OFF_READ_SEQ: usize = 16;
const OFF_FLAGS: usize = 24;
const OFF_SLOT_SIZE: usize = 28;
const OFF_SLOT_COUNT: usize = 32;
const OFF_WAKE_FUTEX: usize = 36;

/// In-memory view of the 64-byte ring header. `write_seq`/`read_seq` live
/// in the mapped region as atomics; this struct is only used to build the
/// initial image and to read a stable snapshot.
#[derive(Debug, Clone)]
pub struct Header {
    pub magic: u32,
    pub version: u32,
    pub write_seq: u64,
    pub read_seq: u64,
    pub flags: u32,
    pub slot_size: u32,
    pub slot_count: u32,
    pub wake_futex: u32,
    pub reserved: [u8; 16],
}

impl Header {
    pub fn write_to(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_LEN);
        buf[OFF_MAGIC..OFF_MAGIC + 4].copy_from_slice(&self.magic.to_le_bytes());
        buf[OFF_VERSION..OFF_VERSION + 4].copy_from_slice(&self.version.to_le_bytes());
        buf[OFF_WRITE_SEQ..OFF_WRITE_SEQ + 8].copy_from_slice(&self.write_seq.to_le_bytes());
        buf[OFF_READ_SEQ..OFF_READ_SEQ + 8].copy_from_slice(&self.read_seq.to_le_bytes());
        buf[OFF_FLAGS..OFF_FLAGS + 4].copy_from_slice(&self.flags.to_le_bytes());
        buf[OFF_SLOT_SIZE..OFF_SLOT_SIZE + 4].copy_from_slice(&self.slot_size.to_le_bytes());
        buf[OFF_SLOT_COUNT..OFF_SLOT_COUNT + 4].copy_from_slice(&self.slot_count.to_le_bytes());
        buf[OFF_WAKE_FUTEX..OFF_WAKE_FUTEX + 4].copy_from_slice(&self.wake_futex.to_le_bytes());
    }

    pub fn read_from(buf: &[u8]) -> Option<Header> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        let magic = u32::from_le_bytes(buf[OFF_MAGIC..OFF_MAGIC + 4].try_into().unwrap());
        if magic != MAGIC {
            return None;
        }
        Some(Header {
            magic,
            version: u32::from_le_bytes(buf[OFF_VERSION..OFF_VERSION + 4].try_into().unwrap()),
            write_seq: u64::from_le_bytes(buf[OFF_WRITE_SEQ..OFF_WRITE_SEQ + 8].try_into().unwrap()),
            read_seq: u64::from_le_bytes(buf[OFF_READ_SEQ..OFF_READ_SEQ + 8].try_into().unwrap()),
            flags: u32::from_le_bytes(buf[OFF_FLAGS..OFF_FLAGS + 4].try_into().unwrap()),
            slot_size: u32::from_le_bytes(buf[OFF_SLOT_SIZE..OFF_SLOT_SIZE + 4].try_into().unwrap()),
            slot_count: u32::from_le_bytes(
                buf[OFF_SLOT_COUNT..OFF_SLOT_COUNT + 4].try_into().unwrap(),
            ),
            wake_futex: u32::from_le_bytes(
                buf[OFF_WAKE_FUTEX..OFF_WAKE_FUTEX + 4].try_into().unwrap(),
            ),
            reserved: [0u8; 16],
        })
    }
}

/// Borrow the `write_seq` field of a mapped header as an atomic. The
/// header is placed at offset 0 of a page-aligned mapping and `write_seq`
/// sits at byte 8, so the pointer is always 8-byte aligned.
pub fn write_seq_atomic(region: &[u8]) -> &AtomicU64 {
    let ptr = region[OFF_WRITE_SEQ..OFF_WRITE_SEQ + 8].as_ptr() as *const AtomicU64;
    unsafe { &*ptr }
}
