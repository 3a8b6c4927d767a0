//! Shared memory layout of the endpoint registry and of queue segments.
//!
//! # Registry
//!
//! ```text
//! +-------------------------------------------------------------------+
//! | REGISTRY HEADER (384 bytes)                                       |
//! |   magic "PRCENDP\0", version, capacities, wait tick, host pid     |
//! |   shutdown flag, rwlock, session id counter, table offsets        |
//! |   segment directory                                               |
//! +-------------------------------------------------------------------+
//! | ENDPOINT SLOTS (max_endpoints * 192 bytes)                        |
//! +-------------------------------------------------------------------+
//! | WAKE LATCHES (max_endpoints * 8 bytes, one per slot)              |
//! +-------------------------------------------------------------------+
//! | TOKEN ENTRIES (max_endpoints * 48 bytes)                          |
//! +-------------------------------------------------------------------+
//! ```
//!
//! Slot and token fields are only written under the header's exclusive lock
//! and only read under at least the shared lock. Latches sit in their own
//! table because they are set and waited on without the lock.
//!
//! # Queue segment
//!
//! ```text
//! +-------------------------------------------------------------------+
//! | SEGMENT HEADER (64 bytes)                                         |
//! |   magic "PRCSEGQ\0", version, descriptor length, ring capacity    |
//! |   sender pid, attach count                                        |
//! +-------------------------------------------------------------------+
//! | ROW SHAPE DESCRIPTOR (postcard bytes, padded to 64)               |
//! +-------------------------------------------------------------------+
//! | BYTE RING (192-byte header + capacity bytes)                      |
//! +-------------------------------------------------------------------+
//! ```

use std::mem::size_of;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use retrieve_shm::{ByteRing, ShmRwLock};
use static_assertions::const_assert_eq;

use crate::config::{MAX_SEGMENT_DIR_LEN, RegistryConfig};

// =============================================================================
// Constants
// =============================================================================

/// Magic bytes identifying an endpoint registry.
pub const REGISTRY_MAGIC: [u8; 8] = *b"PRCENDP\0";

/// Registry layout version (major.minor packed into u32).
pub const REGISTRY_VERSION: u32 = 1 << 16; // v1.0

/// Magic bytes identifying a queue segment.
pub const SEGMENT_MAGIC: [u8; 8] = *b"PRCSEGQ\0";

/// Queue segment layout version (major.minor packed into u32).
pub const SEGMENT_VERSION: u32 = 1 << 16; // v1.0

/// Bytes in a fixed-size name field, including the terminating NUL.
pub const NAME_LEN: usize = 64;

/// Token length in bytes.
pub const TOKEN_LEN: usize = 24;

// =============================================================================
// Endpoint State
// =============================================================================

/// Lifecycle state of an endpoint slot.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointState {
    Invalid = 0,
    /// Published, no receiver yet.
    Ready = 1,
    /// A receiver is inside a retrieve call.
    Retrieving = 2,
    /// A receiver is attached between retrieve calls.
    Attached = 3,
    /// All rows were produced and consumed (or the cursor is winding down).
    Finished = 4,
    /// The receiver detached before the end of the stream.
    Released = 5,
}

impl EndpointState {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::Ready,
            2 => Self::Retrieving,
            3 => Self::Attached,
            4 => Self::Finished,
            5 => Self::Released,
            _ => Self::Invalid,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Invalid => "INVALID",
            Self::Ready => "READY",
            Self::Retrieving => "RETRIEVING",
            Self::Attached => "ATTACHED",
            Self::Finished => "FINISHED",
            Self::Released => "RELEASED",
        }
    }
}

impl std::fmt::Display for EndpointState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Registry Header
// =============================================================================

/// Registry header at the start of the mapping (384 bytes).
#[repr(C, align(64))]
pub struct RegistryHeader {
    /// Magic bytes: "PRCENDP\0".
    pub magic: [u8; 8],
    /// Layout version (major.minor packed).
    pub version: u32,
    /// Feature flags.
    pub flags: u32,

    pub max_endpoints: u32,
    pub max_tokens: u32,
    pub queue_capacity: u32,
    pub wait_tick_ms: u32,
    /// Process that created the registry.
    pub host_pid: u32,
    /// Non-zero once shutdown has begun.
    pub shutdown: AtomicU32,

    /// Guards the slot and token tables.
    pub lock: ShmRwLock,
    /// Next session id to hand out. Never wraps in practice.
    pub next_session_id: AtomicU64,

    pub slot_table_offset: u64,
    pub latch_table_offset: u64,
    pub token_table_offset: u64,
    pub total_size: u64,

    pub segment_dir_len: u32,
    pub _pad1: [u8; 4],
    /// Secret that session tokens are derived from.
    pub token_key: [u8; 32],
    /// Queue segment directory (UTF-8 or raw OS bytes, not NUL-terminated).
    pub segment_dir: [u8; 256],
}

const_assert_eq!(size_of::<RegistryHeader>(), 384);
const_assert_eq!(size_of::<RegistryHeader>() % 64, 0);

impl RegistryHeader {
    pub fn init(
        &mut self,
        config: &RegistryConfig,
        offsets: &RegistryOffsets,
        host_pid: u32,
        token_key: [u8; 32],
    ) {
        self.magic = REGISTRY_MAGIC;
        self.version = REGISTRY_VERSION;
        self.flags = 0;
        self.max_endpoints = config.max_endpoints;
        self.max_tokens = config.max_endpoints;
        self.queue_capacity = config.queue_capacity;
        self.wait_tick_ms = config.wait_tick.as_millis() as u32;
        self.host_pid = host_pid;
        self.shutdown = AtomicU32::new(0);
        self.lock = ShmRwLock::new();
        self.next_session_id = AtomicU64::new(1);
        self.slot_table_offset = offsets.slot_table as u64;
        self.latch_table_offset = offsets.latch_table as u64;
        self.token_table_offset = offsets.token_table as u64;
        self.total_size = offsets.total_size as u64;

        let dir = config.segment_dir.as_os_str().as_encoded_bytes();
        let len = dir.len().min(MAX_SEGMENT_DIR_LEN);
        self.segment_dir = [0; 256];
        self.segment_dir[..len].copy_from_slice(&dir[..len]);
        self.segment_dir_len = len as u32;
        self._pad1 = [0; 4];
        self.token_key = token_key;
    }

    /// Validate a header found in an existing mapping of `mapped_len` bytes.
    pub fn validate(&self, mapped_len: usize) -> Result<RegistryOffsets, LayoutError> {
        if self.magic != REGISTRY_MAGIC {
            return Err(LayoutError::InvalidMagic {
                expected: "PRCENDP",
            });
        }
        if self.version >> 16 != REGISTRY_VERSION >> 16 {
            return Err(LayoutError::IncompatibleVersion {
                expected: REGISTRY_VERSION,
                found: self.version,
            });
        }
        if self.max_endpoints == 0 || self.max_tokens != self.max_endpoints {
            return Err(LayoutError::InvalidConfig("table capacities out of range"));
        }
        if !self.queue_capacity.is_power_of_two() {
            return Err(LayoutError::InvalidConfig(
                "queue_capacity must be non-zero power of 2",
            ));
        }
        if self.wait_tick_ms == 0 {
            return Err(LayoutError::InvalidConfig("wait tick must be non-zero"));
        }
        if self.segment_dir_len as usize > MAX_SEGMENT_DIR_LEN {
            return Err(LayoutError::InvalidConfig("segment directory too long"));
        }

        let offsets = RegistryOffsets::calculate(self.max_endpoints)?;
        if offsets.slot_table as u64 != self.slot_table_offset
            || offsets.latch_table as u64 != self.latch_table_offset
            || offsets.token_table as u64 != self.token_table_offset
            || offsets.total_size as u64 != self.total_size
        {
            return Err(LayoutError::InvalidConfig("table offsets do not match"));
        }
        if offsets.total_size > mapped_len {
            return Err(LayoutError::TooSmall {
                required: offsets.total_size,
                found: mapped_len,
            });
        }
        Ok(offsets)
    }

    pub fn segment_dir_bytes(&self) -> &[u8] {
        &self.segment_dir[..self.segment_dir_len as usize]
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire) != 0
    }
}

/// Byte offsets of the registry tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryOffsets {
    pub max_endpoints: usize,
    pub slot_table: usize,
    pub latch_table: usize,
    pub token_table: usize,
    pub total_size: usize,
}

impl RegistryOffsets {
    pub fn calculate(max_endpoints: u32) -> Result<Self, LayoutError> {
        let n = max_endpoints as usize;
        let overflow = LayoutError::InvalidConfig("max_endpoints overflows the layout");

        let slot_table = size_of::<RegistryHeader>();
        let latch_table = n
            .checked_mul(size_of::<EndpointSlot>())
            .and_then(|s| s.checked_add(slot_table))
            .ok_or(overflow.clone())?;
        let token_table = n
            .checked_mul(size_of::<retrieve_shm::Latch>())
            .and_then(|s| s.checked_add(latch_table))
            .map(align64)
            .ok_or(overflow.clone())?;
        let total_size = n
            .checked_mul(size_of::<TokenEntry>())
            .and_then(|s| s.checked_add(token_table))
            .map(align64)
            .ok_or(overflow)?;

        Ok(Self {
            max_endpoints: n,
            slot_table,
            latch_table,
            token_table,
            total_size,
        })
    }
}

// =============================================================================
// Endpoint Slot
// =============================================================================

/// One endpoint in the slot table (192 bytes).
///
/// Zeroed memory is a free slot.
#[repr(C, align(64))]
pub struct EndpointSlot {
    pub name: [u8; NAME_LEN],
    pub cursor_name: [u8; NAME_LEN],
    pub session_id: u64,
    pub queue_handle: u64,
    pub database_id: u32,
    pub user_id: u32,
    /// Bumped on every allocation of this slot.
    pub generation: u32,
    pub in_use: u32,
    pub state: u32,
    /// 0 when unset.
    pub sender_pid: u32,
    /// 0 when unset.
    pub receiver_pid: u32,
    pub _pad: [u8; 20],
}

const_assert_eq!(size_of::<EndpointSlot>(), 192);

impl EndpointSlot {
    #[inline]
    pub fn is_free(&self) -> bool {
        self.in_use == 0
    }

    pub fn name(&self) -> &str {
        read_fixed(&self.name)
    }

    pub fn cursor_name(&self) -> &str {
        read_fixed(&self.cursor_name)
    }

    pub fn state(&self) -> EndpointState {
        EndpointState::from_raw(self.state)
    }

    pub fn set_state(&mut self, state: EndpointState) {
        self.state = state as u32;
    }

    /// Return the slot to the free state. The generation is kept so stale
    /// handles keep failing their generation check.
    pub fn clear(&mut self) {
        self.name = [0; NAME_LEN];
        self.cursor_name = [0; NAME_LEN];
        self.session_id = 0;
        self.queue_handle = 0;
        self.database_id = 0;
        self.user_id = 0;
        self.in_use = 0;
        self.state = EndpointState::Invalid as u32;
        self.sender_pid = 0;
        self.receiver_pid = 0;
    }
}

// =============================================================================
// Token Entry
// =============================================================================

/// One (session, user) authentication entry (48 bytes).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct TokenEntry {
    pub session_id: u64,
    pub user_id: u32,
    /// Number of live endpoints relying on this token.
    pub ref_count: u32,
    pub in_use: u32,
    pub _pad: u32,
    pub token: [u8; TOKEN_LEN],
}

const_assert_eq!(size_of::<TokenEntry>(), 48);

impl TokenEntry {
    pub const EMPTY: Self = Self {
        session_id: 0,
        user_id: 0,
        ref_count: 0,
        in_use: 0,
        _pad: 0,
        token: [0; TOKEN_LEN],
    };
}

// =============================================================================
// Segment Header
// =============================================================================

/// Queue segment header (64 bytes).
#[repr(C, align(64))]
pub struct SegmentHeader {
    /// Magic bytes: "PRCSEGQ\0".
    pub magic: [u8; 8],
    pub version: u32,
    /// Length of the serialized row-shape descriptor.
    pub desc_len: u32,
    /// Ring data capacity.
    pub capacity: u32,
    pub sender_pid: u32,
    /// Live mappings of this segment. The segment file is unlinked when the
    /// count drops to zero and can no longer be attached after that.
    pub attached: AtomicU32,
    pub _pad0: u32,
    pub desc_offset: u64,
    pub ring_offset: u64,
    pub total_size: u64,
    pub _pad1: [u8; 8],
}

const_assert_eq!(size_of::<SegmentHeader>(), 64);

impl SegmentHeader {
    pub fn init(&mut self, offsets: &SegmentOffsets, sender_pid: u32) {
        self.magic = SEGMENT_MAGIC;
        self.version = SEGMENT_VERSION;
        self.desc_len = offsets.desc_len as u32;
        self.capacity = offsets.capacity;
        self.sender_pid = sender_pid;
        self.attached = AtomicU32::new(1);
        self._pad0 = 0;
        self.desc_offset = offsets.desc as u64;
        self.ring_offset = offsets.ring as u64;
        self.total_size = offsets.total_size as u64;
        self._pad1 = [0; 8];
    }

    pub fn validate(&self, mapped_len: usize) -> Result<SegmentOffsets, LayoutError> {
        if self.magic != SEGMENT_MAGIC {
            return Err(LayoutError::InvalidMagic {
                expected: "PRCSEGQ",
            });
        }
        if self.version >> 16 != SEGMENT_VERSION >> 16 {
            return Err(LayoutError::IncompatibleVersion {
                expected: SEGMENT_VERSION,
                found: self.version,
            });
        }
        if !self.capacity.is_power_of_two() {
            return Err(LayoutError::InvalidConfig(
                "ring capacity must be non-zero power of 2",
            ));
        }
        let offsets = SegmentOffsets::calculate(self.desc_len as usize, self.capacity);
        if offsets.desc as u64 != self.desc_offset
            || offsets.ring as u64 != self.ring_offset
            || offsets.total_size as u64 != self.total_size
        {
            return Err(LayoutError::InvalidConfig("segment offsets do not match"));
        }
        if offsets.total_size > mapped_len {
            return Err(LayoutError::TooSmall {
                required: offsets.total_size,
                found: mapped_len,
            });
        }
        Ok(offsets)
    }

    /// Take another reference, unless the segment was already released.
    pub fn try_retain(&self) -> bool {
        let mut current = self.attached.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return false;
            }
            match self.attached.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Drop a reference. Returns true for the last one.
    pub fn release(&self) -> bool {
        self.attached.fetch_sub(1, Ordering::AcqRel) == 1
    }
}

/// Byte offsets inside a queue segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentOffsets {
    pub desc: usize,
    pub desc_len: usize,
    pub ring: usize,
    pub capacity: u32,
    pub total_size: usize,
}

impl SegmentOffsets {
    pub fn calculate(desc_len: usize, capacity: u32) -> Self {
        let desc = size_of::<SegmentHeader>();
        let ring = align64(desc + desc_len);
        Self {
            desc,
            desc_len,
            ring,
            capacity,
            total_size: ring + ByteRing::required_size(capacity),
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    /// Invalid magic bytes.
    InvalidMagic { expected: &'static str },
    /// Incompatible layout version.
    IncompatibleVersion { expected: u32, found: u32 },
    /// Mapping smaller than the header claims.
    TooSmall { required: usize, found: usize },
    /// Invalid configuration in header.
    InvalidConfig(&'static str),
}

impl std::fmt::Display for LayoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidMagic { expected } => {
                write!(f, "invalid magic bytes (expected {})", expected)
            }
            Self::IncompatibleVersion { expected, found } => {
                write!(
                    f,
                    "incompatible version: expected {}.{}, found {}.{}",
                    expected >> 16,
                    expected & 0xFFFF,
                    found >> 16,
                    found & 0xFFFF
                )
            }
            Self::TooSmall { required, found } => {
                write!(f, "mapping too small: need {} bytes, got {}", required, found)
            }
            Self::InvalidConfig(msg) => write!(f, "invalid layout: {}", msg),
        }
    }
}

impl std::error::Error for LayoutError {}

// =============================================================================
// Helpers
// =============================================================================

#[inline]
pub const fn align64(n: usize) -> usize {
    (n + 63) & !63
}

/// Store `s` NUL-terminated, truncated to `NAME_LEN - 1` bytes on a char
/// boundary.
pub fn write_fixed(dst: &mut [u8; NAME_LEN], s: &str) {
    let s = truncate_on_char_boundary(s, NAME_LEN - 1);
    *dst = [0; NAME_LEN];
    dst[..s.len()].copy_from_slice(s.as_bytes());
}

pub fn read_fixed(src: &[u8]) -> &str {
    let end = src.iter().position(|&b| b == 0).unwrap_or(src.len());
    // Only ever written from &str through write_fixed.
    std::str::from_utf8(&src[..end]).unwrap_or_default()
}

pub fn truncate_on_char_boundary(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_are_aligned_and_ordered() {
        let o = RegistryOffsets::calculate(1024).unwrap();
        assert_eq!(o.slot_table, 384);
        assert_eq!(o.latch_table, 384 + 1024 * 192);
        assert!(o.token_table >= o.latch_table + 1024 * 8);
        assert_eq!(o.token_table % 64, 0);
        assert_eq!(o.total_size % 64, 0);
        assert!(o.total_size >= o.token_table + 1024 * 48);
    }

    #[test]
    fn fixed_names_truncate_on_char_boundary() {
        let mut buf = [0u8; NAME_LEN];
        let long = "é".repeat(40); // 80 bytes
        write_fixed(&mut buf, &long);
        let back = read_fixed(&buf);
        assert_eq!(back.len(), 62);
        assert!(long.starts_with(back));
        assert_eq!(buf[NAME_LEN - 1], 0);
    }

    #[test]
    fn segment_offsets_pad_descriptor() {
        let o = SegmentOffsets::calculate(10, 1024);
        assert_eq!(o.desc, 64);
        assert_eq!(o.ring, 128);
        assert_eq!(o.total_size, 128 + 192 + 1024);
    }

    #[test]
    fn segment_refcount_refuses_revival() {
        let header = SegmentHeader {
            magic: SEGMENT_MAGIC,
            version: SEGMENT_VERSION,
            desc_len: 0,
            capacity: 64,
            sender_pid: 1,
            attached: AtomicU32::new(1),
            _pad0: 0,
            desc_offset: 64,
            ring_offset: 64,
            total_size: 64 + 192 + 64,
            _pad1: [0; 8],
        };
        assert!(header.try_retain());
        assert!(!header.release());
        assert!(header.release());
        assert!(!header.try_retain());
    }

    #[test]
    fn state_names() {
        assert_eq!(EndpointState::from_raw(3), EndpointState::Attached);
        assert_eq!(EndpointState::from_raw(99).as_str(), "INVALID");
        assert_eq!(EndpointState::Ready.to_string(), "READY");
    }
}
