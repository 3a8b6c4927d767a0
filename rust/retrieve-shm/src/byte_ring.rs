use core::fmt;
use core::mem::size_of;
use core::ptr;

use crate::region::Region;
use crate::sync::{AtomicU32, AtomicU64, Ordering};

/// Producer-side attachment state, stored in the ring header.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderState {
    Pending = 0,
    Attached = 1,
    /// Detached after writing everything it meant to write.
    Finished = 2,
    /// Went away without finishing.
    Detached = 3,
}

impl SenderState {
    fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::Pending,
            1 => Self::Attached,
            2 => Self::Finished,
            _ => Self::Detached,
        }
    }
}

/// Consumer-side attachment state, stored in the ring header.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Pending = 0,
    Attached = 1,
    /// Read through to the producer's finish.
    Drained = 2,
    Detached = 3,
}

impl ReceiverState {
    fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::Pending,
            1 => Self::Attached,
            2 => Self::Drained,
            _ => Self::Detached,
        }
    }
}

/// Byte ring header (192 bytes, producer and consumer indices on separate
/// cache lines).
#[repr(C)]
pub struct ByteRingHeader {
    /// Total bytes published (written by producer, read by consumer).
    pub head: AtomicU64,
    _pad1: [u8; 56],

    /// Total bytes consumed (written by consumer, read by producer).
    pub tail: AtomicU64,
    _pad2: [u8; 56],

    /// Data capacity in bytes (power of 2, immutable after init).
    pub capacity: u32,
    sender_state: AtomicU32,
    receiver_state: AtomicU32,
    /// Bumped by the producer whenever the consumer may have work.
    pub data_seq: AtomicU32,
    /// Bumped by the consumer whenever the producer may make progress.
    pub space_seq: AtomicU32,
    _pad3: [u8; 44],
}

#[cfg(not(loom))]
const _: () = assert!(core::mem::size_of::<ByteRingHeader>() == 192);

impl ByteRingHeader {
    pub fn init(&mut self, capacity: u32) {
        assert!(capacity.is_power_of_two(), "capacity must be power of 2");
        self.head = AtomicU64::new(0);
        self._pad1 = [0; 56];
        self.tail = AtomicU64::new(0);
        self._pad2 = [0; 56];
        self.capacity = capacity;
        self.sender_state = AtomicU32::new(SenderState::Pending as u32);
        self.receiver_state = AtomicU32::new(ReceiverState::Pending as u32);
        self.data_seq = AtomicU32::new(0);
        self.space_seq = AtomicU32::new(0);
        self._pad3 = [0; 44];
    }

    #[inline]
    pub fn len(&self) -> u64 {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        head.saturating_sub(tail)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Errors from ring reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingError {
    /// The other side went away without finishing.
    PeerDetached,
    /// The ring is empty and the producer finished.
    Closed,
}

impl fmt::Display for RingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerDetached => write!(f, "peer detached from ring"),
            Self::Closed => write!(f, "ring closed by producer"),
        }
    }
}

impl core::error::Error for RingError {}

/// A single-producer single-consumer byte stream in a shared memory region.
///
/// The ring moves raw bytes; framing is up to the caller. Both indices count
/// total bytes ever transferred, so `head - tail` is the fill level.
pub struct ByteRing {
    region: Region,
    header_offset: usize,
    data_offset: usize,
}

unsafe impl Send for ByteRing {}
unsafe impl Sync for ByteRing {}

impl ByteRing {
    /// Bytes needed for a ring of `capacity` data bytes.
    pub const fn required_size(capacity: u32) -> usize {
        size_of::<ByteRingHeader>() + capacity as usize
    }

    /// Initialize a new ring in the region.
    ///
    /// # Safety
    ///
    /// The region must be writable and exclusively owned during initialization.
    pub unsafe fn init(region: Region, header_offset: usize, capacity: u32) -> Self {
        assert!(
            capacity.is_power_of_two() && capacity > 0,
            "capacity must be power of 2"
        );
        assert!(
            header_offset.is_multiple_of(64),
            "header_offset must be 64-byte aligned"
        );
        let data_offset = header_offset + size_of::<ByteRingHeader>();
        assert!(
            data_offset + capacity as usize <= region.len(),
            "region too small for ring"
        );

        let header = unsafe { region.get_mut::<ByteRingHeader>(header_offset) };
        header.init(capacity);

        Self {
            region,
            header_offset,
            data_offset,
        }
    }

    /// Attach to an existing ring in the region.
    ///
    /// # Safety
    ///
    /// The region must contain a valid, initialized ring header.
    pub unsafe fn attach(region: Region, header_offset: usize) -> Self {
        assert!(
            header_offset.is_multiple_of(64),
            "header_offset must be 64-byte aligned"
        );
        let data_offset = header_offset + size_of::<ByteRingHeader>();
        let header = unsafe { region.get::<ByteRingHeader>(header_offset) };
        let capacity = header.capacity;
        assert!(
            capacity.is_power_of_two() && capacity > 0,
            "invalid ring capacity"
        );
        assert!(
            data_offset + capacity as usize <= region.len(),
            "region too small for ring"
        );

        Self {
            region,
            header_offset,
            data_offset,
        }
    }

    #[inline]
    fn header(&self) -> &ByteRingHeader {
        unsafe { self.region.get::<ByteRingHeader>(self.header_offset) }
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.header().capacity
    }

    pub fn sender_state(&self) -> SenderState {
        SenderState::from_raw(self.header().sender_state.load(Ordering::Acquire))
    }

    pub fn receiver_state(&self) -> ReceiverState {
        ReceiverState::from_raw(self.header().receiver_state.load(Ordering::Acquire))
    }

    pub fn status(&self) -> RingStatus {
        let header = self.header();
        let head = header.head.load(Ordering::Acquire);
        let tail = header.tail.load(Ordering::Acquire);
        RingStatus {
            head,
            tail,
            capacity: header.capacity,
            len: head.saturating_sub(tail) as u32,
        }
    }

    /// Take the producer end. Marks the sender attached.
    pub fn into_producer(self) -> ByteProducer {
        self.header()
            .sender_state
            .store(SenderState::Attached as u32, Ordering::Release);
        ByteProducer {
            ring: self,
            done: false,
        }
    }

    /// Take the consumer end. Marks the receiver attached.
    pub fn into_consumer(self) -> ByteConsumer {
        self.header()
            .receiver_state
            .store(ReceiverState::Attached as u32, Ordering::Release);
        self.notify_space();
        ByteConsumer {
            ring: self,
            done: false,
        }
    }

    fn notify_data(&self) {
        let seq = &self.header().data_seq;
        seq.fetch_add(1, Ordering::Release);
        #[cfg(all(feature = "std", not(loom)))]
        crate::futex::futex_wake_all(seq);
    }

    fn notify_space(&self) {
        let seq = &self.header().space_seq;
        seq.fetch_add(1, Ordering::Release);
        #[cfg(all(feature = "std", not(loom)))]
        crate::futex::futex_wake_all(seq);
    }

    unsafe fn copy_in(&self, at: u64, bytes: &[u8]) {
        let cap = self.capacity() as usize;
        let pos = (at & (cap as u64 - 1)) as usize;
        let first = bytes.len().min(cap - pos);
        let base = self.region.offset(self.data_offset);
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), base.add(pos), first);
            ptr::copy_nonoverlapping(bytes.as_ptr().add(first), base, bytes.len() - first);
        }
    }

    unsafe fn copy_out(&self, at: u64, buf: &mut [u8]) {
        let cap = self.capacity() as usize;
        let pos = (at & (cap as u64 - 1)) as usize;
        let first = buf.len().min(cap - pos);
        let base = self.region.offset(self.data_offset);
        unsafe {
            ptr::copy_nonoverlapping(base.add(pos), buf.as_mut_ptr(), first);
            ptr::copy_nonoverlapping(base, buf.as_mut_ptr().add(first), buf.len() - first);
        }
    }
}

/// Producer handle. Dropping it without [`ByteProducer::finish`] marks the
/// sender detached.
pub struct ByteProducer {
    ring: ByteRing,
    done: bool,
}

impl ByteProducer {
    /// Copy as many bytes as fit. `Ok(0)` means the ring is full (or `bytes`
    /// is empty).
    pub fn write_some(&mut self, bytes: &[u8]) -> Result<usize, RingError> {
        if self.ring.receiver_state() == ReceiverState::Detached {
            return Err(RingError::PeerDetached);
        }
        if bytes.is_empty() {
            return Ok(0);
        }
        let header = self.ring.header();
        let head = header.head.load(Ordering::Relaxed);
        let tail = header.tail.load(Ordering::Acquire);
        let free = header.capacity as u64 - head.wrapping_sub(tail);
        if free == 0 {
            return Ok(0);
        }
        let n = (free as usize).min(bytes.len());
        unsafe { self.ring.copy_in(head, &bytes[..n]) };
        header.head.store(head + n as u64, Ordering::Release);
        self.ring.notify_data();
        Ok(n)
    }

    pub fn free_space(&self) -> usize {
        let header = self.ring.header();
        header.capacity as usize - header.len() as usize
    }

    /// Snapshot to pass to [`ByteProducer::wait_for_space`]. Take it before
    /// the write attempt that came up short.
    pub fn space_seq(&self) -> u32 {
        self.ring.header().space_seq.load(Ordering::Acquire)
    }

    #[cfg(all(feature = "std", not(loom)))]
    pub fn wait_for_space(&self, seq: u32, timeout: std::time::Duration) -> bool {
        crate::futex::futex_wait(&self.ring.header().space_seq, seq, Some(timeout))
    }

    pub fn receiver_state(&self) -> ReceiverState {
        self.ring.receiver_state()
    }

    pub fn status(&self) -> RingStatus {
        self.ring.status()
    }

    /// Detach after writing everything. The consumer sees end-of-stream once
    /// it has read the remaining bytes.
    pub fn finish(mut self) {
        self.ring
            .header()
            .sender_state
            .store(SenderState::Finished as u32, Ordering::Release);
        self.ring.notify_data();
        self.done = true;
    }
}

impl Drop for ByteProducer {
    fn drop(&mut self) {
        if !self.done {
            self.ring
                .header()
                .sender_state
                .store(SenderState::Detached as u32, Ordering::Release);
            self.ring.notify_data();
        }
    }
}

/// Consumer handle. Dropping it marks the receiver detached unless it already
/// drained the ring.
pub struct ByteConsumer {
    ring: ByteRing,
    done: bool,
}

impl ByteConsumer {
    /// Copy out up to `buf.len()` bytes.
    ///
    /// `Ok(0)` means nothing is available yet. Once the ring is empty and the
    /// producer is gone this returns [`RingError::Closed`] (finished) or
    /// [`RingError::PeerDetached`] (abandoned).
    pub fn read_some(&mut self, buf: &mut [u8]) -> Result<usize, RingError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let header = self.ring.header();
        // State before head: everything published before the producer left is
        // visible once we see it gone.
        let sender = self.ring.sender_state();
        let tail = header.tail.load(Ordering::Relaxed);
        let head = header.head.load(Ordering::Acquire);
        let available = head.wrapping_sub(tail);
        if available == 0 {
            return match sender {
                SenderState::Finished => Err(RingError::Closed),
                SenderState::Detached => Err(RingError::PeerDetached),
                SenderState::Pending | SenderState::Attached => Ok(0),
            };
        }
        let n = (available as usize).min(buf.len());
        unsafe { self.ring.copy_out(tail, &mut buf[..n]) };
        header.tail.store(tail + n as u64, Ordering::Release);
        self.ring.notify_space();
        Ok(n)
    }

    pub fn available(&self) -> usize {
        self.ring.header().len() as usize
    }

    pub fn data_seq(&self) -> u32 {
        self.ring.header().data_seq.load(Ordering::Acquire)
    }

    #[cfg(all(feature = "std", not(loom)))]
    pub fn wait_for_data(&self, seq: u32, timeout: std::time::Duration) -> bool {
        crate::futex::futex_wait(&self.ring.header().data_seq, seq, Some(timeout))
    }

    pub fn sender_state(&self) -> SenderState {
        self.ring.sender_state()
    }

    /// Record that the consumer read through to the producer's finish.
    pub fn mark_drained(&mut self) {
        self.ring
            .header()
            .receiver_state
            .store(ReceiverState::Drained as u32, Ordering::Release);
        self.ring.notify_space();
        self.done = true;
    }
}

impl Drop for ByteConsumer {
    fn drop(&mut self) {
        if !self.done {
            self.ring
                .header()
                .receiver_state
                .store(ReceiverState::Detached as u32, Ordering::Release);
            self.ring.notify_space();
        }
    }
}

/// Snapshot of ring indices.
#[derive(Debug, Clone, Copy)]
pub struct RingStatus {
    pub head: u64,
    pub tail: u64,
    pub capacity: u32,
    pub len: u32,
}

impl fmt::Display for RingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "head={} tail={} len={}/{}",
            self.head, self.tail, self.len, self.capacity
        )
    }
}
