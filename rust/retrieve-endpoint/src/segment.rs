//! Queue segments: one shared file per endpoint holding the row-shape
//! descriptor and the byte queue rows travel through.
//!
//! Rows are framed as a 4-byte little-endian length followed by the payload,
//! so a row of any size (including empty, and larger than the ring) streams
//! through in order.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use facet::Facet;
use rand::Rng;
use retrieve_shm::{
    ByteConsumer, ByteProducer, ByteRing, ReceiverState, RingError, SenderState, ShmMapping,
    current_pid,
};

use crate::error::{EndpointError, Resource};
use crate::layout::{SegmentHeader, SegmentOffsets};
use crate::wait::WaitSet;

const FRAME_HEADER_LEN: usize = 4;

/// Attempts at finding an unused segment handle before giving up.
const HANDLE_ATTEMPTS: usize = 8;

/// One column of a row shape.
#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub struct ColumnDesc {
    pub name: String,
    pub type_oid: u32,
    pub type_mod: i32,
    pub nullable: bool,
}

/// Description of the rows an endpoint produces. Opaque to the queue;
/// retrievers read it back before the first row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Facet)]
pub struct RowShape {
    pub columns: Vec<ColumnDesc>,
}

impl RowShape {
    pub fn new(columns: Vec<ColumnDesc>) -> Self {
        Self { columns }
    }

    pub fn column(mut self, name: impl Into<String>, type_oid: u32) -> Self {
        self.columns.push(ColumnDesc {
            name: name.into(),
            type_oid,
            type_mod: -1,
            nullable: true,
        });
        self
    }

    pub fn encode(&self) -> Result<Vec<u8>, EndpointError> {
        facet_postcard::to_vec(self).map_err(|e| EndpointError::Descriptor(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, EndpointError> {
        facet_postcard::from_slice(bytes).map_err(|e| EndpointError::Descriptor(e.to_string()))
    }
}

/// Identifies a queue segment. Stored in the endpoint slot; 0 is never used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SegmentHandle(u64);

impl SegmentHandle {
    pub const fn from_raw(raw: u64) -> Option<Self> {
        if raw == 0 { None } else { Some(Self(raw)) }
    }

    pub const fn as_raw(self) -> u64 {
        self.0
    }

    pub fn path_in(self, dir: &Path) -> PathBuf {
        dir.join(format!("retrieve-seg-{:016x}", self.0))
    }
}

impl fmt::Display for SegmentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Where segments are created and how big their queues are.
#[derive(Debug, Clone)]
pub struct SegmentConfig {
    pub dir: PathBuf,
    pub capacity: u32,
}

/// A mapped segment. The last mapping to go away unlinks the file.
struct Segment {
    mapping: ShmMapping,
    handle: SegmentHandle,
    offsets: SegmentOffsets,
}

impl Segment {
    fn header(&self) -> &SegmentHeader {
        let region = self.mapping.region();
        // SAFETY: validated or initialized before the Segment was built, and
        // the mapping outlives the returned reference.
        unsafe { &*region.ptr::<SegmentHeader>(0) }
    }

    fn ring(&self) -> ByteRing {
        // SAFETY: the ring was initialized by `build`.
        unsafe { ByteRing::attach(self.mapping.region(), self.offsets.ring) }
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if self.header().release() {
            if let Err(e) = self.mapping.unlink() {
                tracing::warn!(segment = %self.handle, error = %e, "failed to unlink queue segment");
            } else {
                tracing::debug!(segment = %self.handle, "queue segment released");
            }
        }
    }
}

/// Create a segment for rows of `shape` and return its writer.
pub fn build(
    config: &SegmentConfig,
    shape: &RowShape,
) -> Result<(SegmentHandle, QueueWriter), EndpointError> {
    let desc = shape.encode()?;
    let offsets = SegmentOffsets::calculate(desc.len(), config.capacity);

    let mut rng = rand::thread_rng();
    let mut attempt = 0;
    let (handle, mapping) = loop {
        let handle = SegmentHandle(rng.r#gen::<u64>() | 1);
        match ShmMapping::create(handle.path_in(&config.dir), offsets.total_size) {
            Ok(mapping) => break (handle, mapping),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                attempt += 1;
                if attempt == HANDLE_ATTEMPTS {
                    return Err(EndpointError::ResourceExhausted(Resource::QueueSegment));
                }
            }
            Err(e) => return Err(e.into()),
        }
    };

    let region = mapping.region();
    // SAFETY: freshly created mapping, nobody else can have attached yet.
    unsafe {
        region
            .get_mut::<SegmentHeader>(0)
            .init(&offsets, current_pid());
        std::ptr::copy_nonoverlapping(desc.as_ptr(), region.offset(offsets.desc), desc.len());
    }
    // SAFETY: as above; the ring sits after the descriptor.
    let ring = unsafe { ByteRing::init(region, offsets.ring, offsets.capacity) };
    let producer = ring.into_producer();

    tracing::debug!(segment = %handle, size = offsets.total_size, "queue segment built");
    let segment = Arc::new(Segment {
        mapping,
        handle,
        offsets,
    });
    Ok((handle, QueueWriter { segment, producer }))
}

/// Attach to an existing segment and return its row shape and reader.
pub fn attach_reader(
    config: &SegmentConfig,
    handle: SegmentHandle,
) -> Result<(RowShape, QueueReader), EndpointError> {
    let mapping = ShmMapping::open(handle.path_in(&config.dir)).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => EndpointError::QueueDetached,
        _ => e.into(),
    })?;
    let region = mapping.region();
    if region.len() < std::mem::size_of::<SegmentHeader>() {
        return Err(EndpointError::QueueDetached);
    }
    // SAFETY: size checked above; contents validated next.
    let header = unsafe { region.get::<SegmentHeader>(0) };
    let offsets = header.validate(region.len())?;
    if !header.try_retain() {
        return Err(EndpointError::QueueDetached);
    }
    let sender_pid = header.sender_pid;
    let segment = Arc::new(Segment {
        mapping,
        handle,
        offsets,
    });

    // SAFETY: validate() checked that desc..desc + desc_len lies inside the
    // mapping, which `segment` keeps alive past this borrow.
    let desc = unsafe {
        std::slice::from_raw_parts(region.offset(offsets.desc), offsets.desc_len)
    };
    let shape = RowShape::decode(desc)?;
    let consumer = segment.ring().into_consumer();

    tracing::debug!(segment = %handle, "queue segment attached");
    Ok((
        shape,
        QueueReader {
            segment,
            consumer,
            sender_pid,
        },
    ))
}

/// Outcome of [`QueueWriter::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Sent,
    /// The receiver went away; nothing more will be read.
    ReceiverDetached,
}

/// Writer end of a queue segment.
pub struct QueueWriter {
    // Declared first so it drops before the mapping goes away.
    producer: ByteProducer,
    segment: Arc<Segment>,
}

impl QueueWriter {
    pub fn handle(&self) -> SegmentHandle {
        self.segment.handle
    }

    /// Send one framed message, blocking while the queue is full.
    pub fn send(&mut self, message: &[u8], waits: &WaitSet<'_>) -> Result<SendStatus, EndpointError> {
        let len = u32::try_from(message.len())
            .map_err(|_| EndpointError::Protocol("message longer than u32::MAX".into()))?;
        let header = len.to_le_bytes();
        match self
            .write_all(&header, waits)
            .and_then(|()| self.write_all(message, waits))
        {
            Ok(()) => Ok(SendStatus::Sent),
            Err(EndpointError::QueueDetached) => Ok(SendStatus::ReceiverDetached),
            Err(e) => Err(e),
        }
    }

    fn write_all(&mut self, mut bytes: &[u8], waits: &WaitSet<'_>) -> Result<(), EndpointError> {
        while !bytes.is_empty() {
            let seq = self.producer.space_seq();
            let n = self.producer.write_some(bytes)?;
            if n == 0 {
                waits.park(|tick| self.producer.wait_for_space(seq, tick))?;
            }
            bytes = &bytes[n..];
        }
        Ok(())
    }

    pub fn receiver_state(&self) -> ReceiverState {
        self.producer.receiver_state()
    }

    /// Detach after the last row. The reader sees end-of-stream.
    ///
    /// The returned handle keeps the segment mapped so the writer side can
    /// still watch the reader drain it.
    pub fn finish(self) -> FinishedQueue {
        tracing::trace!(segment = %self.segment.handle, status = %self.producer.status(), "queue writer finished");
        self.producer.finish();
        FinishedQueue {
            segment: self.segment,
        }
    }

    /// Detach without finishing. The reader sees a detached queue.
    pub fn abandon(self) {
        tracing::trace!(segment = %self.segment.handle, "queue writer abandoned");
        drop(self.producer);
    }
}

/// A queue whose writer finished, kept around until the reader is done.
pub struct FinishedQueue {
    segment: Arc<Segment>,
}

impl FinishedQueue {
    pub fn receiver_state(&self) -> ReceiverState {
        self.segment.ring().receiver_state()
    }

    /// The reader read through to the end or went away.
    pub fn is_done(&self) -> bool {
        matches!(
            self.receiver_state(),
            ReceiverState::Drained | ReceiverState::Detached
        )
    }
}

/// Reader end of a queue segment.
pub struct QueueReader {
    consumer: ByteConsumer,
    segment: Arc<Segment>,
    sender_pid: u32,
}

impl QueueReader {
    pub fn handle(&self) -> SegmentHandle {
        self.segment.handle
    }

    pub fn sender_pid(&self) -> u32 {
        self.sender_pid
    }

    pub fn sender_state(&self) -> SenderState {
        self.consumer.sender_state()
    }

    /// Next message, or `None` once the writer finished and everything was
    /// read. Blocks while the queue is empty.
    pub fn recv(&mut self, waits: &WaitSet<'_>) -> Result<Option<Bytes>, EndpointError> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        match self.read_exact(&mut header, waits) {
            Ok(()) => {}
            Err(ReadError::Closed { read: 0 }) => {
                self.consumer.mark_drained();
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_le_bytes(header) as usize;

        let mut body = BytesMut::zeroed(len);
        self.read_exact(&mut body, waits)?;
        Ok(Some(body.freeze()))
    }

    fn read_exact(&mut self, buf: &mut [u8], waits: &WaitSet<'_>) -> Result<(), ReadError> {
        let mut filled = 0;
        while filled < buf.len() {
            let seq = self.consumer.data_seq();
            match self.consumer.read_some(&mut buf[filled..]) {
                Ok(0) => {
                    waits
                        .park(|tick| self.consumer.wait_for_data(seq, tick))
                        .map_err(ReadError::Interrupted)?;
                }
                Ok(n) => filled += n,
                Err(RingError::Closed) => return Err(ReadError::Closed { read: filled }),
                Err(RingError::PeerDetached) => return Err(ReadError::Detached),
            }
        }
        Ok(())
    }
}

enum ReadError {
    Closed { read: usize },
    Detached,
    Interrupted(crate::wait::Interrupt),
}

impl From<ReadError> for EndpointError {
    fn from(e: ReadError) -> Self {
        match e {
            ReadError::Closed { .. } => {
                EndpointError::Protocol("queue finished in the middle of a message".into())
            }
            ReadError::Detached => EndpointError::QueueDetached,
            ReadError::Interrupted(i) => EndpointError::Interrupted(i),
        }
    }
}
