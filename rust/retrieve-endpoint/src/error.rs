use std::io;

use retrieve_shm::RingError;

use crate::layout::LayoutError;
use crate::sender::SenderPhase;
use crate::wait::Interrupt;

/// Shared table whose capacity ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    EndpointSlots,
    TokenTable,
    QueueSegment,
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EndpointSlots => write!(f, "endpoint slots"),
            Self::TokenTable => write!(f, "token table"),
            Self::QueueSegment => write!(f, "queue segment"),
        }
    }
}

/// Errors from endpoint operations.
#[derive(Debug)]
pub enum EndpointError {
    /// I/O error creating, opening or mapping shared memory.
    Io(io::Error),
    /// Shared memory contents do not match the expected layout.
    Layout(LayoutError),
    /// Configuration rejected before anything was created.
    InvalidConfig(&'static str),
    /// No free entry in a fixed-capacity shared table.
    ResourceExhausted(Resource),
    /// Token missing, malformed, or not valid for this user.
    AuthenticationFailed,
    /// No endpoint with this name in the caller's session and database.
    NotFound { name: String },
    /// The endpoint already has a live receiver.
    AlreadyAttached { name: String },
    /// Row-shape descriptor could not be encoded or decoded.
    Descriptor(String),
    /// The queue peer went away in the middle of the protocol.
    QueueDetached,
    /// Queue contents violate the framing protocol.
    Protocol(String),
    /// Operation not allowed in the sender's current phase.
    InvalidPhase {
        expected: &'static str,
        actual: SenderPhase,
    },
    /// A blocking call was cancelled.
    Interrupted(Interrupt),
    /// Acknowledgement could not be delivered to the coordinator.
    Coordinator(String),
    /// Coordinator-side wait ran out of time.
    Timeout,
}

impl std::fmt::Display for EndpointError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::Layout(e) => write!(f, "layout error: {}", e),
            Self::InvalidConfig(e) => write!(f, "invalid configuration: {}", e),
            Self::ResourceExhausted(r) => write!(f, "out of {}", r),
            Self::AuthenticationFailed => write!(f, "authentication failed"),
            Self::NotFound { name } => write!(f, "endpoint {:?} not found", name),
            Self::AlreadyAttached { name } => {
                write!(f, "endpoint {:?} already has a receiver", name)
            }
            Self::Descriptor(e) => write!(f, "row descriptor error: {}", e),
            Self::QueueDetached => write!(f, "queue peer detached"),
            Self::Protocol(e) => write!(f, "queue protocol violation: {}", e),
            Self::InvalidPhase { expected, actual } => {
                write!(f, "sender is {}, expected {}", actual, expected)
            }
            Self::Interrupted(i) => write!(f, "interrupted: {}", i),
            Self::Coordinator(e) => write!(f, "coordinator link error: {}", e),
            Self::Timeout => write!(f, "timed out"),
        }
    }
}

impl std::error::Error for EndpointError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Layout(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for EndpointError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<LayoutError> for EndpointError {
    fn from(e: LayoutError) -> Self {
        Self::Layout(e)
    }
}

impl From<Interrupt> for EndpointError {
    fn from(i: Interrupt) -> Self {
        Self::Interrupted(i)
    }
}

impl From<RingError> for EndpointError {
    fn from(e: RingError) -> Self {
        match e {
            RingError::PeerDetached => Self::QueueDetached,
            RingError::Closed => Self::Protocol("queue closed mid-message".into()),
        }
    }
}
