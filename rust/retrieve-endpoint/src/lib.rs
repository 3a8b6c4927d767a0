#![doc = include_str!("../README.md")]
#![forbid(unsafe_op_in_unsafe_fn)]

pub mod config;
pub mod control;
mod error;
pub mod layout;
pub mod placement;
mod registry;
mod retriever;
mod scope;
pub mod segment;
mod sender;
mod status;
mod token;
mod wait;

pub use config::RegistryConfig;
pub use control::{
    AckCollector, AckKind, ChannelLink, ConnectionProbe, CoordinatorLink, EndpointAck,
    SocketProbe, ack_channel,
};
pub use error::{EndpointError, Resource};
pub use layout::{EndpointSlot, EndpointState, LayoutError};
pub use placement::{EndpointPlacement, ProcessRole};
pub use registry::{EndpointLease, EndpointRegistry, SessionContext};
pub use retriever::{EndpointReader, RetrieveSession};
pub use scope::ResourceScope;
pub use segment::{ColumnDesc, RowShape, SegmentHandle, SendStatus};
pub use sender::{CloseHandle, Completion, EndpointSender, SenderPhase};
pub use status::{EndpointInfo, RegistryStats};
pub use token::{Token, TokenStore, lookup_session};
pub use wait::{Interrupt, Interrupts, Wake, WaitSet};
