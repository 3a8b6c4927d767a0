//! Discovery: what the registry currently holds.

use std::fmt;

use retrieve_shm::process_alive;

use crate::layout::{EndpointSlot, EndpointState};
use crate::segment::SegmentHandle;

/// Snapshot of one endpoint slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointInfo {
    pub name: String,
    pub cursor_name: String,
    pub database_id: u32,
    pub session_id: u64,
    pub user_id: u32,
    /// 0 once the sender finished or went away.
    pub sender_pid: u32,
    /// 0 while no retriever is attached.
    pub receiver_pid: u32,
    pub sender_alive: bool,
    pub state: EndpointState,
    pub queue_handle: Option<SegmentHandle>,
}

impl EndpointInfo {
    pub(crate) fn from_slot(slot: &EndpointSlot) -> Self {
        Self {
            name: slot.name().to_owned(),
            cursor_name: slot.cursor_name().to_owned(),
            database_id: slot.database_id,
            session_id: slot.session_id,
            user_id: slot.user_id,
            sender_pid: slot.sender_pid,
            receiver_pid: slot.receiver_pid,
            sender_alive: process_alive(slot.sender_pid),
            state: slot.state(),
            queue_handle: SegmentHandle::from_raw(slot.queue_handle),
        }
    }
}

impl fmt::Display for EndpointInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} cursor={} db={} session={} state={} sender={}{} receiver={}",
            self.name,
            self.cursor_name,
            self.database_id,
            self.session_id,
            self.state,
            self.sender_pid,
            if self.sender_alive { "" } else { " (gone)" },
            self.receiver_pid,
        )
    }
}

/// Occupancy of the registry tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    pub endpoints_in_use: usize,
    pub max_endpoints: usize,
    pub tokens_in_use: usize,
    pub max_tokens: usize,
    pub shutting_down: bool,
}

impl fmt::Display for RegistryStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "endpoints {}/{}, tokens {}/{}",
            self.endpoints_in_use, self.max_endpoints, self.tokens_in_use, self.max_tokens
        )?;
        if self.shutting_down {
            f.write_str(", shutting down")?;
        }
        Ok(())
    }
}
