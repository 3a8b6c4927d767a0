//! Retrieve side: authenticated sessions attaching to endpoints and reading
//! their rows.

use std::fmt;

use bytes::Bytes;
use retrieve_shm::current_pid;

use crate::error::EndpointError;
use crate::layout::{EndpointSlot, EndpointState};
use crate::registry::{EndpointRegistry, SessionContext, find_slot};
use crate::segment::{self, QueueReader, RowShape, SegmentHandle};
use crate::status::EndpointInfo;
use crate::wait::{Interrupts, WaitSet};

/// A retriever bound to one session and database by
/// [`EndpointRegistry::authenticate`].
#[derive(Clone)]
pub struct RetrieveSession {
    registry: EndpointRegistry,
    session: SessionContext,
}

impl RetrieveSession {
    pub(crate) fn new(registry: EndpointRegistry, session: SessionContext) -> Self {
        Self { registry, session }
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    /// Endpoints of the bound session and database.
    pub fn endpoints(&self) -> Vec<EndpointInfo> {
        let SessionContext {
            session_id,
            database_id,
            ..
        } = self.session;
        self.registry
            .endpoints_where(|s| s.session_id == session_id && s.database_id == database_id)
    }

    /// Attach to the endpoint called `name` as its only receiver.
    pub fn attach(&self, name: &str) -> Result<EndpointReader, EndpointError> {
        let pid = current_pid();
        let mut tables = self.registry.lock_exclusive();
        let index = find_slot(
            tables.slots,
            name,
            self.session.session_id,
            self.session.database_id,
        )
        .ok_or_else(|| EndpointError::NotFound {
            name: name.to_owned(),
        })?;
        let slot = &mut tables.slots[index];

        if slot.state() != EndpointState::Ready {
            tracing::debug!(endpoint = name, state = %slot.state(), receiver_pid = slot.receiver_pid, "endpoint not attachable");
            return Err(EndpointError::AlreadyAttached {
                name: name.to_owned(),
            });
        }
        let handle =
            SegmentHandle::from_raw(slot.queue_handle).ok_or(EndpointError::QueueDetached)?;
        let (shape, reader) = segment::attach_reader(&self.registry.segment_config(), handle)?;

        slot.receiver_pid = pid;
        slot.set_state(EndpointState::Attached);
        let generation = slot.generation;
        let sender_pid = slot.sender_pid;
        drop(tables);

        self.registry.latch(index).set();
        tracing::debug!(endpoint = name, segment = %handle, "retriever attached");
        Ok(EndpointReader {
            registry: self.registry.clone(),
            name: name.to_owned(),
            index,
            generation,
            sender_pid,
            shape,
            reader: Some(reader),
            finished: false,
            interrupts: Interrupts::new(),
        })
    }
}

impl fmt::Debug for RetrieveSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetrieveSession")
            .field("session", &self.session)
            .finish()
    }
}

/// Receiver of one endpoint's rows.
///
/// Dropping it detaches: the sender stops waiting for this receiver.
pub struct EndpointReader {
    registry: EndpointRegistry,
    name: String,
    index: usize,
    generation: u32,
    sender_pid: u32,
    shape: RowShape,
    reader: Option<QueueReader>,
    finished: bool,
    interrupts: Interrupts,
}

impl EndpointReader {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn row_shape(&self) -> &RowShape {
        &self.shape
    }

    /// Interrupts another thread can raise to cancel a blocked read.
    pub fn interrupts(&self) -> Interrupts {
        self.interrupts.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Next row, or `None` at end-of-stream. Blocks while the sender is
    /// still producing.
    pub fn next_row(&mut self) -> Result<Option<Bytes>, EndpointError> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(None);
        };
        if self.finished {
            return Ok(None);
        }
        let mut waits = WaitSet::new(self.registry.wait_tick())
            .with_registry(&self.registry)
            .with_interrupts(&self.interrupts);
        if self.sender_pid != 0 {
            waits = waits.with_peer(self.sender_pid);
        }

        match reader.recv(&waits)? {
            Some(row) => Ok(Some(row)),
            None => {
                self.finished = true;
                self.update_slot(|s| s.set_state(EndpointState::Finished));
                self.registry.latch(self.index).set();
                tracing::debug!(endpoint = %self.name, "end of stream");
                Ok(None)
            }
        }
    }

    /// Read up to `max_rows` rows. Fewer means end-of-stream was reached.
    pub fn retrieve(&mut self, max_rows: usize) -> Result<Vec<Bytes>, EndpointError> {
        self.update_slot(|s| {
            if s.state() == EndpointState::Attached {
                s.set_state(EndpointState::Retrieving);
            }
        });
        let mut rows = Vec::with_capacity(max_rows.min(1024));
        let result = loop {
            if rows.len() == max_rows {
                break Ok(());
            }
            match self.next_row() {
                Ok(Some(row)) => rows.push(row),
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        self.update_slot(|s| {
            if s.state() == EndpointState::Retrieving {
                s.set_state(EndpointState::Attached);
            }
        });
        result.map(|()| rows)
    }

    fn update_slot(&self, f: impl FnOnce(&mut EndpointSlot)) {
        let mut tables = self.registry.lock_exclusive();
        let slot = &mut tables.slots[self.index];
        if !slot.is_free() && slot.generation == self.generation {
            f(slot);
        }
    }
}

impl Drop for EndpointReader {
    fn drop(&mut self) {
        // Queue first, so the sender sees the detach when it wakes.
        drop(self.reader.take());
        let finished = self.finished;
        self.update_slot(|s| {
            s.receiver_pid = 0;
            if !finished && s.state() != EndpointState::Finished {
                s.set_state(EndpointState::Released);
            }
        });
        self.registry.latch(self.index).set();
        tracing::debug!(endpoint = %self.name, finished, "retriever detached");
    }
}

impl fmt::Debug for EndpointReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointReader")
            .field("name", &self.name)
            .field("finished", &self.finished)
            .finish()
    }
}
