//! Worker side of an endpoint.
//!
//! An [`EndpointSender`] walks one endpoint through its lifecycle:
//!
//! ```text
//! INIT -> QUEUE_BUILT -> REGISTERED -> READY_ACKED -> STREAMING
//!      -> DRAIN_WAIT -> FINISHED_ACKED -> CLOSE_WAIT -> FREED
//! ```
//!
//! with ABORTED reachable from every non-terminal phase. The shared part of
//! that state ([`ExecState`]) is registered with a [`ResourceScope`] so an
//! aborting transaction can tear the endpoint down from outside.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use retrieve_shm::{Latch, ReceiverState, process_alive};

use crate::control::{AckKind, CoordinatorLink, EndpointAck};
use crate::error::EndpointError;
use crate::layout::EndpointState;
use crate::registry::{EndpointLease, EndpointRegistry, SessionContext};
use crate::scope::{ResourceScope, WeakScope};
use crate::segment::{self, FinishedQueue, QueueWriter, RowShape, SendStatus};
use crate::wait::{Interrupt, Interrupts, WaitSet};

/// Where a sender is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SenderPhase {
    Init,
    QueueBuilt,
    Registered,
    ReadyAcked,
    Streaming,
    DrainWait,
    FinishedAcked,
    CloseWait,
    Freed,
    Aborted,
}

impl SenderPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::QueueBuilt => "QUEUE_BUILT",
            Self::Registered => "REGISTERED",
            Self::ReadyAcked => "READY_ACKED",
            Self::Streaming => "STREAMING",
            Self::DrainWait => "DRAIN_WAIT",
            Self::FinishedAcked => "FINISHED_ACKED",
            Self::CloseWait => "CLOSE_WAIT",
            Self::Freed => "FREED",
            Self::Aborted => "ABORTED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Freed | Self::Aborted)
    }
}

impl fmt::Display for SenderPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an endpoint ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The cursor was closed after the stream.
    Closed,
    /// Torn down early.
    Aborted(Interrupt),
}

/// The part of a sender shared with its scope.
pub(crate) struct ExecState {
    name: String,
    registry: EndpointRegistry,
    slot: usize,
    interrupts: Interrupts,
    link: Arc<dyn CoordinatorLink>,
    inner: Mutex<ExecInner>,
}

struct ExecInner {
    phase: SenderPhase,
    lease: Option<EndpointLease>,
    /// Taken by the sender thread while it blocks on the queue.
    writer: Option<QueueWriter>,
    ready_acked: bool,
    finished_acked: bool,
}

impl ExecState {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn phase(&self) -> SenderPhase {
        self.inner.lock().phase
    }

    fn latch(&self) -> &Latch {
        self.registry.latch(self.slot)
    }

    /// Raise `interrupt` and wake the sender wherever it waits.
    pub(crate) fn raise(&self, interrupt: Interrupt) {
        self.interrupts.raise(interrupt);
        self.latch().set();
    }

    /// An attached receiver process died without detaching.
    fn receiver_lost(&self) -> bool {
        let inner = self.inner.lock();
        inner
            .lease
            .as_ref()
            .and_then(|lease| lease.receiver_pid())
            .is_some_and(|pid| !process_alive(pid))
    }

    fn advance(&self, from: &[SenderPhase], to: SenderPhase) -> Result<(), EndpointError> {
        let mut inner = self.inner.lock();
        if !from.contains(&inner.phase) {
            return Err(EndpointError::InvalidPhase {
                expected: from.first().map_or("", |p| p.as_str()),
                actual: inner.phase,
            });
        }
        tracing::debug!(endpoint = %self.name, from = %inner.phase, to = %to, "sender phase");
        inner.phase = to;
        Ok(())
    }

    fn send_ack(&self, kind: AckKind) -> Result<(), EndpointError> {
        self.link.send_ack(EndpointAck {
            kind,
            worker: 0,
            endpoint: self.name.clone(),
        })
    }

    /// Tear the endpoint down without blocking. Returns false if it was
    /// already torn down.
    pub(crate) fn abort(&self, reason: Interrupt) -> bool {
        let (from, lease, writer, ack) = {
            let mut inner = self.inner.lock();
            if inner.phase.is_terminal() {
                return false;
            }
            let from = std::mem::replace(&mut inner.phase, SenderPhase::Aborted);
            let ack = inner.ready_acked && !inner.finished_acked;
            inner.finished_acked |= ack;
            (from, inner.lease.take(), inner.writer.take(), ack)
        };
        self.raise(reason);

        // Abandon before freeing so a blocked reader sees the detach.
        if let Some(writer) = writer {
            writer.abandon();
        }
        if let Some(lease) = lease {
            lease.free();
        }
        if ack && self.link.is_alive() {
            if let Err(e) = self.send_ack(AckKind::Finished) {
                tracing::warn!(endpoint = %self.name, error = %e, "could not send finished ack while aborting");
            }
        }
        tracing::info!(endpoint = %self.name, %from, %reason, "endpoint aborted");
        true
    }
}

impl fmt::Debug for ExecState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecState")
            .field("name", &self.name)
            .field("phase", &self.phase())
            .field("interrupts", &self.interrupts)
            .finish()
    }
}

/// Worker-side driver of one endpoint.
pub struct EndpointSender {
    state: Arc<ExecState>,
    scope: WeakScope,
}

impl EndpointSender {
    /// Build the queue, publish the endpoint and report READY to the
    /// coordinator.
    ///
    /// On failure everything acquired so far is released again.
    pub fn declare(
        scope: &ResourceScope,
        session: &SessionContext,
        cursor_name: &str,
        shape: &RowShape,
        link: Arc<dyn CoordinatorLink>,
    ) -> Result<Self, EndpointError> {
        let registry = scope.registry().clone();

        let (handle, writer) = segment::build(&registry.segment_config(), shape)?;
        tracing::debug!(cursor = cursor_name, segment = %handle, phase = %SenderPhase::QueueBuilt, "sender phase");

        let lease = match registry.allocate(session, cursor_name, handle) {
            Ok(lease) => lease,
            Err(e) => {
                writer.abandon();
                return Err(e);
            }
        };

        let state = Arc::new(ExecState {
            name: lease.name().to_owned(),
            slot: lease.index(),
            registry,
            interrupts: Interrupts::new(),
            link,
            inner: Mutex::new(ExecInner {
                phase: SenderPhase::Registered,
                lease: Some(lease),
                writer: Some(writer),
                ready_acked: false,
                finished_acked: false,
            }),
        });
        tracing::debug!(endpoint = %state.name, phase = %SenderPhase::Registered, "sender phase");
        scope.register(state.clone());
        let sender = Self {
            state,
            scope: scope.downgrade(),
        };

        // READY goes out under the lock so a concurrent abort either sees it
        // acked or keeps it from being sent. Dropping `sender` on failure
        // takes the abort path.
        {
            let mut inner = sender.state.inner.lock();
            if inner.phase != SenderPhase::Registered {
                return Err(EndpointError::InvalidPhase {
                    expected: SenderPhase::Registered.as_str(),
                    actual: inner.phase,
                });
            }
            sender.state.send_ack(AckKind::Ready)?;
            inner.ready_acked = true;
            inner.phase = SenderPhase::ReadyAcked;
        }
        tracing::debug!(endpoint = %sender.state.name, phase = %SenderPhase::ReadyAcked, "sender phase");
        Ok(sender)
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    pub fn phase(&self) -> SenderPhase {
        self.state.phase()
    }

    /// Handle that closes just this cursor, usable from another thread while
    /// [`EndpointSender::finish`] waits.
    pub fn close_handle(&self) -> CloseHandle {
        CloseHandle {
            name: self.state.name.clone(),
            state: Arc::downgrade(&self.state),
        }
    }

    fn waits(&self) -> WaitSet<'_> {
        WaitSet::new(self.state.registry.wait_tick())
            .with_registry(&self.state.registry)
            .with_interrupts(&self.state.interrupts)
            .with_link(self.state.link.as_ref())
    }

    /// Send one row, blocking while the queue is full.
    ///
    /// `ReceiverDetached` means the retriever went away; the caller should
    /// stop producing. An interrupt aborts the endpoint.
    pub fn send_row(&mut self, row: &[u8]) -> Result<SendStatus, EndpointError> {
        let mut writer = {
            let mut inner = self.state.inner.lock();
            if !matches!(inner.phase, SenderPhase::ReadyAcked | SenderPhase::Streaming) {
                return Err(EndpointError::InvalidPhase {
                    expected: SenderPhase::Streaming.as_str(),
                    actual: inner.phase,
                });
            }
            inner.phase = SenderPhase::Streaming;
            match inner.writer.take() {
                Some(writer) => writer,
                None => {
                    return Err(EndpointError::InvalidPhase {
                        expected: SenderPhase::Streaming.as_str(),
                        actual: inner.phase,
                    });
                }
            }
        };

        let result = writer.send(row, &self.waits());

        {
            let mut inner = self.state.inner.lock();
            if inner.phase == SenderPhase::Aborted {
                drop(inner);
                writer.abandon();
            } else {
                inner.writer = Some(writer);
            }
        }
        if let Err(EndpointError::Interrupted(interrupt)) = &result {
            self.abort_with(*interrupt);
        }
        result
    }

    /// Finish the stream and see the endpoint through to the cursor close.
    ///
    /// A sender that was already torn down reports how it ended.
    pub fn finish(self) -> Result<Completion, EndpointError> {
        let writer = {
            let mut inner = self.state.inner.lock();
            if inner.phase == SenderPhase::Aborted {
                let reason = self.state.interrupts.pending().unwrap_or(Interrupt::Aborted);
                return Ok(Completion::Aborted(reason));
            }
            if !matches!(inner.phase, SenderPhase::ReadyAcked | SenderPhase::Streaming) {
                return Err(EndpointError::InvalidPhase {
                    expected: SenderPhase::Streaming.as_str(),
                    actual: inner.phase,
                });
            }
            tracing::debug!(endpoint = %self.state.name, from = %inner.phase, to = %SenderPhase::DrainWait, "sender phase");
            inner.phase = SenderPhase::DrainWait;
            inner.writer.take()
        };
        let Some(writer) = writer else {
            return Ok(self.abort_with(Interrupt::Aborted));
        };

        let waits = self.waits();
        let latch = self.state.latch();
        let mut closed = false;

        // A receiver has to show up (or the cursor be closed) before the
        // stream can end.
        match waits.wait_until(latch, || {
            writer.receiver_state() != ReceiverState::Pending || self.state.receiver_lost()
        }) {
            Ok(()) => {}
            Err(Interrupt::Closed) => closed = true,
            Err(interrupt) => {
                writer.abandon();
                return Ok(self.abort_with(interrupt));
            }
        }

        let finished = writer.finish();
        if !closed {
            match waits.wait_until(latch, || finished.is_done() || self.state.receiver_lost()) {
                Ok(()) => {}
                Err(Interrupt::Closed) => closed = true,
                Err(interrupt) => return Ok(self.abort_with(interrupt)),
            }
        }

        if let Err(interrupt) = self.ack_finished() {
            return Ok(self.abort_with(interrupt));
        }

        if !closed {
            if self
                .state
                .advance(&[SenderPhase::FinishedAcked], SenderPhase::CloseWait)
                .is_err()
            {
                let reason = self.state.interrupts.pending().unwrap_or(Interrupt::Aborted);
                return Ok(Completion::Aborted(reason));
            }
            match wait_for_close(&waits, latch) {
                Interrupt::Closed => {}
                interrupt => return Ok(self.abort_with(interrupt)),
            }
        }

        Ok(self.free(finished))
    }

    fn ack_finished(&self) -> Result<(), Interrupt> {
        let lease_alive = {
            let inner = self.state.inner.lock();
            if inner.phase != SenderPhase::DrainWait {
                return Err(self.state.interrupts.pending().unwrap_or(Interrupt::Aborted));
            }
            inner.lease.as_ref().and_then(|lease| {
                lease.update(|slot| {
                    slot.set_state(EndpointState::Finished);
                    slot.sender_pid = 0;
                })
            })
        };
        if lease_alive.is_none() {
            return Err(Interrupt::Aborted);
        }

        if let Err(e) = self.state.send_ack(AckKind::Finished) {
            tracing::warn!(endpoint = %self.state.name, error = %e, "coordinator gone before finished ack");
            return Err(Interrupt::PeerLost);
        }
        let mut inner = self.state.inner.lock();
        inner.finished_acked = true;
        tracing::debug!(endpoint = %self.state.name, from = %inner.phase, to = %SenderPhase::FinishedAcked, "sender phase");
        inner.phase = SenderPhase::FinishedAcked;
        Ok(())
    }

    fn free(&self, finished: FinishedQueue) -> Completion {
        let lease = {
            let mut inner = self.state.inner.lock();
            if inner.phase.is_terminal() {
                return Completion::Aborted(self.state.interrupts.pending().unwrap_or(Interrupt::Aborted));
            }
            inner.phase = SenderPhase::Freed;
            inner.lease.take()
        };
        if let Some(lease) = lease {
            lease.free();
        }
        drop(finished);
        self.scope.deregister(&self.state);
        tracing::debug!(endpoint = %self.state.name, "endpoint freed");
        Completion::Closed
    }

    fn abort_with(&self, interrupt: Interrupt) -> Completion {
        self.state.abort(interrupt);
        self.scope.deregister(&self.state);
        Completion::Aborted(interrupt)
    }

    /// Tear the endpoint down now. Safe to call more than once.
    pub fn abort(&mut self) {
        self.abort_with(Interrupt::Aborted);
    }
}

/// Park until an interrupt fires; in CLOSE_WAIT the expected one is
/// [`Interrupt::Closed`].
fn wait_for_close(waits: &WaitSet<'_>, latch: &Latch) -> Interrupt {
    loop {
        latch.reset();
        if let Err(interrupt) = waits.wait_latch(latch) {
            return interrupt;
        }
    }
}

impl Drop for EndpointSender {
    fn drop(&mut self) {
        if !self.state.phase().is_terminal() {
            tracing::warn!(endpoint = %self.state.name, phase = %self.state.phase(), "sender dropped mid-stream");
            self.abort_with(Interrupt::Aborted);
        }
    }
}

impl fmt::Debug for EndpointSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointSender")
            .field("name", &self.state.name)
            .field("phase", &self.state.phase())
            .finish()
    }
}

/// Closes one cursor without touching the rest of its scope.
///
/// Does nothing once the endpoint is gone.
#[derive(Clone)]
pub struct CloseHandle {
    name: String,
    state: Weak<ExecState>,
}

impl CloseHandle {
    pub fn close(&self) {
        if let Some(state) = self.state.upgrade() {
            tracing::debug!(endpoint = %self.name, "cursor closed");
            state.raise(Interrupt::Closed);
        }
    }
}

impl fmt::Debug for CloseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloseHandle")
            .field("name", &self.name)
            .finish()
    }
}
