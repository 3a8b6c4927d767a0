//! Bounded, cancellable waits.
//!
//! Every blocking point in the sender and retriever goes through a
//! [`WaitSet`]: it parks on a latch (or a ring futex) for at most one tick and
//! checks every cancellation source before and after, so a dead coordinator,
//! a closed cursor or a shutdown is noticed within one tick.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use retrieve_shm::{Latch, process_alive};

use crate::control::CoordinatorLink;
use crate::registry::EndpointRegistry;

/// Why a wait was cut short.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interrupt {
    /// The cursor was closed (or its transaction committed).
    Closed,
    /// The owning transaction aborted.
    Aborted,
    /// The coordinator connection or the peer process is gone.
    PeerLost,
    /// The process group is shutting down.
    Shutdown,
}

impl Interrupt {
    const fn bit(self) -> u32 {
        match self {
            Self::Closed => 1 << 0,
            Self::Aborted => 1 << 1,
            Self::PeerLost => 1 << 2,
            Self::Shutdown => 1 << 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Aborted => "aborted",
            Self::PeerLost => "peer lost",
            Self::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for Interrupt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sticky interrupt flags for one execution state, plus the latch that
/// raising them sets.
#[derive(Clone, Default)]
pub struct Interrupts {
    inner: Arc<InterruptsInner>,
}

#[derive(Default)]
struct InterruptsInner {
    pending: AtomicU32,
    latch: Latch,
}

impl Interrupts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self, interrupt: Interrupt) {
        let before = self
            .inner
            .pending
            .fetch_or(interrupt.bit(), Ordering::AcqRel);
        if before & interrupt.bit() == 0 {
            tracing::trace!(%interrupt, "interrupt raised");
        }
        self.inner.latch.set();
    }

    /// The most severe pending interrupt.
    pub fn pending(&self) -> Option<Interrupt> {
        let bits = self.inner.pending.load(Ordering::Acquire);
        [
            Interrupt::Shutdown,
            Interrupt::PeerLost,
            Interrupt::Aborted,
            Interrupt::Closed,
        ]
        .into_iter()
        .find(|i| bits & i.bit() != 0)
    }

    pub fn is_raised(&self, interrupt: Interrupt) -> bool {
        self.inner.pending.load(Ordering::Acquire) & interrupt.bit() != 0
    }

    pub fn latch(&self) -> &Latch {
        &self.inner.latch
    }
}

impl fmt::Debug for Interrupts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interrupts")
            .field("pending", &self.pending())
            .finish()
    }
}

/// How a single park ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    Signalled,
    Tick,
}

/// The set of things a blocking call races against.
#[derive(Clone, Copy)]
pub struct WaitSet<'a> {
    tick: Duration,
    registry: Option<&'a EndpointRegistry>,
    interrupts: Option<&'a Interrupts>,
    link: Option<&'a dyn CoordinatorLink>,
    peer_pid: Option<u32>,
}

impl<'a> WaitSet<'a> {
    pub fn new(tick: Duration) -> Self {
        Self {
            tick,
            registry: None,
            interrupts: None,
            link: None,
            peer_pid: None,
        }
    }

    /// Treat registry shutdown (or death of its host process) as
    /// [`Interrupt::Shutdown`].
    pub fn with_registry(mut self, registry: &'a EndpointRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_interrupts(mut self, interrupts: &'a Interrupts) -> Self {
        self.interrupts = Some(interrupts);
        self
    }

    /// Treat loss of the coordinator link as [`Interrupt::PeerLost`].
    pub fn with_link(mut self, link: &'a dyn CoordinatorLink) -> Self {
        self.link = Some(link);
        self
    }

    /// Treat death of process `pid` as [`Interrupt::PeerLost`].
    pub fn with_peer(mut self, pid: u32) -> Self {
        self.peer_pid = Some(pid);
        self
    }

    pub fn tick(&self) -> Duration {
        self.tick
    }

    /// Check every cancellation source once, most severe first.
    pub fn check(&self) -> Result<(), Interrupt> {
        if self.registry.is_some_and(|r| r.is_shutting_down()) {
            return Err(Interrupt::Shutdown);
        }
        if self.link.is_some_and(|l| !l.is_alive()) {
            return Err(Interrupt::PeerLost);
        }
        if self.peer_pid.is_some_and(|pid| !process_alive(pid)) {
            return Err(Interrupt::PeerLost);
        }
        match self.interrupts.and_then(Interrupts::pending) {
            Some(interrupt) => Err(interrupt),
            None => Ok(()),
        }
    }

    /// Run `park` for at most one tick, checking cancellation around it.
    /// `park` returns whether it was woken before the tick elapsed.
    pub fn park(&self, park: impl FnOnce(Duration) -> bool) -> Result<Wake, Interrupt> {
        self.check()?;
        let woke = park(self.tick);
        self.check()?;
        Ok(if woke { Wake::Signalled } else { Wake::Tick })
    }

    pub fn wait_latch(&self, latch: &Latch) -> Result<Wake, Interrupt> {
        self.park(|tick| latch.wait(Some(tick)))
    }

    /// Block until `ready` holds, re-checking after every latch wake and
    /// every tick.
    pub fn wait_until(&self, latch: &Latch, mut ready: impl FnMut() -> bool) -> Result<(), Interrupt> {
        loop {
            latch.reset();
            self.check()?;
            if ready() {
                return Ok(());
            }
            if self.wait_latch(latch)? == Wake::Tick {
                tracing::trace!("wait tick");
            }
        }
    }
}

impl fmt::Debug for WaitSet<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitSet")
            .field("tick", &self.tick)
            .field("registry", &self.registry.is_some())
            .field("interrupts", &self.interrupts)
            .field("link", &self.link.is_some())
            .field("peer_pid", &self.peer_pid)
            .finish()
    }
}
