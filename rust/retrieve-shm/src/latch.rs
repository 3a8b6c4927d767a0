use core::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::futex::{futex_wait, futex_wake_all};

/// A cross-process wakeup flag.
///
/// `set` is sticky until `reset`. The usual pattern is reset, re-check the
/// condition, then `wait`: a `set` that races with the check is never lost.
///
/// The latch is `repr(C)` and all-zero is a valid unset, unowned latch, so it
/// can live directly in a fresh shared mapping.
#[repr(C)]
#[derive(Debug, Default)]
pub struct Latch {
    is_set: AtomicU32,
    owner_pid: AtomicU32,
}

const _: () = assert!(core::mem::size_of::<Latch>() == 8);

impl Latch {
    pub const fn new() -> Self {
        Self {
            is_set: AtomicU32::new(0),
            owner_pid: AtomicU32::new(0),
        }
    }

    /// Record `pid` as the process that waits on this latch.
    pub fn own(&self, pid: u32) {
        self.owner_pid.store(pid, Ordering::Release);
    }

    pub fn disown(&self) {
        self.owner_pid.store(0, Ordering::Release);
    }

    pub fn owner(&self) -> Option<u32> {
        match self.owner_pid.load(Ordering::Acquire) {
            0 => None,
            pid => Some(pid),
        }
    }

    pub fn set(&self) {
        if self.is_set.swap(1, Ordering::AcqRel) == 0 {
            futex_wake_all(&self.is_set);
        }
    }

    pub fn reset(&self) {
        self.is_set.store(0, Ordering::Release);
    }

    #[inline]
    pub fn is_set(&self) -> bool {
        self.is_set.load(Ordering::Acquire) != 0
    }

    /// Wait until the latch is set or `timeout` elapses.
    ///
    /// Returns whether the latch is set on return.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        if self.is_set() {
            return true;
        }
        futex_wait(&self.is_set, 0, timeout);
        self.is_set()
    }
}
