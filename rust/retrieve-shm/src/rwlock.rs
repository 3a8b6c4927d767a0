//! A reader/writer lock that lives in shared memory.
//!
//! The whole lock is one state word: the top bit marks an exclusive holder,
//! the remaining bits count shared holders. Contended acquirers sleep on the
//! word with a futex and retry. There is no writer preference.

use core::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::futex::{futex_wait, futex_wake_all};

const WRITER: u32 = 1 << 31;
const READERS: u32 = WRITER - 1;

/// Upper bound on a single sleep while contended.
const CONTENDED_NAP: Duration = Duration::from_millis(50);

#[repr(C)]
#[derive(Debug, Default)]
pub struct ShmRwLock {
    state: AtomicU32,
    /// Pid of the exclusive holder, for diagnostics.
    writer_pid: AtomicU32,
}

const _: () = assert!(core::mem::size_of::<ShmRwLock>() == 8);

impl ShmRwLock {
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(0),
            writer_pid: AtomicU32::new(0),
        }
    }

    pub fn read(&self) -> ShmReadGuard<'_> {
        loop {
            let s = self.state.load(Ordering::Acquire);
            if s & WRITER == 0 {
                assert!(s & READERS != READERS, "too many shared holders");
                if self
                    .state
                    .compare_exchange_weak(s, s + 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return ShmReadGuard { lock: self };
                }
                continue;
            }
            futex_wait(&self.state, s, Some(CONTENDED_NAP));
        }
    }

    pub fn write(&self) -> ShmWriteGuard<'_> {
        loop {
            match self
                .state
                .compare_exchange(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
            {
                Ok(_) => {
                    self.writer_pid
                        .store(std::process::id(), Ordering::Relaxed);
                    return ShmWriteGuard { lock: self };
                }
                Err(s) => {
                    futex_wait(&self.state, s, Some(CONTENDED_NAP));
                }
            }
        }
    }

    pub fn try_write(&self) -> Option<ShmWriteGuard<'_>> {
        self.state
            .compare_exchange(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| {
                self.writer_pid
                    .store(std::process::id(), Ordering::Relaxed);
                ShmWriteGuard { lock: self }
            })
    }

    /// Pid of the current exclusive holder, if any.
    pub fn writer(&self) -> Option<u32> {
        if self.state.load(Ordering::Acquire) & WRITER == 0 {
            return None;
        }
        match self.writer_pid.load(Ordering::Relaxed) {
            0 => None,
            pid => Some(pid),
        }
    }

    fn unlock_read(&self) {
        if self.state.fetch_sub(1, Ordering::Release) == 1 {
            futex_wake_all(&self.state);
        }
    }

    fn unlock_write(&self) {
        self.writer_pid.store(0, Ordering::Relaxed);
        self.state.store(0, Ordering::Release);
        futex_wake_all(&self.state);
    }
}

#[must_use = "the lock is released when the guard is dropped"]
pub struct ShmReadGuard<'a> {
    lock: &'a ShmRwLock,
}

impl Drop for ShmReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock_read();
    }
}

#[must_use = "the lock is released when the guard is dropped"]
pub struct ShmWriteGuard<'a> {
    lock: &'a ShmRwLock,
}

impl Drop for ShmWriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock_write();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU64;
    use std::vec::Vec;

    #[test]
    fn readers_share_writer_excludes() {
        let lock = ShmRwLock::new();
        let r1 = lock.read();
        let r2 = lock.read();
        assert!(lock.try_write().is_none());
        drop(r1);
        drop(r2);
        let w = lock.try_write().expect("uncontended");
        assert_eq!(lock.writer(), Some(std::process::id()));
        drop(w);
        assert_eq!(lock.writer(), None);
    }

    #[test]
    fn writers_serialize_across_threads() {
        let lock = Arc::new(ShmRwLock::new());
        // Non-atomic read-modify-write under the lock; a lost update means
        // two writers overlapped.
        let counter = Arc::new(AtomicU64::new(0));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let lock = lock.clone();
                let counter = counter.clone();
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        let _g = lock.write();
                        let v = counter.load(Ordering::Relaxed);
                        std::thread::yield_now();
                        counter.store(v + 1, Ordering::Relaxed);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 8 * 500);
    }

    #[test]
    fn blocked_writer_proceeds_after_reader_leaves() {
        let lock = Arc::new(ShmRwLock::new());
        let guard = lock.read();
        let writer = {
            let lock = lock.clone();
            std::thread::spawn(move || {
                let _g = lock.write();
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        assert!(!writer.is_finished());
        drop(guard);
        writer.join().unwrap();
    }
}
