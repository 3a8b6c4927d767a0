//! Futex wait/wake on 32-bit words that may live in shared memory.
//!
//! On Linux these are real (non-private) futex syscalls, so a word in a
//! `MAP_SHARED` mapping wakes waiters in other processes. Elsewhere waiting
//! degrades to a short sleep-and-recheck loop and waking is a no-op.

use core::sync::atomic::AtomicU32;
use std::time::Duration;

/// Block while `*word == expected`, for at most `timeout`.
///
/// Returns `false` if the timeout elapsed, `true` otherwise (woken, value
/// changed, or a spurious return). Callers must re-check their condition.
pub fn futex_wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) -> bool {
    imp::wait(word, expected, timeout)
}

/// Wake every waiter blocked on `word`.
pub fn futex_wake_all(word: &AtomicU32) {
    imp::wake_all(word)
}

#[cfg(target_os = "linux")]
mod imp {
    use super::*;

    pub(super) fn wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) -> bool {
        let ts = timeout.map(|d| libc::timespec {
            tv_sec: d.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
            tv_nsec: d.subsec_nanos() as libc::c_long,
        });
        let ts_ptr = ts
            .as_ref()
            .map_or(core::ptr::null(), |t| t as *const libc::timespec);

        // SAFETY: word points to a live, aligned u32; FUTEX_WAIT only reads it.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_futex,
                word.as_ptr(),
                libc::FUTEX_WAIT,
                expected,
                ts_ptr,
                core::ptr::null::<u32>(),
                0u32,
            )
        };
        if rc == 0 {
            return true;
        }
        match std::io::Error::last_os_error().raw_os_error() {
            Some(libc::ETIMEDOUT) => false,
            // EAGAIN: value already changed. EINTR: spurious.
            _ => true,
        }
    }

    pub(super) fn wake_all(word: &AtomicU32) {
        // SAFETY: FUTEX_WAKE does not dereference beyond the word address.
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                word.as_ptr(),
                libc::FUTEX_WAKE,
                i32::MAX,
                core::ptr::null::<libc::timespec>(),
                core::ptr::null::<u32>(),
                0u32,
            );
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use super::*;
    use core::sync::atomic::Ordering;
    use std::time::Instant;

    const POLL: Duration = Duration::from_millis(1);

    pub(super) fn wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if word.load(Ordering::Acquire) != expected {
                return true;
            }
            let nap = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    (deadline - now).min(POLL)
                }
                None => POLL,
            };
            std::thread::sleep(nap);
        }
    }

    pub(super) fn wake_all(_word: &AtomicU32) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn wait_returns_immediately_when_value_differs() {
        let word = AtomicU32::new(5);
        let start = Instant::now();
        assert!(futex_wait(&word, 4, Some(Duration::from_secs(5))));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn wait_times_out() {
        let word = AtomicU32::new(0);
        assert!(!futex_wait(&word, 0, Some(Duration::from_millis(20))));
    }

    #[test]
    fn wake_all_wakes_waiter() {
        let word = Arc::new(AtomicU32::new(0));
        let waiter = {
            let word = word.clone();
            std::thread::spawn(move || {
                while word.load(Ordering::Acquire) == 0 {
                    futex_wait(&word, 0, Some(Duration::from_millis(100)));
                }
            })
        };
        std::thread::sleep(Duration::from_millis(10));
        word.store(1, Ordering::Release);
        futex_wake_all(&word);
        waiter.join().unwrap();
    }
}
