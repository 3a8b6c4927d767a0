//! Process identity and liveness.

pub fn current_pid() -> u32 {
    std::process::id()
}

/// Whether a process with `pid` exists.
///
/// Signal 0 performs the permission and existence checks without sending
/// anything. `EPERM` means it exists but belongs to someone else.
pub fn process_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    // SAFETY: kill with signal 0 has no side effects.
    if unsafe { libc::kill(pid as libc::pid_t, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_process_is_alive() {
        assert!(process_alive(current_pid()));
    }

    #[test]
    fn zero_pid_is_never_alive() {
        assert!(!process_alive(0));
    }

    #[test]
    fn reaped_child_is_dead() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        assert!(!process_alive(pid));
    }
}
