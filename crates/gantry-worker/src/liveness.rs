//! Parent process liveness

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::{getppid, Pid};

/// Answers questions about other processes
pub trait ProcessProbe: Send + Sync {
    /// Current parent PID of this process
    fn parent_pid(&self) -> i32;

    /// Check if a process with this PID exists
    fn is_running(&self, pid: i32) -> bool;
}

/// Probe backed by the operating system
#[derive(Debug, Clone, Copy, Default)]
pub struct OsProbe;

impl ProcessProbe for OsProbe {
    fn parent_pid(&self) -> i32 {
        getppid().as_raw()
    }

    fn is_running(&self, pid: i32) -> bool {
        if pid <= 0 {
            return false;
        }
        // Signal 0 only checks for existence; EPERM means it exists
        match kill(Pid::from_raw(pid), None::<Signal>) {
            Ok(()) => true,
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_own_process_is_running() {
        let probe = OsProbe;
        assert!(probe.is_running(std::process::id() as i32));
        assert!(probe.is_running(probe.parent_pid()));
    }

    #[test]
    fn test_invalid_pid_not_running() {
        let probe = OsProbe;
        assert!(!probe.is_running(0));
        assert!(!probe.is_running(-5));
    }
}
