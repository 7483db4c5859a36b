//! Process-wide stop signals
//!
//! `SIGTERM`, `SIGINT` and `SIGQUIT` set a flag that every
//! [`WorkerState::is_alive`](crate::WorkerState::is_alive) call honours. The
//! sync worker notices it within one poll interval, when its idle accept
//! times out; the cooperative worker on its next control-loop tick.

use gantry_core::Result;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::atomic::{AtomicBool, Ordering};

static STOP_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_stop(_: nix::libc::c_int) {
    STOP_REQUESTED.store(true, Ordering::SeqCst);
}

/// Install the stop handlers.
///
/// No `SA_RESTART`, so syscalls that do not retry on their own see `EINTR`.
pub fn install_stop_handlers() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(handle_stop),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for signal in [Signal::SIGTERM, Signal::SIGINT, Signal::SIGQUIT] {
        // SAFETY: the handler only stores to an atomic.
        unsafe { sigaction(signal, &action) }?;
    }
    Ok(())
}

/// Check if a stop signal arrived
pub fn stop_requested() -> bool {
    STOP_REQUESTED.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_stop_handlers() {
        assert!(install_stop_handlers().is_ok());
        // Installing twice replaces the same handler
        assert!(install_stop_handlers().is_ok());
    }
}
