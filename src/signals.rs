//! Signal-driven shutdown flag.
//!
//! SIGINT and SIGTERM flip one atomic; the event loop observes it after
//! the current iteration and returns cleanly.

use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::{SigHandler, Signal, signal};

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_shutdown(_: libc::c_int) {
    RUNNING.store(false, Ordering::SeqCst);
}

/// Install the SIGINT/SIGTERM handlers.
pub fn install() {
    unsafe {
        let _ = signal(Signal::SIGINT, SigHandler::Handler(handle_shutdown));
        let _ = signal(Signal::SIGTERM, SigHandler::Handler(handle_shutdown));
    }
}

pub fn running() -> bool {
    RUNNING.load(Ordering::SeqCst)
}

/// Request an orderly shutdown from inside the process.
pub fn request_stop() {
    RUNNING.store(false, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_request_flips_the_flag() {
        assert!(running());
        request_stop();
        assert!(!running());
        RUNNING.store(true, Ordering::SeqCst);
    }
}
