//! Process-wide interrupt flag set from the SIGINT handler
//!
//! Subprocess loops in `tools::runner` poll this flag; the terminal already
//! delivers SIGINT to the whole foreground process group, so children get the
//! signal themselves and are given a short grace period before a hard kill.

use std::sync::atomic::{AtomicBool, Ordering};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Exit code for a user interrupt, per POSIX convention (128 + SIGINT).
pub const INTERRUPT_EXIT_CODE: i32 = 130;

/// Install the SIGINT handler. Safe to call once from main.
pub fn install_handler() {
    let _ = ctrlc::set_handler(|| {
        INTERRUPTED.store(true, Ordering::SeqCst);
        crate::log_warn!("interrupt received, finishing in-flight work...");
    });
}

pub fn is_interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}
