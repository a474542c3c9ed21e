//! Activation lifecycle: activate, deactivate, pause, resume.
//!
//! While not activated every interposed call is a pass-through; activation
//! re-reads the environment and rearms the sequence counter, so calling it
//! twice is benign. Deactivation reports outstanding blocks and returns
//! their count.

use crate::config;
use crate::init;
use crate::intercept::ALLOCATION_COUNTER;
use crate::ledger;
use crate::stderr::report;
use crate::thread_state::{self, PopOutcome, PushOutcome, PAUSE_FOREVER};
use core::sync::atomic::Ordering;

/// Arm the failure engine: reset the sequence counter, load configuration
/// from the environment and announce the chosen parameters on stderr.
pub fn activate() {
    #[cfg(target_os = "macos")]
    crate::platform::macos::prewarm_stdio();

    ALLOCATION_COUNTER.store(0, Ordering::Relaxed);

    report!("overthrower got activation signal.");
    report!("overthrower will use following parameters for failing allocations:");
    config::load_from_env();

    init::set_activated(true);
}

/// Disarm the failure engine. Reports every block still tracked in the
/// ledger to stderr and returns the count (zero on a clean run).
pub fn deactivate() -> u32 {
    config::clear_self_overthrow();
    init::set_activated(false);
    thread_state::reset();

    report!("overthrower got deactivation signal.");
    report!("overthrower will not fail allocations anymore.");

    ledger::report_and_clear()
}

/// Let the next `duration` allocations on this thread pass unconditionally;
/// `duration == 0` pauses until the matching `resume`.
pub fn pause(duration: u32) {
    let countdown = if duration == 0 { PAUSE_FOREVER } else { duration };

    if thread_state::push_pause(countdown) == PushOutcome::Overflowed {
        report!("pause stack overflow detected.");
    }
}

/// Pop the innermost pause on this thread.
pub fn resume() {
    if thread_state::pop_pause() == PopOutcome::Underflowed {
        report!("pause stack underflow detected.");
    }
}
