//! Activation flag plus load-time and unload-time hooks.
//!
//! The flag lives next to the hooks on purpose: every interposed call reads
//! it, which keeps this compilation unit referenced and the `#[used]`
//! constructor/destructor pair linked into any binary that pulls the crate
//! in as an rlib, not just into the preloaded shared object.
//!
//! The constructor prints the waiting banner and eagerly resolves the
//! native allocator on ELF targets; the destructor catches processes that
//! exit while still activated and deactivates them so the leak report is
//! never silently lost.

use crate::lifecycle;
use crate::platform;
use crate::stderr::report;
use core::sync::atomic::{AtomicBool, Ordering};

static ACTIVATED: AtomicBool = AtomicBool::new(false);

/// True while the failure engine is armed. Pass-through otherwise.
#[inline]
pub fn activated() -> bool {
    ACTIVATED.load(Ordering::Relaxed)
}

pub(crate) fn set_activated(armed: bool) {
    ACTIVATED.store(armed, Ordering::Relaxed);
}

/// Library constructor -- runs when the dynamic loader maps the library,
/// before `main()`.
#[used]
#[cfg_attr(target_os = "linux", link_section = ".init_array")]
#[cfg_attr(target_os = "macos", link_section = "__DATA,__mod_init_func")]
static CTOR: unsafe extern "C" fn() = {
    unsafe extern "C" fn banner() {
        platform::sys::resolve_real_functions();
        report!("overthrower is waiting for the activation signal ...");
        report!("Invoke activateOverthrower and overthrower will start his job.");
    }
    banner
};

/// Library destructor -- implicit deactivation on process teardown.
#[used]
#[cfg_attr(target_os = "linux", link_section = ".fini_array")]
#[cfg_attr(target_os = "macos", link_section = "__DATA,__mod_term_func")]
static DTOR: unsafe extern "C" fn() = {
    unsafe extern "C" fn shutdown() {
        if !activated() {
            return;
        }
        report!("overthrower has not been deactivated explicitly, doing it anyway.");
        lifecycle::deactivate();
    }
    shutdown
};
