//! C-ABI surface.
//!
//! On ELF targets the allocator symbols are exported under their libc names
//! and win by preload ordering; on Mach-O they are exported under substitute
//! names and wired up through a `__DATA,__interpose` table. Both shells
//! delegate to the hooks in `intercept`, which inline into them so the stack
//! classifier sees a single frame per interception.

use crate::intercept;
use crate::lifecycle;
use core::ffi::c_void;
use libc::c_uint;

// ============================================================================
// Interposed allocator symbols
// ============================================================================

#[cfg(target_os = "linux")]
mod entrypoints {
    use super::*;

    /// # Safety
    /// Standard `malloc` contract.
    #[no_mangle]
    pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
        intercept::malloc_hook(size)
    }

    /// # Safety
    /// Standard `free` contract.
    #[no_mangle]
    pub unsafe extern "C" fn free(pointer: *mut c_void) {
        intercept::free_hook(pointer);
    }

    /// # Safety
    /// Standard `realloc` contract.
    #[no_mangle]
    pub unsafe extern "C" fn realloc(pointer: *mut c_void, size: usize) -> *mut c_void {
        intercept::realloc_hook(pointer, size)
    }
}

#[cfg(target_os = "macos")]
mod entrypoints {
    use super::*;

    /// # Safety
    /// Standard `malloc` contract.
    #[no_mangle]
    pub unsafe extern "C" fn overthrower_malloc(size: usize) -> *mut c_void {
        intercept::malloc_hook(size)
    }

    /// # Safety
    /// Standard `free` contract.
    #[no_mangle]
    pub unsafe extern "C" fn overthrower_free(pointer: *mut c_void) {
        intercept::free_hook(pointer);
    }

    /// # Safety
    /// Standard `realloc` contract.
    #[no_mangle]
    pub unsafe extern "C" fn overthrower_realloc(pointer: *mut c_void, size: usize) -> *mut c_void {
        intercept::realloc_hook(pointer, size)
    }
}

pub use entrypoints::*;

// ============================================================================
// Mach-O interpose table: {substitute, original} pairs consumed by dyld
// ============================================================================

#[cfg(target_os = "macos")]
mod interpose {
    use super::entrypoints::*;

    #[repr(C)]
    struct InterposeEntry {
        substitute: *const (),
        original: *const (),
    }

    // SAFETY: immutable function pointers resolved at load time.
    unsafe impl Sync for InterposeEntry {}

    #[link_section = "__DATA,__interpose"]
    #[used]
    static INTERPOSING_FUNCTIONS: [InterposeEntry; 3] = [
        InterposeEntry {
            substitute: overthrower_malloc as *const (),
            original: libc::malloc as *const (),
        },
        InterposeEntry {
            substitute: overthrower_realloc as *const (),
            original: libc::realloc as *const (),
        },
        InterposeEntry {
            substitute: overthrower_free as *const (),
            original: libc::free as *const (),
        },
    ];
}

// ============================================================================
// Lifecycle exports
// ============================================================================

#[no_mangle]
#[allow(non_snake_case)]
pub extern "C" fn activateOverthrower() {
    lifecycle::activate();
}

/// Returns the number of blocks still tracked since activation.
#[no_mangle]
#[allow(non_snake_case)]
pub extern "C" fn deactivateOverthrower() -> c_uint {
    lifecycle::deactivate()
}

/// `duration == 0` pauses until the matching `resumeOverthrower`.
#[no_mangle]
#[allow(non_snake_case)]
pub extern "C" fn pauseOverthrower(duration: c_uint) {
    lifecycle::pause(duration);
}

#[no_mangle]
#[allow(non_snake_case)]
pub extern "C" fn resumeOverthrower() {
    lifecycle::resume();
}
