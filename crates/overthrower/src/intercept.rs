//! The interposed allocation path.
//!
//! Everything an intercepted `malloc`/`free`/`realloc` does happens here, in
//! plain Rust functions that both the ELF-exported symbols and the Mach-O
//! interpose substitutes delegate to. The hooks are `#[inline(always)]` so
//! they collapse into the exported entrypoints and the classifier's
//! depth-pinned rules see one frame per interception, mirroring the single
//! entry function the classifier was calibrated against.

use crate::classifier;
use crate::config::{self, VERBOSE_FAILED_ALLOCATIONS};
use crate::init;
use crate::ledger;
use crate::platform;
use crate::stderr::report;
use crate::strategy;
use crate::thread_state;
use core::ffi::c_void;
use core::ptr;
use core::sync::atomic::{AtomicU32, Ordering};

/// Sequence-number source; zeroed by `activate`.
pub static ALLOCATION_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Allocate through the real native allocator, never through the failure
/// engine. In self-overthrow mode roughly half of these calls return null
/// anyway, emulating a system that is genuinely out of memory.
///
/// Allocations made under the trace guard are exempt from the coin flip:
/// the classifier and its symbolizer must keep the process alive, and a
/// failed allocation inside Rust library code aborts instead of returning
/// null. The flag check comes first so the common disabled case never
/// touches thread-local state.
///
/// # Safety
/// Standard `malloc` contract.
pub unsafe fn non_failing_malloc(size: usize) -> *mut c_void {
    if config::self_overthrow()
        && !thread_state::is_tracing()
        && strategy::self_overthrow_flip()
    {
        return ptr::null_mut();
    }
    platform::real_malloc(size)
}

/// Free through the real native allocator.
///
/// # Safety
/// `ptr` must be null or a pointer from the real native allocator.
pub unsafe fn non_failing_free(ptr: *mut c_void) {
    platform::real_free(ptr);
}

/// Run `f` with the trace flag set and the active pause slot raised to
/// infinity, so any allocation `f` performs takes the whitelisted
/// pass-through path instead of re-entering the failure engine.
#[inline]
fn with_tracing_suspended<R>(depth: usize, f: impl FnOnce() -> R) -> R {
    thread_state::set_tracing(true);
    let saved = thread_state::raise_pause(depth);
    let result = f();
    thread_state::restore_pause(depth, saved);
    thread_state::set_tracing(false);
    result
}

/// Interposed `malloc`.
///
/// # Safety
/// Standard `malloc` contract.
#[inline(always)]
pub unsafe fn malloc_hook(size: usize) -> *mut c_void {
    if !init::activated() {
        return non_failing_malloc(size);
    }

    let depth = thread_state::depth();

    let mut is_in_white_list = thread_state::is_tracing();
    let mut is_in_ignore_list = false;

    if !thread_state::is_tracing() {
        let verdict = with_tracing_suspended(depth, classifier::classify_call_site);
        is_in_white_list = verdict.0;
        is_in_ignore_list = verdict.1;
    }

    if thread_state::pause_remaining(depth) > 0 {
        thread_state::consume_pause(depth);
        return non_failing_malloc(size);
    }

    let seq_num = ALLOCATION_COUNTER.fetch_add(1, Ordering::Relaxed);

    if is_in_white_list || size == 0 {
        return non_failing_malloc(size);
    }

    if strategy::is_time_to_fail(seq_num) {
        if config::verbose_mode() >= VERBOSE_FAILED_ALLOCATIONS {
            with_tracing_suspended(depth, || {
                report!("\n### Failed allocation, sequential number: {} ###", seq_num);
                classifier::dump_stack();
            });
        }
        platform::set_errno(libc::ENOMEM);
        return ptr::null_mut();
    }

    let pointer = non_failing_malloc(size);

    if pointer.is_null() {
        // Real OOM (or a self-overthrow coin flip).
        platform::set_errno(libc::ENOMEM);
        return ptr::null_mut();
    }

    if !is_in_ignore_list {
        if !ledger::track(pointer, seq_num, size) {
            // The ledger could not grow: report a real OOM and roll the
            // caller's block back so nothing leaks untracked.
            non_failing_free(pointer);
            platform::set_errno(libc::ENOMEM);
            return ptr::null_mut();
        }
        if config::verbose_mode() > VERBOSE_FAILED_ALLOCATIONS {
            with_tracing_suspended(depth, || {
                report!(
                    "\n### Successful allocation, sequential number: {} ###",
                    seq_num
                );
                classifier::dump_stack();
            });
        }
    }

    pointer
}

/// Interposed `free`.
///
/// # Safety
/// Standard `free` contract.
#[inline(always)]
pub unsafe fn free_hook(pointer: *mut c_void) {
    if pointer.is_null() {
        // Must not touch the native pointer: on ELF it may still be
        // unresolved if no allocation has happened yet.
        return;
    }

    let saved_errno = platform::errno();

    if init::activated() {
        ledger::untrack(pointer);
    }

    platform::real_free(pointer);
    platform::set_errno(saved_errno);
}

/// Interposed `realloc`. Tracked blocks are relocated through the
/// interposed `malloc`/`free` pair so the ledger and the failure engine see
/// them; untracked blocks go straight to the native `realloc`.
///
/// # Safety
/// Standard `realloc` contract.
#[inline(always)]
pub unsafe fn realloc_hook(pointer: *mut c_void, size: usize) -> *mut c_void {
    if pointer.is_null() {
        return malloc_hook(size);
    }

    if size == 0 {
        free_hook(pointer);
        return ptr::null_mut();
    }

    let old_size = match ledger::tracked_size(pointer) {
        Some(old_size) => old_size,
        None => return platform::real_realloc(pointer, size),
    };

    let new_pointer = malloc_hook(size);
    if new_pointer.is_null() {
        // The old block stays valid so the caller can retry or back off.
        return ptr::null_mut();
    }

    ptr::copy_nonoverlapping(
        pointer.cast::<u8>(),
        new_pointer.cast::<u8>(),
        old_size.min(size),
    );
    free_hook(pointer);

    new_pointer
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread_state::PAUSE_FOREVER;

    #[test]
    fn non_failing_malloc_round_trips_through_the_native_allocator() {
        unsafe {
            let p = non_failing_malloc(64);
            assert!(!p.is_null());
            ptr::write_bytes(p.cast::<u8>(), 0xA5, 64);
            non_failing_free(p);
        }
    }

    #[test]
    fn tracing_suspension_restores_the_pause_slot() {
        thread_state::reset();
        let depth = thread_state::depth();
        let inner = with_tracing_suspended(depth, || {
            assert!(thread_state::is_tracing());
            thread_state::pause_remaining(depth)
        });
        assert_eq!(inner, PAUSE_FOREVER);
        assert!(!thread_state::is_tracing());
        assert_eq!(thread_state::pause_remaining(depth), 0);
    }

    #[test]
    fn hooks_pass_through_while_not_activated() {
        unsafe {
            let p = malloc_hook(128);
            assert!(!p.is_null());
            let q = realloc_hook(p, 256);
            assert!(!q.is_null());
            free_hook(q);
            free_hook(ptr::null_mut());
        }
    }
}
