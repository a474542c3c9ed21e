//! `free(NULL)` and unmatched pause traffic must be harmless in every
//! state, including before the first allocation ever happens in the
//! process. This suite never activates the engine.

mod common;

use common::*;
use core::ptr;

#[test]
fn free_null_is_a_noop_before_any_allocation() {
    // Must not crash and must not require the native free to be resolved.
    unsafe { om_free(ptr::null_mut()) };
    unsafe { om_free(ptr::null_mut()) };
}

#[test]
fn realloc_null_zero_is_harmless() {
    let pointer = unsafe { om_realloc(ptr::null_mut(), 0) };
    // realloc(NULL, 0) is malloc(0); whatever the native allocator
    // returned must be freeable.
    unsafe { om_free(pointer) };
}

#[test]
fn pausing_without_activation_is_harmless() {
    for _ in 0..32 {
        pause(1);
    }

    let thread = std::thread::spawn(|| {
        for _ in 0..32 {
            pause(1);
        }
        fragile_code(64);
    });

    fragile_code(64);
    thread.join().unwrap();

    for _ in 0..64 {
        resume();
    }
}
