//! Shared plumbing for the integration suites.
//!
//! Tests drive the same hooks the exported `malloc`/`free`/`realloc`
//! symbols collapse into, so they exercise the interposed path on every
//! platform without depending on preload ordering. While the engine is
//! activated with a failing strategy the test code must not allocate
//! through Rust itself; patterns are therefore recorded into fixed stack
//! buffers, the way the fragile demo programs do it.

#![allow(dead_code)]

use core::ffi::c_void;
use overthrower::api;
use overthrower::intercept;

pub const ALL_VARS: [&str; 7] = [
    "OVERTHROWER_STRATEGY",
    "OVERTHROWER_SEED",
    "OVERTHROWER_DUTY_CYCLE",
    "OVERTHROWER_DELAY",
    "OVERTHROWER_DURATION",
    "OVERTHROWER_SELF_OVERTHROW",
    "OVERTHROWER_VERBOSE",
];

pub fn clear_env() {
    for name in ALL_VARS {
        std::env::remove_var(name);
    }
}

pub fn configure_none() {
    clear_env();
    std::env::set_var("OVERTHROWER_STRATEGY", "3");
}

pub fn configure_step(delay: u32) {
    clear_env();
    std::env::set_var("OVERTHROWER_STRATEGY", "1");
    std::env::set_var("OVERTHROWER_DELAY", delay.to_string());
}

pub fn configure_pulse(delay: u32, duration: u32) {
    clear_env();
    std::env::set_var("OVERTHROWER_STRATEGY", "2");
    std::env::set_var("OVERTHROWER_DELAY", delay.to_string());
    std::env::set_var("OVERTHROWER_DURATION", duration.to_string());
}

pub fn configure_random(seed: u32, duty_cycle: u32) {
    clear_env();
    std::env::set_var("OVERTHROWER_STRATEGY", "0");
    std::env::set_var("OVERTHROWER_SEED", seed.to_string());
    std::env::set_var("OVERTHROWER_DUTY_CYCLE", duty_cycle.to_string());
}

/// Strategy none plus the self-overthrow coin flips, so every null comes
/// from the simulated-OS path rather than the failure engine.
pub fn configure_self_overthrow() {
    clear_env();
    std::env::set_var("OVERTHROWER_STRATEGY", "3");
    std::env::set_var("OVERTHROWER_SELF_OVERTHROW", "1");
}

pub fn set_verbose(mode: u32) {
    std::env::set_var("OVERTHROWER_VERBOSE", mode.to_string());
}

pub fn activate() {
    api::activateOverthrower();
}

pub fn deactivate() -> u32 {
    api::deactivateOverthrower()
}

pub fn pause(duration: u32) {
    api::pauseOverthrower(duration);
}

pub fn resume() {
    api::resumeOverthrower();
}

pub unsafe fn om_malloc(size: usize) -> *mut c_void {
    intercept::malloc_hook(size)
}

pub unsafe fn om_free(pointer: *mut c_void) {
    intercept::free_hook(pointer);
}

pub unsafe fn om_realloc(pointer: *mut c_void, size: usize) -> *mut c_void {
    intercept::realloc_hook(pointer, size)
}

/// The fragile workload from the demo programs: allocate a small string,
/// touch it, free it. Survives injected failures by skipping the touch.
pub fn fragile_code(iterations: usize) {
    for _ in 0..iterations {
        unsafe {
            let string = om_malloc(7);
            if !string.is_null() {
                core::ptr::write_bytes(string.cast::<u8>(), b's', 6);
            }
            om_free(string);
        }
    }
}

/// Run `pattern.len()` small allocations, recording b'+' for success and
/// b'-' for injected failure. Returns the failure count. Performs no Rust
/// allocations, so it is safe to run inside an activation window.
pub fn failure_counter(pattern: &mut [u8]) -> u32 {
    let mut counter = 0;
    for slot in pattern.iter_mut() {
        unsafe {
            let string = om_malloc(7);
            if string.is_null() {
                counter += 1;
                *slot = b'-';
            } else {
                core::ptr::write_bytes(string.cast::<u8>(), b's', 6);
                *slot = b'+';
            }
            om_free(string);
        }
    }
    counter
}

/// Expected pattern for the step strategy: `delay` passes, then failures.
pub fn expected_step_pattern(pattern: &mut [u8], delay: usize) {
    for (i, slot) in pattern.iter_mut().enumerate() {
        *slot = if i < delay { b'+' } else { b'-' };
    }
}

/// Expected pattern for the pulse strategy: `delay` passes, `duration`
/// failures, passes again.
pub fn expected_pulse_pattern(pattern: &mut [u8], delay: usize, duration: usize) {
    for (i, slot) in pattern.iter_mut().enumerate() {
        *slot = if i < delay || i >= delay + duration {
            b'+'
        } else {
            b'-'
        };
    }
}
