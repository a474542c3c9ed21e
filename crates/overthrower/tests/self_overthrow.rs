//! Self-overthrow mode: roughly half of the allocations served by the real
//! native allocator fail, even on pass-through paths, simulating a system
//! that is genuinely out of memory.

mod common;

use common::*;
use overthrower::platform;

#[test]
fn self_overthrow_fails_about_half_of_pass_through_allocations() {
    const ITERATIONS: usize = 2048;

    // Reserved up front: growing it inside the activation window would put
    // the buffer itself at the mercy of the coin flips.
    let mut survivors = Vec::with_capacity(ITERATIONS);

    configure_self_overthrow();
    activate();

    // Paused allocations bypass the failure engine entirely, so every null
    // here is a coin flip inside the non-failing allocator. Warm the
    // symbolizer's lazy caches first so the measured calls do no I/O that
    // could disturb errno.
    pause(0);
    fragile_code(16);

    const PAUSED_ITERATIONS: usize = 1024;
    let mut paused_failures = 0u32;
    let mut errno_untouched = true;
    for _ in 0..PAUSED_ITERATIONS {
        platform::set_errno(0);
        let buffer = unsafe { om_malloc(64) };
        if buffer.is_null() {
            paused_failures += 1;
            // The simulated-OS path never reaches the engine, so unlike a
            // synthetic failure it does not set ENOMEM.
            errno_untouched = errno_untouched && platform::errno() == 0;
        }
        unsafe { om_free(buffer) };
    }
    resume();

    // With strategy none, unpaused nulls come from the same coin flips (or
    // from a ledger-growth failure rolling the block back); both surface as
    // a real OOM with ENOMEM.
    let mut failures = 0u32;
    let mut errno_is_enomem = true;
    for _ in 0..ITERATIONS {
        platform::set_errno(0);
        let buffer = unsafe { om_malloc(64) };
        if buffer.is_null() {
            failures += 1;
            errno_is_enomem = errno_is_enomem && platform::errno() == libc::ENOMEM;
        } else {
            survivors.push(buffer);
        }
    }
    let survivor_count = survivors.len();
    for buffer in survivors.drain(..) {
        unsafe { om_free(buffer) };
    }

    assert_eq!(deactivate(), 0);

    assert!(errno_untouched, "paused coin-flip null modified errno");
    assert!(errno_is_enomem, "unpaused null did not set ENOMEM");

    let expected = (PAUSED_ITERATIONS / 2) as u32;
    let delta = expected / 10;
    assert!(
        paused_failures >= expected - delta && paused_failures <= expected + delta,
        "paused: {} failures out of {}",
        paused_failures,
        PAUSED_ITERATIONS
    );

    let expected = (ITERATIONS / 2) as u32;
    let delta = expected / 10;
    assert!(
        failures >= expected - delta && failures <= expected + delta,
        "unpaused: {} failures out of {}",
        failures,
        ITERATIONS
    );
    assert!(survivor_count > 0, "no allocation survived the coin flips");
}
