#![no_main]

use libfuzzer_sys::fuzz_target;
use overthrower::{api, intercept, platform};
use std::ffi::c_void;

/// Fuzz target that interprets a byte slice as a strategy configuration
/// followed by a sequence of interposed-allocator operations.
///
/// Header (4 bytes): strategy selector, delay, duration, duty cycle.
/// Each operation is encoded as:
///   byte 0: opcode (0=malloc, 1=free, 2=realloc, 3=pause, 4=resume)
///   byte 1-2: size / pause duration (little-endian u16)
///   byte 3: slot index (which tracked pointer to operate on)
///
/// Injected failures are legal outcomes for any allocation; the invariants
/// checked are memory safety ones: a failed malloc sets ENOMEM, a failed
/// realloc leaves the old block intact, and live block contents survive.
const MAX_SLOTS: usize = 32;

fuzz_target!(|data: &[u8]| {
    if data.len() < 4 {
        return;
    }

    std::env::set_var("OVERTHROWER_STRATEGY", (data[0] % 4).to_string());
    std::env::set_var("OVERTHROWER_DELAY", (data[1] % 64).to_string());
    std::env::set_var("OVERTHROWER_DURATION", (data[2] % 100 + 1).to_string());
    std::env::set_var("OVERTHROWER_DUTY_CYCLE", (data[3] % 16 + 1).to_string());
    std::env::set_var("OVERTHROWER_SEED", "1");

    let mut slots: [*mut c_void; MAX_SLOTS] = [std::ptr::null_mut(); MAX_SLOTS];
    let mut sizes: [usize; MAX_SLOTS] = [0; MAX_SLOTS];
    let mut pauses: u32 = 0;

    api::activateOverthrower();

    let mut i = 4;
    while i + 4 <= data.len() {
        let opcode = data[i] % 5;
        let size = u16::from_le_bytes([data[i + 1], data[i + 2]]) as usize;
        let slot = (data[i + 3] as usize) % MAX_SLOTS;
        i += 4;

        match opcode {
            0 => {
                // malloc
                if !slots[slot].is_null() {
                    unsafe { intercept::free_hook(slots[slot]) };
                    slots[slot] = std::ptr::null_mut();
                }
                platform::set_errno(0);
                let ptr = unsafe { intercept::malloc_hook(size) };
                if ptr.is_null() {
                    if size > 0 {
                        assert_eq!(platform::errno(), libc::ENOMEM);
                    }
                } else {
                    unsafe {
                        std::ptr::write_bytes(ptr.cast::<u8>(), slot as u8, size.min(256));
                    }
                    slots[slot] = ptr;
                    sizes[slot] = size;
                }
            }
            1 => {
                // free
                unsafe { intercept::free_hook(slots[slot]) };
                slots[slot] = std::ptr::null_mut();
                sizes[slot] = 0;
            }
            2 => {
                // realloc
                let old_size = sizes[slot];
                let ptr = unsafe { intercept::realloc_hook(slots[slot], size) };
                if size == 0 {
                    slots[slot] = std::ptr::null_mut();
                    sizes[slot] = 0;
                } else if ptr.is_null() {
                    // Old block (if any) must still be readable and intact.
                    verify(slots[slot], old_size.min(256), slot as u8);
                } else {
                    verify(ptr, old_size.min(size).min(256), slot as u8);
                    unsafe {
                        std::ptr::write_bytes(ptr.cast::<u8>(), slot as u8, size.min(256));
                    }
                    slots[slot] = ptr;
                    sizes[slot] = size;
                }
            }
            3 => {
                // pause
                api::pauseOverthrower((size % 8) as u32);
                pauses += 1;
            }
            4 => {
                // resume (may underflow; that must be survivable)
                api::resumeOverthrower();
                pauses = pauses.saturating_sub(1);
            }
            _ => unreachable!(),
        }
    }

    for _ in 0..pauses {
        api::resumeOverthrower();
    }

    api::deactivateOverthrower();

    // Cleanup outside the activation window.
    for slot in &mut slots {
        if !slot.is_null() {
            unsafe { intercept::free_hook(*slot) };
            *slot = std::ptr::null_mut();
        }
    }
});

fn verify(ptr: *mut c_void, len: usize, expected: u8) {
    if ptr.is_null() {
        return;
    }
    for offset in 0..len {
        let byte = unsafe { ptr.cast::<u8>().add(offset).read() };
        assert_eq!(byte, expected, "content corrupted at offset {}", offset);
    }
}
