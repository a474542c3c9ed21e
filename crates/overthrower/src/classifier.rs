//! Stack classifier: decides, per intercepted allocation, whether the call
//! site is *whitelisted* (must never be failed) and/or *ignored* (not
//! recorded in the leak ledger).
//!
//! The match rules are pinned to fixed call depths below the interposed
//! entry, so nothing on the walk path may be inlined: the walker and its
//! caller both carry `#[inline(never)]`. Symbolization allocates; callers
//! run the classifier with the trace flag set and the active pause slot
//! raised, which routes those inner allocations through the pass-through
//! path.

use crate::config::{self, VERBOSE_NO};
use crate::stderr::report;
use core::fmt::{self, Write};

#[cfg(target_os = "linux")]
pub const MAX_STACK_DEPTH: u32 = 7;
#[cfg(target_os = "macos")]
pub const MAX_STACK_DEPTH: u32 = 5;
pub const MAX_STACK_DEPTH_VERBOSE: u32 = 256;

/// Demangled symbol names land in a fixed stack buffer. Heap-allocating
/// them here would put the classifier's own allocations at the mercy of
/// self-overthrow coin flips.
const SYMBOL_CAPACITY: usize = 256;

struct NameBuf {
    buf: [u8; SYMBOL_CAPACITY],
    len: usize,
}

impl NameBuf {
    const fn new() -> Self {
        Self {
            buf: [0; SYMBOL_CAPACITY],
            len: 0,
        }
    }

    fn as_str(&self) -> &str {
        // Truncation can split a multi-byte character; fall back rather
        // than misreport.
        core::str::from_utf8(&self.buf[..self.len]).unwrap_or("???")
    }
}

impl fmt::Write for NameBuf {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for &byte in s.as_bytes() {
            if self.len < SYMBOL_CAPACITY {
                self.buf[self.len] = byte;
                self.len += 1;
            }
        }
        Ok(())
    }
}

/// Frames the walk always sees above the application stack: the unwinder
/// shim, `traverse_stack` and `classify_call_site`. Skipping them makes
/// depth 1 the interposed entrypoint, depth 2 its caller.
const TRACE_SKIP: u32 = 3;

/// Walk the caller's stack, feeding demangled symbol names to `callback`
/// until it returns a verdict or `limit` frames have been inspected.
///
/// Returns (whitelisted, ignored). If the unwinder produces nothing at all
/// -- the out-of-memory symbolization case -- both flags are set so the
/// process survives the lookup.
#[inline(never)]
fn traverse_stack<F>(limit: u32, mut callback: F) -> (bool, bool)
where
    F: FnMut(u32, &str) -> (bool, bool),
{
    let mut raw_index: u32 = 0;
    let mut inspected: u32 = 0;
    let mut verdict = (false, false);

    backtrace::trace(|frame| {
        raw_index += 1;
        if raw_index <= TRACE_SKIP {
            return true;
        }
        let depth = raw_index - TRACE_SKIP;
        if depth > limit {
            return false;
        }
        inspected += 1;

        let mut name = NameBuf::new();
        let mut resolved = false;
        backtrace::resolve_frame(frame, |symbol| {
            if !resolved {
                if let Some(symbol_name) = symbol.name() {
                    let _ = write!(name, "{}", symbol_name);
                    resolved = true;
                }
            }
        });

        verdict = callback(depth, if resolved { name.as_str() } else { "???" });
        verdict == (false, false)
    });

    if inspected == 0 {
        // Real OOM (or a broken unwinder): whitelist and ignore.
        return (true, true);
    }
    verdict
}

/// Classify the allocation currently being intercepted.
#[inline(never)]
pub fn classify_call_site() -> (bool, bool) {
    let limit = if config::verbose_mode() == VERBOSE_NO {
        MAX_STACK_DEPTH
    } else {
        MAX_STACK_DEPTH_VERBOSE
    };
    traverse_stack(limit, check_frame)
}

/// Print the current stack to stderr; used by the verbose records.
#[inline(never)]
pub fn dump_stack() {
    traverse_stack(MAX_STACK_DEPTH_VERBOSE, |depth, name| {
        report!("#{:<2} {}", depth, name);
        (false, false)
    });
}

/// The knowledge base: (whitelisted, ignored) for one stack frame.
#[cfg(target_os = "linux")]
fn check_frame(depth: u32, func_name: &str) -> (bool, bool) {
    // Exception objects must be allocatable or throwing bad_alloc would
    // itself fail.
    if (depth == 2 || depth == 3) && func_name.contains("__cxa_allocate_exception") {
        return (true, false);
    }
    // The dynamic linker leaks these by design, especially under OOM.
    // https://sourceware.org/bugzilla/show_bug.cgi?id=2451
    if func_name.contains("_dl_map_object") || func_name.contains("_dl_map_object_deps") {
        return (false, true);
    }
    if depth == 5 && func_name.contains("_dl_catch_exception") {
        return (false, true);
    }
    if depth == 2
        && (func_name.contains("_dl_signal_error") || func_name.contains("_dl_exception_create"))
    {
        return (true, true);
    }
    if (depth == 4 || depth == 5) && func_name.contains("dlerror") {
        return (false, true);
    }
    // https://patches-gcc.linaro.org/patch/6525/
    if func_name.contains("__libpthread_freeres") {
        return (false, true);
    }
    // Shutdown-hook registration must succeed and is released by libc, not
    // by the application.
    if (depth == 3 || depth == 4) && func_name.contains("__cxa_atexit") {
        return (true, true);
    }

    (false, false)
}

#[cfg(target_os = "macos")]
fn check_frame(depth: u32, func_name: &str) -> (bool, bool) {
    if (depth == 3 || depth == 4) && func_name.contains("__cxa_allocate_exception") {
        return (true, false);
    }
    if (depth == 3 || depth == 4) && func_name.contains("__cxa_atexit") {
        return (true, true);
    }

    (false, false)
}
