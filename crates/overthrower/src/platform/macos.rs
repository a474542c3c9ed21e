//! Mach-O passthrough to the real allocator.
//!
//! dyld's `__DATA,__interpose` rebinding applies to every image except the
//! interposing library itself, so calls to `libc::malloc` from inside this
//! crate already reach libSystem directly. No dlsym dance is needed.

use core::ffi::c_void;

pub unsafe fn resolve_real_functions() {}

/// # Safety
/// Standard `malloc` contract.
#[inline]
pub unsafe fn real_malloc(size: usize) -> *mut c_void {
    libc::malloc(size)
}

/// # Safety
/// `ptr` must be null or a pointer from the real allocator.
#[inline]
pub unsafe fn real_free(ptr: *mut c_void) {
    if ptr.is_null() {
        return;
    }
    libc::free(ptr);
}

/// # Safety
/// Standard `realloc` contract.
#[inline]
pub unsafe fn real_realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    libc::realloc(ptr, size)
}

/// # Safety
/// Always valid; the location is thread-local.
pub unsafe fn errno_location() -> *mut libc::c_int {
    libc::__error()
}

/// Cheap nonzero thread identifier, cached in TLS.
#[inline]
pub fn thread_id() -> usize {
    use std::cell::Cell;

    thread_local! {
        static CACHED_TID: Cell<usize> = const { Cell::new(0) };
    }

    CACHED_TID.with(|tid| {
        let cached = tid.get();
        if cached != 0 {
            return cached;
        }
        let new_tid = unsafe {
            let mut raw_tid: u64 = 0;
            libc::pthread_threadid_np(libc::pthread_self(), &mut raw_tid);
            raw_tid as usize
        };
        tid.set(new_tid);
        new_tid
    })
}

/// Force stdio to perform its lazy buffer allocations now, while allocations
/// still succeed. libSystem's printf family allocates on first use; if that
/// first use happened inside the interposed path with injection active, the
/// formatted print itself could fail.
pub fn prewarm_stdio() {
    let integer_number: i64 = 22_708_089;
    let floating_point_number: f64 = 22_708_089.862_725_008;
    let mut tmp = String::new();
    for i in 0..1000i64 {
        tmp.clear();
        use core::fmt::Write;
        let _ = write!(
            tmp,
            "{}{}\n",
            integer_number * i * i,
            floating_point_number * (i * i) as f64
        );
    }
    println!(
        "overthrower have to print useless string to force printf to do all preallocations: {}",
        tmp
    );
}
