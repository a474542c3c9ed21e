//! ELF passthrough to the real allocator.
//!
//! Because this library exports `malloc`/`free`/`realloc`, calling
//! `libc::malloc` from inside it would recurse straight back into the
//! interposed symbols. The real libc implementations are looked up with
//! `dlsym(RTLD_NEXT, ...)` -- the *next* definition in the link chain, not
//! ours. Resolution is attempted eagerly from the load constructor and
//! repeated lazily on the cold path in case the constructor ran too early.

use core::ffi::c_void;
use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};

type MallocFn = unsafe extern "C" fn(usize) -> *mut c_void;
type FreeFn = unsafe extern "C" fn(*mut c_void);
type ReallocFn = unsafe extern "C" fn(*mut c_void, usize) -> *mut c_void;

static REAL_MALLOC: AtomicUsize = AtomicUsize::new(0);
static REAL_FREE: AtomicUsize = AtomicUsize::new(0);
static REAL_REALLOC: AtomicUsize = AtomicUsize::new(0);

/// Resolve the native allocator entrypoints via dlsym(RTLD_NEXT).
/// Idempotent; called once from the library constructor.
///
/// # Safety
/// Must not race with itself; the constructor runs single-threaded.
pub unsafe fn resolve_real_functions() {
    let rtld_next = -1isize as *mut c_void; // RTLD_NEXT

    let m = libc::dlsym(rtld_next, c"malloc".as_ptr());
    if !m.is_null() {
        REAL_MALLOC.store(m as usize, Ordering::Release);
    }

    let f = libc::dlsym(rtld_next, c"free".as_ptr());
    if !f.is_null() {
        REAL_FREE.store(f as usize, Ordering::Release);
    }

    let r = libc::dlsym(rtld_next, c"realloc".as_ptr());
    if !r.is_null() {
        REAL_REALLOC.store(r as usize, Ordering::Release);
    }
}

/// Lazily resolve a single symbol when the eager pass didn't populate it
/// (e.g. an allocation arriving before the constructor ran).
///
/// Uses compare_exchange so concurrent callers converge on one pointer.
/// Returns the resolved address, or 0 if dlsym returned NULL.
#[cold]
#[inline(never)]
unsafe fn lazy_resolve(slot: &AtomicUsize, name: &core::ffi::CStr) -> usize {
    let rtld_next = -1isize as *mut c_void; // RTLD_NEXT
    let sym = libc::dlsym(rtld_next, name.as_ptr());
    if sym.is_null() {
        return 0;
    }
    let _ = slot.compare_exchange(0, sym as usize, Ordering::Release, Ordering::Acquire);
    slot.load(Ordering::Acquire)
}

/// Bump buffer serving allocations that arrive before dlsym resolves the real
/// malloc. dlsym itself may allocate, so the fallback cannot depend on libc.
static BOOTSTRAP_BUF_USED: AtomicUsize = AtomicUsize::new(0);
const BOOTSTRAP_BUF_SIZE: usize = 65536;
static mut BOOTSTRAP_BUF: [u8; BOOTSTRAP_BUF_SIZE] = [0u8; BOOTSTRAP_BUF_SIZE];

unsafe fn bootstrap_malloc(size: usize) -> *mut c_void {
    let aligned_size = (size + 15) & !15;
    // CAS loop so a failed reservation doesn't advance the counter.
    loop {
        let offset = BOOTSTRAP_BUF_USED.load(Ordering::Relaxed);
        if offset + aligned_size > BOOTSTRAP_BUF_SIZE {
            return ptr::null_mut();
        }
        if BOOTSTRAP_BUF_USED
            .compare_exchange_weak(
                offset,
                offset + aligned_size,
                Ordering::Relaxed,
                Ordering::Relaxed,
            )
            .is_ok()
        {
            return core::ptr::addr_of_mut!(BOOTSTRAP_BUF)
                .cast::<u8>()
                .add(offset)
                .cast::<c_void>();
        }
    }
}

unsafe fn is_bootstrap_ptr(ptr: *mut c_void) -> bool {
    let base = core::ptr::addr_of!(BOOTSTRAP_BUF) as usize;
    (base..base + BOOTSTRAP_BUF_SIZE).contains(&(ptr as usize))
}

/// # Safety
/// Standard `malloc` contract.
#[inline]
pub unsafe fn real_malloc(size: usize) -> *mut c_void {
    let mut f = REAL_MALLOC.load(Ordering::Acquire);
    if f == 0 {
        f = lazy_resolve(&REAL_MALLOC, c"malloc");
    }
    if f != 0 {
        let func: MallocFn = core::mem::transmute(f);
        func(size)
    } else {
        bootstrap_malloc(size)
    }
}

/// # Safety
/// `ptr` must be null or a pointer from the real allocator.
#[inline]
pub unsafe fn real_free(ptr: *mut c_void) {
    // `free(NULL)` must work even before any resolution happened: the
    // function pointer may still be unset at that point, so bail out
    // without touching it.
    if ptr.is_null() || is_bootstrap_ptr(ptr) {
        return;
    }
    let mut f = REAL_FREE.load(Ordering::Acquire);
    if f == 0 {
        f = lazy_resolve(&REAL_FREE, c"free");
    }
    if f != 0 {
        let func: FreeFn = core::mem::transmute(f);
        func(ptr);
    }
}

/// # Safety
/// Standard `realloc` contract.
#[inline]
pub unsafe fn real_realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    if ptr.is_null() {
        return real_malloc(size);
    }
    if is_bootstrap_ptr(ptr) {
        // Bootstrap memory cannot be resized in place; allocate and copy.
        let new = real_malloc(size);
        if !new.is_null() {
            let base = core::ptr::addr_of!(BOOTSTRAP_BUF) as usize;
            let max_old_size = BOOTSTRAP_BUF_SIZE - (ptr as usize - base);
            ptr::copy_nonoverlapping(
                ptr.cast::<u8>(),
                new.cast::<u8>(),
                size.min(max_old_size),
            );
        }
        return new;
    }
    let mut f = REAL_REALLOC.load(Ordering::Acquire);
    if f == 0 {
        f = lazy_resolve(&REAL_REALLOC, c"realloc");
    }
    if f != 0 {
        let func: ReallocFn = core::mem::transmute(f);
        func(ptr, size)
    } else {
        ptr::null_mut()
    }
}

/// # Safety
/// Always valid; the location is thread-local.
pub unsafe fn errno_location() -> *mut libc::c_int {
    libc::__errno_location()
}

/// Cheap nonzero thread identifier, cached in TLS to avoid a syscall per
/// lock acquisition.
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
        let new_tid = unsafe { libc::syscall(libc::SYS_gettid) as usize };
        tid.set(new_tid);
        new_tid
    })
}
