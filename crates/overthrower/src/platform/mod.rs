#[cfg(target_os = "linux")]
pub mod linux;
#[cfg(target_os = "linux")]
pub use linux as sys;

#[cfg(target_os = "macos")]
pub mod macos;
#[cfg(target_os = "macos")]
pub use macos as sys;

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
compile_error!("overthrower supports ELF preloading (Linux) and Mach-O interposing (macOS) only");

use core::ffi::c_void;

/// Call the real native `malloc`, bypassing interposition.
///
/// # Safety
/// Standard `malloc` contract.
#[inline]
pub unsafe fn real_malloc(size: usize) -> *mut c_void {
    sys::real_malloc(size)
}

/// Call the real native `free`, bypassing interposition.
///
/// # Safety
/// `ptr` must be null or a pointer obtained from the real native allocator.
#[inline]
pub unsafe fn real_free(ptr: *mut c_void) {
    sys::real_free(ptr);
}

/// Call the real native `realloc`, bypassing interposition.
///
/// # Safety
/// Standard `realloc` contract.
#[inline]
pub unsafe fn real_realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    sys::real_realloc(ptr, size)
}

/// Read the calling thread's errno.
#[inline]
pub fn errno() -> libc::c_int {
    unsafe { *sys::errno_location() }
}

/// Set the calling thread's errno.
#[inline]
pub fn set_errno(value: libc::c_int) {
    unsafe { *sys::errno_location() = value };
}

/// Get a cheap nonzero thread identifier for recursive-lock ownership.
#[inline]
pub fn thread_id() -> usize {
    sys::thread_id()
}
