//! Live-allocation ledger: pointer -> (sequence number, size).
//!
//! An open-addressing table whose storage comes from the side allocator, so
//! maintaining the ledger never routes back through the interposed symbols.
//! In self-overthrow mode the side allocator itself can return null, which
//! surfaces here as a failed insert and triggers the caller's rollback.
//!
//! The table is guarded by a recursive mutex: library code reached from the
//! side allocator can, in edge cases, re-enter the interposed path and land
//! back on the ledger from the same thread.

use crate::intercept::{non_failing_free, non_failing_malloc};
use crate::stderr::report;
use crate::sync::RecursiveMutex;
use core::ffi::c_void;
use core::ptr;

const INITIAL_CAPACITY: usize = 1024;

/// Slot key sentinels; real allocation addresses are never 0 or 1.
const EMPTY: usize = 0;
const TOMBSTONE: usize = 1;

#[derive(Clone, Copy)]
struct Slot {
    key: usize,
    seq_num: u32,
    size: usize,
}

pub struct Ledger {
    slots: *mut Slot,
    capacity: usize,
    live: usize,
    deleted: usize,
}

unsafe impl Send for Ledger {}

/// splitmix64 finalizer; pointer keys are strided so the low bits alone
/// would collide heavily.
#[inline]
fn hash_key(key: usize) -> usize {
    let mut x = key as u64;
    x ^= x >> 30;
    x = x.wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^= x >> 31;
    x as usize
}

impl Ledger {
    pub const fn new() -> Self {
        Ledger {
            slots: ptr::null_mut(),
            capacity: 0,
            live: 0,
            deleted: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Record a live block. Returns false when the side allocator cannot
    /// supply table storage; the block is then not tracked and the caller
    /// must roll its allocation back.
    ///
    /// # Safety
    /// Table storage is manipulated through raw pointers; the caller must
    /// hold the ledger lock.
    pub unsafe fn insert(&mut self, key: usize, seq_num: u32, size: usize) -> bool {
        if (self.live + self.deleted + 1) * 10 > self.capacity * 7 {
            // Best effort: a failed grow is fatal only once the table is
            // actually full.
            self.grow();
        }
        if self.capacity == 0 || self.live + self.deleted == self.capacity {
            return false;
        }

        let mask = self.capacity - 1;
        let mut index = hash_key(key) & mask;
        let mut first_tombstone: Option<usize> = None;
        loop {
            let slot = &mut *self.slots.add(index);
            match slot.key {
                EMPTY => {
                    let target = first_tombstone.unwrap_or(index);
                    let target_slot = &mut *self.slots.add(target);
                    if target_slot.key == TOMBSTONE {
                        self.deleted -= 1;
                    }
                    *target_slot = Slot { key, seq_num, size };
                    self.live += 1;
                    return true;
                }
                TOMBSTONE => {
                    if first_tombstone.is_none() {
                        first_tombstone = Some(index);
                    }
                }
                k if k == key => {
                    slot.seq_num = seq_num;
                    slot.size = size;
                    return true;
                }
                _ => {}
            }
            index = (index + 1) & mask;
        }
    }

    /// Erase a block. Returns false when the pointer was not tracked.
    ///
    /// # Safety
    /// Caller must hold the ledger lock.
    pub unsafe fn remove(&mut self, key: usize) -> bool {
        if self.capacity == 0 {
            return false;
        }
        let mask = self.capacity - 1;
        let mut index = hash_key(key) & mask;
        // Bounded probe: a table saturated by a failed grow has no EMPTY
        // slot to stop at.
        for _ in 0..self.capacity {
            let slot = &mut *self.slots.add(index);
            match slot.key {
                EMPTY => return false,
                k if k == key => {
                    slot.key = TOMBSTONE;
                    self.live -= 1;
                    self.deleted += 1;
                    return true;
                }
                _ => {}
            }
            index = (index + 1) & mask;
        }
        false
    }

    /// # Safety
    /// Caller must hold the ledger lock.
    pub unsafe fn get(&self, key: usize) -> Option<(u32, usize)> {
        if self.capacity == 0 {
            return None;
        }
        let mask = self.capacity - 1;
        let mut index = hash_key(key) & mask;
        for _ in 0..self.capacity {
            let slot = &*self.slots.add(index);
            match slot.key {
                EMPTY => return None,
                k if k == key => return Some((slot.seq_num, slot.size)),
                _ => {}
            }
            index = (index + 1) & mask;
        }
        None
    }

    /// # Safety
    /// Caller must hold the ledger lock.
    pub unsafe fn for_each(&self, mut f: impl FnMut(usize, u32, usize)) {
        for i in 0..self.capacity {
            let slot = &*self.slots.add(i);
            if slot.key != EMPTY && slot.key != TOMBSTONE {
                f(slot.key, slot.seq_num, slot.size);
            }
        }
    }

    /// Release the table storage back to the side allocator.
    ///
    /// # Safety
    /// Caller must hold the ledger lock.
    pub unsafe fn clear(&mut self) {
        if !self.slots.is_null() {
            non_failing_free(self.slots as *mut c_void);
        }
        self.slots = ptr::null_mut();
        self.capacity = 0;
        self.live = 0;
        self.deleted = 0;
    }

    unsafe fn grow(&mut self) -> bool {
        let new_capacity = if self.capacity == 0 {
            INITIAL_CAPACITY
        } else {
            self.capacity * 2
        };
        let bytes = new_capacity * core::mem::size_of::<Slot>();
        let new_slots = non_failing_malloc(bytes) as *mut Slot;
        if new_slots.is_null() {
            return false;
        }
        ptr::write_bytes(new_slots as *mut u8, 0, bytes);

        let old_slots = self.slots;
        let old_capacity = self.capacity;
        self.slots = new_slots;
        self.capacity = new_capacity;
        self.deleted = 0;

        if !old_slots.is_null() {
            let mask = new_capacity - 1;
            for i in 0..old_capacity {
                let slot = *old_slots.add(i);
                if slot.key == EMPTY || slot.key == TOMBSTONE {
                    continue;
                }
                let mut index = hash_key(slot.key) & mask;
                while (*new_slots.add(index)).key != EMPTY {
                    index = (index + 1) & mask;
                }
                *new_slots.add(index) = slot;
            }
            non_failing_free(old_slots as *mut c_void);
        }
        true
    }
}

static LEDGER: RecursiveMutex<Ledger> = RecursiveMutex::new(Ledger::new());

/// Record a successful, non-ignored allocation. False means the side
/// allocator could not grow the table (a real OOM).
pub fn track(ptr: *mut c_void, seq_num: u32, size: usize) -> bool {
    unsafe { LEDGER.lock().insert(ptr as usize, seq_num, size) }
}

/// Erase a block on free or relocation. Unknown pointers are ignored.
pub fn untrack(ptr: *mut c_void) -> bool {
    unsafe { LEDGER.lock().remove(ptr as usize) }
}

/// Size recorded for a tracked block, or None if the block is not tracked.
pub fn tracked_size(ptr: *mut c_void) -> Option<usize> {
    unsafe { LEDGER.lock().get(ptr as usize).map(|(_, size)| size) }
}

/// Print every outstanding block to stderr, release the table and return
/// the number of blocks that were still live. Called by `deactivate`.
pub fn report_and_clear() -> u32 {
    let mut ledger = LEDGER.lock();
    if ledger.is_empty() {
        unsafe { ledger.clear() };
        return 0;
    }

    report!("overthrower has detected not freed memory blocks with following addresses:");
    unsafe {
        ledger.for_each(|key, seq_num, size| {
            report!("0x{:016x}  -  {:6}  -  {:10}", key, seq_num, size);
        });
    }
    report!("^^^^^^^^^^^^^^^^^^  |  ^^^^^^  |  ^^^^^^^^^^");
    report!("      pointer       |  malloc  |  block size");
    report!("                    |invocation|");
    report!("                    |  number  |");

    let blocks_leaked = ledger.len() as u32;
    unsafe { ledger.clear() };
    blocks_leaked
}
