//! Fixed-capacity concurrent bitmap
//!
//! One bit per arena block, shared between all threads and manipulated with
//! atomic operations only. The bitmap is organized as an array of *chunks*,
//! each chunk an array of word-sized *fields*, so that a claim scan can be
//! biased towards a per-thread starting chunk: independent threads then
//! mostly touch disjoint cache lines even though there is no per-thread
//! state anywhere.
//!
//! Claiming (`try_find_and_clear_n` / `try_clear_n`) uses compare-exchange
//! so that every bit has exactly one winner; a multi-field claim that loses
//! a race part-way through rolls its earlier fields back and keeps
//! scanning. Bulk set/clear (`xset_n`) is one read-modify-write per field.

use std::sync::atomic::Ordering;
use std::{cmp, ptr};

use crate::loom_testing::{spin_hint, AtomicUsize};

/// Bits in one bitmap field (one machine word)
pub const BFIELD_BITS: usize = usize::BITS as usize;
/// Fields per chunk; a chunk is the unit of thread bias
pub const BITMAP_CHUNK_FIELDS: usize = 8;
/// Bits per chunk
pub const BITMAP_CHUNK_BITS: usize = BITMAP_CHUNK_FIELDS * BFIELD_BITS;
/// Chunks per bitmap
pub const BITMAP_CHUNK_COUNT: usize = 64;
/// Total fields per bitmap
pub const BITMAP_FIELD_COUNT: usize = BITMAP_CHUNK_COUNT * BITMAP_CHUNK_FIELDS;
/// Fixed capacity of every bitmap
pub const BITMAP_MAX_BITS: usize = BITMAP_CHUNK_COUNT * BITMAP_CHUNK_BITS;

/// Target state for the bulk operations
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BitOp {
    Set,
    Clear,
}

/// Outcome of a bulk set/clear over a bit range
#[derive(Clone, Copy, Debug)]
pub struct Xset {
    /// Every bit was in the opposite state and flipped by this call
    pub all_changed: bool,
    /// Every bit was already in the target state before this call
    pub all_already: bool,
}

#[repr(C)]
struct BitmapChunk {
    bfields: [AtomicUsize; BITMAP_CHUNK_FIELDS],
}

/// A bitmap of [BITMAP_MAX_BITS] bits
#[repr(C)]
pub struct Bitmap {
    chunks: [BitmapChunk; BITMAP_CHUNK_COUNT],
}

/// Mask of `len` bits starting at `bitidx` (within one field)
const fn mask(bitidx: usize, len: usize) -> usize {
    debug_assert!(len >= 1 && bitidx + len <= BFIELD_BITS);
    if len == BFIELD_BITS {
        !0
    } else {
        ((1usize << len) - 1) << bitidx
    }
}

impl Bitmap {
    /// Initialize a bitmap in place to all-zero
    ///
    /// The descriptor holding the bitmap is self-hosted inside the memory
    /// range it describes, so construction always happens through a raw
    /// pointer before the descriptor is published.
    ///
    /// Safety: `this` must point to writable memory large enough for a
    /// `Bitmap`; no other thread may access it concurrently.
    pub unsafe fn init(this: *mut Bitmap) {
        for chunk in 0..BITMAP_CHUNK_COUNT {
            for field in 0..BITMAP_CHUNK_FIELDS {
                ptr::write(
                    ptr::addr_of_mut!((*this).chunks[chunk].bfields[field]),
                    AtomicUsize::new(0),
                );
            }
        }
    }

    /// Heap-allocated all-zero bitmap (for tests and standalone use)
    pub fn new_boxed() -> Box<Bitmap> {
        let mut b: Box<std::mem::MaybeUninit<Bitmap>> = Box::new_uninit();
        unsafe {
            Self::init(b.as_mut_ptr());
            b.assume_init()
        }
    }

    fn field(&self, fidx: usize) -> &AtomicUsize {
        &self.chunks[fidx / BITMAP_CHUNK_FIELDS].bfields[fidx % BITMAP_CHUNK_FIELDS]
    }

    pub(crate) fn load_field(&self, fidx: usize) -> usize {
        self.field(fidx).load(Ordering::Relaxed)
    }

    pub(crate) fn load_field_acquire(&self, fidx: usize) -> usize {
        self.field(fidx).load(Ordering::Acquire)
    }

    /// Atomically set or clear bits `[idx, idx + n)`
    ///
    /// One read-modify-write per touched field; the per-field updates are
    /// individually atomic with respect to concurrent claims on the same
    /// bitmap, which is all the ownership protocol requires (a caller only
    /// bulk-updates bits whose blocks it currently owns).
    pub fn xset_n(&self, op: BitOp, idx: usize, n: usize) -> Xset {
        debug_assert!(n > 0 && idx + n <= BITMAP_MAX_BITS);
        let mut all_changed = true;
        let mut all_already = true;
        let mut fidx = idx / BFIELD_BITS;
        let mut bit = idx % BFIELD_BITS;
        let mut remaining = n;
        while remaining > 0 {
            let len = cmp::min(remaining, BFIELD_BITS - bit);
            let m = mask(bit, len);
            // order: a release on set pairs with the acquire in the claim
            // CAS, so everything written before a free is visible to the
            // next claimer of the same blocks
            let prev = match op {
                BitOp::Set => self.field(fidx).fetch_or(m, Ordering::AcqRel),
                BitOp::Clear => self.field(fidx).fetch_and(!m, Ordering::AcqRel),
            };
            let prev_bits = prev & m;
            match op {
                BitOp::Set => {
                    all_changed &= prev_bits == 0;
                    all_already &= prev_bits == m;
                }
                BitOp::Clear => {
                    all_changed &= prev_bits == m;
                    all_already &= prev_bits == 0;
                }
            }
            remaining -= len;
            fidx += 1;
            bit = 0;
        }
        Xset {
            all_changed,
            all_already,
        }
    }

    pub fn set_n(&self, idx: usize, n: usize) -> Xset {
        self.xset_n(BitOp::Set, idx, n)
    }

    pub fn clear_n(&self, idx: usize, n: usize) -> Xset {
        self.xset_n(BitOp::Clear, idx, n)
    }

    /// Snapshot test: are all bits of `[idx, idx + n)` in state `op`?
    pub fn is_xset_n(&self, op: BitOp, idx: usize, n: usize) -> bool {
        debug_assert!(n > 0 && idx + n <= BITMAP_MAX_BITS);
        let mut fidx = idx / BFIELD_BITS;
        let mut bit = idx % BFIELD_BITS;
        let mut remaining = n;
        while remaining > 0 {
            let len = cmp::min(remaining, BFIELD_BITS - bit);
            let m = mask(bit, len);
            let cur = self.field(fidx).load(Ordering::Acquire) & m;
            let ok = match op {
                BitOp::Set => cur == m,
                BitOp::Clear => cur == 0,
            };
            if !ok {
                return false;
            }
            remaining -= len;
            fidx += 1;
            bit = 0;
        }
        true
    }

    pub fn is_set_n(&self, idx: usize, n: usize) -> bool {
        self.is_xset_n(BitOp::Set, idx, n)
    }

    pub fn is_clear_n(&self, idx: usize, n: usize) -> bool {
        self.is_xset_n(BitOp::Clear, idx, n)
    }

    /// Count the set bits in `[idx, idx + n)` (snapshot)
    pub fn count_set(&self, idx: usize, n: usize) -> usize {
        debug_assert!(idx + n <= BITMAP_MAX_BITS);
        let mut count = 0;
        let mut fidx = idx / BFIELD_BITS;
        let mut bit = idx % BFIELD_BITS;
        let mut remaining = n;
        while remaining > 0 {
            let len = cmp::min(remaining, BFIELD_BITS - bit);
            let m = mask(bit, len);
            count += (self.field(fidx).load(Ordering::Relaxed) & m).count_ones() as usize;
            remaining -= len;
            fidx += 1;
            bit = 0;
        }
        count
    }

    /// Non-atomic bulk set/clear for descriptor initialization
    ///
    /// Safety: the bitmap must not yet be reachable by any other thread.
    pub unsafe fn unsafe_xset_n(&self, op: BitOp, idx: usize, n: usize) {
        debug_assert!(n > 0 && idx + n <= BITMAP_MAX_BITS);
        let mut fidx = idx / BFIELD_BITS;
        let mut bit = idx % BFIELD_BITS;
        let mut remaining = n;
        while remaining > 0 {
            let len = cmp::min(remaining, BFIELD_BITS - bit);
            let m = mask(bit, len);
            let field = self.field(fidx);
            let cur = field.load(Ordering::Relaxed);
            let new = match op {
                BitOp::Set => cur | m,
                BitOp::Clear => cur & !m,
            };
            field.store(new, Ordering::Relaxed);
            remaining -= len;
            fidx += 1;
            bit = 0;
        }
    }

    /// Clear the mask `m` in field `fidx` iff all of its bits are set
    ///
    /// Retries while only unrelated bits of the field change; gives up as
    /// soon as any bit of `m` is observed clear.
    fn try_clear_field(&self, fidx: usize, m: usize) -> bool {
        let field = self.field(fidx);
        let mut old = field.load(Ordering::Relaxed);
        loop {
            if old & m != m {
                return false;
            }
            // order: acquire pairs with the release of the free that set
            // these bits, so the claimer sees the blocks' final state
            match field.compare_exchange_weak(old, old & !m, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => return true,
                Err(x) => {
                    old = x;
                    spin_hint();
                }
            }
        }
    }

    /// Claim (clear) exactly `[idx, idx + n)` iff every bit is currently set
    ///
    /// Used by the purge pass to transiently take ownership of a scheduled
    /// range at a known position. Rolls back and returns `false` if any
    /// part of the range is already claimed by someone else.
    pub fn try_clear_n(&self, idx: usize, n: usize) -> bool {
        debug_assert!(n > 0 && idx + n <= BITMAP_MAX_BITS);
        let mut claimed = 0;
        let mut fidx = idx / BFIELD_BITS;
        let mut bit = idx % BFIELD_BITS;
        let mut remaining = n;
        while remaining > 0 {
            let len = cmp::min(remaining, BFIELD_BITS - bit);
            let m = mask(bit, len);
            if !self.try_clear_field(fidx, m) {
                if claimed > 0 {
                    self.xset_n(BitOp::Set, idx, claimed);
                }
                return false;
            }
            claimed += len;
            remaining -= len;
            fidx += 1;
            bit = 0;
        }
        true
    }

    /// Continue a claim that starts at bit `bit` of field `start_fidx` with
    /// `avail` set bits reaching the end of that field, into the following
    /// fields, until `n` bits are claimed. Rolls everything back on
    /// interference.
    fn try_claim_across(&self, start_fidx: usize, bit: usize, avail: usize, n: usize) -> Option<usize> {
        debug_assert!(avail < n && bit + avail == BFIELD_BITS);
        let start_idx = start_fidx * BFIELD_BITS + bit;
        if start_idx + n > BITMAP_MAX_BITS {
            return None;
        }
        if !self.try_clear_field(start_fidx, mask(bit, avail)) {
            return None;
        }
        let mut claimed = avail;
        let mut fidx = start_fidx + 1;
        while claimed < n {
            let len = cmp::min(n - claimed, BFIELD_BITS);
            if !self.try_clear_field(fidx, mask(0, len)) {
                // someone else owns part of the continuation; put back what
                // we took and let the caller keep scanning
                self.xset_n(BitOp::Set, start_idx, claimed);
                return None;
            }
            claimed += len;
            fidx += 1;
        }
        Some(start_idx)
    }

    /// Find and claim a run of `n` set bits starting inside field `fidx`,
    /// extending into following fields if the run reaches the field end.
    fn try_find_claim_from(&self, fidx: usize, n: usize) -> Option<usize> {
        'rescan: loop {
            let field = self.field(fidx);
            let map = field.load(Ordering::Relaxed);
            if map == 0 {
                return None;
            }
            let mut bit = 0;
            while bit < BFIELD_BITS {
                let rest = map >> bit;
                if rest == 0 {
                    return None;
                }
                bit += rest.trailing_zeros() as usize;
                let run = (map >> bit).trailing_ones() as usize;
                if run >= n {
                    // the run fits inside this field
                    let m = mask(bit, n);
                    let mut cur = map;
                    loop {
                        if cur & m != m {
                            // interference on our candidate bits; rescan
                            continue 'rescan;
                        }
                        match field.compare_exchange_weak(
                            cur,
                            cur & !m,
                            Ordering::AcqRel,
                            Ordering::Relaxed,
                        ) {
                            Ok(_) => return Some(fidx * BFIELD_BITS + bit),
                            Err(x) => {
                                cur = x;
                                spin_hint();
                            }
                        }
                    }
                } else if bit + run == BFIELD_BITS {
                    // run reaches the end of the field: try to complete it
                    // across the boundary
                    if let Some(i) = self.try_claim_across(fidx, bit, run, n) {
                        return Some(i);
                    }
                    return None;
                } else {
                    bit += run;
                }
            }
            return None;
        }
    }

    /// Find the lowest run of `n` consecutive set bits and atomically clear
    /// it, returning the run's start index.
    ///
    /// The scan starts at chunk `start_hint % chunk_count` and visits each
    /// chunk once in wrapping order; within a chunk, fields and bits are
    /// visited in ascending order. Passing a per-thread sequence number as
    /// the hint disperses concurrent claimers over disjoint chunks. Runs
    /// may cross field and chunk boundaries (but not wrap around the end of
    /// the bitmap).
    pub fn try_find_and_clear_n(&self, start_hint: usize, n: usize) -> Option<usize> {
        debug_assert!(n > 0 && n <= BITMAP_MAX_BITS);
        let start_chunk = start_hint % BITMAP_CHUNK_COUNT;
        for k in 0..BITMAP_CHUNK_COUNT {
            let chunk = (start_chunk + k) % BITMAP_CHUNK_COUNT;
            for f in 0..BITMAP_CHUNK_FIELDS {
                let fidx = chunk * BITMAP_CHUNK_FIELDS + f;
                if let Some(idx) = self.try_find_claim_from(fidx, n) {
                    return Some(idx);
                }
            }
        }
        None
    }
}
