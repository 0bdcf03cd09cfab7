//! Shared memory arenas
//!
//! An arena is a big fixed range of OS memory (reserved up front, or
//! adopted from the caller, or pinned huge pages) from which all threads
//! claim large aligned block runs through one shared atomic bitmap; there
//! are no per-thread caches anywhere in this layer. This is the coarse
//! substrate a fine-grained allocator sits on top of: it asks for
//! multi-megabyte chunks here and slices them up itself.
//!
//! The design follows the arena layer of the
//! [mimalloc](https://www.microsoft.com/en-us/research/uploads/prod/2019/06/mimalloc-tr-v1.pdf)
//! allocator family: four bitmaps per arena (free / committed / dirty /
//! purge) so that each state transition is a single word-sized atomic on
//! its own cache line, `blocks_free` being the sole source of truth for
//! ownership. Freed ranges are decommitted lazily: a free schedules the
//! range in `blocks_purge` and arms a per-arena expiry; an expired purge
//! pass transiently re-claims the free bits (borrowing the claim
//! protocol's atomicity instead of adding a lock) while it returns the
//! pages to the OS.
//!
//! The descriptor itself lives in the first blocks of its own range, so
//! destroying an arena frees its metadata with it; those blocks are never
//! claimable and a trailing guard page is accounted for.

use std::fmt::Write as _;
use std::mem::size_of;
use std::ptr;
use std::sync::atomic::Ordering;

use tracing::Level;

use crate::bitmap::{BitOp, Bitmap, BFIELD_BITS, BITMAP_MAX_BITS};
use crate::loom_testing::*;
use crate::memid::{ArenaId, MemId, MemKind};
use crate::options::{EagerCommit, Options};
use crate::os::MemSource;
use crate::stats::Stats;
use crate::track;
use crate::util::{align_up, clamp, divroundup, UsizePtr};

/// The allocation unit: block size in bytes (and block alignment)
pub const BLOCK_SIZE: usize = 4 * 1024 * 1024;
/// Returned pointers are aligned to this
pub const BLOCK_ALIGN: usize = BLOCK_SIZE;
/// Registry capacity
pub const MAX_ARENAS: usize = 1024;
/// Abandoned-page bins held in reserve per arena
pub const BIN_COUNT: usize = 32;
/// Smallest object the arena layer will serve; below this the OS path is
/// used (heap metadata and the like)
pub const MIN_OBJ_SIZE: usize = BLOCK_SIZE;
/// Largest object a single arena can serve
pub const MAX_OBJ_SIZE: usize = BITMAP_MAX_BITS * BLOCK_SIZE;

const _: () = assert!(BLOCK_SIZE.is_power_of_two());
const _: () = assert!(BLOCK_ALIGN == BLOCK_SIZE);

pub(crate) const fn block_count_of_size(size: usize) -> usize {
    divroundup(size, BLOCK_SIZE)
}

pub(crate) const fn size_of_blocks(count: usize) -> usize {
    count * BLOCK_SIZE
}

/// Per-thread sequence number used to disperse bitmap scans
///
/// Handed out once per thread from a global counter; there is deliberately
/// no other per-thread state, the sequence number only biases which chunk a
/// claim starts scanning at.
#[cfg(not(loom))]
pub(crate) fn thread_seq() -> usize {
    use std::cell::Cell;
    use std::sync::atomic::AtomicUsize;
    static NEXT_SEQ: AtomicUsize = AtomicUsize::new(0);
    std::thread_local! {
        static SEQ: Cell<Option<usize>> = const { Cell::new(None) };
    }
    SEQ.with(|c| match c.get() {
        Some(seq) => seq,
        None => {
            let seq = NEXT_SEQ.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            c.set(Some(seq));
            seq
        }
    })
}
#[cfg(loom)]
pub(crate) fn thread_seq() -> usize {
    0
}

/// Errors surfaced by the arena layer
///
/// Bad-caller conditions on the free path (invalid handle, double free) are
/// reported and the free is aborted without touching the bitmaps: leaking
/// the blocks beats corrupting the map.
#[derive(Debug, thiserror::Error)]
pub enum ArenaError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("trying to free an invalid arena block")]
    InvalidFree,
    #[error("trying to free an already freed arena block")]
    DoubleFree,
    #[error("memory region is not aligned to the block size")]
    Unaligned,
    #[error("memory region is too small (minimum is {min} bytes)")]
    TooSmall { min: usize },
    #[error("memory region is too large (maximum is {max} bytes)")]
    TooLarge { max: usize },
}

/// A memory arena descriptor, self-hosted at the base of its own range
#[repr(C)]
pub(crate) struct Arena {
    /// How the whole range was obtained
    pub(crate) memid: MemId,
    /// Registry id; `None` only before publication
    pub(crate) id: Option<ArenaId>,
    /// Usable size of the range in blocks
    pub(crate) block_count: usize,
    /// Blocks at the start holding this descriptor (plus guard page)
    pub(crate) info_blocks: usize,
    /// NUMA node of the backing memory, if pinned to one
    pub(crate) numa_node: Option<usize>,
    /// Only satisfy requests that name this arena
    pub(crate) exclusive: bool,
    /// Backed by large/huge OS pages (always committed, pinned)
    pub(crate) is_large: bool,
    /// Expiry (ms clock) of the scheduled purge; 0 = nothing scheduled
    pub(crate) purge_expire: AtomicI64,
    /// Guards walks over the abandoned bitmaps (protocol lives upstream)
    #[allow(dead_code)]
    pub(crate) abandoned_visit_lock: Mutex<()>,
    /// One bit per block: free (claimable)
    pub(crate) blocks_free: Bitmap,
    /// One bit per block: backed by committed pages
    pub(crate) blocks_committed: Bitmap,
    /// One bit per block: may contain non-zero bytes
    pub(crate) blocks_dirty: Bitmap,
    /// One bit per block: scheduled for purge (implies free)
    pub(crate) blocks_purge: Bitmap,
    /// Abandoned pages per size bin; reserved for the page layer
    #[allow(dead_code)]
    pub(crate) blocks_abandoned: [Bitmap; BIN_COUNT],
}

impl Arena {
    /// Initialize a descriptor in place at the base of its memory range.
    ///
    /// All bitmaps start all-zero; the caller marks the usable range free
    /// afterwards (before publication).
    ///
    /// Safety: `this` must point to the (committed, exclusive) base of the
    /// arena range with room for the descriptor.
    unsafe fn init(
        this: *mut Arena,
        memid: MemId,
        block_count: usize,
        info_blocks: usize,
        numa_node: Option<usize>,
        exclusive: bool,
        is_large: bool,
    ) {
        ptr::write(ptr::addr_of_mut!((*this).memid), memid);
        ptr::write(ptr::addr_of_mut!((*this).id), None);
        ptr::write(ptr::addr_of_mut!((*this).block_count), block_count);
        ptr::write(ptr::addr_of_mut!((*this).info_blocks), info_blocks);
        ptr::write(ptr::addr_of_mut!((*this).numa_node), numa_node);
        ptr::write(ptr::addr_of_mut!((*this).exclusive), exclusive);
        ptr::write(ptr::addr_of_mut!((*this).is_large), is_large);
        ptr::write(ptr::addr_of_mut!((*this).purge_expire), AtomicI64::new(0));
        ptr::write(
            ptr::addr_of_mut!((*this).abandoned_visit_lock),
            Mutex::new(()),
        );
        Bitmap::init(ptr::addr_of_mut!((*this).blocks_free));
        Bitmap::init(ptr::addr_of_mut!((*this).blocks_committed));
        Bitmap::init(ptr::addr_of_mut!((*this).blocks_dirty));
        Bitmap::init(ptr::addr_of_mut!((*this).blocks_purge));
        for bin in 0..BIN_COUNT {
            Bitmap::init(ptr::addr_of_mut!((*this).blocks_abandoned[bin]));
        }
    }

    fn start(&self) -> *mut u8 {
        self as *const Arena as *mut u8
    }

    /// Start of block `block_index` within this arena
    pub(crate) fn block_start(&self, block_index: usize) -> *mut u8 {
        debug_assert!(block_index <= self.block_count);
        // provenance: the descriptor reference was derived from the base
        // pointer of the whole range, so offsetting stays in bounds
        unsafe { self.start().add(size_of_blocks(block_index)) }
    }

    fn size(&self) -> usize {
        size_of_blocks(self.block_count)
    }

    fn contains(&self, p: *const u8) -> bool {
        let start = self.start() as usize;
        (p as usize) >= start && (p as usize) < start + self.size()
    }

    /// Fields of each bitmap that cover this arena's blocks
    fn field_count(&self) -> usize {
        divroundup(self.block_count, BFIELD_BITS)
    }
}

/// A successful allocation: the pointer plus its provenance token, which
/// must be passed back verbatim to [ArenaPool::free]
#[derive(Clone, Copy, Debug)]
pub struct Allocation {
    pub ptr: *mut u8,
    pub memid: MemId,
}

// safety: an allocation is just an address plus provenance; blocks may be
// handed to and freed from any thread (the bitmaps are the synchronization)
unsafe impl Send for Allocation {}
unsafe impl Sync for Allocation {}

impl Allocation {
    /// Would this allocation have satisfied a request naming `req`?
    pub fn is_suitable_for(&self, req: Option<ArenaId>) -> bool {
        self.memid.is_suitable_for(req)
    }
}

/// The set of arenas plus the allocation/free/purge orchestrator
///
/// All state is shared: any thread may allocate, free or purge through a
/// `&ArenaPool`. Arena publication into the registry slots uses release
/// stores so a reader that observes a non-null slot sees a fully
/// initialized descriptor.
pub struct ArenaPool<M: MemSource> {
    mem: M,
    options: Options,
    stats: Stats,
    /// Early-startup mode: no arena creation, no scheduled purging
    preloading: AtomicBool,
    arenas: [AtomicPtr<Arena>; MAX_ARENAS],
    arena_count: AtomicUsize,
    /// Allows one purge pass at a time; others skip rather than wait
    purge_guard: AtomicBool,
}

impl<M: MemSource> ArenaPool<M> {
    pub fn new(mem: M, options: Options) -> ArenaPool<M> {
        ArenaPool {
            mem,
            options,
            stats: Stats::new(),
            preloading: AtomicBool::new(false),
            arenas: std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
            arena_count: AtomicUsize::new(0),
            purge_guard: AtomicBool::new(false),
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn mem(&self) -> &M {
        &self.mem
    }

    /// While preloading, fresh arenas are not reserved and purges are not
    /// scheduled; frees still release their bits.
    pub fn set_preloading(&self, v: bool) {
        self.preloading.store(v, Ordering::Relaxed);
    }

    fn is_preloading(&self) -> bool {
        self.preloading.load(Ordering::Relaxed)
    }

    /// Number of occupied registry slots (upper bound on valid indices)
    pub fn arena_slot_count(&self) -> usize {
        // relaxed: the worst case is missing a freshly added arena
        self.arena_count.load(Ordering::Relaxed)
    }

    fn arena_at(&self, index: usize) -> Option<&Arena> {
        // order: acquire pairs with the release store in add_arena, so a
        // non-null slot implies a fully initialized descriptor
        unsafe { self.arenas[index].load(Ordering::Acquire).as_ref() }
    }

    /// Blocks needed at the start of every arena for the descriptor plus a
    /// trailing guard page
    fn info_blocks(&self) -> usize {
        let page_size = self.mem.page_size();
        let info_size = align_up(size_of::<Arena>(), page_size) + page_size;
        block_count_of_size(info_size)
    }

    // ------------------------------------------------------------------
    // OS-call wrappers that keep the committed-bytes gauge in step
    // ------------------------------------------------------------------

    fn os_commit(&self, p: *mut u8, size: usize) -> Option<bool> {
        let r = self.mem.commit(p, size);
        if r.is_some() {
            self.stats.committed_increase(size);
        }
        r
    }

    fn os_purge(&self, p: *mut u8, size: usize, allow_reset: bool) -> bool {
        let needs_recommit = self.mem.purge(p, size, allow_reset);
        if needs_recommit {
            self.stats.committed_decrease(size);
        }
        needs_recommit
    }

    fn os_free(&self, p: *mut u8, size: usize, committed_size: usize) {
        if committed_size > 0 {
            self.stats.committed_decrease(committed_size);
        }
        self.mem.free(p, size, committed_size > 0);
    }

    // ------------------------------------------------------------------
    // Registry
    // ------------------------------------------------------------------

    /// Publish a fully initialized descriptor into the registry
    fn add_arena(&self, arena: *mut Arena) -> Result<ArenaId, ArenaError> {
        let index = self.arena_count.fetch_add(1, Ordering::AcqRel);
        if index >= MAX_ARENAS {
            self.arena_count.fetch_sub(1, Ordering::AcqRel);
            return Err(ArenaError::OutOfMemory);
        }
        let id = ArenaId::from_index(index);
        unsafe {
            // still exclusively ours until the store below
            (*arena).id = Some(id);
        }
        self.stats.arena_count_increase();
        // order: release publishes the descriptor contents to any reader
        // that acquires the slot
        self.arenas[index].store(arena, Ordering::Release);
        Ok(id)
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    /// Allocate `size` bytes (rounded up to whole blocks) aligned to
    /// `alignment`, from an arena when possible, falling back to the OS.
    ///
    /// `commit = true` guarantees the range is committed on success (see
    /// `memid.initially_committed`); `allow_large` permits placement in
    /// large/huge-page arenas; `req` restricts placement to one arena.
    pub fn alloc_aligned(
        &self,
        size: usize,
        alignment: usize,
        align_offset: usize,
        commit: bool,
        allow_large: bool,
        req: Option<ArenaId>,
    ) -> Result<Allocation, ArenaError> {
        let trace_span = tracing::span!(
            Level::TRACE,
            "arena::alloc_aligned",
            size,
            alignment,
            commit,
            req = req.map(|r| r.get())
        );
        let _span_enter = trace_span.enter();

        if size == 0 {
            return Err(ArenaError::TooSmall { min: 1 });
        }
        let tseq = thread_seq();
        let numa_node = self.mem.numa_node();

        // arena placement only for block-sized, block-alignable requests
        let arena_allowed = !self.options.disallow_arena_alloc || req.is_some();
        if arena_allowed
            && (MIN_OBJ_SIZE..=MAX_OBJ_SIZE).contains(&size)
            && alignment <= BLOCK_ALIGN
            && align_offset == 0
        {
            if let Some(a) =
                self.arena_try_alloc(numa_node, size, commit, allow_large, req, tseq)
            {
                return Ok(a);
            }

            // no existing arena fits: eagerly reserve a fresh one and claim
            // from it directly
            if req.is_none() {
                if let Some(new_id) = self.arena_reserve(size, allow_large) {
                    if let Some(a) = self.arena_try_alloc_at_id(
                        new_id, true, numa_node, size, commit, allow_large, req, tseq,
                    ) {
                        return Ok(a);
                    }
                }
            }
        }

        if self.options.disallow_os_alloc || req.is_some() {
            return Err(ArenaError::OutOfMemory);
        }

        // fall back to the OS
        let os = if align_offset > 0 {
            self.mem
                .alloc_aligned_at_offset(size, alignment, align_offset, commit, allow_large)
        } else {
            self.mem.alloc_aligned(size, alignment, commit, allow_large)
        };
        match os {
            Some(os) => {
                if os.is_committed {
                    self.stats.committed_increase(os.size);
                }
                tracing::event!(Level::TRACE, ptr = ?UsizePtr::from(os.ptr), kind = "os");
                Ok(Allocation {
                    ptr: os.ptr,
                    memid: MemId::os(os.is_committed, os.is_zero, os.is_pinned),
                })
            }
            None => Err(ArenaError::OutOfMemory),
        }
    }

    /// Block-aligned allocation (the common case)
    pub fn alloc(
        &self,
        size: usize,
        commit: bool,
        allow_large: bool,
        req: Option<ArenaId>,
    ) -> Result<Allocation, ArenaError> {
        self.alloc_aligned(size, BLOCK_SIZE, 0, commit, allow_large, req)
    }

    /// Walk the registry under the placement policy: the requested arena
    /// only, or a NUMA-local pass followed by a NUMA-foreign pass.
    fn arena_try_alloc(
        &self,
        numa_node: Option<usize>,
        size: usize,
        commit: bool,
        allow_large: bool,
        req: Option<ArenaId>,
        tseq: usize,
    ) -> Option<Allocation> {
        let max_arena = self.arena_slot_count();
        if max_arena == 0 {
            return None;
        }

        if let Some(req_id) = req {
            if req_id.index() < max_arena {
                return self.arena_try_alloc_at_id(
                    req_id, true, numa_node, size, commit, allow_large, req, tseq,
                );
            }
            return None;
        }

        // pass A: NUMA-local arenas
        for index in 0..max_arena {
            if let Some(a) = self.arena_try_alloc_at_id(
                ArenaId::from_index(index),
                true,
                numa_node,
                size,
                commit,
                allow_large,
                req,
                tseq,
            ) {
                return Some(a);
            }
        }
        // pass B: NUMA-foreign arenas; pointless when the caller's node is
        // unknown as pass A then skipped nothing
        if numa_node.is_some() {
            for index in 0..max_arena {
                if let Some(a) = self.arena_try_alloc_at_id(
                    ArenaId::from_index(index),
                    false,
                    numa_node,
                    size,
                    commit,
                    allow_large,
                    req,
                    tseq,
                ) {
                    return Some(a);
                }
            }
        }
        None
    }

    /// Check one arena's suitability and try to claim from it
    #[allow(clippy::too_many_arguments)]
    fn arena_try_alloc_at_id(
        &self,
        arena_id: ArenaId,
        match_numa_node: bool,
        numa_node: Option<usize>,
        size: usize,
        commit: bool,
        allow_large: bool,
        req: Option<ArenaId>,
        tseq: usize,
    ) -> Option<Allocation> {
        let bcount = block_count_of_size(size);
        let arena = self.arena_at(arena_id.index())?;
        if !allow_large && arena.is_large {
            return None;
        }
        if !(!arena.exclusive && req.is_none() || arena.id == req) {
            return None;
        }
        if req.is_none() {
            // NUMA affinity: pass A takes only local arenas, pass B only
            // the ones pass A skipped for locality
            let numa_suitable = match (numa_node, arena.numa_node) {
                (Some(mine), Some(theirs)) => mine == theirs,
                _ => true,
            };
            if match_numa_node != numa_suitable {
                return None;
            }
        }
        self.arena_try_alloc_at(arena, bcount, commit, tseq)
    }

    /// The core claim: take `bcount` blocks out of `blocks_free`, then
    /// update dirty/commit bookkeeping for the claimed range.
    fn arena_try_alloc_at(
        &self,
        arena: &Arena,
        bcount: usize,
        commit: bool,
        tseq: usize,
    ) -> Option<Allocation> {
        let block_index = arena.blocks_free.try_find_and_clear_n(tseq, bcount)?;
        debug_assert!(block_index >= arena.info_blocks);
        debug_assert!(block_index + bcount <= arena.block_count);

        // claimed it!
        let p = arena.block_start(block_index);
        let id = arena.id?;
        let mut memid = MemId::arena(id, block_index, arena.exclusive, arena.memid.is_pinned);

        // the claimed blocks must not stay scheduled for purge (purge bits
        // are only meaningful on free blocks)
        arena.blocks_purge.clear_n(block_index, bcount);

        // dirty tracking: the caller gets zeroed memory iff the arena
        // started out zeroed and none of these blocks were handed out before
        if arena.memid.initially_zero {
            memid.initially_zero = arena.blocks_dirty.set_n(block_index, bcount).all_changed;
        }

        if commit {
            // commit requested; the range may be only partially committed,
            // so commit the whole of it when any block was not
            memid.initially_committed = true;
            let r = arena.blocks_committed.set_n(block_index, bcount);
            if !r.all_already {
                match self.os_commit(p, size_of_blocks(bcount)) {
                    Some(commit_zero) => {
                        if commit_zero {
                            memid.initially_zero = true;
                        }
                    }
                    None => {
                        // leave the range marked uncommitted so a later
                        // allocation retries the commit
                        arena.blocks_committed.clear_n(block_index, bcount);
                        memid.initially_committed = false;
                    }
                }
            }
        } else {
            // not requested, but report whether the range happens to be
            // fully committed already
            memid.initially_committed = arena.blocks_committed.is_set_n(block_index, bcount);
        }

        tracing::event!(
            Level::TRACE,
            ptr = ?UsizePtr::from(p),
            arena = id.get(),
            block_index,
            bcount,
            committed = memid.initially_committed,
            zero = memid.initially_zero
        );
        Some(Allocation { ptr: p, memid })
    }

    /// Try to reserve a fresh arena sized for long-running growth
    ///
    /// The base reserve size doubles for every eight arenas already in the
    /// registry (capped), so a process that keeps allocating gets
    /// geometrically fewer, larger arenas instead of an ever-longer scan
    /// list.
    fn arena_reserve(&self, req_size: usize, allow_large: bool) -> Option<ArenaId> {
        if self.is_preloading() {
            return None;
        }
        // order: acquire for an exact bound; a stale count here could admit
        // more arenas than the headroom check intends
        let arena_count = self.arena_count.load(Ordering::Acquire);
        if arena_count > MAX_ARENAS - 4 {
            return None;
        }

        let mut reserve = self.options.arena_reserve;
        if reserve == 0 {
            return None;
        }
        if !self.mem.has_virtual_reserve() {
            // address space is expensive here; be conservative
            reserve /= 4;
        }
        reserve = align_up(reserve, BLOCK_SIZE);
        if (8..=128).contains(&arena_count) {
            let multiplier = 1usize << clamp(arena_count / 8, 0, 16);
            reserve = reserve.checked_mul(multiplier).unwrap_or(reserve);
        }

        let min_reserve = size_of_blocks(self.info_blocks() + 1);
        let max_reserve = BITMAP_MAX_BITS * BLOCK_SIZE;
        reserve = clamp(reserve, min_reserve, max_reserve);
        if reserve < req_size {
            return None;
        }

        let commit = match self.options.eager_commit {
            EagerCommit::Always => true,
            EagerCommit::Never => false,
            EagerCommit::Auto => self.mem.has_overcommit(),
        };
        self.reserve_os_memory_ex(reserve, commit, allow_large, false).ok()
    }

    // ------------------------------------------------------------------
    // Free
    // ------------------------------------------------------------------

    /// Return an allocation. `committed_size` is how much of the range the
    /// caller kept committed (it may have decommitted a tail itself).
    pub fn free(
        &self,
        p: *mut u8,
        size: usize,
        committed_size: usize,
        memid: MemId,
    ) -> Result<(), ArenaError> {
        let trace_span = tracing::span!(
            Level::TRACE,
            "arena::free",
            ptr = ?UsizePtr::from(p),
            size,
            committed_size
        );
        let _span_enter = trace_span.enter();

        debug_assert!(committed_size <= size);
        if p.is_null() || size == 0 {
            return Ok(());
        }
        let all_committed = committed_size == size;

        // parts of the range may still be marked no-access (padding etc.)
        track::mem_undefined(p, size);

        match memid.kind {
            MemKind::Os => {
                self.os_free(p, size, committed_size);
            }
            MemKind::Arena { id, block_index, .. } => {
                let blocks = block_count_of_size(size);
                let arena_index = id.index();
                if arena_index >= MAX_ARENAS {
                    tracing::warn!(
                        ptr = ?UsizePtr::from(p),
                        size,
                        "trying to free from an invalid arena"
                    );
                    return Err(ArenaError::InvalidFree);
                }
                let Some(arena) = self.arena_at(arena_index) else {
                    tracing::warn!(
                        ptr = ?UsizePtr::from(p),
                        size,
                        "trying to free from an invalid arena"
                    );
                    return Err(ArenaError::InvalidFree);
                };
                // indices inside the descriptor blocks or past the end mean
                // a forged or corrupted handle; abort without touching the
                // bitmaps
                if block_index < arena.info_blocks || block_index + blocks > arena.block_count {
                    tracing::warn!(
                        ptr = ?UsizePtr::from(p),
                        size,
                        block_index,
                        "trying to free an invalid arena block"
                    );
                    return Err(ArenaError::InvalidFree);
                }

                if arena.memid.is_pinned || arena.memid.initially_committed {
                    // commit state is immutable for this arena; the caller
                    // must not have decommitted anything
                    debug_assert!(all_committed);
                } else {
                    if !all_committed {
                        // mark the entire range uncommitted so the next
                        // claim recommits it as a whole
                        arena.blocks_committed.clear_n(block_index, blocks);
                        track::mem_noaccess(p, size);
                        if committed_size > 0 {
                            self.stats.committed_decrease(committed_size);
                        }
                    }
                    // schedule while the range is still ours: the purge
                    // path cannot race a claim until the bits below are set
                    self.schedule_purge(arena, block_index, blocks);
                }

                // and make it available to others again
                let r = arena.blocks_free.set_n(block_index, blocks);
                if !r.all_changed {
                    tracing::warn!(
                        ptr = ?UsizePtr::from(p),
                        size,
                        "trying to free an already freed arena block"
                    );
                    return Err(ArenaError::DoubleFree);
                }
            }
            MemKind::None | MemKind::External | MemKind::Static => {}
        }

        // opportunistically drain expired purges
        self.try_purge_all(false, false);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Purge
    // ------------------------------------------------------------------

    /// Purge expired ranges now; with `force_purge` everything scheduled is
    /// purged regardless of expiry, in every arena.
    pub fn collect(&self, force_purge: bool) {
        self.try_purge_all(force_purge, force_purge);
    }

    /// Schedule (or, for a zero delay, perform) a purge of a block range
    /// the caller currently owns.
    fn schedule_purge(&self, arena: &Arena, block_index: usize, blocks: usize) {
        let delay = self.options.effective_purge_delay();
        if delay < 0 || arena.memid.is_pinned {
            return;
        }
        if delay == 0 || self.is_preloading() {
            self.purge_now(arena, block_index, blocks);
            return;
        }

        arena.blocks_purge.set_n(block_index, blocks);
        let expire = arena.purge_expire.load(Ordering::Relaxed);
        if expire != 0 {
            // already armed: push the expiry out a little so nearby frees
            // batch into one pass
            arena.purge_expire.fetch_add(delay / 10, Ordering::AcqRel);
        } else {
            arena
                .purge_expire
                .store(self.mem.clock_now_ms() + delay, Ordering::Release);
        }
    }

    /// Decommit or reset a range and update the committed bitmap.
    ///
    /// The caller owns the range (its free bits are claimed), so nothing
    /// can be handed out from it concurrently.
    fn purge_now(&self, arena: &Arena, block_index: usize, blocks: usize) {
        debug_assert!(!arena.memid.is_pinned);
        let size = size_of_blocks(blocks);
        let p = arena.block_start(block_index);

        let needs_recommit = if arena.blocks_committed.is_set_n(block_index, blocks) {
            // fully committed: the source may choose reset or decommit
            self.os_purge(p, size, !self.options.purge_decommits)
        } else {
            // a partially committed range was freed and conservatively
            // marked uncommitted; resetting uncommitted memory is invalid,
            // so force a decommit
            debug_assert!(self.options.purge_decommits);
            let nr = self.os_purge(p, size, false);
            if nr {
                // the committed gauge already dropped when the free cleared
                // the range; offset the wrapper's decrement
                self.stats.committed_increase(size);
            }
            nr
        };

        arena.blocks_purge.clear_n(block_index, blocks);
        if needs_recommit {
            arena.blocks_committed.clear_n(block_index, blocks);
        }
    }

    /// Walk the registry and run expired per-arena purges. Only one thread
    /// purges at a time; the rest skip.
    fn try_purge_all(&self, force: bool, visit_all: bool) {
        if self.is_preloading() || self.options.effective_purge_delay() <= 0 {
            return;
        }
        let max_arena = self.arena_count.load(Ordering::Acquire);
        if max_arena == 0 {
            return;
        }
        if self
            .purge_guard
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        let now = self.mem.clock_now_ms();
        let mut max_purge_count = if visit_all { max_arena } else { 1 };
        for index in 0..max_arena {
            if let Some(arena) = self.arena_at(index) {
                if self.arena_try_purge(arena, now, force) {
                    if max_purge_count <= 1 {
                        break;
                    }
                    max_purge_count -= 1;
                }
            }
        }

        self.purge_guard.store(false, Ordering::Release);
    }

    /// Purge one arena's expired schedule. Returns whether anything was
    /// purged.
    fn arena_try_purge(&self, arena: &Arena, now: i64, force: bool) -> bool {
        if arena.memid.is_pinned {
            return false;
        }
        let expire = arena.purge_expire.load(Ordering::Relaxed);
        if expire == 0 {
            return false;
        }
        if !force && expire > now {
            return false;
        }
        // claim the schedule; if another thread got here first, skip
        if arena
            .purge_expire
            .compare_exchange(expire, 0, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }

        let mut any_purged = false;
        let mut full_purge = true;
        for fidx in 0..arena.field_count() {
            let purge = arena.blocks_purge.load_field(fidx);
            if purge == 0 {
                continue;
            }
            let mut bit = 0;
            while bit < BFIELD_BITS {
                // length of the scheduled run starting at `bit`
                let mut bitlen = 0;
                while bit + bitlen < BFIELD_BITS && (purge >> (bit + bitlen)) & 1 != 0 {
                    bitlen += 1;
                }
                if bitlen > 0 {
                    let idx = fidx * BFIELD_BITS + bit;
                    // transiently re-claim the free bits so no allocation
                    // can hand these blocks out mid-purge; shrink the range
                    // until the claim succeeds
                    let mut claimed = bitlen;
                    while claimed > 0 && !arena.blocks_free.try_clear_n(idx, claimed) {
                        claimed -= 1;
                    }
                    if claimed > 0 {
                        // re-read now that we own the range: adjacent claims
                        // may have unscheduled parts of it in the meantime
                        let purge_fresh = arena.blocks_purge.load_field_acquire(fidx);
                        if !self.purge_field_runs(arena, fidx, bit, claimed, purge_fresh) {
                            full_purge = false;
                        }
                        any_purged = true;
                        // make the blocks allocatable again
                        arena.blocks_free.set_n(idx, claimed);
                    }
                    if claimed < bitlen {
                        full_purge = false;
                    }
                }
                bit += bitlen + 1;
            }
        }

        // anything left over gets another chance after a fresh delay
        if !full_purge {
            let delay = self.options.effective_purge_delay();
            let _ = arena.purge_expire.compare_exchange(
                0,
                self.mem.clock_now_ms() + delay,
                Ordering::AcqRel,
                Ordering::Relaxed,
            );
        }
        any_purged
    }

    /// Purge every still-scheduled sub-run inside the claimed window
    /// `[bit, bit + len)` of field `fidx`. Returns whether one run covered
    /// the whole window.
    fn purge_field_runs(
        &self,
        arena: &Arena,
        fidx: usize,
        bit: usize,
        len: usize,
        purge: usize,
    ) -> bool {
        let end = bit + len;
        let mut all_purged = false;
        let mut b = bit;
        while b < end {
            let mut count = 0;
            while b + count < end && (purge >> (b + count)) & 1 != 0 {
                count += 1;
            }
            if count > 0 {
                self.purge_now(arena, fidx * BFIELD_BITS + b, count);
                if count == len {
                    all_purged = true;
                }
            }
            b += count + 1;
        }
        all_purged
    }

    // ------------------------------------------------------------------
    // Adding and reserving arenas
    // ------------------------------------------------------------------

    /// Initialize a descriptor at the base of `start` and publish it.
    fn manage_memory(
        &self,
        start: *mut u8,
        size: usize,
        is_large: bool,
        numa_node: Option<usize>,
        exclusive: bool,
        memid: MemId,
    ) -> Result<ArenaId, ArenaError> {
        debug_assert!(!is_large || (memid.initially_committed && memid.is_pinned));
        if start.is_null() || (start as usize) % BLOCK_SIZE != 0 {
            tracing::warn!(
                addr = ?UsizePtr::from(start),
                "cannot use OS memory since it is not aligned to {} KiB",
                BLOCK_SIZE / 1024
            );
            return Err(ArenaError::Unaligned);
        }

        let info_blocks = self.info_blocks();
        let block_count = size / BLOCK_SIZE; // divide down
        if block_count < info_blocks + 1 {
            tracing::warn!(
                size,
                "cannot use OS memory since it is not large enough"
            );
            return Err(ArenaError::TooSmall {
                min: size_of_blocks(info_blocks + 1),
            });
        }
        if block_count > BITMAP_MAX_BITS {
            tracing::warn!(size, "cannot use OS memory since it is too large");
            return Err(ArenaError::TooLarge {
                max: size_of_blocks(BITMAP_MAX_BITS),
            });
        }

        // the descriptor blocks must be committed and zeroed before we can
        // build in them
        let mut is_zero = memid.initially_zero;
        if !memid.initially_committed {
            match self.os_commit(start, size_of_blocks(info_blocks)) {
                Some(commit_zero) => {
                    if commit_zero {
                        is_zero = true;
                    }
                }
                None => return Err(ArenaError::OutOfMemory),
            }
        }
        if !is_zero {
            unsafe { ptr::write_bytes(start, 0, size_of_blocks(info_blocks)) };
        }

        let arena = start as *mut Arena;
        unsafe {
            Arena::init(
                arena, memid, block_count, info_blocks, numa_node, exclusive, is_large,
            );
            let a = &*arena;
            // mark the usable range free; descriptor blocks and the tail
            // past block_count stay clear so they are never claimable
            a.blocks_free
                .unsafe_xset_n(BitOp::Set, info_blocks, block_count - info_blocks);
            if memid.initially_committed {
                a.blocks_committed.unsafe_xset_n(BitOp::Set, 0, block_count);
            } else {
                a.blocks_committed.unsafe_xset_n(BitOp::Set, 0, info_blocks);
            }
            // the descriptor itself lives in the head blocks
            a.blocks_dirty.unsafe_xset_n(BitOp::Set, 0, info_blocks);
        }
        self.add_arena(arena)
    }

    /// Adopt a caller-supplied region as an arena
    pub fn manage_os_memory(
        &self,
        start: *mut u8,
        size: usize,
        is_committed: bool,
        is_large: bool,
        is_zero: bool,
        numa_node: Option<usize>,
    ) -> Result<ArenaId, ArenaError> {
        self.manage_os_memory_ex(start, size, is_committed, is_large, is_zero, numa_node, false)
    }

    /// As [manage_os_memory](Self::manage_os_memory), optionally exclusive
    #[allow(clippy::too_many_arguments)]
    pub fn manage_os_memory_ex(
        &self,
        start: *mut u8,
        size: usize,
        is_committed: bool,
        is_large: bool,
        is_zero: bool,
        numa_node: Option<usize>,
        exclusive: bool,
    ) -> Result<ArenaId, ArenaError> {
        let memid = MemId::external(is_committed, is_zero, is_large);
        self.manage_memory(start, size, is_large, numa_node, exclusive, memid)
    }

    /// Reserve a range of OS memory and adopt it as an arena
    pub fn reserve_os_memory(
        &self,
        size: usize,
        commit: bool,
        allow_large: bool,
    ) -> Result<ArenaId, ArenaError> {
        self.reserve_os_memory_ex(size, commit, allow_large, false)
    }

    /// As [reserve_os_memory](Self::reserve_os_memory), optionally exclusive
    pub fn reserve_os_memory_ex(
        &self,
        size: usize,
        commit: bool,
        allow_large: bool,
        exclusive: bool,
    ) -> Result<ArenaId, ArenaError> {
        let size = align_up(size, BLOCK_SIZE); // at least one block
        let os = self
            .mem
            .alloc_aligned(size, BLOCK_ALIGN, commit, allow_large)
            .ok_or(ArenaError::OutOfMemory)?;
        if os.is_committed {
            self.stats.committed_increase(os.size);
        }
        let is_large = os.is_pinned;
        let memid = MemId::os(os.is_committed, os.is_zero, os.is_pinned);
        match self.manage_memory(os.ptr, os.size, is_large, None, exclusive, memid) {
            Ok(id) => {
                tracing::debug!(
                    kib = os.size / 1024,
                    large = is_large,
                    "reserved arena memory"
                );
                Ok(id)
            }
            Err(_) => {
                self.os_free(os.ptr, os.size, if os.is_committed { os.size } else { 0 });
                tracing::warn!(kib = size / 1024, "failed to reserve arena memory");
                Err(ArenaError::OutOfMemory)
            }
        }
    }

    /// Reserve `pages` one-GiB huge pages on a NUMA node as a pinned arena
    pub fn reserve_huge_os_pages_at(
        &self,
        pages: usize,
        numa_node: Option<usize>,
        timeout_ms: usize,
    ) -> Result<ArenaId, ArenaError> {
        self.reserve_huge_os_pages_at_ex(pages, numa_node, timeout_ms, false)
    }

    /// As [reserve_huge_os_pages_at](Self::reserve_huge_os_pages_at),
    /// optionally exclusive
    pub fn reserve_huge_os_pages_at_ex(
        &self,
        pages: usize,
        numa_node: Option<usize>,
        timeout_ms: usize,
        exclusive: bool,
    ) -> Result<ArenaId, ArenaError> {
        if pages == 0 {
            return Err(ArenaError::TooSmall { min: 1 });
        }
        let numa_node = numa_node.map(|n| n % self.mem.numa_node_count().max(1));
        let Some(huge) = self.mem.alloc_huge_pages(pages, numa_node, timeout_ms) else {
            tracing::warn!(pages, "failed to reserve huge pages");
            return Err(ArenaError::OutOfMemory);
        };
        tracing::debug!(
            numa_node = ?numa_node,
            reserved = huge.pages,
            requested = pages,
            "reserved huge pages"
        );
        self.stats.committed_increase(huge.size);
        let memid = MemId {
            kind: MemKind::Os,
            initially_committed: true,
            initially_zero: huge.is_zero,
            is_pinned: true,
        };
        match self.manage_memory(huge.ptr, huge.size, true, numa_node, exclusive, memid) {
            Ok(id) => Ok(id),
            Err(_) => {
                self.os_free(huge.ptr, huge.size, huge.size);
                Err(ArenaError::OutOfMemory)
            }
        }
    }

    /// Reserve huge pages spread evenly over `numa_nodes` nodes (0 =
    /// however many the system reports), one pinned arena per node.
    pub fn reserve_huge_os_pages_interleave(
        &self,
        pages: usize,
        numa_nodes: usize,
        timeout_ms: usize,
    ) -> Result<(), ArenaError> {
        if pages == 0 {
            return Ok(());
        }
        let numa_count = if numa_nodes > 0 {
            numa_nodes
        } else {
            self.mem.numa_node_count()
        }
        .max(1);
        let pages_per = pages / numa_count;
        let pages_mod = pages % numa_count;
        let timeout_per = if timeout_ms == 0 {
            0
        } else {
            timeout_ms / numa_count + 50
        };

        let mut remaining = pages;
        for node in 0..numa_count {
            if remaining == 0 {
                break;
            }
            let mut node_pages = pages_per;
            if node < pages_mod {
                node_pages += 1;
            }
            if node_pages == 0 {
                continue;
            }
            self.reserve_huge_os_pages_at(node_pages, Some(node), timeout_per)?;
            remaining = remaining.saturating_sub(node_pages);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Base pointer and byte size of an arena's range
    pub fn arena_area(&self, arena_id: ArenaId) -> Option<(*mut u8, usize)> {
        let index = arena_id.index();
        if index >= MAX_ARENAS {
            return None;
        }
        let arena = self.arena_at(index)?;
        Some((arena.start(), arena.size()))
    }

    /// Does any arena contain `p`?
    pub fn contains(&self, p: *const u8) -> bool {
        let max_arena = self.arena_slot_count();
        for index in 0..max_arena {
            // relaxed is fine: we only compare address ranges
            let arena = self.arenas[index].load(Ordering::Relaxed);
            if let Some(arena) = unsafe { arena.as_ref() } {
                if arena.contains(p) {
                    return true;
                }
            }
        }
        false
    }

    /// Render each arena's bitmaps as lines of `x`/`.` plus totals
    pub fn debug_show_arenas(
        &self,
        show_inuse: bool,
        _show_abandoned: bool,
        show_purge: bool,
    ) -> String {
        let max_arenas = self.arena_slot_count();
        let mut out = String::new();
        let mut free_total = 0;
        let mut block_total = 0;
        let mut purge_total = 0;
        for index in 0..max_arenas {
            let Some(arena) = self.arena_at(index) else {
                break;
            };
            block_total += arena.block_count;
            let _ = writeln!(
                out,
                "arena {}: {} blocks of {} MiB{}",
                index,
                arena.block_count,
                BLOCK_SIZE / (1024 * 1024),
                if arena.memid.is_pinned { ", pinned" } else { "" }
            );
            if show_inuse {
                free_total += show_bitmap(&mut out, "free blocks", arena, &arena.blocks_free);
            }
            show_bitmap(&mut out, "committed blocks", arena, &arena.blocks_committed);
            if show_purge {
                purge_total += show_bitmap(&mut out, "purgeable blocks", arena, &arena.blocks_purge);
            }
        }
        if show_inuse {
            let _ = writeln!(out, "total inuse blocks    : {}", block_total - free_total);
        }
        if show_purge {
            let _ = writeln!(out, "total purgeable blocks: {}", purge_total);
        }
        out
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Release every OS-owned arena back to the OS.
    ///
    /// Safety: no allocation out of any arena may still be live, and no
    /// other thread may use the pool concurrently. Meant for unloadable
    /// libraries that must give everything back on exit.
    pub unsafe fn unsafe_destroy_all(&self) {
        let max_arena = self.arena_count.load(Ordering::Relaxed);
        let mut new_max_arena = 0;
        for index in 0..max_arena {
            let arena_ptr = self.arenas[index].load(Ordering::Acquire);
            if let Some(arena) = arena_ptr.as_ref() {
                if arena.memid.is_os_kind() {
                    // copy out what we need before the descriptor's own
                    // memory goes away
                    let start = arena.start();
                    let size = arena.size();
                    let committed = if arena.memid.initially_committed {
                        size
                    } else {
                        0
                    };
                    self.arenas[index].store(ptr::null_mut(), Ordering::Release);
                    self.os_free(start, size, committed);
                } else {
                    new_max_arena = index + 1;
                }
            }
        }
        let mut expected = max_arena;
        while expected > new_max_arena {
            match self.arena_count.compare_exchange(
                expected,
                new_max_arena,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(x) => expected = x,
            }
        }
        self.collect(true);
    }
}

/// One bitmap as rows of 64 `x`/`.` cells; returns how many bits are set
fn show_bitmap(out: &mut String, header: &str, arena: &Arena, bitmap: &Bitmap) -> usize {
    let _ = writeln!(out, "  {}:", header);
    let mut set_count = 0;
    let mut bit_count = 0;
    for fidx in 0..arena.field_count() {
        let field = bitmap.load_field(fidx);
        let mut row = String::with_capacity(BFIELD_BITS);
        for bit in 0..BFIELD_BITS {
            if bit_count < arena.block_count {
                let is_set = (field >> bit) & 1 != 0;
                if is_set {
                    set_count += 1;
                }
                row.push(if is_set { 'x' } else { '.' });
            } else {
                row.push(' ');
            }
            bit_count += 1;
        }
        let _ = writeln!(out, "    {}", row);
    }
    let _ = writeln!(out, "    total ('x'): {}", set_count);
    set_count
}
