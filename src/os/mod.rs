//! The OS virtual-memory seam
//!
//! The arena layer never talks to the operating system directly; it goes
//! through a [MemSource]. This keeps reserve/commit/purge semantics in one
//! narrow interface, lets tests substitute a deterministic in-process
//! source, and confines the platform `unsafe` to one module.

#[cfg(test)]
pub(crate) mod mock;
#[cfg(unix)]
pub mod unix;

/// An aligned region handed out by a [MemSource]
#[derive(Clone, Copy, Debug)]
pub struct OsAlloc {
    pub ptr: *mut u8,
    /// Actual reserved size (at least the requested size)
    pub size: usize,
    /// The whole region is backed by accessible pages
    pub is_committed: bool,
    /// The whole region reads as zero
    pub is_zero: bool,
    /// Large/huge pages: commit state is fixed for the region's lifetime
    pub is_pinned: bool,
}

/// A huge-page reservation; `pages` may be less than requested
#[derive(Clone, Copy, Debug)]
pub struct HugeAlloc {
    pub ptr: *mut u8,
    pub size: usize,
    pub pages: usize,
    pub is_zero: bool,
}

/// Virtual-memory primitives the arena layer consumes
///
/// Commit and purge may block or perform syscalls; none of the other
/// operations may.
pub trait MemSource: Send + Sync {
    /// Reserve an `alignment`-aligned region of `size` bytes, committed up
    /// front iff `commit`. `allow_large` permits backing the region with
    /// large OS pages (which pins its commit state).
    fn alloc_aligned(&self, size: usize, alignment: usize, commit: bool, allow_large: bool)
        -> Option<OsAlloc>;

    /// As [alloc_aligned](MemSource::alloc_aligned) but the returned
    /// pointer is aligned at `align_offset` bytes *into* the region.
    /// Sources that cannot provide this decline by returning `None`.
    fn alloc_aligned_at_offset(
        &self,
        _size: usize,
        _alignment: usize,
        _align_offset: usize,
        _commit: bool,
        _allow_large: bool,
    ) -> Option<OsAlloc> {
        None
    }

    /// Reserve `pages` one-GiB huge pages, preferably on `numa_node`,
    /// giving up after `timeout_ms` milliseconds (0 = no timeout). Partial
    /// reservations are returned with `pages` reflecting what was obtained.
    fn alloc_huge_pages(
        &self,
        pages: usize,
        numa_node: Option<usize>,
        timeout_ms: usize,
    ) -> Option<HugeAlloc>;

    /// Back `[p, p + size)` with accessible pages. Returns `Some(is_zero)`
    /// on success where `is_zero` says the whole range now reads as zero.
    fn commit(&self, p: *mut u8, size: usize) -> Option<bool>;

    /// Return the physical pages of `[p, p + size)` to the OS while keeping
    /// the virtual reservation. With `allow_reset` the source may use a
    /// cheaper zero-hint that keeps the pages accessible. Returns `true`
    /// iff the pages were actually decommitted and need a commit before the
    /// next access.
    fn purge(&self, p: *mut u8, size: usize, allow_reset: bool) -> bool;

    /// Release a region previously obtained from this source
    fn free(&self, p: *mut u8, size: usize, was_committed: bool);

    fn page_size(&self) -> usize;

    /// Does the OS overcommit (commit never fails up front)?
    fn has_overcommit(&self) -> bool;

    /// Is reserving address space without backing it cheap?
    fn has_virtual_reserve(&self) -> bool;

    /// NUMA node the calling thread currently runs on, if known
    fn numa_node(&self) -> Option<usize>;

    fn numa_node_count(&self) -> usize;

    /// Monotonic milliseconds, used for purge expiry
    fn clock_now_ms(&self) -> i64;
}
