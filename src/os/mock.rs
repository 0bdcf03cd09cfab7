//! Deterministic in-process [MemSource] for tests
//!
//! Regions are backed by real (zeroed) heap memory so tests can read and
//! write through returned pointers. Commit state is tracked logically as
//! byte intervals; a decommit zero-fills the range, which models the
//! "pages come back zeroed" contract, and makes zeroing bugs observable. A
//! call log records every commit/purge/free for assertions.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Mutex;

use super::{HugeAlloc, MemSource, OsAlloc};

const TEST_PAGE_SIZE: usize = 4096;
/// Mock "huge pages" are deliberately small so tests stay cheap
pub(crate) const TEST_HUGE_PAGE_SIZE: usize = 8 * 1024 * 1024;

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum OsEvent {
    Alloc { p: usize, size: usize, commit: bool },
    HugeAlloc { p: usize, pages: usize, numa_node: Option<usize> },
    Commit { p: usize, size: usize },
    Reset { p: usize, size: usize },
    Decommit { p: usize, size: usize },
    Free { p: usize, size: usize },
}

#[derive(Default)]
struct Inner {
    /// base address -> layout, for dealloc
    regions: HashMap<usize, Layout>,
    /// committed byte intervals, disjoint and sorted
    committed: Vec<(usize, usize)>,
    events: Vec<OsEvent>,
}

impl Inner {
    fn mark_committed(&mut self, start: usize, end: usize) {
        let mut merged = vec![(start, end)];
        for &(s, e) in &self.committed {
            if e < start || s > end {
                merged.push((s, e));
            } else {
                merged[0].0 = merged[0].0.min(s);
                merged[0].1 = merged[0].1.max(e);
            }
        }
        merged.sort_unstable();
        self.committed = merged;
    }

    fn mark_uncommitted(&mut self, start: usize, end: usize) {
        let mut next = Vec::new();
        for &(s, e) in &self.committed {
            if e <= start || s >= end {
                next.push((s, e));
                continue;
            }
            if s < start {
                next.push((s, start));
            }
            if e > end {
                next.push((end, e));
            }
        }
        next.sort_unstable();
        self.committed = next;
    }

    fn is_committed(&self, start: usize, end: usize) -> bool {
        self.committed.iter().any(|&(s, e)| s <= start && end <= e)
    }

    fn any_committed(&self, start: usize, end: usize) -> bool {
        self.committed.iter().any(|&(s, e)| s < end && e > start)
    }
}

pub(crate) struct TestMem {
    inner: Mutex<Inner>,
    clock_ms: AtomicI64,
    numa: AtomicI64,
    numa_count: AtomicUsize,
    overcommit: AtomicBool,
    fail_commits: AtomicBool,
    huge_pages_available: AtomicUsize,
}

impl TestMem {
    pub(crate) fn new() -> TestMem {
        TestMem {
            inner: Mutex::new(Inner::default()),
            clock_ms: AtomicI64::new(1),
            numa: AtomicI64::new(-1),
            numa_count: AtomicUsize::new(1),
            overcommit: AtomicBool::new(true),
            fail_commits: AtomicBool::new(false),
            huge_pages_available: AtomicUsize::new(0),
        }
    }

    pub(crate) fn set_numa(&self, node: Option<usize>, count: usize) {
        self.numa
            .store(node.map_or(-1, |n| n as i64), Ordering::Relaxed);
        self.numa_count.store(count, Ordering::Relaxed);
    }

    pub(crate) fn set_overcommit(&self, v: bool) {
        self.overcommit.store(v, Ordering::Relaxed);
    }

    pub(crate) fn set_fail_commits(&self, v: bool) {
        self.fail_commits.store(v, Ordering::Relaxed);
    }

    pub(crate) fn set_huge_pages_available(&self, pages: usize) {
        self.huge_pages_available.store(pages, Ordering::Relaxed);
    }

    pub(crate) fn advance_clock(&self, ms: i64) {
        self.clock_ms.fetch_add(ms, Ordering::Relaxed);
    }

    pub(crate) fn events(&self) -> Vec<OsEvent> {
        self.inner.lock().unwrap().events.clone()
    }

    pub(crate) fn count_decommits(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, OsEvent::Decommit { .. }))
            .count()
    }

    pub(crate) fn range_is_committed(&self, p: *const u8, size: usize) -> bool {
        self.inner
            .lock()
            .unwrap()
            .is_committed(p as usize, p as usize + size)
    }

    fn alloc_backing(&self, size: usize, alignment: usize) -> Option<*mut u8> {
        let layout = Layout::from_size_align(size, alignment).ok()?;
        let p = unsafe { alloc_zeroed(layout) };
        if p.is_null() {
            return None;
        }
        self.inner.lock().unwrap().regions.insert(p as usize, layout);
        Some(p)
    }
}

impl Drop for TestMem {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap();
        for (&p, &layout) in inner.regions.iter() {
            unsafe { dealloc(p as *mut u8, layout) };
        }
    }
}

impl MemSource for TestMem {
    fn alloc_aligned(
        &self,
        size: usize,
        alignment: usize,
        commit: bool,
        _allow_large: bool,
    ) -> Option<OsAlloc> {
        let p = self.alloc_backing(size, alignment)?;
        let mut inner = self.inner.lock().unwrap();
        if commit {
            inner.mark_committed(p as usize, p as usize + size);
        }
        inner.events.push(OsEvent::Alloc {
            p: p as usize,
            size,
            commit,
        });
        Some(OsAlloc {
            ptr: p,
            size,
            is_committed: commit,
            is_zero: true,
            is_pinned: false,
        })
    }

    fn alloc_huge_pages(
        &self,
        pages: usize,
        numa_node: Option<usize>,
        _timeout_ms: usize,
    ) -> Option<HugeAlloc> {
        let available = self.huge_pages_available.load(Ordering::Relaxed);
        let got = pages.min(available);
        if got == 0 {
            return None;
        }
        self.huge_pages_available
            .fetch_sub(got, Ordering::Relaxed);
        let size = got * TEST_HUGE_PAGE_SIZE;
        let p = self.alloc_backing(size, TEST_HUGE_PAGE_SIZE)?;
        let mut inner = self.inner.lock().unwrap();
        inner.mark_committed(p as usize, p as usize + size);
        inner.events.push(OsEvent::HugeAlloc {
            p: p as usize,
            pages: got,
            numa_node,
        });
        Some(HugeAlloc {
            ptr: p,
            size,
            pages: got,
            is_zero: true,
        })
    }

    fn commit(&self, p: *mut u8, size: usize) -> Option<bool> {
        if self.fail_commits.load(Ordering::Relaxed) {
            return None;
        }
        let mut inner = self.inner.lock().unwrap();
        let start = p as usize;
        // fresh pages read as zero only if nothing in the range was already
        // committed (and possibly dirtied)
        let was_untouched = !inner.any_committed(start, start + size);
        inner.mark_committed(start, start + size);
        inner.events.push(OsEvent::Commit { p: start, size });
        Some(was_untouched)
    }

    fn purge(&self, p: *mut u8, size: usize, allow_reset: bool) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let start = p as usize;
        if allow_reset {
            // reset: contents may vanish but the pages stay accessible
            unsafe { std::ptr::write_bytes(p, 0, size) };
            inner.events.push(OsEvent::Reset { p: start, size });
            false
        } else {
            unsafe { std::ptr::write_bytes(p, 0, size) };
            inner.mark_uncommitted(start, start + size);
            inner.events.push(OsEvent::Decommit { p: start, size });
            true
        }
    }

    fn free(&self, p: *mut u8, size: usize, _was_committed: bool) {
        let mut inner = self.inner.lock().unwrap();
        inner.mark_uncommitted(p as usize, p as usize + size);
        inner.events.push(OsEvent::Free {
            p: p as usize,
            size,
        });
        if let Some(layout) = inner.regions.remove(&(p as usize)) {
            unsafe { dealloc(p, layout) };
        }
    }

    fn page_size(&self) -> usize {
        TEST_PAGE_SIZE
    }

    fn has_overcommit(&self) -> bool {
        self.overcommit.load(Ordering::Relaxed)
    }

    fn has_virtual_reserve(&self) -> bool {
        true
    }

    fn numa_node(&self) -> Option<usize> {
        let n = self.numa.load(Ordering::Relaxed);
        if n < 0 {
            None
        } else {
            Some(n as usize)
        }
    }

    fn numa_node_count(&self) -> usize {
        self.numa_count.load(Ordering::Relaxed)
    }

    fn clock_now_ms(&self) -> i64 {
        self.clock_ms.load(Ordering::Relaxed)
    }
}
