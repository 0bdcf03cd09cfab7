//! Pool-wide counters
//!
//! Kept deliberately small: a committed-bytes gauge (commit increases it,
//! decommit decreases it) and a monotonic arena counter. Reporting layers
//! live elsewhere.

use std::sync::atomic::Ordering;

use crate::loom_testing::{AtomicI64, AtomicUsize};

pub struct Stats {
    committed: AtomicI64,
    arena_count: AtomicUsize,
}

impl Stats {
    pub(crate) fn new() -> Stats {
        Stats {
            committed: AtomicI64::new(0),
            arena_count: AtomicUsize::new(0),
        }
    }

    pub(crate) fn committed_increase(&self, bytes: usize) {
        self.committed.fetch_add(bytes as i64, Ordering::Relaxed);
    }

    pub(crate) fn committed_decrease(&self, bytes: usize) {
        self.committed.fetch_sub(bytes as i64, Ordering::Relaxed);
    }

    /// Bytes currently committed through this pool (may go briefly negative
    /// around a racing purge; callers must treat it as an estimate)
    pub fn committed_bytes(&self) -> i64 {
        self.committed.load(Ordering::Relaxed)
    }

    pub(crate) fn arena_count_increase(&self) {
        self.arena_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Total arenas ever added to the registry
    pub fn arena_count(&self) -> usize {
        self.arena_count.load(Ordering::Relaxed)
    }
}
