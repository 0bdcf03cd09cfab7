//! Hooks for external memory trackers (valgrind and friends)
//!
//! Compiled to nothing by default; kept as a seam so a tracking build can
//! annotate ranges without touching the allocation paths.

#[inline(always)]
pub(crate) fn mem_undefined(_p: *mut u8, _size: usize) {}

#[inline(always)]
pub(crate) fn mem_noaccess(_p: *mut u8, _size: usize) {}
