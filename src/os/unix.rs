//! Unix [MemSource] on `mmap`/`mprotect`/`madvise`
//!
//! Reservation maps `PROT_NONE` with `MAP_NORESERVE` so that address space
//! is cheap; commit flips ranges to read/write; decommit flips them back to
//! `PROT_NONE` and drops the pages with `MADV_DONTNEED`. Alignment beyond
//! the page size is produced by over-mapping and unmapping the slack.

use std::ptr;
use std::sync::OnceLock;
use std::time::Instant;

use super::{HugeAlloc, MemSource, OsAlloc};

#[cfg(target_os = "linux")]
const GIB: usize = 1 << 30;

pub struct SysMem;

fn start_instant() -> Instant {
    static START: OnceLock<Instant> = OnceLock::new();
    *START.get_or_init(Instant::now)
}

unsafe fn raw_mmap(
    hint: *mut libc::c_void,
    size: usize,
    prot: libc::c_int,
    flags: libc::c_int,
) -> Option<*mut u8> {
    let p = libc::mmap(hint, size, prot, flags, -1, 0);
    if p == libc::MAP_FAILED {
        None
    } else {
        Some(p as *mut u8)
    }
}

impl SysMem {
    fn prot_for(commit: bool) -> libc::c_int {
        if commit {
            libc::PROT_READ | libc::PROT_WRITE
        } else {
            libc::PROT_NONE
        }
    }

    /// Map `size` bytes at an address aligned to `alignment`, trimming the
    /// over-mapped slack so the returned region stands alone.
    unsafe fn mmap_aligned(size: usize, alignment: usize, commit: bool) -> Option<*mut u8> {
        let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;
        let prot = Self::prot_for(commit);
        if alignment <= Self::sys_page_size() {
            return raw_mmap(ptr::null_mut(), size, prot, flags);
        }
        let over = size + alignment;
        let raw = raw_mmap(ptr::null_mut(), over, prot, flags)?;
        let aligned = ((raw as usize + alignment - 1) / alignment) * alignment;
        let lead = aligned - raw as usize;
        if lead > 0 {
            libc::munmap(raw as *mut libc::c_void, lead);
        }
        let tail = over - lead - size;
        if tail > 0 {
            libc::munmap((aligned + size) as *mut libc::c_void, tail);
        }
        Some(aligned as *mut u8)
    }

    fn sys_page_size() -> usize {
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
    }

    #[cfg(target_os = "linux")]
    fn try_large_pages(size: usize, commit: bool) -> Option<*mut u8> {
        // 2 MiB transparent-huge-style mapping; only worth trying when the
        // size is a large-page multiple
        const LARGE_PAGE: usize = 2 * 1024 * 1024;
        if !commit || size % LARGE_PAGE != 0 {
            return None;
        }
        unsafe {
            raw_mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_HUGETLB,
            )
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn try_large_pages(_size: usize, _commit: bool) -> Option<*mut u8> {
        None
    }

    #[cfg(target_os = "linux")]
    fn bind_to_node(p: *mut u8, size: usize, node: usize) {
        // best effort: MPOL_PREFERRED with a single-node mask
        const MPOL_PREFERRED: libc::c_int = 1;
        if node >= usize::BITS as usize {
            return;
        }
        let nodemask: libc::c_ulong = 1 << node;
        unsafe {
            libc::syscall(
                libc::SYS_mbind,
                p as *mut libc::c_void,
                size,
                MPOL_PREFERRED,
                &nodemask as *const libc::c_ulong,
                (usize::BITS as usize + 1) as libc::c_ulong,
                0 as libc::c_uint,
            );
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn bind_to_node(_p: *mut u8, _size: usize, _node: usize) {}
}

impl MemSource for SysMem {
    fn alloc_aligned(
        &self,
        size: usize,
        alignment: usize,
        commit: bool,
        allow_large: bool,
    ) -> Option<OsAlloc> {
        if size == 0 {
            return None;
        }
        if allow_large {
            if let Some(p) = Self::try_large_pages(size, commit) {
                return Some(OsAlloc {
                    ptr: p,
                    size,
                    is_committed: true,
                    is_zero: true,
                    is_pinned: true,
                });
            }
        }
        let p = unsafe { Self::mmap_aligned(size, alignment, commit)? };
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
        timeout_ms: usize,
    ) -> Option<HugeAlloc> {
        if pages == 0 {
            return None;
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = (numa_node, timeout_ms);
            return None;
        }
        #[cfg(target_os = "linux")]
        {
            let total = pages * GIB;
            // placeholder reservation, then map huge pages into it one GiB
            // at a time so a timeout still yields a usable prefix
            let base = unsafe {
                raw_mmap(
                    ptr::null_mut(),
                    total,
                    libc::PROT_NONE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                )?
            };
            let deadline = start_instant().elapsed().as_millis() as usize + timeout_ms;
            const MAP_HUGE_1GB: libc::c_int = 30 << 26;
            let mut reserved = 0;
            while reserved < pages {
                let addr = (base as usize + reserved * GIB) as *mut libc::c_void;
                let got = unsafe {
                    raw_mmap(
                        addr,
                        GIB,
                        libc::PROT_READ | libc::PROT_WRITE,
                        libc::MAP_PRIVATE
                            | libc::MAP_ANONYMOUS
                            | libc::MAP_FIXED
                            | libc::MAP_HUGETLB
                            | MAP_HUGE_1GB,
                    )
                };
                match got {
                    Some(p) => {
                        if let Some(node) = numa_node {
                            Self::bind_to_node(p, GIB, node);
                        }
                        reserved += 1;
                    }
                    None => break,
                }
                if timeout_ms != 0 && start_instant().elapsed().as_millis() as usize > deadline {
                    break;
                }
            }
            if reserved == 0 {
                unsafe { libc::munmap(base as *mut libc::c_void, total) };
                return None;
            }
            if reserved < pages {
                unsafe {
                    libc::munmap(
                        (base as usize + reserved * GIB) as *mut libc::c_void,
                        total - reserved * GIB,
                    )
                };
            }
            return Some(HugeAlloc {
                ptr: base,
                size: reserved * GIB,
                pages: reserved,
                is_zero: true,
            });
        }
    }

    fn commit(&self, p: *mut u8, size: usize) -> Option<bool> {
        let rc = unsafe {
            libc::mprotect(
                p as *mut libc::c_void,
                size,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        if rc != 0 {
            return None;
        }
        // pages dropped by a decommit come back zero-filled on first touch
        Some(true)
    }

    fn purge(&self, p: *mut u8, size: usize, allow_reset: bool) -> bool {
        unsafe {
            if allow_reset {
                // zero-hint: pages stay accessible, contents may vanish
                #[cfg(target_os = "linux")]
                let advice = libc::MADV_FREE;
                #[cfg(not(target_os = "linux"))]
                let advice = libc::MADV_DONTNEED;
                libc::madvise(p as *mut libc::c_void, size, advice);
                false
            } else {
                libc::mprotect(p as *mut libc::c_void, size, libc::PROT_NONE);
                libc::madvise(p as *mut libc::c_void, size, libc::MADV_DONTNEED);
                true
            }
        }
    }

    fn free(&self, p: *mut u8, size: usize, _was_committed: bool) {
        unsafe {
            libc::munmap(p as *mut libc::c_void, size);
        }
    }

    fn page_size(&self) -> usize {
        Self::sys_page_size()
    }

    fn has_overcommit(&self) -> bool {
        #[cfg(target_os = "linux")]
        {
            match std::fs::read_to_string("/proc/sys/vm/overcommit_memory") {
                Ok(s) => matches!(s.trim(), "0" | "1"),
                Err(_) => false,
            }
        }
        #[cfg(not(target_os = "linux"))]
        {
            false
        }
    }

    fn has_virtual_reserve(&self) -> bool {
        true
    }

    fn numa_node(&self) -> Option<usize> {
        #[cfg(target_os = "linux")]
        {
            let mut cpu: libc::c_uint = 0;
            let mut node: libc::c_uint = 0;
            let rc = unsafe {
                libc::syscall(
                    libc::SYS_getcpu,
                    &mut cpu as *mut libc::c_uint,
                    &mut node as *mut libc::c_uint,
                    ptr::null_mut::<libc::c_void>(),
                )
            };
            if rc == 0 {
                Some(node as usize)
            } else {
                None
            }
        }
        #[cfg(not(target_os = "linux"))]
        {
            None
        }
    }

    fn numa_node_count(&self) -> usize {
        #[cfg(target_os = "linux")]
        {
            static COUNT: OnceLock<usize> = OnceLock::new();
            *COUNT.get_or_init(|| {
                let mut count = 0;
                while std::path::Path::new(&format!("/sys/devices/system/node/node{}", count))
                    .exists()
                {
                    count += 1;
                }
                count.max(1)
            })
        }
        #[cfg(not(target_os = "linux"))]
        {
            1
        }
    }

    fn clock_now_ms(&self) -> i64 {
        start_instant().elapsed().as_millis() as i64
    }
}
