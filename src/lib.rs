//! Shared memory arenas for large aligned block allocation
//!
//! `bedrock` reserves big ranges of OS address space up front (or adopts
//! ranges the embedder already owns, including pinned huge pages) and hands
//! out multi-megabyte aligned block runs from them. All arenas are shared
//! between threads and claimed through atomic bitmaps; commit, dirty and
//! purge state is tracked per block so that physical memory use follows
//! what is actually resident rather than what is reserved. It is the
//! coarse-grained layer a fine-grained heap allocator builds on.
//!
//! The interesting machinery lives in [bitmap] (the atomic claim protocol)
//! and [arena] (placement policy, commit bookkeeping and the lazy purge
//! scheduler); [os] is the narrow seam to the operating system.

pub mod arena;
pub mod bitmap;
mod loom_testing;
pub mod memid;
pub mod options;
pub mod os;
pub mod stats;
mod track;
pub mod util;

pub use arena::{
    Allocation, ArenaError, ArenaPool, BIN_COUNT, BLOCK_ALIGN, BLOCK_SIZE, MAX_ARENAS,
    MAX_OBJ_SIZE, MIN_OBJ_SIZE,
};
pub use memid::{ArenaId, MemId, MemKind};
pub use options::{EagerCommit, Options};
pub use os::{HugeAlloc, MemSource, OsAlloc};
#[cfg(unix)]
pub use os::unix::SysMem;
pub use stats::Stats;
