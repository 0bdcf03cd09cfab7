//! Runtime tunables for the arena pool
//!
//! A plain struct rather than an option registry; the pool takes one of
//! these at construction and never mutates it.

/// Whether freshly reserved arenas are committed up front
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EagerCommit {
    /// Eager-commit only on systems that overcommit anyway
    Auto,
    Always,
    Never,
}

#[derive(Clone, Debug)]
pub struct Options {
    /// Base size in bytes of an eagerly reserved fresh arena; 0 disables
    /// fresh arena reservation entirely.
    pub arena_reserve: usize,
    pub eager_commit: EagerCommit,
    /// Purge delay in milliseconds before the multiplier: negative disables
    /// purging, zero purges synchronously at free time.
    pub purge_delay: i64,
    /// Multiplier applied to `purge_delay` for arena memory
    pub purge_mult: i64,
    /// Never satisfy allocations from an arena (unless one is named)
    pub disallow_arena_alloc: bool,
    /// Never fall back to direct OS allocation
    pub disallow_os_alloc: bool,
    /// Purge by decommitting rather than resetting
    pub purge_decommits: bool,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            arena_reserve: 1024 * 1024 * 1024,
            eager_commit: EagerCommit::Auto,
            purge_delay: 10,
            purge_mult: 10,
            disallow_arena_alloc: false,
            disallow_os_alloc: false,
            purge_decommits: true,
        }
    }
}

impl Options {
    /// The effective purge delay in milliseconds (delay times multiplier)
    pub(crate) fn effective_purge_delay(&self) -> i64 {
        self.purge_delay.saturating_mul(self.purge_mult)
    }
}
