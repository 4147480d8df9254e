//! Compile-time limits and runtime tunables.

use core::sync::atomic::{AtomicBool, Ordering};

pub const MAX_PROCESSORS: usize = 64;              // Collision masks are one u64 wide
pub const SPIN_BACKOFF_MIN: u32 = 4;               // Initial busy-wait iterations on CAS failure
pub const SPIN_BACKOFF_MAX: u32 = 4096;            // Backoff ceiling under heavy contention
pub const SPIN_SANITY_LIMIT: u64 = 100_000_000;    // Debug builds abort after this many spins
pub const DEFAULT_LOCKS_PER_OWNER: usize = 1024;   // Soft per-owner lock-record budget
pub const DEFAULT_DEADLOCK_DEPTH: usize = 50;      // Hop ceiling for blocked-owner chain walks

/// Runtime-settable knobs. One instance is handed to the subsystems that
/// consume it at bring-up; the select flag stays writable afterwards.
pub struct Tunables {
    /// Soft budget of outstanding lock records per owner; the hard
    /// budget, applied to requests that must split a record, is twice
    /// this value.
    pub max_locks_per_owner: usize,
    /// Maximum hops when chasing a blocked-owner chain before the search
    /// is conservatively declared a deadlock.
    pub deadlock_max_depth: usize,
    /// Deliver select events directly into the waiter's result set
    /// instead of forcing a full rescan. The rescan path is kept for
    /// compatibility and can be selected at runtime.
    pub direct_select: AtomicBool,
}

impl Tunables {
    pub fn new() -> Self {
        Self {
            max_locks_per_owner: DEFAULT_LOCKS_PER_OWNER,
            deadlock_max_depth: DEFAULT_DEADLOCK_DEPTH,
            direct_select: AtomicBool::new(true),
        }
    }

    pub fn direct_select(&self) -> bool {
        self.direct_select.load(Ordering::Relaxed)
    }
}

impl Default for Tunables {
    fn default() -> Self {
        Self::new()
    }
}
