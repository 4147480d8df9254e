//! Per-processor select cluster.

use core::sync::atomic::{AtomicU64, Ordering};

use spin::{Mutex, MutexGuard};

use crate::sleep::WaitChannel;

/// Rendezvous state for every thread whose multiplexed wait runs on this
/// processor. The cluster lock serializes the decision to sleep against
/// deliveries and collision broadcasts; the collision generation counter
/// tells a would-be sleeper that something fired behind its back since
/// its scan started.
pub struct SelectCluster {
    id: usize,
    /// Collision generation. Bumped under the cluster lock whenever a
    /// collision broadcast targets this cluster.
    gen: AtomicU64,
    lock: Mutex<()>,
    pub(crate) chan: WaitChannel,
}

impl SelectCluster {
    pub(crate) fn new(id: usize) -> Self {
        Self {
            id,
            gen: AtomicU64::new(0),
            lock: Mutex::new(()),
            chan: WaitChannel::new("select"),
        }
    }

    /// Bit this cluster occupies in a selinfo collision mask.
    pub(crate) fn mask(&self) -> u64 {
        1 << self.id
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock()
    }

    /// Read the collision generation. Callers hold the cluster lock when
    /// the value participates in a sleep decision.
    pub(crate) fn generation(&self) -> u64 {
        self.gen.load(Ordering::Relaxed)
    }

    pub(crate) fn bump_generation(&self) {
        self.gen.fetch_add(1, Ordering::Relaxed);
    }
}
