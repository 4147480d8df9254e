//! Spin-based locks.
//!
//! [`SpinMutex`] is the interrupt-safe flavor: it raises the processor's
//! interrupt priority to a per-lock ceiling before taking the lock and
//! never sleeps, so it is legal from interrupt context. [`RawSpinLock`]
//! is the bare `lock_api` raw mutex underneath, usable on its own for
//! short internal critical sections with no IPL requirement.
//!
//! Spin locks MUST NOT be held across anything that can sleep; use the
//! adaptive [`crate::blocking::Mutex`] there instead.

mod mutex;

pub use mutex::{KSpinLock, KSpinLockGuard, RawSpinLock, SpinMutex, SpinMutexGuard};

use core::hint;

use crate::config::{SPIN_BACKOFF_MAX, SPIN_BACKOFF_MIN, SPIN_SANITY_LIMIT};

/// Exponential backoff between CAS attempts, to take contended cache
/// lines off the bus. Debug builds abort once the total spin count makes
/// livelock the only plausible explanation.
pub(crate) struct Backoff {
    cur: u32,
    #[cfg(debug_assertions)]
    total: u64,
}

impl Backoff {
    pub(crate) fn new() -> Self {
        Self {
            cur: SPIN_BACKOFF_MIN,
            #[cfg(debug_assertions)]
            total: 0,
        }
    }

    pub(crate) fn spin(&mut self, what: &str) {
        for _ in 0..self.cur {
            hint::spin_loop();
        }
        self.cur = (self.cur * 2).min(SPIN_BACKOFF_MAX);

        #[cfg(debug_assertions)]
        {
            self.total += u64::from(self.cur);
            if self.total > SPIN_SANITY_LIMIT {
                crate::fatal(format_args!("spinout on {}", what));
            }
        }
        #[cfg(not(debug_assertions))]
        let _ = what;
    }
}
