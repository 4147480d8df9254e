//! Adaptive mutex.
//!
//! The owner word holds the current holder's identity plus a flag noting
//! that the turnstile is non-empty. Contended acquisition spins while the
//! holder is executing on some processor (it will likely release soon)
//! and otherwise blocks in the lock's turnstile. Release clears the
//! owner word with a single atomic swap and only touches the turnstile
//! when the flag rode along in the swapped-out word, so the uncontended
//! release path takes no lock at all.

use core::{
    cell::UnsafeCell,
    fmt,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::driver::{DriverRef, Tid};
use crate::sleep::Turnstile;
use crate::spin_lock::Backoff;

const UNOWNED: usize = 0;
const WAITERS: usize = 1;

fn owner_word(tid: Tid) -> usize {
    (tid.0 + 1) << 1
}

fn word_tid(word: usize) -> Option<Tid> {
    match word >> 1 {
        0 => None,
        n => Some(Tid(n - 1)),
    }
}

/// Exclusive-ownership adaptive lock.
pub struct Mutex<T> {
    driver: DriverRef,
    owner: AtomicUsize,
    turnstile: Turnstile,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for Mutex<T> {}
unsafe impl<T: Send> Send for Mutex<T> {}

pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
}

impl<T> Mutex<T> {
    pub fn new(driver: DriverRef, data: T) -> Self {
        Self {
            driver,
            owner: AtomicUsize::new(UNOWNED),
            turnstile: Turnstile::new(),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquire, blocking the calling thread until it holds the lock.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        let driver = &*self.driver;
        let me = driver.current();
        let new = owner_word(me);
        let mut backoff = Backoff::new();

        loop {
            let cur = self.owner.load(Ordering::Relaxed);
            if cur & !WAITERS == UNOWNED {
                // keep the waiters flag alive across the hand-off
                if self
                    .owner
                    .compare_exchange_weak(
                        cur,
                        new | (cur & WAITERS),
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    break;
                }
                continue;
            }

            let holder = match word_tid(cur) {
                Some(t) => t,
                None => continue,
            };
            if holder == me {
                crate::fatal(format_args!("mutex: {} locking against myself", me));
            }

            // A running holder releases soon: spin. The exception is a
            // holder stalled on the big kernel lock that we are the ones
            // holding; sleeping there would deadlock the pair of us.
            if driver.on_cpu(holder)
                && !(driver.holds_big_lock(me) && driver.wants_big_lock(holder))
            {
                backoff.spin("adaptive mutex");
                continue;
            }

            if self.sleep_on_turnstile(me) {
                // woken by release; re-compete for the owner word
                backoff = Backoff::new();
            }
        }

        MutexGuard { mutex: self }
    }

    /// One shot, never blocks.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        let me = self.driver.current();
        let new = owner_word(me);
        let cur = self.owner.load(Ordering::Relaxed);
        if word_tid(cur) == Some(me) {
            crate::fatal(format_args!("mutex: {} locking against myself", me));
        }
        if cur & !WAITERS != UNOWNED {
            return None;
        }
        self.owner
            .compare_exchange(cur, new | (cur & WAITERS), Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| MutexGuard { mutex: self })
    }

    /// Whether the calling thread owns the lock. For assertions.
    pub fn owned(&self) -> bool {
        word_tid(self.owner.load(Ordering::Relaxed)) == Some(self.driver.current())
    }

    /// Register in the turnstile and park. Returns true if the thread
    /// slept, false if the attempt was abandoned because the picture
    /// changed while the waiters flag was being set.
    fn sleep_on_turnstile(&self, me: Tid) -> bool {
        let driver = &*self.driver;
        let mut ts = self.turnstile.enter();

        let cur = self.owner.load(Ordering::Relaxed);
        if cur & !WAITERS == UNOWNED {
            return false; // released in the interim
        }
        if cur & WAITERS == 0
            && self
                .owner
                .compare_exchange(cur, cur | WAITERS, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
        {
            return false; // owner word moved; run the full sequence again
        }

        // The flag is visibly set. An unlocked, flagless release can no
        // longer slip past us, but the owner may have started running —
        // reconfirm before committing to sleep.
        let cur = self.owner.load(Ordering::Acquire);
        let holder = match word_tid(cur) {
            Some(t) => t,
            None => return false,
        };
        if driver.on_cpu(holder) {
            return false;
        }

        let waiter = ts.insert(driver, holder);
        drop(ts);

        log::debug!("mutex: {} blocking on holder {}", me, holder);
        waiter.park_until_woken(driver);
        true
    }

    fn unlock(&self) {
        let driver = &*self.driver;
        let me = driver.current();
        let cur = self.owner.load(Ordering::Relaxed);
        if word_tid(cur) != Some(me) {
            crate::fatal(format_args!("mutex: {} releasing a lock it does not own", me));
        }

        let prev = self.owner.swap(UNOWNED, Ordering::Release);
        if prev & WAITERS != 0 {
            let mut ts = self.turnstile.enter();
            let more = ts.wake_highest(driver);
            if more {
                // keep the flag up for the waiters we did not wake
                self.owner.fetch_or(WAITERS, Ordering::AcqRel);
            }
        }
    }
}

impl<T> Drop for Mutex<T> {
    fn drop(&mut self) {
        let word = self.owner.load(Ordering::Relaxed);
        if word != UNOWNED || self.turnstile.has_waiters() {
            crate::fatal(format_args!("mutex: destroyed while held or waited on"));
        }
    }
}

impl<T> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let word = self.owner.load(Ordering::Relaxed);
        f.debug_struct("Mutex")
            .field("owner", &word_tid(word))
            .field("waiters", &(word & WAITERS != 0))
            .finish_non_exhaustive()
    }
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}
