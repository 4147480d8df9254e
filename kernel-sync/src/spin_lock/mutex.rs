//! Spin mutex with an interrupt-priority ceiling.

use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use lock_api::{GuardSend, RawMutex};

use crate::driver::DriverRef;
use crate::ipl::Ipl;
use crate::processor::Processor;
use crate::spin_lock::Backoff;

/// Raw spinlock: one CAS on the fast path, exponential backoff on the
/// slow path. No IPL handling; see [`SpinMutex`] for the ceiling-raising
/// flavor.
pub struct RawSpinLock {
    locked: AtomicBool,
}

unsafe impl RawMutex for RawSpinLock {
    const INIT: RawSpinLock = RawSpinLock {
        locked: AtomicBool::new(false),
    };

    type GuardMarker = GuardSend;

    fn lock(&self) {
        if self.try_lock() {
            return;
        }
        let mut backoff = Backoff::new();
        loop {
            backoff.spin("raw spinlock");
            if self.try_lock() {
                return;
            }
        }
    }

    fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    unsafe fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

/// Plain spin-protected cell for internal tables.
pub type KSpinLock<T> = lock_api::Mutex<RawSpinLock, T>;
pub type KSpinLockGuard<'a, T> = lock_api::MutexGuard<'a, RawSpinLock, T>;

const NO_HOLDER: usize = usize::MAX;

/// Interrupt-safe mutual exclusion.
///
/// Acquisition raises the calling processor's interrupt priority to the
/// lock's ceiling, then takes a plain spinlock. Release restores the
/// priority through the processor's nesting counter, so nested critical
/// sections put back the correct outermost level.
///
/// Never blocks the caller; never legal to hold across a sleep.
pub struct SpinMutex<T> {
    driver: DriverRef,
    ceiling: Ipl,
    locked: AtomicBool,
    /// Holder identity for re-entry diagnostics.
    holder: AtomicUsize,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for SpinMutex<T> {}
unsafe impl<T: Send> Send for SpinMutex<T> {}

pub struct SpinMutexGuard<'a, T> {
    mutex: &'a SpinMutex<T>,
    proc: &'a Processor,
}

impl<T> SpinMutex<T> {
    pub fn new(driver: DriverRef, ceiling: Ipl, data: T) -> Self {
        Self {
            driver,
            ceiling,
            locked: AtomicBool::new(false),
            holder: AtomicUsize::new(NO_HOLDER),
            data: UnsafeCell::new(data),
        }
    }

    pub fn ceiling(&self) -> Ipl {
        self.ceiling
    }

    /// Acquire, spinning with backoff until the lock is free.
    pub fn lock<'a>(&'a self, proc: &'a Processor) -> SpinMutexGuard<'a, T> {
        proc.spl_enter(&*self.driver, self.ceiling);
        self.check_recursion();

        if !self.try_cas() {
            let mut backoff = Backoff::new();
            loop {
                backoff.spin("spin mutex");
                if self.try_cas() {
                    break;
                }
            }
        }

        self.holder
            .store(self.driver.current().0, Ordering::Relaxed);
        SpinMutexGuard { mutex: self, proc }
    }

    /// Single attempt; restores the interrupt priority on failure.
    pub fn try_lock<'a>(&'a self, proc: &'a Processor) -> Option<SpinMutexGuard<'a, T>> {
        proc.spl_enter(&*self.driver, self.ceiling);
        self.check_recursion();
        if self.try_cas() {
            self.holder
                .store(self.driver.current().0, Ordering::Relaxed);
            Some(SpinMutexGuard { mutex: self, proc })
        } else {
            proc.spl_exit(&*self.driver);
            None
        }
    }

    /// Whether the calling thread holds the lock. For assertions.
    pub fn owned(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
            && self.holder.load(Ordering::Relaxed) == self.driver.current().0
    }

    fn try_cas(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn check_recursion(&self) {
        if self.owned() {
            crate::fatal(format_args!(
                "spin mutex: {} locking against myself",
                self.driver.current()
            ));
        }
    }
}

impl<T> Drop for SpinMutex<T> {
    fn drop(&mut self) {
        if self.locked.load(Ordering::Relaxed) {
            crate::fatal(format_args!("spin mutex: destroyed while held"));
        }
    }
}

impl<T> Deref for SpinMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for SpinMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for SpinMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.holder.store(NO_HOLDER, Ordering::Relaxed);
        self.mutex.locked.store(false, Ordering::Release);
        self.proc.spl_exit(&*self.mutex.driver);
    }
}
